//! 128-bit globally unique identifiers.
//!
//! A [`Guid`] is stored as two 64-bit halves. The all-zero value is the
//! explicit null and is never produced by [`Guid::generate`].
//!
//! Wire form is the high half then the low half, each a big-endian `u64`
//! (16 bytes total). String form is 32 lowercase hex digits.
//!
//! # Example
//!
//! ```
//! use voxel_rmi::Guid;
//!
//! let id = Guid::generate();
//! assert!(id.is_valid());
//!
//! let parsed: Guid = id.to_string().parse().unwrap();
//! assert_eq!(parsed, id);
//! ```

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::RmiError;

/// Encoded size in bytes.
pub const GUID_SIZE: usize = 16;

/// Globally unique identifier, immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Guid {
    high: u64,
    low: u64,
}

impl Guid {
    /// The null identifier.
    pub const NULL: Guid = Guid { high: 0, low: 0 };

    /// Generate a new random identifier.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let (high, low) = Uuid::new_v4().as_u64_pair();
            let id = Self { high, low };
            // v4 sets version bits, so this never spins in practice
            if id.is_valid() {
                return id;
            }
        }
    }

    /// Build from explicit halves.
    pub const fn from_parts(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// High 64 bits.
    #[inline]
    pub fn high(&self) -> u64 {
        self.high
    }

    /// Low 64 bits.
    #[inline]
    pub fn low(&self) -> u64 {
        self.low
    }

    /// `false` only for the null identifier.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.high != 0 || self.low != 0
    }

    /// Encode into the fixed-width wire form.
    pub fn to_bytes(&self) -> [u8; GUID_SIZE] {
        let mut buf = [0u8; GUID_SIZE];
        buf[..8].copy_from_slice(&self.high.to_be_bytes());
        buf[8..].copy_from_slice(&self.low.to_be_bytes());
        buf
    }

    /// Decode from the fixed-width wire form.
    pub fn from_bytes(buf: &[u8; GUID_SIZE]) -> Self {
        let mut high = [0u8; 8];
        let mut low = [0u8; 8];
        high.copy_from_slice(&buf[..8]);
        low.copy_from_slice(&buf[8..]);
        Self {
            high: u64::from_be_bytes(high),
            low: u64::from_be_bytes(low),
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

impl FromStr for Guid {
    type Err = RmiError;

    /// Accepts 32 hex digits, optionally grouped with dashes (UUID form).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RmiError::Protocol(format!("Invalid guid string: {}", s)));
        }
        let parse = |part: &str| {
            u64::from_str_radix(part, 16)
                .map_err(|_| RmiError::Protocol(format!("Invalid guid string: {}", s)))
        };
        Ok(Self {
            high: parse(&hex[..16])?,
            low: parse(&hex[16..])?,
        })
    }
}

impl From<Uuid> for Guid {
    fn from(uuid: Uuid) -> Self {
        let (high, low) = uuid.as_u64_pair();
        Self { high, low }
    }
}
