//! Growable byte buffer with ordered typed read/write.
//!
//! Values are appended at the write cursor and consumed from an independent
//! read cursor in strict FIFO order. The read cursor never passes the write
//! cursor: a read that would do so fails with
//! [`RmiError::BufferUnderflow`] and consumes nothing.
//!
//! # Encodings
//!
//! All multi-byte integers are Big Endian.
//!
//! | Type                     | Encoding                              |
//! |--------------------------|---------------------------------------|
//! | `u8..u64`, `i8..i64`     | fixed width                           |
//! | `bool`                   | 1 byte, 0 or 1                        |
//! | `f32`, `f64`             | IEEE-754 bits, fixed width            |
//! | [`Guid`]                 | 16 bytes, high half then low half     |
//! | `String`, `&str`         | `u32` byte count, then UTF-8 bytes    |
//! | [`Bytes`]                | `u32` byte count, then raw bytes      |
//! | `Vec<T>`                 | `u32` element count, then elements    |
//! | `Option<T>`              | 1 tag byte, then the value if present |
//!
//! # Example
//!
//! ```
//! use voxel_rmi::buffer::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.write(&42u32).unwrap().write("points").unwrap();
//!
//! assert_eq!(buf.read::<u32>().unwrap(), 42);
//! assert_eq!(buf.read::<String>().unwrap(), "points");
//! assert!(buf.read::<u8>().is_err());
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RmiError, Result};
use crate::guid::{Guid, GUID_SIZE};

/// Default initial capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Byte store with independent write and read cursors.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    /// Written bytes; `data.len()` is the write cursor.
    data: BytesMut,
    /// Read cursor, always `<= data.len()`.
    read_pos: usize,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Wrap received bytes for reading.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            read_pos: 0,
        }
    }

    /// Append a typed value.
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> Result<&mut Self> {
        value.encode(self)?;
        Ok(self)
    }

    /// Consume a typed value.
    pub fn read<T: Decode>(&mut self) -> Result<T> {
        let start = self.read_pos;
        T::decode(self).inspect_err(|_| {
            // Partial reads of compound values must not move the cursor.
            self.read_pos = start;
        })
    }

    /// Append raw bytes with no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Consume exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<&[u8]> {
        self.ensure(len)?;
        let start = self.read_pos;
        self.read_pos += len;
        Ok(&self.data[start..self.read_pos])
    }

    /// Consume every unread byte.
    pub fn read_remaining(&mut self) -> &[u8] {
        let start = self.read_pos;
        self.read_pos = self.data.len();
        &self.data[start..]
    }

    /// Write a `u32` length prefix, failing if `len` does not fit.
    pub fn write_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| RmiError::BufferOverflow(len))?;
        self.data.put_u32(len);
        Ok(())
    }

    /// Read a `u32` length prefix.
    pub fn read_len(&mut self) -> Result<usize> {
        Ok(u32::decode(self)? as usize)
    }

    /// Bytes written so far (the write cursor).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current read cursor.
    #[inline]
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Bytes left between the read and write cursors.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Move the read cursor back to the start.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    /// Drop all contents and reset both cursors.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// All written bytes, regardless of the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Freeze the written bytes for sending.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let available = self.remaining();
        if needed > available {
            return Err(RmiError::BufferUnderflow { needed, available });
        }
        Ok(())
    }
}

/// A value that can be appended to a [`Buffer`].
pub trait Encode {
    /// Append `self` at the write cursor.
    fn encode(&self, buf: &mut Buffer) -> Result<()>;
}

/// A value that can be consumed from a [`Buffer`].
pub trait Decode: Sized {
    /// Consume a value at the read cursor.
    fn decode(buf: &mut Buffer) -> Result<Self>;
}

macro_rules! impl_fixed_width {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            #[inline]
            fn encode(&self, buf: &mut Buffer) -> Result<()> {
                buf.write_raw(&self.to_be_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode(buf: &mut Buffer) -> Result<Self> {
                const N: usize = std::mem::size_of::<$ty>();
                let mut bytes = [0u8; N];
                bytes.copy_from_slice(buf.read_raw(N)?);
                Ok(<$ty>::from_be_bytes(bytes))
            }
        }
    )*};
}

impl_fixed_width!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Encode for bool {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        (*self as u8).encode(buf)
    }
}

impl Decode for bool {
    fn decode(buf: &mut Buffer) -> Result<Self> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RmiError::Protocol(format!("Invalid bool byte: {}", other))),
        }
    }
}

impl Encode for Guid {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        buf.write_raw(&self.to_bytes());
        Ok(())
    }
}

impl Decode for Guid {
    fn decode(buf: &mut Buffer) -> Result<Self> {
        let mut bytes = [0u8; GUID_SIZE];
        bytes.copy_from_slice(buf.read_raw(GUID_SIZE)?);
        Ok(Guid::from_bytes(&bytes))
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        buf.write_len(self.len())?;
        buf.write_raw(self.as_bytes());
        Ok(())
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        self.as_str().encode(buf)
    }
}

impl Decode for String {
    fn decode(buf: &mut Buffer) -> Result<Self> {
        let len = buf.read_len()?;
        let bytes = buf.read_raw(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| RmiError::Protocol(format!("Invalid UTF-8 string: {}", e)))
    }
}

impl Encode for Bytes {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        buf.write_len(self.len())?;
        buf.write_raw(self);
        Ok(())
    }
}

impl Decode for Bytes {
    fn decode(buf: &mut Buffer) -> Result<Self> {
        let len = buf.read_len()?;
        Ok(Bytes::copy_from_slice(buf.read_raw(len)?))
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        self.as_slice().encode(buf)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        buf.write_len(self.len())?;
        for item in self {
            item.encode(buf)?;
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(buf: &mut Buffer) -> Result<Self> {
        let count = buf.read_len()?;
        // Every element is at least one byte; don't trust the count blindly.
        let mut items = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        match self {
            Some(value) => {
                true.encode(buf)?;
                value.encode(buf)
            }
            None => false.encode(buf),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(buf: &mut Buffer) -> Result<Self> {
        if bool::decode(buf)? {
            Ok(Some(T::decode(buf)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        (**self).encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_across_types() {
        let id = Guid::generate();
        let mut buf = Buffer::new();
        buf.write(&7u8)
            .unwrap()
            .write(&-3i16)
            .unwrap()
            .write(&0xDEADBEEFu32)
            .unwrap()
            .write(&u64::MAX)
            .unwrap()
            .write(&1.5f32)
            .unwrap()
            .write(&-2.25f64)
            .unwrap()
            .write(&true)
            .unwrap()
            .write(&id)
            .unwrap()
            .write("voxel")
            .unwrap()
            .write(&vec![1u32, 2, 3])
            .unwrap()
            .write(&Some(9i64))
            .unwrap()
            .write(&None::<u8>)
            .unwrap();

        assert_eq!(buf.read::<u8>().unwrap(), 7);
        assert_eq!(buf.read::<i16>().unwrap(), -3);
        assert_eq!(buf.read::<u32>().unwrap(), 0xDEADBEEF);
        assert_eq!(buf.read::<u64>().unwrap(), u64::MAX);
        assert_eq!(buf.read::<f32>().unwrap(), 1.5);
        assert_eq!(buf.read::<f64>().unwrap(), -2.25);
        assert!(buf.read::<bool>().unwrap());
        assert_eq!(buf.read::<Guid>().unwrap(), id);
        assert_eq!(buf.read::<String>().unwrap(), "voxel");
        assert_eq!(buf.read::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(buf.read::<Option<i64>>().unwrap(), Some(9));
        assert_eq!(buf.read::<Option<u8>>().unwrap(), None);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_read_past_write_cursor_underflows() {
        let mut buf = Buffer::new();
        buf.write(&1u16).unwrap();

        let err = buf.read::<u32>().unwrap_err();
        assert!(matches!(
            err,
            RmiError::BufferUnderflow {
                needed: 4,
                available: 2
            }
        ));
        // Nothing consumed; the u16 is still there.
        assert_eq!(buf.read_pos(), 0);
        assert_eq!(buf.read::<u16>().unwrap(), 1);
        assert!(matches!(
            buf.read::<u8>(),
            Err(RmiError::BufferUnderflow { .. })
        ));
    }

    #[test]
    fn test_truncated_string_leaves_cursor_unchanged() {
        let mut buf = Buffer::new();
        buf.write_len(10).unwrap();
        buf.write_raw(b"abc");

        assert!(matches!(
            buf.read::<String>(),
            Err(RmiError::BufferUnderflow { .. })
        ));
        assert_eq!(buf.read_pos(), 0);
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let mut buf = Buffer::new();
        buf.write("hi").unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_guid_is_fixed_width() {
        let mut buf = Buffer::new();
        buf.write(&Guid::from_parts(1, 2)).unwrap();
        assert_eq!(buf.len(), GUID_SIZE);
    }

    #[test]
    fn test_growth_is_transparent() {
        let mut buf = Buffer::with_capacity(4);
        let blob = Bytes::from(vec![0xAB; 100_000]);
        buf.write(&blob).unwrap();
        assert_eq!(buf.len(), 100_004);
        assert_eq!(buf.read::<Bytes>().unwrap(), blob);
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let mut buf = Buffer::from_bytes(&[2]);
        assert!(buf.read::<bool>().is_err());
    }

    #[test]
    fn test_rewind_and_clear() {
        let mut buf = Buffer::new();
        buf.write(&5u32).unwrap();
        assert_eq!(buf.read::<u32>().unwrap(), 5);
        buf.rewind();
        assert_eq!(buf.read::<u32>().unwrap(), 5);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.read_pos(), 0);
    }

    #[test]
    fn test_read_remaining() {
        let mut buf = Buffer::from_bytes(b"\x00\x01rest");
        assert_eq!(buf.read::<u16>().unwrap(), 1);
        assert_eq!(buf.read_remaining(), b"rest");
        assert_eq!(buf.remaining(), 0);
    }
}
