//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map) so a peer built
//! against a newer struct layout can still pick out the fields it knows.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::buffer::{Buffer, Decode, Encode};
use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// A serde value carried through a [`Buffer`] as length-prefixed MsgPack.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packed<T>(pub T);

impl<T: Serialize> Encode for Packed<T> {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        let bytes = MsgPackCodec::encode(&self.0)?;
        buf.write_len(bytes.len())?;
        buf.write_raw(&bytes);
        Ok(())
    }
}

impl<T: DeserializeOwned> Decode for Packed<T> {
    fn decode(buf: &mut Buffer) -> Result<Self> {
        let len = buf.read_len()?;
        Ok(Packed(MsgPackCodec::decode(buf.read_raw(len)?)?))
    }
}
