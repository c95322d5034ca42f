//! Codec module - serde values inside call arguments.
//!
//! Fixed-layout arguments go through [`Buffer`](crate::buffer::Buffer)'s own
//! encodings. Anything that only implements serde can ride along as a
//! [`Packed`] argument: MessagePack bytes behind a `u32` length prefix.
//!
//! # Example
//!
//! ```
//! use voxel_rmi::buffer::Buffer;
//! use voxel_rmi::codec::Packed;
//!
//! let mut buf = Buffer::new();
//! buf.write(&Packed(vec![("a".to_string(), 1u32)])).unwrap();
//!
//! let Packed(decoded): Packed<Vec<(String, u32)>> = buf.read().unwrap();
//! assert_eq!(decoded, vec![("a".to_string(), 1)]);
//! ```

mod msgpack;

pub use msgpack::{MsgPackCodec, Packed};
