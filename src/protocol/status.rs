//! Outcome codes carried in the first byte of every `Result` frame.

use crate::buffer::{Buffer, Decode, Encode};
use crate::error::Result;

/// Outcome of a remote operation.
///
/// Sent as a single byte at the start of a result payload and kept by
/// proxies as their last-operation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Status {
    #[default]
    Success = 0,
    /// Generic failure raised by the remote implementation.
    Failed = 1,
    /// No response within the call bound.
    Timeout = 2,
    /// The Pipe closed while the call was outstanding.
    ConnectionLost = 3,
    /// Resolve/connect failure.
    TransportError = 4,
    /// Malformed frame or version mismatch.
    ProtocolError = 5,
    /// Arguments could not be encoded or decoded.
    SerializationError = 6,
    /// The target object is not registered on the remote side.
    UnknownObject = 7,
    /// The target object has no method with that name.
    UnknownMethod = 8,
    /// No factory for the requested class.
    UnknownClass = 9,
    /// Backing-store read failed.
    ReadFailed = 10,
    /// Proxy is not bound to a remote object.
    NotBound = 11,
}

impl Status {
    #[inline]
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Map a wire byte back to a status; unknown codes become `ProtocolError`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Success,
            1 => Status::Failed,
            2 => Status::Timeout,
            3 => Status::ConnectionLost,
            4 => Status::TransportError,
            5 => Status::ProtocolError,
            6 => Status::SerializationError,
            7 => Status::UnknownObject,
            8 => Status::UnknownMethod,
            9 => Status::UnknownClass,
            10 => Status::ReadFailed,
            11 => Status::NotBound,
            _ => Status::ProtocolError,
        }
    }
}

impl Encode for Status {
    fn encode(&self, buf: &mut Buffer) -> Result<()> {
        (*self as u8).encode(buf)
    }
}

impl Decode for Status {
    fn decode(buf: &mut Buffer) -> Result<Self> {
        Ok(Status::from_u8(u8::decode(buf)?))
    }
}
