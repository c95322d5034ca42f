//! Error types for voxel-rmi.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::Status;

/// Main error type for all transport, invocation and cache operations.
#[derive(Debug, Error)]
pub enum RmiError {
    /// I/O error during socket or backing-store operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect/resolve failure or other transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Pipe closed or socket failed while a call was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// Malformed envelope or payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer speaks a protocol version we cannot talk to.
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },

    /// Envelope carried a message type byte we do not know.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// No response within the configured bound.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Read past the write cursor of a buffer.
    #[error("Buffer underflow: needed {needed} bytes, {available} available")]
    BufferUnderflow { needed: usize, available: usize },

    /// Value too large for its length prefix.
    #[error("Buffer overflow: length {0} does not fit the length prefix")]
    BufferOverflow(usize),

    /// Short or failed backing-store read.
    #[error("Cache read failed at offset {offset}: {reason}")]
    CacheRead { offset: u64, reason: String },

    /// Remote side reported a non-success status.
    #[error("Remote call failed: {0:?}")]
    Remote(Status),

    /// JSON error (handshake only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl RmiError {
    /// Status code reported to callers and sent over the wire for this error.
    pub fn status(&self) -> Status {
        match self {
            RmiError::Io(_) | RmiError::Transport(_) => Status::TransportError,
            RmiError::ConnectionLost => Status::ConnectionLost,
            RmiError::Protocol(_)
            | RmiError::VersionMismatch { .. }
            | RmiError::UnknownMessageType(_) => Status::ProtocolError,
            RmiError::Timeout(_) => Status::Timeout,
            RmiError::BufferUnderflow { .. }
            | RmiError::BufferOverflow(_)
            | RmiError::Json(_)
            | RmiError::MsgPackEncode(_)
            | RmiError::MsgPackDecode(_) => Status::SerializationError,
            RmiError::CacheRead { .. } => Status::ReadFailed,
            RmiError::Remote(status) => *status,
        }
    }

    /// Whether reconnecting the endpoint could make a retry succeed.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            RmiError::Io(_) | RmiError::Transport(_) | RmiError::ConnectionLost
        ) || matches!(self, RmiError::Remote(Status::ConnectionLost))
    }
}

/// Result type alias using RmiError.
pub type Result<T> = std::result::Result<T, RmiError>;
