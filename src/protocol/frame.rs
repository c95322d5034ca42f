//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use voxel_rmi::protocol::{Frame, MessageType};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(MessageType::Result, 42, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.request_id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, MessageType, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Validated message type.
    pub message_type: MessageType,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame of the current protocol version.
    pub fn new(message_type: MessageType, request_id: u32, payload: Bytes) -> Self {
        Self {
            header: Header::new(message_type, request_id, payload.len() as u32),
            message_type,
            payload,
        }
    }

    /// Assemble a frame from an already validated header.
    pub(crate) fn from_header(header: Header, message_type: MessageType, payload: Bytes) -> Self {
        Self {
            header,
            message_type,
            payload,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the request ID.
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.header.request_id
    }

    /// Protocol version the sender used.
    #[inline]
    pub fn version(&self) -> u16 {
        self.header.version
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_frame(&self.header, &self.payload)
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes header and appends payload into a contiguous buffer.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
