//! Wire format encoding and decoding.
//!
//! Implements the 11-byte envelope header:
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ Version  │ Msg Type │ Req ID   │ Length   │
//! │ 2 bytes  │ 1 byte   │ 4 bytes  │ 4 bytes  │
//! │ uint16 BE│          │ uint32 BE│ uint32 BE│
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The request id correlates a `Result` frame with the `Call` frame that
//! caused it. It is 0 for frames that are not part of a call.
//!
//! All multi-byte integers are Big Endian.

use crate::error::{RmiError, Result};

/// Header size in bytes (fixed, exactly 11).
pub const HEADER_SIZE: usize = 11;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Oldest protocol version we still accept during handshake.
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Request id used by frames outside a call exchange.
pub const NO_REQUEST: u32 = 0;

/// Kind of frame carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Connection opener carrying the initiator's identity.
    Handshake = 1,
    /// Reply to `Handshake` carrying the acceptor's identity.
    HandshakeAck = 2,
    /// Remote method invocation.
    Call = 3,
    /// Response to a `Call`, matched by request id.
    Result = 4,
    /// Unsolicited one-way message.
    Notify = 5,
    /// Graceful close; no more frames follow.
    Close = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = RmiError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Handshake),
            2 => Ok(MessageType::HandshakeAck),
            3 => Ok(MessageType::Call),
            4 => Ok(MessageType::Result),
            5 => Ok(MessageType::Notify),
            6 => Ok(MessageType::Close),
            other => Err(RmiError::UnknownMessageType(other)),
        }
    }
}

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version of the sender.
    pub version: u16,
    /// Raw message type byte (see [`MessageType`]).
    pub message_type: u8,
    /// Call correlation id (0 = not part of a call).
    pub request_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a header for the current protocol version.
    pub fn new(message_type: MessageType, request_id: u32, payload_length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type: message_type as u8,
            request_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use voxel_rmi::protocol::{Header, MessageType, HEADER_SIZE};
    ///
    /// let header = Header::new(MessageType::Call, 42, 100);
    /// assert_eq!(header.encode().len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2] = self.message_type;
        buf[3..7].copy_from_slice(&self.request_id.to_be_bytes());
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: u16::from_be_bytes([buf[0], buf[1]]),
            message_type: buf[2],
            request_id: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            payload_length: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Version is one we can speak
    /// - Message type is known
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_payload_size: u32) -> Result<MessageType> {
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&self.version) {
            return Err(RmiError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: self.version,
            });
        }

        let message_type = MessageType::try_from(self.message_type)?;

        if self.payload_length > max_payload_size {
            return Err(RmiError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(message_type)
    }
}
