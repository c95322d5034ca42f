//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol spoken over every Pipe:
//! - 11-byte envelope header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Result status codes

mod frame;
mod frame_buffer;
mod status;
mod wire_format;

pub(crate) use frame_buffer::check_payload_len;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use status::Status;
pub use wire_format::{
    Header, MessageType, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MIN_PROTOCOL_VERSION, NO_REQUEST,
    PROTOCOL_VERSION,
};
