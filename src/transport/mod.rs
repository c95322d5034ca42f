//! Transport module - message pipes over connected byte streams.
//!
//! Provides:
//! - [`Transport`] - the stream variants a Pipe can run over (TCP, in-memory)
//! - [`Pipe`] - framed, correlated request/response plus one-way messages
//! - [`Correlator`] - request-id keyed table of waiting callers

mod correlation;
mod pipe;
mod stream;

pub use crate::writer::SendGuard;
pub use correlation::{Correlator, PendingCall};
pub use pipe::{
    BoxFuture, CallHandler, Pipe, PipeConfig, PipeState, ReceiveGuard, DEFAULT_CALL_TIMEOUT,
    DEFAULT_INBOUND_CAPACITY,
};
pub use stream::{
    receive_data, BoxedReader, BoxedWriter, Transport, DEFAULT_MEMORY_CAPACITY,
};
