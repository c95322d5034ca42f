//! Remote invocation over Pipes.
//!
//! Client side:
//! - [`Proxy`] - handle to one remote object; calls return a [`Status`]
//! - [`ObjectManager`] - create/discard/query remote objects
//! - [`In`], [`Out`], [`InOut`] - direction-tagged arguments
//!
//! Server side:
//! - [`Stub`] - method table over shared state
//! - [`ObjectRegistry`] - live objects and class factories; the
//!   [`CallHandler`](crate::transport::CallHandler) for served Pipes
//!
//! [`Status`]: crate::protocol::Status

mod call;
mod param;
mod proxy;
mod registry;
mod stub;

pub use call::{
    decode_call, decode_result, encode_call, encode_result, invoke, result_from, CallRequest,
};
pub use param::{decode_outputs, encode_inputs, Direction, In, InOut, Out, Param};
pub use proxy::{Binding, ObjectManager, Proxy};
pub use registry::{ClassFactory, ObjectRegistry, MANAGER_ID};
pub use stub::{RemoteObject, Stub};
