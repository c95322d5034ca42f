//! Server-side method tables.
//!
//! A [`Stub`] binds a shared state value to a table of named async methods.
//! Each method receives the serialized inputs and returns the serialized
//! outputs; the registry frames them into a result.
//!
//! # Example
//!
//! ```ignore
//! let adder = Stub::new("Adder", ()).method("add", |_, mut inputs| async move {
//!     let a: u32 = inputs.read()?;
//!     let b: u32 = inputs.read()?;
//!     let mut out = Buffer::new();
//!     out.write(&(a + b))?;
//!     Ok(out)
//! });
//! registry.register_object(Arc::new(adder));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::error::{RmiError, Result};
use crate::protocol::Status;
use crate::transport::BoxFuture;

/// An object that can be invoked remotely.
pub trait RemoteObject: Send + Sync + 'static {
    /// Class this object was created as.
    fn class_name(&self) -> &str;

    /// Run `method` with serialized `inputs`, producing serialized outputs.
    fn invoke(&self, method: &str, inputs: Buffer) -> BoxFuture<'static, Result<Buffer>>;
}

type Method<S> = Box<dyn Fn(Arc<S>, Buffer) -> BoxFuture<'static, Result<Buffer>> + Send + Sync>;

/// Method table over a shared state value.
pub struct Stub<S> {
    class: String,
    state: Arc<S>,
    methods: HashMap<String, Method<S>>,
}

impl<S: Send + Sync + 'static> Stub<S> {
    pub fn new(class: impl Into<String>, state: S) -> Self {
        Self::with_state(class, Arc::new(state))
    }

    /// Build over state that is shared with other owners.
    pub fn with_state(class: impl Into<String>, state: Arc<S>) -> Self {
        Self {
            class: class.into(),
            state,
            methods: HashMap::new(),
        }
    }

    /// Add a method. A later registration under the same name replaces it.
    pub fn method<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<S>, Buffer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Buffer>> + Send + 'static,
    {
        let boxed: Method<S> = Box::new(move |state, inputs| Box::pin(handler(state, inputs)));
        self.methods.insert(name.to_string(), boxed);
        self
    }

    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl<S: Send + Sync + 'static> RemoteObject for Stub<S> {
    fn class_name(&self) -> &str {
        &self.class
    }

    fn invoke(&self, method: &str, inputs: Buffer) -> BoxFuture<'static, Result<Buffer>> {
        match self.methods.get(method) {
            Some(handler) => handler(Arc::clone(&self.state), inputs),
            None => {
                tracing::debug!(class = %self.class, method, "unknown method");
                Box::pin(async { Err(RmiError::Remote(Status::UnknownMethod)) })
            }
        }
    }
}

impl<S> std::fmt::Debug for Stub<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub")
            .field("class", &self.class)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> Stub<AtomicU32> {
        Stub::new("Counter", AtomicU32::new(0))
            .method("add", |state, mut inputs| async move {
                let delta: u32 = inputs.read()?;
                let total = state.fetch_add(delta, Ordering::SeqCst) + delta;
                let mut out = Buffer::new();
                out.write(&total)?;
                Ok(out)
            })
            .method("get", |state, _| async move {
                let mut out = Buffer::new();
                out.write(&state.load(Ordering::SeqCst))?;
                Ok(out)
            })
    }

    #[tokio::test]
    async fn test_methods_share_state() {
        let stub = counter();
        assert_eq!(stub.class_name(), "Counter");
        assert!(stub.has_method("add"));

        let mut inputs = Buffer::new();
        inputs.write(&5u32).unwrap();
        let mut out = stub.invoke("add", inputs).await.unwrap();
        assert_eq!(out.read::<u32>().unwrap(), 5);

        let mut out = stub.invoke("get", Buffer::new()).await.unwrap();
        assert_eq!(out.read::<u32>().unwrap(), 5);
        assert_eq!(stub.state().load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = counter().invoke("reset", Buffer::new()).await.unwrap_err();
        assert!(matches!(err, RmiError::Remote(Status::UnknownMethod)));
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let err = counter().invoke("add", Buffer::new()).await.unwrap_err();
        assert_eq!(err.status(), Status::SerializationError);
    }
}
