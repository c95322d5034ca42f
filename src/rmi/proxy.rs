//! Client-side handles to remote objects.
//!
//! A [`Proxy`] names one remote object and how to reach it. Every call
//! records its outcome as a [`Status`], so callers can check
//! [`Proxy::status`] instead of threading errors through.
//!
//! Proxies bound through a [`ConnectionPool`] recover from a dead
//! connection: the endpoint is reconnected and the call retried once. The
//! failure only surfaces when reconnecting fails too.
//!
//! # Example
//!
//! ```ignore
//! let manager = ObjectManager::pooled(pool.clone(), "tiles:7447");
//! let mut store = manager.create_object("Store").await?;
//!
//! let mut size = 0u64;
//! if store.call("size", &mut [&mut Out::new(&mut size)]).await.is_success() {
//!     println!("{} bytes", size);
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use super::call::invoke;
use super::param::{In, Out, Param};
use super::registry::MANAGER_ID;
use crate::error::{RmiError, Result};
use crate::guid::Guid;
use crate::pool::ConnectionPool;
use crate::protocol::Status;
use crate::transport::Pipe;

/// How a proxy reaches its object.
#[derive(Clone)]
pub enum Binding {
    /// Through a pool endpoint, with reconnect on failure.
    Pooled {
        pool: ConnectionPool,
        endpoint: String,
    },
    /// Over one fixed Pipe.
    Direct(Arc<Pipe>),
}

impl Binding {
    async fn pipe(&self) -> Result<Arc<Pipe>> {
        match self {
            Binding::Pooled { pool, endpoint } => pool.new_pipe(endpoint).await,
            Binding::Direct(pipe) => Ok(Arc::clone(pipe)),
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Binding::Pooled { endpoint, .. } => f.debug_tuple("Pooled").field(endpoint).finish(),
            Binding::Direct(pipe) => f.debug_tuple("Direct").field(&pipe.peer()).finish(),
        }
    }
}

/// Handle to one remote object.
#[derive(Debug, Clone)]
pub struct Proxy {
    binding: Binding,
    object: Guid,
    status: Status,
    timeout: Option<Duration>,
}

impl Proxy {
    pub fn new(binding: Binding, object: Guid) -> Self {
        Self {
            binding,
            object,
            status: Status::Success,
            timeout: None,
        }
    }

    pub fn pooled(pool: ConnectionPool, endpoint: impl Into<String>, object: Guid) -> Self {
        Self::new(
            Binding::Pooled {
                pool,
                endpoint: endpoint.into(),
            },
            object,
        )
    }

    pub fn direct(pipe: Arc<Pipe>, object: Guid) -> Self {
        Self::new(Binding::Direct(pipe), object)
    }

    /// Override the Pipe's call timeout for this proxy.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Id of the bound object. Debug builds assert it is not null.
    pub fn object(&self) -> Guid {
        debug_assert!(self.object.is_valid(), "proxy bound to a null object");
        self.object
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Outcome of the last call.
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn reset_status(&mut self) {
        self.status = Status::Success;
    }

    /// Invoke `method`, recording and returning its status. Outputs are only
    /// written when the call succeeds.
    pub async fn call(&mut self, method: &str, params: &mut [&mut dyn Param]) -> Status {
        let status = match self.try_call(method, params).await {
            Ok(()) => Status::Success,
            Err(e) => {
                tracing::debug!(object = %self.object, method, error = %e, "call failed");
                e.status()
            }
        };
        self.status = status;
        status
    }

    /// Invoke `method`, returning the error instead of recording a status.
    pub async fn try_call(&self, method: &str, params: &mut [&mut dyn Param]) -> Result<()> {
        let object = self.object();
        let pipe = self.binding.pipe().await?;
        match invoke(&pipe, object, method, params, self.timeout_for(&pipe)).await {
            Err(e) if e.is_connection_failure() => {
                let Binding::Pooled { pool, endpoint } = &self.binding else {
                    return Err(e);
                };
                tracing::warn!(endpoint = %endpoint, method, error = %e, "endpoint unreachable, reconnecting");
                let pipe = pool.reconnect(endpoint).await?;
                invoke(&pipe, object, method, params, self.timeout_for(&pipe)).await
            }
            outcome => outcome,
        }
    }

    fn timeout_for(&self, pipe: &Pipe) -> Duration {
        self.timeout.unwrap_or(pipe.config().call_timeout)
    }
}

/// Client for the object manager every registry serves.
#[derive(Debug, Clone)]
pub struct ObjectManager {
    proxy: Proxy,
}

impl ObjectManager {
    pub fn new(binding: Binding) -> Self {
        Self {
            proxy: Proxy::new(binding, MANAGER_ID),
        }
    }

    pub fn pooled(pool: ConnectionPool, endpoint: impl Into<String>) -> Self {
        Self {
            proxy: Proxy::pooled(pool, endpoint, MANAGER_ID),
        }
    }

    pub fn direct(pipe: Arc<Pipe>) -> Self {
        Self {
            proxy: Proxy::direct(pipe, MANAGER_ID),
        }
    }

    /// Create a remote object of `class` and bind a proxy to it.
    pub async fn create_object(&self, class: &str) -> Result<Proxy> {
        let mut id = Guid::NULL;
        self.proxy
            .try_call("create_object", &mut [&mut In(class), &mut Out::new(&mut id)])
            .await?;
        if !id.is_valid() {
            return Err(RmiError::Remote(Status::Failed));
        }
        Ok(Proxy {
            object: id,
            ..self.proxy.clone()
        })
    }

    /// Discard a remote object. Returns whether it existed.
    pub async fn discard_object(&self, object: Guid) -> Result<bool> {
        let mut existed = false;
        self.proxy
            .try_call(
                "discard_object",
                &mut [&mut In(&object), &mut Out::new(&mut existed)],
            )
            .await?;
        Ok(existed)
    }

    /// Class name of a remote object, if it exists.
    pub async fn query_object(&self, object: Guid) -> Result<Option<String>> {
        let mut class = None;
        self.proxy
            .try_call(
                "query_object",
                &mut [&mut In(&object), &mut Out::new(&mut class)],
            )
            .await?;
        Ok(class)
    }
}
