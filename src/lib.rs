//! # voxel-rmi
//!
//! Point-to-point remote invocation and an out-of-core streaming cache for
//! large spatially partitioned datasets such as point clouds.
//!
//! ## Layers
//!
//! - **Identifiers and serialization** ([`guid`], [`buffer`]): 128-bit ids and
//!   a byte buffer with ordered typed read/write
//! - **Transport** ([`protocol`], [`transport`]): versioned envelopes over a
//!   [`Pipe`](transport::Pipe) with one dispatcher and one writer task each
//! - **Connection pool** ([`pool`]): endpoint registry, listener, idle expiry
//! - **Remote invocation** ([`rmi`]): proxies, stubs and the object registry
//! - **Streaming cache** ([`cache`]): priority-ordered batched chunk reads
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use voxel_rmi::cache::{store_stub, MemoryStore, RemoteStore, STORE_CLASS};
//! use voxel_rmi::pool::{ConnectionPool, PoolConfig};
//! use voxel_rmi::rmi::{ObjectManager, ObjectRegistry};
//!
//! #[tokio::main]
//! async fn main() -> voxel_rmi::Result<()> {
//!     let registry = ObjectRegistry::new();
//!     registry.register_class(STORE_CLASS, || {
//!         Arc::new(store_stub(Arc::new(MemoryStore::new(vec![0u8; 1024]))))
//!     });
//!     let server = ConnectionPool::new(PoolConfig::default(), registry);
//!     let addr = server.start_listener().await?;
//!
//!     let client = ConnectionPool::new(PoolConfig::default(), ObjectRegistry::new());
//!     let manager = ObjectManager::pooled(client, addr.to_string());
//!     let store = RemoteStore::new(manager.create_object(STORE_CLASS).await?);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod cache;
pub mod codec;
pub mod error;
pub mod guid;
pub mod pool;
pub mod protocol;
pub mod rmi;
pub mod transport;

mod writer;

pub use buffer::{Buffer, Decode, Encode};
pub use error::{Result, RmiError};
pub use guid::Guid;
pub use protocol::Status;
