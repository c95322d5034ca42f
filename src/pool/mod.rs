//! Connection pool and endpoint lifecycle.
//!
//! Provides:
//! - [`ConnectionPool`] - endpoint registry with listener and idle expiry
//! - [`Host`] - one known party and its active Pipe
//! - [`handshake`] - the JSON hello exchanged before a socket becomes a Pipe

mod connection;
pub mod handshake;
mod host;

pub use connection::{
    normalize_endpoint, ConnectionPool, PoolConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_EXPIRY,
    DEFAULT_LISTEN_PORT, DEFAULT_SCAN_INTERVAL,
};
pub use host::Host;
