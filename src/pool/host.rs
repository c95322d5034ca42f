//! Endpoint registry entries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::guid::Guid;
use crate::transport::Pipe;

/// One remote (or local) party known to a pool.
///
/// A Host outlives its Pipes: reconnecting swaps the Pipe, expiry and
/// `delete_pipe` detach it, and the Host itself stays until the pool goes.
#[derive(Clone)]
pub struct Host {
    pub(crate) name: String,
    pub(crate) addr: Option<SocketAddr>,
    pub(crate) id: Guid,
    pub(crate) pipe: Option<Arc<Pipe>>,
    pub(crate) last_used: Instant,
    pub(crate) protocol_version: u16,
}

impl Host {
    pub(crate) fn new(name: String, addr: Option<SocketAddr>) -> Self {
        Self {
            name,
            addr,
            id: Guid::NULL,
            pipe: None,
            last_used: Instant::now(),
            protocol_version: 0,
        }
    }

    /// Registry key: `host:port` for outbound endpoints, the advertised name
    /// (or id) for accepted ones.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Id learned during the handshake; null until the first connection.
    pub fn id(&self) -> Guid {
        self.id
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// The active Pipe, if it is still connected.
    pub fn pipe(&self) -> Option<&Arc<Pipe>> {
        self.pipe.as_ref().filter(|p| p.is_connected())
    }

    pub fn is_connected(&self) -> bool {
        self.pipe().is_some()
    }

    /// Time since the Host was last handed out or its Pipe last moved a message.
    pub fn idle_for(&self) -> Duration {
        let handed_out = self.last_used.elapsed();
        match &self.pipe {
            Some(pipe) => handed_out.min(pipe.idle_for()),
            None => handed_out,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Install a new Pipe, returning the one it replaces.
    pub(crate) fn attach(
        &mut self,
        pipe: Arc<Pipe>,
        id: Guid,
        protocol_version: u16,
    ) -> Option<Arc<Pipe>> {
        self.id = id;
        self.protocol_version = protocol_version;
        self.touch();
        self.pipe.replace(pipe)
    }

    pub(crate) fn detach(&mut self) -> Option<Arc<Pipe>> {
        self.pipe.take()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}
