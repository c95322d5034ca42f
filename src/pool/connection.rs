//! Connection pool: endpoint registry, listener and idle expiry.
//!
//! A [`ConnectionPool`] is an owned handle; clones share one pool. It runs
//! two background tasks:
//! - the expiry timer (started with the pool) closing idle Pipes
//! - the listener (started by [`ConnectionPool::start_listener`])
//!
//! Both hold only a weak reference to the pool, stop on
//! [`ConnectionPool::shutdown`], and are aborted when the last handle drops.
//!
//! # Example
//!
//! ```ignore
//! let server = ConnectionPool::new(PoolConfig::default(), registry);
//! let addr = server.start_listener().await?;
//!
//! let client = ConnectionPool::new(PoolConfig::default(), ObjectRegistry::new());
//! let pipe = client.new_pipe(&addr.to_string()).await?;
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::handshake::{self, Handshake, Hello};
use super::host::Host;
use crate::error::{RmiError, Result};
use crate::guid::Guid;
use crate::rmi::ObjectRegistry;
use crate::transport::{BoxedReader, BoxedWriter, CallHandler, Pipe, PipeConfig, Transport};

/// Port used when an endpoint name carries none, and by the default listener.
pub const DEFAULT_LISTEN_PORT: u16 = 7447;

/// Idle time after which a pooled Pipe is closed.
pub const DEFAULT_IDLE_EXPIRY: Duration = Duration::from_secs(30);

/// How often the expiry timer scans the pool.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on connect plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub listen_addr: SocketAddr,
    pub idle_expiry: Duration,
    pub scan_interval: Duration,
    pub connect_timeout: Duration,
    /// Configuration for every Pipe the pool creates.
    pub pipe: PipeConfig,
    /// Name advertised in handshakes. Empty means the listener's address
    /// once bound.
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            idle_expiry: DEFAULT_IDLE_EXPIRY,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pipe: PipeConfig::default(),
            name: String::new(),
        }
    }
}

impl PoolConfig {
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn idle_expiry(mut self, expiry: Duration) -> Self {
        self.idle_expiry = expiry;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn pipe(mut self, pipe: PipeConfig) -> Self {
        self.pipe = pipe;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Append the default port to a bare host name.
///
/// A host id string names an anonymous inbound peer and is kept as a host id.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.parse::<SocketAddr>().is_ok() {
        return endpoint.to_string();
    }
    if let Ok(id) = endpoint.parse::<Guid>() {
        return id.to_string();
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            endpoint.to_string()
        }
        _ if endpoint.contains(':') => format!("[{}]:{}", endpoint, DEFAULT_LISTEN_PORT),
        _ => format!("{}:{}", endpoint, DEFAULT_LISTEN_PORT),
    }
}

#[derive(Default)]
struct Tasks {
    timer: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

struct Inner {
    config: PoolConfig,
    local_id: Guid,
    advertised: parking_lot::Mutex<String>,
    registry: Arc<ObjectRegistry>,
    hosts: parking_lot::Mutex<HashMap<String, Host>>,
    /// One lock per endpoint; connecting to one never waits on another.
    connecting: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Tasks>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for task in [tasks.timer.take(), tasks.listener.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Shared handle to a connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    /// Create a pool serving `registry` on every Pipe it owns, and start its
    /// expiry timer. Must be called inside a Tokio runtime.
    pub fn new(config: PoolConfig, registry: Arc<ObjectRegistry>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            advertised: parking_lot::Mutex::new(config.name.clone()),
            config,
            local_id: Guid::generate(),
            registry,
            hosts: parking_lot::Mutex::new(HashMap::new()),
            connecting: parking_lot::Mutex::new(HashMap::new()),
            shutdown,
            tasks: parking_lot::Mutex::new(Tasks::default()),
        });

        let timer = tokio::spawn(expiry_loop(
            Arc::downgrade(&inner),
            inner.shutdown.subscribe(),
            inner.config.scan_interval,
        ));
        inner.tasks.lock().timer = Some(timer);

        Self { inner }
    }

    /// This pool's host id, sent in every handshake.
    pub fn local_id(&self) -> Guid {
        self.inner.local_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.inner.registry
    }

    /// Pipe to `endpoint`, reusing a connected one or connecting a new one.
    pub async fn new_pipe(&self, endpoint: &str) -> Result<Arc<Pipe>> {
        let name = normalize_endpoint(endpoint);
        if let Some(pipe) = self.reuse(&name) {
            return Ok(pipe);
        }

        let _connecting = self.connect_lock(&name).lock_owned().await;
        // Someone may have connected while we waited.
        if let Some(pipe) = self.reuse(&name) {
            return Ok(pipe);
        }
        self.connect(&name).await
    }

    /// Replace the Pipe to `endpoint` with a fresh connection.
    pub async fn reconnect(&self, endpoint: &str) -> Result<Arc<Pipe>> {
        let name = normalize_endpoint(endpoint);
        let _connecting = self.connect_lock(&name).lock_owned().await;
        tracing::debug!(endpoint = %name, "reconnecting");
        self.connect(&name).await
    }

    fn connect_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.inner
                .connecting
                .lock()
                .entry(name.to_string())
                .or_default(),
        )
    }

    /// Detach and close the Pipe to `endpoint`. Outstanding calls on it
    /// fail with `ConnectionLost`. Returns whether there was one.
    pub async fn delete_pipe(&self, endpoint: &str) -> bool {
        let name = normalize_endpoint(endpoint);
        let pipe = self
            .inner
            .hosts
            .lock()
            .get_mut(&name)
            .and_then(Host::detach);
        match pipe {
            Some(pipe) => {
                pipe.close().await;
                tracing::debug!(endpoint = %name, "pipe deleted");
                true
            }
            None => false,
        }
    }

    /// Snapshot of the Host registered under `endpoint`.
    pub fn host(&self, endpoint: &str) -> Option<Host> {
        self.inner
            .hosts
            .lock()
            .get(&normalize_endpoint(endpoint))
            .cloned()
    }

    /// Connected Pipe to the party with host id `id`, however it was reached.
    pub fn pipe_for(&self, id: Guid) -> Option<Arc<Pipe>> {
        self.inner
            .hosts
            .lock()
            .values()
            .filter(|h| h.id == id)
            .find_map(|h| h.pipe().cloned())
    }

    /// Hosts known to the pool, connected or not.
    pub fn host_count(&self) -> usize {
        self.inner.hosts.lock().len()
    }

    /// Hosts with a connected Pipe.
    pub fn pipe_count(&self) -> usize {
        self.inner
            .hosts
            .lock()
            .values()
            .filter(|h| h.is_connected())
            .count()
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start_listener(&self) -> Result<SocketAddr> {
        if *self.inner.shutdown.borrow() {
            return Err(RmiError::Transport("pool is shut down".to_string()));
        }
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let addr = listener.local_addr()?;

        {
            let mut advertised = self.inner.advertised.lock();
            if advertised.is_empty() {
                *advertised = addr.to_string();
            }
        }

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::downgrade(&self.inner),
            self.inner.shutdown.subscribe(),
        ));
        if let Some(old) = self.inner.tasks.lock().listener.replace(task) {
            old.abort();
        }
        tracing::info!(addr = %addr, "listening");
        Ok(addr)
    }

    /// Close every Pipe idle past the expiry with no call in flight, and
    /// detach Pipes that already died. Returns how many were closed.
    pub async fn expire_idle(&self) -> usize {
        expire(&self.inner).await
    }

    /// Stop the timer and listener, wait for both to finish, then close
    /// every Pipe.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let tasks = {
            let mut tasks = self.inner.tasks.lock();
            [tasks.timer.take(), tasks.listener.take()]
        };
        for task in tasks.into_iter().flatten() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "pool task ended abnormally");
            }
        }

        let pipes: Vec<Arc<Pipe>> = self
            .inner
            .hosts
            .lock()
            .values_mut()
            .filter_map(Host::detach)
            .collect();
        for pipe in &pipes {
            pipe.close().await;
        }
        tracing::debug!(closed = pipes.len(), "pool shut down");
    }

    fn reuse(&self, name: &str) -> Option<Arc<Pipe>> {
        let mut hosts = self.inner.hosts.lock();
        let host = hosts.get_mut(name)?;
        let pipe = host.pipe()?.clone();
        host.touch();
        Some(pipe)
    }

    async fn connect(&self, name: &str) -> Result<Arc<Pipe>> {
        let config = &self.inner.config;
        let connected = tokio::time::timeout(config.connect_timeout, async {
            let addr = lookup_host(name)
                .await?
                .next()
                .ok_or_else(|| RmiError::Transport(format!("cannot resolve {}", name)))?;
            let stream = TcpStream::connect(addr).await?;
            let (mut reader, mut writer) = Transport::Tcp(stream).into_split();
            let done = handshake::initiate(&mut reader, &mut writer, &self.hello()).await?;
            Ok::<_, RmiError>((addr, reader, writer, done))
        })
        .await
        .map_err(|_| RmiError::Timeout(config.connect_timeout))?;

        let (addr, reader, writer, done) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(endpoint = %name, error = %e, "connect failed");
                return Err(e);
            }
        };

        let pipe = make_pipe(&self.inner, reader, writer, &done, addr.to_string());
        let old = {
            let mut hosts = self.inner.hosts.lock();
            let host = hosts
                .entry(name.to_string())
                .or_insert_with(|| Host::new(name.to_string(), Some(addr)));
            host.addr = Some(addr);
            host.attach(Arc::clone(&pipe), done.peer_id, done.protocol_version)
        };
        if let Some(old) = old {
            old.close().await;
        }

        tracing::debug!(
            endpoint = %name,
            peer = %done.peer_id,
            version = done.protocol_version,
            "pipe connected"
        );
        Ok(pipe)
    }

    fn hello(&self) -> Hello {
        Hello::new(self.inner.local_id, self.inner.advertised.lock().clone())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("local_id", &self.inner.local_id)
            .field("hosts", &self.inner.hosts.lock().len())
            .finish()
    }
}

fn make_pipe(
    inner: &Inner,
    reader: BoxedReader,
    writer: BoxedWriter,
    done: &Handshake,
    peer: String,
) -> Arc<Pipe> {
    let handler: Arc<dyn CallHandler> = inner.registry.clone();
    Arc::new(Pipe::from_parts(
        reader,
        writer,
        done.leftover.clone(),
        peer,
        inner.config.pipe.clone(),
        Some(handler),
    ))
}

async fn expire(inner: &Inner) -> usize {
    let expiry = inner.config.idle_expiry;
    let mut idle = Vec::new();
    {
        let mut hosts = inner.hosts.lock();
        for host in hosts.values_mut() {
            let Some(pipe) = &host.pipe else { continue };
            if !pipe.is_connected() {
                host.detach();
            } else if pipe.outstanding_calls() == 0 && host.idle_for() > expiry {
                if let Some(pipe) = host.detach() {
                    idle.push((host.name.clone(), pipe));
                }
            }
        }
    }

    for (name, pipe) in &idle {
        tracing::debug!(endpoint = %name, "closing idle pipe");
        pipe.close().await;
    }
    idle.len()
}

async fn expiry_loop(inner: Weak<Inner>, mut shutdown: watch::Receiver<bool>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        let Some(inner) = inner.upgrade() else { break };
        let closed = expire(&inner).await;
        if closed > 0 {
            tracing::debug!(closed, "expired idle pipes");
        }
    }
    tracing::debug!("expiry timer stopped");
}

async fn accept_loop(listener: TcpListener, inner: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        let (stream, addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = register_inbound(stream, addr, inner).await {
                tracing::warn!(peer = %addr, error = %e, "inbound handshake failed");
            }
        });
    }
    tracing::debug!("listener stopped");
}

async fn register_inbound(stream: TcpStream, addr: SocketAddr, inner: Weak<Inner>) -> Result<()> {
    let (local, timeout) = {
        let inner = inner.upgrade().ok_or(RmiError::ConnectionLost)?;
        let hello = Hello::new(inner.local_id, inner.advertised.lock().clone());
        (hello, inner.config.connect_timeout)
    };

    let (mut reader, mut writer) = Transport::Tcp(stream).into_split();
    let done = tokio::time::timeout(timeout, handshake::accept(&mut reader, &mut writer, &local))
        .await
        .map_err(|_| RmiError::Timeout(timeout))??;

    let inner = inner.upgrade().ok_or(RmiError::ConnectionLost)?;
    let pipe = make_pipe(&inner, reader, writer, &done, addr.to_string());
    let name = if done.peer_name.is_empty() {
        done.peer_id.to_string()
    } else {
        normalize_endpoint(&done.peer_name)
    };

    let old = {
        let mut hosts = inner.hosts.lock();
        let host = hosts
            .entry(name.clone())
            .or_insert_with(|| Host::new(name.clone(), Some(addr)));
        host.attach(pipe, done.peer_id, done.protocol_version)
    };
    if let Some(old) = old {
        old.close().await;
    }
    tracing::debug!(endpoint = %name, peer = %done.peer_id, "inbound pipe registered");
    Ok(())
}
