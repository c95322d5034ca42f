//! Bidirectional message pipe between two endpoints.
//!
//! A [`Pipe`] owns one connected [`Transport`] and two tasks:
//! - the writer task, the only thing that writes to the socket
//! - the dispatcher task, the only thing that reads from it
//!
//! The dispatcher routes `Result` frames to waiting callers through the
//! [`Correlator`], hands `Call` frames to the Pipe's [`CallHandler`], and
//! queues `Notify` frames for [`Pipe::receive_message`]. Any read, write or
//! protocol failure moves the Pipe straight to `Closed` and fails every
//! outstanding call with `ConnectionLost`.
//!
//! At most [`PipeConfig::max_concurrent_calls`] inbound calls run at once;
//! a call arriving with every slot taken is answered `Failed` at once.
//!
//! # Example
//!
//! ```ignore
//! let (a, b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
//! let client = Pipe::new(a, PipeConfig::default(), None);
//! let server = Pipe::new(b, PipeConfig::default(), Some(registry));
//!
//! let result = client.call(payload).await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex, MutexGuard, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::correlation::Correlator;
use super::stream::{BoxedReader, BoxedWriter, Transport};
use crate::buffer::Buffer;
use crate::error::{RmiError, Result};
use crate::protocol::{
    check_payload_len, Frame, FrameBuffer, MessageType, Status, DEFAULT_MAX_PAYLOAD_SIZE,
    NO_REQUEST,
};
use crate::writer::{spawn_writer_task, SendGuard, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

/// Default bound on a synchronous call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the unsolicited-message queue.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Inbound calls served concurrently per Pipe.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

/// Size of each socket read in the dispatcher.
const READ_CHUNK: usize = 64 * 1024;

/// Boxed future for call handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Serves `Call` frames arriving on a Pipe.
///
/// Receives the call payload and returns the result payload
/// (`[status][outputs...]`). Never fails: errors are encoded as a status.
pub trait CallHandler: Send + Sync + 'static {
    fn handle_call(&self, payload: Bytes) -> BoxFuture<'static, Bytes>;
}

/// Lifecycle state of a Pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipeState {
    Unconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Closed = 4,
}

impl PipeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipeState::Unconnected,
            1 => PipeState::Connecting,
            2 => PipeState::Connected,
            3 => PipeState::Disconnecting,
            _ => PipeState::Closed,
        }
    }
}

/// Per-Pipe configuration.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Bound on each synchronous call.
    pub call_timeout: Duration,
    /// Largest payload accepted or sent.
    pub max_payload_size: u32,
    /// Outbound frame queue capacity.
    pub channel_capacity: usize,
    /// Unsolicited message queue capacity.
    pub inbound_capacity: usize,
    /// Hold the send/receive lock for a whole call exchange, so one logical
    /// call is in flight per Pipe at a time.
    pub exclusive_calls: bool,
    /// Inbound calls whose handlers may run at the same time.
    pub max_concurrent_calls: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            exclusive_calls: true,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        }
    }
}

impl PipeConfig {
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn exclusive_calls(mut self, exclusive: bool) -> Self {
        self.exclusive_calls = exclusive;
        self
    }

    pub fn max_concurrent_calls(mut self, n: usize) -> Self {
        self.max_concurrent_calls = n.max(1);
        self
    }
}

/// State shared between a Pipe and its dispatcher.
struct Shared {
    state: AtomicU8,
    correlator: Arc<Correlator>,
    writer: WriterHandle,
    last_used: parking_lot::Mutex<Instant>,
    call_slots: Arc<Semaphore>,
    max_payload_size: u32,
}

impl Shared {
    fn set_state(&self, state: PipeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> PipeState {
        PipeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Transition to `Closed` and fail every outstanding wait.
    fn close_now(&self) -> usize {
        self.set_state(PipeState::Closed);
        self.correlator.fail_all()
    }
}

/// A connected message pipe.
pub struct Pipe {
    shared: Arc<Shared>,
    config: PipeConfig,
    peer: String,
    call_lock: Arc<Mutex<()>>,
    inbound: Mutex<mpsc::Receiver<Frame>>,
    dispatcher: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
}

impl Pipe {
    /// Start a Pipe over a fresh transport.
    pub fn new(
        transport: Transport,
        config: PipeConfig,
        handler: Option<Arc<dyn CallHandler>>,
    ) -> Self {
        let peer = transport.peer_label();
        let (reader, writer) = transport.into_split();
        Self::from_parts(reader, writer, BytesMut::new(), peer, config, handler)
    }

    /// Start a Pipe over already split halves.
    ///
    /// `leftover` holds bytes read past a handshake; they are parsed before
    /// anything else from `reader`.
    pub fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        leftover: BytesMut,
        peer: String,
        config: PipeConfig,
        handler: Option<Arc<dyn CallHandler>>,
    ) -> Self {
        let (writer, writer_task) = spawn_writer_task(writer, config.channel_capacity);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(PipeState::Connecting as u8),
            correlator: Correlator::new(),
            writer,
            last_used: parking_lot::Mutex::new(Instant::now()),
            call_slots: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            max_payload_size: config.max_payload_size,
        });
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);

        let dispatcher = tokio::spawn(dispatch(
            reader,
            leftover,
            Arc::clone(&shared),
            handler,
            inbound_tx,
            peer.clone(),
        ));
        shared.set_state(PipeState::Connected);
        tracing::debug!(peer = %peer, "pipe connected");

        Self {
            shared,
            config,
            peer,
            call_lock: Arc::new(Mutex::new(())),
            inbound: Mutex::new(inbound_rx),
            dispatcher,
            writer_task,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipeState {
        self.shared.state()
    }

    /// Whether calls can currently be made.
    pub fn is_connected(&self) -> bool {
        self.state() == PipeState::Connected && !self.shared.writer.is_closed()
    }

    /// Peer description for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Time since the Pipe last sent or received a message.
    pub fn idle_for(&self) -> Duration {
        self.shared.last_used.lock().elapsed()
    }

    /// Calls currently awaiting a result.
    pub fn outstanding_calls(&self) -> usize {
        self.shared.correlator.outstanding()
    }

    /// Serialize logical calls on this Pipe. Dropping the guard releases it.
    pub async fn lock_send_receive(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.call_lock).lock_owned().await
    }

    /// Reserve the send path; the guard's `finish` (or drop) ends the send.
    pub async fn begin_send(&self) -> Result<SendGuard<'_>> {
        self.ensure_connected()?;
        Ok(self.shared.writer.begin_send().await)
    }

    /// Write one envelope: `[version][type][request id][length][payload]`.
    pub async fn send_message(
        &self,
        message_type: MessageType,
        request_id: u32,
        payload: Bytes,
    ) -> Result<()> {
        check_payload_len(payload.len(), self.config.max_payload_size)?;
        let guard = self.begin_send().await?;
        guard
            .send(Frame::new(message_type, request_id, payload).into())
            .await?;
        guard.finish();
        self.shared.touch();
        Ok(())
    }

    /// Send an unsolicited message to the peer.
    pub async fn notify(&self, payload: Bytes) -> Result<()> {
        self.send_message(MessageType::Notify, NO_REQUEST, payload)
            .await
    }

    /// Reserve the inbound queue of unsolicited messages.
    pub async fn begin_receive(&self) -> ReceiveGuard<'_> {
        ReceiveGuard {
            rx: self.inbound.lock().await,
            shared: &self.shared,
        }
    }

    /// Wait for the next unsolicited message.
    pub async fn receive_message(&self) -> Result<Frame> {
        self.begin_receive().await.recv().await
    }

    /// Make a call with the configured timeout and return the result frame.
    pub async fn call(&self, payload: Bytes) -> Result<Frame> {
        self.call_with_timeout(payload, self.config.call_timeout)
            .await
    }

    /// Make a call and wait at most `timeout` for its result frame.
    ///
    /// The bound covers the whole exchange: waiting for the call lock, the
    /// send queue and the result.
    pub async fn call_with_timeout(&self, payload: Bytes, timeout: Duration) -> Result<Frame> {
        self.ensure_connected()?;
        let deadline = Instant::now() + timeout;

        let exchange = async {
            let _exclusive = if self.config.exclusive_calls {
                Some(self.lock_send_receive().await)
            } else {
                None
            };

            let pending = self.shared.correlator.register()?;
            self.send_message(MessageType::Call, pending.request_id(), payload)
                .await?;
            pending
                .wait(deadline.saturating_duration_since(Instant::now()))
                .await
        };

        let result = match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Err(RmiError::Timeout(_))) | Err(_) => Err(RmiError::Timeout(timeout)),
            Ok(result) => result,
        };
        if matches!(result, Err(RmiError::Timeout(_))) {
            tracing::warn!(peer = %self.peer, timeout = ?timeout, "call timed out");
        }
        result
    }

    /// Graceful close: tell the peer, then fail outstanding calls.
    pub async fn close(&self) {
        if self.state() != PipeState::Connected {
            return;
        }
        self.shared.set_state(PipeState::Disconnecting);
        let close = Frame::new(MessageType::Close, NO_REQUEST, Bytes::new());
        if let Err(e) = self.shared.writer.send(close.into()).await {
            tracing::debug!(peer = %self.peer, error = %e, "close frame not sent");
        }
        let failed = self.shared.close_now();
        self.dispatcher.abort();
        tracing::debug!(peer = %self.peer, failed, "pipe closed");
    }

    /// Whether the writer task has exited (it does once the Pipe is gone).
    pub fn writer_finished(&self) -> bool {
        self.writer_task.is_finished()
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            PipeState::Connected => Ok(()),
            _ => Err(RmiError::ConnectionLost),
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("peer", &self.peer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.shared.close_now();
        self.dispatcher.abort();
        // The writer task drains and exits once the last handle is gone.
    }
}

/// Exclusive access to a Pipe's unsolicited message queue.
pub struct ReceiveGuard<'a> {
    rx: MutexGuard<'a, mpsc::Receiver<Frame>>,
    shared: &'a Shared,
}

impl ReceiveGuard<'_> {
    /// Next unsolicited frame, or `ConnectionLost` once the Pipe is closed.
    pub async fn recv(&mut self) -> Result<Frame> {
        let frame = self.rx.recv().await.ok_or(RmiError::ConnectionLost)?;
        self.shared.touch();
        Ok(frame)
    }

    /// Release the queue (same as dropping the guard).
    pub fn finish(self) {}
}

/// Dispatcher task body.
async fn dispatch(
    reader: BoxedReader,
    leftover: BytesMut,
    shared: Arc<Shared>,
    handler: Option<Arc<dyn CallHandler>>,
    inbound: mpsc::Sender<Frame>,
    peer: String,
) {
    let outcome = read_loop(reader, leftover, &shared, handler, &inbound).await;
    let failed = shared.close_now();
    match outcome {
        Ok(()) => tracing::debug!(peer = %peer, failed, "pipe closed by peer"),
        Err(e) => tracing::warn!(peer = %peer, failed, error = %e, "pipe dispatcher failed"),
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    leftover: BytesMut,
    shared: &Arc<Shared>,
    handler: Option<Arc<dyn CallHandler>>,
    inbound: &mpsc::Sender<Frame>,
) -> Result<()> {
    use tokio::io::AsyncReadExt;

    let mut frames = FrameBuffer::with_max_payload(shared.max_payload_size);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending = frames.push(&leftover)?;

    loop {
        for frame in pending.drain(..) {
            if !route(frame, shared, handler.as_ref(), inbound)? {
                return Ok(());
            }
        }

        let n = tokio::select! {
            n = reader.read(&mut buf) => n?,
            _ = shared.writer.closed() => {
                return Err(RmiError::Transport("writer stopped".to_string()));
            }
        };
        if n == 0 {
            return Ok(());
        }
        pending = frames.push(&buf[..n])?;
    }
}

/// Route one inbound frame. Returns `false` when the peer closed.
fn route(
    frame: Frame,
    shared: &Arc<Shared>,
    handler: Option<&Arc<dyn CallHandler>>,
    inbound: &mpsc::Sender<Frame>,
) -> Result<bool> {
    shared.touch();
    match frame.message_type {
        MessageType::Result => {
            let id = frame.request_id();
            if !shared.correlator.signal(frame) {
                tracing::debug!(request_id = id, "discarding result with no waiter");
            }
        }
        MessageType::Call => {
            let id = frame.request_id();
            let writer = shared.writer.clone();
            let Ok(permit) = Arc::clone(&shared.call_slots).try_acquire_owned() else {
                tracing::warn!(request_id = id, "call capacity reached, refusing call");
                let reply = Frame::new(MessageType::Result, id, status_only(Status::Failed));
                tokio::spawn(async move {
                    let _ = writer.send(reply.into()).await;
                });
                return Ok(true);
            };
            let handler = handler.cloned();
            let max_payload_size = shared.max_payload_size;
            tokio::spawn(async move {
                let _permit = permit;
                let mut response = match handler {
                    Some(handler) => handler.handle_call(frame.payload).await,
                    None => status_only(Status::UnknownObject),
                };
                if let Err(e) = check_payload_len(response.len(), max_payload_size) {
                    tracing::warn!(request_id = id, error = %e, "reply too large");
                    response = status_only(Status::SerializationError);
                }
                let reply = Frame::new(MessageType::Result, id, response);
                if let Err(e) = writer.send(reply.into()).await {
                    tracing::debug!(request_id = id, error = %e, "result not sent");
                }
            });
        }
        MessageType::Notify => {
            if inbound.try_send(frame).is_err() {
                tracing::warn!("inbound queue full or unread, dropping notification");
            }
        }
        MessageType::Close => return Ok(false),
        MessageType::Handshake | MessageType::HandshakeAck => {
            return Err(RmiError::Protocol(
                "Handshake frame on an established pipe".to_string(),
            ));
        }
    }
    Ok(true)
}

/// Result payload carrying only a status byte.
fn status_only(status: Status) -> Bytes {
    let mut buf = Buffer::with_capacity(1);
    buf.write_raw(&[status as u8]);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stream::DEFAULT_MEMORY_CAPACITY;

    /// Echoes the call payload back after a success byte.
    struct Echo;

    impl CallHandler for Echo {
        fn handle_call(&self, payload: Bytes) -> BoxFuture<'static, Bytes> {
            Box::pin(async move {
                let mut buf = Buffer::new();
                buf.write(&Status::Success).unwrap();
                buf.write_raw(&payload);
                buf.freeze()
            })
        }
    }

    fn pair(config: PipeConfig) -> (Pipe, Pipe) {
        let (a, b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
        let client = Pipe::new(a, config.clone(), None);
        let server = Pipe::new(b, config, Some(Arc::new(Echo)));
        (client, server)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client, _server) = pair(PipeConfig::default());
        assert_eq!(client.state(), PipeState::Connected);

        let frame = client.call(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(frame.message_type, MessageType::Result);
        assert_eq!(frame.payload(), b"\x00ping");
        assert_eq!(client.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_correlated() {
        let (client, _server) = pair(PipeConfig::default().exclusive_calls(false));
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for i in 0..20u32 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                let payload = Bytes::from(i.to_be_bytes().to_vec());
                let frame = client.call(payload).await.unwrap();
                assert_eq!(&frame.payload()[1..], &i.to_be_bytes());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_call_without_handler_reports_unknown_object() {
        let (a, b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
        let client = Pipe::new(a, PipeConfig::default(), None);
        let _server = Pipe::new(b, PipeConfig::default(), None);

        let frame = client.call(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(frame.payload(), &[Status::UnknownObject as u8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_peer_times_out() {
        let (a, _b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
        let client = Pipe::new(
            a,
            PipeConfig::default().call_timeout(Duration::from_millis(250)),
            None,
        );

        let err = client.call(Bytes::from_static(b"hello")).await.unwrap_err();
        assert!(matches!(err, RmiError::Timeout(_)));
        assert_eq!(client.outstanding_calls(), 0);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_peer_drop_fails_outstanding_call() {
        let (a, b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
        let client = Pipe::new(a, PipeConfig::default(), None);

        let call = client.call(Bytes::from_static(b"never answered"));
        let killer = async {
            tokio::task::yield_now().await;
            drop(b);
        };
        let (result, ()) = tokio::join!(call, killer);

        assert!(matches!(result, Err(RmiError::ConnectionLost)));
        assert_eq!(client.state(), PipeState::Closed);
        assert!(matches!(
            client.call(Bytes::new()).await,
            Err(RmiError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_notify_and_receive_message() {
        let (client, server) = pair(PipeConfig::default());

        client.notify(Bytes::from_static(b"one")).await.unwrap();
        client.notify(Bytes::from_static(b"two")).await.unwrap();

        let mut inbox = server.begin_receive().await;
        assert_eq!(inbox.recv().await.unwrap().payload(), b"one");
        assert_eq!(inbox.recv().await.unwrap().payload(), b"two");
        inbox.finish();
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (client, server) = pair(PipeConfig::default());

        client.close().await;
        assert_eq!(client.state(), PipeState::Closed);

        assert!(matches!(
            server.receive_message().await,
            Err(RmiError::ConnectionLost)
        ));
        assert_eq!(server.state(), PipeState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_before_send() {
        let (client, _server) = pair(PipeConfig::default().max_payload_size(8));
        let err = client
            .send_message(MessageType::Notify, 0, Bytes::from(vec![0u8; 9]))
            .await
            .unwrap_err();
        assert!(matches!(err, RmiError::Protocol(_)));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_exclusive_lock_serializes_holders() {
        let (client, _server) = pair(PipeConfig::default());
        let guard = client.lock_send_receive().await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            client.lock_send_receive(),
        )
        .await;
        assert!(blocked.is_err());

        drop(guard);
        let _again = client.lock_send_receive().await;
    }

    /// Never answers a `stall` payload; echoes anything else.
    struct Gate;

    impl CallHandler for Gate {
        fn handle_call(&self, payload: Bytes) -> BoxFuture<'static, Bytes> {
            Box::pin(async move {
                if payload.as_ref() == b"stall" {
                    std::future::pending::<()>().await;
                }
                Echo.handle_call(payload).await
            })
        }
    }

    /// Accepts nothing.
    struct BrokenWriter;

    impl tokio::io::AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_oversized_reply_becomes_serialization_error() {
        let (a, b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
        let client = Pipe::new(a, PipeConfig::default(), None);
        let _server = Pipe::new(
            b,
            PipeConfig::default().max_payload_size(8),
            Some(Arc::new(Echo)),
        );

        // Eight bytes in, nine out once the status byte is prepended.
        let frame = client.call(Bytes::from_static(b"12345678")).await.unwrap();
        assert_eq!(frame.payload(), &[Status::SerializationError as u8]);
        assert!(client.is_connected());

        let frame = client.call(Bytes::from_static(b"ok")).await.unwrap();
        assert_eq!(frame.payload(), b"\x00ok");
    }

    #[tokio::test]
    async fn test_calls_beyond_capacity_are_refused() {
        let (a, b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
        let client = Arc::new(Pipe::new(
            a,
            PipeConfig::default().exclusive_calls(false),
            None,
        ));
        let _server = Pipe::new(
            b,
            PipeConfig::default().max_concurrent_calls(1),
            Some(Arc::new(Gate)),
        );

        let stalled = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call(Bytes::from_static(b"stall")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frame = client.call(Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(frame.payload(), &[Status::Failed as u8]);
        assert_eq!(client.outstanding_calls(), 1);
        stalled.abort();
    }

    #[tokio::test]
    async fn test_writer_failure_closes_pipe() {
        let (a, _b) = tokio::io::duplex(64);
        let (reader, _unused) = tokio::io::split(a);
        let client = Pipe::from_parts(
            Box::new(reader),
            Box::new(BrokenWriter),
            BytesMut::new(),
            "broken".to_string(),
            PipeConfig::default().call_timeout(Duration::from_secs(30)),
            None,
        );

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.call(Bytes::from_static(b"lost")),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(RmiError::ConnectionLost)));
        assert_eq!(client.state(), PipeState::Closed);
        assert_eq!(client.outstanding_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_covers_wait_for_call_lock() {
        let (client, _server) = pair(PipeConfig::default());
        let _held = client.lock_send_receive().await;

        let err = client
            .call_with_timeout(Bytes::from_static(b"queued"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RmiError::Timeout(d) if d == Duration::from_millis(100)));
        assert_eq!(client.outstanding_calls(), 0);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_close_fails_call_in_flight() {
        let (a, b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
        let client = Pipe::new(a, PipeConfig::default(), None);
        let _server = Pipe::new(b, PipeConfig::default(), Some(Arc::new(Gate)));

        let call = client.call(Bytes::from_static(b"stall"));
        let closer = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.close().await;
        };
        let (result, ()) = tokio::join!(call, closer);

        assert!(matches!(result, Err(RmiError::ConnectionLost)));
        assert_eq!(client.state(), PipeState::Closed);
    }
}
