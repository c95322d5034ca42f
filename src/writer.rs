//! Dedicated writer task for a Pipe's outbound half.
//!
//! Every frame leaving a Pipe goes through one writer task fed by an mpsc
//! channel. A frame is always written whole, and frames hit the socket in
//! the order they were enqueued, so concurrent senders can never interleave
//! partial frames.
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► SendGuard ─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Dispatch ─┘
//! ```
//!
//! [`WriterHandle::begin_send`] hands out a [`SendGuard`] holding the
//! per-Pipe send lock, which keeps a multi-frame message contiguous.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::error::{RmiError, Result};
use crate::protocol::{Frame, HEADER_SIZE};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum frames to coalesce into a single write.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (11 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (may be empty).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self {
            header: frame.header.encode(),
            payload: frame.payload,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone; all clones share the same send lock.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    send_lock: Arc<Mutex<()>>,
}

impl WriterHandle {
    /// Reserve the send path. Frames sent through the guard are contiguous
    /// on the wire; dropping the guard ends the send.
    pub async fn begin_send(&self) -> SendGuard<'_> {
        SendGuard {
            tx: &self.tx,
            _lock: self.send_lock.lock().await,
        }
    }

    /// Send a single frame (`begin_send`, send, `end_send`).
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.begin_send().await.send(frame).await
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes once the writer task has stopped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Exclusive hold on a Pipe's send path.
pub struct SendGuard<'a> {
    tx: &'a mpsc::Sender<OutboundFrame>,
    _lock: MutexGuard<'a, ()>,
}

impl SendGuard<'_> {
    /// Enqueue one frame.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RmiError::ConnectionLost)
    }

    /// Release the send path (same as dropping the guard).
    pub fn finish(self) {}
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly once every handle is dropped, or with an error
/// on the first failed write.
pub fn spawn_writer_task<W>(writer: W, channel_capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity);
    let handle = WriterHandle {
        tx,
        send_lock: Arc::new(Mutex::new(())),
    };
    let task = tokio::spawn(writer_loop(rx, writer));
    (handle, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut scratch = BytesMut::with_capacity(64 * 1024);

    while let Some(first) = rx.recv().await {
        scratch.clear();
        append(&mut scratch, &first);

        // Drain whatever else is already queued into the same write.
        let mut batched = 1;
        while batched < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => {
                    append(&mut scratch, &frame);
                    batched += 1;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = writer.write_all(&scratch).await {
            tracing::debug!(error = %e, "writer task stopping on write failure");
            return Err(RmiError::Io(e));
        }
        writer.flush().await?;
    }

    // Channel closed: every handle dropped.
    let _ = writer.shutdown().await;
    Ok(())
}

fn append(scratch: &mut BytesMut, frame: &OutboundFrame) {
    scratch.reserve(frame.size());
    scratch.extend_from_slice(&frame.header);
    scratch.extend_from_slice(&frame.payload);
}
