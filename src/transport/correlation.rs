//! Call correlation: matching `Result` frames to waiting callers.
//!
//! Each outstanding call registers a [`PendingCall`] under a fresh request
//! id. The Pipe's dispatcher completes it with [`Correlator::signal`] when
//! the matching result arrives; the caller awaits it with a bound.
//!
//! A `PendingCall` that is dropped (timed out, cancelled) removes its entry,
//! so a result arriving afterwards finds no waiter and is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{RmiError, Result};
use crate::protocol::{Frame, NO_REQUEST};

type Waiter = oneshot::Sender<Result<Frame>>;

#[derive(Default)]
struct Table {
    waiters: HashMap<u32, Waiter>,
    closed: bool,
}

/// Correlation table for one Pipe.
#[derive(Default)]
pub struct Correlator {
    next_id: AtomicU32,
    table: Mutex<Table>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for the next call.
    ///
    /// Fails fast with `ConnectionLost` once the table has been closed.
    pub fn register(self: &Arc<Self>) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        if table.closed {
            return Err(RmiError::ConnectionLost);
        }

        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != NO_REQUEST && !table.waiters.contains_key(&id) {
                break id;
            }
        };
        table.waiters.insert(id, tx);

        Ok(PendingCall {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Hand a result frame to its waiter.
    ///
    /// Returns `false` when nobody is waiting for that id any more.
    pub fn signal(&self, frame: Frame) -> bool {
        let waiter = self.table.lock().waiters.remove(&frame.request_id());
        match waiter {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding waiter with `ConnectionLost` and refuse new
    /// registrations.
    pub fn fail_all(&self) -> usize {
        let waiters: Vec<Waiter> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.waiters.drain().map(|(_, tx)| tx).collect()
        };
        let count = waiters.len();
        for tx in waiters {
            let _ = tx.send(Err(RmiError::ConnectionLost));
        }
        count
    }

    /// Number of calls awaiting a result.
    pub fn outstanding(&self) -> usize {
        self.table.lock().waiters.len()
    }

    /// Whether `fail_all` has run.
    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    fn forget(&self, id: u32) {
        self.table.lock().waiters.remove(&id);
    }
}

/// A registered call awaiting its result.
pub struct PendingCall {
    id: u32,
    rx: oneshot::Receiver<Result<Frame>>,
    correlator: Arc<Correlator>,
}

impl PendingCall {
    /// Request id to put in the outgoing `Call` envelope.
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.id
    }

    /// Wait for the result frame, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Frame> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer: the table was torn down.
            Ok(Err(_)) => Err(RmiError::ConnectionLost),
            Err(_) => Err(RmiError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}
