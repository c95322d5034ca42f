//! Byte streams a Pipe can run over.
//!
//! - `Tcp`: a connected socket (pool connections, listener accepts)
//! - `Memory`: an in-process duplex buffer (loopback, tests)
//!
//! The variant is picked when the stream is created; everything above this
//! module only sees the split read/write halves.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

use crate::error::{RmiError, Result};

/// Boxed read half handed to the dispatcher.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Boxed write half handed to the writer task.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Default in-memory duplex capacity.
pub const DEFAULT_MEMORY_CAPACITY: usize = 256 * 1024;

/// A connected byte stream.
#[derive(Debug)]
pub enum Transport {
    /// TCP socket.
    Tcp(TcpStream),
    /// In-memory duplex stream.
    Memory(DuplexStream),
}

impl Transport {
    /// Two in-memory transports wired to each other.
    pub fn memory_pair(capacity: usize) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(capacity);
        (Transport::Memory(a), Transport::Memory(b))
    }

    /// Human-readable peer description for logs.
    pub fn peer_label(&self) -> String {
        match self {
            Transport::Tcp(stream) => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            Transport::Memory(_) => "memory".to_string(),
        }
    }

    /// Split into read and write halves.
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Transport::Tcp(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                }
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            Transport::Memory(stream) => {
                let (r, w) = tokio::io::split(stream);
                (Box::new(r), Box::new(w))
            }
        }
    }
}

/// Read from `reader` until `buf` holds at least `min_bytes`.
///
/// Bytes past `min_bytes` that arrived in the same read stay in `buf`.
/// EOF before `min_bytes` fails with [`RmiError::ConnectionLost`].
pub async fn receive_data<R>(reader: &mut R, buf: &mut BytesMut, min_bytes: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < min_bytes {
        buf.reserve(min_bytes - buf.len());
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(RmiError::ConnectionLost);
        }
    }
    Ok(())
}
