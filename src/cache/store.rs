//! Byte-addressable backing stores.
//!
//! - [`FileStore`] - a local file
//! - [`MemoryStore`] - an in-memory byte vector
//! - [`RemoteStore`] - any store served by another process through
//!   [`store_stub`]
//!
//! Reads may come back short at the end of the store; the cache treats the
//! missing bytes as not yet read. A remote read is split into pieces of at
//! most [`MAX_REMOTE_READ`] bytes, and the stub refuses anything larger.

use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use crate::buffer::Buffer;
use crate::error::{RmiError, Result};
use crate::rmi::{In, Out, Proxy, Stub};
use crate::transport::BoxFuture;

/// Class name [`store_stub`] objects are registered under.
pub const STORE_CLASS: &str = "BackingStore";

/// Largest single read served by [`store_stub`].
pub const MAX_REMOTE_READ: usize = 8 * 1024 * 1024;

/// Capacity reserved up front for a file read; longer reads grow as bytes arrive.
const READ_RESERVE: usize = 1024 * 1024;

/// Storage the cache streams chunk bytes from.
pub trait BackingStore: Send + Sync {
    /// Read up to `len` bytes at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Bytes>>;

    /// Write `data` at `offset`, growing the store if needed.
    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Current size in bytes.
    fn size(&self) -> BoxFuture<'_, Result<u64>>;
}

/// Store backed by a file. One seek+read (or seek+write) runs at a time.
#[derive(Debug)]
pub struct FileStore {
    file: Mutex<File>,
}

impl FileStore {
    /// Open an existing file for reading and writing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .await?;
        Ok(Self::from_file(file))
    }

    /// Create (or truncate) a file.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .await?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len.min(READ_RESERVE));
        let mut limited = (&mut *file).take(len as u64);
        limited.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_range(&self, offset: u64, data: Bytes) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

impl BackingStore for FileStore {
    fn read_at(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.read_range(offset, len))
    }

    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write_range(offset, data))
    }

    fn size(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let file = self.file.lock().await;
            Ok(file.metadata().await?.len())
        })
    }
}

/// Store backed by memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: parking_lot::RwLock<Vec<u8>>,
}

impl MemoryStore {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: parking_lot::RwLock::new(data.into()),
        }
    }

    fn read_now(&self, offset: u64, len: usize) -> Bytes {
        let data = self.data.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Bytes::copy_from_slice(&data[start..end])
    }

    /// Writes may extend the store but never leave a gap past its end.
    fn write_now(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = match usize::try_from(offset) {
            Ok(start) if start <= data.len() => start,
            _ => {
                return Err(RmiError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("write at {} is past the end ({})", offset, data.len()),
                )))
            }
        };
        let end = start
            .checked_add(bytes.len())
            .ok_or(RmiError::BufferOverflow(bytes.len()))?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

impl BackingStore for MemoryStore {
    fn read_at(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Bytes>> {
        let bytes = self.read_now(offset, len);
        Box::pin(async move { Ok(bytes) })
    }

    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<()>> {
        let written = self.write_now(offset, &data);
        Box::pin(async move { written })
    }

    fn size(&self) -> BoxFuture<'_, Result<u64>> {
        let len = self.data.read().len() as u64;
        Box::pin(async move { Ok(len) })
    }
}

/// A store reached through a remote object created by [`store_stub`].
#[derive(Debug, Clone)]
pub struct RemoteStore {
    proxy: Proxy,
    max_read: usize,
}

impl RemoteStore {
    pub fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            max_read: MAX_REMOTE_READ,
        }
    }

    /// Largest piece requested per call, at most [`MAX_REMOTE_READ`].
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read.clamp(1, MAX_REMOTE_READ);
        self
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    async fn read_piece(&self, offset: u64, len: u32) -> Result<Bytes> {
        let mut data = Bytes::new();
        self.proxy
            .try_call(
                "read",
                &mut [&mut In(&offset), &mut In(&len), &mut Out::new(&mut data)],
            )
            .await?;
        Ok(data)
    }
}

impl BackingStore for RemoteStore {
    fn read_at(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            if len <= self.max_read {
                return self.read_piece(offset, len as u32).await;
            }

            let mut out = BytesMut::with_capacity(self.max_read);
            while out.len() < len {
                let want = (len - out.len()).min(self.max_read);
                let at = offset
                    .checked_add(out.len() as u64)
                    .ok_or(RmiError::BufferOverflow(len))?;
                let piece = self.read_piece(at, want as u32).await?;
                out.extend_from_slice(&piece);
                if piece.len() < want {
                    break;
                }
            }
            Ok(out.freeze())
        })
    }

    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.proxy
                .try_call("write", &mut [&mut In(&offset), &mut In(&data)])
                .await
        })
    }

    fn size(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let mut size = 0u64;
            self.proxy
                .try_call("size", &mut [&mut Out::new(&mut size)])
                .await?;
            Ok(size)
        })
    }
}

/// Serve `store` as a remote object with `read`, `write` and `size`.
pub fn store_stub(store: Arc<dyn BackingStore>) -> Stub<Arc<dyn BackingStore>> {
    Stub::new(STORE_CLASS, store)
        .method("read", |store, mut inputs| async move {
            let offset: u64 = inputs.read()?;
            let len = inputs.read::<u32>()? as usize;
            if len > MAX_REMOTE_READ {
                return Err(RmiError::BufferOverflow(len));
            }
            let data = store.read_at(offset, len).await?;
            let mut out = Buffer::with_capacity(data.len() + 4);
            out.write(&data)?;
            Ok(out)
        })
        .method("write", |store, mut inputs| async move {
            let offset: u64 = inputs.read()?;
            let data: Bytes = inputs.read()?;
            store.write_at(offset, data).await?;
            Ok(Buffer::new())
        })
        .method("size", |store, _| async move {
            let mut out = Buffer::new();
            out.write(&store.size().await?)?;
            Ok(out)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmi::ObjectRegistry;
    use crate::transport::{CallHandler, Pipe, PipeConfig, Transport, DEFAULT_MEMORY_CAPACITY};

    #[tokio::test]
    async fn test_memory_store_short_read_at_end() {
        let store = MemoryStore::new(b"0123456789".to_vec());
        assert_eq!(&store.read_at(2, 3).await.unwrap()[..], b"234");
        assert_eq!(&store.read_at(8, 10).await.unwrap()[..], b"89");
        assert!(store.read_at(20, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_write_grows() {
        let store = MemoryStore::new(b"0123".to_vec());
        store.write_at(2, Bytes::from_static(b"abcd")).await.unwrap();
        assert_eq!(store.size().await.unwrap(), 6);
        assert_eq!(&store.read_at(0, 6).await.unwrap()[..], b"01abcd");
    }

    #[tokio::test]
    async fn test_memory_store_rejects_write_past_end() {
        let store = MemoryStore::new(b"0123".to_vec());
        let err = store
            .write_at(5, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RmiError::Io(_)));

        let err = store
            .write_at(u64::MAX - 1, Bytes::from_static(b"abcd"))
            .await
            .unwrap_err();
        assert!(matches!(err, RmiError::Io(_)));
        assert_eq!(store.size().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_file_store_huge_read_len_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path().join("small.bin")).await.unwrap();
        store.write_at(0, Bytes::from_static(b"tiny")).await.unwrap();
        assert_eq!(&store.read_at(0, usize::MAX).await.unwrap()[..], b"tiny");
    }

    /// A remote store over an in-memory pipe pair; keep the server alive.
    fn serve(store: MemoryStore, config: PipeConfig) -> (RemoteStore, Pipe) {
        let registry = ObjectRegistry::new();
        let id = registry.register_object(Arc::new(store_stub(Arc::new(store))));
        let (a, b) = Transport::memory_pair(DEFAULT_MEMORY_CAPACITY);
        let handler: Arc<dyn CallHandler> = registry;
        let client = Arc::new(Pipe::new(a, config.clone(), None));
        let server = Pipe::new(b, config, Some(handler));
        (RemoteStore::new(Proxy::direct(client, id)), server)
    }

    #[tokio::test]
    async fn test_remote_read_splits_into_pieces() {
        let (store, _server) = serve(
            MemoryStore::new(b"0123456789".to_vec()),
            PipeConfig::default(),
        );
        let store = store.with_max_read(4);

        assert_eq!(&store.read_at(1, 8).await.unwrap()[..], b"12345678");
        // The last piece comes back short.
        assert_eq!(&store.read_at(3, 64).await.unwrap()[..], b"3456789");
        assert_eq!(&store.read_at(4, 4).await.unwrap()[..], b"4567");
    }

    #[tokio::test]
    async fn test_stub_refuses_oversized_read_request() {
        let (store, _server) = serve(
            MemoryStore::new(vec![1u8; 16]),
            PipeConfig::default(),
        );
        let err = store
            .read_piece(0, (MAX_REMOTE_READ + 1) as u32)
            .await
            .unwrap_err();
        assert!(matches!(err, RmiError::Remote(_)), "{:?}", err);
        assert_eq!(&store.read_at(0, 16).await.unwrap()[..], &[1u8; 16]);
    }

    #[tokio::test]
    async fn test_stub_rejects_write_overflow() {
        let (store, _server) = serve(
            MemoryStore::new(b"abc".to_vec()),
            PipeConfig::default(),
        );
        assert!(store
            .write_at(u64::MAX, Bytes::from_static(b"zz"))
            .await
            .is_err());
        assert_eq!(store.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.bin");

        let store = FileStore::create(&path).await.unwrap();
        store
            .write_at(0, Bytes::from_static(b"header--payload"))
            .await
            .unwrap();
        assert_eq!(store.size().await.unwrap(), 15);
        drop(store);

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(&store.read_at(8, 7).await.unwrap()[..], b"payload");
        assert_eq!(&store.read_at(12, 100).await.unwrap()[..], b"oad");
    }

    #[tokio::test]
    async fn test_file_store_open_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileStore::open(dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, RmiError::Io(_)));
    }
}
