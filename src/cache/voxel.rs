//! Streamable spatial chunks.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Chunk identifier, unique within one cache.
pub type VoxelId = u64;

/// A contiguous range in the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A chunk the cache can stream into.
///
/// Implementations are shared between the code that decides visibility and
/// the cache, so every method takes `&self`.
pub trait Voxel: Send + Sync {
    fn id(&self) -> VoxelId;

    /// Where the chunk's bytes live in the backing store.
    fn byte_range(&self) -> ByteRange;

    /// Iteration of the scheduling pass that last serviced this chunk.
    fn last_service(&self) -> u64;

    fn set_last_service(&self, iteration: u64);

    /// Store `data` at `offset` bytes into the chunk.
    fn write_data(&self, offset: u64, data: &[u8]);
}

/// Voxel that keeps its bytes in memory.
#[derive(Debug)]
pub struct MemoryVoxel {
    id: VoxelId,
    range: ByteRange,
    last_service: AtomicU64,
    data: Mutex<Vec<u8>>,
}

impl MemoryVoxel {
    pub fn new(id: VoxelId, range: ByteRange) -> Self {
        Self::with_last_service(id, range, 0)
    }

    pub fn with_last_service(id: VoxelId, range: ByteRange, last_service: u64) -> Self {
        Self {
            id,
            range,
            last_service: AtomicU64::new(last_service),
            data: Mutex::new(vec![0; range.len as usize]),
        }
    }

    /// Copy of the chunk's bytes.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl Voxel for MemoryVoxel {
    fn id(&self) -> VoxelId {
        self.id
    }

    fn byte_range(&self) -> ByteRange {
        self.range
    }

    fn last_service(&self) -> u64 {
        self.last_service.load(Ordering::Acquire)
    }

    fn set_last_service(&self, iteration: u64) {
        self.last_service.store(iteration, Ordering::Release);
    }

    fn write_data(&self, offset: u64, data: &[u8]) {
        let mut buf = self.data.lock();
        let start = (offset as usize).min(buf.len());
        let end = (start + data.len()).min(buf.len());
        buf[start..end].copy_from_slice(&data[..end - start]);
    }
}
