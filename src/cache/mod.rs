//! Out-of-core streaming cache.
//!
//! Keeps a bounded set of visible chunks ([`Voxel`]s) loaded from a
//! [`BackingStore`], servicing the most overdue ones first:
//! - [`StreamCache`] - priority set and read-set passes
//! - [`ParallelRead`] / [`InFlightReads`] - read progress tracking
//! - [`FileStore`], [`MemoryStore`], [`RemoteStore`] - stores

mod read_state;
mod scheduler;
mod store;
mod voxel;

pub use read_state::{most_progressed_first, InFlightReads, ParallelRead};
pub use scheduler::{
    BatchRead, CacheConfig, ReadSet, ReadSetReport, StreamCache, DEFAULT_COALESCE_GAP,
    DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BYTES_PER_PASS, DEFAULT_MAX_VOXELS_PER_PASS,
};
pub use store::{store_stub, BackingStore, FileStore, MemoryStore, RemoteStore, STORE_CLASS};
pub use voxel::{ByteRange, MemoryVoxel, Voxel, VoxelId};
