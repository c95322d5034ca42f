//! Priority-ordered read scheduling for visible chunks.
//!
//! Every visible chunk waits in a priority set ordered by the iteration
//! that last serviced it (ties by id), so the most overdue chunk is read
//! first. One scheduling pass is:
//!
//! 1. [`StreamCache::begin_read_set`] drains the most overdue chunks and
//!    coalesces their byte ranges into batched reads
//! 2. [`ReadSet::execute`] runs the batches against a [`BackingStore`]
//! 3. [`StreamCache::end_read_set`] hands each chunk its bytes in offset
//!    order and re-queues whatever is still incomplete
//!
//! Chunks that come back incomplete are queued at the current iteration,
//! ahead of untouched chunks of the same age and among themselves in
//! [`most_progressed_first`](super::most_progressed_first) order.
//!
//! The set lock is only held inside `begin_read_set` and `end_read_set`, so
//! [`StreamCache::add_voxel`] and [`StreamCache::remove_voxel`] stay cheap
//! while a pass executes. A chunk removed mid-pass is skipped when the pass
//! ends; its bytes are dropped. A [`ReadSet`] dropped without reaching
//! `end_read_set` (a cancelled pass) puts its chunks back where they were.
//!
//! # Example
//!
//! ```ignore
//! let cache = StreamCache::new(CacheConfig::default());
//! cache.add_voxel(Arc::new(MemoryVoxel::new(1, ByteRange::new(0, 4096))));
//!
//! let mut set = cache.begin_read_set();
//! set.execute(&store).await;
//! let report = cache.end_read_set(set);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::read_state::{InFlightReads, ParallelRead};
use super::store::BackingStore;
use super::voxel::{ByteRange, Voxel, VoxelId};
use crate::error::{RmiError, Result};

/// Default cap on chunks drained per pass.
pub const DEFAULT_MAX_VOXELS_PER_PASS: usize = 64;

/// Default cap on bytes requested per pass.
pub const DEFAULT_MAX_BYTES_PER_PASS: u64 = 16 * 1024 * 1024;

/// Default largest gap bridged when merging ranges.
pub const DEFAULT_COALESCE_GAP: u64 = 4 * 1024;

/// Default cap on one batched read.
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 4 * 1024 * 1024;

/// Streaming cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_voxels_per_pass: usize,
    /// A pass always takes at least one chunk, even a larger one.
    pub max_bytes_per_pass: u64,
    /// Ranges closer than this are read as one batch, gap included.
    pub coalesce_gap: u64,
    pub max_batch_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_voxels_per_pass: DEFAULT_MAX_VOXELS_PER_PASS,
            max_bytes_per_pass: DEFAULT_MAX_BYTES_PER_PASS,
            coalesce_gap: DEFAULT_COALESCE_GAP,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

impl CacheConfig {
    pub fn max_voxels_per_pass(mut self, n: usize) -> Self {
        self.max_voxels_per_pass = n.max(1);
        self
    }

    pub fn max_bytes_per_pass(mut self, n: u64) -> Self {
        self.max_bytes_per_pass = n;
        self
    }

    pub fn coalesce_gap(mut self, n: u64) -> Self {
        self.coalesce_gap = n;
        self
    }

    pub fn max_batch_bytes(mut self, n: u64) -> Self {
        self.max_batch_bytes = n;
        self
    }
}

/// `(last service iteration, rank within that iteration, id)`.
type QueueKey = (u64, u64, VoxelId);

/// Rank of a chunk with no read in progress; sorts after every partial read.
const UNTOUCHED: u64 = u64::MAX;

struct Entry {
    voxel: Arc<dyn Voxel>,
    /// Bumped on every add, so a pass can tell a re-added chunk from the
    /// one it was reading.
    generation: u64,
    /// Position in the priority set; `None` while in flight or resident.
    queued: Option<QueueKey>,
}

#[derive(Default)]
struct State {
    queue: BTreeSet<QueueKey>,
    entries: HashMap<VoxelId, Entry>,
    /// Progress of reads that came back short in earlier passes.
    partial: HashMap<VoxelId, ParallelRead>,
    iteration: u64,
    next_generation: u64,
}

impl State {
    fn enqueue(&mut self, id: VoxelId, key: QueueKey) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(old) = entry.queued.replace(key) {
                self.queue.remove(&old);
            }
            self.queue.insert(key);
        }
    }
}

/// The bytes one chunk wants from this pass.
struct ChunkRead {
    voxel: Arc<dyn Voxel>,
    generation: u64,
    /// Absolute range still missing.
    range: ByteRange,
    /// Where `range` starts inside the chunk.
    chunk_offset: u64,
    tracker: ParallelRead,
    /// Queue position it was drained from.
    key: QueueKey,
}

/// One coalesced read covering several chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRead {
    pub range: ByteRange,
    /// Chunks served by this batch, in offset order.
    pub voxels: Vec<VoxelId>,
    members: Vec<usize>,
}

/// Chunks and batches of one scheduling pass.
///
/// Dropping a set that never reached [`StreamCache::end_read_set`] re-queues
/// its chunks at their old positions with their progress kept.
pub struct ReadSet {
    iteration: u64,
    chunks: Vec<ChunkRead>,
    batches: Vec<BatchRead>,
    results: Vec<Option<Result<Bytes>>>,
    state: Arc<Mutex<State>>,
}

impl ReadSet {
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Chunk ids in the order they were drained.
    pub fn voxels(&self) -> Vec<VoxelId> {
        self.chunks.iter().map(|c| c.voxel.id()).collect()
    }

    pub fn batches(&self) -> &[BatchRead] {
        &self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes the batches will request, gaps included.
    pub fn requested_bytes(&self) -> u64 {
        self.batches.iter().map(|b| b.range.len).sum()
    }

    /// Run every batch against `store`. Failures are kept per batch; the
    /// chunks they cover stay incomplete.
    pub async fn execute(&mut self, store: &dyn BackingStore) {
        for (i, batch) in self.batches.iter().enumerate() {
            let range = batch.range;
            let outcome = match store.read_at(range.offset, range.len as usize).await {
                Ok(bytes) => {
                    if (bytes.len() as u64) < range.len {
                        tracing::debug!(
                            offset = range.offset,
                            requested = range.len,
                            got = bytes.len(),
                            "short batch read"
                        );
                    }
                    Ok(bytes)
                }
                Err(e) => {
                    tracing::warn!(offset = range.offset, len = range.len, error = %e, "batch read failed");
                    Err(RmiError::CacheRead {
                        offset: range.offset,
                        reason: e.to_string(),
                    })
                }
            };
            self.results[i] = Some(outcome);
        }
    }
}

impl Drop for ReadSet {
    fn drop(&mut self) {
        if self.chunks.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let mut restored = 0usize;
        for chunk in self.chunks.drain(..) {
            let id = chunk.voxel.id();
            let live = state
                .entries
                .get(&id)
                .is_some_and(|e| e.generation == chunk.generation && e.queued.is_none());
            if !live {
                continue;
            }
            if chunk.tracker.bytes_read() > 0 {
                state.partial.insert(id, chunk.tracker);
            }
            state.enqueue(id, chunk.key);
            restored += 1;
        }
        drop(state);
        tracing::debug!(iteration = self.iteration, restored, "read set abandoned");
    }
}

impl std::fmt::Debug for ReadSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSet")
            .field("iteration", &self.iteration)
            .field("voxels", &self.voxels())
            .field("batches", &self.batches)
            .finish()
    }
}

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSetReport {
    pub iteration: u64,
    pub batches: usize,
    pub failed_batches: usize,
    pub bytes_read: u64,
    /// Chunks fully loaded, most progressed first.
    pub completed: Vec<VoxelId>,
    /// Chunks still incomplete and queued again.
    pub requeued: Vec<VoxelId>,
    /// Chunks removed while the pass was running.
    pub removed: Vec<VoxelId>,
}

/// Streaming cache scheduler.
pub struct StreamCache {
    config: CacheConfig,
    state: Arc<Mutex<State>>,
}

impl StreamCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Queue a newly visible chunk at its last-service iteration. Returns
    /// `false` if the chunk is already known.
    pub fn add_voxel(&self, voxel: Arc<dyn Voxel>) -> bool {
        let id = voxel.id();
        let key = (voxel.last_service(), UNTOUCHED, id);
        let mut state = self.state.lock();
        if state.entries.contains_key(&id) {
            return false;
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state.entries.insert(
            id,
            Entry {
                voxel,
                generation,
                queued: None,
            },
        );
        state.enqueue(id, key);
        true
    }

    /// Forget a chunk that is no longer visible. A read already in flight
    /// for it is discarded when its pass ends.
    pub fn remove_voxel(&self, id: VoxelId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.remove(&id) else {
            return false;
        };
        if let Some(key) = entry.queued {
            state.queue.remove(&key);
        }
        state.partial.remove(&id);
        true
    }

    /// Queue a resident chunk again, e.g. after its source changed.
    pub fn refresh_voxel(&self, id: VoxelId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(&id) else {
            return false;
        };
        if entry.queued.is_some() {
            return true;
        }
        let key = (entry.voxel.last_service(), UNTOUCHED, id);
        state.enqueue(id, key);
        true
    }

    /// Chunks waiting to be read.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Chunks known to the cache: queued, in flight or resident.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: VoxelId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    /// Iteration of the most recent pass.
    pub fn iteration(&self) -> u64 {
        self.state.lock().iteration
    }

    /// Start a pass: drain the most overdue chunks and batch their reads.
    pub fn begin_read_set(&self) -> ReadSet {
        let mut state = self.state.lock();
        state.iteration += 1;
        let iteration = state.iteration;

        let mut chunks = Vec::new();
        let mut budget = 0u64;
        while chunks.len() < self.config.max_voxels_per_pass {
            let Some(&key) = state.queue.first() else { break };
            let id = key.2;
            let Some(entry) = state.entries.get(&id) else {
                state.queue.remove(&key);
                continue;
            };

            let full = entry.voxel.byte_range();
            let tracker = state
                .partial
                .get(&id)
                .cloned()
                .unwrap_or_else(|| ParallelRead::new(id, full.len));
            let missing = ByteRange::new(full.offset + tracker.bytes_read(), tracker.remaining());
            if !chunks.is_empty() && budget + missing.len > self.config.max_bytes_per_pass {
                break;
            }
            budget += missing.len;

            let chunk = ChunkRead {
                voxel: Arc::clone(&entry.voxel),
                generation: entry.generation,
                range: missing,
                chunk_offset: tracker.bytes_read(),
                tracker,
                key,
            };
            state.queue.remove(&key);
            state.partial.remove(&id);
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.queued = None;
            }
            chunks.push(chunk);
        }
        drop(state);

        let batches = coalesce(&chunks, &self.config);
        tracing::debug!(
            iteration,
            voxels = chunks.len(),
            batches = batches.len(),
            bytes = budget,
            "read set started"
        );
        ReadSet {
            iteration,
            results: batches.iter().map(|_| None).collect(),
            chunks,
            batches,
            state: Arc::clone(&self.state),
        }
    }

    /// Finish a pass: demultiplex batch bytes into chunks, stamp them, and
    /// re-queue the incomplete ones behind everything older.
    pub fn end_read_set(&self, mut set: ReadSet) -> ReadSetReport {
        let iteration = set.iteration;
        let mut chunks = std::mem::take(&mut set.chunks);
        let batches = std::mem::take(&mut set.batches);
        let results = std::mem::take(&mut set.results);
        drop(set);

        let mut report = ReadSetReport {
            iteration,
            batches: batches.len(),
            ..Default::default()
        };

        let mut state = self.state.lock();
        for (batch, result) in batches.iter().zip(results) {
            let bytes = match result {
                Some(Ok(bytes)) => bytes,
                Some(Err(_)) | None => {
                    report.failed_batches += 1;
                    continue;
                }
            };
            report.bytes_read += bytes.len() as u64;

            for &i in &batch.members {
                let chunk = &mut chunks[i];
                let live = state
                    .entries
                    .get(&chunk.voxel.id())
                    .is_some_and(|e| e.generation == chunk.generation);
                if !live {
                    continue;
                }
                let start = (chunk.range.offset - batch.range.offset) as usize;
                let end = (start + chunk.range.len as usize).min(bytes.len());
                if start >= end {
                    continue;
                }
                chunk.voxel.write_data(chunk.chunk_offset, &bytes[start..end]);
                chunk.tracker.add_bytes((end - start) as u64);
            }
        }

        let mut generations = HashMap::with_capacity(chunks.len());
        for chunk in &chunks {
            generations.insert(chunk.voxel.id(), (chunk.generation, Arc::clone(&chunk.voxel)));
        }
        let reads: InFlightReads = chunks.into_iter().map(|c| c.tracker).collect();

        // Popped most progressed first, so the pop order is the rank.
        let mut rank = 0u64;
        for tracker in reads {
            let id = tracker.voxel();
            let Some((generation, voxel)) = generations.remove(&id) else {
                continue;
            };
            let live = state
                .entries
                .get(&id)
                .is_some_and(|e| e.generation == generation);
            if !live {
                report.removed.push(id);
                continue;
            }

            voxel.set_last_service(iteration);
            if tracker.is_complete() {
                report.completed.push(id);
            } else {
                state.partial.insert(id, tracker);
                state.enqueue(id, (iteration, rank, id));
                rank += 1;
                report.requeued.push(id);
            }
        }
        drop(state);

        tracing::debug!(
            iteration,
            completed = report.completed.len(),
            requeued = report.requeued.len(),
            removed = report.removed.len(),
            failed_batches = report.failed_batches,
            "read set finished"
        );
        report
    }

    /// Run one whole pass against `store`.
    pub async fn run_pass(&self, store: &dyn BackingStore) -> ReadSetReport {
        let mut set = self.begin_read_set();
        set.execute(store).await;
        self.end_read_set(set)
    }
}

impl Default for StreamCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for StreamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamCache")
            .field("iteration", &state.iteration)
            .field("voxels", &state.entries.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// Merge chunk ranges that sit within `coalesce_gap` of each other.
fn coalesce(chunks: &[ChunkRead], config: &CacheConfig) -> Vec<BatchRead> {
    let mut order: Vec<usize> = (0..chunks.len())
        .filter(|&i| !chunks[i].range.is_empty())
        .collect();
    order.sort_by_key(|&i| (chunks[i].range.offset, chunks[i].range.len));

    let mut batches: Vec<BatchRead> = Vec::new();
    for i in order {
        let range = chunks[i].range;
        if let Some(batch) = batches.last_mut() {
            let end = batch.range.end().max(range.end());
            let close = range.offset <= batch.range.end().saturating_add(config.coalesce_gap);
            if close && end - batch.range.offset <= config.max_batch_bytes {
                batch.range.len = end - batch.range.offset;
                batch.voxels.push(chunks[i].voxel.id());
                batch.members.push(i);
                continue;
            }
        }
        batches.push(BatchRead {
            range,
            voxels: vec![chunks[i].voxel.id()],
            members: vec![i],
        });
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::cache::voxel::MemoryVoxel;
    use crate::transport::BoxFuture;
    use std::time::Duration;

    fn voxel(id: VoxelId, offset: u64, len: u64, last: u64) -> Arc<MemoryVoxel> {
        Arc::new(MemoryVoxel::with_last_service(id, ByteRange::new(offset, len), last))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_most_overdue_drained_first() {
        let cache = StreamCache::new(CacheConfig::default().max_voxels_per_pass(1));
        cache.add_voxel(voxel(1, 0, 10, 3)); // A
        cache.add_voxel(voxel(2, 100, 10, 1)); // B
        cache.add_voxel(voxel(3, 200, 10, 2)); // C

        let set = cache.begin_read_set();
        assert_eq!(set.voxels(), [2]);
        assert_eq!(cache.queued(), 2);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let cache = StreamCache::default();
        cache.add_voxel(voxel(9, 0, 1, 0));
        cache.add_voxel(voxel(4, 10, 1, 0));
        assert_eq!(cache.begin_read_set().voxels(), [4, 9]);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let cache = StreamCache::default();
        assert!(cache.add_voxel(voxel(1, 0, 10, 0)));
        assert!(!cache.add_voxel(voxel(1, 0, 10, 0)));
        assert_eq!(cache.queued(), 1);
    }

    #[test]
    fn test_byte_budget_takes_at_least_one() {
        let cache = StreamCache::new(CacheConfig::default().max_bytes_per_pass(50));
        cache.add_voxel(voxel(1, 0, 100, 0));
        cache.add_voxel(voxel(2, 100, 10, 1));
        let first = cache.begin_read_set();
        assert_eq!(first.voxels(), [1]);
        assert_eq!(cache.begin_read_set().voxels(), [2]);
    }

    #[test]
    fn test_coalescing() {
        let config = CacheConfig::default().coalesce_gap(8).max_batch_bytes(64);
        let cache = StreamCache::new(config);
        cache.add_voxel(voxel(1, 0, 16, 0));
        cache.add_voxel(voxel(2, 20, 16, 0)); // 4 byte gap: merged
        cache.add_voxel(voxel(3, 100, 16, 0)); // far: own batch
        cache.add_voxel(voxel(4, 116, 60, 0)); // adjacent but over the cap

        let set = cache.begin_read_set();
        let ranges: Vec<_> = set.batches().iter().map(|b| b.range).collect();
        assert_eq!(
            ranges,
            [
                ByteRange::new(0, 36),
                ByteRange::new(100, 16),
                ByteRange::new(116, 60)
            ]
        );
        assert_eq!(set.batches()[0].voxels, [1, 2]);
    }

    #[tokio::test]
    async fn test_pass_demultiplexes_into_chunks() {
        let data = pattern(300);
        let store = MemoryStore::new(data.clone());
        let cache = StreamCache::default();
        let a = voxel(1, 10, 20, 0);
        let b = voxel(2, 40, 30, 0);
        cache.add_voxel(a.clone());
        cache.add_voxel(b.clone());

        let report = cache.run_pass(&store).await;
        assert_eq!(report.batches, 1);
        assert_eq!(report.completed.len(), 2);
        assert!(report.requeued.is_empty());
        assert_eq!(a.data(), &data[10..30]);
        assert_eq!(b.data(), &data[40..70]);
        assert_eq!(a.last_service(), report.iteration);
        assert_eq!(cache.queued(), 0);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_short_read_requeues_and_resumes() {
        // Store ends in the middle of the chunk.
        let store = MemoryStore::new(pattern(50));
        let cache = StreamCache::default();
        let chunk = voxel(1, 40, 20, 0);
        cache.add_voxel(chunk.clone());
        cache.add_voxel(voxel(2, 100_000, 4, 5));

        let report = cache.run_pass(&store).await;
        assert_eq!(report.requeued, [1, 2]);
        assert_eq!(chunk.last_service(), 1);
        assert_eq!(cache.queued(), 2);

        // The rest shows up; the next pass only asks for what is missing.
        store.write_at(50, Bytes::from(vec![7u8; 10])).await.unwrap();
        let mut set = cache.begin_read_set();
        assert_eq!(set.batches()[0].range, ByteRange::new(50, 10));
        set.execute(&store).await;
        let report = cache.end_read_set(set);

        assert!(report.completed.contains(&1));
        let mut expected = pattern(50)[40..50].to_vec();
        expected.extend_from_slice(&[7u8; 10]);
        assert_eq!(chunk.data(), expected);
    }

    struct Failing;

    impl BackingStore for Failing {
        fn read_at(&self, _offset: u64, _len: usize) -> BoxFuture<'_, Result<Bytes>> {
            Box::pin(async { Err(RmiError::ConnectionLost) })
        }

        fn write_at(&self, _offset: u64, _data: Bytes) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn size(&self) -> BoxFuture<'_, Result<u64>> {
            Box::pin(async { Ok(0) })
        }
    }

    /// Returns a fixed number of bytes for each batch offset.
    struct Prefix(HashMap<u64, usize>);

    impl BackingStore for Prefix {
        fn read_at(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Bytes>> {
            let n = self.0.get(&offset).copied().unwrap_or(len).min(len);
            Box::pin(async move { Ok(Bytes::from(vec![1u8; n])) })
        }

        fn write_at(&self, _offset: u64, _data: Bytes) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn size(&self) -> BoxFuture<'_, Result<u64>> {
            Box::pin(async { Ok(0) })
        }
    }

    /// Never finishes a read.
    struct Stalled;

    impl BackingStore for Stalled {
        fn read_at(&self, _offset: u64, _len: usize) -> BoxFuture<'_, Result<Bytes>> {
            Box::pin(std::future::pending())
        }

        fn write_at(&self, _offset: u64, _data: Bytes) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn size(&self) -> BoxFuture<'_, Result<u64>> {
            Box::pin(async { Ok(0) })
        }
    }

    #[tokio::test]
    async fn test_more_progressed_partial_read_drains_first() {
        let cache = StreamCache::new(CacheConfig::default().max_voxels_per_pass(2));
        cache.add_voxel(voxel(1, 0, 100, 0));
        cache.add_voxel(voxel(2, 10_000, 100, 0));
        let store = Prefix(HashMap::from([(0, 10), (10_000, 90)]));

        let report = cache.run_pass(&store).await;
        assert_eq!(report.requeued, [2, 1]);

        // An older chunk still goes first; the 90% read beats the 10% one.
        cache.add_voxel(voxel(3, 20_000, 100, 0));
        let set = cache.begin_read_set();
        assert_eq!(set.voxels(), [3, 2]);
    }

    #[tokio::test]
    async fn test_partial_read_ahead_of_untouched_same_age() {
        let cache = StreamCache::new(CacheConfig::default().max_voxels_per_pass(1));
        cache.add_voxel(voxel(5, 0, 100, 0));
        let store = Prefix(HashMap::from([(0, 40)]));
        let report = cache.run_pass(&store).await;
        assert_eq!(report.requeued, [5]);

        // Same last-service iteration, lower id, nothing read yet.
        cache.add_voxel(voxel(1, 10_000, 100, report.iteration));
        assert_eq!(cache.begin_read_set().voxels(), [5]);
    }

    #[test]
    fn test_dropped_read_set_requeues_chunks() {
        let cache = StreamCache::default();
        cache.add_voxel(voxel(1, 0, 8, 0));
        cache.add_voxel(voxel(2, 8, 8, 3));

        drop(cache.begin_read_set());
        assert_eq!(cache.queued(), 2);
        assert_eq!(cache.begin_read_set().voxels(), [1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_pass_keeps_progress() {
        let store = MemoryStore::new(pattern(50));
        let cache = StreamCache::default();
        let chunk = voxel(1, 40, 20, 0);
        cache.add_voxel(chunk.clone());
        let report = cache.run_pass(&store).await;
        assert_eq!(report.requeued, [1]);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), cache.run_pass(&Stalled)).await;
        assert!(cancelled.is_err());
        assert_eq!(cache.queued(), 1);

        // Only the missing tail is asked for once the pass is retried.
        let set = cache.begin_read_set();
        assert_eq!(set.batches()[0].range, ByteRange::new(50, 10));
    }

    #[tokio::test]
    async fn test_failed_read_keeps_chunk_queued() {
        let cache = StreamCache::default();
        cache.add_voxel(voxel(1, 0, 8, 0));

        let report = cache.run_pass(&Failing).await;
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.requeued, [1]);
        assert_eq!(cache.queued(), 1);
    }

    #[tokio::test]
    async fn test_removed_during_pass_is_ignored() {
        let store = MemoryStore::new(pattern(64));
        let cache = StreamCache::default();
        let gone = voxel(1, 0, 8, 0);
        cache.add_voxel(gone.clone());
        cache.add_voxel(voxel(2, 8, 8, 0));

        let mut set = cache.begin_read_set();
        assert!(cache.remove_voxel(1));
        set.execute(&store).await;
        let report = cache.end_read_set(set);

        assert_eq!(report.removed, [1]);
        assert_eq!(report.completed, [2]);
        assert_eq!(gone.data(), vec![0u8; 8]);
        assert!(!cache.contains(1));
        assert_eq!(cache.queued(), 0);
    }

    #[tokio::test]
    async fn test_readded_during_pass_is_a_new_chunk() {
        let store = MemoryStore::new(pattern(64));
        let cache = StreamCache::default();
        cache.add_voxel(voxel(1, 0, 8, 0));

        let mut set = cache.begin_read_set();
        cache.remove_voxel(1);
        let fresh = voxel(1, 0, 8, 0);
        assert!(cache.add_voxel(fresh.clone()));
        set.execute(&store).await;
        let report = cache.end_read_set(set);

        assert_eq!(report.removed, [1]);
        assert_eq!(cache.queued(), 1);
        assert_eq!(fresh.data(), vec![0u8; 8]);
    }

    #[test]
    fn test_refresh_requeues_resident_chunk() {
        let cache = StreamCache::default();
        assert!(!cache.refresh_voxel(1));
        cache.add_voxel(voxel(1, 0, 0, 0));
        let report = cache.end_read_set(cache.begin_read_set());
        assert_eq!(report.completed, [1]);
        assert_eq!(cache.queued(), 0);

        assert!(cache.refresh_voxel(1));
        assert_eq!(cache.queued(), 1);
    }
}
