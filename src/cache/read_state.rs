//! Progress tracking for in-flight chunk reads.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::voxel::VoxelId;

/// Progress of one chunk read, possibly spanning several passes.
///
/// Completeness latches: once `bytes_read` reaches `requested` the read
/// stays complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelRead {
    voxel: VoxelId,
    requested: u64,
    bytes_read: u64,
    items: u32,
    complete: bool,
}

impl ParallelRead {
    pub fn new(voxel: VoxelId, requested: u64) -> Self {
        Self {
            voxel,
            requested,
            bytes_read: 0,
            items: 0,
            complete: requested == 0,
        }
    }

    pub fn voxel(&self) -> VoxelId {
        self.voxel
    }

    pub fn requested(&self) -> u64 {
        self.requested
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Number of pieces that have arrived.
    pub fn items(&self) -> u32 {
        self.items
    }

    /// Bytes still missing.
    pub fn remaining(&self) -> u64 {
        self.requested.saturating_sub(self.bytes_read)
    }

    /// Record `n` more bytes. Returns `true` on the call that completes it.
    pub fn add_bytes(&mut self, n: u64) -> bool {
        if n == 0 {
            return false;
        }
        self.bytes_read = self.bytes_read.saturating_add(n);
        self.items += 1;
        if !self.complete && self.bytes_read >= self.requested {
            self.complete = true;
            return true;
        }
        false
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Service order for in-flight reads: the read furthest along comes first.
///
/// Progress is `bytes_read / requested`. Equal progress falls back to fewer
/// remaining bytes, then to the chunk id.
pub fn most_progressed_first(a: &ParallelRead, b: &ParallelRead) -> Ordering {
    let progress = |r: &ParallelRead| {
        (
            r.bytes_read.min(r.requested) as u128,
            r.requested.max(1) as u128,
        )
    };
    let (a_read, a_req) = progress(a);
    let (b_read, b_req) = progress(b);
    // a_read / a_req > b_read / b_req  <=>  a_read * b_req > b_read * a_req
    (b_read * a_req)
        .cmp(&(a_read * b_req))
        .then_with(|| a.remaining().cmp(&b.remaining()))
        .then_with(|| a.voxel.cmp(&b.voxel))
}

/// Heap entry ordered so the max is the most progressed read.
#[derive(Debug)]
struct Ranked(ParallelRead);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        most_progressed_first(&self.0, &other.0).reverse()
    }
}

/// In-flight reads, popped most progressed first.
#[derive(Debug, Default)]
pub struct InFlightReads {
    heap: BinaryHeap<Ranked>,
}

impl InFlightReads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, read: ParallelRead) {
        self.heap.push(Ranked(read));
    }

    pub fn pop(&mut self) -> Option<ParallelRead> {
        self.heap.pop().map(|r| r.0)
    }

    pub fn peek(&self) -> Option<&ParallelRead> {
        self.heap.peek().map(|r| &r.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl FromIterator<ParallelRead> for InFlightReads {
    fn from_iter<I: IntoIterator<Item = ParallelRead>>(iter: I) -> Self {
        Self {
            heap: iter.into_iter().map(Ranked).collect(),
        }
    }
}

impl Iterator for InFlightReads {
    type Item = ParallelRead;

    fn next(&mut self) -> Option<ParallelRead> {
        self.pop()
    }
}
