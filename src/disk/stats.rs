use std::time::Instant;

use crate::{avg::SlidingAvg, PieceIndex};

/// Aggregate counters and once-per-second service time averages, snapshotted
/// by `Disk::get_cache_info`.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Blocks written to storage, cumulative.
    pub blocks_written: u64,
    /// Blocks read from storage, cumulative.
    pub blocks_read: u64,
    /// Blocks served from the cache without touching storage.
    pub blocks_read_hit: u64,
    /// Write syscalls issued. `blocks_written / writes` approximates how
    /// well the flush engine coalesces.
    pub writes: u64,
    /// Read syscalls issued.
    pub reads: u64,
    /// Bytes that had to be read back from storage only to feed a piece
    /// digest (blocks that were flushed and evicted before hashing).
    pub total_read_back: u64,
    /// Microseconds spent in storage calls and hashing, cumulative.
    pub cumulative_read_time: u64,
    pub cumulative_write_time: u64,
    pub cumulative_hash_time: u64,
    pub cumulative_job_time: u64,
    /// Per-operation service time averages in microseconds, refreshed at
    /// most once per second.
    pub average_read_time: i64,
    pub average_write_time: i64,
    pub average_hash_time: i64,
    pub average_job_time: i64,

    // filled from the cache under its mutex
    pub total_used_buffers: usize,
    pub read_cache_blocks: usize,
    pub write_cache_blocks: usize,
    pub pinned_blocks: usize,
    pub num_pieces: usize,
    pub arc_lru1_target: usize,
    pub arc_lru1_pieces: usize,
    pub arc_lru1_ghost_pieces: usize,
    pub arc_lru2_pieces: usize,
    pub arc_lru2_ghost_pieces: usize,
    pub write_lru_pieces: usize,
    pub volatile_pieces: usize,

    // filled from the dispatcher
    pub blocked_jobs: usize,
    pub queued_jobs: usize,
    pub pending_jobs: usize,
}

/// One cached piece in a `CacheInfo` snapshot.
#[derive(Debug, Clone)]
pub struct CachedPieceInfo {
    pub piece: PieceIndex,
    pub last_use: Instant,
    pub need_readback: bool,
    /// The next block the hasher will consume, or `None` when no digest is
    /// in progress.
    pub next_to_hash: Option<usize>,
    pub kind: CachedPieceKind,
    /// Which blocks hold data.
    pub blocks: Vec<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedPieceKind {
    ReadCache,
    WriteCache,
    VolatileReadCache,
}

/// The full snapshot returned by `Disk::get_cache_info`.
#[derive(Debug, Clone, Default)]
pub struct CacheInfo {
    pub stats: CacheStats,
    pub pieces: Vec<CachedPieceInfo>,
}

/// The sampler state owned by the dispatcher, flipped into `CacheStats`
/// averages once per second.
pub(crate) struct StatsState {
    pub(crate) read_time: SlidingAvg,
    pub(crate) write_time: SlidingAvg,
    pub(crate) hash_time: SlidingAvg,
    pub(crate) job_time: SlidingAvg,
    pub(crate) stats: CacheStats,
    pub(crate) last_flip: Instant,
}

impl StatsState {
    pub(crate) fn new() -> Self {
        Self {
            read_time: SlidingAvg::default(),
            write_time: SlidingAvg::default(),
            hash_time: SlidingAvg::default(),
            job_time: SlidingAvg::default(),
            stats: CacheStats::default(),
            last_flip: Instant::now(),
        }
    }

    /// Publishes the current averages into the snapshot counters. Cheap, so
    /// callers just invoke it and the once-per-second limit lives here.
    pub(crate) fn maybe_flip(&mut self) {
        if self.last_flip.elapsed().as_secs() < 1 {
            return;
        }
        self.stats.average_read_time = self.read_time.mean();
        self.stats.average_write_time = self.write_time.mean();
        self.stats.average_hash_time = self.hash_time.mean();
        self.stats.average_job_time = self.job_time.mean();
        self.last_flip = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_is_rate_limited() {
        let mut state = StatsState::new();
        state.read_time.add_sample(100);
        state.maybe_flip();
        // freshly created, the first flip window has not elapsed yet
        assert_eq!(state.stats.average_read_time, 0);

        state.last_flip = Instant::now() - std::time::Duration::from_secs(2);
        state.maybe_flip();
        assert_eq!(state.stats.average_read_time, 100);
    }
}
