//! The multi-threaded block cache.
//!
//! Cached pieces live in one of six lists: a write LRU for dirty pieces, two
//! read LRUs (recency and frequency) with a ghost shadow list each, and a
//! volatile list for one-off reads. Ghost entries retain only the piece
//! header; a hit on one grows the dynamic size target of its queue at the
//! expense of the other, which is what adapts the split between the two read
//! queues to the access pattern.
//!
//! All state here is guarded by the single cache mutex in the disk handle.
//! Methods never perform I/O; they pin the blocks a storage call needs via
//! reference counts so the caller can release the mutex for the call itself.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Instant,
};

use sha1::{Digest, Sha1};

use crate::{
    blockinfo::{BlockData, CachedBlock},
    disk::buffer::{BufferPool, PoolBuf},
    disk::job::{Action, BlockCacheRef, Job, FORCE_COPY},
    disk::stats::{CacheStats, CachedPieceInfo, CachedPieceKind},
    error::JobError,
    iovecs::IoVec,
    storage::StorageHandle,
    PieceIndex, Sha1Hash, StorageId,
};

pub(crate) type PieceKey = (StorageId, PieceIndex);

/// Which list a cached piece currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheState {
    WriteLru,
    ReadLru1,
    ReadLru1Ghost,
    ReadLru2,
    ReadLru2Ghost,
    VolatileReadLru,
}

impl CacheState {
    pub(crate) fn is_ghost(self) -> bool {
        matches!(self, CacheState::ReadLru1Ghost | CacheState::ReadLru2Ghost)
    }
}

/// Why a block is pinned. A pinned block cannot be overwritten and its
/// buffer cannot be freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockRefReason {
    /// Inside a vectored write.
    Flushing,
    /// Feeding a piece digest.
    Hashing,
    /// Retained by a peer session until reclaimed.
    Reading,
}

#[derive(Default)]
struct BlockEntry {
    buf: Option<CachedBlock>,
    /// Written by a peer, not yet on disk.
    dirty: bool,
    /// Currently inside a write syscall.
    pending: bool,
    flushing_refs: u16,
    hashing_refs: u16,
    reading_refs: u16,
}

impl BlockEntry {
    fn refcount(&self) -> usize {
        self.flushing_refs as usize
            + self.hashing_refs as usize
            + self.reading_refs as usize
    }

    fn pinned(&self) -> bool {
        self.refcount() > 0
    }
}

/// Incremental digest over a piece's blocks, in order.
#[derive(Clone)]
pub(crate) struct PartialHash {
    pub(crate) hasher: Sha1,
    /// Bytes consumed so far. Always a multiple of the block size except
    /// when equal to the piece size.
    pub(crate) offset: usize,
}

impl PartialHash {
    pub(crate) fn new() -> Self {
        Self {
            hasher: Sha1::new(),
            offset: 0,
        }
    }

    pub(crate) fn digest(&self) -> Sha1Hash {
        self.hasher.clone().finalize().into()
    }
}

impl std::fmt::Debug for PartialHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialHash")
            .field("offset", &self.offset)
            .finish()
    }
}

/// The unit of caching: one piece of one torrent.
pub(crate) struct CachedPieceEntry {
    pub(crate) storage: StorageHandle,
    pub(crate) piece: PieceIndex,
    blocks: Box<[BlockEntry]>,
    /// Partial digest state. Freed once the digest has been finalized and
    /// reported.
    pub(crate) hash: Option<PartialHash>,
    /// Dirty blocks, whether or not they are inside a write call.
    pub(crate) num_dirty: usize,
    /// Blocks with a live buffer.
    pub(crate) num_blocks: usize,
    /// Pins the entry against eviction while non-zero.
    pub(crate) piece_refcount: usize,
    /// A worker is advancing the digest right now.
    pub(crate) hashing: bool,
    /// The digest covered the full piece and has been reported.
    pub(crate) hashing_done: bool,
    /// A block below the hash cursor was rewritten; the digest must restart
    /// from data read back from storage.
    pub(crate) need_readback: bool,
    /// A flush_hashed job is queued for this piece. At most one at a time.
    pub(crate) outstanding_flush: bool,
    /// The piece should be dropped as soon as the last pin goes away.
    pub(crate) marked_for_deletion: bool,
    /// Last use, orders the write LRU for expiry sweeps.
    pub(crate) expire: Instant,
    pub(crate) cache_state: CacheState,
    /// I/O jobs suspended on this piece: writes waiting to be flushed, hash
    /// jobs waiting for the digest to finish.
    pub(crate) jobs: Vec<Job>,
}

impl CachedPieceEntry {
    fn new(storage: StorageHandle, piece: PieceIndex, state: CacheState) -> Self {
        let blocks_in_piece = storage.blocks_in_piece(piece);
        let mut blocks = Vec::with_capacity(blocks_in_piece);
        blocks.resize_with(blocks_in_piece, BlockEntry::default);
        Self {
            storage,
            piece,
            blocks: blocks.into_boxed_slice(),
            hash: None,
            num_dirty: 0,
            num_blocks: 0,
            piece_refcount: 0,
            hashing: false,
            hashing_done: false,
            need_readback: false,
            outstanding_flush: false,
            marked_for_deletion: false,
            expire: Instant::now(),
            cache_state: state,
            jobs: Vec::new(),
        }
    }

    pub(crate) fn blocks_in_piece(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn piece_len(&self) -> u32 {
        self.storage.piece_len(self.piece)
    }

    pub(crate) fn block_present(&self, index: usize) -> bool {
        self.blocks.get(index).map_or(false, |b| b.buf.is_some())
    }

    pub(crate) fn block_buf(&self, index: usize) -> Option<CachedBlock> {
        self.blocks.get(index).and_then(|b| b.buf.clone())
    }

    pub(crate) fn block_dirty(&self, index: usize) -> bool {
        self.blocks[index].dirty
    }

    pub(crate) fn block_pending(&self, index: usize) -> bool {
        self.blocks[index].pending
    }

    /// Dirty blocks in `[0, end)` that are not already inside a write call.
    pub(crate) fn num_flushable(&self, end: usize) -> usize {
        self.blocks[..end.min(self.blocks.len())]
            .iter()
            .filter(|b| b.dirty && !b.pending)
            .count()
    }

    fn pinned_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.pinned()).count()
    }

    fn any_pinned_or_pending(&self) -> bool {
        self.blocks.iter().any(|b| b.pinned() || b.pending)
    }

    /// The hash cursor in blocks, rounded up to cover a short last block.
    pub(crate) fn hash_cursor_blocks(&self, block_size: usize) -> usize {
        match &self.hash {
            Some(ph) => (ph.offset + block_size - 1) / block_size,
            None => 0,
        }
    }
}

impl std::fmt::Debug for CachedPieceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPieceEntry")
            .field("piece", &self.piece)
            .field("state", &self.cache_state)
            .field("num_blocks", &self.num_blocks)
            .field("num_dirty", &self.num_dirty)
            .field("refcount", &self.piece_refcount)
            .finish()
    }
}

/// The outcome of a cache read probe.
#[derive(Debug)]
pub(crate) enum TryReadResult {
    /// All requested bytes were served; the job's buffer is filled.
    Hit(usize),
    /// At least one block is missing from the cache.
    Miss,
    /// The blocks are cached but no buffer could be allocated for the copy.
    NoMemory,
}

pub(crate) struct BlockCache {
    block_size: usize,
    pool: BufferPool,
    /// Total cached block budget, from the settings snapshot.
    max_blocks: usize,
    pieces: HashMap<PieceKey, CachedPieceEntry>,
    /// Piece indices cached per storage, for fast invalidation.
    storages: HashMap<StorageId, HashSet<PieceIndex>>,
    write_lru: VecDeque<PieceKey>,
    read_lru1: VecDeque<PieceKey>,
    read_lru1_ghost: VecDeque<PieceKey>,
    read_lru2: VecDeque<PieceKey>,
    read_lru2_ghost: VecDeque<PieceKey>,
    volatile_lru: VecDeque<PieceKey>,
    /// Dynamic block budget of the recency queue, adapted by ghost hits.
    lru1_target: usize,
}

impl BlockCache {
    pub(crate) fn new(pool: BufferPool) -> Self {
        let block_size = pool.block_size();
        let max_blocks = pool.limit();
        Self {
            block_size,
            pool,
            max_blocks,
            pieces: HashMap::new(),
            storages: HashMap::new(),
            write_lru: VecDeque::new(),
            read_lru1: VecDeque::new(),
            read_lru1_ghost: VecDeque::new(),
            read_lru2: VecDeque::new(),
            read_lru2_ghost: VecDeque::new(),
            volatile_lru: VecDeque::new(),
            lru1_target: max_blocks / 2,
        }
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub(crate) fn set_cache_size(&mut self, blocks: usize) {
        self.max_blocks = blocks;
        self.pool.set_limit(blocks);
        self.lru1_target = self.lru1_target.min(blocks / 2);
    }

    fn list(&mut self, state: CacheState) -> &mut VecDeque<PieceKey> {
        match state {
            CacheState::WriteLru => &mut self.write_lru,
            CacheState::ReadLru1 => &mut self.read_lru1,
            CacheState::ReadLru1Ghost => &mut self.read_lru1_ghost,
            CacheState::ReadLru2 => &mut self.read_lru2,
            CacheState::ReadLru2Ghost => &mut self.read_lru2_ghost,
            CacheState::VolatileReadLru => &mut self.volatile_lru,
        }
    }

    fn unlink(&mut self, state: CacheState, key: PieceKey) {
        let list = self.list(state);
        if let Some(pos) = list.iter().position(|k| *k == key) {
            list.remove(pos);
        }
    }

    /// Moves the entry to the MRU end of `state`'s list and records the new
    /// state on the entry.
    fn relink(&mut self, key: PieceKey, state: CacheState) {
        let old = self.pieces[&key].cache_state;
        self.unlink(old, key);
        self.list(state).push_back(key);
        if let Some(pe) = self.pieces.get_mut(&key) {
            pe.cache_state = state;
        }
    }

    pub(crate) fn find_piece(&self, key: PieceKey) -> Option<&CachedPieceEntry> {
        self.pieces.get(&key)
    }

    pub(crate) fn find_piece_mut(
        &mut self,
        key: PieceKey,
    ) -> Option<&mut CachedPieceEntry> {
        self.pieces.get_mut(&key)
    }

    /// Whether the piece is cached with actual block storage (not a ghost).
    pub(crate) fn has_live_piece(&self, key: PieceKey) -> bool {
        self.pieces
            .get(&key)
            .map_or(false, |pe| !pe.cache_state.is_ghost())
    }

    /// Finds or creates the entry for `piece`, reviving a ghost header if one
    /// is left from an earlier eviction. Returns `None` if the piece index is
    /// outside the torrent.
    pub(crate) fn allocate_piece(
        &mut self,
        storage: &StorageHandle,
        piece: PieceIndex,
        state: CacheState,
    ) -> Option<PieceKey> {
        if piece >= storage.info().piece_count {
            return None;
        }
        let key = (storage.id(), piece);

        if let Some(pe) = self.pieces.get(&key) {
            match pe.cache_state {
                CacheState::ReadLru1Ghost => {
                    // the recency queue evicted something we needed again:
                    // grow its share of the cache
                    let blocks = pe.blocks_in_piece();
                    self.lru1_target =
                        (self.lru1_target + blocks).min(self.max_blocks / 2);
                    self.relink(key, CacheState::ReadLru2);
                }
                CacheState::ReadLru2Ghost => {
                    let blocks = self.pieces[&key].blocks_in_piece();
                    self.lru1_target = self.lru1_target.saturating_sub(blocks);
                    self.relink(key, CacheState::ReadLru2);
                }
                _ => {}
            }
            return Some(key);
        }

        let entry = CachedPieceEntry::new(Arc::clone(storage), piece, state);
        self.pieces.insert(key, entry);
        self.storages.entry(storage.id()).or_default().insert(piece);
        self.list(state).push_back(key);
        Some(key)
    }

    /// Registers a hit on a live entry: recency promotes to frequency, and
    /// the entry becomes the most recently used of its list.
    pub(crate) fn cache_hit(&mut self, key: PieceKey) {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return;
        };
        pe.expire = Instant::now();
        let state = match pe.cache_state {
            CacheState::ReadLru1 => CacheState::ReadLru2,
            state if state.is_ghost() => return,
            state => state,
        };
        self.relink(key, state);
    }

    /// Serves a read request from cached blocks.
    ///
    /// A request that exactly spans one whole cached block is served
    /// zero-copy (unless the job asks for a copy): the block is pinned with a
    /// reading reference and the job receives a cache handle to reclaim
    /// later. Anything else is copied into a fresh pool buffer.
    pub(crate) fn try_read(&mut self, job: &mut Job) -> TryReadResult {
        let Some(storage) = job.storage.clone() else {
            return TryReadResult::Miss;
        };
        let key = (storage.id(), job.piece);
        let block_size = self.block_size;

        let Some(pe) = self.pieces.get_mut(&key) else {
            return TryReadResult::Miss;
        };
        if pe.cache_state.is_ghost() {
            return TryReadResult::Miss;
        }

        let offset = job.offset as usize;
        let len = job.buffer_size as usize;
        let piece_len = pe.piece_len() as usize;
        if len == 0 || offset + len > piece_len {
            return TryReadResult::Miss;
        }
        let first_block = offset / block_size;
        let last_block = (offset + len - 1) / block_size;
        if !(first_block..=last_block).all(|i| pe.blocks[i].buf.is_some()) {
            return TryReadResult::Miss;
        }

        let block_len = block_size.min(piece_len - first_block * block_size);
        let whole_block = first_block == last_block
            && offset % block_size == 0
            && len == block_len;

        if whole_block && job.flags & FORCE_COPY == 0 {
            let block = &mut pe.blocks[first_block];
            block.reading_refs += 1;
            job.buffer = Some(BlockData::Cached(
                block.buf.as_ref().map(Arc::clone).unwrap(),
            ));
            job.cache_ref = Some(BlockCacheRef {
                storage: key.0,
                piece: key.1,
                block: first_block,
            });
        } else {
            let Some(mut out) = self.pool.allocate("send buffer") else {
                return TryReadResult::NoMemory;
            };
            out.truncate(len);
            let mut copied = 0;
            for i in first_block..=last_block {
                let buf = self.pieces[&key].blocks[i].buf.as_ref().unwrap();
                let block_start = i * block_size;
                let from = offset.max(block_start) - block_start;
                let to = (offset + len).min(block_start + buf.len()) - block_start;
                out.as_mut_slice()[copied..copied + (to - from)]
                    .copy_from_slice(&buf.as_slice()[from..to]);
                copied += to - from;
            }
            debug_assert_eq!(copied, len);
            job.buffer = Some(BlockData::Owned(out));
        }

        self.cache_hit(key);
        self.check_invariant();
        TryReadResult::Hit(len)
    }

    /// Inserts a peer-written block and suspends the write job on the piece
    /// until its block is flushed. The job is handed back on rejection so the
    /// caller can fall through to an uncached write.
    pub(crate) fn add_dirty_block(&mut self, mut job: Job) -> Result<PieceKey, Job> {
        let Some(storage) = job.storage.clone() else {
            return Err(job);
        };
        let block_size = self.block_size;
        let piece = job.piece;
        let state = CacheState::WriteLru;

        let Some(key) = self.allocate_piece(&storage, piece, state) else {
            return Err(job);
        };
        let block = job.offset as usize / block_size;

        let pe = self.pieces.get_mut(&key).unwrap();
        if pe.marked_for_deletion || pe.hashing_done {
            // a piece being torn down or already verified must be cleared
            // before accepting new data
            return Err(job);
        }
        if block >= pe.blocks_in_piece() {
            return Err(job);
        }
        if pe.blocks[block].pending || pe.blocks[block].pinned() {
            return Err(job);
        }

        let data = match &mut job.action {
            Action::Write { data } => match data.take() {
                Some(data) => data,
                None => return Err(job),
            },
            _ => return Err(job),
        };

        let slot = &mut pe.blocks[block];
        let replaced_dirty = slot.dirty;
        let was_present = slot.buf.is_some();
        slot.buf = Some(Arc::new(data));
        slot.dirty = true;
        slot.pending = false;
        if !was_present {
            pe.num_blocks += 1;
        }
        if !replaced_dirty {
            pe.num_dirty += 1;
        }

        // a rewrite below the hash cursor invalidates the running digest;
        // the next hash pass re-reads the piece from storage
        if let Some(ph) = &pe.hash {
            if ph.offset > block * block_size && !pe.hashing {
                pe.hash = None;
                pe.need_readback = true;
            }
        }

        pe.expire = Instant::now();
        pe.jobs.push(job);
        self.relink(key, CacheState::WriteLru);
        self.check_invariant();
        Ok(key)
    }

    /// Fills empty block slots from freshly read buffers. Slots that already
    /// hold data keep it; the incoming buffer is dropped.
    pub(crate) fn insert_blocks(
        &mut self,
        key: PieceKey,
        first_block: usize,
        bufs: Vec<PoolBuf>,
    ) -> usize {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return 0;
        };
        let mut inserted = 0;
        for (i, buf) in bufs.into_iter().enumerate() {
            let index = first_block + i;
            if index >= pe.blocks_in_piece() {
                break;
            }
            let slot = &mut pe.blocks[index];
            if slot.buf.is_none() {
                slot.buf = Some(Arc::new(buf));
                pe.num_blocks += 1;
                inserted += 1;
            }
        }
        pe.expire = Instant::now();
        self.check_invariant();
        inserted
    }

    pub(crate) fn inc_block_refcount(
        &mut self,
        key: PieceKey,
        block: usize,
        reason: BlockRefReason,
    ) {
        let pe = self.pieces.get_mut(&key).expect("refcount on evicted piece");
        let entry = &mut pe.blocks[block];
        debug_assert!(entry.buf.is_some());
        match reason {
            BlockRefReason::Flushing => entry.flushing_refs += 1,
            BlockRefReason::Hashing => entry.hashing_refs += 1,
            BlockRefReason::Reading => entry.reading_refs += 1,
        }
    }

    #[must_use]
    pub(crate) fn dec_block_refcount(
        &mut self,
        key: PieceKey,
        block: usize,
        reason: BlockRefReason,
    ) -> Vec<Job> {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return Vec::new();
        };
        let entry = &mut pe.blocks[block];
        match reason {
            BlockRefReason::Flushing => entry.flushing_refs -= 1,
            BlockRefReason::Hashing => entry.hashing_refs -= 1,
            BlockRefReason::Reading => {
                entry.reading_refs = entry.reading_refs.saturating_sub(1)
            }
        }
        if !entry.pinned() {
            return self.update_cache_state(key);
        }
        Vec::new()
    }

    /// Returns a peer-held read reference. Any jobs freed by a deferred
    /// piece removal are handed back for the caller to abort.
    #[must_use]
    pub(crate) fn reclaim_block(&mut self, r: BlockCacheRef) -> Vec<Job> {
        self.dec_block_refcount(
            (r.storage, r.piece),
            r.block,
            BlockRefReason::Reading,
        )
    }

    /// Builds the iovec for flushing dirty blocks in `[start, end)` of this
    /// piece. Selected blocks become pending and take a flushing reference.
    /// `block_base_index` is added to the global block indices written to
    /// `indices`, which lets one flush span multiple adjacent pieces.
    pub(crate) fn build_iovec(
        &mut self,
        key: PieceKey,
        start: usize,
        end: usize,
        block_base_index: usize,
        iov: &mut Vec<IoVec>,
        indices: &mut Vec<usize>,
    ) -> usize {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return 0;
        };
        let end = end.min(pe.blocks_in_piece());
        let piece_len = pe.piece_len() as usize;
        let block_size = self.block_size;

        let mut produced = 0;
        for i in start..end {
            let slot = &mut pe.blocks[i];
            // skip empty slots (read cache), clean blocks and blocks already
            // inside a write call
            if slot.buf.is_none() || slot.pending || !slot.dirty {
                continue;
            }
            let len = block_size.min(piece_len - i * block_size);
            slot.pending = true;
            slot.flushing_refs += 1;
            iov.push(IoVec::bounded(
                slot.buf.as_ref().map(Arc::clone).unwrap(),
                len,
            ));
            indices.push(i + block_base_index);
            produced += 1;
        }
        produced
    }

    /// Restores block state after a vectored write: pending clears, and on
    /// success the blocks become clean. On failure dirty bits survive so a
    /// later flush retries them.
    pub(crate) fn blocks_flushed(
        &mut self,
        key: PieceKey,
        indices: &[usize],
        success: bool,
    ) {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return;
        };
        for &i in indices {
            let slot = &mut pe.blocks[i];
            debug_assert!(slot.pending);
            slot.pending = false;
            slot.flushing_refs = slot.flushing_refs.saturating_sub(1);
            if success && slot.dirty {
                slot.dirty = false;
                pe.num_dirty -= 1;
            }
        }
        self.check_invariant();
    }

    /// Completes write jobs whose block is now clean. With an error, every
    /// suspended job fails; the piece's fate is then up to the caller.
    pub(crate) fn take_finished_write_jobs(
        &mut self,
        key: PieceKey,
        error: Option<&JobError>,
    ) -> Vec<Job> {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return Vec::new();
        };
        if let Some(error) = error {
            let mut jobs: Vec<Job> = pe.jobs.drain(..).collect();
            for job in &mut jobs {
                job.fail(error.clone());
            }
            return jobs;
        }

        let block_size = self.block_size;
        let mut finished = Vec::new();
        let mut remaining = Vec::new();
        for mut job in pe.jobs.drain(..) {
            let done = match &job.action {
                Action::Write { .. } => {
                    let block = job.offset as usize / block_size;
                    let slot = &pe.blocks[block];
                    !slot.dirty && !slot.pending
                }
                _ => false,
            };
            if done {
                job.ret = job.buffer_size as i32;
                finished.push(job);
            } else {
                remaining.push(job);
            }
        }
        pe.jobs = remaining;
        finished
    }

    /// Frees all of a piece's buffers and removes or ghosts the header.
    /// Fails when anything still pins the piece. Suspended jobs are handed
    /// back for the caller to abort.
    pub(crate) fn evict_piece(&mut self, key: PieceKey) -> (bool, Vec<Job>) {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return (false, Vec::new());
        };
        if pe.piece_refcount > 0 || pe.hashing || pe.any_pinned_or_pending() {
            return (false, Vec::new());
        }

        for slot in pe.blocks.iter_mut() {
            slot.buf = None;
            slot.dirty = false;
            slot.pending = false;
        }
        pe.num_blocks = 0;
        pe.num_dirty = 0;
        pe.hash = None;
        pe.outstanding_flush = false;
        let jobs = std::mem::take(&mut pe.jobs);
        let state = pe.cache_state;
        let deleting = pe.marked_for_deletion;

        match state {
            CacheState::ReadLru1 if !deleting => {
                self.relink(key, CacheState::ReadLru1Ghost);
                self.trim_ghosts();
            }
            CacheState::ReadLru2 if !deleting => {
                self.relink(key, CacheState::ReadLru2Ghost);
                self.trim_ghosts();
            }
            state => {
                self.unlink(state, key);
                self.remove_entry(key);
            }
        }
        self.check_invariant();
        (true, jobs)
    }

    fn remove_entry(&mut self, key: PieceKey) {
        self.pieces.remove(&key);
        if let Some(set) = self.storages.get_mut(&key.0) {
            set.remove(&key.1);
            if set.is_empty() {
                self.storages.remove(&key.0);
            }
        }
    }

    /// Ghost lists only carry headers; keep them from growing without bound.
    fn trim_ghosts(&mut self) {
        let limit = (self.max_blocks / 8).max(8);
        for state in [CacheState::ReadLru1Ghost, CacheState::ReadLru2Ghost] {
            while self.list(state).len() > limit {
                let key = self.list(state).pop_front().unwrap();
                self.remove_entry(key);
            }
        }
    }

    /// Flags the piece to be dropped without flushing. If nothing pins it
    /// the entry disappears immediately, otherwise the removal happens when
    /// the last reference goes away.
    pub(crate) fn mark_for_deletion(&mut self, key: PieceKey) -> Vec<Job> {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return Vec::new();
        };
        pe.marked_for_deletion = true;
        let (_, jobs) = self.evict_piece(key);
        jobs
    }

    /// Drops dirty blocks without writing them, failing their write jobs.
    /// Used when a torrent's data is being deleted.
    pub(crate) fn abort_dirty(&mut self, key: PieceKey) -> Vec<Job> {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return Vec::new();
        };
        for slot in pe.blocks.iter_mut() {
            if slot.dirty && !slot.pending && !slot.pinned() {
                slot.buf = None;
                slot.dirty = false;
                pe.num_dirty -= 1;
                pe.num_blocks -= 1;
            }
        }
        pe.hash = None;
        pe.hashing_done = false;
        let jobs = std::mem::take(&mut pe.jobs);
        self.check_invariant();
        jobs
    }

    /// How many blocks must be reclaimed to get back under the cache budget,
    /// were `extra` more to be allocated now. The target drops below the
    /// configured limit in proportion to the number of callers waiting on
    /// free buffers, so waiters recover faster.
    pub(crate) fn num_to_evict(&self, extra: usize) -> usize {
        let mut limit = self.max_blocks;
        let waiters = self.pool.num_waiters().min(4);
        limit -= limit * waiters / 8;
        (self.pool.in_use() + extra).saturating_sub(limit)
    }

    /// Walks LRU tails evicting clean read pieces until `num` blocks have
    /// been freed. Returns how many blocks could not be freed. Write pieces
    /// are never touched here; they get flushed first and migrate to the
    /// read side on their own.
    pub(crate) fn try_evict_blocks(&mut self, mut num: usize) -> usize {
        if num == 0 {
            return 0;
        }
        // one-off volatile blocks go first, then recency, then frequency
        let order = [
            CacheState::VolatileReadLru,
            CacheState::ReadLru1,
            CacheState::ReadLru2,
        ];

        for state in order {
            if num == 0 {
                break;
            }
            let candidates: Vec<PieceKey> =
                self.list(state).iter().copied().collect();
            for key in candidates {
                if num == 0 {
                    break;
                }
                let Some(pe) = self.pieces.get(&key) else {
                    continue;
                };
                if pe.piece_refcount > 0
                    || pe.hashing
                    || pe.num_dirty > 0
                    || pe.any_pinned_or_pending()
                    || !pe.jobs.is_empty()
                {
                    continue;
                }
                let freed = pe.num_blocks;
                let (evicted, jobs) = self.evict_piece(key);
                debug_assert!(jobs.is_empty());
                if evicted {
                    num = num.saturating_sub(freed);
                }
            }
        }
        num
    }

    fn list_blocks(&self, state: CacheState) -> usize {
        let keys: &VecDeque<PieceKey> = match state {
            CacheState::WriteLru => &self.write_lru,
            CacheState::ReadLru1 => &self.read_lru1,
            CacheState::ReadLru1Ghost => &self.read_lru1_ghost,
            CacheState::ReadLru2 => &self.read_lru2,
            CacheState::ReadLru2Ghost => &self.read_lru2_ghost,
            CacheState::VolatileReadLru => &self.volatile_lru,
        };
        keys.iter().map(|k| self.pieces[k].num_blocks).sum()
    }

    /// Applies deferred state changes once a piece loses its last pin: clean
    /// write pieces join the frequency read list, pieces marked for deletion
    /// disappear. Jobs freed by a deferred removal are returned for the
    /// caller to abort.
    #[must_use]
    pub(crate) fn update_cache_state(&mut self, key: PieceKey) -> Vec<Job> {
        let Some(pe) = self.pieces.get(&key) else {
            return Vec::new();
        };
        if pe.marked_for_deletion && pe.piece_refcount == 0 {
            let (_, jobs) = self.evict_piece(key);
            return jobs;
        }
        if pe.cache_state == CacheState::WriteLru
            && pe.num_dirty == 0
            && pe.jobs.is_empty()
            && !pe.hashing
        {
            // all data persisted, the piece now only serves reads
            self.relink(key, CacheState::ReadLru2);
        }
        Vec::new()
    }

    /// Drains every job suspended on the piece, for aborting.
    #[must_use]
    pub(crate) fn take_jobs(&mut self, key: PieceKey) -> Vec<Job> {
        self.pieces
            .get_mut(&key)
            .map(|pe| std::mem::take(&mut pe.jobs))
            .unwrap_or_default()
    }

    /// Pins the piece against eviction.
    pub(crate) fn pin_piece(&mut self, key: PieceKey) {
        if let Some(pe) = self.pieces.get_mut(&key) {
            debug_assert!(!pe.cache_state.is_ghost());
            pe.piece_refcount += 1;
        }
    }

    /// Drops one pin. When the last pin goes away, deferred state changes
    /// apply; jobs freed by a deferred removal are returned for aborting.
    #[must_use]
    pub(crate) fn unpin_piece(&mut self, key: PieceKey) -> Vec<Job> {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return Vec::new();
        };
        debug_assert!(pe.piece_refcount > 0);
        pe.piece_refcount -= 1;
        if pe.piece_refcount == 0 {
            return self.update_cache_state(key);
        }
        Vec::new()
    }

    /// Attaches fresh digest state to a piece that should be hashed but is
    /// not yet.
    pub(crate) fn ensure_hash(&mut self, key: PieceKey) {
        if let Some(pe) = self.pieces.get_mut(&key) {
            if pe.hash.is_none() && !pe.hashing_done && !pe.hashing {
                pe.hash = Some(PartialHash::new());
            }
        }
    }

    /// Claims the piece's single queued-flush slot. Returns true if the
    /// caller should enqueue a flush_hashed job; at most one is queued per
    /// piece at a time.
    pub(crate) fn claim_flush_slot(&mut self, key: PieceKey) -> bool {
        match self.pieces.get_mut(&key) {
            Some(pe) if !pe.outstanding_flush => {
                pe.outstanding_flush = true;
                true
            }
            _ => false,
        }
    }

    /// Releases the queued-flush slot; called when the flush_hashed job
    /// starts running.
    pub(crate) fn release_flush_slot(&mut self, key: PieceKey) {
        if let Some(pe) = self.pieces.get_mut(&key) {
            pe.outstanding_flush = false;
        }
    }

    /// Blocks still referenced from outside the disk core (peer sessions
    /// that have not reclaimed their read references yet).
    pub(crate) fn pinned_blocks(&self) -> usize {
        self.pieces
            .values()
            .map(CachedPieceEntry::pinned_blocks)
            .sum()
    }

    pub(crate) fn cached_pieces_of(&self, storage: StorageId) -> Vec<PieceIndex> {
        self.storages
            .get(&storage)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn all_piece_keys(&self) -> Vec<PieceKey> {
        self.pieces.keys().copied().collect()
    }

    /// Write-LRU keys in order of last use, oldest first.
    pub(crate) fn write_lru_pieces(&self) -> Vec<PieceKey> {
        self.write_lru.iter().copied().collect()
    }

    pub(crate) fn all_pieces(
        &self,
    ) -> impl Iterator<Item = &CachedPieceEntry> {
        self.pieces.values()
    }

    /// Drops every entry, handing back all suspended jobs. Only called once
    /// nothing is pinned.
    pub(crate) fn clear(&mut self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for pe in self.pieces.values_mut() {
            jobs.extend(pe.jobs.drain(..));
        }
        self.pieces.clear();
        self.storages.clear();
        self.write_lru.clear();
        self.read_lru1.clear();
        self.read_lru1_ghost.clear();
        self.read_lru2.clear();
        self.read_lru2_ghost.clear();
        self.volatile_lru.clear();
        jobs
    }

    /// Pads a read request out to the read cache line: the start is aligned
    /// down to a block boundary and the end stretched to `line_size` blocks,
    /// capped by the piece. Returns the first block and the iovec length.
    pub(crate) fn pad_read(
        &self,
        offset: u32,
        len: u32,
        blocks_in_piece: usize,
        line_size: usize,
    ) -> (usize, usize) {
        let start = offset as usize / self.block_size;
        let end_byte = offset as usize + len as usize;
        let mut end = (end_byte + self.block_size - 1) / self.block_size;
        end = end.max(start + line_size.max(1)).min(blocks_in_piece);
        (start, end - start)
    }

    /// Per-piece block maps for the cache info query. Ghost entries are
    /// headers only and are skipped.
    pub(crate) fn piece_infos(
        &self,
        storage: Option<StorageId>,
    ) -> Vec<CachedPieceInfo> {
        self.pieces
            .values()
            .filter(|pe| !pe.cache_state.is_ghost())
            .filter(|pe| storage.map_or(true, |id| pe.storage.id() == id))
            .map(|pe| CachedPieceInfo {
                piece: pe.piece,
                last_use: pe.expire,
                need_readback: pe.need_readback,
                next_to_hash: pe
                    .hash
                    .as_ref()
                    .map(|_| pe.hash_cursor_blocks(self.block_size)),
                kind: match pe.cache_state {
                    CacheState::WriteLru => CachedPieceKind::WriteCache,
                    CacheState::VolatileReadLru => {
                        CachedPieceKind::VolatileReadCache
                    }
                    _ => CachedPieceKind::ReadCache,
                },
                blocks: (0..pe.blocks_in_piece())
                    .map(|i| pe.block_present(i))
                    .collect(),
            })
            .collect()
    }

    pub(crate) fn fill_stats(&self, stats: &mut CacheStats) {
        stats.total_used_buffers = self.pool.in_use();
        stats.read_cache_blocks = self.list_blocks(CacheState::ReadLru1)
            + self.list_blocks(CacheState::ReadLru2)
            + self.list_blocks(CacheState::VolatileReadLru);
        stats.write_cache_blocks = self.list_blocks(CacheState::WriteLru);
        stats.pinned_blocks = self.pinned_blocks();
        stats.num_pieces = self
            .pieces
            .values()
            .filter(|pe| !pe.cache_state.is_ghost())
            .count();
        stats.arc_lru1_target = self.lru1_target;
        stats.arc_lru1_pieces = self.read_lru1.len();
        stats.arc_lru1_ghost_pieces = self.read_lru1_ghost.len();
        stats.arc_lru2_pieces = self.read_lru2.len();
        stats.arc_lru2_ghost_pieces = self.read_lru2_ghost.len();
        stats.write_lru_pieces = self.write_lru.len();
        stats.volatile_pieces = self.volatile_lru.len();
    }

    #[cfg(debug_assertions)]
    fn check_invariant(&self) {
        for (key, pe) in &self.pieces {
            let dirty = pe.blocks.iter().filter(|b| b.dirty).count();
            assert_eq!(pe.num_dirty, dirty, "num_dirty out of sync for {key:?}");
            let present = pe.blocks.iter().filter(|b| b.buf.is_some()).count();
            assert_eq!(pe.num_blocks, present, "num_blocks out of sync for {key:?}");
            for b in pe.blocks.iter() {
                if b.pending {
                    assert!(b.dirty, "pending block must be dirty");
                    assert!(b.buf.is_some(), "pending block must have a buffer");
                }
            }
            if pe.cache_state.is_ghost() {
                assert_eq!(pe.num_blocks, 0, "ghost entries carry no buffers");
                assert_eq!(pe.piece_refcount, 0);
            }
            if let Some(ph) = &pe.hash {
                let piece_len = pe.piece_len() as usize;
                assert!(ph.offset <= piece_len);
                assert!(
                    ph.offset % self.block_size == 0 || ph.offset == piece_len
                );
            }
            if pe.hashing_done {
                assert!(pe.hash.is_none());
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_invariant(&self) {}
}
