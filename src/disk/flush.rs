//! The flush engine: building vectored writes out of dirty cached blocks.
//!
//! The normal path flushes only blocks the hasher has already consumed, so
//! flushed blocks never need to be read back for verification. Under cache
//! pressure the engine degrades gracefully: first it drops the contiguity
//! floor to one block, then it flushes write pieces in plain LRU order.

use std::{sync::Arc, time::Instant};

use parking_lot::MutexGuard;

use crate::{
    disk::{
        cache::{BlockCache, CacheState, PieceKey},
        settings::DiskSettings,
        worker::Shared,
    },
    error::{JobError, Operation},
    iovecs::IoVec,
    storage::StorageHandle,
    PieceIndex,
};

use std::sync::atomic::Ordering;

/// Issue write commands for all dirty blocks.
pub(crate) const FLUSH_WRITE_CACHE: u32 = 1;
/// Drop the piece once its writes have completed.
pub(crate) const FLUSH_READ_CACHE: u32 = 1 << 1;
/// Abort suspended jobs and drop dirty buffers without writing them.
pub(crate) const FLUSH_DELETE_CACHE: u32 = 1 << 2;

/// One member of a cross-piece flush stripe.
struct StripeMember {
    key: PieceKey,
    iov_start: usize,
    iov_end: usize,
    block_base: usize,
}

impl Shared {
    /// Evicts and/or flushes blocks if the cache is over its target. The
    /// low watermark is dynamic, so this runs both before and after every
    /// job; the flushing fallback is skipped while another thread writes.
    pub(crate) fn check_cache_level(&self, l: &mut MutexGuard<'_, BlockCache>) {
        let evict = l.num_to_evict(0);
        if evict > 0 {
            let remaining = l.try_evict_blocks(evict);
            if remaining > 0
                && self.num_writing_threads.load(Ordering::Relaxed) == 0
            {
                let settings = self.settings.load_full();
                self.try_flush_write_blocks(l, remaining, &settings);
            }
        }
    }

    /// Flushes as much of the piece as has been hashed, provided at least
    /// `cont_block` contiguous blocks qualify. When the write cache line
    /// spans multiple pieces and partial stripe writes are not allowed, the
    /// whole aligned stripe must be ready or nothing is flushed.
    ///
    /// Returns the number of blocks submitted to storage.
    pub(crate) fn try_flush_hashed(
        &self,
        l: &mut MutexGuard<'_, BlockCache>,
        key: PieceKey,
        cont_block: usize,
        settings: &DiskSettings,
    ) -> usize {
        let cont_block = cont_block.max(1);
        let Some(pe) = l.find_piece(key) else {
            return 0;
        };
        // with hash checks disabled there's no digest to wait for, any
        // dirty block qualifies
        if pe.hash.is_none()
            && !pe.hashing_done
            && !settings.disable_hash_checks
        {
            log::trace!("try_flush_hashed: ({}) no hash", key.1);
            return 0;
        }
        if pe.num_dirty == 0 {
            return 0;
        }

        let block_size = l.block_size();
        let blocks_in_piece = pe.blocks_in_piece();
        // one past the last hashed block, rounding up to include a short
        // last block
        let mut end = if pe.hashing_done || settings.disable_hash_checks {
            blocks_in_piece
        } else {
            pe.hash_cursor_blocks(block_size)
        };
        // nothing has been hashed yet, don't flush anything
        if end == 0 && !pe.need_readback {
            return 0;
        }

        let mut block_limit = cont_block.min(blocks_in_piece);
        // if everything has been hashed, we might as well flush everything
        // regardless of the contiguity floor
        if end == blocks_in_piece {
            block_limit = 1;
        }
        if pe.need_readback {
            // this piece needs a read-back regardless, flushing early frees
            // blocks that can save other pieces from premature flushes
            end = blocks_in_piece;
        }

        if pe.num_flushable(end) < block_limit {
            return 0;
        }

        let storage = Arc::clone(&pe.storage);
        let cont_pieces = cont_block / blocks_in_piece;

        // flushing whole stripes assumes the piece picker has an affinity
        // for downloading adjacent pieces together, which is why partial
        // writes are the default
        if cont_pieces <= 1 || settings.allow_partial_disk_writes {
            log::trace!(
                "try_flush_hashed: ({}) blocks_in_piece: {} end: {}",
                key.1,
                blocks_in_piece,
                end
            );
            return self.flush_range(l, key, 0, end);
        }

        let piece = key.1;
        let range_start = (piece / cont_pieces) * cont_pieces;
        let range_end =
            (range_start + cont_pieces).min(storage.info().piece_count);

        // every other member of the stripe must be fully dirty and fully
        // hashed (or exempt as an already-flushed read piece), otherwise
        // keep waiting
        for i in range_start..range_end {
            if i == piece {
                continue;
            }
            let Some(member) = l.find_piece((key.0, i)) else {
                log::trace!("try_flush_hashed: stripe member {} missing", i);
                return 0;
            };
            if member.cache_state.is_ghost() {
                return 0;
            }
            if member.cache_state != CacheState::WriteLru {
                continue;
            }
            let cursor = member.hash_cursor_blocks(block_size);
            let ready = member.num_dirty == member.blocks_in_piece()
                && (member.hashing_done
                    || cursor == member.blocks_in_piece()
                    || settings.disable_hash_checks);
            if !ready {
                log::trace!(
                    "try_flush_hashed: stripe member {} dirty: {} cursor: {}",
                    i,
                    member.num_dirty,
                    cursor
                );
                return 0;
            }
        }

        // build one iovec covering the whole stripe so it hits storage as a
        // single logical operation, even with several disk threads running
        let mut iov: Vec<IoVec> = Vec::new();
        let mut indices: Vec<usize> = Vec::new();
        let mut members: Vec<StripeMember> = Vec::new();
        let mut block_start = 0usize;
        for i in range_start..range_end {
            let member_key = (key.0, i);
            let member_state = l
                .find_piece(member_key)
                .map(|pe| (pe.cache_state, pe.blocks_in_piece()));
            match member_state {
                Some((CacheState::WriteLru, blocks)) => {
                    l.pin_piece(member_key);
                    let iov_start = iov.len();
                    l.build_iovec(
                        member_key,
                        0,
                        blocks,
                        block_start,
                        &mut iov,
                        &mut indices,
                    );
                    members.push(StripeMember {
                        key: member_key,
                        iov_start,
                        iov_end: iov.len(),
                        block_base: block_start,
                    });
                    // advance by this piece's own block count; a short last
                    // piece must not skew the indices of its neighbors
                    block_start += blocks;
                }
                Some((_, blocks)) => block_start += blocks,
                None => block_start += storage.blocks_in_piece(i),
            }
        }

        if iov.is_empty() {
            let mut stray = Vec::new();
            for member in &members {
                stray.extend(l.unpin_piece(member.key));
            }
            self.abort_jobs(stray);
            return 0;
        }

        let flushed = iov.len();
        let first_blocks = storage.blocks_in_piece(range_start);
        let error = MutexGuard::unlocked(l, || {
            self.flush_iovec(&storage, range_start, first_blocks, &iov, &indices, 0)
        });

        let mut stray = Vec::new();
        for member in &members {
            let local: Vec<usize> = indices[member.iov_start..member.iov_end]
                .iter()
                .map(|i| i - member.block_base)
                .collect();
            self.iovec_flushed(l, member.key, &local, error.as_ref());
            stray.extend(l.unpin_piece(member.key));
        }
        self.abort_jobs(stray);

        // the flush may have pushed us past the target, make room again
        let evict = l.num_to_evict(0);
        if evict > 0 {
            l.try_evict_blocks(evict);
        }
        flushed
    }

    /// Issues write commands for dirty blocks in `[start, end)` of one
    /// piece. Returns the number of blocks submitted.
    pub(crate) fn flush_range(
        &self,
        l: &mut MutexGuard<'_, BlockCache>,
        key: PieceKey,
        start: usize,
        end: usize,
    ) -> usize {
        log::trace!("flush_range: piece={} [{}, {})", key.1, start, end);
        let Some(pe) = l.find_piece(key) else {
            return 0;
        };
        let storage = Arc::clone(&pe.storage);
        let blocks_in_piece = pe.blocks_in_piece();

        let mut iov: Vec<IoVec> = Vec::new();
        let mut indices: Vec<usize> = Vec::new();
        l.build_iovec(key, start, end, 0, &mut iov, &mut indices);
        if iov.is_empty() {
            return 0;
        }

        l.pin_piece(key);
        let error = MutexGuard::unlocked(l, || {
            self.flush_iovec(&storage, key.1, blocks_in_piece, &iov, &indices, 0)
        });
        self.iovec_flushed(l, key, &indices, error.as_ref());
        let stray = l.unpin_piece(key);
        self.abort_jobs(stray);

        let evict = l.num_to_evict(0);
        if evict > 0 {
            l.try_evict_blocks(evict);
        }
        iov.len()
    }

    /// Does the actual writing. One `writev` is issued per maximal run of
    /// consecutive block indices; runs may cross piece boundaries. Called
    /// with no cache lock held.
    fn flush_iovec(
        &self,
        storage: &StorageHandle,
        first_piece: PieceIndex,
        blocks_in_piece: usize,
        iov: &[IoVec],
        indices: &[usize],
        flags: u32,
    ) -> Option<JobError> {
        debug_assert!(!iov.is_empty());
        debug_assert_eq!(iov.len(), indices.len());

        self.num_writing_threads.fetch_add(1, Ordering::Relaxed);
        let start_time = Instant::now();
        let block_size = self.pool.block_size();

        let mut error: Option<JobError> = None;
        let mut writes = 0u64;
        let mut run_start = 0;
        for i in 1..=indices.len() {
            if i < indices.len() && indices[i] == indices[i - 1] + 1 {
                continue;
            }
            let piece = first_piece + indices[run_start] / blocks_in_piece;
            let offset = (indices[run_start] % blocks_in_piece) * block_size;
            writes += 1;
            if let Err(e) = storage.backend().writev(
                &iov[run_start..i],
                piece,
                offset as u32,
                flags,
            ) {
                log::warn!("flush_iovec: writev failed on piece {}: {}", piece, e);
                if error.is_none() {
                    error = Some(JobError::new(e, Operation::Writev));
                }
            }
            run_start = i;
        }

        self.num_writing_threads.fetch_sub(1, Ordering::Relaxed);

        if error.is_none() {
            let elapsed = start_time.elapsed().as_micros() as u64;
            let mut stats = self.stats.lock();
            stats
                .write_time
                .add_sample((elapsed / iov.len() as u64) as i64);
            stats.stats.cumulative_write_time += elapsed;
            stats.stats.cumulative_job_time += elapsed;
            stats.stats.blocks_written += iov.len() as u64;
            stats.stats.writes += writes;
        }
        error
    }

    /// Restores block state after a flush and completes the write jobs whose
    /// blocks made it to disk. A write error fails every job suspended on
    /// the piece; the blocks keep their dirty bits for a later retry.
    fn iovec_flushed(
        &self,
        l: &mut MutexGuard<'_, BlockCache>,
        key: PieceKey,
        indices: &[usize],
        error: Option<&JobError>,
    ) {
        log::trace!(
            "iovec_flushed: piece: {} blocks: {:?} error: {}",
            key.1,
            indices,
            error.map_or("none".into(), |e| e.to_string()),
        );
        l.blocks_flushed(key, indices, error.is_none());
        let finished = l.take_finished_write_jobs(key, error);
        let stray = l.update_cache_state(key);
        if !finished.is_empty() {
            self.add_completed_jobs(finished);
        }
        self.abort_jobs(stray);
    }

    /// Applies `FLUSH_*` flags to a single piece.
    pub(crate) fn flush_piece_op(
        &self,
        l: &mut MutexGuard<'_, BlockCache>,
        key: PieceKey,
        flags: u32,
    ) {
        if flags & FLUSH_DELETE_CACHE != 0 {
            // delete dirty blocks and fail their handlers
            let mut jobs = l.take_jobs(key);
            jobs.extend(l.abort_dirty(key));
            self.abort_jobs(jobs);
        } else if flags & FLUSH_WRITE_CACHE != 0 {
            let dirty = l.find_piece(key).map_or(0, |pe| pe.num_dirty);
            if dirty > 0 {
                self.flush_range(l, key, 0, usize::MAX);
            }
        }

        if flags & (FLUSH_READ_CACHE | FLUSH_DELETE_CACHE) != 0 {
            let jobs = l.take_jobs(key);
            self.abort_jobs(jobs);
            let jobs = l.mark_for_deletion(key);
            self.abort_jobs(jobs);
        }
    }

    /// Applies `FLUSH_*` flags to every cached piece of a storage, or to the
    /// whole cache.
    pub(crate) fn flush_cache_op(
        &self,
        l: &mut MutexGuard<'_, BlockCache>,
        storage: Option<&StorageHandle>,
        flags: u32,
    ) {
        let keys: Vec<PieceKey> = match storage {
            Some(storage) => l
                .cached_pieces_of(storage.id())
                .into_iter()
                .map(|piece| (storage.id(), piece))
                .collect(),
            None => l.all_piece_keys(),
        };
        for key in keys {
            if l.has_live_piece(key) {
                self.flush_piece_op(l, key, flags);
            }
        }
    }

    /// Called when the cache exceeds its size limit: flush old write blocks
    /// with the contiguity floor dropped to one, and if that is not enough
    /// and nobody else is writing, degrade to plain LRU flushing.
    pub(crate) fn try_flush_write_blocks(
        &self,
        l: &mut MutexGuard<'_, BlockCache>,
        mut num: usize,
        settings: &DiskSettings,
    ) {
        log::trace!("try_flush_write_blocks: {}", num);

        let pieces: Vec<PieceKey> = l
            .write_lru_pieces()
            .into_iter()
            .filter(|key| l.find_piece(*key).map_or(0, |pe| pe.num_dirty) > 0)
            .collect();

        for key in &pieces {
            if num == 0 {
                break;
            }
            if !l.has_live_piece(*key) {
                continue;
            }
            l.pin_piece(*key);
            self.kick_hasher(l, *key);
            num = num.saturating_sub(self.try_flush_hashed(l, *key, 1, settings));
            let stray = l.unpin_piece(*key);
            self.abort_jobs(stray);
        }

        // under heavy pressure flushing unhashed blocks is likely counter
        // productive, so only do it when no other thread is flushing
        if num == 0 || self.num_writing_threads.load(Ordering::Relaxed) > 0 {
            return;
        }

        for key in pieces {
            if num == 0 {
                break;
            }
            let Some(pe) = l.find_piece(key) else {
                continue;
            };
            if pe.num_dirty == 0 || pe.hashing {
                continue;
            }
            l.pin_piece(key);
            num = num.saturating_sub(self.flush_range(l, key, 0, usize::MAX));
            let stray = l.unpin_piece(key);
            self.abort_jobs(stray);
        }
    }

    /// Walks the write LRU in order of last use, flushing pieces that have
    /// sat dirty past the configured expiry. The list is ordered, so the
    /// first young entry ends the walk. At most 200 pieces per sweep.
    pub(crate) fn flush_expired_write_blocks(
        &self,
        l: &mut MutexGuard<'_, BlockCache>,
        settings: &DiskSettings,
    ) {
        log::trace!("flush_expired_write_blocks");
        let expiry = std::time::Duration::from_secs(settings.cache_expiry);

        let mut to_flush: Vec<PieceKey> = Vec::new();
        for key in l.write_lru_pieces() {
            let Some(pe) = l.find_piece(key) else {
                continue;
            };
            if pe.expire.elapsed() < expiry {
                break;
            }
            if pe.num_dirty == 0 {
                continue;
            }
            // the pin keeps the entry alive while the mutex is released
            // between flushes
            l.pin_piece(key);
            to_flush.push(key);
            if to_flush.len() == 200 {
                break;
            }
        }

        for key in to_flush {
            self.flush_range(l, key, 0, usize::MAX);
            let stray = l.unpin_piece(key);
            self.abort_jobs(stray);
        }
    }
}
