//! The incremental piece hasher.
//!
//! A piece's digest is advanced opportunistically as blocks arrive in order
//! (`kick_hasher`), so that by the time the last block is written the digest
//! is usually one block away from done. A hash job then only has to pick up
//! the stragglers, reading back from storage whatever the cache no longer
//! holds.
//!
//! While a worker is hashing, the `hashing` flag keeps every other thread
//! away from the digest state; concurrent flushes see a conservative (stale)
//! cursor and concurrent hash jobs retry.

use std::{sync::Arc, time::Instant};

use parking_lot::MutexGuard;
use sha1::{Digest, Sha1};

use crate::{
    blockinfo::CachedBlock,
    disk::{
        cache::{BlockCache, CacheState, PartialHash, PieceKey},
        job::{Action, Job, VOLATILE_READ},
        settings::DiskSettings,
        worker::{Dispatch, Shared},
    },
    error::{DiskError, JobError, Operation},
};

impl Shared {
    /// Advances the piece's digest over the contiguous run of cached blocks
    /// at the hash cursor. Call with the cache locked; the digest itself is
    /// computed with the mutex released. If the digest now covers the whole
    /// piece, hash jobs suspended on the piece complete.
    pub(crate) fn kick_hasher(
        &self,
        l: &mut MutexGuard<'_, BlockCache>,
        key: PieceKey,
    ) {
        let block_size = l.block_size();
        let Some(pe) = l.find_piece(key) else {
            return;
        };
        if pe.hashing {
            return;
        }
        let Some(ph) = &pe.hash else {
            return;
        };
        let piece_len = pe.piece_len() as usize;
        if ph.offset >= piece_len {
            return;
        }
        debug_assert_eq!(ph.offset % block_size, 0);

        let mut ph = ph.clone();
        let cursor = ph.offset / block_size;
        let mut blocks: Vec<(usize, CachedBlock)> = Vec::new();
        for i in cursor..pe.blocks_in_piece() {
            match pe.block_buf(i) {
                Some(buf) => blocks.push((i, buf)),
                None => break,
            }
        }
        if blocks.is_empty() {
            return;
        }

        for (i, _) in &blocks {
            l.inc_block_refcount(key, *i, super::cache::BlockRefReason::Hashing);
        }
        l.find_piece_mut(key).unwrap().hashing = true;

        log::trace!(
            "kick_hasher: {} - {} (piece: {} offset: {})",
            cursor,
            cursor + blocks.len(),
            key.1,
            ph.offset
        );

        let start_time = Instant::now();
        MutexGuard::unlocked(l, || {
            for (i, buf) in &blocks {
                let len = block_size.min(piece_len - ph.offset);
                debug_assert_eq!(ph.offset, i * block_size);
                ph.hasher.update(&buf.as_slice()[..len.min(buf.len())]);
                ph.offset += len;
            }
        });
        let elapsed = start_time.elapsed().as_micros() as u64;
        {
            let mut stats = self.stats.lock();
            stats
                .hash_time
                .add_sample((elapsed / blocks.len() as u64) as i64);
            stats.stats.cumulative_hash_time += elapsed;
            stats.stats.cumulative_job_time += elapsed;
        }

        let mut stray = Vec::new();
        for (i, _) in &blocks {
            stray.extend(l.dec_block_refcount(
                key,
                *i,
                super::cache::BlockRefReason::Hashing,
            ));
        }

        let pe = l
            .find_piece_mut(key)
            .expect("hashing pin vanished under the hasher");
        pe.hashing = false;
        let complete = ph.offset >= piece_len;

        if !complete {
            pe.hash = Some(ph);
            self.abort_jobs(stray);
            return;
        }

        // harvest the hash jobs hanging off this piece and finish them with
        // the freshly finalized digest
        let mut hash_jobs = Vec::new();
        let mut keep = Vec::new();
        for job in pe.jobs.drain(..) {
            if matches!(job.action, Action::Hash) {
                hash_jobs.push(job);
            } else {
                keep.push(job);
            }
        }
        pe.jobs = keep;

        if hash_jobs.is_empty() {
            // nobody asked yet; keep the finished digest state around for
            // the eventual hash job to finalize inline
            pe.hash = Some(ph);
            self.abort_jobs(stray);
            return;
        }

        let digest = ph.digest();
        for job in &mut hash_jobs {
            job.piece_hash = Some(digest);
            job.ret = 0;
        }
        pe.hash = None;
        if pe.cache_state != CacheState::VolatileReadLru {
            pe.hashing_done = true;
        }
        self.abort_jobs(stray);
        self.add_completed_jobs(hash_jobs);
    }

    /// Hashes a piece without involving the cache: read block by block into
    /// one scratch buffer, feeding the digest.
    fn do_uncached_hash(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("hash job without storage");
        let piece_len = storage.piece_len(job.piece) as usize;
        let blocks_in_piece = storage.blocks_in_piece(job.piece);
        let block_size = self.pool.block_size();

        let Some(buf) = self.pool.allocate("hashing") else {
            return job.fail(JobError::new(
                DiskError::OutOfMemory,
                Operation::AllocCachePiece,
            ));
        };
        let mut bufs = [buf];
        let mut hasher = Sha1::new();
        let mut offset = 0usize;
        for i in 0..blocks_in_piece {
            log::trace!(
                "do_hash: (uncached) reading (piece: {} block: {})",
                job.piece,
                i
            );
            let len = block_size.min(piece_len - offset);
            bufs[0].truncate(len);

            let start_time = Instant::now();
            if let Err(e) = storage
                .backend()
                .readv(&mut bufs, job.piece, offset as u32, job.flags)
            {
                return job.fail(JobError::new(e, Operation::Readv));
            }
            let elapsed = start_time.elapsed().as_micros() as u64;
            let mut stats = self.stats.lock();
            stats.read_time.add_sample(elapsed as i64);
            stats.stats.cumulative_read_time += elapsed;
            stats.stats.cumulative_job_time += elapsed;
            stats.stats.blocks_read += 1;
            stats.stats.reads += 1;
            drop(stats);

            hasher.update(bufs[0].as_slice());
            offset += len;
        }
        job.piece_hash = Some(hasher.finalize().into());
        job.ret = 0;
    }

    /// The hash job handler. Fast path: the cache already holds a digest
    /// covering the whole piece. Slow path: walk the piece in order, feeding
    /// cached blocks directly and reading missing ones back from storage.
    pub(crate) fn do_hash(
        self: &Arc<Self>,
        mut job: Job,
        settings: &DiskSettings,
    ) -> Dispatch {
        if settings.cache_size == 0 {
            self.do_uncached_hash(&mut job);
            return Dispatch::Done(job);
        }

        let storage = job.storage.clone().expect("hash job without storage");
        let key = (storage.id(), job.piece);
        let piece_len = storage.piece_len(job.piece) as usize;
        let blocks_in_piece = storage.blocks_in_piece(job.piece);
        let block_size = self.pool.block_size();
        let volatile = job.flags & VOLATILE_READ != 0;

        let mut l = self.cache.lock();

        if l.has_live_piece(key) {
            l.cache_hit(key);
            l.pin_piece(key);
            self.kick_hasher(&mut l, key);
            let stray = l.unpin_piece(key);
            self.abort_jobs(stray);

            // are we already done hashing? (the unpin may also have carried
            // out a deferred removal, in which case there's nothing here)
            if let Some(pe) = l.find_piece_mut(key) {
                let done = !pe.hashing
                    && pe.hash.as_ref().map_or(false, |ph| ph.offset >= piece_len);
                if done {
                    log::trace!("do_hash: ({}) (already done)", key.1);
                    let ph = pe.hash.take().unwrap();
                    job.piece_hash = Some(ph.digest());
                    job.ret = 0;
                    if pe.cache_state != CacheState::VolatileReadLru {
                        pe.hashing_done = true;
                    }
                    let stray = l.update_cache_state(key);
                    drop(l);
                    self.abort_jobs(stray);
                    return Dispatch::Done(job);
                }
            }
        }

        if !l.has_live_piece(key) {
            if !settings.use_read_cache {
                // the piece was flushed already and the read cache is off,
                // there's no point pulling it back into the cache
                drop(l);
                self.do_uncached_hash(&mut job);
                return Dispatch::Done(job);
            }
            let state = if volatile {
                CacheState::VolatileReadLru
            } else {
                CacheState::ReadLru1
            };
            if l.allocate_piece(&storage, job.piece, state).is_none() {
                job.fail(JobError::new(
                    DiskError::OutOfMemory,
                    Operation::AllocCachePiece,
                ));
                return Dispatch::Done(job);
            }
        }

        let pe = l.find_piece_mut(key).unwrap();
        if pe.hashing {
            // another thread is hashing this piece right now, try again in
            // a little bit
            log::trace!("do_hash: retry");
            return Dispatch::Retry(job);
        }
        if pe.hash.is_none() {
            pe.hashing_done = false;
            pe.need_readback = false;
            pe.hash = Some(PartialHash::new());
        }
        pe.hashing = true;
        let mut ph = pe.hash.clone().unwrap();
        let cursor = ph.offset / block_size;
        debug_assert_eq!(ph.offset % block_size, 0);

        // pin the blocks that are already cached up front, then hash
        // everything without holding the lock
        let locked: Vec<(usize, CachedBlock)> = (cursor..blocks_in_piece)
            .filter_map(|i| pe.block_buf(i).map(|buf| (i, buf)))
            .collect();
        l.pin_piece(key);
        for (i, _) in &locked {
            l.inc_block_refcount(key, *i, super::cache::BlockRefReason::Hashing);
        }
        drop(l);

        let mut result: Result<(), JobError> = Ok(());
        let mut next_locked = 0;
        for i in cursor..blocks_in_piece {
            let len = block_size.min(piece_len - ph.offset);
            if next_locked < locked.len() && locked[next_locked].0 == i {
                let (_, buf) = &locked[next_locked];
                next_locked += 1;
                debug_assert_eq!(ph.offset, i * block_size);
                ph.hasher.update(&buf.as_slice()[..len.min(buf.len())]);
                ph.offset += len;
            } else {
                let Some(mut buf) = self.pool.allocate("hashing") else {
                    result = Err(JobError::new(
                        DiskError::OutOfMemory,
                        Operation::AllocCachePiece,
                    ));
                    break;
                };
                buf.truncate(len);
                log::trace!("do_hash: reading (piece: {} block: {})", key.1, i);

                let start_time = Instant::now();
                let mut bufs = [buf];
                match storage.backend().readv(
                    &mut bufs,
                    job.piece,
                    ph.offset as u32,
                    job.flags,
                ) {
                    Ok(_) => {
                        let elapsed = start_time.elapsed().as_micros() as u64;
                        let mut stats = self.stats.lock();
                        stats.read_time.add_sample(elapsed as i64);
                        stats.stats.cumulative_read_time += elapsed;
                        stats.stats.cumulative_job_time += elapsed;
                        stats.stats.total_read_back += len as u64;
                        stats.stats.blocks_read += 1;
                        stats.stats.reads += 1;
                        drop(stats);

                        let [buf] = bufs;
                        ph.hasher.update(buf.as_slice());
                        ph.offset += len;
                        // keep the block for future readers; if the slot got
                        // taken meanwhile the buffer is simply dropped
                        self.cache.lock().insert_blocks(key, i, vec![buf]);
                    }
                    Err(e) => {
                        result = Err(JobError::new(e, Operation::Readv));
                        break;
                    }
                }
            }
        }

        let mut l = self.cache.lock();
        let mut stray = Vec::new();
        for (i, _) in &locked {
            stray.extend(l.dec_block_refcount(
                key,
                *i,
                super::cache::BlockRefReason::Hashing,
            ));
        }
        let pe = l
            .find_piece_mut(key)
            .expect("piece pin vanished under the hasher");
        pe.hashing = false;
        match result {
            Ok(()) => {
                job.piece_hash = Some(ph.digest());
                job.ret = 0;
                pe.hash = None;
                if pe.cache_state != CacheState::VolatileReadLru {
                    pe.hashing_done = true;
                }
            }
            Err(e) => {
                if matches!(e.error, DiskError::OutOfMemory) {
                    // drop the digest state, it cannot make progress without
                    // buffers anyway
                    pe.hash = None;
                }
                job.fail(e);
            }
        }
        stray.extend(l.unpin_piece(key));
        drop(l);
        self.abort_jobs(stray);
        Dispatch::Done(job)
    }
}
