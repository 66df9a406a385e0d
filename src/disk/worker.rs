//! The worker pool and the per-action job handlers.
//!
//! Workers pop jobs off two FIFO queues (general and hash-dedicated), run
//! the matching handler, and push the result onto the completion ring. Every
//! fourth worker serves the hash queue, so digests keep making progress when
//! the generic workers are stuck in storage calls.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    blockinfo::BlockData,
    disk::{
        buffer::{BufferPool, PoolBuf},
        cache::{BlockCache, CacheState, TryReadResult},
        fence::{RaiseOutcome, Released},
        job::{Action, Job, VOLATILE_READ},
        settings::DiskSettings,
        stats::StatsState,
    },
    error::{DiskError, JobError, Operation},
    iovecs::IoVec,
    storage::StorageHandle,
    StorageId,
};

/// Whether a worker serves the general queue or the hash queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadType {
    Generic,
    Hasher,
}

impl ThreadType {
    /// Every fourth thread is a hasher.
    pub(crate) fn for_id(thread_id: usize) -> Self {
        if thread_id & 0x3 == 3 {
            ThreadType::Hasher
        } else {
            ThreadType::Generic
        }
    }
}

/// What a handler did with its job.
pub(crate) enum Dispatch {
    /// The handler finished; post the job to the completion ring.
    Done(Job),
    /// The job was handed to the cache (suspended on a piece); it completes
    /// later.
    Deferred,
    /// Transient contention (another thread is hashing the piece); requeue
    /// after a yield.
    Retry(Job),
}

pub(crate) struct JobQueues {
    pub(crate) general: VecDeque<Job>,
    pub(crate) hash: VecDeque<Job>,
    /// Target thread count. Workers whose id is at or past this exit.
    pub(crate) num_threads: usize,
}

pub(crate) struct CompletedRing {
    pub(crate) jobs: Vec<Job>,
    /// Wakes the caller's event loop when the ring turns non-empty. Dropped
    /// by the last exiting worker, which ends the caller's completion loop.
    pub(crate) notify: Option<UnboundedSender<()>>,
}

/// State shared between the public handle and all worker threads.
pub(crate) struct Shared {
    pub(crate) settings: ArcSwap<DiskSettings>,
    pub(crate) cache: Mutex<BlockCache>,
    pub(crate) pool: BufferPool,
    pub(crate) queues: Mutex<JobQueues>,
    pub(crate) job_cond: Condvar,
    pub(crate) hash_job_cond: Condvar,
    pub(crate) completed: Mutex<CompletedRing>,
    pub(crate) uncork: Mutex<Option<Box<dyn Fn() + Send>>>,
    pub(crate) stats: Mutex<StatsState>,
    pub(crate) torrents: Mutex<HashMap<StorageId, StorageHandle>>,
    pub(crate) threads: Mutex<Vec<Option<std::thread::JoinHandle<()>>>>,
    pub(crate) next_storage_id: AtomicUsize,
    pub(crate) num_running_threads: AtomicUsize,
    /// Threads currently inside a storage write. Flush heuristics back off
    /// while another thread is already writing.
    pub(crate) num_writing_threads: AtomicUsize,
    /// Jobs currently inside a handler.
    pub(crate) executing_jobs: AtomicUsize,
    /// Jobs held back by fences.
    pub(crate) num_blocked_jobs: AtomicUsize,
    pub(crate) last_expiry: Mutex<Instant>,
}

impl Shared {
    // ---- submission ----

    /// Queues a job that has not been counted against its storage yet.
    /// Fenced storages swallow the job until the fence comes down.
    pub(crate) fn add_job(&self, job: Job, ignore_fence: bool) {
        log::trace!(
            "add_job: {} (piece: {} outstanding: {})",
            job.action.name(),
            job.piece,
            job.storage().map_or(0, |s| s.num_outstanding_jobs()),
        );
        let job = match job.storage.clone() {
            Some(storage) => {
                match storage.fence.is_blocked(job, ignore_fence) {
                    Ok(job) => job,
                    Err(()) => {
                        self.num_blocked_jobs.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
            None => job,
        };
        self.queue_job(job);
    }

    /// Queues a job that is already counted as in progress.
    pub(crate) fn queue_job(&self, job: Job) {
        let mut q = self.queues.lock();
        // hash jobs get their own lane once the pool is big enough to
        // contain a hasher thread
        if matches!(job.action, Action::Hash) && q.num_threads > 3 {
            q.hash.push_back(job);
            self.hash_job_cond.notify_one();
        } else {
            q.general.push_back(job);
            self.job_cond.notify_one();
        }
    }

    /// Schedules a destructive job through its storage's fence, together
    /// with a synthetic flush that drains dirty blocks first when needed.
    pub(crate) fn add_fence_job(&self, storage: &StorageHandle, job: Job) {
        log::trace!(
            "add_fence_job: {} (outstanding: {})",
            job.action.name(),
            storage.num_outstanding_jobs(),
        );
        let flush = Job::new(Action::FlushStorage, Some(Arc::clone(storage)));
        match storage.fence.raise(job, flush) {
            RaiseOutcome::PostFence(job) => {
                // fence jobs block everything behind them, let them cut in line
                let mut q = self.queues.lock();
                q.general.push_front(job);
                self.job_cond.notify_one();
            }
            RaiseOutcome::PostFlush(flush) => {
                let mut q = self.queues.lock();
                q.general.push_front(flush);
                self.job_cond.notify_one();
            }
            RaiseOutcome::Blocked => {
                self.num_blocked_jobs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn submit_jobs(&self) {
        let q = self.queues.lock();
        if !q.general.is_empty() {
            self.job_cond.notify_all();
        }
        if !q.hash.is_empty() {
            self.hash_job_cond.notify_all();
        }
    }

    // ---- the worker loop ----

    pub(crate) fn thread_fun(self: &Arc<Self>, thread_id: usize, ttype: ThreadType) {
        log::trace!("started disk thread {}", thread_id);
        self.num_running_threads.fetch_add(1, Ordering::SeqCst);

        let mut q = self.queues.lock();
        loop {
            let job = match ttype {
                ThreadType::Generic => {
                    while q.general.is_empty() && thread_id < q.num_threads {
                        self.job_cond.wait(&mut q);
                    }
                    // when we're shutting down, thread 0 drains the queue
                    // before leaving
                    if thread_id >= q.num_threads
                        && !(thread_id == 0 && !q.general.is_empty())
                    {
                        break;
                    }
                    match q.general.pop_front() {
                        Some(job) => job,
                        None => continue,
                    }
                }
                ThreadType::Hasher => {
                    while q.hash.is_empty() && thread_id < q.num_threads {
                        self.hash_job_cond.wait(&mut q);
                    }
                    if q.hash.is_empty() && thread_id >= q.num_threads {
                        break;
                    }
                    match q.hash.pop_front() {
                        Some(job) => job,
                        None => continue,
                    }
                }
            };
            drop(q);

            if thread_id == 0 {
                // there's no need for all threads to be doing this
                let mut last = self.last_expiry.lock();
                if last.elapsed().as_secs() >= 5 {
                    *last = Instant::now();
                    drop(last);
                    let settings = self.settings.load_full();
                    let mut cache = self.cache.lock();
                    self.flush_expired_write_blocks(&mut cache, &settings);
                }
            }

            self.perform_job(job);

            q = self.queues.lock();
        }
        drop(q);

        if self.num_running_threads.fetch_sub(1, Ordering::SeqCst) > 1 {
            log::trace!("exiting disk thread {}", thread_id);
            return;
        }

        // last thread alive does the cleanup. Peer sessions may still hold
        // references into the read cache; wait for them to be reclaimed.
        log::trace!("disk thread {} is the last one alive. cleaning up", thread_id);
        loop {
            if self.cache.lock().pinned_blocks() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }

        let jobs = self.cache.lock().clear();
        self.abort_jobs(jobs);

        // closing files may take a while on some platforms, which is why it
        // belongs on a disk thread
        let torrents: Vec<StorageHandle> =
            self.torrents.lock().drain().map(|(_, s)| s).collect();
        for storage in torrents {
            if let Err(e) = storage.backend().release_files() {
                log::warn!("failed to release files on shutdown: {}", e);
            }
        }

        // release the caller's completion loop
        self.completed.lock().notify.take();
    }

    pub(crate) fn set_num_threads(self: &Arc<Self>, count: usize, wait: bool) {
        let mut q = self.queues.lock();
        let old = q.num_threads;
        if count == old {
            return;
        }
        q.num_threads = count;

        if count > old {
            let mut threads = self.threads.lock();
            for thread_id in old..count {
                let shared = Arc::clone(self);
                let ttype = ThreadType::for_id(thread_id);
                let handle = std::thread::Builder::new()
                    .name(format!("disk-{}", thread_id))
                    .spawn(move || shared.thread_fun(thread_id, ttype))
                    .expect("failed to spawn disk thread");
                if threads.len() <= thread_id {
                    threads.resize_with(thread_id + 1, || None);
                }
                threads[thread_id] = Some(handle);
            }
        } else {
            self.job_cond.notify_all();
            self.hash_job_cond.notify_all();
            drop(q);
            if wait {
                let handles: Vec<_> = {
                    let mut threads = self.threads.lock();
                    threads
                        .iter_mut()
                        .skip(count)
                        .filter_map(Option::take)
                        .collect()
                };
                for handle in handles {
                    let _ = handle.join();
                }
            }
        }
    }

    // ---- job execution ----

    fn perform_job(self: &Arc<Self>, job: Job) {
        {
            let mut cache = self.cache.lock();
            self.check_cache_level(&mut cache);
        }

        let settings = self.settings.load_full();
        log::trace!(
            "perform_job: {} (piece: {} offset: {} outstanding: {})",
            job.action.name(),
            job.piece,
            job.offset,
            job.storage().map_or(0, |s| s.num_outstanding_jobs()),
        );

        self.stats.lock().maybe_flip();

        let start_time = Instant::now();
        self.executing_jobs.fetch_add(1, Ordering::Relaxed);
        let result = self.dispatch(job, &settings);
        self.executing_jobs.fetch_sub(1, Ordering::Relaxed);

        match result {
            Dispatch::Done(mut job) => {
                let elapsed = start_time.elapsed().as_micros() as i64;
                {
                    let mut stats = self.stats.lock();
                    stats.job_time.add_sample(elapsed);
                }
                log::trace!(
                    "   return: {} error: {}",
                    job.ret,
                    job.error
                        .as_ref()
                        .map_or_else(|| "none".into(), |e| e.to_string()),
                );
                self.add_completed_job(job);
            }
            Dispatch::Deferred => {}
            Dispatch::Retry(job) => {
                // to avoid busy looping, give up our timeslice in case
                // there's nothing else to run in between
                let mut q = self.queues.lock();
                let need_yield = q.general.is_empty();
                q.general.push_back(job);
                self.job_cond.notify_one();
                drop(q);
                if need_yield {
                    std::thread::yield_now();
                }
            }
        }

        let mut cache = self.cache.lock();
        self.check_cache_level(&mut cache);
        drop(cache);

        self.maybe_queue_trim();
    }

    /// Turns a pending pool trim request into one queued trim job.
    pub(crate) fn maybe_queue_trim(&self) {
        if self.pool.take_trim_request() {
            self.add_job(Job::new(Action::TrimCache, None), false);
        }
    }

    fn dispatch(self: &Arc<Self>, mut job: Job, settings: &DiskSettings) -> Dispatch {
        match &job.action {
            Action::Read => {
                self.do_read(&mut job, settings);
                Dispatch::Done(job)
            }
            Action::Write { .. } => self.do_write(job, settings),
            Action::Hash => self.do_hash(job, settings),
            Action::MoveStorage { .. } => {
                self.do_move_storage(&mut job);
                Dispatch::Done(job)
            }
            Action::ReleaseFiles => {
                self.do_release_files(&mut job);
                Dispatch::Done(job)
            }
            Action::DeleteFiles => {
                self.do_delete_files(&mut job);
                Dispatch::Done(job)
            }
            Action::CheckFastresume { .. } => {
                self.do_check_fastresume(&mut job);
                Dispatch::Done(job)
            }
            Action::SaveResumeData => {
                self.do_save_resume_data(&mut job);
                Dispatch::Done(job)
            }
            Action::RenameFile { .. } => {
                self.do_rename_file(&mut job);
                Dispatch::Done(job)
            }
            Action::StopTorrent => {
                self.do_stop_torrent(&mut job);
                Dispatch::Done(job)
            }
            Action::CachePiece => {
                self.do_cache_piece(&mut job, settings);
                Dispatch::Done(job)
            }
            Action::FinalizeFile { .. } => {
                self.do_finalize_file(&mut job);
                Dispatch::Done(job)
            }
            Action::FlushPiece => {
                self.do_flush_piece(&mut job, settings);
                Dispatch::Done(job)
            }
            Action::FlushHashed => {
                self.do_flush_hashed(&mut job, settings);
                Dispatch::Done(job)
            }
            Action::FlushStorage => {
                self.do_flush_storage(&mut job);
                Dispatch::Done(job)
            }
            Action::TrimCache => {
                let mut cache = self.cache.lock();
                self.check_cache_level(&mut cache);
                Dispatch::Done(job)
            }
            Action::FilePriority { .. } => {
                self.do_file_priority(&mut job);
                Dispatch::Done(job)
            }
            Action::LoadTorrent { .. } => {
                self.do_load_torrent(&mut job);
                Dispatch::Done(job)
            }
            Action::ClearPiece => self.do_clear_piece(job),
            Action::Tick => {
                self.do_tick(&mut job);
                Dispatch::Done(job)
            }
        }
    }

    // ---- read path ----

    fn do_uncached_read(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("read job without storage");
        let Some(mut buf) = self.pool.allocate("send buffer") else {
            job.fail(JobError::new(
                DiskError::OutOfMemory,
                Operation::AllocCachePiece,
            ));
            return;
        };
        buf.truncate(job.buffer_size as usize);

        let start_time = Instant::now();
        let mut bufs = [buf];
        match storage
            .backend()
            .readv(&mut bufs, job.piece, job.offset, job.flags)
        {
            Ok(n) => {
                let elapsed = start_time.elapsed().as_micros() as u64;
                let mut stats = self.stats.lock();
                stats.read_time.add_sample(elapsed as i64);
                stats.stats.cumulative_read_time += elapsed;
                stats.stats.cumulative_job_time += elapsed;
                stats.stats.blocks_read += 1;
                stats.stats.reads += 1;
                drop(stats);
                let [buf] = bufs;
                job.buffer = Some(BlockData::Owned(buf));
                job.ret = n as i32;
            }
            Err(e) => job.fail(JobError::new(e, Operation::Readv)),
        }
    }

    fn do_read(&self, job: &mut Job, settings: &DiskSettings) {
        if !settings.read_cache_enabled() {
            // we're not using a cache, just read straight from the file
            return self.do_uncached_read(job);
        }
        let storage = job.storage.clone().expect("read job without storage");
        let key = (storage.id(), job.piece);
        let blocks_in_piece = storage.blocks_in_piece(job.piece);
        let piece_len = storage.piece_len(job.piece) as usize;
        let block_size = self.pool.block_size();

        let (start_block, iov_len) = {
            let mut cache = self.cache.lock();
            let padded = cache.pad_read(
                job.offset,
                job.buffer_size,
                blocks_in_piece,
                settings.read_cache_line_size,
            );
            let evict = cache.num_to_evict(padded.1);
            if evict > 0 {
                cache.try_evict_blocks(evict);
            }
            padded
        };

        // allocate the line's buffers before diving into the storage call;
        // if the pool is dry, degrade to the single-buffer path
        let mut bufs = Vec::with_capacity(iov_len);
        for _ in 0..iov_len {
            match self.pool.allocate("read cache") {
                Some(buf) => bufs.push(buf),
                None => return self.do_uncached_read(job),
            }
        }
        // the last buffer must not run past the end of the piece
        let tail_len = piece_len - (start_block + iov_len - 1) * block_size;
        if let Some(last) = bufs.last_mut() {
            last.truncate(tail_len);
        }

        let adjusted_offset = (start_block * block_size) as u32;
        let start_time = Instant::now();
        let ret = storage
            .backend()
            .readv(&mut bufs, job.piece, adjusted_offset, job.flags);

        match ret {
            Ok(_) => {
                let elapsed = start_time.elapsed().as_micros() as u64;
                let mut stats = self.stats.lock();
                stats
                    .read_time
                    .add_sample((elapsed / iov_len as u64) as i64);
                stats.stats.cumulative_read_time += elapsed;
                stats.stats.cumulative_job_time += elapsed;
                stats.stats.blocks_read += iov_len as u64;
                stats.stats.reads += 1;
            }
            Err(e) => {
                return job.fail(JobError::new(e, Operation::Readv));
            }
        }

        let mut cache = self.cache.lock();
        let state = if job.flags & VOLATILE_READ != 0 {
            CacheState::VolatileReadLru
        } else {
            CacheState::ReadLru1
        };
        if cache.allocate_piece(&storage, job.piece, state).is_none() {
            return job.fail(JobError::new(
                DiskError::OutOfMemory,
                Operation::AllocCachePiece,
            ));
        }
        cache.insert_blocks(key, start_block, bufs);

        match cache.try_read(job) {
            TryReadResult::Hit(n) => job.ret = n as i32,
            // the blocks were just inserted, a miss here means the request
            // was bogus to begin with
            TryReadResult::Miss => job.fail(JobError::new(
                DiskError::InvalidBlockOffset,
                Operation::Readv,
            )),
            TryReadResult::NoMemory => job.fail(JobError::new(
                DiskError::OutOfMemory,
                Operation::AllocCachePiece,
            )),
        }
    }

    // ---- write path ----

    fn do_uncached_write(&self, job: &mut Job, data: PoolBuf) {
        let storage = job.storage.clone().expect("write job without storage");
        let len = data.len();
        let bufs = [IoVec::bounded(Arc::new(data), len)];

        self.num_writing_threads.fetch_add(1, Ordering::Relaxed);
        let start_time = Instant::now();
        let ret = storage
            .backend()
            .writev(&bufs, job.piece, job.offset, job.flags);
        self.num_writing_threads.fetch_sub(1, Ordering::Relaxed);

        match ret {
            Ok(n) => {
                let elapsed = start_time.elapsed().as_micros() as u64;
                let mut stats = self.stats.lock();
                stats.write_time.add_sample(elapsed as i64);
                stats.stats.cumulative_write_time += elapsed;
                stats.stats.cumulative_job_time += elapsed;
                stats.stats.blocks_written += 1;
                stats.stats.writes += 1;
                drop(stats);
                job.ret = n as i32;
            }
            Err(e) => job.fail(JobError::new(e, Operation::Writev)),
        }
    }

    fn do_write(self: &Arc<Self>, mut job: Job, settings: &DiskSettings) -> Dispatch {
        debug_assert!(job.buffer_size as usize <= self.pool.block_size());

        if settings.write_cache_enabled() {
            let mut cache = self.cache.lock();
            match cache.add_dirty_block(job) {
                Ok(key) => {
                    if !settings.disable_hash_checks {
                        cache.ensure_hash(key);
                    }
                    cache.pin_piece(key);
                    self.kick_hasher(&mut cache, key);
                    // flush in case the new block completed a cache line
                    self.try_flush_hashed(
                        &mut cache,
                        key,
                        settings.write_cache_line_size,
                        settings,
                    );
                    let stray = cache.unpin_piece(key);
                    drop(cache);
                    self.abort_jobs(stray);
                    return Dispatch::Deferred;
                }
                Err(rejected) => job = rejected,
            }
        }

        // the cache did not take the block, write it out right away
        let data = match &mut job.action {
            Action::Write { data } => data.take(),
            _ => None,
        };
        match data {
            Some(data) => self.do_uncached_write(&mut job, data),
            None => job.fail(JobError::new(
                DiskError::InvalidBlockOffset,
                Operation::Writev,
            )),
        }
        Dispatch::Done(job)
    }

    // ---- storage-scoped operations ----

    fn do_move_storage(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("move job without storage");
        // if this fires, something's wrong with the fence logic
        debug_assert_eq!(storage.num_outstanding_jobs(), 1);
        let Action::MoveStorage { target } = &job.action else {
            return;
        };
        if let Err(e) = storage.backend().move_storage(target) {
            job.fail(JobError::new(e, Operation::Move));
        }
    }

    fn do_release_files(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("release job without storage");
        debug_assert_eq!(storage.num_outstanding_jobs(), 1);
        {
            let mut cache = self.cache.lock();
            self.flush_cache_op(&mut cache, Some(&storage), super::FLUSH_WRITE_CACHE);
        }
        if let Err(e) = storage.backend().release_files() {
            job.fail(JobError::new(e, Operation::ReleaseFiles));
        }
    }

    fn do_delete_files(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("delete job without storage");
        debug_assert_eq!(storage.num_outstanding_jobs(), 1);
        {
            let mut cache = self.cache.lock();
            self.flush_cache_op(&mut cache, Some(&storage), super::FLUSH_DELETE_CACHE);
        }
        if let Err(e) = storage.backend().delete_files() {
            job.fail(JobError::new(e, Operation::Delete));
        }
    }

    fn do_check_fastresume(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("fastresume job without storage");
        debug_assert_eq!(storage.num_outstanding_jobs(), 1);
        let Action::CheckFastresume { resume_data } = &job.action else {
            return;
        };
        match storage.backend().check_fastresume(resume_data) {
            Ok(status) => job.ret = status as i32,
            Err(e) => job.fail(JobError::new(e, Operation::CheckFastresume)),
        }
    }

    fn do_save_resume_data(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("resume job without storage");
        debug_assert_eq!(storage.num_outstanding_jobs(), 1);
        {
            let mut cache = self.cache.lock();
            self.flush_cache_op(&mut cache, Some(&storage), super::FLUSH_WRITE_CACHE);
        }
        match storage.backend().write_resume_data() {
            Ok(data) => job.out_data = Some(data),
            Err(e) => job.fail(JobError::new(e, Operation::WriteResumeData)),
        }
    }

    fn do_rename_file(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("rename job without storage");
        debug_assert_eq!(storage.num_outstanding_jobs(), 1);
        let Action::RenameFile { file, name } = &job.action else {
            return;
        };
        if let Err(e) = storage.backend().rename_file(*file, name) {
            job.fail(JobError::new(e, Operation::Rename));
        }
    }

    fn do_stop_torrent(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("stop job without storage");
        debug_assert_eq!(storage.num_outstanding_jobs(), 1);
        // issue write commands for all dirty blocks and clear all read jobs
        {
            let mut cache = self.cache.lock();
            self.flush_cache_op(
                &mut cache,
                Some(&storage),
                super::FLUSH_READ_CACHE | super::FLUSH_WRITE_CACHE,
            );
        }
        if let Err(e) = storage.backend().release_files() {
            job.fail(JobError::new(e, Operation::ReleaseFiles));
            return;
        }
        self.torrents.lock().remove(&storage.id());
    }

    fn do_cache_piece(&self, job: &mut Job, settings: &DiskSettings) {
        if !settings.read_cache_enabled() {
            return;
        }
        let storage = job.storage.clone().expect("cache job without storage");
        let key = (storage.id(), job.piece);
        let block_size = self.pool.block_size();
        let piece_len = storage.piece_len(job.piece) as usize;
        let blocks_in_piece = storage.blocks_in_piece(job.piece);

        let mut cache = self.cache.lock();
        let state = if job.flags & VOLATILE_READ != 0 {
            CacheState::VolatileReadLru
        } else {
            CacheState::ReadLru1
        };
        if cache.allocate_piece(&storage, job.piece, state).is_none() {
            return job.fail(JobError::new(
                DiskError::OutOfMemory,
                Operation::AllocCachePiece,
            ));
        }
        cache.pin_piece(key);

        for i in 0..blocks_in_piece {
            if cache.find_piece(key).map_or(true, |pe| pe.block_present(i)) {
                continue;
            }
            drop(cache);

            let Some(mut buf) = self.pool.allocate("read cache") else {
                cache = self.cache.lock();
                let stray = cache.unpin_piece(key);
                drop(cache);
                self.abort_jobs(stray);
                return job.fail(JobError::new(
                    DiskError::OutOfMemory,
                    Operation::AllocCachePiece,
                ));
            };
            let offset = i * block_size;
            buf.truncate(piece_len - offset);

            log::trace!("do_cache_piece: reading (piece: {} block: {})", job.piece, i);
            let start_time = Instant::now();
            let mut bufs = [buf];
            let ret = storage
                .backend()
                .readv(&mut bufs, job.piece, offset as u32, job.flags);

            cache = self.cache.lock();
            match ret {
                Ok(_) => {
                    let elapsed = start_time.elapsed().as_micros() as u64;
                    let mut stats = self.stats.lock();
                    stats.read_time.add_sample(elapsed as i64);
                    stats.stats.cumulative_read_time += elapsed;
                    stats.stats.cumulative_job_time += elapsed;
                    stats.stats.blocks_read += 1;
                    stats.stats.reads += 1;
                    drop(stats);
                    let [buf] = bufs;
                    cache.insert_blocks(key, i, vec![buf]);
                }
                Err(e) => {
                    job.fail(JobError::new(e, Operation::Readv));
                    break;
                }
            }
        }

        let stray = cache.unpin_piece(key);
        drop(cache);
        self.abort_jobs(stray);
    }

    fn do_finalize_file(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("finalize job without storage");
        let Action::FinalizeFile { file } = &job.action else {
            return;
        };
        if let Err(e) = storage.backend().finalize_file(*file) {
            job.fail(JobError::new(e, Operation::FinalizeFile));
        }
    }

    fn do_flush_piece(&self, job: &mut Job, settings: &DiskSettings) {
        let storage = job.storage.clone().expect("flush job without storage");
        let key = (storage.id(), job.piece);
        let mut cache = self.cache.lock();
        if cache.has_live_piece(key) {
            self.try_flush_hashed(
                &mut cache,
                key,
                settings.write_cache_line_size,
                settings,
            );
        }
    }

    /// Runs for the flush job enqueued when a piece takes its first dirty
    /// block. By now the blocks may well have been flushed through another
    /// mechanism already.
    fn do_flush_hashed(&self, job: &mut Job, settings: &DiskSettings) {
        let storage = job.storage.clone().expect("flush job without storage");
        let key = (storage.id(), job.piece);
        let mut cache = self.cache.lock();
        if !cache.has_live_piece(key) {
            return;
        }
        cache.release_flush_slot(key);
        if cache.find_piece(key).map_or(0, |pe| pe.num_dirty) == 0 {
            return;
        }
        if !settings.disable_hash_checks {
            cache.ensure_hash(key);
        }
        cache.pin_piece(key);
        self.kick_hasher(&mut cache, key);
        self.try_flush_hashed(&mut cache, key, settings.write_cache_line_size, settings);
        let stray = cache.unpin_piece(key);
        drop(cache);
        self.abort_jobs(stray);
    }

    fn do_flush_storage(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("flush job without storage");
        let mut cache = self.cache.lock();
        self.flush_cache_op(&mut cache, Some(&storage), super::FLUSH_WRITE_CACHE);
    }

    fn do_file_priority(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("priority job without storage");
        let Action::FilePriority { prios } = &job.action else {
            return;
        };
        if let Err(e) = storage.backend().set_file_priority(prios) {
            job.fail(JobError::new(e, Operation::FilePriority));
        }
    }

    fn do_load_torrent(&self, job: &mut Job) {
        let Action::LoadTorrent { path } = &job.action else {
            return;
        };
        match std::fs::read(path) {
            Ok(data) => job.out_data = Some(data),
            Err(e) => {
                job.fail(JobError::new(e.into(), Operation::LoadTorrent))
            }
        }
    }

    /// This job won't complete until all outstanding operations on the piece
    /// are done and its buffers have been dropped.
    fn do_clear_piece(&self, job: Job) -> Dispatch {
        let storage = job.storage.clone().expect("clear job without storage");
        let key = (storage.id(), job.piece);
        let mut cache = self.cache.lock();
        let Some(pe) = cache.find_piece_mut(key) else {
            return Dispatch::Done(job);
        };
        debug_assert!(!pe.hashing);
        pe.hashing_done = false;
        pe.hash = None;
        pe.need_readback = false;

        let (evicted, jobs) = cache.evict_piece(key);
        drop(cache);
        if evicted {
            self.abort_jobs(jobs);
            return Dispatch::Done(job);
        }
        // the fence guarantees nothing else is running on this storage, but
        // a peer may still hold a read reference; try again shortly
        Dispatch::Retry(job)
    }

    fn do_tick(&self, job: &mut Job) {
        let storage = job.storage.clone().expect("tick job without storage");
        job.ret = storage.backend().tick() as i32;
    }

    // ---- completion ----

    /// Fails every job with an abort error and routes them to completion.
    pub(crate) fn abort_jobs(&self, mut jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        for job in &mut jobs {
            job.fail(JobError::aborted());
        }
        self.add_completed_jobs(jobs);
    }

    pub(crate) fn add_completed_job(&self, job: Job) {
        self.add_completed_jobs(vec![job]);
    }

    /// Posts finished jobs to the completion ring, releasing fence-blocked
    /// jobs back into the queues along the way. The caller's event loop is
    /// woken when the ring turns non-empty.
    pub(crate) fn add_completed_jobs(&self, jobs: Vec<Job>) {
        let mut unblocked = 0usize;
        for job in &jobs {
            let Some(storage) = &job.storage else {
                continue;
            };
            if !job.in_progress() {
                continue;
            }
            match storage.fence.job_complete(job.action.is_fence()) {
                Released::None => {}
                Released::Fence(fence_job) => {
                    unblocked += 1;
                    let mut q = self.queues.lock();
                    q.general.push_front(*fence_job);
                    self.job_cond.notify_one();
                }
                Released::Unblocked(released) => {
                    unblocked += released.len();
                    for released_job in released {
                        self.queue_job(released_job);
                    }
                }
            }
        }
        if unblocked > 0 {
            log::trace!("unblocked {} jobs", unblocked);
            let mut blocked = self.num_blocked_jobs.load(Ordering::Relaxed);
            loop {
                let next = blocked.saturating_sub(unblocked);
                match self.num_blocked_jobs.compare_exchange(
                    blocked,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => blocked = actual,
                }
            }
        }

        let mut ring = self.completed.lock();
        let need_post = ring.jobs.is_empty();
        ring.jobs.extend(jobs);
        if need_post && !ring.jobs.is_empty() {
            if let Some(notify) = &ring.notify {
                let _ = notify.send(());
            }
        }
    }
}
