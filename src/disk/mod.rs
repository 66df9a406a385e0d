//! The disk I/O core: a block cache and a worker pool between the
//! network-facing peer sessions and the per-torrent storage backends.
//!
//! Requests enter through the `async_*` entry points as jobs, each carrying
//! a completion callback. Jobs with cache affinity consult the block cache
//! first; a hit completes inline on the caller thread. Everything else is
//! queued to the worker pool, which runs the matching handler, touches the
//! cache under its mutex, performs storage calls with no lock held, and
//! posts the finished job to the completion ring.
//!
//! The ring wakes the caller's event loop through an unbounded channel, the
//! same way engine alerts are delivered. The application drives completions:
//!
//! ```ignore
//! let (disk, mut completions) = Disk::new(BLOCK_LEN as usize);
//! while completions.recv().await.is_some() {
//!     disk.call_job_handlers();
//! }
//! ```

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Instant,
};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::{
    blockinfo::BlockInfo,
    error::{DiskError, JobError, Operation},
    storage::{Storage, StorageHandle, TorrentStorage},
    storage_info::StorageInfo,
    PieceIndex,
};

pub mod buffer;
pub(crate) mod cache;
pub(crate) mod fence;
pub(crate) mod flush;
pub(crate) mod hasher;
pub mod job;
pub mod settings;
pub mod stats;
pub(crate) mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

pub(crate) use flush::{FLUSH_DELETE_CACHE, FLUSH_READ_CACHE, FLUSH_WRITE_CACHE};

use buffer::{BufferPool, DiskObserver};
use cache::{BlockCache, TryReadResult};
use job::{Action, BlockCacheRef, Job, CACHE_HIT};
use settings::DiskSettings;
use stats::{CacheInfo, CachedPieceInfo, StatsState};
use worker::{CompletedRing, JobQueues, Shared};

/// Signals that the completion ring has turned non-empty; the receiver's
/// event loop should call [`Disk::call_job_handlers`]. The channel closes
/// when the last disk thread has shut down and drained everything.
pub type CompletionReceiver = UnboundedReceiver<()>;

/// Sizes the file-descriptor budget for disk files from the process's open
/// file limit: 20% of the descriptors go to disk files, the rest is left to
/// sockets, with a fixed margin for the event loop, log files and shared
/// objects.
#[derive(Debug, Clone, Copy)]
pub struct FilePool {
    size_limit: usize,
}

impl FilePool {
    const MARGIN: usize = 20;
    const DEFAULT_SIZE: usize = 40;

    pub fn from_rlimit() -> Self {
        let mut size_limit = Self::DEFAULT_SIZE;
        #[cfg(unix)]
        {
            let mut rl = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            // SAFETY: getrlimit only writes the struct we hand it.
            let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
            if ret == 0 {
                let avail =
                    (rl.rlim_cur as usize).saturating_sub(Self::MARGIN);
                size_limit = size_limit.max(avail * 2 / 10);
            }
        }
        Self { size_limit }
    }

    /// How many files the storage backends should keep open at most.
    pub fn size_limit(&self) -> usize {
        self.size_limit
    }
}

/// The public handle to the disk core. Cloning is cheap; all clones drive
/// the same worker pool and cache.
#[derive(Clone)]
pub struct Disk {
    shared: Arc<Shared>,
    file_pool: Arc<FilePool>,
}

impl Disk {
    /// Creates the disk core with one worker thread and returns it together
    /// with the completion wakeup channel.
    pub fn new(block_size: usize) -> (Self, CompletionReceiver) {
        let settings = DiskSettings::default();
        let pool = BufferPool::new(block_size, settings.cache_size);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            settings: ArcSwap::from_pointee(settings),
            cache: Mutex::new(BlockCache::new(pool.clone())),
            pool,
            queues: Mutex::new(JobQueues {
                general: Default::default(),
                hash: Default::default(),
                num_threads: 0,
            }),
            job_cond: Condvar::new(),
            hash_job_cond: Condvar::new(),
            completed: Mutex::new(CompletedRing {
                jobs: Vec::new(),
                notify: Some(notify_tx),
            }),
            uncork: Mutex::new(None),
            stats: Mutex::new(StatsState::new()),
            torrents: Mutex::new(Default::default()),
            threads: Mutex::new(Vec::new()),
            next_storage_id: AtomicUsize::new(0),
            num_running_threads: AtomicUsize::new(0),
            num_writing_threads: AtomicUsize::new(0),
            executing_jobs: AtomicUsize::new(0),
            num_blocked_jobs: AtomicUsize::new(0),
            last_expiry: Mutex::new(Instant::now()),
        });
        shared.set_num_threads(1, false);

        let disk = Self {
            shared,
            file_pool: Arc::new(FilePool::from_rlimit()),
        };
        (disk, notify_rx)
    }

    /// Registers a torrent's storage backend with the core.
    pub fn add_torrent(
        &self,
        backend: Box<dyn Storage>,
        info: StorageInfo,
    ) -> StorageHandle {
        let id = self.shared.next_storage_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(TorrentStorage::new(id, backend, info));
        self.shared.torrents.lock().insert(id, Arc::clone(&handle));
        handle
    }

    pub fn file_pool(&self) -> &FilePool {
        &self.file_pool
    }

    pub fn settings(&self) -> Arc<DiskSettings> {
        self.shared.settings.load_full()
    }

    // ---- asynchronous entry points ----

    /// Reads a block. Served inline from the cache when possible, otherwise
    /// queued; the callback runs either way.
    pub fn async_read(
        &self,
        storage: &StorageHandle,
        block: BlockInfo,
        flags: u32,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        debug_assert!(block.len as usize <= self.shared.pool.block_size());

        let mut job = Job::new(Action::Read, Some(Arc::clone(storage)));
        job.piece = block.piece_index;
        job.offset = block.offset;
        job.buffer_size = block.len;
        job.flags = flags;
        job.callback = Some(Box::new(callback));

        let settings = self.shared.settings.load();
        if settings.read_cache_enabled() {
            let mut cache = self.shared.cache.lock();
            match cache.try_read(&mut job) {
                TryReadResult::Hit(n) => {
                    drop(cache);
                    log::trace!("async_read: cache hit");
                    self.shared.stats.lock().stats.blocks_read_hit += 1;
                    job.flags |= CACHE_HIT;
                    job.ret = n as i32;
                    self.complete_inline(job);
                    return;
                }
                TryReadResult::NoMemory => {
                    drop(cache);
                    job.fail(JobError::new(
                        DiskError::OutOfMemory,
                        Operation::AllocCachePiece,
                    ));
                    self.complete_inline(job);
                    return;
                }
                TryReadResult::Miss => {}
            }
        }
        self.shared.add_job(job, false);
    }

    /// Stages a block written by a peer. The callback runs once the block is
    /// on disk (or failed).
    pub fn async_write(
        &self,
        storage: &StorageHandle,
        block: BlockInfo,
        data: Vec<u8>,
        flags: u32,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        debug_assert_eq!(block.len as usize, data.len());
        debug_assert!(block.len as usize <= self.shared.pool.block_size());
        debug_assert_eq!(
            block.offset as usize % self.shared.pool.block_size(),
            0
        );

        let buf = self.shared.pool.wrap(data);
        self.maybe_queue_trim();

        let mut job = Job::new(
            Action::Write { data: Some(buf) },
            Some(Arc::clone(storage)),
        );
        job.piece = block.piece_index;
        job.offset = block.offset;
        job.buffer_size = block.len;
        job.flags = flags;
        job.callback = Some(Box::new(callback));

        let settings = self.shared.settings.load();
        if settings.write_cache_enabled() {
            // count the job against the storage first; the fence may be up
            let job = match storage.fence.is_blocked(job, false) {
                Ok(job) => job,
                Err(()) => {
                    self.shared
                        .num_blocked_jobs
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let mut cache = self.shared.cache.lock();
            match cache.add_dirty_block(job) {
                Ok(key) => {
                    // at most one queued flush per piece, no matter how many
                    // blocks arrive back to back
                    let flush_needed = cache.claim_flush_slot(key);
                    drop(cache);
                    if flush_needed {
                        let mut flush = Job::new(
                            Action::FlushHashed,
                            Some(Arc::clone(storage)),
                        );
                        flush.piece = block.piece_index;
                        flush.flags = flags;
                        self.shared.add_job(flush, false);
                    }
                    return;
                }
                Err(job) => {
                    // cache full and not evictable right now; write through
                    drop(cache);
                    self.shared.queue_job(job);
                    return;
                }
            }
        }
        self.shared.add_job(job, false);
    }

    /// Computes a piece's SHA-1 digest. Completes inline when the cache
    /// already holds the finished digest.
    pub fn async_hash(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        flags: u32,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(Action::Hash, Some(Arc::clone(storage)));
        job.piece = piece;
        job.flags = flags;
        job.callback = Some(Box::new(callback));

        let piece_len = storage.piece_len(piece) as usize;
        let key = (storage.id(), piece);
        let mut cache = self.shared.cache.lock();
        if let Some(pe) = cache.find_piece_mut(key) {
            let done = !pe.hashing
                && pe.hash.as_ref().map_or(false, |ph| ph.offset >= piece_len);
            if done {
                let ph = pe.hash.take().unwrap();
                job.piece_hash = Some(ph.digest());
                if pe.cache_state != cache::CacheState::VolatileReadLru {
                    pe.hashing_done = true;
                }
                drop(cache);
                job.ret = 0;
                self.complete_inline(job);
                return;
            }
        }
        drop(cache);
        self.shared.add_job(job, false);
    }

    /// Prefetches a whole piece into the read cache.
    pub fn async_cache_piece(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        flags: u32,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(Action::CachePiece, Some(Arc::clone(storage)));
        job.piece = piece;
        job.flags = flags;
        job.callback = Some(Box::new(callback));
        self.shared.add_job(job, false);
    }

    /// Flushes whatever part of the piece qualifies under the configured
    /// write cache line.
    pub fn async_flush_piece(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(Action::FlushPiece, Some(Arc::clone(storage)));
        job.piece = piece;
        job.callback = Some(Box::new(callback));

        if self.shared.queues.lock().num_threads == 0 {
            job.fail(JobError::aborted());
            self.complete_inline(job);
            return;
        }
        self.shared.add_job(job, false);
    }

    /// Moves the torrent's files. Fenced: runs alone on its storage.
    pub fn async_move_storage(
        &self,
        storage: &StorageHandle,
        target: std::path::PathBuf,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(
            Action::MoveStorage { target },
            Some(Arc::clone(storage)),
        );
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    /// Closes the torrent's files after flushing dirty blocks. Fenced.
    pub fn async_release_files(
        &self,
        storage: &StorageHandle,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(Action::ReleaseFiles, Some(Arc::clone(storage)));
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    /// Deletes the torrent's files. Queued jobs for the storage abort, dirty
    /// blocks are dropped without flushing, and the delete itself runs once
    /// in-flight jobs drain. Fenced.
    pub fn async_delete_files(
        &self,
        storage: &StorageHandle,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        // remove cache blocks belonging to this torrent
        {
            let mut cache = self.shared.cache.lock();
            self.shared
                .flush_cache_op(&mut cache, Some(storage), FLUSH_DELETE_CACHE);
        }

        // abort jobs belonging to this torrent that are still queued
        let mut aborted = Vec::new();
        {
            let mut q = self.shared.queues.lock();
            let id = storage.id();
            let matches = |j: &Job| j.storage().map_or(false, |s| s.id() == id);
            let (mine, rest): (Vec<Job>, Vec<Job>) =
                q.general.drain(..).partition(&matches);
            q.general = rest.into();
            aborted.extend(mine);
            let (mine, rest): (Vec<Job>, Vec<Job>) =
                q.hash.drain(..).partition(&matches);
            q.hash = rest.into();
            aborted.extend(mine);
        }
        self.shared.abort_jobs(aborted);

        let mut job = Job::new(Action::DeleteFiles, Some(Arc::clone(storage)));
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    /// Validates resume data against the files on disk. Fenced.
    pub fn async_check_fastresume(
        &self,
        storage: &StorageHandle,
        resume_data: Vec<u8>,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(
            Action::CheckFastresume { resume_data },
            Some(Arc::clone(storage)),
        );
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    /// Serializes resume state after flushing dirty blocks. Fenced.
    pub fn async_save_resume_data(
        &self,
        storage: &StorageHandle,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job =
            Job::new(Action::SaveResumeData, Some(Arc::clone(storage)));
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    /// Renames one file of the torrent. Fenced.
    pub fn async_rename_file(
        &self,
        storage: &StorageHandle,
        file: usize,
        name: String,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(
            Action::RenameFile { file, name },
            Some(Arc::clone(storage)),
        );
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    /// Flushes and drops everything cached for the torrent, then releases
    /// its files and unregisters it. Fenced.
    pub fn async_stop_torrent(
        &self,
        storage: &StorageHandle,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(Action::StopTorrent, Some(Arc::clone(storage)));
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    /// Tells the backend a file is complete.
    pub fn async_finalize_file(
        &self,
        storage: &StorageHandle,
        file: usize,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(
            Action::FinalizeFile { file },
            Some(Arc::clone(storage)),
        );
        job.callback = Some(Box::new(callback));
        self.shared.add_job(job, false);
    }

    /// Applies per-file priorities. Fenced.
    pub fn async_set_file_priority(
        &self,
        storage: &StorageHandle,
        prios: Vec<u8>,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(
            Action::FilePriority { prios },
            Some(Arc::clone(storage)),
        );
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    /// Reads a metainfo file from disk; parsing is the caller's business.
    pub fn async_load_torrent(
        &self,
        path: std::path::PathBuf,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(Action::LoadTorrent { path }, None);
        job.callback = Some(Box::new(callback));
        self.shared.add_job(job, false);
    }

    /// Periodic backend housekeeping; the callback's return value reports
    /// whether the storage wants further ticks.
    pub fn async_tick_torrent(
        &self,
        storage: &StorageHandle,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(Action::Tick, Some(Arc::clone(storage)));
        job.callback = Some(Box::new(callback));
        self.shared.add_job(job, false);
    }

    /// Drops a piece from the cache, aborting anything suspended on it.
    /// Fenced, since queued writes must land or abort before the clear.
    pub fn async_clear_piece(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        callback: impl FnOnce(&mut Job) + Send + 'static,
    ) {
        let mut job = Job::new(Action::ClearPiece, Some(Arc::clone(storage)));
        job.piece = piece;
        job.callback = Some(Box::new(callback));
        self.shared.add_fence_job(storage, job);
    }

    // ---- synchronous operations ----

    /// Evicts every clean piece cached for the storage, aborting suspended
    /// jobs of the evicted entries. Dirty pieces stay.
    pub fn clear_read_cache(&self, storage: &StorageHandle) {
        let mut jobs = Vec::new();
        {
            let mut cache = self.shared.cache.lock();
            for piece in cache.cached_pieces_of(storage.id()) {
                let key = (storage.id(), piece);
                if cache.find_piece(key).map_or(0, |pe| pe.num_dirty) > 0 {
                    continue;
                }
                let (_, evicted_jobs) = cache.evict_piece(key);
                jobs.extend(evicted_jobs);
            }
        }
        self.shared.abort_jobs(jobs);
    }

    /// Synchronously drops one piece from the cache. The caller must know
    /// no job is outstanding on it (this is what the fenced
    /// `async_clear_piece` guarantees).
    pub fn clear_piece(&self, storage: &StorageHandle, piece: PieceIndex) {
        let key = (storage.id(), piece);
        let jobs = {
            let mut cache = self.shared.cache.lock();
            let Some(pe) = cache.find_piece_mut(key) else {
                return;
            };
            debug_assert!(!pe.hashing);
            pe.hashing_done = false;
            pe.hash = None;
            pe.need_readback = false;
            let (_, jobs) = cache.evict_piece(key);
            jobs
        };
        self.shared.abort_jobs(jobs);
    }

    /// Returns a read-cache block reference handed out by a completed read.
    pub fn reclaim_block(&self, r: BlockCacheRef) {
        let jobs = self.shared.cache.lock().reclaim_block(r);
        self.shared.abort_jobs(jobs);
    }

    /// Registers an observer to be woken when block buffers free up after
    /// an allocation failure.
    pub fn subscribe_to_disk(&self, observer: Weak<dyn DiskObserver>) {
        self.shared.pool.subscribe(observer);
    }

    /// Publishes a new settings snapshot and reconciles the cache with it.
    pub fn set_settings(&self, settings: DiskSettings) {
        self.shared.settings.store(Arc::new(settings.clone()));
        let mut cache = self.shared.cache.lock();
        cache.set_cache_size(settings.cache_size);
        self.shared.check_cache_level(&mut cache);
    }

    /// Grows or shrinks the worker pool. Every fourth worker is a hasher.
    pub fn set_num_threads(&self, count: usize) {
        self.shared.set_num_threads(count, false);
    }

    /// Stops all workers, waits for them, and drains the cache. The
    /// completion channel closes once the last worker has cleaned up.
    pub fn shutdown(&self) {
        self.shared.set_num_threads(0, true);
    }

    /// Wakes all workers; call after submitting a batch of jobs.
    pub fn submit_jobs(&self) {
        self.shared.submit_jobs();
    }

    /// Drains the completion ring, invoking each job's callback on the
    /// calling thread, then fires the uncork hook so network writes
    /// accumulated by the handlers go out together. Returns the number of
    /// jobs drained.
    pub fn call_job_handlers(&self) -> usize {
        let jobs = {
            let mut ring = self.shared.completed.lock();
            std::mem::take(&mut ring.jobs)
        };
        let count = jobs.len();

        let mut to_reclaim: Vec<BlockCacheRef> = Vec::new();
        for mut job in jobs {
            job.invoke_callback();
            // a callback that wants to keep its zero-copy block takes the
            // reference out of the job; leftovers are reclaimed here
            if let Some(r) = job.cache_ref.take() {
                to_reclaim.push(r);
            }
        }
        if !to_reclaim.is_empty() {
            let mut stray = Vec::new();
            {
                let mut cache = self.shared.cache.lock();
                for r in to_reclaim {
                    stray.extend(cache.reclaim_block(r));
                }
            }
            self.shared.abort_jobs(stray);
        }

        if let Some(uncork) = &*self.shared.uncork.lock() {
            uncork();
        }
        count
    }

    /// Installs the hook fired after each completion drain.
    pub fn set_uncork(&self, hook: impl Fn() + Send + 'static) {
        *self.shared.uncork.lock() = Some(Box::new(hook));
    }

    /// Snapshots counters, service-time averages and (optionally) the
    /// per-piece cache contents.
    pub fn get_cache_info(
        &self,
        storage: Option<&StorageHandle>,
        no_pieces: bool,
    ) -> CacheInfo {
        let mut stats = {
            let mut s = self.shared.stats.lock();
            s.maybe_flip();
            s.stats.clone()
        };
        let pieces: Vec<CachedPieceInfo> = {
            let cache = self.shared.cache.lock();
            cache.fill_stats(&mut stats);
            if no_pieces {
                Vec::new()
            } else {
                cache.piece_infos(storage.map(|s| s.id()))
            }
        };
        {
            let q = self.shared.queues.lock();
            stats.queued_jobs = q.general.len() + q.hash.len();
        }
        stats.pending_jobs = self.shared.executing_jobs.load(Ordering::Relaxed);
        stats.blocked_jobs =
            self.shared.num_blocked_jobs.load(Ordering::Relaxed);
        CacheInfo { stats, pieces }
    }

    // ---- internal ----

    /// Completes a job on the caller thread without a queue round trip.
    fn complete_inline(&self, mut job: Job) {
        job.invoke_callback();
        if let Some(r) = job.cache_ref.take() {
            let jobs = self.shared.cache.lock().reclaim_block(r);
            self.shared.abort_jobs(jobs);
        }
    }

    fn maybe_queue_trim(&self) {
        self.shared.maybe_queue_trim();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sha1::{Digest, Sha1};

    use super::test_utils::{mock_parts, MockStorage};
    use super::*;
    use crate::{blockinfo::BlockInfo, Sha1Hash, BLOCK_LEN};

    const BS: usize = BLOCK_LEN as usize;

    fn small_cache_settings() -> DiskSettings {
        DiskSettings {
            cache_size: 8,
            write_cache_line_size: 4,
            read_cache_line_size: 4,
            ..Default::default()
        }
    }

    fn setup(
        settings: DiskSettings,
        piece_count: usize,
        piece_len: u32,
        last_piece_len: u32,
    ) -> (Disk, StorageHandle, Arc<MockStorage>, CompletionReceiver) {
        let (disk, rx) = Disk::new(BS);
        disk.set_settings(settings);
        let (info, mock) = mock_parts(piece_count, piece_len, last_piece_len);
        let storage = disk.add_torrent(Box::new(Arc::clone(&mock)), info);
        (disk, storage, mock, rx)
    }

    /// Drains completions until the condition holds, failing the test if it
    /// never does.
    fn drain_until(disk: &Disk, mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            disk.call_job_handlers();
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for completions");
    }

    /// Collects (ret, error) pairs from completed jobs.
    #[derive(Clone, Default)]
    struct Results(Arc<parking_lot::Mutex<Vec<(i32, Option<JobError>)>>>);

    impl Results {
        fn callback(&self) -> impl FnOnce(&mut Job) + Send + 'static {
            let results = self.0.clone();
            move |job: &mut Job| {
                results.lock().push((job.ret, job.error.clone()));
            }
        }

        fn len(&self) -> usize {
            self.0.lock().len()
        }

        fn all_ok(&self) -> bool {
            self.0.lock().iter().all(|(_, e)| e.is_none())
        }

        fn aborted_count(&self) -> usize {
            self.0
                .lock()
                .iter()
                .filter(|(_, e)| e.as_ref().map_or(false, |e| e.is_aborted()))
                .count()
        }
    }

    fn block(piece: usize, index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: piece,
            offset: (index * BS) as u32,
            len: BLOCK_LEN,
        }
    }

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add((i % 97) as u8)).collect()
    }

    #[test]
    fn test_write_cache_line_flushes_as_single_writev() {
        let (disk, storage, mock, _rx) =
            setup(small_cache_settings(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        let results = Results::default();

        let mut expected = Vec::new();
        for i in 0..4 {
            let data = pattern(i as u8, BS);
            expected.extend_from_slice(&data);
            disk.async_write(&storage, block(0, i), data, 0, results.callback());
        }
        disk.submit_jobs();

        drain_until(&disk, || results.len() == 4);
        assert!(results.all_ok());

        // the four dirty blocks went out as one vectored write
        assert_eq!(mock.writes.lock().as_slice(), &[(0, 0, 4)]);
        assert_eq!(&mock.contents()[..4 * BS], expected.as_slice());

        // flushing again is a no-op, every block is clean
        let flushed = Results::default();
        disk.async_flush_piece(&storage, 0, flushed.callback());
        drain_until(&disk, || flushed.len() == 1);
        assert_eq!(mock.writes.lock().len(), 1);

        let info = disk.get_cache_info(Some(&storage), false);
        assert_eq!(info.stats.write_cache_blocks, 0);
        assert_eq!(info.pieces.len(), 1);
        assert_eq!(info.pieces[0].kind, stats::CachedPieceKind::ReadCache);
    }

    #[test]
    fn test_read_pads_to_cache_line_then_hits() {
        let (disk, storage, mock, _rx) =
            setup(small_cache_settings(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        mock.seed();
        let expected = mock.contents();

        let first = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let first = first.clone();
            disk.async_read(&storage, block(3, 0), 0, move |job| {
                first
                    .lock()
                    .push((job.ret, job.flags, job.buffer.take().map(|b| b.to_vec())));
            });
        }
        drain_until(&disk, || first.lock().len() == 1);

        // the one-block request was padded out to the full cache line
        assert_eq!(mock.reads.lock().as_slice(), &[(3, 0, 4)]);
        {
            let first = first.lock();
            let (ret, flags, data) = &first[0];
            assert_eq!(*ret, BS as i32);
            assert_eq!(flags & job::CACHE_HIT, 0);
            assert_eq!(
                data.as_deref().unwrap(),
                &expected[3 * 4 * BS..3 * 4 * BS + BS]
            );
        }

        // the neighbor block is now served inline from the cache
        let second = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let second = second.clone();
            disk.async_read(&storage, block(3, 1), 0, move |job| {
                second
                    .lock()
                    .push((job.flags, job.buffer.take().map(|b| b.to_vec())));
            });
        }
        let second = second.lock();
        assert_eq!(second.len(), 1, "cache hit must complete inline");
        let (flags, data) = &second[0];
        assert_ne!(flags & job::CACHE_HIT, 0);
        assert_eq!(
            data.as_deref().unwrap(),
            &expected[3 * 4 * BS + BS..3 * 4 * BS + 2 * BS]
        );
        // still just the one storage read
        assert_eq!(mock.reads.lock().len(), 1);
    }

    #[test]
    fn test_written_block_is_readable_before_flush() {
        let settings = DiskSettings {
            write_cache_line_size: 16,
            ..small_cache_settings()
        };
        let (disk, storage, mock, _rx) = setup(settings, 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);

        let data = pattern(42, BS);
        let results = Results::default();
        disk.async_write(&storage, block(1, 0), data.clone(), 0, results.callback());

        let read_back = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let read_back = read_back.clone();
            disk.async_read(&storage, block(1, 0), 0, move |job| {
                read_back.lock().push(job.buffer.take().map(|b| b.to_vec()));
            });
        }
        // nothing was flushed or read from storage, yet the data is there
        assert_eq!(read_back.lock().len(), 1);
        assert_eq!(read_back.lock()[0].as_deref().unwrap(), data.as_slice());
        assert!(mock.writes.lock().is_empty());
        assert!(mock.reads.lock().is_empty());
    }

    fn sha1_of(data: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn test_hash_after_writes_matches_content() {
        let (disk, storage, _mock, _rx) =
            setup(small_cache_settings(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);

        let mut piece_data = Vec::new();
        let writes = Results::default();
        for i in 0..4 {
            let data = pattern(i as u8 + 10, BS);
            piece_data.extend_from_slice(&data);
            disk.async_write(&storage, block(0, i), data, 0, writes.callback());
        }
        drain_until(&disk, || writes.len() == 4);

        let digests = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for _ in 0..2 {
            let digests = digests.clone();
            disk.async_hash(&storage, 0, 0, move |job| {
                digests.lock().push(job.piece_hash.unwrap());
            });
        }
        drain_until(&disk, || digests.lock().len() == 2);

        let expected = sha1_of(&piece_data);
        let digests = digests.lock();
        assert_eq!(digests[0], expected);
        assert_eq!(digests[1], expected);
    }

    #[test]
    fn test_hash_of_short_last_piece_covers_real_bytes_only() {
        let (disk, storage, mock, _rx) =
            setup(small_cache_settings(), 2, 4 * BLOCK_LEN, BLOCK_LEN + 234);
        mock.seed();
        let contents = mock.contents();
        let last_piece = &contents[4 * BS..];
        assert_eq!(last_piece.len(), BS + 234);

        let digests = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let digests = digests.clone();
            disk.async_hash(&storage, 1, 0, move |job| {
                digests.lock().push(job.piece_hash.unwrap());
            });
        }
        drain_until(&disk, || digests.lock().len() == 1);
        assert_eq!(digests.lock()[0], sha1_of(last_piece));
    }

    #[test]
    fn test_zero_cache_size_uses_uncached_paths() {
        let settings = DiskSettings {
            cache_size: 0,
            ..Default::default()
        };
        let (disk, storage, mock, _rx) = setup(settings, 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        mock.seed();

        let writes = Results::default();
        disk.async_write(&storage, block(0, 0), pattern(1, BS), 0, writes.callback());
        drain_until(&disk, || writes.len() == 1);
        // straight to storage, one single-buffer write
        assert_eq!(mock.writes.lock().as_slice(), &[(0, 0, 1)]);

        let reads = Results::default();
        disk.async_read(&storage, block(2, 1), 0, reads.callback());
        drain_until(&disk, || reads.len() == 1);
        assert_eq!(mock.reads.lock().as_slice(), &[(2, BLOCK_LEN, 1)]);

        let info = disk.get_cache_info(None, false);
        assert_eq!(info.stats.num_pieces, 0);
    }

    #[test]
    fn test_delete_files_aborts_queued_reads() {
        let settings = DiskSettings {
            read_cache_line_size: 1,
            ..small_cache_settings()
        };
        let (disk, storage, mock, _rx) = setup(settings, 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        mock.seed();
        *mock.read_delay.lock() = Some(Duration::from_millis(50));

        let reads = Results::default();
        disk.async_read(&storage, block(0, 0), 0, reads.callback());
        // give the worker time to pick the first read up
        std::thread::sleep(Duration::from_millis(15));
        for piece in 1..4 {
            disk.async_read(&storage, block(piece, 0), 0, reads.callback());
        }

        let deleted = Results::default();
        disk.async_delete_files(&storage, deleted.callback());

        drain_until(&disk, || reads.len() == 4 && deleted.len() == 1);
        // the running read finished normally, the queued ones were aborted
        assert_eq!(reads.aborted_count(), 3);
        assert!(deleted.all_ok());
        assert!(mock.deleted.load(std::sync::atomic::Ordering::SeqCst));
        // nothing of this torrent is left in the cache
        let info = disk.get_cache_info(Some(&storage), false);
        assert!(info.pieces.is_empty());
    }

    #[test]
    fn test_stripe_flush_waits_for_all_members() {
        let settings = DiskSettings {
            cache_size: 32,
            // two pieces per cache line, whole stripes only
            write_cache_line_size: 8,
            allow_partial_disk_writes: false,
            ..Default::default()
        };
        let (disk, storage, mock, _rx) = setup(settings, 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        let results = Results::default();

        for i in 0..4 {
            disk.async_write(&storage, block(0, i), pattern(i as u8, BS), 0, results.callback());
        }
        // piece 0 is full and hashed, but its stripe buddy is missing
        std::thread::sleep(Duration::from_millis(100));
        disk.call_job_handlers();
        assert!(mock.writes.lock().is_empty());

        for i in 0..2 {
            disk.async_write(&storage, block(1, i), pattern(i as u8, BS), 0, results.callback());
        }
        std::thread::sleep(Duration::from_millis(100));
        disk.call_job_handlers();
        // half a buddy is not enough either
        assert!(mock.writes.lock().is_empty());

        for i in 2..4 {
            disk.async_write(&storage, block(1, i), pattern(i as u8, BS), 0, results.callback());
        }
        drain_until(&disk, || results.len() == 8);
        assert!(results.all_ok());
        // the full stripe went out as one contiguous vectored write
        assert_eq!(mock.writes.lock().as_slice(), &[(0, 0, 8)]);
    }

    #[test]
    fn test_shrinking_cache_evicts_clean_blocks() {
        let (disk, storage, mock, _rx) =
            setup(small_cache_settings(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        mock.seed();

        let cached = Results::default();
        disk.async_cache_piece(&storage, 0, 0, cached.callback());
        disk.async_cache_piece(&storage, 1, 0, cached.callback());
        drain_until(&disk, || cached.len() == 2);
        assert_eq!(disk.get_cache_info(None, true).stats.read_cache_blocks, 8);

        let mut settings = small_cache_settings();
        settings.cache_size = 2;
        disk.set_settings(settings);

        let info = disk.get_cache_info(None, true);
        assert!(info.stats.read_cache_blocks <= 2);
        assert_eq!(info.stats.write_cache_blocks, 0);
    }

    #[test]
    fn test_storage_scoped_operations_reach_backend() {
        let (disk, storage, mock, _rx) =
            setup(small_cache_settings(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);

        let results = Results::default();
        disk.async_move_storage(&storage, "/new/home".into(), results.callback());
        disk.async_rename_file(&storage, 2, "renamed.bin".into(), results.callback());
        disk.async_set_file_priority(&storage, vec![1, 0, 7], results.callback());
        disk.async_finalize_file(&storage, 1, results.callback());
        disk.async_check_fastresume(&storage, b"fr".to_vec(), results.callback());
        disk.async_tick_torrent(&storage, results.callback());
        disk.submit_jobs();
        drain_until(&disk, || results.len() == 6);
        assert!(results.all_ok());

        assert_eq!(mock.moves.lock()[0], std::path::PathBuf::from("/new/home"));
        assert_eq!(mock.renames.lock().as_slice(), &[(2, "renamed.bin".to_string())]);
        assert_eq!(mock.priorities.lock().as_slice(), &[vec![1, 0, 7]]);
        assert_eq!(mock.finalized.lock().as_slice(), &[1]);
        assert!(mock.ticked.load(std::sync::atomic::Ordering::SeqCst));

        let resume = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let resume = resume.clone();
            disk.async_save_resume_data(&storage, move |job| {
                resume.lock().push(job.out_data.take());
            });
        }
        drain_until(&disk, || resume.lock().len() == 1);
        assert_eq!(resume.lock()[0].as_deref(), Some(b"resume".as_slice()));
    }

    #[test]
    fn test_load_torrent_returns_file_bytes() {
        let (disk, _storage, _mock, _rx) =
            setup(small_cache_settings(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);

        let path = std::env::temp_dir().join(format!(
            "bt-disk-load-test-{}",
            std::process::id()
        ));
        std::fs::write(&path, b"d4:infoe").unwrap();

        let loaded = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let loaded = loaded.clone();
            disk.async_load_torrent(path.clone(), move |job| {
                loaded.lock().push(job.out_data.take());
            });
        }
        drain_until(&disk, || loaded.lock().len() == 1);
        assert_eq!(loaded.lock()[0].as_deref(), Some(b"d4:infoe".as_slice()));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_clear_piece_flushes_pending_writes_first() {
        let settings = DiskSettings {
            write_cache_line_size: 16,
            ..small_cache_settings()
        };
        let (disk, storage, mock, _rx) = setup(settings, 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);

        let writes = Results::default();
        disk.async_write(&storage, block(0, 0), pattern(1, BS), 0, writes.callback());
        disk.async_write(&storage, block(0, 1), pattern(2, BS), 0, writes.callback());

        let cleared = Results::default();
        disk.async_clear_piece(&storage, 0, cleared.callback());

        drain_until(&disk, || writes.len() == 2 && cleared.len() == 1);
        // the fence flushed the dirty blocks before the clear ran
        assert!(writes.all_ok());
        assert!(!mock.writes.lock().is_empty());
        let info = disk.get_cache_info(Some(&storage), false);
        assert!(info.pieces.is_empty());
    }

    #[test]
    fn test_write_error_fails_jobs_but_keeps_blocks() {
        let settings = DiskSettings {
            write_cache_line_size: 1,
            ..small_cache_settings()
        };
        let (disk, storage, mock, _rx) = setup(settings, 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        mock.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);

        let data = pattern(9, BS);
        let writes = Results::default();
        disk.async_write(&storage, block(0, 0), data.clone(), 0, writes.callback());
        drain_until(&disk, || writes.len() == 1);
        assert!(!writes.all_ok());

        // the dirty block survived the failed flush and can be retried
        assert_eq!(disk.get_cache_info(None, true).stats.write_cache_blocks, 1);

        mock.fail_writes.store(false, std::sync::atomic::Ordering::SeqCst);
        let flushed = Results::default();
        disk.async_flush_piece(&storage, 0, flushed.callback());
        drain_until(&disk, || {
            flushed.len() == 1
                && disk.get_cache_info(None, true).stats.write_cache_blocks == 0
        });
        assert_eq!(&mock.contents()[..BS], data.as_slice());
    }

    #[test]
    fn test_stop_torrent_flushes_and_drops_cache() {
        let settings = DiskSettings {
            write_cache_line_size: 16,
            ..small_cache_settings()
        };
        let (disk, storage, mock, _rx) = setup(settings, 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);

        let data = pattern(5, BS);
        let writes = Results::default();
        disk.async_write(&storage, block(2, 0), data.clone(), 0, writes.callback());

        let stopped = Results::default();
        disk.async_stop_torrent(&storage, stopped.callback());

        drain_until(&disk, || writes.len() == 1 && stopped.len() == 1);
        assert!(writes.all_ok());
        assert!(stopped.all_ok());
        assert!(mock.released.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(&mock.contents()[2 * 4 * BS..2 * 4 * BS + BS], data.as_slice());
        assert!(disk.get_cache_info(None, false).pieces.is_empty());
    }

    #[test]
    fn test_volatile_reads_stay_out_of_the_main_lists() {
        let (disk, storage, mock, _rx) =
            setup(small_cache_settings(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        mock.seed();

        let reads = Results::default();
        disk.async_read(&storage, block(0, 0), job::VOLATILE_READ, reads.callback());
        drain_until(&disk, || reads.len() == 1);

        let info = disk.get_cache_info(None, false);
        assert_eq!(info.pieces.len(), 1);
        assert_eq!(info.pieces[0].kind, stats::CachedPieceKind::VolatileReadCache);
        assert_eq!(info.stats.volatile_pieces, 1);
    }

    #[test]
    fn test_expired_write_blocks_are_flushed() {
        let settings = DiskSettings {
            write_cache_line_size: 16,
            cache_expiry: 0,
            ..small_cache_settings()
        };
        let (disk, storage, mock, _rx) = setup(settings.clone(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);

        let writes = Results::default();
        disk.async_write(&storage, block(0, 0), pattern(3, BS), 0, writes.callback());
        assert!(mock.writes.lock().is_empty());

        // with expiry at zero every dirty piece is overdue
        {
            let settings = disk.shared.settings.load_full();
            let mut cache = disk.shared.cache.lock();
            disk.shared.flush_expired_write_blocks(&mut cache, &settings);
        }
        drain_until(&disk, || writes.len() == 1);
        assert!(writes.all_ok());
        assert_eq!(mock.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_loop_drains_and_ends_on_shutdown() {
        let (disk, mut completions) = Disk::new(BS);
        disk.set_settings(DiskSettings {
            cache_size: 0,
            ..Default::default()
        });
        let (info, mock) = mock_parts(4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        let storage = disk.add_torrent(Box::new(Arc::clone(&mock)), info);

        let results = Results::default();
        disk.async_write(
            &storage,
            block(0, 0),
            pattern(7, BS),
            0,
            results.callback(),
        );

        // the ring's empty-to-non-empty transition posts exactly one wakeup
        completions.recv().await.expect("expected a completion wakeup");
        let drained = disk.call_job_handlers();
        assert_eq!(drained, 1);
        assert_eq!(results.len(), 1);

        let disk2 = disk.clone();
        let shutdown =
            tokio::task::spawn_blocking(move || disk2.shutdown());
        // the channel closes once the last worker has cleaned up
        while completions.recv().await.is_some() {
            disk.call_job_handlers();
        }
        shutdown.await.unwrap();
    }

    #[test]
    fn test_uncork_hook_fires_after_drain() {
        let (disk, storage, _mock, _rx) =
            setup(small_cache_settings(), 4, 4 * BLOCK_LEN, 4 * BLOCK_LEN);
        let uncorks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let uncorks = uncorks.clone();
            disk.set_uncork(move || {
                uncorks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }

        let results = Results::default();
        disk.async_tick_torrent(&storage, results.callback());
        drain_until(&disk, || results.len() == 1);
        assert!(uncorks.load(std::sync::atomic::Ordering::SeqCst) > 0);
    }
}
