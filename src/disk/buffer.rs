//! The block buffer pool.
//!
//! Every block buffer in flight is accounted here: blocks held by the cache,
//! blocks being read or written by storage calls, and read-cache blocks
//! retained by peer sessions. A buffer releases its accounting when the last
//! handle to it is dropped, which for shared cache blocks means when the last
//! peer session lets go of its reference.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

/// Implemented by callers that want to be told when block buffers free up
/// after an allocation failure, so they can resume issuing requests instead
/// of polling.
pub trait DiskObserver: Send + Sync {
    /// Called when the pool drops back below its watermark.
    fn on_disk(&self);
}

struct PoolState {
    /// Number of block buffers currently accounted against the pool.
    in_use: usize,
    /// The configured budget in blocks. The pool allows transient overshoot
    /// up to `hard_cap` so uncached fallback paths keep working under
    /// pressure.
    limit: usize,
    /// Set once an allocation pushed `in_use` past `limit`; cleared when the
    /// pool drains below the low watermark, at which point observers are
    /// notified.
    exceeded: bool,
    /// Set when the soft limit is crossed, consumed by the disk handle which
    /// turns it into a single queued trim job.
    trim_pending: bool,
    observers: Vec<Weak<dyn DiskObserver>>,
}

struct PoolInner {
    block_size: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn hard_cap(limit: usize) -> usize {
        // keep headroom for in-flight uncached operations even when the
        // cache budget is tiny or zero
        (limit * 2).max(64)
    }

    fn release(&self, blocks: usize) {
        let mut state = self.state.lock();
        debug_assert!(state.in_use >= blocks);
        state.in_use = state.in_use.saturating_sub(blocks);

        let low_watermark = state.limit.saturating_sub(state.limit / 4);
        if state.exceeded && state.in_use <= low_watermark {
            state.exceeded = false;
            let observers = std::mem::take(&mut state.observers);
            drop(state);
            for o in observers {
                if let Some(o) = o.upgrade() {
                    o.on_disk();
                }
            }
        }
    }
}

/// A shared handle to the pool. Cloning is cheap and all clones account
/// against the same budget.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(block_size: usize, limit_blocks: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                block_size,
                state: Mutex::new(PoolState {
                    in_use: 0,
                    limit: limit_blocks,
                    exceeded: false,
                    trim_pending: false,
                    observers: Vec::new(),
                }),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    pub(crate) fn limit(&self) -> usize {
        self.inner.state.lock().limit
    }

    pub(crate) fn set_limit(&self, blocks: usize) {
        self.inner.state.lock().limit = blocks;
    }

    /// The number of callers currently waiting for buffers to free up.
    pub(crate) fn num_waiters(&self) -> usize {
        self.inner.state.lock().observers.len()
    }

    /// Allocates one zeroed block-sized buffer.
    ///
    /// Returns `None` when the pool is exhausted past its headroom; the
    /// category only serves the log line, mirroring what the allocation was
    /// for.
    pub fn allocate(&self, category: &'static str) -> Option<PoolBuf> {
        {
            let mut state = self.inner.state.lock();
            if state.in_use >= PoolInner::hard_cap(state.limit) {
                log::warn!(
                    "Failed to allocate disk buffer for {} ({} blocks in use)",
                    category,
                    state.in_use
                );
                return None;
            }
            state.in_use += 1;
            if state.limit > 0 && state.in_use > state.limit {
                state.exceeded = true;
                state.trim_pending = true;
            }
        }
        Some(PoolBuf {
            data: vec![0; self.inner.block_size],
            len: self.inner.block_size,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Takes ownership of a peer-supplied buffer, accounting it against the
    /// pool. Never fails: write payloads already exist in memory, refusing
    /// them would not reclaim anything.
    pub fn wrap(&self, data: Vec<u8>) -> PoolBuf {
        let len = data.len();
        let mut state = self.inner.state.lock();
        state.in_use += 1;
        if state.limit > 0 && state.in_use > state.limit {
            state.exceeded = true;
            state.trim_pending = true;
        }
        drop(state);
        PoolBuf {
            data,
            len,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Consumes the trim request flag. The caller queues at most one trim
    /// job per consumed request.
    pub(crate) fn take_trim_request(&self) -> bool {
        let mut state = self.inner.state.lock();
        std::mem::take(&mut state.trim_pending)
    }

    pub fn subscribe(&self, observer: Weak<dyn DiskObserver>) {
        let mut state = self.inner.state.lock();
        state.observers.retain(|o| o.strong_count() > 0);
        state.observers.push(observer);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BufferPool")
            .field("block_size", &self.inner.block_size)
            .field("in_use", &state.in_use)
            .field("limit", &state.limit)
            .finish()
    }
}

/// A pool-accounted block buffer.
///
/// The logical length may be shorter than the allocation for the last block
/// of a short piece; `truncate` adjusts it without reallocating. Dropping the
/// buffer (or the last `Arc` clone of it) returns its accounting to the pool
/// and may wake observers.
pub struct PoolBuf {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PoolBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shortens the logical length of the buffer. A no-op if `len` is not
    /// smaller than the current length.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }
}

impl Deref for PoolBuf {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuf").field("len", &self.len).finish()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.pool.release(1);
    }
}
