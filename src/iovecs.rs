//! The helper type for the (buffer, length) pairs handed to a single
//! scatter/gather storage call.
//!
//! Cache blocks are allocated at the canonical block length, but the last
//! block of a torrent's last piece may be shorter. Bounding an [`IoVec`] by an
//! explicit length makes sure a vectored write never extends a file past the
//! piece's real size, without copying the buffer.
//!
//! Each entry keeps a clone of the cached block it refers to, so the buffer
//! stays alive for the duration of the storage call even if the cache mutex is
//! released and the piece is touched concurrently.

use crate::blockinfo::CachedBlock;

/// One entry of a vectored I/O operation: a cached block buffer bounded by a
/// byte length.
#[derive(Debug, Clone)]
pub struct IoVec {
    buf: CachedBlock,
    len: usize,
}

impl IoVec {
    /// Bounds `buf` by `len` bytes. `len` may not exceed the buffer's length.
    pub fn bounded(buf: CachedBlock, len: usize) -> Self {
        debug_assert!(len <= buf.len());
        debug_assert!(len > 0);
        IoVec { buf, len }
    }

    /// The bytes this entry contributes to the vectored operation.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf.as_slice()[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Returns the total byte length of a slice of iovecs.
pub fn total_len(bufs: &[IoVec]) -> usize {
    bufs.iter().map(IoVec::len).sum()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::disk::buffer::BufferPool;

    #[test]
    fn test_bounded_trims_short_last_block() {
        let pool = BufferPool::new(0x4000, 8);
        let buf = pool.wrap(vec![0xab; 0x4000]);
        let iov = IoVec::bounded(Arc::new(buf), 234);
        assert_eq!(iov.len(), 234);
        assert_eq!(iov.as_slice().len(), 234);
        assert!(iov.as_slice().iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_total_len() {
        let pool = BufferPool::new(0x4000, 8);
        let full = Arc::new(pool.wrap(vec![0; 0x4000]));
        let bufs = vec![
            IoVec::bounded(full.clone(), 0x4000),
            IoVec::bounded(full, 100),
        ];
        assert_eq!(total_len(&bufs), 0x4000 + 100);
    }
}
