use std::{fmt, ops::Deref, sync::Arc};

use crate::{disk::buffer::PoolBuf, PieceIndex, BLOCK_LEN};

/// Identifies one block of a piece on the wire: requests, writes and cache
/// lookups all address data this way.
///
/// Every block is `BLOCK_LEN` bytes except possibly a piece's last one,
/// whose length is whatever remains of the piece. Offsets are always
/// multiples of `BLOCK_LEN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes, at most `BLOCK_LEN`.
    pub len: u32,
}

impl BlockInfo {
    /// The index of this block within its piece.
    pub fn index_in_piece(&self) -> usize {
        // a short length is only legal for the last block of a piece, so
        // the offset alone determines the index
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(piece: {} offset: {} len: {})",
            self.piece_index, self.offset, self.len
        )
    }
}

/// Returns the effective length of the block at `block_index` in a piece of
/// `piece_len` bytes: `BLOCK_LEN` for all but the last block, the remainder
/// for the last one when the piece is not an exact multiple.
///
/// # Panics
///
/// Panics if the block would start at or past the end of the piece.
pub fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_offset = block_index as u32 * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length, counting a
/// trailing partial block as a whole one.
pub fn block_count(piece_len: u32) -> usize {
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Blocks are cached in memory and are shared between the disk workers and
/// peer session tasks. Therefore we use atomic reference counts to make sure
/// that even if a block is evicted from cache, the peer still using it still
/// has a valid reference to it. The underlying buffer stays accounted against
/// the buffer pool until the last clone is dropped.
pub type CachedBlock = Arc<PoolBuf>;

/// Abstracts over the block data type.
///
/// A block may be just a pool buffer owned by the receiver, or it may be a
/// reference into the cache.
#[derive(Debug)]
pub enum BlockData {
    Owned(PoolBuf),
    Cached(CachedBlock),
}

impl BlockData {
    /// Returns the raw block if it's owned.
    ///
    /// # Panics
    ///
    /// This method panics if the block is not owned and is in the cache.
    pub fn into_owned(self) -> PoolBuf {
        match self {
            Self::Owned(b) => b,
            _ => panic!("cannot move block out of cache"),
        }
    }
}

impl Deref for BlockData {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        match self {
            BlockData::Owned(b) => b.as_slice(),
            BlockData::Cached(b) => b.as_slice(),
        }
    }
}

impl From<PoolBuf> for BlockData {
    fn from(value: PoolBuf) -> Self {
        Self::Owned(value)
    }
}

impl From<CachedBlock> for BlockData {
    fn from(value: CachedBlock) -> Self {
        Self::Cached(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::buffer::BufferPool;

    // A piece of three blocks whose last block is short: flushing must not
    // write past the remainder and hashing covers only the real bytes, so
    // the geometry helpers have to report the trailing length exactly.
    const REMAINDER: u32 = 1021;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + REMAINDER;

    #[test]
    fn test_last_block_len_is_the_remainder() {
        // full blocks up to the tail
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
        // the tail is exactly what's left of the piece
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), REMAINDER);
        // in an exact-multiple piece even the last block is full
        assert_eq!(block_len(2 * BLOCK_LEN, 1), BLOCK_LEN);
    }

    #[test]
    #[should_panic]
    fn test_block_len_past_piece_end_panics() {
        // block 3 would start beyond the uneven piece's remainder
        block_len(UNEVEN_PIECE_LEN, 3);
    }

    #[test]
    fn test_block_count_rounds_up_partial_tail() {
        assert_eq!(block_count(2 * BLOCK_LEN), 2);
        // the 1021-byte tail still occupies a block slot of its own
        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
        assert_eq!(block_count(1), 1);
    }

    #[test]
    fn test_index_in_piece_follows_offset() {
        let full = BlockInfo {
            piece_index: 7,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        assert_eq!(full.index_in_piece(), 1);

        // a short block is addressed by its (aligned) offset like any other
        let tail = BlockInfo {
            piece_index: 7,
            offset: 2 * BLOCK_LEN,
            len: REMAINDER,
        };
        assert_eq!(tail.index_in_piece(), 2);
    }

    #[test]
    fn test_block_data_reads_the_same_owned_or_cached() {
        let pool = BufferPool::new(BLOCK_LEN as usize, 4);
        let bytes = vec![0x42; 100];

        let owned = BlockData::from(pool.wrap(bytes.clone()));
        assert_eq!(&*owned, bytes.as_slice());

        let cached = BlockData::from(Arc::new(pool.wrap(bytes.clone())));
        assert_eq!(&*cached, bytes.as_slice());

        // taking the owned variant back out hands over the pool buffer
        assert_eq!(owned.into_owned().as_slice(), bytes.as_slice());
    }

    #[test]
    #[should_panic]
    fn test_cached_block_cannot_be_moved_out() {
        let pool = BufferPool::new(BLOCK_LEN as usize, 4);
        let cached = BlockData::from(Arc::new(pool.wrap(vec![1, 2, 3])));
        let _ = cached.into_owned();
    }
}
