use std::path::PathBuf;

use crate::{blockinfo, PieceIndex};

/// Information about a file in the torrent.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// file's relative path from the download directory.
    pub path: PathBuf,
    /// the file's length
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

/// Information about a torrent's storage details, such as the piece geometry
/// and the files of the download. This is the only geometry the disk core
/// consults; everything below it (file boundaries, allocation) belongs to the
/// storage backend.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    /// The total number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece. All pieces but the last are this long.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the lengths of all files in the torrent.
    pub download_len: u64,
    /// The files of the download.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Returns the length of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        assert!(index < self.piece_count, "piece index out of range");
        if index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Returns the number of blocks in the piece at the given index.
    pub fn blocks_in_piece(&self, index: PieceIndex) -> usize {
        blockinfo::block_count(self.piece_len(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    fn info(piece_count: usize, piece_len: u32, last_piece_len: u32) -> StorageInfo {
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len: (piece_count - 1) as u64 * piece_len as u64
                + last_piece_len as u64,
            files: Vec::new(),
        }
    }

    #[test]
    fn test_piece_len() {
        let info = info(3, 4 * BLOCK_LEN, BLOCK_LEN + 5);
        assert_eq!(info.piece_len(0), 4 * BLOCK_LEN);
        assert_eq!(info.piece_len(1), 4 * BLOCK_LEN);
        assert_eq!(info.piece_len(2), BLOCK_LEN + 5);
    }

    #[test]
    fn test_blocks_in_piece() {
        let info = info(2, 4 * BLOCK_LEN, BLOCK_LEN + 5);
        assert_eq!(info.blocks_in_piece(0), 4);
        assert_eq!(info.blocks_in_piece(1), 2);
    }

    #[test]
    #[should_panic]
    fn test_piece_len_out_of_range_panics() {
        info(2, BLOCK_LEN, BLOCK_LEN).piece_len(2);
    }
}
