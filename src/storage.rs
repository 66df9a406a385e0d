use std::{path::Path, sync::Arc};

use crate::{
    disk::{buffer::PoolBuf, fence::JobFence},
    error::DiskError,
    iovecs::IoVec,
    storage_info::StorageInfo,
    PieceIndex, StorageId,
};

/// The result of validating resume data against what is actually on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastresumeStatus {
    /// The resume data matches the files on disk.
    Valid,
    /// Some or all of the files are missing; a full recheck is needed.
    Missing,
    /// The resume data does not describe this torrent's files.
    Rejected,
}

/// The storage backend the disk core drives.
///
/// Implementations perform the actual file I/O and filesystem operations for
/// one torrent. All methods are called from disk worker threads with no core
/// lock held, so an implementation is free to block. Vectored calls receive
/// block-granularity buffers; the backend maps (piece, offset) to its file
/// layout.
pub trait Storage: Send + Sync {
    /// Fills `bufs` with data starting at `offset` bytes into `piece`.
    /// Returns the number of bytes read.
    fn readv(
        &self,
        bufs: &mut [PoolBuf],
        piece: PieceIndex,
        offset: u32,
        flags: u32,
    ) -> Result<usize, DiskError>;

    /// Writes `bufs` starting at `offset` bytes into `piece`. Returns the
    /// number of bytes written.
    fn writev(
        &self,
        bufs: &[IoVec],
        piece: PieceIndex,
        offset: u32,
        flags: u32,
    ) -> Result<usize, DiskError>;

    /// Moves the torrent's files to a new root directory.
    fn move_storage(&self, target: &Path) -> Result<(), DiskError>;

    /// Renames a single file of the torrent.
    fn rename_file(&self, file: usize, new_name: &str) -> Result<(), DiskError>;

    /// Closes all open file handles, keeping the data.
    fn release_files(&self) -> Result<(), DiskError>;

    /// Deletes the torrent's files from disk.
    fn delete_files(&self) -> Result<(), DiskError>;

    /// Validates resume data against the on-disk state.
    fn check_fastresume(
        &self,
        resume_data: &[u8],
    ) -> Result<FastresumeStatus, DiskError>;

    /// Serializes the state needed to resume this torrent later.
    fn write_resume_data(&self) -> Result<Vec<u8>, DiskError>;

    /// Applies new per-file download priorities.
    fn set_file_priority(&self, prios: &[u8]) -> Result<(), DiskError>;

    /// Called when the given file is complete, letting the backend trim
    /// preallocation or drop caches.
    fn finalize_file(&self, file: usize) -> Result<(), DiskError>;

    /// Periodic housekeeping. Returning false stops further ticks until the
    /// torrent asks for them again.
    fn tick(&self) -> bool {
        false
    }
}

/// One registered torrent as seen by the disk core: the backend, the piece
/// geometry, and the fence that serializes destructive operations against
/// outstanding I/O.
pub struct TorrentStorage {
    id: StorageId,
    info: StorageInfo,
    backend: Box<dyn Storage>,
    pub(crate) fence: JobFence,
}

/// A cheaply clonable reference to a registered torrent's storage. Jobs carry
/// one of these; the registry in the disk handle keeps another until the
/// torrent is stopped.
pub type StorageHandle = Arc<TorrentStorage>;

impl TorrentStorage {
    pub(crate) fn new(
        id: StorageId,
        backend: Box<dyn Storage>,
        info: StorageInfo,
    ) -> Self {
        Self {
            id,
            info,
            backend,
            fence: JobFence::new(),
        }
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn info(&self) -> &StorageInfo {
        &self.info
    }

    pub fn piece_len(&self, piece: PieceIndex) -> u32 {
        self.info.piece_len(piece)
    }

    pub fn blocks_in_piece(&self, piece: PieceIndex) -> usize {
        self.info.blocks_in_piece(piece)
    }

    pub(crate) fn backend(&self) -> &dyn Storage {
        &*self.backend
    }

    /// The number of jobs queued or running against this storage.
    pub fn num_outstanding_jobs(&self) -> usize {
        self.fence.num_outstanding()
    }

    /// The number of jobs held back by a raised fence.
    pub fn num_blocked(&self) -> usize {
        self.fence.num_blocked()
    }
}

impl std::fmt::Debug for TorrentStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentStorage")
            .field("id", &self.id)
            .field("piece_count", &self.info.piece_count)
            .field("outstanding", &self.num_outstanding_jobs())
            .finish()
    }
}
