//! In-memory storage backend for exercising the disk pipeline in tests.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    disk::buffer::PoolBuf,
    error::DiskError,
    iovecs::IoVec,
    storage::{FastresumeStatus, Storage, StorageHandle, TorrentStorage},
    storage_info::StorageInfo,
    PieceIndex, StorageId,
};

/// Records every backend call and serves reads/writes from one flat buffer.
pub(crate) struct MockStorage {
    pub(crate) piece_len: u32,
    pub(crate) data: Mutex<Vec<u8>>,
    /// (piece, offset, iovec count) per readv call.
    pub(crate) reads: Mutex<Vec<(PieceIndex, u32, usize)>>,
    /// (piece, offset, iovec count) per writev call.
    pub(crate) writes: Mutex<Vec<(PieceIndex, u32, usize)>>,
    pub(crate) renames: Mutex<Vec<(usize, String)>>,
    pub(crate) moves: Mutex<Vec<std::path::PathBuf>>,
    pub(crate) priorities: Mutex<Vec<Vec<u8>>>,
    pub(crate) finalized: Mutex<Vec<usize>>,
    pub(crate) deleted: AtomicBool,
    pub(crate) released: AtomicBool,
    pub(crate) ticked: AtomicBool,
    pub(crate) fail_writes: AtomicBool,
    pub(crate) fail_reads: AtomicBool,
    /// Slows down reads so tests can pile up queued jobs behind a running
    /// one.
    pub(crate) read_delay: Mutex<Option<Duration>>,
}

impl MockStorage {
    pub(crate) fn new(total_len: usize, piece_len: u32) -> Arc<Self> {
        Arc::new(Self {
            piece_len,
            data: Mutex::new(vec![0; total_len]),
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            renames: Mutex::new(Vec::new()),
            moves: Mutex::new(Vec::new()),
            priorities: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
            deleted: AtomicBool::new(false),
            released: AtomicBool::new(false),
            ticked: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            read_delay: Mutex::new(None),
        })
    }

    /// Seeds the backing buffer with a deterministic byte pattern.
    pub(crate) fn seed(&self) {
        let mut data = self.data.lock();
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn torrent_offset(&self, piece: PieceIndex, offset: u32) -> usize {
        piece * self.piece_len as usize + offset as usize
    }
}

impl Storage for Arc<MockStorage> {
    fn readv(
        &self,
        bufs: &mut [PoolBuf],
        piece: PieceIndex,
        offset: u32,
        _flags: u32,
    ) -> Result<usize, DiskError> {
        if let Some(delay) = *self.read_delay.lock() {
            std::thread::sleep(delay);
        }
        self.reads.lock().push((piece, offset, bufs.len()));
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected read failure",
            )
            .into());
        }
        let data = self.data.lock();
        let mut pos = self.torrent_offset(piece, offset);
        let mut total = 0;
        for buf in bufs {
            let len = buf.len();
            buf.as_mut_slice().copy_from_slice(&data[pos..pos + len]);
            pos += len;
            total += len;
        }
        Ok(total)
    }

    fn writev(
        &self,
        bufs: &[IoVec],
        piece: PieceIndex,
        offset: u32,
        _flags: u32,
    ) -> Result<usize, DiskError> {
        self.writes.lock().push((piece, offset, bufs.len()));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )
            .into());
        }
        let mut data = self.data.lock();
        let mut pos = self.torrent_offset(piece, offset);
        let mut total = 0;
        for buf in bufs {
            let src = buf.as_slice();
            data[pos..pos + src.len()].copy_from_slice(src);
            pos += src.len();
            total += src.len();
        }
        Ok(total)
    }

    fn move_storage(&self, target: &Path) -> Result<(), DiskError> {
        self.moves.lock().push(target.to_path_buf());
        Ok(())
    }

    fn rename_file(&self, file: usize, new_name: &str) -> Result<(), DiskError> {
        self.renames.lock().push((file, new_name.to_string()));
        Ok(())
    }

    fn release_files(&self) -> Result<(), DiskError> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn delete_files(&self) -> Result<(), DiskError> {
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_fastresume(
        &self,
        resume_data: &[u8],
    ) -> Result<FastresumeStatus, DiskError> {
        Ok(if resume_data.is_empty() {
            FastresumeStatus::Missing
        } else {
            FastresumeStatus::Valid
        })
    }

    fn write_resume_data(&self) -> Result<Vec<u8>, DiskError> {
        Ok(b"resume".to_vec())
    }

    fn set_file_priority(&self, prios: &[u8]) -> Result<(), DiskError> {
        self.priorities.lock().push(prios.to_vec());
        Ok(())
    }

    fn finalize_file(&self, file: usize) -> Result<(), DiskError> {
        self.finalized.lock().push(file);
        Ok(())
    }

    fn tick(&self) -> bool {
        self.ticked.store(true, Ordering::SeqCst);
        false
    }
}

/// Geometry plus a fresh mock backend, for registering with a `Disk`.
pub(crate) fn mock_parts(
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,
) -> (StorageInfo, Arc<MockStorage>) {
    let download_len =
        (piece_count - 1) as u64 * piece_len as u64 + last_piece_len as u64;
    let info = StorageInfo {
        piece_count,
        piece_len,
        last_piece_len,
        download_len,
        files: Vec::new(),
    };
    (info, MockStorage::new(download_len as usize, piece_len))
}

/// A storage handle over a fresh mock backend, plus the mock for
/// assertions. `last_piece_len` lets tests exercise short last pieces.
pub(crate) fn mock_torrent(
    id: StorageId,
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,
) -> (StorageHandle, Arc<MockStorage>) {
    let download_len =
        (piece_count - 1) as u64 * piece_len as u64 + last_piece_len as u64;
    let info = StorageInfo {
        piece_count,
        piece_len,
        last_piece_len,
        download_len,
        files: Vec::new(),
    };
    let mock = MockStorage::new(download_len as usize, piece_len);
    let handle = Arc::new(TorrentStorage::new(
        id,
        Box::new(Arc::clone(&mock)),
        info,
    ));
    (handle, mock)
}
