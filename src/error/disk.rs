use std::sync::Arc;

pub type Result<T, E = JobError> = std::result::Result<T, E>;

/// Error type carried by disk jobs.
///
/// These errors are non-fatal, so they should not be grouped with a global
/// error type as every one of them may be recovered from: the job that hit
/// the error completes with it and the rest of the pipeline keeps running.
///
/// The type is cheap to clone because a single failed vectored write may have
/// to fail every job suspended on the affected piece.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiskError {
    /// A block buffer could not be allocated from the pool. The job may be
    /// retried once peers reclaim their read buffers.
    #[error("out of disk buffers")]
    OutOfMemory,

    /// The job was cancelled by a destructive operation (torrent stop, piece
    /// clear, file deletion) before it could run.
    #[error("operation aborted")]
    Aborted,

    /// The block's offset in piece is invalid.
    #[error("invalid block offset")]
    InvalidBlockOffset,

    /// The block is valid within torrent but its data has not been downloaded
    /// yet or has been deleted.
    #[error("torrent data missing")]
    MissingData,

    /// The storage backend rejected the resume data.
    #[error("invalid fastresume data")]
    InvalidFastresume,

    /// An IO error occurred.
    #[error("{0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for DiskError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// The operation a job was performing when its error occurred. Reported
/// alongside the error so the API user can tell a failed cache allocation
/// from a failed syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AllocCachePiece,
    Readv,
    Writev,
    Fallocate,
    Move,
    Rename,
    Delete,
    ReleaseFiles,
    CheckFastresume,
    WriteResumeData,
    FilePriority,
    FinalizeFile,
    LoadTorrent,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::AllocCachePiece => "alloc_cache_piece",
            Operation::Readv => "readv",
            Operation::Writev => "writev",
            Operation::Fallocate => "fallocate",
            Operation::Move => "move",
            Operation::Rename => "rename",
            Operation::Delete => "delete",
            Operation::ReleaseFiles => "release_files",
            Operation::CheckFastresume => "check_fastresume",
            Operation::WriteResumeData => "write_resume_data",
            Operation::FilePriority => "file_priority",
            Operation::FinalizeFile => "finalize_file",
            Operation::LoadTorrent => "load_torrent",
        }
    }
}

/// A disk error tagged with the operation that produced it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error} ({})", .operation.name())]
pub struct JobError {
    pub error: DiskError,
    pub operation: Operation,
}

impl JobError {
    pub fn new(error: DiskError, operation: Operation) -> Self {
        Self { error, operation }
    }

    pub fn aborted() -> Self {
        // the operation tag is meaningless for cancelled jobs, they never
        // reached the backend
        Self::new(DiskError::Aborted, Operation::Readv)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.error, DiskError::Aborted)
    }
}
