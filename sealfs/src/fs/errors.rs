use std::path::PathBuf;
use thiserror::Error;

/// Request-scoped failure of a filesystem operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("entry already exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    OperationNotPermitted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file name too long")]
    NameTooLong,
    #[error("bad file handle")]
    BadHandle,
    #[error("invalid data")]
    InvalidData,
    #[error("no identifiers left")]
    NoSpace,
    #[error("I/O error (errno {0})")]
    Io(i32),
}

impl FsError {
    pub fn to_errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::Exists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::PermissionDenied => libc::EACCES,
            FsError::OperationNotPermitted => libc::EPERM,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::BadHandle => libc::EBADF,
            FsError::InvalidData => libc::EIO,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Io(errno) => errno,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Failures while opening, loading or flushing the persistence root.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("persistence root {} does not exist or is not a directory", .0.display())]
    InvalidRoot(PathBuf),

    #[error("persistence root {} is already mounted by another process", .0.display())]
    AlreadyMounted(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}
