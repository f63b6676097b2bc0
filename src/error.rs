use thiserror::Error;

use crate::locking::LockConflict;
use crate::packets::header::Status;
use crate::packets::wire::WireError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stale file handle")]
    StaleHandle,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("conflicts with an existing lock: {0}")]
    Locked(LockConflict),
    #[error("no matching lock")]
    LockNotFound,
    #[error("server is reclaiming locks after restart")]
    GracePeriod,
    #[error("a lease break is outstanding")]
    BreakPending,
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("blocking on this lock would deadlock")]
    Deadlock,
    #[error("lock limit for owner exceeded")]
    TooManyLocks,
    #[error("operation cancelled")]
    Cancelled,
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl Error {
    /// Protocol status for this error. Handlers call this exactly once, at
    /// the dispatch boundary; internal callers compose the typed values.
    pub fn status(&self) -> Status {
        match self {
            Error::NotFound(_) => Status::ObjectNameNotFound,
            Error::StaleHandle => Status::FileClosed,
            Error::PermissionDenied(_) | Error::AccessDenied(_) => Status::AccessDenied,
            Error::IsDirectory(_) => Status::FileIsADirectory,
            Error::NotDirectory(_) => Status::NotADirectory,
            Error::NotEmpty(_) => Status::DirectoryNotEmpty,
            Error::AlreadyExists(_) => Status::ObjectNameCollision,
            Error::InvalidArgument(_) | Error::Wire(_) | Error::InvalidConfiguration(_) => {
                Status::InvalidParameter
            }
            Error::Locked(_) => Status::LockNotGranted,
            Error::LockNotFound => Status::RangeNotLocked,
            Error::GracePeriod => Status::FileLockConflict,
            Error::BreakPending => Status::Pending,
            Error::NotSupported(_) => Status::NotSupported,
            Error::Deadlock => Status::PossibleDeadlock,
            Error::TooManyLocks => Status::InsufficientResources,
            Error::Cancelled => Status::Cancelled,
        }
    }
}
