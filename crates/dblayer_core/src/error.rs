//! Error types for the storage layer.
//!
//! Every failure maps to a library status code through [`DbError::code`]:
//! zero is success, positive values are `errno`-compatible and negative
//! values are engine codes (see [`codes`]).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage layer operations.
pub type DbResult<T> = Result<T, DbError>;

/// Engine status codes returned by [`DbError::code`].
pub mod codes {
    /// Operation completed.
    pub const SUCCESS: i32 = 0;
    /// Operation code or capability not wired for this handle.
    pub const UNSUPPORTED: i32 = -12800;
    /// Caller supplied a fixed buffer that is too small.
    pub const BUFFER_SMALL: i32 = -12799;
    /// Key already present with a no-overwrite put.
    pub const KEYEXIST: i32 = -12798;
    /// Key or record absent. Expected, not a failure.
    pub const NOTFOUND: i32 = -12797;
    /// Environment state is unusable until recovery runs.
    pub const RUNRECOVERY: i32 = -12796;
    /// Lock conflict; retry the whole transaction.
    pub const RETRY: i32 = -12795;
    /// Caller contract violation.
    pub const INVALID: i32 = -12794;
    /// Any other engine failure.
    pub const OTHER: i32 = -12793;

    /// `ENOENT`
    pub const ENOENT: i32 = 2;
    /// `EIO`
    pub const EIO: i32 = 5;
    /// `ENOMEM`
    pub const ENOMEM: i32 = 12;
    /// `EBUSY`
    pub const EBUSY: i32 = 16;
    /// `EINVAL`
    pub const EINVAL: i32 = 22;
    /// `ENOSPC`
    pub const ENOSPC: i32 = 28;
    /// `ERANGE`
    pub const ERANGE: i32 = 34;
}

/// Errors raised by the storage layer and its engine.
#[derive(Debug, Error)]
pub enum DbError {
    /// Key or record not present.
    #[error("not found")]
    NotFound,

    /// A no-overwrite put found the key already present.
    #[error("key already exists")]
    KeyExists,

    /// The transaction was chosen as a deadlock victim.
    #[error("deadlock detected: {message}")]
    Deadlock {
        /// Which lock the victim was waiting for.
        message: String,
    },

    /// A no-wait lock request hit a conflicting holder.
    #[error("lock not granted: {message}")]
    LockNotGranted {
        /// The contended object.
        message: String,
    },

    /// The lock table has no free slot.
    #[error("lock table is out of available locks ({max})")]
    OutOfLocks {
        /// Configured table size.
        max: u32,
    },

    /// A fixed-capacity buffer cannot hold the result.
    #[error("buffer too small: {needed} bytes needed")]
    BufferTooSmall {
        /// Bytes required to hold the result.
        needed: usize,
    },

    /// Capability not available on this handle.
    #[error("unsupported operation: {operation}")]
    Unsupported {
        /// The requested operation.
        operation: String,
    },

    /// The volume is out of space.
    #[error("out of disk space: {message}")]
    DiskFull {
        /// The failing write.
        message: String,
    },

    /// Memory for the environment could not be obtained.
    #[error("out of memory: {message}")]
    OutOfMemory {
        /// What was being allocated.
        message: String,
    },

    /// The environment previously failed to open in this process.
    #[error("DB previously failed to start")]
    PreviouslyFailed,

    /// Process-wide state is already set up.
    #[error("storage layer already initialized")]
    AlreadyInitialized,

    /// The environment is not open.
    #[error("environment not started")]
    NotStarted,

    /// Invalid tunable or configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// On-disk data failed validation.
    #[error("corruption: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The environment needs recovery before use.
    #[error("run recovery: {message}")]
    RunRecovery {
        /// Why recovery is needed.
        message: String,
    },

    /// A configured directory is missing or inaccessible.
    #[error("directory {path:?}: {message}")]
    Directory {
        /// The directory.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// The on-disk version marker is incompatible.
    #[error("version mismatch: {message}")]
    VersionMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// DN-keyed data restored into an RDN-keyed configuration or back.
    #[error("addressing mode mismatch: {message}")]
    AddressingMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// A database file does not exist and creation was not requested.
    #[error("no such database: {name}")]
    DatabaseNotFound {
        /// Database name.
        name: String,
    },

    /// No configured instance has this name.
    #[error("instance not found: {name}")]
    InstanceNotFound {
        /// Instance name.
        name: String,
    },

    /// The target is in use.
    #[error("busy: {message}")]
    Busy {
        /// What is busy.
        message: String,
    },

    /// The layer is shutting down.
    #[error("operation interrupted by shutdown")]
    Shutdown,

    /// Copying a file during backup or restore failed.
    #[error("failed to copy {path:?}: {source}")]
    CopyFailed {
        /// The file being copied.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// Log segment storage failed.
    #[error("storage error: {0}")]
    Storage(dblayer_storage::StorageError),

    /// JSON configuration snapshot could not be read or written.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        if dblayer_storage::is_disk_full_error(&err) {
            Self::DiskFull {
                message: err.to_string(),
            }
        } else {
            Self::Io(err)
        }
    }
}

impl From<dblayer_storage::StorageError> for DbError {
    fn from(err: dblayer_storage::StorageError) -> Self {
        match err {
            dblayer_storage::StorageError::DiskFull(io) => Self::DiskFull {
                message: io.to_string(),
            },
            dblayer_storage::StorageError::Io(io) => Self::from(io),
            other => Self::Storage(other),
        }
    }
}

impl DbError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a directory error.
    pub fn directory(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Directory {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Creates a copy failure for `path`.
    pub fn copy_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CopyFailed {
            path: path.into(),
            source,
        }
    }

    /// True for the expected "absent" outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// True for lock conflicts; the caller retries the whole transaction.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. } | Self::LockNotGranted { .. })
    }

    /// True when the failure means the volume is full.
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        match self {
            Self::DiskFull { .. } => true,
            Self::CopyFailed { source, .. } => dblayer_storage::is_disk_full_error(source),
            _ => false,
        }
    }

    /// Library status code for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound => codes::NOTFOUND,
            Self::KeyExists => codes::KEYEXIST,
            Self::Deadlock { .. } | Self::LockNotGranted { .. } => codes::RETRY,
            Self::BufferTooSmall { .. } => codes::BUFFER_SMALL,
            Self::Unsupported { .. } => codes::UNSUPPORTED,
            Self::RunRecovery { .. } | Self::Corrupted { .. } => codes::RUNRECOVERY,
            Self::InvalidOperation { .. } => codes::INVALID,
            Self::DiskFull { .. } => codes::ENOSPC,
            Self::OutOfMemory { .. } | Self::OutOfLocks { .. } => codes::ENOMEM,
            Self::Config { .. }
            | Self::Directory { .. }
            | Self::VersionMismatch { .. }
            | Self::AddressingMismatch { .. }
            | Self::AlreadyInitialized
            | Self::NotStarted
            | Self::Json(_) => codes::EINVAL,
            Self::InstanceNotFound { .. } | Self::DatabaseNotFound { .. } => codes::ENOENT,
            Self::Busy { .. } => codes::EBUSY,
            Self::PreviouslyFailed | Self::Shutdown => codes::OTHER,
            Self::CopyFailed { source, .. } | Self::Io(source) => {
                source.raw_os_error().unwrap_or(codes::EIO)
            }
            Self::Storage(_) => codes::EIO,
        }
    }
}

/// Returns a human readable string for a status code.
#[must_use]
pub fn strerror(code: i32) -> String {
    match code {
        codes::SUCCESS => "success".to_string(),
        codes::UNSUPPORTED => "operation not supported".to_string(),
        codes::BUFFER_SMALL => "user memory too small for return value".to_string(),
        codes::KEYEXIST => "key/data pair already exists".to_string(),
        codes::NOTFOUND => "no matching key/data pair found".to_string(),
        codes::RUNRECOVERY => "fatal error, run database recovery".to_string(),
        codes::RETRY => "deadlock, transaction must be retried".to_string(),
        codes::INVALID => "invalid argument".to_string(),
        codes::OTHER => "unexpected engine failure".to_string(),
        errno if errno > 0 => io::Error::from_raw_os_error(errno).to_string(),
        other => format!("unknown error {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_io_becomes_disk_full() {
        let err = DbError::from(io::Error::from_raw_os_error(codes::ENOSPC));
        assert!(err.is_disk_full());
        assert_eq!(err.code(), codes::ENOSPC);
    }

    #[test]
    fn storage_disk_full_is_classified() {
        let storage = dblayer_storage::StorageError::DiskFull(io::Error::new(
            io::ErrorKind::StorageFull,
            "full",
        ));
        assert!(DbError::from(storage).is_disk_full());
    }

    #[test]
    fn not_found_is_distinct_from_errors() {
        assert!(DbError::NotFound.is_not_found());
        assert!(!DbError::from(io::Error::from_raw_os_error(codes::EIO)).is_not_found());
        assert_eq!(DbError::NotFound.code(), codes::NOTFOUND);
    }

    #[test]
    fn lock_conflicts_are_retryable() {
        let victim = DbError::Deadlock {
            message: "youngest".into(),
        };
        let nowait = DbError::LockNotGranted {
            message: "id2entry".into(),
        };
        assert!(victim.is_deadlock() && nowait.is_deadlock());
        assert_eq!(victim.code(), codes::RETRY);
    }

    #[test]
    fn io_errors_keep_their_errno() {
        let err = DbError::from(io::Error::from_raw_os_error(codes::EBUSY));
        assert_eq!(err.code(), codes::EBUSY);
        assert!(strerror(codes::NOTFOUND).contains("no matching"));
    }
}
