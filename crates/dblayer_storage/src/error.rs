//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// The volume holding the segment has no space left.
    #[error("out of disk space: {0}")]
    DiskFull(io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The stored bytes failed validation.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The backend was closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Returns true when this error means the volume is full.
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::DiskFull(_))
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        if is_disk_full_error(&err) {
            Self::DiskFull(err)
        } else {
            Self::Io(err)
        }
    }
}

/// `ENOSPC` on every supported unix.
const ENOSPC: i32 = 28;
/// `EFBIG`: the file grew past the filesystem or rlimit maximum.
const EFBIG: i32 = 27;
/// `EDQUOT` on Linux.
#[cfg(target_os = "linux")]
const EDQUOT: i32 = 122;
/// `EDQUOT` on the BSD family and macOS.
#[cfg(not(target_os = "linux"))]
const EDQUOT: i32 = 69;

/// Platform classifier for "disk full" I/O errors.
///
/// Covers no space on device, exceeded quota and file too large.
#[must_use]
pub fn is_disk_full_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::StorageFull {
        return true;
    }
    matches!(err.raw_os_error(), Some(code) if code == ENOSPC || code == EDQUOT || code == EFBIG)
}
