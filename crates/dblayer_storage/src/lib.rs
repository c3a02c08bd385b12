//! # dblayer storage
//!
//! Byte-level backends for the transaction log segments written by
//! `dblayer_core`.
//!
//! A backend is an append-only byte store. It has no knowledge of log record
//! framing, checkpoints or file rotation; the log manager in `dblayer_core`
//! owns all of that and hands each segment (`log.0000000001`, ...) its own
//! backend instance.
//!
//! Write failures are classified here: an I/O error that means the volume is
//! out of space surfaces as [`StorageError::DiskFull`], so the layers above
//! can raise their out-of-disk notification instead of treating it as an
//! ordinary failure.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - a segment file on disk
//! - [`InMemoryBackend`] - for tests, with an optional capacity limit that
//!   simulates a full volume
//!
//! ## Example
//!
//! ```rust
//! use dblayer_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut segment = InMemoryBackend::new();
//! let offset = segment.append(b"record").unwrap();
//! assert_eq!(segment.read_at(offset, 6).unwrap(), b"record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{is_disk_full_error, StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
