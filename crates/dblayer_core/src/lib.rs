//! # dblayer core
//!
//! The transactional storage layer of a directory server backend.
//!
//! This crate provides:
//! - An embedded transactional engine (tables, write-ahead log, locks,
//!   checkpoints, recovery)
//! - Environment lifecycle with crash detection through the guardian file
//! - Per-thread transaction stacks and batched durable commits
//! - Checkpoint, trickle, deadlock and log-trim background threads
//! - Online and offline backup, full and single-instance restore
//! - Tunables with the server's attribute names and size suffixes
//!
//! ```rust,ignore
//! use dblayer_core::{DbLayer, DbLayerConfig, DbMode};
//!
//! let layer = DbLayer::init(DbLayerConfig::new("/var/lib/dirsrv/db"))?;
//! layer.start(DbMode::NORMAL)?;
//! layer.backup("/var/lib/dirsrv/bak/nightly".as_ref())?;
//! layer.close(DbMode::NORMAL)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod backup;
pub mod config;
pub mod dbversion;
pub mod engine;
pub mod env;
pub mod error;
pub mod guardian;
pub mod handle;
pub mod instance;
pub mod layer;
pub mod restore;
pub mod stress;
pub mod strtoul;
pub mod sysinfo;
pub mod threads;
pub mod tunables;
pub mod txn;
pub mod value;

pub use backup::{ArchiveLister, BackupManifest, BackupReport, LogLister, ManifestInstance};
pub use config::DbLayerConfig;
pub use dbversion::{DbVersion, VersionCheck};
pub use env::select_ncache;
pub use error::{DbError, DbResult};
pub use guardian::{Guardian, RestoreMarker};
pub use handle::{CursorOp, DbCursor, DbHandle, DbImplementation, DbOp, NativeImplementation};
pub use instance::{IndexRef, IndexStatus, Instance};
pub use layer::{DbLayer, DbMode, DiskFullHook};
pub use restore::{RestoreOptions, RestoreReport};
pub use strtoul::{db_atol, db_strtoul, db_strtoull, ParseSizeError};
pub use tunables::Phase;
pub use txn::BackTxn;
pub use value::DbValue;
