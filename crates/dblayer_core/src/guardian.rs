//! Clean-shutdown marker and restore marker.
//!
//! A clean close leaves a `guardian` file in the environment home that
//! records the cache geometry it ran with. Startup consumes the file: when
//! it is missing while database files exist, the last run ended without a
//! clean close and the environment must be recovered.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::engine::table::write_atomically;
use crate::error::DbResult;

/// Name of the clean-shutdown marker.
pub const GUARDIAN_FILE: &str = "guardian";

/// Name of the restore marker, kept next to the environment home.
pub const RESTORE_MARKER: &str = ".restore";

/// Format version written on the `version:` line.
const GUARDIAN_VERSION: u32 = 1;

/// Geometry recorded by a clean close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Guardian {
    /// Cache size in bytes.
    pub cachesize: u64,
    /// Number of cache chunks.
    pub ncache: u32,
    /// Configured lock table size.
    pub locks: u32,
}

/// What startup learned from the guardian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuardianRead {
    /// The previous run did not shut down cleanly.
    pub recovery_required: bool,
    /// Geometry of the previous run, when recorded.
    pub previous: Option<Guardian>,
}

impl Guardian {
    /// Text form of the marker.
    #[must_use]
    pub fn to_text(&self) -> String {
        format!(
            "cachesize:{}\nncache:{}\nversion:{GUARDIAN_VERSION}\nlocks:{}\n",
            self.cachesize, self.ncache, self.locks
        )
    }

    /// Parses marker text. Unknown lines and the version are ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut guardian = Self::default();
        for line in text.lines() {
            let Some((attr, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match attr.trim() {
                "cachesize" => guardian.cachesize = value.parse().unwrap_or(0),
                "ncache" => guardian.ncache = value.parse().unwrap_or(0),
                "locks" => guardian.locks = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        guardian
    }

    /// Writes the marker into `home`.
    ///
    /// # Errors
    ///
    /// I/O failures; the partial file is removed.
    pub fn write(&self, home: &Path) -> DbResult<()> {
        let path = home.join(GUARDIAN_FILE);
        write_atomically(&path, self.to_text().as_bytes()).inspect_err(|err| {
            tracing::error!(
                path = %path.display(),
                error = %err,
                "failed to write guardian file, database corruption possible"
            );
            let _ = fs::remove_file(&path);
        })
    }
}

/// Reads and deletes the guardian in `home`.
///
/// `data_dirs` are scanned for database files, one level deep, when the
/// guardian is missing or empty.
///
/// # Errors
///
/// Fails only when the guardian cannot be deleted.
pub fn take(home: &Path, data_dirs: &[PathBuf]) -> DbResult<GuardianRead> {
    let path = home.join(GUARDIAN_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unreadable guardian file");
            remove(&path)?;
            return Ok(GuardianRead {
                recovery_required: true,
                previous: None,
            });
        }
    };

    if bytes.is_empty() {
        let _ = fs::remove_file(&path);
        let recovery_required = data_dirs.iter().any(|dir| count_db_files(dir, true) > 0);
        return Ok(GuardianRead {
            recovery_required,
            previous: None,
        });
    }

    let read = match std::str::from_utf8(&bytes) {
        Ok(text) => GuardianRead {
            recovery_required: false,
            previous: Some(Guardian::parse(text)),
        },
        Err(_) => GuardianRead {
            recovery_required: true,
            previous: None,
        },
    };
    remove(&path)?;
    Ok(read)
}

fn remove(path: &Path) -> DbResult<()> {
    fs::remove_file(path).map_err(|err| {
        tracing::error!(
            path = %path.display(),
            error = %err,
            "failed to delete guardian file, database corruption possible"
        );
        err.into()
    })
}

/// Number of `*.db` files in `dir`, and in its subdirectories when
/// `recurse` is set.
#[must_use]
pub fn count_db_files(dir: &Path, recurse: bool) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if recurse {
                count += count_db_files(&path, false);
            }
        } else if path.extension().is_some_and(|ext| ext == "db") {
            count += 1;
        }
    }
    count
}

/// Location of the restore marker for `home`.
#[must_use]
pub fn restore_marker(home: &Path) -> PathBuf {
    home.parent().unwrap_or(home).join(RESTORE_MARKER)
}

/// State of the restore marker found at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreMarker {
    /// No restore ran since the last startup.
    Absent,
    /// A restore completed; the text names the archive.
    Succeeded(String),
    /// A restore started but never reported success.
    Failed,
}

/// Creates an empty restore marker before an archive restore begins.
///
/// # Errors
///
/// I/O failures.
pub fn init_restore_marker(home: &Path) -> DbResult<()> {
    fs::write(restore_marker(home), b"")?;
    Ok(())
}

/// Records in the marker that the restore of `archive` succeeded.
///
/// # Errors
///
/// I/O failures.
pub fn update_restore_marker(home: &Path, archive: &Path) -> DbResult<()> {
    let line = format!("restore of {} succeeded", archive.display());
    write_atomically(&restore_marker(home), line.as_bytes())
}

/// Reads and deletes the restore marker.
#[must_use]
pub fn take_restore_marker(home: &Path) -> RestoreMarker {
    let path = restore_marker(home);
    let state = match fs::read_to_string(&path) {
        Ok(text) if text.is_empty() => {
            tracing::error!(path = %path.display(), "previous restore failed, marker is empty");
            RestoreMarker::Failed
        }
        Ok(text) => RestoreMarker::Succeeded(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return RestoreMarker::Absent,
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "unreadable restore marker");
            RestoreMarker::Failed
        }
    };
    let _ = fs::remove_file(&path);
    state
}
