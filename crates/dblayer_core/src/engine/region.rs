//! Region files of a shared environment.
//!
//! A shared environment records the cache and lock geometry it was created
//! with in `__db.001`. A later open with a different geometry is refused
//! until the region files are removed, since a region cannot be resized
//! while it exists.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::table::write_atomically;
use crate::error::{DbError, DbResult};

/// Prefix shared by all region files.
pub const REGION_PREFIX: &str = "__db.";

const REGION_FILE: &str = "__db.001";

/// Geometry stored in the region file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Total cache bytes.
    pub cachesize: u64,
    /// Number of cache chunks.
    pub ncache: u32,
    /// Lock table size.
    pub max_locks: u32,
    /// Maximum concurrent transactions.
    pub tx_max: u32,
    /// Whether the region lives in system shared memory.
    pub system_mem: bool,
}

pub(crate) fn region_path(home: &Path) -> PathBuf {
    home.join(REGION_FILE)
}

/// Reads the region file, if there is one.
pub(crate) fn read(home: &Path) -> DbResult<Option<RegionInfo>> {
    let path = region_path(home);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn write(home: &Path, info: &RegionInfo) -> DbResult<()> {
    let bytes = serde_json::to_vec_pretty(info)?;
    write_atomically(&region_path(home), &bytes)
}

/// Checks a stored geometry against the requested one.
pub(crate) fn check(stored: &RegionInfo, requested: &RegionInfo) -> DbResult<()> {
    if stored.cachesize != requested.cachesize || stored.ncache != requested.ncache {
        return Err(DbError::config(format!(
            "existing region has cache {}/{} chunk(s), requested {}/{}; remove the region files first",
            stored.cachesize, stored.ncache, requested.cachesize, requested.ncache
        )));
    }
    Ok(())
}

/// Deletes every region file in `home`; returns how many were removed.
pub(crate) fn remove_all(home: &Path) -> DbResult<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(home) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(REGION_PREFIX) && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn info(cachesize: u64) -> RegionInfo {
        RegionInfo {
            cachesize,
            ncache: 1,
            max_locks: 10_000,
            tx_max: 200,
            system_mem: false,
        }
    }

    #[test]
    fn write_read_check() {
        let dir = tempdir().unwrap();
        assert_eq!(read(dir.path()).unwrap(), None);
        write(dir.path(), &info(1 << 20)).unwrap();
        let stored = read(dir.path()).unwrap().unwrap();
        assert!(check(&stored, &info(1 << 20)).is_ok());
        assert!(matches!(
            check(&stored, &info(2 << 20)),
            Err(DbError::Config { .. })
        ));
    }

    #[test]
    fn remove_all_spares_other_files() {
        let dir = tempdir().unwrap();
        write(dir.path(), &info(1)).unwrap();
        fs::write(dir.path().join("__db.002"), b"x").unwrap();
        fs::write(dir.path().join("id2entry.db"), b"x").unwrap();
        assert_eq!(remove_all(dir.path()).unwrap(), 2);
        assert!(dir.path().join("id2entry.db").exists());
    }
}
