//! Host memory and disk probes used before opening the environment.

use std::fs;
use std::path::Path;

use crate::error::{DbError, DbResult};

/// Caches below this size carry a proportionally large engine overhead.
const SMALL_CACHE: u64 = 500 * 1024 * 1024;

/// Memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    /// Physical memory.
    pub system_total: u64,
    /// Memory the kernel can hand out without swapping.
    pub system_available: u64,
    /// Resident set of this process.
    pub process_resident: u64,
}

impl MemInfo {
    /// Reads the figures of the running host, if the platform exposes them.
    #[must_use]
    pub fn read() -> Option<Self> {
        #[cfg(target_os = "linux")]
        {
            let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
            let status = fs::read_to_string("/proc/self/status").unwrap_or_default();
            Some(Self {
                system_total: kib_field(&meminfo, "MemTotal:")?,
                system_available: kib_field(&meminfo, "MemAvailable:")?,
                process_resident: kib_field(&status, "VmRSS:").unwrap_or(0),
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn kib_field(text: &str, prefix: &str) -> Option<u64> {
    text.lines()
        .find(|line| line.starts_with(prefix))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

/// Outcome of [`check_cachesize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCheck {
    /// The cache fits.
    Sane,
    /// The cache does not fit; use this size instead.
    Reduced(u64),
    /// Memory figures are unavailable.
    Unknown,
}

/// Checks that a cache of `cachesize` bytes fits in memory.
///
/// The memory this process already holds counts as available, since the
/// cache may be part of it. Small caches are charged a quarter extra for
/// engine metadata. An oversized cache is cut to three quarters of what
/// is available.
#[must_use]
pub fn check_cachesize(info: Option<&MemInfo>, cachesize: u64) -> CacheCheck {
    let Some(info) = info else {
        return CacheCheck::Unknown;
    };
    if info.system_available == 0 {
        return CacheCheck::Unknown;
    }
    let needed = if cachesize < SMALL_CACHE {
        cachesize + cachesize / 4
    } else {
        cachesize
    };
    let available = info.system_available.saturating_add(info.process_resident);
    if needed <= available {
        CacheCheck::Sane
    } else {
        CacheCheck::Reduced(available / 4 * 3)
    }
}

/// Bytes of all region files in `dir`.
#[must_use]
pub fn region_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(crate::engine::region::REGION_PREFIX)
        })
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Fails with [`DbError::DiskFull`] unless `dir` has room for a cache of
/// `cachesize` bytes plus a tenth for region overhead.
///
/// # Errors
///
/// [`DbError::Directory`] when the volume cannot be queried.
pub fn check_disk_space(dir: &Path, cachesize: u64) -> DbResult<()> {
    let expected = cachesize + cachesize / 10;
    let free = fs2::available_space(dir).map_err(|err| {
        DbError::directory(
            dir,
            format!("cannot get file system info ({err}); file system corrupted?"),
        )
    })?;
    let usable = free + region_size(dir);
    if usable < expected {
        tracing::error!(
            dir = %dir.display(),
            usable,
            expected,
            "not enough space left on device for db region files"
        );
        return Err(DbError::DiskFull {
            message: format!(
                "{} has {usable} bytes; at least {expected} bytes are needed for region files",
                dir.display()
            ),
        });
    }
    Ok(())
}
