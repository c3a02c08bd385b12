//! The `DBVERSION` marker.
//!
//! Every environment home and instance directory carries a one-line text
//! file naming the engine that wrote it and the formats in use:
//!
//! ```text
//! native/1.0/libback-ldbm/newidl/rdn-format-3/dn-4514-1
//! ```
//!
//! An optional second line records the data version of the instance.

use std::fs;
use std::io;
use std::path::Path;

use bitflags::bitflags;

use crate::engine::table::write_atomically;
use crate::error::{DbError, DbResult};

/// Name of the marker file.
pub const DBVERSION_FILE: &str = "DBVERSION";

/// Implementation tag of files written by this engine.
pub const IMPLEMENTATION: &str = "native";

/// Engine format version written by this build.
pub const VERSION: (u32, u32) = (1, 0);

const BACKEND: &str = "libback-ldbm";
const NEWIDL: &str = "newidl";
const RDNFORMAT: &str = "rdn-format";
const RDNFORMAT_VERSION: &str = "3";
const DNFORMAT: &str = "dn-4514";
const DNFORMAT_VERSION: &str = "1";

bitflags! {
    /// Format tags present in a marker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VersionFlags: u32 {
        /// New ID list format.
        const NEWIDL = 0x1;
        /// Entries are keyed by an RDN tree.
        const RDNFORMAT = 0x2;
        /// DNs are normalized per RFC 4514.
        const DNFORMAT = 0x4;
    }
}

/// What a marker means for the running configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// Written by this version with matching formats.
    Current,
    /// Written by an older engine; environment metadata must be rebuilt.
    Upgrade,
    /// Data is DN-keyed but RDN keys are configured.
    NeedDnToRdn,
    /// Data is RDN-keyed but flat DN keys are configured.
    NeedRdnToDn,
    /// Written by an unknown or newer engine.
    NotSupported,
}

/// A parsed marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbVersion {
    /// Engine implementation tag.
    pub implementation: String,
    /// Engine major version.
    pub major: u32,
    /// Engine minor version.
    pub minor: u32,
    /// Format tags.
    pub flags: VersionFlags,
    /// Free-form data version of an instance.
    pub data_version: Option<String>,
}

impl DbVersion {
    /// The marker this build writes.
    #[must_use]
    pub fn current(rdn_format: bool) -> Self {
        let mut flags = VersionFlags::NEWIDL | VersionFlags::DNFORMAT;
        if rdn_format {
            flags |= VersionFlags::RDNFORMAT;
        }
        Self {
            implementation: IMPLEMENTATION.to_string(),
            major: VERSION.0,
            minor: VERSION.1,
            flags,
            data_version: None,
        }
    }

    /// Marker text.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut text = format!(
            "{}/{}.{}/{BACKEND}",
            self.implementation, self.major, self.minor
        );
        if self.flags.contains(VersionFlags::NEWIDL) {
            text.push('/');
            text.push_str(NEWIDL);
        }
        if self.flags.contains(VersionFlags::RDNFORMAT) {
            text.push_str(&format!("/{RDNFORMAT}-{RDNFORMAT_VERSION}"));
        }
        if self.flags.contains(VersionFlags::DNFORMAT) {
            text.push_str(&format!("/{DNFORMAT}-{DNFORMAT_VERSION}"));
        }
        text.push('\n');
        if let Some(data) = &self.data_version {
            text.push_str(data);
            text.push('\n');
        }
        text
    }

    /// Parses marker text.
    ///
    /// # Errors
    ///
    /// [`DbError::VersionMismatch`] when the first line is not a marker.
    pub fn parse(text: &str) -> DbResult<Self> {
        let mut lines = text.lines();
        let first = lines.next().unwrap_or("").trim();
        let mut tags = first.split('/');
        let implementation = tags.next().filter(|t| !t.is_empty());
        let version = tags.next().and_then(|v| {
            let (major, minor) = v.split_once('.')?;
            Some((major.parse().ok()?, minor.parse().ok()?))
        });
        let (Some(implementation), Some((major, minor))) = (implementation, version) else {
            return Err(DbError::VersionMismatch {
                message: format!("unrecognized version marker {first:?}"),
            });
        };

        let mut flags = VersionFlags::empty();
        for tag in tags {
            if tag == NEWIDL {
                flags |= VersionFlags::NEWIDL;
            } else if tag.starts_with(RDNFORMAT) {
                flags |= VersionFlags::RDNFORMAT;
            } else if tag.starts_with(DNFORMAT) {
                flags |= VersionFlags::DNFORMAT;
            }
        }
        let data_version = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        Ok(Self {
            implementation: implementation.to_string(),
            major,
            minor,
            flags,
            data_version,
        })
    }

    /// Reads the marker in `dir`, `None` when there is none.
    ///
    /// # Errors
    ///
    /// I/O failures other than absence, or an unparsable marker.
    pub fn read(dir: &Path) -> DbResult<Option<Self>> {
        match fs::read_to_string(dir.join(DBVERSION_FILE)) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the marker into `dir`.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn write(&self, dir: &Path) -> DbResult<()> {
        fs::create_dir_all(dir)?;
        write_atomically(&dir.join(DBVERSION_FILE), self.to_text().as_bytes())
    }

    /// Compares the marker with what this build and `rdn_format` expect.
    #[must_use]
    pub fn check(&self, rdn_format: bool) -> VersionCheck {
        if self.implementation != IMPLEMENTATION || self.major > VERSION.0 {
            return VersionCheck::NotSupported;
        }
        if (self.major, self.minor) < VERSION {
            return VersionCheck::Upgrade;
        }
        match (rdn_format, self.flags.contains(VersionFlags::RDNFORMAT)) {
            (true, false) => VersionCheck::NeedDnToRdn,
            (false, true) => VersionCheck::NeedRdnToDn,
            _ => VersionCheck::Current,
        }
    }
}

/// True when `dir` holds a marker.
#[must_use]
pub fn exists(dir: &Path) -> bool {
    dir.join(DBVERSION_FILE).is_file()
}

/// Writes the current marker into `dir` unless one is already there.
///
/// # Errors
///
/// I/O failures.
pub fn ensure(dir: &Path, rdn_format: bool) -> DbResult<()> {
    if !exists(dir) {
        DbVersion::current(rdn_format).write(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marker_text_lists_the_tags() {
        let text = DbVersion::current(true).to_text();
        assert_eq!(text, "native/1.0/libback-ldbm/newidl/rdn-format-3/dn-4514-1\n");
        let flat = DbVersion::current(false).to_text();
        assert!(!flat.contains("rdn-format"));
    }

    #[test]
    fn parse_reads_flags_and_data_version() {
        let parsed =
            DbVersion::parse("native/1.0/libback-ldbm/newidl/dn-4514-1\nuserRoot-2\n").unwrap();
        assert_eq!(parsed.flags, VersionFlags::NEWIDL | VersionFlags::DNFORMAT);
        assert_eq!(parsed.data_version.as_deref(), Some("userRoot-2"));
        assert!(DbVersion::parse("garbage").is_err());
        assert!(DbVersion::parse("").is_err());
    }

    #[test]
    fn check_detects_addressing_and_upgrades() {
        let rdn = DbVersion::current(true);
        assert_eq!(rdn.check(true), VersionCheck::Current);
        assert_eq!(rdn.check(false), VersionCheck::NeedRdnToDn);
        assert_eq!(DbVersion::current(false).check(true), VersionCheck::NeedDnToRdn);

        let old = DbVersion::parse("native/0.9/libback-ldbm/newidl/rdn-format-3\n").unwrap();
        assert_eq!(old.check(true), VersionCheck::Upgrade);
        let foreign = DbVersion::parse("bdb/4.7/libback-ldbm/newidl\n").unwrap();
        assert_eq!(foreign.check(true), VersionCheck::NotSupported);
    }

    #[test]
    fn ensure_keeps_an_existing_marker() {
        let dir = tempdir().unwrap();
        assert!(DbVersion::read(dir.path()).unwrap().is_none());
        DbVersion::current(false).write(dir.path()).unwrap();
        ensure(dir.path(), true).unwrap();
        let read = DbVersion::read(dir.path()).unwrap().unwrap();
        assert!(!read.flags.contains(VersionFlags::RDNFORMAT));
    }
}
