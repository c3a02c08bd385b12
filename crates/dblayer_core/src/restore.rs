//! Restore from a backup directory.
//!
//! The environment must be closed. A full restore replaces every instance
//! with the backup's copy and brings the logs along, so the following
//! start runs catastrophic recovery over them. A single-instance restore
//! leaves the other instances and the logs alone: the backup is staged,
//! recovered on its own, and the instance's records are copied into fresh
//! files whose log positions mean nothing to the live environment.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::backup::{copy_directory, copyfile, BackupManifest, CopyAction, CHANGELOG_BACKUP_DIR, MANIFEST_FILE};
use crate::dbversion::{self, DbVersion, VersionCheck};
use crate::engine::log::parse_log_file_name;
use crate::engine::{DbOpenFlags, EnvBuilder, EnvConfig, EnvFlags};
use crate::error::{DbError, DbResult};
use crate::guardian::GUARDIAN_FILE;
use crate::instance::{Instance, DB_EXTENSION};
use crate::layer::{DbLayer, DbMode};

/// How to restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Restore only this instance.
    pub instance: Option<String>,
    /// Close the environment again after the restore started it.
    pub offline: bool,
}

impl RestoreOptions {
    /// Restores everything and leaves the environment running.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores only `name`.
    #[must_use]
    pub fn with_instance(mut self, name: impl Into<String>) -> Self {
        self.instance = Some(name.into());
        self
    }

    /// Closes the environment when done, for offline tools.
    #[must_use]
    pub const fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }
}

/// What a finished restore did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Files copied into place.
    pub files: usize,
    /// True when transaction logs came with the backup.
    pub logs_restored: bool,
    /// Mode the environment was started in.
    pub mode: DbMode,
}

/// True for `log.NNNNNNNNNN` names.
fn is_log_file(name: &str) -> bool {
    parse_log_file_name(name).is_some()
}

/// Plain files of a backup that are never copied back.
fn skipped(name: &str) -> bool {
    name.ends_with(".ldif") || name == MANIFEST_FILE
}

/// Sorted subdirectories and files of `dir`.
fn list_backup(dir: &Path) -> DbResult<(Vec<String>, Vec<String>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            dirs.push(name);
        } else {
            files.push(name);
        }
    }
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

/// `<path>.<suffix>` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_dir_if_exists(dir: &Path) -> DbResult<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}

/// Picks the start mode for the restored data, or refuses it.
fn select_mode(version: &DbVersion, rdn_format: bool, logs: bool) -> DbResult<DbMode> {
    match version.check(rdn_format) {
        VersionCheck::NotSupported => Err(DbError::VersionMismatch {
            message: format!(
                "backup was written by {}/{}.{}, which this build cannot read",
                version.implementation, version.major, version.minor
            ),
        }),
        VersionCheck::NeedDnToRdn => Err(DbError::AddressingMismatch {
            message: "RDN keys are configured while the backup is in the DN format; run dn2rdn to convert the database format".into(),
        }),
        VersionCheck::NeedRdnToDn => Err(DbError::AddressingMismatch {
            message: "flat DN keys are configured while the backup is in the RDN format; turn the RDN format back on".into(),
        }),
        VersionCheck::Upgrade => Ok(DbMode::CLEAN_RECOVER),
        VersionCheck::Current if logs => Ok(DbMode::RESTORE),
        VersionCheck::Current => Ok(DbMode::RESTORE_NO_RECOVERY),
    }
}

impl DbLayer {
    /// Restores the backup in `src`.
    ///
    /// Validation failures leave the current data untouched. Once the
    /// current files are being deleted a failure leaves a partial restore
    /// behind that has to be run again.
    ///
    /// # Errors
    ///
    /// - [`DbError::Busy`] while the environment is open.
    /// - [`DbError::Directory`] for a missing or incomplete backup.
    /// - [`DbError::InstanceNotFound`] when the backup holds an instance
    ///   that is not configured, or the requested one is missing.
    /// - [`DbError::VersionMismatch`] and [`DbError::AddressingMismatch`]
    ///   for data this configuration cannot run.
    /// - Copy failures naming the file, and start failures.
    pub fn restore(&self, src: &Path, options: &RestoreOptions) -> DbResult<RestoreReport> {
        if self.is_started() {
            return Err(DbError::Busy {
                message: "cannot restore while the environment is open".into(),
            });
        }
        if !src.exists() {
            tracing::error!("Backup directory {} does not exist.", src.display());
            return Err(DbError::directory(src, "backup directory does not exist"));
        }
        if !src.is_dir() {
            tracing::error!("Backup directory {} is not a directory.", src.display());
            return Err(DbError::directory(src, "backup directory is not a directory"));
        }
        if !dbversion::exists(src) {
            tracing::error!("Backup directory {} does not contain a complete backup", src.display());
            return Err(DbError::directory(src, "backup directory does not contain a complete backup"));
        }

        let config = self.config();
        let (dirs, files) = list_backup(src)?;
        if fs::canonicalize(src).ok() == fs::canonicalize(&config.directory).ok() {
            tracing::error!(
                "Backup dir {} and target dir {} are identical",
                src.display(),
                config.directory.display()
            );
            return Err(DbError::invalid_operation("backup dir and target dir are identical"));
        }
        let only = match &options.instance {
            Some(name) => {
                let instance = self.instance(name)?;
                if !dirs.contains(name) {
                    tracing::error!(instance = %name, "backup has no copy of the instance");
                    return Err(DbError::InstanceNotFound { name: name.clone() });
                }
                Some(instance)
            }
            None => {
                for name in dirs.iter().filter(|d| *d != CHANGELOG_BACKUP_DIR) {
                    if self.instance(name).is_err() {
                        tracing::error!("Target server has no backend ({name}) configured");
                        return Err(DbError::InstanceNotFound { name: name.clone() });
                    }
                }
                None
            }
        };

        let version = DbVersion::read(src)?.ok_or_else(|| {
            DbError::directory(src, "backup directory does not contain a complete backup")
        })?;
        let logs = only.is_none() && files.iter().any(|f| is_log_file(f));
        let mut mode = select_mode(&version, config.rdn_format, logs)?;

        let files_copied = match &only {
            Some(instance) => self.restore_instance(src, instance)?,
            None => self.restore_all(src, &dirs, &files)?,
        };

        if options.offline {
            mode |= DbMode::NO_DBTHREADS;
        }
        self.start(mode).inspect_err(|err| {
            tracing::error!(error = %err, "Failed to init database");
        })?;
        self.verify_manifest(src);
        let started = self.mode();
        if options.offline {
            self.close(mode).inspect_err(|err| {
                tracing::error!(error = %err, "Failed to close database");
            })?;
        }
        tracing::info!(src = %src.display(), files = files_copied, ?started, "restore complete");
        Ok(RestoreReport {
            files: files_copied,
            logs_restored: logs,
            mode: started,
        })
    }

    /// Replaces every instance, the changelog, the logs and the marker.
    fn restore_all(&self, src: &Path, dirs: &[String], files: &[String]) -> DbResult<usize> {
        let config = self.config();
        self.delete_database()?;
        let mut count = 1;

        for name in dirs {
            let from = src.join(name);
            if name == CHANGELOG_BACKUP_DIR {
                match &config.changelog_directory {
                    Some(changelog) => {
                        copy_directory(&from, changelog, CopyAction::Restore, &mut count)?;
                    }
                    None => tracing::warn!("backup holds a changelog but none is configured; skipping it"),
                }
                continue;
            }
            let Ok(instance) = self.instance(name) else {
                continue;
            };
            copy_directory(&from, instance.dir(), CopyAction::Restore, &mut count).inspect_err(
                |err| tracing::error!(error = %err, "Failed to copy directory {}", from.display()),
            )?;
        }

        let home = config.env_home().to_path_buf();
        let log_dir = config.log_dir();
        for name in files.iter().filter(|f| !skipped(f)) {
            let prefix = if is_log_file(name) { &log_dir } else { &home };
            fs::create_dir_all(prefix)?;
            let target = prefix.join(name);
            tracing::info!("Restoring file {count} ({})", target.display());
            copyfile(&src.join(name), &target)?;
            count += 1;
        }
        Ok(count - 1)
    }

    /// Restores one instance through a private staging area.
    fn restore_instance(&self, src: &Path, instance: &Instance) -> DbResult<usize> {
        let config = self.config();
        let staging = sibling(&config.directory, "restore-staging");
        let reset = sibling(&config.directory, "restore-reset");
        remove_dir_if_exists(&staging)?;
        remove_dir_if_exists(&reset)?;

        let result = self.stage_instance(src, instance, &staging, &reset).and_then(|()| {
            self.delete_instance_dir(instance)?;
            let mut count = 1;
            copy_directory(
                &reset.join(instance.name()),
                instance.dir(),
                CopyAction::Restore,
                &mut count,
            )?;
            // The other instances keep running on the old logs; a crash
            // from here on must be recovered.
            match fs::remove_file(config.env_home().join(GUARDIAN_FILE)) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
            Ok(count - 1)
        });
        for dir in [&staging, &reset] {
            if let Err(err) = remove_dir_if_exists(dir) {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to remove restore staging area");
            }
        }
        result
    }

    /// Copies the whole backup into `staging`, recovers it there, and
    /// recopies `instance` record by record into `reset`.
    fn stage_instance(
        &self,
        src: &Path,
        instance: &Instance,
        staging: &Path,
        reset: &Path,
    ) -> DbResult<()> {
        let (dirs, files) = list_backup(src)?;
        fs::create_dir_all(staging)?;
        let mut count = 1;
        for name in dirs.iter().filter(|d| *d != CHANGELOG_BACKUP_DIR) {
            copy_directory(&src.join(name), &staging.join(name), CopyAction::Restore, &mut count)?;
        }
        let mut logs = false;
        for name in files.iter().filter(|f| !skipped(f)) {
            logs |= is_log_file(name);
            copyfile(&src.join(name), &staging.join(name))?;
        }

        let mut flags = EnvFlags::CREATE | EnvFlags::INIT_MPOOL | EnvFlags::PRIVATE;
        if logs {
            flags |= EnvFlags::INIT_TXN
                | EnvFlags::INIT_LOG
                | EnvFlags::INIT_LOCK
                | EnvFlags::RECOVER_FATAL;
        }
        tracing::info!(staging = %staging.display(), "recovering the staged backup");
        EnvBuilder::new(EnvConfig::default())
            .open(staging, flags)?
            .close()?;

        let source = EnvBuilder::new(EnvConfig::default())
            .open(staging, EnvFlags::CREATE | EnvFlags::INIT_MPOOL | EnvFlags::PRIVATE)?;
        let target = EnvBuilder::new(EnvConfig::default())
            .open(reset, EnvFlags::CREATE | EnvFlags::INIT_MPOOL | EnvFlags::PRIVATE)?;
        let copied = reset_lsns(&source, &target, &staging.join(instance.name()), instance.name());
        let closed = target.close().and(source.close());
        copied.and(closed)
    }

    /// Warns about instances or index files the backup's manifest lists
    /// that did not come back.
    fn verify_manifest(&self, src: &Path) {
        let manifest = match BackupManifest::read(src) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "Unable to verify the index configuration");
                return;
            }
        };
        for entry in &manifest.instances {
            let Ok(instance) = self.instance(&entry.name) else {
                tracing::warn!(instance = %entry.name, "backup instance is not configured");
                continue;
            };
            for index in &entry.indexes {
                let file = instance.dir().join(format!("{index}.{DB_EXTENSION}"));
                if !file.is_file() {
                    tracing::warn!(instance = %entry.name, index = %index, "index listed in the backup is missing after restore");
                }
            }
        }
    }
}

/// Copies every database of `instance` found in `dir` from `source` into
/// `target`, key by key. `target` has no log, so the new files carry no
/// log positions.
fn reset_lsns(
    source: &crate::engine::Environment,
    target: &crate::engine::Environment,
    dir: &Path,
    instance: &str,
) -> DbResult<()> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == DB_EXTENSION))
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    for file in names {
        let name = format!("{instance}/{file}");
        let from = source.db_open(&name, DbOpenFlags::empty())?;
        let to = target.db_open(&name, DbOpenFlags::CREATE | (from.flags() & DbOpenFlags::STRUCTURE))?;
        let mut cursor = from.cursor(None)?;
        let mut records = 0u64;
        loop {
            match cursor.next() {
                Ok((key, data)) => {
                    to.put(None, &key, &data)?;
                    records += 1;
                }
                Err(DbError::NotFound) => break,
                Err(err) => return Err(err),
            }
        }
        tracing::debug!(db = %name, records, "log positions reset");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbLayerConfig;
    use tempfile::tempdir;

    #[test]
    fn log_file_names_are_recognized() {
        assert!(is_log_file("log.0000000001"));
        assert!(!is_log_file("log.db"));
        assert!(!is_log_file("DBVERSION"));
        assert!(skipped("userRoot.ldif"));
        assert!(skipped(MANIFEST_FILE));
    }

    #[test]
    fn mode_follows_version_and_logs() {
        let current = DbVersion::current(true);
        assert_eq!(select_mode(&current, true, true).unwrap(), DbMode::RESTORE);
        assert_eq!(
            select_mode(&current, true, false).unwrap(),
            DbMode::RESTORE_NO_RECOVERY
        );
        assert!(matches!(
            select_mode(&current, false, true),
            Err(DbError::AddressingMismatch { .. })
        ));
        assert!(matches!(
            select_mode(&DbVersion::current(false), true, true),
            Err(DbError::AddressingMismatch { .. })
        ));

        let mut old = DbVersion::current(true);
        old.major = 0;
        assert_eq!(select_mode(&old, true, true).unwrap(), DbMode::CLEAN_RECOVER);

        let mut foreign = DbVersion::current(true);
        foreign.implementation = "lmdb".into();
        assert!(matches!(
            select_mode(&foreign, true, true),
            Err(DbError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn incomplete_backup_is_refused_before_anything_changes() {
        let dir = tempdir().unwrap();
        let backup = tempdir().unwrap();
        let layer = DbLayer::init(DbLayerConfig::new(dir.path().join("db"))).unwrap();
        let err = layer
            .restore(&backup.path().join("missing"), &RestoreOptions::new())
            .unwrap_err();
        assert!(matches!(err, DbError::Directory { .. }));

        let err = layer.restore(backup.path(), &RestoreOptions::new()).unwrap_err();
        assert!(matches!(err, DbError::Directory { .. }));
    }

    #[test]
    fn unknown_backup_instance_is_refused() {
        let dir = tempdir().unwrap();
        let backup = tempdir().unwrap();
        DbVersion::current(true).write(backup.path()).unwrap();
        fs::create_dir_all(backup.path().join("otherRoot")).unwrap();

        let layer = DbLayer::init(DbLayerConfig::new(dir.path().join("db"))).unwrap();
        layer.add_instance("userRoot").unwrap();
        let err = layer.restore(backup.path(), &RestoreOptions::new()).unwrap_err();
        assert!(matches!(err, DbError::InstanceNotFound { ref name } if name == "otherRoot"));

        let err = layer
            .restore(backup.path(), &RestoreOptions::new().with_instance("userRoot"))
            .unwrap_err();
        assert!(matches!(err, DbError::InstanceNotFound { ref name } if name == "userRoot"));
    }
}
