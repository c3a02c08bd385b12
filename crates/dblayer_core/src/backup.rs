//! Online backup.
//!
//! A backup copies every instance's database files, the transaction logs
//! and the `DBVERSION` marker into a destination directory while the
//! environment stays open. A forced checkpoint runs first and a
//! transaction stays open for the whole copy so the logs it needs cannot
//! be trimmed. The log list is taken before and after the data files are
//! copied; if a file disappeared in between, the copy is started again.
//!
//! ## Layout
//!
//! ```text
//! <dest>/DBVERSION
//! <dest>/log.0000000001 ...
//! <dest>/dse_instance.json
//! <dest>/<instance>/<index>.db
//! <dest>/.repl_changelog_backup/...
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dbversion::DBVERSION_FILE;
use crate::engine::{ArchiveFlags, Environment};
use crate::error::{DbError, DbResult};
use crate::instance::DB_EXTENSION;
use crate::layer::DbLayer;

/// Subdirectory of a backup holding the replication changelog.
pub const CHANGELOG_BACKUP_DIR: &str = ".repl_changelog_backup";

/// Name of the instance manifest written into every backup.
pub const MANIFEST_FILE: &str = "dse_instance.json";

/// Lists the transaction log files of an environment by file name.
///
/// The backup asks twice per attempt; tests substitute their own lister to
/// simulate log files vanishing between the two calls.
pub trait LogLister: Send + Sync {
    /// Current log file names, oldest first.
    ///
    /// # Errors
    ///
    /// Engine failures.
    fn list(&self, env: &Environment) -> DbResult<Vec<String>>;
}

/// Lists every log file the environment still has.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveLister;

impl LogLister for ArchiveLister {
    fn list(&self, env: &Environment) -> DbResult<Vec<String>> {
        Ok(env
            .log_archive(ArchiveFlags::LOG)?
            .into_iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect())
    }
}

/// What a finished backup copied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    /// Files copied, logs and markers included.
    pub files: usize,
    /// Log files in the backup.
    pub logs: Vec<String>,
    /// Copy passes needed before the log set held still.
    pub attempts: u32,
}

/// Instances and their index files at backup time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// One entry per instance, by name.
    pub instances: Vec<ManifestInstance>,
}

/// One instance of a [`BackupManifest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestInstance {
    /// Instance name.
    pub name: String,
    /// Index names with a file in the backup.
    pub indexes: Vec<String>,
}

impl BackupManifest {
    /// Reads the manifest of the backup in `dir`, if it has one.
    ///
    /// # Errors
    ///
    /// I/O failures other than a missing file, or malformed JSON.
    pub fn read(dir: &Path) -> DbResult<Option<Self>> {
        match fs::read(dir.join(MANIFEST_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, dir: &Path) -> DbResult<()> {
        let text = serde_json::to_vec_pretty(self)?;
        fs::write(dir.join(MANIFEST_FILE), text)?;
        Ok(())
    }

    /// The entry for instance `name`.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<&ManifestInstance> {
        self.instances.iter().find(|i| i.name == name)
    }
}

/// Which way files are being copied; only changes the progress messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyAction {
    Backup,
    Restore,
}

impl CopyAction {
    fn log(self, count: usize, target: &Path) {
        match self {
            Self::Backup => tracing::info!("Backing up file {count} ({})", target.display()),
            Self::Restore => tracing::info!("Restoring file {count} ({})", target.display()),
        }
    }
}

/// Copies `source` over `destination`. Returns the bytes copied.
pub(crate) fn copyfile(source: &Path, destination: &Path) -> DbResult<u64> {
    tracing::debug!(source = %source.display(), destination = %destination.display(), "copying file");
    fs::copy(source, destination).map_err(|err| {
        tracing::error!(
            source = %source.display(),
            destination = %destination.display(),
            error = %err,
            "failed to copy file"
        );
        DbError::copy_failed(source, err)
    })
}

/// True for the files a database directory copy takes along.
fn is_database_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == DB_EXTENSION)
        || path.file_name().is_some_and(|name| name == DBVERSION_FILE)
}

/// Copies the database files of `src` into `dest`, which is emptied first.
///
/// `count` numbers the files across a whole backup or restore. A missing
/// `src` copies nothing.
pub(crate) fn copy_directory(
    src: &Path,
    dest: &Path,
    action: CopyAction,
    count: &mut usize,
) -> DbResult<()> {
    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(dir = %src.display(), "nothing to copy, directory does not exist");
            return Ok(());
        }
        Err(err) => {
            tracing::error!(dir = %src.display(), error = %err, "failed to open dir");
            return Err(DbError::directory(src, err.to_string()));
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_database_file(path))
        .collect();
    files.sort();

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest).map_err(|err| {
        DbError::directory(dest, format!("can't create new directory: {err}"))
    })?;
    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        let target = dest.join(name);
        action.log(*count, &target);
        copyfile(&file, &target)?;
        *count += 1;
    }
    Ok(())
}

/// Index names with a file in `dir`.
fn index_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == DB_EXTENSION))
        .filter_map(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .collect();
    names.sort();
    names
}

impl DbLayer {
    /// Backs the started environment up into `dest`.
    ///
    /// # Errors
    ///
    /// [`DbError::NotStarted`], [`DbError::Shutdown`] when
    /// [`DbLayer::request_shutdown`] is called midway, [`DbError::Busy`]
    /// when the log set never held still, and copy failures naming the
    /// file.
    pub fn backup(&self, dest: &Path) -> DbResult<BackupReport> {
        self.backup_with(dest, &ArchiveLister)
    }

    /// [`DbLayer::backup`] with a custom log lister.
    ///
    /// # Errors
    ///
    /// See [`DbLayer::backup`].
    pub fn backup_with(&self, dest: &Path, lister: &dyn LogLister) -> DbResult<BackupReport> {
        let env = self.environment()?;
        fs::create_dir_all(dest).map_err(|err| {
            DbError::directory(dest, format!("can't create backup directory: {err}"))
        })?;

        if env.uses_txn() {
            self.checkpoint(true)?;
        }
        let txn = self.txn_begin_all(None).inspect_err(|err| {
            tracing::error!(error = %err, "Transaction error");
        })?;
        let result = self.backup_pinned(&env, dest, lister);
        if let Err(err) = self.txn_abort_all(Some(&txn)) {
            tracing::warn!(error = %err, "failed to abort the backup transaction");
        }
        match result {
            Ok(report) => {
                tracing::info!(dest = %dest.display(), files = report.files, attempts = report.attempts, "backup complete");
                Ok(report)
            }
            Err(err) => {
                tracing::error!(dest = %dest.display(), error = %err, "backup failed");
                Err(self.report(err))
            }
        }
    }

    fn check_shutdown(&self) -> DbResult<()> {
        if self.shutdown_requested() {
            tracing::warn!("Server shutting down, backup aborted");
            return Err(DbError::Shutdown);
        }
        Ok(())
    }

    /// The copy loop, run while the backup transaction pins the logs.
    fn backup_pinned(
        &self,
        env: &Environment,
        dest: &Path,
        lister: &dyn LogLister,
    ) -> DbResult<BackupReport> {
        let config = self.config();
        let logging = env.uses_log();
        let mut count = 1;
        let mut attempts = 0;

        let logs = loop {
            if attempts >= config.backup_retries.max(1) {
                return Err(DbError::Busy {
                    message: format!("log files kept changing during {attempts} backup attempts"),
                });
            }
            attempts += 1;
            self.check_shutdown()?;
            let before = if logging { lister.list(env)? } else { Vec::new() };
            self.check_shutdown()?;

            for instance in self.instances() {
                copy_directory(
                    instance.dir(),
                    &dest.join(instance.name()),
                    CopyAction::Backup,
                    &mut count,
                )
                .inspect_err(|err| {
                    tracing::error!(
                        instance = instance.name(),
                        error = %err,
                        "Error in copying directory ({} -> {})",
                        instance.dir().display(),
                        dest.display()
                    );
                })?;
            }
            if let Some(changelog) = &config.changelog_directory {
                if changelog.is_absolute() {
                    copy_directory(
                        changelog,
                        &dest.join(CHANGELOG_BACKUP_DIR),
                        CopyAction::Backup,
                        &mut count,
                    )?;
                } else {
                    tracing::error!(dir = %changelog.display(), "changelog directory is not a full path; skipping it");
                }
            }
            if !logging {
                break Vec::new();
            }

            let after = lister.list(env)?;
            if let Some(missing) = before.iter().find(|name| !after.contains(name)) {
                tracing::warn!("Log {missing} has been swiped out from under me! (retrying)");
                continue;
            }
            self.check_shutdown()?;

            let log_dir = env.log_dir();
            for name in &after {
                let target = dest.join(name);
                CopyAction::Backup.log(count, &target);
                copyfile(&log_dir.join(name), &target)?;
                self.check_shutdown()?;
                count += 1;
            }
            break after;
        };

        let target = dest.join(DBVERSION_FILE);
        CopyAction::Backup.log(count, &target);
        copyfile(&env.home().join(DBVERSION_FILE), &target)?;
        count += 1;

        BackupManifest {
            instances: self
                .instances()
                .iter()
                .map(|instance| ManifestInstance {
                    name: instance.name().to_string(),
                    indexes: index_files(&dest.join(instance.name())),
                })
                .collect(),
        }
        .write(dest)?;

        Ok(BackupReport {
            files: count - 1,
            logs,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_directory_takes_only_database_files() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        fs::write(src.path().join("id2entry.db"), b"entries").unwrap();
        fs::write(src.path().join("cn.db"), b"cn").unwrap();
        fs::write(src.path().join(DBVERSION_FILE), b"native/1.0\n").unwrap();
        fs::write(src.path().join("export.ldif"), b"dn: o=x").unwrap();

        let target = dest.path().join("userRoot");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.db"), b"old").unwrap();

        let mut count = 1;
        copy_directory(src.path(), &target, CopyAction::Backup, &mut count).unwrap();
        assert_eq!(count, 4);
        assert!(!target.join("stale.db").exists());
        assert!(!target.join("export.ldif").exists());
        assert_eq!(fs::read(target.join("id2entry.db")).unwrap(), b"entries");
        assert_eq!(index_files(&target), vec!["cn", "id2entry"]);
    }

    #[test]
    fn copy_of_a_missing_directory_is_empty() {
        let dest = tempdir().unwrap();
        let mut count = 1;
        copy_directory(
            &dest.path().join("absent"),
            &dest.path().join("copy"),
            CopyAction::Restore,
            &mut count,
        )
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn copyfile_failure_names_the_source() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("log.0000000009");
        let err = copyfile(&missing, &dir.path().join("out")).unwrap_err();
        match err {
            DbError::CopyFailed { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let dir = tempdir().unwrap();
        assert!(BackupManifest::read(dir.path()).unwrap().is_none());
        let manifest = BackupManifest {
            instances: vec![ManifestInstance {
                name: "userRoot".into(),
                indexes: vec!["cn".into(), "id2entry".into()],
            }],
        };
        manifest.write(dir.path()).unwrap();
        let read = BackupManifest::read(dir.path()).unwrap().unwrap();
        assert_eq!(read, manifest);
        assert!(read.instance("userRoot").is_some());
        assert!(read.instance("other").is_none());
    }
}
