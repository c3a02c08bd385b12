//! Archive tasks built on backup and restore.
//!
//! These are the entry points the command line and the task framework
//! call: they take care of marking instances busy, keeping the previous
//! archive aside until the new one is complete, and leaving the restore
//! marker for the next startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backup::BackupReport;
use crate::error::{DbError, DbResult};
use crate::guardian;
use crate::instance::Instance;
use crate::layer::{DbLayer, DbMode};
use crate::restore::{RestoreOptions, RestoreReport};

fn absolute(path: &Path) -> DbResult<PathBuf> {
    Ok(std::path::absolute(path)?)
}

impl DbLayer {
    /// Marks every instance busy, or none of them.
    fn set_all_busy(&self) -> DbResult<Vec<Arc<Instance>>> {
        let mut marked: Vec<Arc<Instance>> = Vec::new();
        for instance in self.instances() {
            if let Err(err) = instance.set_busy() {
                tracing::warn!(
                    "Backend '{}' is already in the middle of another task and cannot be disturbed.",
                    instance.name()
                );
                for done in &marked {
                    done.clear_busy();
                }
                return Err(err);
            }
            marked.push(instance);
        }
        Ok(marked)
    }

    /// Backs up into `dest`, keeping a previous archive there as
    /// `<dest>.bak` until the new one is complete.
    ///
    /// With `offline` the environment is opened for the archive and closed
    /// again afterwards, without background threads and without touching
    /// the guardian.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] when `dest` is the database directory,
    /// [`DbError::Busy`] when an instance is in another task, and every
    /// failure of [`DbLayer::backup`].
    pub fn db2archive(&self, dest: &Path, offline: bool) -> DbResult<BackupReport> {
        let mode = DbMode::ARCHIVE | DbMode::NO_DBTHREADS;
        if offline {
            self.start(mode).inspect_err(|err| {
                tracing::error!(error = %err, "Failed to init database");
            })?;
        }
        let result = self.archive_into(dest);
        if offline {
            if let Err(err) = self.close(mode) {
                tracing::error!(error = %err, "failed to close the database after archiving");
                return result.and(Err(err));
            }
        }
        result
    }

    fn archive_into(&self, dest: &Path) -> DbResult<BackupReport> {
        let dest = absolute(dest)?;
        let directory = absolute(&self.config().directory)?;
        let mut backup_dir = None;
        if dest.exists() {
            if fs::canonicalize(&dest).ok() == fs::canonicalize(&directory).ok() {
                tracing::error!("Cannot archive to the db directory.");
                return Err(DbError::invalid_operation("cannot archive to the db directory"));
            }
            let mut bak = dest.clone().into_os_string();
            bak.push(".bak");
            let bak = PathBuf::from(bak);
            tracing::info!("{} exists. Renaming to {}", dest.display(), bak.display());
            if bak.exists() {
                fs::remove_dir_all(&bak).inspect_err(|_| {
                    tracing::error!("{} exists and failed to delete it.", bak.display());
                })?;
            }
            fs::rename(&dest, &bak).inspect_err(|err| {
                tracing::error!(error = %err, "Failed to rename \"{}\" to \"{}\".", dest.display(), bak.display());
            })?;
            backup_dir = Some(bak);
        }

        let result = fs::create_dir_all(&dest)
            .map_err(DbError::from)
            .and_then(|()| {
                let marked = self.set_all_busy()?;
                let result = self.backup(&dest);
                for instance in &marked {
                    instance.clear_busy();
                }
                result
            });

        if result.is_err() {
            if let Some(bak) = &backup_dir {
                tracing::error!("Failed to backup; restoring {} from {}", dest.display(), bak.display());
                if dest.exists() {
                    if let Err(err) = fs::remove_dir_all(&dest) {
                        tracing::error!(error = %err, "failed to remove the incomplete archive");
                    }
                }
                if let Err(err) = fs::rename(bak, &dest) {
                    tracing::error!(error = %err, "Failed to rename \"{}\" to \"{}\".", bak.display(), dest.display());
                }
            }
        }
        result
    }

    /// Restores the archive in `src` and records the outcome in the
    /// restore marker.
    ///
    /// A started layer is taken down first with every instance marked
    /// busy; on failure it is started again on whatever data is left.
    ///
    /// # Errors
    ///
    /// [`DbError::Busy`] when an instance is in another task, and every
    /// failure of [`DbLayer::restore`].
    pub fn archive2db(&self, src: &Path, options: &RestoreOptions) -> DbResult<RestoreReport> {
        let src = absolute(src)?;
        let home = self.home().to_path_buf();
        guardian::init_restore_marker(&home).inspect_err(|err| {
            tracing::error!(error = %err, "Failed to write restore file.");
        })?;

        let online = self.is_started();
        let mut marked = Vec::new();
        if online {
            marked = self.set_all_busy()?;
            for instance in &marked {
                tracing::info!("Bringing {} offline...", instance.name());
            }
            if let Err(err) = self.close(DbMode::RESTORE) {
                for instance in &marked {
                    instance.clear_busy();
                }
                return Err(err);
            }
        }

        let result = self.restore(&src, options);
        if let Err(err) = &result {
            tracing::error!(
                error = %err,
                "Failed to read backup file set. Either the directory specified doesn't exist, or it exists but doesn't contain a valid backup set, or file permissions prevent the server reading the backup set."
            );
            if online && !self.is_started() {
                if let Err(err) = self.start(DbMode::NORMAL) {
                    tracing::error!(error = %err, "Unable to start database in [{}]", home.display());
                }
            }
        }
        for instance in &marked {
            instance.clear_busy();
        }
        if result.is_ok() {
            guardian::update_restore_marker(&home, &src)?;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbLayerConfig;
    use tempfile::tempdir;

    #[test]
    fn archiving_into_the_db_directory_is_refused() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(DbLayerConfig::new(dir.path())).unwrap();
        let err = layer.archive_into(dir.path()).unwrap_err();
        assert!(matches!(err, DbError::InvalidOperation { .. }));
    }

    #[test]
    fn failed_archive_puts_the_previous_one_back() {
        let dir = tempdir().unwrap();
        let archives = tempdir().unwrap();
        let dest = archives.path().join("nightly");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("DBVERSION"), b"previous").unwrap();

        let layer = DbLayer::init(DbLayerConfig::new(dir.path().join("db"))).unwrap();
        let err = layer.db2archive(&dest, false).unwrap_err();
        assert!(matches!(err, DbError::NotStarted));
        assert_eq!(fs::read(dest.join("DBVERSION")).unwrap(), b"previous");
        assert!(!archives.path().join("nightly.bak").exists());
    }

    #[test]
    fn busy_instance_blocks_the_archive() {
        let dir = tempdir().unwrap();
        let archives = tempdir().unwrap();
        let layer = DbLayer::init(DbLayerConfig::new(dir.path())).unwrap();
        let first = layer.add_instance("a").unwrap();
        let second = layer.add_instance("b").unwrap();
        second.set_busy().unwrap();
        assert!(matches!(
            layer.archive_into(&archives.path().join("x")),
            Err(DbError::Busy { .. })
        ));
        assert!(!first.is_busy());
        assert!(second.is_busy());
    }

    #[test]
    fn every_instance_is_marked_busy_together() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(DbLayerConfig::new(dir.path())).unwrap();
        layer.add_instance("a").unwrap();
        layer.add_instance("b").unwrap();

        let marked = layer.set_all_busy().unwrap();
        assert_eq!(marked.len(), 2);
        assert!(marked.iter().all(|instance| instance.is_busy()));
        assert!(matches!(layer.set_all_busy(), Err(DbError::Busy { .. })));
        for instance in &marked {
            instance.clear_busy();
        }
        assert!(layer.instances().iter().all(|instance| !instance.is_busy()));
    }

    #[test]
    fn failed_restore_leaves_an_empty_marker() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("db");
        let layer = DbLayer::init(DbLayerConfig::new(&home)).unwrap();
        assert!(layer
            .archive2db(&dir.path().join("missing"), &RestoreOptions::new())
            .is_err());
        assert_eq!(
            fs::read(guardian::restore_marker(&home)).unwrap(),
            Vec::<u8>::new()
        );
    }
}
