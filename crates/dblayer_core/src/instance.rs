//! Backend instances and their open index files.
//!
//! An instance owns a directory under the layer's data directory holding
//! its primary store (`id2entry.db`) and one file per index. Index handles
//! are shared: [`DbLayer::get_index`] hands out counted references, and
//! [`DbLayer::erase_index`] takes an index offline, waits for the last
//! reference to go and only then removes the file.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::engine::DbOpenFlags;
use crate::error::{DbError, DbResult};
use crate::handle::DbHandle;
use crate::layer::DbLayer;
use crate::txn::SerialLock;

/// Extension of every database file.
pub const DB_EXTENSION: &str = "db";

/// Index name of the primary store.
pub const ID2ENTRY: &str = "id2entry";

/// Lifecycle of a shared index handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// References may be taken.
    Online,
    /// Being erased; waiting for the last reference to go.
    OfflineDraining,
    /// The handle is closed.
    Closed,
}

struct IndexSlot {
    index: String,
    handle: Box<dyn DbHandle>,
    state: Mutex<SlotState>,
    drained: Condvar,
}

struct SlotState {
    status: IndexStatus,
    refs: usize,
}

impl IndexSlot {
    fn release(&self) {
        let mut state = self.state.lock();
        state.refs -= 1;
        if state.refs == 0 {
            self.drained.notify_all();
        }
    }

    fn close(&self) -> DbResult<()> {
        let mut state = self.state.lock();
        if state.status == IndexStatus::Closed {
            return Ok(());
        }
        if state.refs > 0 {
            tracing::warn!(index = %self.index, refs = state.refs, "closing an index that is still referenced");
        }
        state.status = IndexStatus::Closed;
        drop(state);
        self.handle.close()
    }
}

/// A counted reference to an open index. Dropping it releases the
/// reference.
pub struct IndexRef {
    slot: Arc<IndexSlot>,
}

impl IndexRef {
    /// Index name, e.g. `cn`.
    #[must_use]
    pub fn index(&self) -> &str {
        &self.slot.index
    }
}

impl Deref for IndexRef {
    type Target = dyn DbHandle;

    fn deref(&self) -> &Self::Target {
        self.slot.handle.as_ref()
    }
}

impl Drop for IndexRef {
    fn drop(&mut self) {
        self.slot.release();
    }
}

impl fmt::Debug for IndexRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexRef")
            .field("index", &self.slot.index)
            .finish_non_exhaustive()
    }
}

/// A backend instance.
pub struct Instance {
    name: String,
    dir: PathBuf,
    indexes: Mutex<HashMap<String, Arc<IndexSlot>>>,
    serial: SerialLock,
    busy: AtomicBool,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn new(name: &str, directory: &Path) -> Self {
        Self {
            name: name.to_string(),
            dir: directory.join(name),
            indexes: Mutex::new(HashMap::new()),
            serial: SerialLock::default(),
            busy: AtomicBool::new(false),
        }
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the instance's files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Database name of an index, relative to the data directory.
    #[must_use]
    pub fn db_name(&self, index: &str) -> String {
        format!("{}/{index}.{DB_EXTENSION}", self.name)
    }

    pub(crate) fn serial_lock(&self) -> &SerialLock {
        &self.serial
    }

    /// True while an offline task (import, restore, reindex) runs.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Marks the instance busy.
    ///
    /// # Errors
    ///
    /// [`DbError::Busy`] if it already is.
    pub fn set_busy(&self) -> DbResult<()> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(DbError::Busy {
                message: format!("instance {} is busy", self.name),
            });
        }
        Ok(())
    }

    /// Clears the busy mark.
    pub fn clear_busy(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Names of the indexes with an open handle.
    #[must_use]
    pub fn open_indexes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of an open index, `None` when it has no handle.
    #[must_use]
    pub fn index_status(&self, index: &str) -> Option<IndexStatus> {
        self.indexes
            .lock()
            .get(index)
            .map(|slot| slot.state.lock().status)
    }

    /// Closes every open index handle.
    ///
    /// # Errors
    ///
    /// The first handle close failure; the rest are still closed.
    pub fn close(&self) -> DbResult<()> {
        let slots: Vec<Arc<IndexSlot>> = self.indexes.lock().drain().map(|(_, s)| s).collect();
        let mut result = Ok(());
        for slot in slots {
            if let Err(err) = slot.close() {
                tracing::error!(instance = %self.name, index = %slot.index, error = %err, "failed to close index");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Bytes of the instance's files.
    #[must_use]
    pub fn size(&self) -> u64 {
        dir_size(&self.dir)
    }
}

pub(crate) fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

impl DbLayer {
    /// A reference to the index `index` of `instance`, opening its file on
    /// first use.
    ///
    /// # Errors
    ///
    /// [`DbError::Busy`] while the index is being erased,
    /// [`DbError::DatabaseNotFound`] when the file is missing and `create`
    /// is false, or engine failures.
    pub fn get_index(&self, instance: &Instance, index: &str, create: bool) -> DbResult<IndexRef> {
        let existing = instance.indexes.lock().get(index).cloned();
        if let Some(slot) = existing {
            if let Some(reference) = take_reference(&slot)? {
                return Ok(reference);
            }
        }

        let env = self.environment()?;
        let mut indexes = instance.indexes.lock();
        if let Some(slot) = indexes.get(index).cloned() {
            if let Some(reference) = take_reference(&slot)? {
                return Ok(reference);
            }
            indexes.remove(index);
        }
        let flags = if create {
            DbOpenFlags::CREATE
        } else {
            DbOpenFlags::empty()
        };
        let name = instance.db_name(index);
        let handle = self
            .implementation()
            .open(&env, &name, flags)
            .map_err(|err| self.report(err))?;
        tracing::debug!(instance = %instance.name, index, "index opened");
        let slot = Arc::new(IndexSlot {
            index: index.to_string(),
            handle,
            state: Mutex::new(SlotState {
                status: IndexStatus::Online,
                refs: 1,
            }),
            drained: Condvar::new(),
        });
        indexes.insert(index.to_string(), Arc::clone(&slot));
        Ok(IndexRef { slot })
    }

    /// The primary store of `instance`, created when missing.
    ///
    /// # Errors
    ///
    /// See [`DbLayer::get_index`].
    pub fn get_primary(&self, instance: &Instance) -> DbResult<IndexRef> {
        self.get_index(instance, ID2ENTRY, true)
    }

    /// Takes an index offline, waits until every reference is released and
    /// no write transaction is in flight, then closes and deletes its file.
    ///
    /// The caller must not hold a reference to the index nor have a write
    /// transaction open.
    ///
    /// # Errors
    ///
    /// Engine failures closing or removing the file.
    pub fn erase_index(&self, instance: &Instance, index: &str) -> DbResult<()> {
        let env = self.environment()?;
        let slot = instance.indexes.lock().get(index).cloned();
        if let Some(slot) = &slot {
            let mut state = slot.state.lock();
            if state.status == IndexStatus::Online {
                state.status = IndexStatus::OfflineDraining;
            }
            while state.refs > 0 {
                tracing::debug!(index, refs = state.refs, "waiting for index references to drain");
                slot.drained.wait(&mut state);
            }
        }

        let _exclusive = self.inner.gate.exclusive();
        if let Some(slot) = &slot {
            slot.close()?;
        }
        let name = instance.db_name(index);
        let removed = match self.implementation().remove(&env, &name) {
            Err(DbError::DatabaseNotFound { .. }) => Ok(()),
            other => other,
        };
        {
            let mut indexes = instance.indexes.lock();
            if indexes
                .get(index)
                .zip(slot.as_ref())
                .is_some_and(|(current, erased)| Arc::ptr_eq(current, erased))
            {
                indexes.remove(index);
            }
        }
        removed.map_err(|err| self.report(err))?;
        tracing::info!(instance = %instance.name, index, "index erased");
        Ok(())
    }

    /// Removes every file and subdirectory of `instance`, then its
    /// directory. Open handles are closed first.
    ///
    /// # Errors
    ///
    /// I/O or engine failures.
    pub fn delete_instance_dir(&self, instance: &Instance) -> DbResult<()> {
        instance.close()?;
        let dir = instance.dir();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let env = self.environment().ok();
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
                continue;
            }
            let is_db = path.extension().is_some_and(|ext| ext == DB_EXTENSION);
            match (&env, is_db, path.file_name()) {
                (Some(env), true, Some(file)) => {
                    let name = format!("{}/{}", instance.name(), file.to_string_lossy());
                    match self.implementation().remove(env, &name) {
                        Ok(()) | Err(DbError::DatabaseNotFound { .. }) => {}
                        Err(err) => return Err(self.report(err)),
                    }
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                }
                _ => fs::remove_file(&path)?,
            }
        }
        fs::remove_dir(dir)?;
        tracing::info!(instance = %instance.name(), dir = %dir.display(), "instance directory deleted");
        Ok(())
    }

    /// Deletes every instance directory, the plain files of the home and
    /// data directories, and the transaction logs.
    ///
    /// # Errors
    ///
    /// [`DbError::Busy`] while the environment is open, or I/O failures.
    pub fn delete_database(&self) -> DbResult<()> {
        if self.is_started() {
            return Err(DbError::Busy {
                message: "cannot delete the database while the environment is open".into(),
            });
        }
        for instance in self.instances() {
            self.delete_instance_dir(&instance)?;
        }
        let config = self.config();
        let mut dirs = vec![config.directory.clone()];
        if config.separate_db_home() {
            dirs.push(config.env_home().to_path_buf());
        }
        let log_dir = config.log_dir();
        if !dirs.contains(&log_dir) {
            dirs.push(log_dir);
        }
        for dir in dirs {
            remove_plain_files(&dir)?;
        }
        Ok(())
    }

    /// Size of the database files in KiB.
    #[must_use]
    pub fn database_size(&self) -> u64 {
        let config = self.config();
        let mut bytes = dir_size(&config.directory);
        if config.separate_db_home() {
            bytes += dir_size(config.env_home());
        }
        bytes / 1024
    }
}

fn take_reference(slot: &Arc<IndexSlot>) -> DbResult<Option<IndexRef>> {
    let mut state = slot.state.lock();
    match state.status {
        IndexStatus::Online => {
            state.refs += 1;
            Ok(Some(IndexRef {
                slot: Arc::clone(slot),
            }))
        }
        IndexStatus::OfflineDraining => Err(DbError::Busy {
            message: format!("index {} is offline", slot.index),
        }),
        IndexStatus::Closed => Ok(None),
    }
}

fn remove_plain_files(dir: &Path) -> DbResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
