//! Environment startup and shutdown.
//!
//! [`DbLayer::start`] decides from the guardian, the restore marker and the
//! requested [`DbMode`] whether the environment needs recovery, runs it in
//! a single-threaded open, then performs the real open and starts the
//! maintenance threads. [`DbLayer::close`] undoes all of that and leaves a
//! guardian behind when the run was clean.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{DbLayerConfig, MIN_CACHE_SIZE, MIN_LOCKS, MIN_LOGBUF_SIZE};
use crate::dbversion::{self, DbVersion};
use crate::engine::{EnvBuilder, EnvFlags, MemoryTracker, MAX_CACHE_CHUNK};
use crate::error::{DbError, DbResult};
use crate::guardian::{self, Guardian, RestoreMarker};
use crate::layer::{DbLayer, DbMode, EnvSlot};
use crate::sysinfo::{self, CacheCheck, MemInfo};

/// Picks the number of cache chunks.
///
/// An explicit `ncache` wins. Otherwise a cache larger than one chunk may
/// hold is split into `cachesize / 4GiB + 1` chunks, and anything smaller
/// stays at 0 so the engine uses a single chunk.
#[must_use]
pub fn select_ncache(cachesize: u64, ncache: u32) -> u32 {
    if ncache != 0 || cachesize <= MAX_CACHE_CHUNK {
        return ncache;
    }
    let chunks = cachesize / MAX_CACHE_CHUNK + 1;
    tracing::info!(cachesize, chunks, "cache is larger than one chunk, splitting it");
    u32::try_from(chunks).unwrap_or(u32::MAX)
}

/// Engine memory accounting, fed through [`MemoryTracker`].
#[derive(Debug, Default)]
pub(crate) struct MemoryUsage {
    bytes: AtomicU64,
}

impl MemoryUsage {
    pub(crate) fn in_use(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl MemoryTracker for MemoryUsage {
    fn allocated(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn released(&self, bytes: usize) {
        let _ = self
            .bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes as u64))
            });
    }
}

/// Creates `dir` when missing and checks that it is a writable directory.
fn grok_directory(dir: &Path) -> DbResult<()> {
    match fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => {
            return Err(DbError::directory(dir, "exists but is not a directory"));
        }
        Ok(meta) if meta.permissions().readonly() => {
            return Err(DbError::directory(dir, "is not writable"));
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|err| {
                DbError::directory(dir, format!("cannot be created: {err}"))
            })?;
            tracing::info!(dir = %dir.display(), "database directory created");
        }
        Err(err) => return Err(DbError::directory(dir, err.to_string())),
    }
    Ok(())
}

impl DbLayer {
    /// Bytes the engine reports as held by open databases.
    #[must_use]
    pub fn memory_in_use(&self) -> u64 {
        self.inner.memory.in_use()
    }

    /// Translates the configuration into an unopened environment.
    fn make_env(&self, config: &DbLayerConfig) -> EnvBuilder {
        let tracker: Arc<dyn MemoryTracker> = self.inner.memory.clone();
        let mut env_config = config.env_config().with_memory_tracker(tracker);
        if let Some(store) = self.inner.log_store.read().clone() {
            env_config = env_config.with_segment_store(store);
        }
        EnvBuilder::new(env_config)
    }

    /// Checks the cache against physical memory, shrinking it when it
    /// cannot fit. The adjusted size is written back to the configuration.
    fn sanitize_cache(&self) {
        let mut config = self.inner.config.write();
        if config.cachesize == 0 {
            return;
        }
        match sysinfo::check_cachesize(MemInfo::read().as_ref(), config.cachesize) {
            CacheCheck::Sane => {}
            CacheCheck::Unknown => {
                tracing::error!("unable to determine if the cache size is valid");
            }
            CacheCheck::Reduced(size) => {
                let size = size.max(MIN_CACHE_SIZE);
                tracing::warn!(
                    "Likely CONFIGURATION ERROR - dbcachesize is configured to use more than the available memory, decreased to ({size} bytes)."
                );
                config.cachesize = size;
            }
        }
        config.ncache = select_ncache(config.cachesize, config.ncache);
    }

    /// Opens the environment.
    ///
    /// Recovery runs first when the previous run left no guardian, when a
    /// restore asks for it, or in [`DbMode::CLEAN_RECOVER`]. Maintenance
    /// threads start only for a plain [`DbMode::NORMAL`] start. Starting an
    /// already started layer only logs a warning.
    ///
    /// # Errors
    ///
    /// - [`DbError::PreviouslyFailed`] after an earlier open ran out of memory.
    /// - [`DbError::Config`] without a database directory.
    /// - [`DbError::Directory`] when a directory cannot be used.
    /// - [`DbError::DiskFull`] when the region files would not fit.
    /// - Any engine error from recovery or the open.
    pub fn start(&self, mode: DbMode) -> DbResult<()> {
        match &*self.inner.env.read() {
            EnvSlot::Failed => {
                tracing::error!("DB previously failed to start.");
                return Err(DbError::PreviouslyFailed);
            }
            EnvSlot::Open(_) => {
                tracing::warn!("DB already started.");
                return Ok(());
            }
            EnvSlot::Closed => {}
        }

        let (directory, home, log_dir) = {
            let config = self.inner.config.read();
            (
                config.directory.clone(),
                config.env_home().to_path_buf(),
                config.log_dir(),
            )
        };
        if directory.as_os_str().is_empty() {
            tracing::error!("database directory is not specified");
            return Err(DbError::config("database directory is not specified"));
        }
        grok_directory(&directory)?;
        grok_directory(&home)?;
        grok_directory(&log_dir)?;
        dbversion::ensure(&home, self.inner.config.read().rdn_format)?;

        self.sanitize_cache();
        let mut mode = mode;
        self.inner.bad_stuff.store(false, Ordering::SeqCst);
        self.inner.shutdown.store(false, Ordering::SeqCst);

        if mode.intersects(DbMode::NORMAL | DbMode::CLEAN_RECOVER) {
            let mut data_dirs = vec![directory.clone()];
            if home != directory {
                data_dirs.push(home.clone());
            }
            let read = guardian::take(&home, &data_dirs)?;
            self.inner
                .recovery_required
                .store(read.recovery_required, Ordering::SeqCst);
            *self.inner.previous.lock() = read.previous;
            let restored = matches!(
                guardian::take_restore_marker(&home),
                RestoreMarker::Succeeded(_)
            );
            self.inner.restored.store(restored, Ordering::SeqCst);
        } else {
            self.inner.recovery_required.store(false, Ordering::SeqCst);
            *self.inner.previous.lock() = None;
        }
        let recovery_required = self.inner.recovery_required.load(Ordering::SeqCst);

        let config = self.config();
        let mut flags = EnvFlags::CREATE | EnvFlags::INIT_MPOOL | EnvFlags::THREAD;
        if config.enable_transactions {
            flags |= EnvFlags::INIT_TXN | EnvFlags::INIT_LOG | EnvFlags::INIT_LOCK;
        }
        if recovery_required {
            flags |= EnvFlags::RECOVER;
            if mode.contains(DbMode::RESTORE) {
                tracing::info!("Recovering database after restore from archive.");
            } else if mode.contains(DbMode::CLEAN_RECOVER) {
                tracing::info!("Clean up db environment and start from archive.");
            } else {
                tracing::info!("Detected Disorderly Shutdown last time Directory Server was running, recovering database.");
                EnvBuilder::remove(&home, true)?;
            }
        }
        if mode.contains(DbMode::RESTORE) {
            flags.remove(EnvFlags::RECOVER);
            flags |= EnvFlags::RECOVER_FATAL;
            mode = restored_mode(mode);
        } else if mode.contains(DbMode::RESTORE_NO_RECOVERY) {
            flags.remove(EnvFlags::RECOVER | EnvFlags::RECOVER_FATAL);
            mode = restored_mode(mode);
        }

        if config.private_mem {
            tracing::info!("database environment uses private memory");
            flags |= EnvFlags::PRIVATE;
        }
        if config.system_mem {
            flags |= EnvFlags::SYSTEM_MEM;
        }
        if config.lockdown {
            flags |= EnvFlags::LOCKDOWN;
        }

        self.check_resize(&home, mode)?;
        if config.logbuf_size > 0 && config.logbuf_size < MIN_LOGBUF_SIZE {
            tracing::info!(
                logbuf_size = config.logbuf_size,
                minimum = MIN_LOGBUF_SIZE,
                "log buffer size is below the minimum; the engine default is used"
            );
        }
        if !flags.contains(EnvFlags::PRIVATE) {
            sysinfo::check_disk_space(&home, config.cachesize)?;
        }

        if flags.recovers() {
            if mode.contains(DbMode::CLEAN_RECOVER) {
                EnvBuilder::remove(&home, true)?;
                mode = DbMode::NORMAL | (mode & DbMode::NO_DBTHREADS);
            }
            let recover_flags = flags - EnvFlags::THREAD;
            match self.make_env(&config).open(&home, recover_flags) {
                Ok(env) => env.close()?,
                Err(err @ DbError::OutOfMemory { .. }) => {
                    tracing::error!(
                        cachesize = config.cachesize,
                        error = %err,
                        "mmap in opening database environment (recovery mode) failed trying to allocate the cache; please reduce the cache size and restart"
                    );
                    *self.inner.env.write() = EnvSlot::Failed;
                    return Err(err);
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        "Database Recovery Process FAILED. The database is not recoverable."
                    );
                    if err.is_disk_full() {
                        tracing::error!("recovery needs free disk space at least as large as the cache");
                    }
                    return Err(self.report(err));
                }
            }
            flags.remove(EnvFlags::RECOVER | EnvFlags::RECOVER_FATAL);
        } else if !recovery_required && self.inner.previous.lock().is_none() {
            // No geometry on record: stale region files cannot be trusted.
            if let Err(err) = EnvBuilder::remove(&home, false) {
                tracing::debug!(error = %err, "stale region files left in place");
            }
        }

        let env = match self.make_env(&config).open(&home, flags) {
            Ok(env) => env,
            Err(err @ DbError::OutOfMemory { .. }) => {
                tracing::error!(
                    cachesize = config.cachesize,
                    error = %err,
                    "mmap in opening database environment failed trying to allocate the cache; please reduce the cache size and restart"
                );
                *self.inner.env.write() = EnvSlot::Failed;
                return Err(err);
            }
            Err(err) => {
                tracing::error!(home = %home.display(), error = %err, "Opening database environment ({}) failed", home.display());
                return Err(self.report(err));
            }
        };
        *self.inner.env.write() = EnvSlot::Open(env);
        *self.inner.mode.lock() = mode;
        self.inner.commits.store(0, Ordering::SeqCst);
        tracing::info!(home = %home.display(), ?mode, "database environment opened");

        if mode.contains(DbMode::NORMAL)
            && !mode.intersects(DbMode::IMPORT | DbMode::INDEX | DbMode::NO_DBTHREADS)
        {
            let started = DbVersion::current(config.rdn_format)
                .write(&home)
                .and_then(|()| self.start_threads());
            if let Err(err) = started {
                tracing::error!(error = %err, "failed to finish startup, closing the environment");
                self.stop_threads();
                if let EnvSlot::Open(env) = std::mem::replace(&mut *self.inner.env.write(), EnvSlot::Closed) {
                    let _ = env.close();
                }
                return Err(self.report(err));
            }
        }
        Ok(())
    }

    /// Drops the region files when the recorded geometry differs from the
    /// configured one, so the next open builds them afresh.
    fn check_resize(&self, home: &Path, mode: DbMode) -> DbResult<()> {
        let Some(previous) = *self.inner.previous.lock() else {
            return Ok(());
        };
        if mode.intersects(DbMode::ARCHIVE | DbMode::EXPORT) {
            return Ok(());
        }
        if (previous.cachesize == 0 && previous.ncache == 0) || previous.locks == 0 {
            return Ok(());
        }
        let mut config = self.inner.config.write();
        if previous.cachesize == config.cachesize
            && previous.ncache == config.ncache
            && previous.locks == config.locks
        {
            return Ok(());
        }
        if previous.cachesize != config.cachesize {
            tracing::info!("Resizing db cache size: {} -> {}", previous.cachesize, config.cachesize);
        }
        if previous.ncache != config.ncache {
            tracing::info!("Resizing db cache count: {} -> {}", previous.ncache, config.ncache);
        }
        if previous.locks != config.locks {
            if config.locks < MIN_LOCKS {
                tracing::info!(
                    "New max db lock count is too small. Resetting it to the default value {MIN_LOCKS}."
                );
                config.locks = MIN_LOCKS;
            } else {
                tracing::info!("Resizing max db lock count: {} -> {}", previous.locks, config.locks);
            }
        }
        drop(config);
        EnvBuilder::remove(home, true)?;
        Ok(())
    }

    /// Closes the environment.
    ///
    /// Stops the maintenance threads, closes every instance's indexes and
    /// the environment, then writes the guardian unless the mode is an
    /// archive or export or something went wrong during the run. Closing a
    /// layer that is not started does nothing.
    ///
    /// # Errors
    ///
    /// The first failure from closing the environment.
    pub fn close(&self, mode: DbMode) -> DbResult<()> {
        if !self.is_started() {
            return Ok(());
        }

        let running = self.running_threads();
        if running > 0 {
            tracing::info!("Waiting for {running} database threads to stop");
        }
        if self.stop_threads() {
            if running > 0 {
                tracing::info!("All database threads now stopped");
            }
        } else {
            self.inner.bad_stuff.store(true, Ordering::SeqCst);
        }

        for instance in self.instances() {
            if let Err(err) = instance.close() {
                tracing::error!(instance = instance.name(), error = %err, "failed to close instance");
                self.inner.bad_stuff.store(true, Ordering::SeqCst);
            }
        }

        let EnvSlot::Open(env) = std::mem::replace(&mut *self.inner.env.write(), EnvSlot::Closed)
        else {
            return Ok(());
        };
        let home = env.home().to_path_buf();
        let result = env.close();
        if let Err(err) = &result {
            tracing::error!(home = %home.display(), error = %err, "failed to close database environment");
        }

        let bad_stuff = self.bad_stuff_happened();
        if result.is_ok() && !mode.intersects(DbMode::ARCHIVE | DbMode::EXPORT) && !bad_stuff {
            let config = self.inner.config.read();
            Guardian {
                cachesize: config.cachesize,
                ncache: config.ncache,
                locks: config.locks,
            }
            .write(&home)?;
        } else if bad_stuff {
            tracing::warn!(home = %home.display(), "run was not clean; the next start will recover");
        }
        result.map_err(|err| self.report(err))
    }
}

/// A restore start continues as a normal one unless threads are off.
fn restored_mode(mode: DbMode) -> DbMode {
    if mode.contains(DbMode::NO_DBTHREADS) {
        mode
    } else {
        DbMode::NORMAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::GUARDIAN_FILE;
    use crate::value::DbValue;
    use tempfile::tempdir;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn quiet(dir: &Path) -> DbLayerConfig {
        DbLayerConfig::new(dir)
            .with_thread_timing(10, 2_000)
            .with_checkpoint_interval(1)
    }

    #[test]
    fn large_caches_are_split() {
        assert_eq!(select_ncache(10 * GIB, 0), 3);
        assert_eq!(select_ncache(64 * 1024 * 1024, 0), 0);
        assert_eq!(select_ncache(10 * GIB, 8), 8);
        assert_eq!(select_ncache(4 * GIB, 0), 0);
    }

    #[test]
    fn memory_usage_never_underflows() {
        let usage = MemoryUsage::default();
        usage.allocated(100);
        usage.released(40);
        assert_eq!(usage.in_use(), 60);
        usage.released(1_000);
        assert_eq!(usage.in_use(), 0);
    }

    #[test]
    fn clean_close_leaves_a_guardian() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(quiet(dir.path())).unwrap();
        layer.start(DbMode::NORMAL).unwrap();
        assert!(layer.is_started());
        assert!(dbversion::exists(dir.path()));
        layer.start(DbMode::NORMAL).unwrap();
        layer.close(DbMode::NORMAL).unwrap();
        assert!(!layer.is_started());
        assert_eq!(layer.running_threads(), 0);
        let text = fs::read_to_string(dir.path().join(GUARDIAN_FILE)).unwrap();
        assert!(text.contains("locks:10000"));

        layer.start(DbMode::NORMAL).unwrap();
        assert!(!layer.recovery_required());
        assert_eq!(layer.previous_geometry().map(|g| g.locks), Some(10_000));
        layer.close(DbMode::NORMAL).unwrap();
    }

    #[test]
    fn missing_guardian_with_data_triggers_recovery() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(quiet(dir.path())).unwrap();
        layer.start(DbMode::NORMAL).unwrap();
        let instance = layer.add_instance("userRoot").unwrap();
        {
            let db = layer.get_primary(&instance).unwrap();
            db.put(None, b"1", b"entry").unwrap();
        }
        layer.close(DbMode::NORMAL).unwrap();
        fs::remove_file(dir.path().join(GUARDIAN_FILE)).unwrap();

        layer.start(DbMode::NORMAL).unwrap();
        assert!(layer.recovery_required());
        let db = layer.get_primary(&instance).unwrap();
        let mut data = DbValue::new();
        db.get(None, b"1", &mut data).unwrap();
        assert_eq!(data.as_slice(), b"entry");
        drop(db);
        layer.close(DbMode::NORMAL).unwrap();
    }

    #[test]
    fn archive_close_leaves_no_guardian() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(quiet(dir.path())).unwrap();
        layer.start(DbMode::ARCHIVE).unwrap();
        assert_eq!(layer.running_threads(), 0);
        layer.close(DbMode::ARCHIVE).unwrap();
        assert!(!dir.path().join(GUARDIAN_FILE).exists());
    }

    #[test]
    fn failed_slot_refuses_to_start() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(quiet(dir.path())).unwrap();
        *layer.inner.env.write() = EnvSlot::Failed;
        assert!(matches!(
            layer.start(DbMode::NORMAL),
            Err(DbError::PreviouslyFailed)
        ));
    }

    #[test]
    fn missing_directory_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let mut config = quiet(dir.path()).with_db_home_directory(dir.path().join("env"));
        config.directory = std::path::PathBuf::new();
        let layer = DbLayer::init(config).unwrap();
        assert!(matches!(layer.start(DbMode::NORMAL), Err(DbError::Config { .. })));
    }

    #[test]
    fn close_before_start_is_a_no_op() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(quiet(dir.path())).unwrap();
        layer.close(DbMode::NORMAL).unwrap();
        assert!(!dir.path().join(GUARDIAN_FILE).exists());
    }
}
