//! The embedded transactional key/data engine.
//!
//! An [`Environment`] owns a home directory holding table files, the
//! transaction log and (for shared environments) region files. Tables are
//! kept in memory and persisted at checkpoints; the log makes committed
//! changes durable in between and is replayed by recovery.
//!
//! Environments are created in two steps, mirroring how the storage layer
//! configures them: [`EnvBuilder::new`] takes the tuning, and
//! [`EnvBuilder::open`] attaches it to a home directory.

mod checkpoint;
pub mod db;
pub mod lock;
pub mod log;
mod recovery;
pub mod region;
pub(crate) mod table;
pub mod txn;

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

pub use checkpoint::ArchiveFlags;
pub use db::{Cursor, Database};
pub use lock::{DeadlockPolicy, LockMode, LockStat};
pub use log::{FileSegments, Lsn, MemorySegments, SegmentStore};
pub use recovery::RecoveryStats;
pub use region::RegionInfo;
pub use table::{DupCompare, PutMode};
pub use txn::{NativeTxn, Txn, TxnFlags, TxnStatus};

use crate::error::{DbError, DbResult};
use lock::LockManager;
use log::LogManager;
use table::Table;

/// Largest cache chunk a single allocation may hold.
pub const MAX_CACHE_CHUNK: u64 = 4 * 1024 * 1024 * 1024;

/// Advisory lock held for as long as an environment is open.
pub const LOCK_FILE: &str = ".dblayer.lock";

bitflags! {
    /// Flags for opening an environment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        /// Create the home directory and files as needed.
        const CREATE = 0x0001;
        /// Use the shared table cache.
        const INIT_MPOOL = 0x0002;
        /// Enable record locking.
        const INIT_LOCK = 0x0004;
        /// Enable the transaction log.
        const INIT_LOG = 0x0008;
        /// Enable transactions.
        const INIT_TXN = 0x0010;
        /// Run normal recovery before returning.
        const RECOVER = 0x0020;
        /// Replay every log file that is still present.
        const RECOVER_FATAL = 0x0040;
        /// The handle is shared by several threads.
        const THREAD = 0x0080;
        /// Keep region state in process memory only.
        const PRIVATE = 0x0100;
        /// Back regions with system shared memory.
        const SYSTEM_MEM = 0x0200;
        /// Keep region pages resident.
        const LOCKDOWN = 0x0400;
    }
}

impl EnvFlags {
    /// Flags of a fully transactional, multi-threaded environment.
    #[must_use]
    pub const fn transactional() -> Self {
        Self::CREATE
            .union(Self::INIT_MPOOL)
            .union(Self::INIT_LOCK)
            .union(Self::INIT_LOG)
            .union(Self::INIT_TXN)
            .union(Self::THREAD)
    }

    /// True when either recovery flag is present.
    #[must_use]
    pub const fn recovers(self) -> bool {
        self.intersects(Self::RECOVER.union(Self::RECOVER_FATAL))
    }
}

bitflags! {
    /// Flags for opening a database.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbOpenFlags: u32 {
        /// Create the database if it does not exist.
        const CREATE = 0x0001;
        /// Reject writes through this handle.
        const RDONLY = 0x0002;
        /// Keys may carry several data items, kept sorted.
        const DUPSORT = 0x0004;
        /// Support access by record number.
        const RECNUM = 0x0008;
        /// Flags stored with the database itself.
        const STRUCTURE = Self::DUPSORT.bits() | Self::RECNUM.bits();
    }
}

/// Receives the engine's memory use, so the host process can account for it.
pub trait MemoryTracker: Send + Sync + fmt::Debug {
    /// `bytes` were taken.
    fn allocated(&self, bytes: usize);
    /// `bytes` were given back.
    fn released(&self, bytes: usize);
}

/// Tuning applied to an environment before it is opened.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Total cache bytes.
    pub cachesize: u64,
    /// Number of cache chunks; 0 lets the engine use one.
    pub ncache: u32,
    /// Lock table size.
    pub max_locks: u32,
    /// Maximum concurrent top-level transactions.
    pub tx_max: u32,
    /// Log directory; relative paths are taken from the home directory.
    pub log_dir: Option<PathBuf>,
    /// Directories searched for databases; new ones go in the first.
    pub data_dirs: Vec<PathBuf>,
    /// In-memory log buffer size.
    pub log_buffer_size: usize,
    /// Log file size at which a new file is started.
    pub log_file_max: u32,
    /// Page size hint.
    pub page_size: u32,
    /// Log segment storage; defaults to files in the log directory.
    pub segment_store: Option<Arc<dyn SegmentStore>>,
    /// Receives memory accounting.
    pub memory_tracker: Option<Arc<dyn MemoryTracker>>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            cachesize: 256 * 1024,
            ncache: 0,
            max_locks: 10_000,
            tx_max: 200,
            log_dir: None,
            data_dirs: Vec::new(),
            log_buffer_size: 32 * 1024,
            log_file_max: 10 * 1024 * 1024,
            page_size: 0,
            segment_store: None,
            memory_tracker: None,
        }
    }
}

impl EnvConfig {
    /// Sets the cache size and the number of chunks it is split into.
    #[must_use]
    pub fn with_cache(mut self, cachesize: u64, ncache: u32) -> Self {
        self.cachesize = cachesize;
        self.ncache = ncache;
        self
    }

    /// Sets the lock table size.
    #[must_use]
    pub fn with_max_locks(mut self, max_locks: u32) -> Self {
        self.max_locks = max_locks;
        self
    }

    /// Sets how many transactions may be active at once.
    #[must_use]
    pub fn with_tx_max(mut self, tx_max: u32) -> Self {
        self.tx_max = tx_max;
        self
    }

    /// Keeps the log outside the home directory.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Adds a data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dirs.push(dir.into());
        self
    }

    /// Sets the in-memory log buffer size.
    #[must_use]
    pub fn with_log_buffer_size(mut self, bytes: usize) -> Self {
        self.log_buffer_size = bytes;
        self
    }

    /// Sets the size at which the log rotates.
    #[must_use]
    pub fn with_log_file_max(mut self, bytes: u32) -> Self {
        self.log_file_max = bytes;
        self
    }

    /// Sets the page size recorded for new databases.
    #[must_use]
    pub fn with_page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Keeps log segments in `store` instead of files.
    #[must_use]
    pub fn with_segment_store(mut self, store: Arc<dyn SegmentStore>) -> Self {
        self.segment_store = Some(store);
        self
    }

    /// Reports cache use to `tracker`.
    #[must_use]
    pub fn with_memory_tracker(mut self, tracker: Arc<dyn MemoryTracker>) -> Self {
        self.memory_tracker = Some(tracker);
        self
    }

    fn region_info(&self, flags: EnvFlags) -> RegionInfo {
        RegionInfo {
            cachesize: self.cachesize,
            ncache: self.ncache,
            max_locks: self.max_locks,
            tx_max: self.tx_max,
            system_mem: flags.contains(EnvFlags::SYSTEM_MEM),
        }
    }
}

/// A configured environment that has not been opened yet.
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    config: EnvConfig,
}

impl EnvBuilder {
    /// Wraps `config` for opening.
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }

    /// Configuration to open with.
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Opens the environment in `home`.
    pub fn open(self, home: &Path, flags: EnvFlags) -> DbResult<Environment> {
        let config = self.config;
        if flags.recovers() && flags.contains(EnvFlags::THREAD) {
            return Err(DbError::config(
                "recovery must run in a single-threaded open",
            ));
        }
        if !home.is_dir() {
            if !flags.contains(EnvFlags::CREATE) {
                return Err(DbError::directory(home, "environment home does not exist"));
            }
            fs::create_dir_all(home)?;
        }

        let chunk = config.cachesize / u64::from(config.ncache.max(1));
        if chunk > MAX_CACHE_CHUNK {
            return Err(DbError::OutOfMemory {
                message: format!(
                    "cannot map a cache chunk of {chunk} bytes (limit {MAX_CACHE_CHUNK})"
                ),
            });
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(home.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| DbError::Busy {
            message: format!("environment {} is open elsewhere", home.display()),
        })?;

        if !flags.contains(EnvFlags::PRIVATE) {
            let requested = config.region_info(flags);
            if let Some(stored) = region::read(home)? {
                if !flags.recovers() {
                    region::check(&stored, &requested)?;
                }
            }
            region::write(home, &requested)?;
        }

        let log_dir = match &config.log_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => home.join(dir),
            None => home.to_path_buf(),
        };
        let log = if flags.contains(EnvFlags::INIT_LOG) {
            let store: Arc<dyn SegmentStore> = match &config.segment_store {
                Some(store) => Arc::clone(store),
                None => {
                    fs::create_dir_all(&log_dir)?;
                    Arc::new(FileSegments::new(&log_dir))
                }
            };
            Some(LogManager::open(
                store,
                config.log_file_max,
                config.log_buffer_size,
            )?)
        } else {
            None
        };
        let locks = flags
            .contains(EnvFlags::INIT_LOCK)
            .then(|| LockManager::new(config.max_locks));

        let env = Environment {
            inner: Arc::new(EnvInner {
                home: home.to_path_buf(),
                log_dir,
                flags,
                config,
                log,
                locks,
                tables: RwLock::new(HashMap::new()),
                commit_lock: RwLock::new(()),
                persist_lock: Mutex::new(()),
                active: Mutex::new(HashMap::new()),
                next_locker: AtomicU32::new(1),
                checkpoints: Mutex::new(checkpoint::CheckpointState::default()),
                lock_file: Mutex::new(Some(lock_file)),
                closed: AtomicBool::new(false),
            }),
        };

        if flags.recovers() {
            if env.inner.log.is_some() {
                let stats = recovery::run(&env, flags.contains(EnvFlags::RECOVER_FATAL))?;
                tracing::info!(
                    home = %home.display(),
                    applied = stats.applied,
                    start = %stats.start,
                    end = %stats.end,
                    "recovery complete"
                );
            } else {
                tracing::warn!(home = %home.display(), "recovery requested without a log");
            }
        } else if env.inner.log.is_some() {
            env.load_checkpoint_state()?;
        }
        tracing::debug!(home = %home.display(), ?flags, "environment opened");
        Ok(env)
    }

    /// Removes the region files of the environment in `home`.
    ///
    /// Without `force` this fails while the environment is open.
    pub fn remove(home: &Path, force: bool) -> DbResult<usize> {
        if !force {
            let lock_path = home.join(LOCK_FILE);
            if lock_path.exists() {
                let file = OpenOptions::new().read(true).write(true).open(&lock_path)?;
                file.try_lock_exclusive().map_err(|_| DbError::Busy {
                    message: format!("environment {} is open", home.display()),
                })?;
                file.unlock()?;
            }
        }
        region::remove_all(home)
    }
}

/// An open environment. Clones share the same environment.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    home: PathBuf,
    log_dir: PathBuf,
    flags: EnvFlags,
    config: EnvConfig,
    log: Option<LogManager>,
    locks: Option<LockManager>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    /// Held shared while a commit applies, exclusively while a checkpoint
    /// or trickle captures table images.
    commit_lock: RwLock<()>,
    /// Serializes the writers of table files.
    persist_lock: Mutex<()>,
    /// Begin positions of unresolved top-level transactions.
    active: Mutex<HashMap<u32, Lsn>>,
    next_locker: AtomicU32,
    checkpoints: Mutex<checkpoint::CheckpointState>,
    lock_file: Mutex<Option<File>>,
    closed: AtomicBool,
}

impl EnvInner {
    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::invalid_operation("environment is closed"));
        }
        Ok(())
    }

    fn next_locker(&self) -> u32 {
        self.next_locker.fetch_add(1, Ordering::SeqCst)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("home", &self.inner.home)
            .field("flags", &self.inner.flags)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Home directory.
    pub fn home(&self) -> &Path {
        &self.inner.home
    }

    /// Directory holding the log segments.
    pub fn log_dir(&self) -> &Path {
        &self.inner.log_dir
    }

    /// Configuration the environment was opened with.
    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    /// Flags the environment was opened with.
    pub fn open_flags(&self) -> EnvFlags {
        self.inner.flags
    }

    /// True when opened with transactions.
    pub fn uses_txn(&self) -> bool {
        self.inner.flags.contains(EnvFlags::INIT_TXN)
    }

    /// True when a log is kept.
    pub fn uses_log(&self) -> bool {
        self.inner.log.is_some()
    }

    /// True when record locks are taken.
    pub fn uses_locking(&self) -> bool {
        self.inner.locks.is_some()
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Opens (or creates) the database `name`.
    pub fn db_open(&self, name: &str, flags: DbOpenFlags) -> DbResult<Database> {
        self.inner.ensure_open()?;
        if let Some(table) = self.inner.tables.read().get(name) {
            return Ok(Database::new(self.clone(), Arc::clone(table), flags));
        }

        let mut tables = self.inner.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(Database::new(self.clone(), Arc::clone(table), flags));
        }
        let table = Arc::new(self.load_table(name, flags)?);
        if let Some(tracker) = &self.inner.config.memory_tracker {
            tracker.allocated(table.footprint());
        }
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(Database::new(self.clone(), table, flags))
    }

    /// Deletes the database `name` and its file.
    pub fn db_remove(&self, name: &str) -> DbResult<()> {
        self.inner.ensure_open()?;
        let removed = self.inner.tables.write().remove(name);
        let path = match &removed {
            Some(table) => {
                table.mark_removed();
                if let Some(tracker) = &self.inner.config.memory_tracker {
                    tracker.released(table.footprint());
                }
                table.path().to_path_buf()
            }
            None => {
                let (path, exists) = self.table_path(name);
                if !exists {
                    return Err(DbError::DatabaseNotFound {
                        name: name.to_string(),
                    });
                }
                path
            }
        };
        if let Some(log) = &self.inner.log {
            log.put_and_flush(
                &log::LogRecord::DbRemove {
                    db: name.to_string(),
                },
                true,
            )?;
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Names of the databases currently open.
    pub fn open_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Writes buffered log records out and syncs them.
    pub fn log_flush(&self) -> DbResult<()> {
        match &self.inner.log {
            Some(log) => log.flush(true),
            None => Ok(()),
        }
    }

    /// Runs one deadlock detection pass.
    pub fn lock_detect(&self, policy: DeadlockPolicy) -> DbResult<usize> {
        self.inner.ensure_open()?;
        Ok(self
            .inner
            .locks
            .as_ref()
            .map_or(0, |locks| locks.detect(policy)))
    }

    /// Lock table statistics, if locking is enabled.
    pub fn lock_stat(&self) -> Option<LockStat> {
        self.inner.locks.as_ref().map(LockManager::stat)
    }

    /// Persists everything and closes the environment.
    pub fn close(&self) -> DbResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let active = self.active_txns();
        if active > 0 {
            tracing::warn!(active, "closing environment with unresolved transactions");
        }
        let result = self.txn_checkpoint(false).map(|_| ());
        let result = result.and_then(|()| self.log_flush());
        self.inner.closed.store(true, Ordering::SeqCst);

        let tables: Vec<Arc<Table>> = self.inner.tables.write().drain().map(|(_, t)| t).collect();
        if let Some(tracker) = &self.inner.config.memory_tracker {
            for table in &tables {
                tracker.released(table.footprint());
            }
        }
        if let Some(file) = self.inner.lock_file.lock().take() {
            let _ = file.unlock();
        }
        tracing::debug!(home = %self.inner.home.display(), "environment closed");
        result
    }

    fn table_path(&self, name: &str) -> (PathBuf, bool) {
        let dirs: Vec<PathBuf> = if self.inner.config.data_dirs.is_empty() {
            vec![self.inner.home.clone()]
        } else {
            self.inner
                .config
                .data_dirs
                .iter()
                .map(|d| {
                    if d.is_absolute() {
                        d.clone()
                    } else {
                        self.inner.home.join(d)
                    }
                })
                .collect()
        };
        for dir in &dirs {
            let path = dir.join(name);
            if path.is_file() {
                return (path, true);
            }
        }
        (dirs[0].join(name), false)
    }

    fn load_table(&self, name: &str, flags: DbOpenFlags) -> DbResult<Table> {
        let (path, exists) = self.table_path(name);
        if exists {
            return Table::load(name, path, flags);
        }
        if !flags.contains(DbOpenFlags::CREATE) {
            return Err(DbError::DatabaseNotFound {
                name: name.to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stamp = self
            .inner
            .log
            .as_ref()
            .map_or(Lsn::ZERO, LogManager::current_lsn);
        Table::create(name, path, flags, stamp)
    }

    fn open_tables(&self) -> Vec<Arc<Table>> {
        let tables = self.inner.tables.read();
        let mut list: Vec<Arc<Table>> = tables.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }
}
