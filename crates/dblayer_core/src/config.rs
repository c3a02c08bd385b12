//! Storage layer configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{EnvConfig, MAX_CACHE_CHUNK};

/// Smallest lock table the layer configures.
pub const MIN_LOCKS: u32 = 10_000;

/// Smallest log buffer handed to the engine; smaller settings are ignored.
pub const MIN_LOGBUF_SIZE: u32 = 32 * 1024;

/// Smallest cache the layer will run with.
pub const MIN_CACHE_SIZE: u64 = 512_000;

/// Accepted range of the locks monitoring threshold, in percent.
pub const LOCKS_THRESHOLD_RANGE: std::ops::RangeInclusive<u32> = 70..=95;

/// Configuration of the storage layer.
///
/// Every field maps to a named tunable (see [`crate::tunables`]) except
/// the thread timings, which only tests and tools change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbLayerConfig {
    /// Parent directory of the instance directories.
    pub directory: PathBuf,
    /// Home of the environment region files; `directory` when unset.
    pub db_home_directory: Option<PathBuf>,
    /// Transaction log directory; the environment home when unset.
    pub log_directory: Option<PathBuf>,

    /// Cache bytes; 0 keeps the engine default.
    pub cachesize: u64,
    /// Cache chunks; 0 lets [`select_ncache`](crate::env::select_ncache) decide.
    pub ncache: u32,
    /// Lock table size.
    pub locks: u32,
    /// Concurrent transaction limit.
    pub tx_max: u32,
    /// Log buffer bytes; values below [`MIN_LOGBUF_SIZE`] are ignored.
    pub logbuf_size: u32,
    /// Page size hint; 0 for the engine default.
    pub page_size: u32,
    /// Log file size; 0 for the engine default.
    pub logfile_size: u32,

    /// Run with transactions and a log.
    pub enable_transactions: bool,
    /// Sync the log on every commit.
    pub durable_transactions: bool,
    /// Delete log files once they are no longer needed.
    pub circular_logging: bool,
    /// Wait for locks instead of failing at once.
    pub txn_wait: bool,
    /// Commits per group flush; 0 disables batching, -1 flushes after each
    /// commit from the committing thread.
    pub txn_batch_val: i32,
    /// Shortest time between group flushes, in milliseconds.
    pub txn_batch_min_wait: u64,
    /// Longest time between group flushes, in milliseconds.
    pub txn_batch_max_wait: u64,

    /// Seconds between checkpoints.
    pub checkpoint_interval: u64,
    /// Skip the checkpoint when every instance is idle.
    pub checkpoint_skip_idle: bool,
    /// Log every checkpoint at info level.
    pub debug_checkpointing: bool,
    /// Percentage of dirty tables the trickle thread writes; 0 disables it.
    pub trickle_percentage: u32,
    /// Deadlock detection policy code.
    pub deadlock_policy: u32,

    /// Keep region state in process memory.
    pub private_mem: bool,
    /// Use process memory for import environments.
    pub private_import_mem: bool,
    /// Back regions with system shared memory.
    pub system_mem: bool,
    /// Lock region pages in memory.
    pub lockdown: bool,

    /// Serialize each instance's write transactions on one lock.
    pub serial_lock: bool,
    /// Take the serial lock after the transaction begins.
    pub dblock_inside_txn: bool,

    /// Watch the lock table fill level.
    pub locks_monitoring_enabled: bool,
    /// Fill percentage that raises the threshold flag.
    pub locks_monitoring_threshold: u32,
    /// Milliseconds between lock table samples.
    pub locks_monitoring_pause: u64,

    /// Keys are RDN-tree formatted rather than flat DNs.
    pub rdn_format: bool,

    /// Base sleep of the background threads, in milliseconds.
    pub thread_sleep_ms: u64,
    /// How long close waits for the background threads, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Milliseconds between deadlock detection passes.
    pub deadlock_interval_ms: u64,
    /// Attempts the backup makes before giving up on an unstable log set.
    pub backup_retries: u32,
    /// Replication changelog kept outside the instances; backed up and
    /// restored alongside them when set.
    pub changelog_directory: Option<PathBuf>,
}

impl Default for DbLayerConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::new(),
            db_home_directory: None,
            log_directory: None,
            cachesize: 0,
            ncache: 0,
            locks: MIN_LOCKS,
            tx_max: 200,
            logbuf_size: 0,
            page_size: 0,
            logfile_size: 0,
            enable_transactions: true,
            durable_transactions: true,
            circular_logging: true,
            txn_wait: false,
            txn_batch_val: 0,
            txn_batch_min_wait: 50,
            txn_batch_max_wait: 50,
            checkpoint_interval: 60,
            checkpoint_skip_idle: false,
            debug_checkpointing: false,
            trickle_percentage: 5,
            deadlock_policy: 9,
            private_mem: false,
            private_import_mem: true,
            system_mem: false,
            lockdown: false,
            serial_lock: true,
            dblock_inside_txn: false,
            locks_monitoring_enabled: true,
            locks_monitoring_threshold: 90,
            locks_monitoring_pause: 500,
            rdn_format: true,
            thread_sleep_ms: 250,
            shutdown_timeout_ms: 25_000,
            deadlock_interval_ms: 100,
            backup_retries: 100,
            changelog_directory: None,
        }
    }
}

impl DbLayerConfig {
    /// Creates a configuration rooted at `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Sets the region home directory.
    #[must_use]
    pub fn with_db_home_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.db_home_directory = Some(dir.into());
        self
    }

    /// Sets the log directory.
    #[must_use]
    pub fn with_log_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_directory = Some(dir.into());
        self
    }

    /// Sets the replication changelog directory.
    #[must_use]
    pub fn with_changelog_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.changelog_directory = Some(dir.into());
        self
    }

    /// Sets the cache size and chunk count.
    #[must_use]
    pub const fn with_cache(mut self, cachesize: u64, ncache: u32) -> Self {
        self.cachesize = cachesize;
        self.ncache = ncache;
        self
    }

    /// Sets the lock table size (nsslapd-db-locks).
    #[must_use]
    pub const fn with_locks(mut self, locks: u32) -> Self {
        self.locks = locks;
        self
    }

    /// Sets the log file size in bytes; 0 keeps the engine default.
    #[must_use]
    pub const fn with_logfile_size(mut self, bytes: u32) -> Self {
        self.logfile_size = bytes;
        self
    }

    /// Turns transactions and the log on or off.
    #[must_use]
    pub const fn with_transactions(mut self, enabled: bool) -> Self {
        self.enable_transactions = enabled;
        self
    }

    /// Chooses whether commits sync the log.
    #[must_use]
    pub const fn with_durable_transactions(mut self, durable: bool) -> Self {
        self.durable_transactions = durable;
        self
    }

    /// Chooses whether logs no longer needed are removed.
    #[must_use]
    pub const fn with_circular_logging(mut self, circular: bool) -> Self {
        self.circular_logging = circular;
        self
    }

    /// Sets the group commit size and its wait bounds in milliseconds.
    #[must_use]
    pub const fn with_batching(mut self, val: i32, min_wait: u64, max_wait: u64) -> Self {
        self.txn_batch_val = val;
        self.txn_batch_min_wait = min_wait;
        self.txn_batch_max_wait = max_wait;
        self
    }

    /// Sets the checkpoint interval in seconds.
    #[must_use]
    pub const fn with_checkpoint_interval(mut self, secs: u64) -> Self {
        self.checkpoint_interval = secs;
        self
    }

    /// Sets the share of dirty tables the trickle thread writes.
    #[must_use]
    pub const fn with_trickle_percentage(mut self, pct: u32) -> Self {
        self.trickle_percentage = pct;
        self
    }

    /// Runs the environment private to this process, without region files.
    #[must_use]
    pub const fn with_private_mem(mut self, private: bool) -> Self {
        self.private_mem = private;
        self
    }

    /// Serializes write transactions per instance.
    #[must_use]
    pub const fn with_serial_lock(mut self, serial: bool) -> Self {
        self.serial_lock = serial;
        self
    }

    /// Records the RDN entry format in DBVERSION.
    #[must_use]
    pub const fn with_rdn_format(mut self, rdn: bool) -> Self {
        self.rdn_format = rdn;
        self
    }

    /// Sets the background thread timings in milliseconds.
    #[must_use]
    pub const fn with_thread_timing(mut self, sleep_ms: u64, shutdown_timeout_ms: u64) -> Self {
        self.thread_sleep_ms = sleep_ms;
        self.shutdown_timeout_ms = shutdown_timeout_ms;
        self
    }

    /// Directory holding the environment's region files.
    #[must_use]
    pub fn env_home(&self) -> &Path {
        match &self.db_home_directory {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => &self.directory,
        }
    }

    /// True when region files live apart from the instance directories.
    #[must_use]
    pub fn separate_db_home(&self) -> bool {
        self.env_home() != self.directory
    }

    /// Where transaction logs are written.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        match &self.log_directory {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => self.env_home().to_path_buf(),
        }
    }

    /// Base sleep of the background threads.
    #[must_use]
    pub const fn thread_sleep(&self) -> Duration {
        Duration::from_millis(self.thread_sleep_ms)
    }

    /// Translates the layer settings into engine tuning.
    #[must_use]
    pub fn env_config(&self) -> EnvConfig {
        let mut config = EnvConfig::default()
            .with_max_locks(self.locks.max(MIN_LOCKS))
            .with_tx_max(self.tx_max);
        if self.cachesize > 0 {
            config = config.with_cache(self.cachesize, self.ncache);
        }
        if self.log_directory.as_ref().is_some_and(|d| !d.as_os_str().is_empty()) {
            config = config.with_log_dir(self.log_dir());
        }
        if self.separate_db_home() {
            config = config.with_data_dir(self.directory.clone());
        }
        if self.logbuf_size >= MIN_LOGBUF_SIZE {
            config = config.with_log_buffer_size(self.logbuf_size as usize);
        }
        if self.logfile_size > 0 {
            config = config.with_log_file_max(self.logfile_size);
        }
        if self.page_size > 0 {
            config = config.with_page_size(self.page_size);
        }
        config
    }

    /// Cache chunk size the engine will be asked to map.
    #[must_use]
    pub fn cache_chunk(&self) -> u64 {
        self.cachesize / u64::from(self.ncache.max(1))
    }

    /// True when the cache needs more than one chunk.
    #[must_use]
    pub fn cache_needs_split(&self) -> bool {
        self.cache_chunk() > MAX_CACHE_CHUNK
    }
}
