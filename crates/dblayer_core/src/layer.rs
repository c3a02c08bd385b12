//! The storage layer context.
//!
//! A [`DbLayer`] owns everything the layer shares between threads: the
//! configuration, the open environment, the per-thread transaction stacks,
//! the background threads and the instances. One layer exists per
//! environment home; [`DbLayer::init`] refuses a second one for the same
//! home until the first is terminated.
//!
//! ```rust,ignore
//! let layer = DbLayer::init(DbLayerConfig::new("/var/lib/dirsrv/db"))?;
//! layer.start(DbMode::NORMAL)?;
//! let instance = layer.add_instance("userRoot")?;
//! let txn = layer.txn_begin(&instance, None)?;
//! // ...
//! layer.txn_commit(&instance, Some(&txn))?;
//! layer.close(DbMode::NORMAL)?;
//! layer.terminate();
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::DbLayerConfig;
use crate::engine::{Environment, SegmentStore};
use crate::env::MemoryUsage;
use crate::error::{DbError, DbResult};
use crate::guardian::Guardian;
use crate::handle::{DbImplementation, NativeImplementation};
use crate::instance::Instance;
use crate::threads::ThreadRegistry;
use crate::tunables::{self, Phase};
use crate::txn::{BatchState, TxnStacks};

/// Homes with a live layer in this process.
static INITIALIZED: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

bitflags! {
    /// Why the layer is being started or closed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbMode: u32 {
        /// Bulk load; no background threads.
        const IMPORT = 0x0001;
        /// Regular server operation.
        const NORMAL = 0x0002;
        /// Export; the guardian is left alone on close.
        const EXPORT = 0x0004;
        /// Offline backup; the guardian is left alone on close.
        const ARCHIVE = 0x0008;
        /// Restore with catastrophic recovery from the restored logs.
        const RESTORE = 0x0010;
        /// Restore of data files without logs; no recovery.
        const RESTORE_NO_RECOVERY = 0x0020;
        /// Test harness.
        const TEST = 0x0040;
        /// Index rebuild; no background threads.
        const INDEX = 0x0080;
        /// Rebuild environment metadata without replaying logs.
        const CLEAN_RECOVER = 0x0100;
        /// Do not start background threads.
        const NO_DBTHREADS = 0x1000;
    }
}

/// What occupies the environment slot.
pub(crate) enum EnvSlot {
    /// Nothing is open.
    Closed,
    /// The environment is open.
    Open(Environment),
    /// The native open ran out of memory; later starts fail fast.
    Failed,
}

/// Called with the failing error whenever an operation runs out of disk.
pub type DiskFullHook = Arc<dyn Fn(&DbError) + Send + Sync>;

/// Coordinates transaction begin, checkpoints and index erasure.
///
/// Write transactions hold a [`GateShared`] token from begin until they
/// resolve. A checkpoint waits only for transactions that are still inside
/// their native begin and holds new begins off meanwhile. Erasing an index
/// waits until no token is held at all.
#[derive(Debug, Default)]
pub(crate) struct EnvGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    holders: usize,
    beginning: usize,
    checkpointing: bool,
    exclusive: bool,
}

impl EnvGate {
    /// Enters the gate for a transaction that is about to begin.
    pub(crate) fn shared(self: &Arc<Self>) -> GateShared {
        let mut state = self.state.lock();
        while state.exclusive || state.checkpointing {
            self.cond.wait(&mut state);
        }
        state.holders += 1;
        state.beginning += 1;
        GateShared {
            gate: Arc::clone(self),
            beginning: true,
        }
    }

    /// Holds new begins off until the guard drops, once in-progress begins
    /// have finished.
    pub(crate) fn checkpoint(&self) -> GateCheckpoint<'_> {
        let mut state = self.state.lock();
        while state.checkpointing || state.exclusive {
            self.cond.wait(&mut state);
        }
        state.checkpointing = true;
        while state.beginning > 0 {
            self.cond.wait(&mut state);
        }
        GateCheckpoint { gate: self }
    }

    /// Waits until no transaction holds the gate and keeps it closed until
    /// the guard drops.
    pub(crate) fn exclusive(&self) -> GateExclusive<'_> {
        let mut state = self.state.lock();
        while state.exclusive || state.checkpointing {
            self.cond.wait(&mut state);
        }
        state.exclusive = true;
        while state.holders > 0 {
            self.cond.wait(&mut state);
        }
        GateExclusive { gate: self }
    }

    #[cfg(test)]
    pub(crate) fn holders(&self) -> usize {
        self.state.lock().holders
    }
}

/// A transaction's hold on the [`EnvGate`].
#[derive(Debug)]
pub(crate) struct GateShared {
    gate: Arc<EnvGate>,
    beginning: bool,
}

impl GateShared {
    /// The native begin has returned.
    pub(crate) fn begun(&mut self) {
        if std::mem::take(&mut self.beginning) {
            let mut state = self.gate.state.lock();
            state.beginning -= 1;
            self.gate.cond.notify_all();
        }
    }
}

impl Drop for GateShared {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.holders -= 1;
        if self.beginning {
            state.beginning -= 1;
        }
        self.gate.cond.notify_all();
    }
}

pub(crate) struct GateCheckpoint<'a> {
    gate: &'a EnvGate,
}

impl Drop for GateCheckpoint<'_> {
    fn drop(&mut self) {
        self.gate.state.lock().checkpointing = false;
        self.gate.cond.notify_all();
    }
}

pub(crate) struct GateExclusive<'a> {
    gate: &'a EnvGate,
}

impl Drop for GateExclusive<'_> {
    fn drop(&mut self) {
        self.gate.state.lock().exclusive = false;
        self.gate.cond.notify_all();
    }
}

pub(crate) struct LayerInner {
    pub(crate) home: PathBuf,
    pub(crate) config: RwLock<DbLayerConfig>,
    pub(crate) implementation: Arc<dyn DbImplementation>,
    pub(crate) env: RwLock<EnvSlot>,
    pub(crate) mode: Mutex<DbMode>,
    pub(crate) gate: Arc<EnvGate>,
    pub(crate) stacks: TxnStacks,
    pub(crate) batch: Arc<BatchState>,
    pub(crate) threads: ThreadRegistry,
    pub(crate) instances: RwLock<BTreeMap<String, Arc<Instance>>>,
    /// Set when a write ran out of disk; the next close leaves no guardian.
    pub(crate) bad_stuff: AtomicBool,
    pub(crate) disk_full_events: AtomicU64,
    pub(crate) disk_full_hook: RwLock<Option<DiskFullHook>>,
    pub(crate) log_store: RwLock<Option<Arc<dyn SegmentStore>>>,
    pub(crate) lock_threshold_reached: AtomicBool,
    pub(crate) recovery_required: AtomicBool,
    pub(crate) restored: AtomicBool,
    pub(crate) previous: Mutex<Option<Guardian>>,
    /// Top-level commits since the layer started.
    pub(crate) commits: AtomicU64,
    pub(crate) memory: Arc<MemoryUsage>,
    /// Raised when the host is going down; long operations give up.
    pub(crate) shutdown: AtomicBool,
    terminated: AtomicBool,
}

impl Drop for LayerInner {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::SeqCst) {
            INITIALIZED.lock().retain(|home| home != &self.home);
        }
    }
}

/// The storage layer. Clones share the same layer.
#[derive(Clone)]
pub struct DbLayer {
    pub(crate) inner: Arc<LayerInner>,
}

impl fmt::Debug for DbLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbLayer")
            .field("home", &self.inner.home)
            .field("implementation", &self.inner.implementation.name())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl DbLayer {
    /// Sets up the layer for `config` using the native engine.
    ///
    /// # Errors
    ///
    /// [`DbError::AlreadyInitialized`] while another layer for the same
    /// home is alive in this process.
    pub fn init(config: DbLayerConfig) -> DbResult<Self> {
        Self::init_with(config, Arc::new(NativeImplementation))
    }

    /// Sets up the layer for `config` with a specific engine.
    ///
    /// # Errors
    ///
    /// See [`DbLayer::init`].
    pub fn init_with(
        config: DbLayerConfig,
        implementation: Arc<dyn DbImplementation>,
    ) -> DbResult<Self> {
        let home = config.env_home().to_path_buf();
        {
            let mut initialized = INITIALIZED.lock();
            if initialized.contains(&home) {
                return Err(DbError::AlreadyInitialized);
            }
            initialized.push(home.clone());
        }
        tracing::debug!(home = %home.display(), implementation = implementation.name(), "storage layer initialized");
        Ok(Self {
            inner: Arc::new(LayerInner {
                home,
                config: RwLock::new(config),
                implementation,
                env: RwLock::new(EnvSlot::Closed),
                mode: Mutex::new(DbMode::empty()),
                gate: Arc::new(EnvGate::default()),
                stacks: TxnStacks::default(),
                batch: Arc::new(BatchState::default()),
                threads: ThreadRegistry::default(),
                instances: RwLock::new(BTreeMap::new()),
                bad_stuff: AtomicBool::new(false),
                disk_full_events: AtomicU64::new(0),
                disk_full_hook: RwLock::new(None),
                log_store: RwLock::new(None),
                lock_threshold_reached: AtomicBool::new(false),
                recovery_required: AtomicBool::new(false),
                restored: AtomicBool::new(false),
                previous: Mutex::new(None),
                commits: AtomicU64::new(0),
                memory: Arc::new(MemoryUsage::default()),
                shutdown: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }),
        })
    }

    /// Releases the process-wide registration. Safe to call twice.
    ///
    /// The environment should already be closed; an open one is closed
    /// here with a warning.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_started() {
            tracing::warn!(home = %self.inner.home.display(), "terminating a started layer; closing it first");
            if let Err(err) = self.close(DbMode::NORMAL) {
                tracing::error!(error = %err, "close during terminate failed");
            }
        }
        INITIALIZED.lock().retain(|home| home != &self.inner.home);
    }

    /// Environment home.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.inner.home
    }

    /// A copy of the current configuration.
    #[must_use]
    pub fn config(&self) -> DbLayerConfig {
        self.inner.config.read().clone()
    }

    /// Edits the configuration in place.
    pub fn update_config(&self, edit: impl FnOnce(&mut DbLayerConfig)) {
        edit(&mut self.inner.config.write());
    }

    /// The engine behind every database handle.
    #[must_use]
    pub fn implementation(&self) -> &Arc<dyn DbImplementation> {
        &self.inner.implementation
    }

    /// The open environment.
    ///
    /// # Errors
    ///
    /// [`DbError::NotStarted`] before start, [`DbError::PreviouslyFailed`]
    /// after an open that ran out of memory.
    pub fn environment(&self) -> DbResult<Environment> {
        match &*self.inner.env.read() {
            EnvSlot::Open(env) => Ok(env.clone()),
            EnvSlot::Closed => Err(DbError::NotStarted),
            EnvSlot::Failed => Err(DbError::PreviouslyFailed),
        }
    }

    /// True while the environment is open.
    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(&*self.inner.env.read(), EnvSlot::Open(_))
    }

    /// Mode of the last start.
    #[must_use]
    pub fn mode(&self) -> DbMode {
        *self.inner.mode.lock()
    }

    /// True when the last startup found a restore marker.
    #[must_use]
    pub fn restored(&self) -> bool {
        self.inner.restored.load(Ordering::SeqCst)
    }

    /// True when the last startup had to recover.
    #[must_use]
    pub fn recovery_required(&self) -> bool {
        self.inner.recovery_required.load(Ordering::SeqCst)
    }

    /// Geometry the previous clean shutdown recorded.
    #[must_use]
    pub fn previous_geometry(&self) -> Option<Guardian> {
        *self.inner.previous.lock()
    }

    /// Reads a tunable by name.
    ///
    /// # Errors
    ///
    /// [`DbError::Config`] for an unknown name.
    pub fn get_tunable(&self, name: &str) -> DbResult<String> {
        tunables::get(&self.inner.config.read(), name)
    }

    /// Changes a tunable by name.
    ///
    /// Setting the batch size to 0 while running stops group commit at
    /// once; raising it from 0 only takes effect after a restart.
    ///
    /// # Errors
    ///
    /// See [`tunables::set`].
    pub fn set_tunable(&self, name: &str, value: &str, phase: Phase) -> DbResult<()> {
        let mut config = self.inner.config.write();
        let old_batch = config.txn_batch_val;
        tunables::set(&mut config, name, value, phase)?;
        if phase != Phase::Running {
            return Ok(());
        }
        match tunables::find(name).map(|t| t.name) {
            Some(tunables::BATCH_VAL) => {
                let new_batch = config.txn_batch_val;
                if new_batch == 0 && old_batch != 0 {
                    self.inner.batch.stop();
                } else if old_batch == 0 && new_batch > 0 {
                    tracing::info!(
                        value = new_batch,
                        "{} was 0; the new value takes effect after a restart",
                        tunables::BATCH_VAL
                    );
                } else {
                    self.inner.batch.configure(&config);
                }
            }
            Some(tunables::BATCH_MIN_WAIT | tunables::BATCH_MAX_WAIT) => {
                self.inner.batch.configure(&config);
            }
            _ => {}
        }
        Ok(())
    }

    /// Resets every tunable to its default.
    ///
    /// # Errors
    ///
    /// See [`tunables::setup_default`].
    pub fn setup_default(&self) -> DbResult<()> {
        tunables::setup_default(&mut self.inner.config.write())
    }

    /// Installs the out-of-disk notification.
    pub fn on_disk_full(&self, hook: impl Fn(&DbError) + Send + Sync + 'static) {
        *self.inner.disk_full_hook.write() = Some(Arc::new(hook));
    }

    /// Keeps the transaction log in `store` from the next start on instead
    /// of in files under the log directory.
    pub fn set_log_store(&self, store: Arc<dyn SegmentStore>) {
        *self.inner.log_store.write() = Some(store);
    }

    /// How many operations have failed for lack of disk space.
    #[must_use]
    pub fn disk_full_events(&self) -> u64 {
        self.inner.disk_full_events.load(Ordering::SeqCst)
    }

    /// True once a failure has made this run unclean.
    #[must_use]
    pub fn bad_stuff_happened(&self) -> bool {
        self.inner.bad_stuff.load(Ordering::SeqCst)
    }

    /// Tells long-running operations such as a backup to give up.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    /// True once [`DbLayer::request_shutdown`] was called since the last
    /// start.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// True while the lock table is fuller than the monitoring threshold.
    #[must_use]
    pub fn lock_threshold_reached(&self) -> bool {
        self.inner.lock_threshold_reached.load(Ordering::SeqCst)
    }

    /// Reports `err` if it means the disk is full and hands it back.
    ///
    /// Every public operation calls this once with its final error.
    pub(crate) fn report(&self, err: DbError) -> DbError {
        if err.is_disk_full() {
            self.inner.bad_stuff.store(true, Ordering::SeqCst);
            self.inner.disk_full_events.fetch_add(1, Ordering::SeqCst);
            tracing::error!(error = %err, "operation failed, out of disk space");
            let hook = self.inner.disk_full_hook.read().clone();
            if let Some(hook) = hook {
                hook(&err);
            }
        }
        err
    }

    /// Registered instances, by name.
    #[must_use]
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.inner.instances.read().values().cloned().collect()
    }

    /// The instance called `name`.
    ///
    /// # Errors
    ///
    /// [`DbError::InstanceNotFound`].
    pub fn instance(&self, name: &str) -> DbResult<Arc<Instance>> {
        self.inner
            .instances
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::InstanceNotFound {
                name: name.to_string(),
            })
    }

    /// Registers an instance whose files live in `<directory>/<name>`.
    ///
    /// # Errors
    ///
    /// [`DbError::Config`] if the name is taken or not a plain file name.
    pub fn add_instance(&self, name: &str) -> DbResult<Arc<Instance>> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(DbError::config(format!("invalid instance name {name:?}")));
        }
        let mut instances = self.inner.instances.write();
        if instances.contains_key(name) {
            return Err(DbError::config(format!("instance {name} already exists")));
        }
        let instance = Arc::new(Instance::new(name, &self.inner.config.read().directory));
        instances.insert(name.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Forgets an instance. Its files are left alone.
    ///
    /// # Errors
    ///
    /// [`DbError::InstanceNotFound`].
    pub fn remove_instance(&self, name: &str) -> DbResult<Arc<Instance>> {
        let instance = self.inner.instances.write().remove(name).ok_or_else(|| {
            DbError::InstanceNotFound {
                name: name.to_string(),
            }
        })?;
        instance.close()?;
        Ok(instance)
    }

    /// True when an instance is in the middle of an offline task.
    #[must_use]
    pub fn any_instance_busy(&self) -> bool {
        self.inner.instances.read().values().any(|i| i.is_busy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn second_init_for_the_same_home_fails() {
        let dir = tempdir().unwrap();
        let config = DbLayerConfig::new(dir.path());
        let layer = DbLayer::init(config.clone()).unwrap();
        assert!(matches!(
            DbLayer::init(config.clone()),
            Err(DbError::AlreadyInitialized)
        ));
        layer.terminate();
        layer.terminate();
        let again = DbLayer::init(config).unwrap();
        drop(again);
    }

    #[test]
    fn dropping_the_last_clone_releases_the_home() {
        let dir = tempdir().unwrap();
        let config = DbLayerConfig::new(dir.path());
        drop(DbLayer::init(config.clone()).unwrap());
        DbLayer::init(config).unwrap();
    }

    #[test]
    fn environment_before_start_is_not_started() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(DbLayerConfig::new(dir.path())).unwrap();
        assert!(matches!(layer.environment(), Err(DbError::NotStarted)));
        *layer.inner.env.write() = EnvSlot::Failed;
        assert!(matches!(layer.environment(), Err(DbError::PreviouslyFailed)));
    }

    #[test]
    fn disk_full_reports_once_and_marks_the_run_unclean() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(DbLayerConfig::new(dir.path())).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        layer.on_disk_full(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _ = layer.report(DbError::NotFound);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(!layer.bad_stuff_happened());

        let _ = layer.report(DbError::DiskFull {
            message: "no space".into(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(layer.disk_full_events(), 1);
        assert!(layer.bad_stuff_happened());
    }

    #[test]
    fn running_batch_rules() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(DbLayerConfig::new(dir.path())).unwrap();
        layer
            .set_tunable(tunables::BATCH_VAL, "5", Phase::Running)
            .unwrap();
        assert_eq!(layer.config().txn_batch_val, 5);
        layer
            .set_tunable(tunables::BATCH_VAL, "0", Phase::Running)
            .unwrap();
        assert_eq!(layer.get_tunable(tunables::BATCH_VAL).unwrap(), "0");
        assert!(layer
            .set_tunable(tunables::PAGE_SIZE, "8192", Phase::Running)
            .is_err());
    }

    #[test]
    fn instance_names_are_plain() {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(DbLayerConfig::new(dir.path())).unwrap();
        layer.add_instance("userRoot").unwrap();
        assert!(layer.add_instance("userRoot").is_err());
        assert!(layer.add_instance("../etc").is_err());
        assert!(layer.add_instance("").is_err());
        assert_eq!(layer.instance("userRoot").unwrap().name(), "userRoot");
        assert!(matches!(
            layer.instance("nope"),
            Err(DbError::InstanceNotFound { .. })
        ));
        layer.remove_instance("userRoot").unwrap();
        assert!(layer.instances().is_empty());
    }

    #[test]
    fn exclusive_gate_waits_for_holders() {
        let gate = Arc::new(EnvGate::default());
        let mut token = gate.shared();
        token.begun();
        assert_eq!(gate.holders(), 1);

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _exclusive = gate.exclusive();
                gate.holders()
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(token);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn checkpoint_waits_only_for_beginning_transactions() {
        let gate = Arc::new(EnvGate::default());
        let mut running = gate.shared();
        running.begun();
        {
            let _checkpoint = gate.checkpoint();
        }
        let starting = gate.shared();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _checkpoint = gate.checkpoint();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(starting);
        waiter.join().unwrap();
        drop(running);
    }
}
