//! Transactions of the storage layer.
//!
//! Every thread has a stack of open transactions. A begin without an
//! explicit parent nests inside the top of the calling thread's stack, so
//! code deep in a call chain joins the ambient transaction without having
//! it passed down. Commit and abort act on the explicit handle when one is
//! given and on the top of the stack otherwise.
//!
//! Callers must not resolve an inner transaction by handle while an
//! unrelated transaction they did not begin sits on top of their stack.
//! Resolved entries are only popped from the top, so such an entry stays
//! until everything above it has been resolved.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::DbLayerConfig;
use crate::engine::{Environment, Txn, TxnFlags};
use crate::error::{DbError, DbResult};
use crate::instance::Instance;
use crate::layer::{DbLayer, GateShared};

/// A layer transaction. `None` inside means "no transaction": either none
/// was begun or transactions are disabled.
#[derive(Debug, Clone, Default)]
pub struct BackTxn {
    handle: Option<Txn>,
}

impl BackTxn {
    /// The empty transaction.
    #[must_use]
    pub const fn none() -> Self {
        Self { handle: None }
    }

    /// The native transaction, if any.
    #[must_use]
    pub fn handle(&self) -> Option<&Txn> {
        self.handle.as_ref()
    }

    /// True when there is no native transaction.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.handle.is_none()
    }
}

#[derive(Debug)]
struct Held {
    gate: Option<GateShared>,
    batched: bool,
}

/// Per-thread transaction stacks and the resources each top-level
/// transaction holds until it resolves.
#[derive(Debug, Default)]
pub(crate) struct TxnStacks {
    stacks: Mutex<HashMap<ThreadId, Vec<Txn>>>,
    held: Mutex<HashMap<u32, Held>>,
}

impl TxnStacks {
    /// Innermost live transaction of the calling thread.
    fn top(&self) -> Option<Txn> {
        let mut stacks = self.stacks.lock();
        let id = thread::current().id();
        let stack = stacks.get_mut(&id)?;
        prune(stack);
        let top = stack.last().cloned();
        if stack.is_empty() {
            stacks.remove(&id);
        }
        top
    }

    fn push(&self, txn: Txn, held: Held) {
        if held.gate.is_some() || held.batched {
            self.held.lock().insert(txn.id(), held);
        }
        self.stacks
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(txn);
    }

    fn release(&self, txn: &Txn) -> Option<Held> {
        self.held.lock().remove(&txn.id())
    }

    /// Pops `txn` if it is the top of the calling thread's stack, then any
    /// resolved entries left on top.
    fn settle(&self, txn: &Txn) {
        let mut stacks = self.stacks.lock();
        let id = thread::current().id();
        let Some(stack) = stacks.get_mut(&id) else {
            return;
        };
        if stack.last().is_some_and(|top| std::sync::Arc::ptr_eq(top, txn)) {
            stack.pop();
        }
        prune(stack);
        if stack.is_empty() {
            stacks.remove(&id);
        }
    }

    fn depth(&self) -> usize {
        self.stacks
            .lock()
            .get(&thread::current().id())
            .map_or(0, Vec::len)
    }
}

fn prune(stack: &mut Vec<Txn>) {
    while stack.last().is_some_and(|top| !top.is_active()) {
        stack.pop();
    }
}

/// Group commit bookkeeping shared by committers and the log flush thread.
#[derive(Debug, Default)]
pub(crate) struct BatchState {
    state: Mutex<BatchInner>,
    do_flush: Condvar,
    flush_done: Condvar,
}

#[derive(Debug, Default)]
struct BatchInner {
    running: bool,
    limit: u32,
    min_wait: Duration,
    max_wait: Duration,
    /// Commits waiting for the next flush.
    count: u32,
    /// Top-level write transactions between begin and resolution.
    in_progress: u32,
    /// Bumped by every flush.
    generation: u64,
}

impl BatchState {
    /// Turns group commit on with the limits of `config`.
    pub(crate) fn start(&self, config: &DbLayerConfig) {
        let mut state = self.state.lock();
        state.running = true;
        state.count = 0;
        state.in_progress = 0;
        apply_limits(&mut state, config);
    }

    /// Picks up new limits while running.
    pub(crate) fn configure(&self, config: &DbLayerConfig) {
        let mut state = self.state.lock();
        if state.running {
            apply_limits(&mut state, config);
            self.do_flush.notify_one();
        }
    }

    /// Turns group commit off and releases every waiting committer.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        if state.running {
            tracing::debug!(pending = state.count, "group commit stopped");
        }
        state.running = false;
        self.do_flush.notify_all();
        self.flush_done.notify_all();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            state.in_progress += 1;
        }
        state.running
    }

    fn end(&self) {
        let mut state = self.state.lock();
        state.in_progress = state.in_progress.saturating_sub(1);
        self.do_flush.notify_one();
    }

    /// Queues a commit for the next flush and waits for it. Returns false
    /// when group commit stopped first and the caller must flush.
    fn commit_and_wait(&self) -> bool {
        let mut state = self.state.lock();
        if !state.running {
            return false;
        }
        let generation = state.generation;
        state.count += 1;
        if state.count >= state.limit || state.count >= state.in_progress {
            self.do_flush.notify_one();
        }
        while state.generation == generation && state.running {
            self.flush_done.wait(&mut state);
        }
        state.generation != generation
    }

    /// Body of the log flush thread.
    pub(crate) fn flush_loop(&self, env: &Environment) {
        let mut last_flush = Instant::now();
        let mut overdue = false;
        let mut state = self.state.lock();
        while state.running {
            if state.count > 0
                && (overdue || state.count >= state.limit || state.count >= state.in_progress)
            {
                if let Err(err) = env.log_flush() {
                    tracing::error!(error = %err, "group commit log flush failed");
                }
                tracing::trace!(batch = state.count, in_progress = state.in_progress, "log flushed");
                state.count = 0;
                state.generation += 1;
                last_flush = Instant::now();
                overdue = false;
                self.flush_done.notify_all();
            }
            loop {
                if !state.running {
                    break;
                }
                if state.count > 0 {
                    if state.count >= state.limit || state.count >= state.in_progress {
                        break;
                    }
                    if last_flush.elapsed() >= state.min_wait {
                        overdue = true;
                        break;
                    }
                }
                let wait = state.max_wait;
                self.do_flush.wait_for(&mut state, wait);
            }
        }
        self.flush_done.notify_all();
    }
}

fn apply_limits(state: &mut BatchInner, config: &DbLayerConfig) {
    state.limit = u32::try_from(config.txn_batch_val.max(1)).unwrap_or(1);
    state.min_wait = Duration::from_millis(config.txn_batch_min_wait);
    state.max_wait = Duration::from_millis(config.txn_batch_max_wait.max(1));
}

/// Reentrant per-instance lock serializing write transactions.
#[derive(Debug, Default)]
pub(crate) struct SerialLock {
    state: Mutex<SerialState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct SerialState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl SerialLock {
    pub(crate) fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.owner.is_some_and(|owner| owner != me) {
            self.cond.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth += 1;
    }

    pub(crate) fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            tracing::error!("serial lock released by a thread that does not hold it");
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_one();
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }
}

impl DbLayer {
    /// Begins a transaction.
    ///
    /// With `use_lock`, a top-level transaction holds the coordination gate
    /// until it resolves and takes part in group commit.
    ///
    /// # Errors
    ///
    /// [`DbError::NotStarted`] before start; lock conflicts when the
    /// transaction cannot be created without waiting.
    pub fn txn_begin_ext(&self, parent: Option<&BackTxn>, use_lock: bool) -> DbResult<BackTxn> {
        let (enabled, wait) = {
            let config = self.inner.config.read();
            (config.enable_transactions, config.txn_wait)
        };
        if !enabled {
            return Ok(BackTxn::none());
        }
        let env = self.environment().map_err(|err| self.report(err))?;
        if !env.uses_txn() {
            return Ok(BackTxn::none());
        }

        let parent = parent
            .and_then(BackTxn::handle)
            .cloned()
            .or_else(|| self.inner.stacks.top());
        let top_level = parent.is_none();
        let mut gate = (use_lock && top_level).then(|| self.inner.gate.shared());
        let flags = if wait {
            TxnFlags::empty()
        } else {
            TxnFlags::NOWAIT
        };
        let txn = env.txn_begin(parent.as_ref(), flags).map_err(|err| {
            tracing::error!(code = err.code(), error = %err, "Serious Error---Failed in txn_begin");
            self.report(err)
        })?;
        if let Some(gate) = gate.as_mut() {
            gate.begun();
        }
        let batched = use_lock && top_level && self.inner.batch.begin();
        self.inner
            .stacks
            .push(std::sync::Arc::clone(&txn), Held { gate, batched });
        Ok(BackTxn { handle: Some(txn) })
    }

    /// Commits `txn`, or the calling thread's current transaction.
    ///
    /// # Errors
    ///
    /// Engine failures; a full disk is also reported through
    /// [`DbLayer::on_disk_full`].
    pub fn txn_commit_ext(&self, txn: Option<&BackTxn>, use_lock: bool) -> DbResult<()> {
        let Some(target) = self.resolve(txn) else {
            return Ok(());
        };
        let held = self.inner.stacks.release(&target);
        let Ok(env) = self.environment() else {
            self.inner.stacks.settle(&target);
            return Ok(());
        };
        let (durable, batch_val) = {
            let config = self.inner.config.read();
            (config.durable_transactions, config.txn_batch_val)
        };
        let batched = held.as_ref().is_some_and(|h| h.batched);
        let grouped = batched && self.inner.batch.is_running();
        let flags = if !durable || grouped || batch_val == -1 {
            TxnFlags::WRITE_NOSYNC
        } else {
            TxnFlags::SYNC
        };
        let top_level = target.parent().is_none();

        let mut result = env.txn_commit(&target, flags);
        self.inner.stacks.settle(&target);
        if result.is_ok() {
            if top_level {
                self.inner.commits.fetch_add(1, Ordering::Relaxed);
            }
            if durable && use_lock && top_level {
                if grouped {
                    if !self.inner.batch.commit_and_wait() {
                        result = env.log_flush();
                    }
                } else if batch_val == -1 || flags.contains(TxnFlags::WRITE_NOSYNC) {
                    result = env.log_flush();
                }
            }
        }
        if batched {
            self.inner.batch.end();
        }
        drop(held);
        result.map_err(|err| {
            tracing::error!(code = err.code(), error = %err, "Serious Error---Failed in txn_commit");
            self.report(err)
        })
    }

    /// Aborts `txn`, or the calling thread's current transaction.
    ///
    /// # Errors
    ///
    /// Engine failures.
    pub fn txn_abort_ext(&self, txn: Option<&BackTxn>, _use_lock: bool) -> DbResult<()> {
        let Some(target) = self.resolve(txn) else {
            return Ok(());
        };
        let held = self.inner.stacks.release(&target);
        if held.as_ref().is_some_and(|h| h.batched) {
            self.inner.batch.end();
        }
        let Ok(env) = self.environment() else {
            self.inner.stacks.settle(&target);
            return Ok(());
        };
        let result = env.txn_abort(&target);
        self.inner.stacks.settle(&target);
        drop(held);
        result.map_err(|err| {
            tracing::error!(code = err.code(), error = %err, "Serious Error---Failed in txn_abort");
            self.report(err)
        })
    }

    fn resolve(&self, txn: Option<&BackTxn>) -> Option<Txn> {
        if !self.inner.config.read().enable_transactions {
            return None;
        }
        txn.and_then(BackTxn::handle)
            .cloned()
            .or_else(|| self.inner.stacks.top())
    }

    /// The calling thread's current transaction.
    #[must_use]
    pub fn txn_init(&self) -> BackTxn {
        BackTxn {
            handle: self.inner.stacks.top(),
        }
    }

    /// Depth of the calling thread's transaction stack.
    #[must_use]
    pub fn txn_depth(&self) -> usize {
        self.inner.stacks.depth()
    }

    /// Begins a write transaction on `instance`, taking its serial lock
    /// when configured.
    ///
    /// # Errors
    ///
    /// [`DbError::OutOfLocks`] while the lock table is over the monitoring
    /// threshold, or see [`DbLayer::txn_begin_ext`].
    pub fn txn_begin(&self, instance: &Instance, parent: Option<&BackTxn>) -> DbResult<BackTxn> {
        let (serial, inside, monitoring, locks) = {
            let config = self.inner.config.read();
            (
                config.serial_lock,
                config.dblock_inside_txn,
                config.locks_monitoring_enabled,
                config.locks,
            )
        };
        if monitoring && self.lock_threshold_reached() {
            return Err(DbError::OutOfLocks { max: locks });
        }
        if inside {
            let txn = self.txn_begin_ext(parent, true)?;
            if serial {
                instance.serial_lock().lock();
            }
            Ok(txn)
        } else {
            if serial {
                instance.serial_lock().lock();
            }
            self.txn_begin_ext(parent, true).inspect_err(|_| {
                if serial {
                    instance.serial_lock().unlock();
                }
            })
        }
    }

    /// Commits a transaction begun with [`DbLayer::txn_begin`].
    ///
    /// # Errors
    ///
    /// See [`DbLayer::txn_commit_ext`].
    pub fn txn_commit(&self, instance: &Instance, txn: Option<&BackTxn>) -> DbResult<()> {
        self.resolve_serial(instance, |layer| layer.txn_commit_ext(txn, true))
    }

    /// Aborts a transaction begun with [`DbLayer::txn_begin`].
    ///
    /// # Errors
    ///
    /// See [`DbLayer::txn_abort_ext`].
    pub fn txn_abort(&self, instance: &Instance, txn: Option<&BackTxn>) -> DbResult<()> {
        self.resolve_serial(instance, |layer| layer.txn_abort_ext(txn, true))
    }

    fn resolve_serial(
        &self,
        instance: &Instance,
        resolve: impl FnOnce(&Self) -> DbResult<()>,
    ) -> DbResult<()> {
        let (serial, inside) = {
            let config = self.inner.config.read();
            (config.serial_lock, config.dblock_inside_txn)
        };
        if inside {
            if serial {
                instance.serial_lock().unlock();
            }
            resolve(self)
        } else {
            let result = resolve(self);
            if serial {
                instance.serial_lock().unlock();
            }
            result
        }
    }

    /// Begins a read-only transaction; never waits for the serial lock.
    ///
    /// # Errors
    ///
    /// See [`DbLayer::txn_begin_ext`].
    pub fn read_txn_begin(&self, parent: Option<&BackTxn>) -> DbResult<BackTxn> {
        self.txn_begin_ext(parent, false)
    }

    /// Commits a read-only transaction.
    ///
    /// # Errors
    ///
    /// See [`DbLayer::txn_commit_ext`].
    pub fn read_txn_commit(&self, txn: Option<&BackTxn>) -> DbResult<()> {
        self.txn_commit_ext(txn, false)
    }

    /// Aborts a read-only transaction.
    ///
    /// # Errors
    ///
    /// See [`DbLayer::txn_abort_ext`].
    pub fn read_txn_abort(&self, txn: Option<&BackTxn>) -> DbResult<()> {
        self.txn_abort_ext(txn, false)
    }

    /// Begins a transaction spanning every instance.
    ///
    /// # Errors
    ///
    /// See [`DbLayer::txn_begin_ext`].
    pub fn txn_begin_all(&self, parent: Option<&BackTxn>) -> DbResult<BackTxn> {
        self.txn_begin_ext(parent, true)
    }

    /// Commits a transaction begun with [`DbLayer::txn_begin_all`].
    ///
    /// # Errors
    ///
    /// See [`DbLayer::txn_commit_ext`].
    pub fn txn_commit_all(&self, txn: Option<&BackTxn>) -> DbResult<()> {
        self.txn_commit_ext(txn, true)
    }

    /// Aborts a transaction begun with [`DbLayer::txn_begin_all`].
    ///
    /// # Errors
    ///
    /// See [`DbLayer::txn_abort_ext`].
    pub fn txn_abort_all(&self, txn: Option<&BackTxn>) -> DbResult<()> {
        self.txn_abort_ext(txn, true)
    }
}
