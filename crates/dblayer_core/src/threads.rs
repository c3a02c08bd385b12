//! Background maintenance threads.
//!
//! Every thread registers with the [`ThreadRegistry`] on entry and
//! deregisters on exit. The threads poll a shared stop flag between
//! iterations; close raises the flag and waits, bounded, for the count to
//! reach zero.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::engine::{ArchiveFlags, DeadlockPolicy, Environment};
use crate::error::DbResult;
use crate::layer::{DbLayer, LayerInner};

#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    running: Mutex<usize>,
    /// Signalled when a thread exits and when stop is raised.
    changed: Condvar,
}

/// Liveness bookkeeping of the background threads.
#[derive(Debug, Default)]
pub(crate) struct ThreadRegistry {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// What a running thread sees of the registry.
#[derive(Debug, Clone)]
pub(crate) struct ThreadCtl {
    shared: Arc<Shared>,
}

impl ThreadCtl {
    pub(crate) fn should_stop(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Sleeps for `period` or until stop is raised. Returns false once the
    /// thread should exit.
    pub(crate) fn sleep(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        let mut running = self.shared.running.lock();
        while !self.should_stop() {
            if self
                .shared
                .changed
                .wait_until(&mut running, deadline)
                .timed_out()
            {
                break;
            }
        }
        !self.should_stop()
    }
}

struct Registration {
    shared: Arc<Shared>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut running = self.shared.running.lock();
        *running -= 1;
        if *running == 0 {
            self.shared.changed.notify_all();
        }
    }
}

impl ThreadRegistry {
    /// Number of live threads.
    pub(crate) fn running(&self) -> usize {
        *self.shared.running.lock()
    }

    /// Clears the stop flag before threads are started again.
    pub(crate) fn reset(&self) {
        self.shared.stop.store(false, Ordering::SeqCst);
    }

    /// Starts a registered thread running `body`.
    pub(crate) fn spawn<F>(&self, name: &str, body: F) -> DbResult<()>
    where
        F: FnOnce(ThreadCtl) + Send + 'static,
    {
        *self.shared.running.lock() += 1;
        let registration = Registration {
            shared: Arc::clone(&self.shared),
        };
        let ctl = ThreadCtl {
            shared: Arc::clone(&self.shared),
        };
        let thread_name = name.to_string();
        let spawned = thread::Builder::new()
            .name(format!("dblayer-{name}"))
            .spawn(move || {
                let _registration = registration;
                tracing::debug!(thread = %thread_name, "database thread started");
                body(ctl);
                tracing::debug!(thread = %thread_name, "database thread stopped");
            });
        match spawned {
            Ok(handle) => {
                self.handles.lock().push(handle);
                Ok(())
            }
            Err(err) => {
                tracing::error!(thread = name, error = %err, "failed to create database thread");
                Err(err.into())
            }
        }
    }

    /// Raises the stop flag and waits up to `timeout` for every thread to
    /// exit. Returns false on timeout; the remaining threads are left
    /// running detached.
    pub(crate) fn stop_all(&self, timeout: Duration) -> bool {
        self.shared.stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let clean = {
            let mut running = self.shared.running.lock();
            self.shared.changed.notify_all();
            while *running > 0 {
                if self
                    .shared
                    .changed
                    .wait_until(&mut running, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if *running > 0 {
                tracing::warn!(
                    "Timeout after [{}] milliseconds; leave {} database thread(s)...",
                    timeout.as_millis(),
                    *running
                );
                false
            } else {
                true
            }
        };
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        clean
    }
}

/// Runs `step` with the layer and its environment while both exist.
fn with_env<T>(weak: &Weak<LayerInner>, step: impl FnOnce(&DbLayer, &Environment) -> T) -> Option<T> {
    let inner = weak.upgrade()?;
    let layer = DbLayer { inner };
    let env = layer.environment().ok()?;
    Some(step(&layer, &env))
}

impl DbLayer {
    /// Starts the maintenance threads the configuration asks for.
    pub(crate) fn start_threads(&self) -> DbResult<()> {
        let config = self.config();
        self.inner.threads.reset();
        let weak = Arc::downgrade(&self.inner);

        if config.enable_transactions {
            let w = weak.clone();
            self.inner.threads.spawn("perf", move |ctl| deadlock_loop(&w, &ctl))?;
            let w = weak.clone();
            self.inner.threads.spawn("checkpoint", move |ctl| checkpoint_loop(&w, &ctl))?;
            let w = weak.clone();
            self.inner.threads.spawn("trickle", move |ctl| trickle_loop(&w, &ctl))?;
            if config.durable_transactions && config.txn_batch_val > 0 {
                self.inner.batch.start(&config);
                let w = weak.clone();
                self.inner.threads.spawn("log-flush", move |ctl| log_flush_loop(&w, &ctl))?;
            }
        }
        if config.locks_monitoring_enabled {
            let w = weak.clone();
            self.inner.threads.spawn("locks-monitor", move |ctl| locks_monitor_loop(&w, &ctl))?;
        }
        if let Some(stress) = crate::stress::StressConfig::from_env() {
            self.inner
                .threads
                .spawn("txn-test", move |ctl| crate::stress::stress_loop(&weak, &ctl, &stress))?;
        }
        Ok(())
    }

    /// Stops the maintenance threads. Returns false if some did not exit in
    /// time.
    pub(crate) fn stop_threads(&self) -> bool {
        self.inner.batch.stop();
        let timeout = Duration::from_millis(self.inner.config.read().shutdown_timeout_ms);
        self.inner.threads.stop_all(timeout)
    }

    /// Number of maintenance threads alive.
    #[must_use]
    pub fn running_threads(&self) -> usize {
        self.inner.threads.running()
    }

    /// Takes a checkpoint while new transaction begins are held off.
    ///
    /// # Errors
    ///
    /// Engine failures, reported through [`DbLayer::on_disk_full`] when the
    /// disk is full.
    pub fn checkpoint(&self, force: bool) -> DbResult<()> {
        let env = self.environment()?;
        let _gate = self.inner.gate.checkpoint();
        env.txn_checkpoint(force)
            .map(|_| ())
            .map_err(|err| self.report(err))
    }

    /// Deletes (circular logging) or renames to `.old` the log files no
    /// longer needed for recovery. Returns how many were handled.
    ///
    /// # Errors
    ///
    /// Engine or I/O failures.
    pub fn trim_logs(&self) -> DbResult<usize> {
        let env = self.environment()?;
        let circular = self.inner.config.read().circular_logging;
        let files = env.log_archive(ArchiveFlags::ABS)?;
        for file in &files {
            let result = if circular {
                fs::remove_file(file)
            } else {
                let mut old = file.clone().into_os_string();
                old.push(".old");
                fs::rename(file, old)
            };
            if let Err(err) = result {
                tracing::error!(file = %file.display(), error = %err, "failed to retire log file");
                return Err(self.report(err.into()));
            }
        }
        Ok(files.len())
    }
}

fn deadlock_loop(weak: &Weak<LayerInner>, ctl: &ThreadCtl) {
    loop {
        let period = with_env(weak, |layer, env| {
            let (code, interval) = {
                let config = layer.inner.config.read();
                (config.deadlock_policy, config.deadlock_interval_ms)
            };
            if env.uses_locking() {
                match DeadlockPolicy::from_code(code) {
                    Ok(DeadlockPolicy::NoRun) => {}
                    Ok(policy) => match env.lock_detect(policy) {
                        Ok(0) => {}
                        Ok(rejected) => tracing::debug!(rejected, "deadlocks resolved"),
                        Err(err) => tracing::error!(error = %err, "deadlock detection failed"),
                    },
                    Err(err) => tracing::error!(error = %err, "invalid deadlock policy"),
                }
            }
            Duration::from_millis(interval)
        });
        let Some(period) = period else { break };
        if !ctl.sleep(period) {
            break;
        }
    }
}

fn checkpoint_loop(weak: &Weak<LayerInner>, ctl: &ThreadCtl) {
    // A fresh environment needs two checkpoints before the recovery start
    // point moves off the beginning of the log.
    let primed = with_env(weak, |layer, env| {
        if env.uses_txn() && env.uses_log() {
            for _ in 0..2 {
                if let Err(err) = layer.checkpoint(true) {
                    tracing::error!(error = %err, "initial checkpoint failed");
                    return !err.is_disk_full();
                }
            }
        }
        true
    });
    if primed != Some(true) {
        return;
    }

    let mut last = Instant::now();
    let mut commits_seen = 0;
    loop {
        let Some(sleep) = weak.upgrade().map(|inner| inner.config.read().thread_sleep()) else {
            break;
        };
        if !ctl.sleep(sleep) {
            break;
        }
        let outcome = with_env(weak, |layer, env| {
            let (interval, skip_idle, debug) = {
                let config = layer.inner.config.read();
                (
                    Duration::from_secs(config.checkpoint_interval),
                    config.checkpoint_skip_idle,
                    config.debug_checkpointing,
                )
            };
            if last.elapsed() < interval || !env.uses_txn() || !env.uses_log() {
                return true;
            }
            last = Instant::now();
            if layer.any_instance_busy() {
                tracing::debug!("checkpoint skipped, an instance is busy");
                return true;
            }
            let commits = layer.inner.commits.load(Ordering::Relaxed);
            if skip_idle && commits == commits_seen {
                tracing::debug!("checkpoint skipped, no commits since the last one");
                return true;
            }
            commits_seen = commits;
            if debug {
                tracing::info!("starting checkpoint");
            }
            if let Err(err) = layer.checkpoint(false) {
                tracing::error!(error = %err, "checkpoint failed");
                return !err.is_disk_full();
            }
            if debug {
                tracing::info!("checkpoint done");
            }
            match layer.trim_logs() {
                Ok(n) if debug && n > 0 => tracing::info!(files = n, "log files retired"),
                Ok(_) => {}
                Err(err) => return !err.is_disk_full(),
            }
            true
        });
        if outcome != Some(true) {
            break;
        }
    }

    with_env(weak, |layer, env| {
        if env.uses_txn() && env.uses_log() {
            if let Err(err) = layer.checkpoint(true) {
                tracing::error!(error = %err, "final checkpoint failed");
            }
        }
    });
}

fn trickle_loop(weak: &Weak<LayerInner>, ctl: &ThreadCtl) {
    loop {
        let period = with_env(weak, |layer, env| {
            let (percent, sleep) = {
                let config = layer.inner.config.read();
                (config.trickle_percentage, config.thread_sleep())
            };
            if percent != 0 && env.uses_txn() {
                if let Err(err) = env.memp_trickle(percent) {
                    tracing::error!(percent, error = %err, "cache trickle failed");
                    layer.report(err);
                }
            }
            sleep
        });
        let Some(period) = period else { break };
        if !ctl.sleep(period) {
            break;
        }
    }
}

fn log_flush_loop(weak: &Weak<LayerInner>, ctl: &ThreadCtl) {
    let Some(inner) = weak.upgrade() else { return };
    let layer = DbLayer { inner };
    let Ok(env) = layer.environment() else { return };
    let batch = Arc::clone(&layer.inner.batch);
    drop(layer);
    if !ctl.should_stop() {
        batch.flush_loop(&env);
    }
}

fn locks_monitor_loop(weak: &Weak<LayerInner>, ctl: &ThreadCtl) {
    loop {
        let period = with_env(weak, |layer, env| {
            let (enabled, threshold, pause) = {
                let config = layer.inner.config.read();
                (
                    config.locks_monitoring_enabled,
                    config.locks_monitoring_threshold,
                    config.locks_monitoring_pause,
                )
            };
            let reached = enabled
                && env.lock_stat().is_some_and(|stat| {
                    stat.maxlocks > 0
                        && u64::from(stat.nlocks) * 100 >= u64::from(stat.maxlocks) * u64::from(threshold)
                });
            let was = layer.inner.lock_threshold_reached.swap(reached, Ordering::SeqCst);
            if reached && !was {
                tracing::error!(threshold, "lock table is over the monitoring threshold; new write transactions are refused");
            } else if was && !reached {
                tracing::info!(threshold, "lock table is back under the monitoring threshold");
            }
            Duration::from_millis(pause.max(1))
        });
        let Some(period) = period else { break };
        if !ctl.sleep(period) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_wakes_sleeping_threads() {
        let registry = ThreadRegistry::default();
        let loops = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            let loops = Arc::clone(&loops);
            registry
                .spawn(name, move |ctl| {
                    while ctl.sleep(Duration::from_secs(3600)) {
                        loops.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }
        assert_eq!(registry.running(), 2);
        let started = Instant::now();
        assert!(registry.stop_all(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(registry.running(), 0);
        assert_eq!(loops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stuck_thread_times_out() {
        let registry = ThreadRegistry::default();
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        registry
            .spawn("stuck", move |_ctl| {
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();
        assert!(!registry.stop_all(Duration::from_millis(50)));
        assert_eq!(registry.running(), 1);
        release.store(true, Ordering::SeqCst);
        registry.reset();
        assert!(registry.stop_all(Duration::from_secs(10)));
    }
}
