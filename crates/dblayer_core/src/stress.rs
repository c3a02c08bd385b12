//! Transaction stress thread.
//!
//! Enabled with `TXN_TESTING=1`. It opens a cursor on each configured
//! index of every instance and walks them all in lock step, optionally
//! inside one transaction, restarting the pass whenever it is picked as a
//! deadlock victim. It exists to load the lock and transaction machinery
//! during development.
//!
//! | variable | meaning | default |
//! |----------|---------|---------|
//! | `TXN_TEST_HOLD_MSEC` | upper bound of the random time cursors stay open | 200 |
//! | `TXN_TEST_LOOP_MSEC` | upper bound of the random pause between passes | 10 |
//! | `TXN_TEST_USE_TXN` | run each pass in a transaction | off |
//! | `TXN_TEST_USE_RMW` | ask for write locks on reads | off |
//! | `TXN_TEST_INDEXES` | comma separated index names | see [`DEFAULT_INDEXES`] |
//! | `TXN_TEST_VERBOSE` | log every pass | off |

use std::sync::Weak;
use std::time::Duration;

use rand::Rng;

use crate::error::DbError;
use crate::handle::{CursorOp, DbCursor};
use crate::instance::IndexRef;
use crate::layer::{DbLayer, LayerInner};
use crate::threads::ThreadCtl;
use crate::txn::BackTxn;
use crate::value::DbValue;

/// Indexes walked when `TXN_TEST_INDEXES` is unset.
pub const DEFAULT_INDEXES: &str = "aci,entryrdn,numsubordinates,uid,ancestorid,objectclass,uniquemember,cn,parentid,nsuniqueid,sn,id2entry";

/// Attempts to find an index before it is skipped.
const MAX_ATTEMPTS: u32 = 3;

/// Passes between the one-second breathers.
const PASSES_PER_PAUSE: u64 = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StressConfig {
    pub(crate) hold_msec: u64,
    pub(crate) loop_msec: u64,
    pub(crate) use_txn: bool,
    pub(crate) use_rmw: bool,
    pub(crate) indexes: Vec<String>,
    pub(crate) verbose: bool,
}

impl StressConfig {
    /// Reads the process environment; `None` unless `TXN_TESTING` is set.
    pub(crate) fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        lookup("TXN_TESTING")?;
        let number = |name: &str, default: u64| {
            lookup(name)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let indexes = lookup("TXN_TEST_INDEXES").unwrap_or_else(|| DEFAULT_INDEXES.to_string());
        let config = Self {
            hold_msec: number("TXN_TEST_HOLD_MSEC", 200),
            loop_msec: number("TXN_TEST_LOOP_MSEC", 10),
            use_txn: lookup("TXN_TEST_USE_TXN").is_some(),
            use_rmw: lookup("TXN_TEST_USE_RMW").is_some(),
            indexes: indexes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            verbose: lookup("TXN_TEST_VERBOSE").is_some(),
        };
        tracing::warn!(
            hold_msec = config.hold_msec,
            loop_msec = config.loop_msec,
            rmw = config.use_rmw,
            txn = config.use_txn,
            indexes = %indexes,
            "transaction stress thread configured"
        );
        Some(config)
    }
}

fn jitter(ctl: &ThreadCtl, bound_msec: u64) -> bool {
    if bound_msec == 0 {
        return !ctl.should_stop();
    }
    let msec = rand::thread_rng().gen_range(0..bound_msec);
    ctl.sleep(Duration::from_millis(msec))
}

/// Opens the configured indexes of every instance. `None` while the layer
/// is not ready.
fn open_indexes(layer: &DbLayer, config: &StressConfig, attempt: u32) -> Option<Vec<IndexRef>> {
    let mut refs = Vec::new();
    for instance in layer.instances() {
        for index in &config.indexes {
            match layer.get_index(&instance, index, false) {
                Ok(reference) => refs.push(reference),
                Err(err) if attempt >= MAX_ATTEMPTS => {
                    tracing::warn!(instance = instance.name(), index = %index, error = %err, "index not found or not ready yet, skipping");
                }
                Err(err) => {
                    tracing::warn!(instance = instance.name(), index = %index, error = %err, "index not found or not ready yet, retrying");
                    return None;
                }
            }
        }
    }
    Some(refs)
}

enum Pass {
    Done(u64),
    Deadlock,
    Stopped,
}

fn run_pass(ctl: &ThreadCtl, refs: &[IndexRef], txn: &BackTxn, config: &StressConfig) -> Pass {
    let mut cursors: Vec<Option<Box<dyn DbCursor>>> = Vec::with_capacity(refs.len());
    for reference in refs {
        match reference.cursor(txn.handle()) {
            Ok(cursor) => cursors.push(Some(cursor)),
            Err(err) if err.is_deadlock() => return Pass::Deadlock,
            Err(err) => {
                tracing::error!(index = reference.index(), error = %err, "failed to create a cursor");
                cursors.push(None);
            }
        }
    }

    let mut records = 0;
    let mut open = cursors.iter().filter(|c| c.is_some()).count();
    while open > 0 {
        if ctl.should_stop() {
            return Pass::Stopped;
        }
        for (slot, reference) in cursors.iter_mut().zip(refs) {
            let Some(cursor) = slot.as_mut() else {
                continue;
            };
            let mut key = DbValue::new();
            let mut data = DbValue::new();
            match cursor.move_to(CursorOp::Next, &mut key, &mut data) {
                Ok(()) => records += 1,
                Err(err) if err.is_deadlock() => return Pass::Deadlock,
                Err(DbError::NotFound) => {
                    *slot = None;
                    open -= 1;
                }
                Err(err) => {
                    tracing::error!(index = reference.index(), error = %err, "failed to read a cursor");
                    *slot = None;
                    open -= 1;
                }
            }
        }
    }
    if !jitter(ctl, config.hold_msec) {
        return Pass::Stopped;
    }
    Pass::Done(records)
}

pub(crate) fn stress_loop(weak: &Weak<LayerInner>, ctl: &ThreadCtl, config: &StressConfig) {
    if config.use_rmw {
        tracing::warn!("write-intent reads are not available; the stress thread reads with shared locks");
    }
    let mut attempt = 0;
    let refs = loop {
        if !ctl.sleep(Duration::from_secs(1)) {
            return;
        }
        attempt += 1;
        let Some(inner) = weak.upgrade() else { return };
        let layer = DbLayer { inner };
        if !layer.is_started() {
            continue;
        }
        if let Some(refs) = open_indexes(&layer, config, attempt) {
            break refs;
        }
    };
    tracing::warn!(indexes = refs.len(), "starting main txn stress loop");

    let mut passes: u64 = 0;
    while !ctl.should_stop() {
        let Some(inner) = weak.upgrade() else { break };
        let layer = DbLayer { inner };
        let txn = if config.use_txn {
            match layer.read_txn_begin(None) {
                Ok(txn) => txn,
                Err(err) => {
                    tracing::error!(error = %err, "failed to create a new transaction");
                    BackTxn::none()
                }
            }
        } else {
            BackTxn::none()
        };
        let outcome = run_pass(ctl, &refs, &txn, config);
        if !txn.is_none() {
            if let Err(err) = layer.read_txn_abort(Some(&txn)) {
                tracing::error!(error = %err, "failed to abort the stress transaction");
            }
        }
        drop(layer);
        match outcome {
            Pass::Stopped => break,
            Pass::Deadlock => {
                if config.verbose {
                    tracing::info!("cursor deadlock - retry");
                }
                continue;
            }
            Pass::Done(records) => {
                if config.verbose {
                    tracing::info!(indexes = refs.len(), records, "finished pass");
                }
            }
        }
        if !jitter(ctl, config.loop_msec) {
            break;
        }
        passes += 1;
        if passes % PASSES_PER_PAUSE == 0 && !ctl.sleep(Duration::from_secs(1)) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn disabled_without_the_switch() {
        assert!(StressConfig::from_lookup(lookup(&[("TXN_TEST_USE_TXN", "1")])).is_none());
    }

    #[test]
    fn defaults_apply() {
        let config = StressConfig::from_lookup(lookup(&[("TXN_TESTING", "1")])).unwrap();
        assert_eq!(config.hold_msec, 200);
        assert_eq!(config.loop_msec, 10);
        assert!(!config.use_txn && !config.use_rmw && !config.verbose);
        assert_eq!(config.indexes.len(), 12);
        assert_eq!(config.indexes.last().map(String::as_str), Some("id2entry"));
    }

    #[test]
    fn variables_override_defaults() {
        let config = StressConfig::from_lookup(lookup(&[
            ("TXN_TESTING", "1"),
            ("TXN_TEST_HOLD_MSEC", "5"),
            ("TXN_TEST_LOOP_MSEC", "junk"),
            ("TXN_TEST_USE_TXN", "1"),
            ("TXN_TEST_INDEXES", "cn, ,id2entry"),
        ]))
        .unwrap();
        assert_eq!(config.hold_msec, 5);
        assert_eq!(config.loop_msec, 10);
        assert!(config.use_txn);
        assert_eq!(config.indexes, vec!["cn", "id2entry"]);
    }
}
