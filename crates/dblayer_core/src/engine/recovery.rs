//! Log replay.
//!
//! Commit records carry the after-image of every key they changed, so
//! replay is a matter of writing those images back in log order. A table
//! skips records older than the stamp of its persisted image. Uncommitted
//! work never reaches the log or the table files, so nothing needs undoing.

use std::fs;
use std::sync::Arc;

use crate::engine::log::{LogRecord, Lsn};
use crate::engine::table::Table;
use crate::engine::{DbOpenFlags, Environment};
use crate::error::{DbError, DbResult};

/// What a recovery run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Where replay started.
    pub start: Lsn,
    /// End of the intact log.
    pub end: Lsn,
    /// Key images written back.
    pub applied: usize,
}

pub(crate) fn run(env: &Environment, fatal: bool) -> DbResult<RecoveryStats> {
    let log = env
        .inner
        .log
        .as_ref()
        .ok_or_else(|| DbError::invalid_operation("recovery needs a transaction log"))?;
    let first = Lsn::new(log.files()?.first().copied().unwrap_or(1), 0);

    let mut start = first;
    if !fatal {
        log.scan(first, |_, record| {
            if let LogRecord::Checkpoint { ckp_lsn, .. } = record {
                start = (*ckp_lsn).max(first);
            }
            Ok(())
        })?;
    }
    tracing::info!(start = %start, fatal, "replaying transaction log");

    let mut applied = 0;
    let end = log.scan(start, |lsn, record| {
        match record {
            LogRecord::Commit { ops, .. } => {
                for op in ops {
                    let table = table_for_replay(env, &op.db)?;
                    if lsn >= table.stamp() {
                        table.restore(&op.key, op.after.clone());
                        applied += 1;
                    }
                }
            }
            LogRecord::DbRemove { db } => {
                if let Some(table) = env.inner.tables.write().remove(db) {
                    table.mark_removed();
                }
                let (path, exists) = env.table_path(db);
                if exists {
                    fs::remove_file(path)?;
                }
            }
            LogRecord::Checkpoint { .. } => {}
        }
        Ok(())
    })?;

    env.txn_checkpoint(true)?;
    Ok(RecoveryStats {
        start,
        end,
        applied,
    })
}

fn table_for_replay(env: &Environment, name: &str) -> DbResult<Arc<Table>> {
    if let Some(table) = env.inner.tables.read().get(name) {
        return Ok(Arc::clone(table));
    }
    let (path, exists) = env.table_path(name);
    let table = if exists {
        Table::load(name, path, DbOpenFlags::empty())?
    } else {
        tracing::warn!(table = name, "database file missing; rebuilding it from the log");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Table::create(name, path, DbOpenFlags::empty(), Lsn::ZERO)?
    };
    let table = Arc::new(table);
    env.inner
        .tables
        .write()
        .insert(name.to_string(), Arc::clone(&table));
    Ok(table)
}
