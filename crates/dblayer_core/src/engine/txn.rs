//! Native transactions.
//!
//! Changes are applied to tables as they happen and undone from the
//! transaction's before-images on abort. A nested transaction hands its
//! undo records and locks to its parent when it commits; only a top-level
//! commit writes a log record.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::engine::log::{LogOp, LogRecord, Lsn};
use crate::engine::table::{Image, Table};
use crate::engine::Environment;
use crate::error::{DbError, DbResult};

bitflags! {
    /// Flags for beginning and committing transactions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxnFlags: u32 {
        /// Fail lock requests immediately instead of waiting.
        const NOWAIT = 0x0001;
        /// Write the commit record without flushing it.
        const WRITE_NOSYNC = 0x0002;
        /// Flush and sync the commit record (the default).
        const SYNC = 0x0004;
    }
}

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Begun and not yet resolved.
    Active,
    /// Committed.
    Committed,
    /// Aborted.
    Aborted,
}

pub(crate) struct Undo {
    pub(crate) table: Arc<Table>,
    pub(crate) key: Vec<u8>,
    pub(crate) before: Image,
}

struct TxnInner {
    status: TxnStatus,
    undo: Vec<Undo>,
    children: Vec<Weak<NativeTxn>>,
    /// Keys whose pending marker this (top-level) transaction owns.
    noted: Vec<(Arc<Table>, Vec<u8>)>,
}

impl TxnInner {
    fn new() -> Self {
        Self {
            status: TxnStatus::Active,
            undo: Vec::new(),
            children: Vec::new(),
            noted: Vec::new(),
        }
    }
}

/// A transaction of the embedded engine.
pub struct NativeTxn {
    id: u32,
    parent: Option<Txn>,
    begin_lsn: Lsn,
    nowait: bool,
    inner: Mutex<TxnInner>,
}

/// Shared handle to a native transaction.
pub type Txn = Arc<NativeTxn>;

impl fmt::Debug for NativeTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeTxn")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl NativeTxn {
    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Enclosing transaction, if nested.
    pub fn parent(&self) -> Option<&Txn> {
        self.parent.as_ref()
    }

    /// Current state.
    pub fn status(&self) -> TxnStatus {
        self.inner.lock().status
    }

    /// True until committed or aborted.
    pub fn is_active(&self) -> bool {
        self.status() == TxnStatus::Active
    }

    /// Log position when the outermost ancestor began.
    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    pub(crate) fn nowait(&self) -> bool {
        self.nowait
    }

    /// This transaction followed by its ancestors.
    pub(crate) fn family(&self) -> Vec<u32> {
        let mut ids = vec![self.id];
        let mut next = self.parent.as_ref();
        while let Some(txn) = next {
            ids.push(txn.id);
            next = txn.parent.as_ref();
        }
        ids
    }

    pub(crate) fn root_id(&self) -> u32 {
        self.root().id
    }

    fn root(&self) -> &NativeTxn {
        match self.parent.as_ref() {
            Some(parent) => parent.root(),
            None => self,
        }
    }

    /// Records that the outermost transaction owns the pending marker of
    /// `key` in `table`.
    pub(crate) fn remember_pending(&self, table: Arc<Table>, key: Vec<u8>) {
        self.root().inner.lock().noted.push((table, key));
    }

    pub(crate) fn ensure_active(&self) -> DbResult<()> {
        match self.status() {
            TxnStatus::Active => Ok(()),
            _ => Err(DbError::invalid_operation(format!(
                "transaction {} already resolved",
                self.id
            ))),
        }
    }

    pub(crate) fn push_undo(&self, undo: Undo) {
        self.inner.lock().undo.push(undo);
    }

    fn active_children(&self) -> Vec<Txn> {
        let mut inner = self.inner.lock();
        inner.children.retain(|c| c.strong_count() > 0);
        inner
            .children
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_active())
            .collect()
    }

    /// Marks the transaction resolved and hands back its undo records.
    fn finish(&self, status: TxnStatus) -> DbResult<Vec<Undo>> {
        let mut inner = self.inner.lock();
        if inner.status != TxnStatus::Active {
            return Err(DbError::invalid_operation(format!(
                "transaction {} already resolved",
                self.id
            )));
        }
        inner.status = status;
        inner.children.clear();
        Ok(std::mem::take(&mut inner.undo))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Environment {
    /// Begins a transaction, nested inside `parent` when given.
    pub fn txn_begin(&self, parent: Option<&Txn>, flags: TxnFlags) -> DbResult<Txn> {
        let inner = &self.inner;
        if !inner.flags.contains(super::EnvFlags::INIT_TXN) {
            return Err(DbError::invalid_operation(
                "environment not configured for transactions",
            ));
        }
        inner.ensure_open()?;

        let id = inner.next_locker();
        if let Some(parent) = parent {
            parent.ensure_active()?;
            let txn = Arc::new(NativeTxn {
                id,
                parent: Some(Arc::clone(parent)),
                begin_lsn: parent.begin_lsn,
                nowait: flags.contains(TxnFlags::NOWAIT),
                inner: Mutex::new(TxnInner::new()),
            });
            parent.inner.lock().children.push(Arc::downgrade(&txn));
            return Ok(txn);
        }

        let _commit = inner.commit_lock.read();
        let begin_lsn = inner.log.as_ref().map_or(Lsn::ZERO, |log| log.current_lsn());
        {
            let mut active = inner.active.lock();
            if active.len() >= inner.config.tx_max as usize {
                return Err(DbError::OutOfMemory {
                    message: format!(
                        "unable to allocate transaction: {} transactions active",
                        active.len()
                    ),
                });
            }
            active.insert(id, begin_lsn);
        }
        Ok(Arc::new(NativeTxn {
            id,
            parent: None,
            begin_lsn,
            nowait: flags.contains(TxnFlags::NOWAIT),
            inner: Mutex::new(TxnInner::new()),
        }))
    }

    /// Commits `txn`. Unresolved children are committed first.
    pub fn txn_commit(&self, txn: &Txn, flags: TxnFlags) -> DbResult<()> {
        txn.ensure_active()?;
        for child in txn.active_children() {
            self.txn_commit(&child, flags)?;
        }

        if let Some(parent) = txn.parent.as_ref() {
            parent.ensure_active()?;
            let undo = txn.finish(TxnStatus::Committed)?;
            parent.inner.lock().undo.extend(undo);
            if let Some(locks) = self.inner.locks.as_ref() {
                locks.transfer(txn.id, parent.id);
            }
            return Ok(());
        }

        let undo = txn.finish(TxnStatus::Committed)?;
        let commit = self.inner.commit_lock.read();
        if let Some(log) = self.inner.log.as_ref() {
            let ops = commit_ops(&undo);
            if !ops.is_empty() {
                let record = LogRecord::Commit {
                    txn: txn.id,
                    timestamp: now_secs(),
                    ops,
                };
                let written = if flags.contains(TxnFlags::WRITE_NOSYNC) {
                    log.put(&record)
                } else {
                    log.put_and_flush(&record, true)
                };
                if let Err(err) = written {
                    drop(commit);
                    tracing::error!(txn = txn.id, error = %err, "commit record not written; rolling back");
                    txn.inner.lock().status = TxnStatus::Aborted;
                    self.rollback(txn, undo);
                    return Err(err);
                }
            }
        }
        resolve_noted(txn);
        drop(commit);
        self.release(txn.id, true);
        Ok(())
    }

    /// Aborts `txn` and everything nested in it.
    pub fn txn_abort(&self, txn: &Txn) -> DbResult<()> {
        txn.ensure_active()?;
        for child in txn.active_children().into_iter().rev() {
            self.txn_abort(&child)?;
        }
        let undo = txn.finish(TxnStatus::Aborted)?;
        self.rollback(txn, undo);
        Ok(())
    }

    /// Number of unresolved top-level transactions.
    pub fn active_txns(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Begin position of the oldest unresolved top-level transaction.
    pub(crate) fn oldest_active(&self) -> Option<Lsn> {
        self.inner.active.lock().values().min().copied()
    }

    fn rollback(&self, txn: &NativeTxn, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            entry.table.restore(&entry.key, entry.before);
        }
        let top_level = txn.parent.is_none();
        if top_level {
            resolve_noted(txn);
        }
        self.release(txn.id, top_level);
    }

    fn release(&self, id: u32, top_level: bool) {
        if let Some(locks) = self.inner.locks.as_ref() {
            locks.release_all(id);
        }
        if top_level {
            self.inner.active.lock().remove(&id);
        }
    }
}

fn resolve_noted(txn: &NativeTxn) {
    let noted = std::mem::take(&mut txn.inner.lock().noted);
    for (table, key) in noted {
        table.resolve_pending(&key, txn.id);
    }
}

/// After-images of every key the transaction touched, in first-touch order.
fn commit_ops(undo: &[Undo]) -> Vec<LogOp> {
    let mut seen = HashSet::new();
    let mut ops = Vec::new();
    for entry in undo {
        if entry.table.is_removed() {
            continue;
        }
        if seen.insert((entry.table.name().to_string(), entry.key.clone())) {
            ops.push(LogOp {
                db: entry.table.name().to_string(),
                key: entry.key.clone(),
                after: entry.table.image(&entry.key),
            });
        }
    }
    ops
}
