//! Database handles and cursors.

use std::fmt;
use std::sync::Arc;

use crate::engine::lock::{lock_object, LockMode};
use crate::engine::table::{Image, Pair, PutMode, Table};
use crate::engine::txn::{Txn, TxnFlags, Undo};
use crate::engine::{DbOpenFlags, DupCompare, Environment};
use crate::error::{DbError, DbResult};

/// An open database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    env: Environment,
    table: Arc<Table>,
    flags: DbOpenFlags,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.table.name())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

impl Database {
    pub(crate) fn new(env: Environment, table: Arc<Table>, flags: DbOpenFlags) -> Self {
        Self { env, table, flags }
    }

    /// Database file name.
    pub fn name(&self) -> &str {
        self.table.name()
    }

    /// Structure flags of the database plus the handle's own flags.
    pub fn flags(&self) -> DbOpenFlags {
        self.table.flags() | (self.flags & DbOpenFlags::RDONLY)
    }

    /// Environment the database belongs to.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Sets the order of data items under one key.
    pub fn set_dup_compare(&self, compare: DupCompare) {
        self.table.set_dup_compare(compare);
    }

    /// First data item stored under `key`.
    pub fn get(&self, txn: Option<&Txn>, key: &[u8]) -> DbResult<Vec<u8>> {
        self.read_lock(txn, key)?;
        self.table.seek(key).map(|(_, data)| data).ok_or(DbError::NotFound)
    }

    /// Succeeds when the exact pair is stored.
    pub fn get_both(&self, txn: Option<&Txn>, key: &[u8], data: &[u8]) -> DbResult<()> {
        self.read_lock(txn, key)?;
        self.table
            .seek_both(key, data)
            .map(|_| ())
            .ok_or(DbError::NotFound)
    }

    /// Stores a pair, replacing the data of a non-duplicate key.
    pub fn put(&self, txn: Option<&Txn>, key: &[u8], data: &[u8]) -> DbResult<()> {
        self.put_with(txn, key, data, PutMode::Overwrite)
    }

    /// Stores a pair with explicit handling of existing keys.
    pub fn put_with(
        &self,
        txn: Option<&Txn>,
        key: &[u8],
        data: &[u8],
        mode: PutMode,
    ) -> DbResult<()> {
        self.write(txn, key, |table| table.put(key, data, mode))
    }

    /// Removes a key and all its data.
    pub fn del(&self, txn: Option<&Txn>, key: &[u8]) -> DbResult<()> {
        self.write(txn, key, |table| table.delete(key))
    }

    /// Removes one pair.
    pub fn del_pair(&self, txn: Option<&Txn>, key: &[u8], data: &[u8]) -> DbResult<()> {
        self.write(txn, key, |table| table.delete_pair(key, data))
    }

    /// Number of stored pairs.
    pub fn count(&self) -> u64 {
        self.table.len()
    }

    /// Opens a cursor, inside `txn` when given.
    pub fn cursor(&self, txn: Option<&Txn>) -> DbResult<Cursor> {
        if let Some(txn) = txn {
            txn.ensure_active()?;
        }
        self.env.inner.ensure_open()?;
        Ok(Cursor {
            db: self.clone(),
            txn: txn.cloned(),
            current: None,
        })
    }

    fn read_lock(&self, txn: Option<&Txn>, key: &[u8]) -> DbResult<()> {
        self.env.inner.ensure_open()?;
        let Some(locks) = self.env.inner.locks.as_ref() else {
            return Ok(());
        };
        let object = lock_object(self.table.name(), key);
        match txn {
            Some(txn) => {
                txn.ensure_active()?;
                locks.acquire(&txn.family(), &object, LockMode::Read, txn.nowait())
            }
            None => {
                let locker = self.env.inner.next_locker();
                let result = locks.acquire(&[locker], &object, LockMode::Read, false);
                locks.release_all(locker);
                result
            }
        }
    }

    fn write<F>(&self, txn: Option<&Txn>, key: &[u8], apply: F) -> DbResult<()>
    where
        F: FnOnce(&Table) -> DbResult<Image>,
    {
        self.env.inner.ensure_open()?;
        if self.flags.contains(DbOpenFlags::RDONLY) {
            return Err(DbError::invalid_operation(format!(
                "{} opened read-only",
                self.name()
            )));
        }
        if self.table.is_removed() {
            return Err(DbError::invalid_operation(format!(
                "{} has been removed",
                self.name()
            )));
        }

        match txn {
            Some(txn) => self.write_in(txn, key, apply),
            None if self.env.uses_txn() && self.env.uses_log() => {
                let txn = self.env.txn_begin(None, TxnFlags::empty())?;
                match self.write_in(&txn, key, apply) {
                    Ok(()) => self.env.txn_commit(&txn, TxnFlags::empty()),
                    Err(err) => {
                        if let Err(abort) = self.env.txn_abort(&txn) {
                            tracing::warn!(error = %abort, "auto-commit abort failed");
                        }
                        Err(err)
                    }
                }
            }
            None => {
                let Some(locks) = self.env.inner.locks.as_ref() else {
                    return apply(&self.table).map(|_| ());
                };
                let locker = self.env.inner.next_locker();
                let object = lock_object(self.table.name(), key);
                let result = locks
                    .acquire(&[locker], &object, LockMode::Write, false)
                    .and_then(|()| apply(&self.table).map(|_| ()));
                locks.release_all(locker);
                result
            }
        }
    }

    fn write_in<F>(&self, txn: &Txn, key: &[u8], apply: F) -> DbResult<()>
    where
        F: FnOnce(&Table) -> DbResult<Image>,
    {
        txn.ensure_active()?;
        if let Some(locks) = self.env.inner.locks.as_ref() {
            let object = lock_object(self.table.name(), key);
            locks.acquire(&txn.family(), &object, LockMode::Write, txn.nowait())?;
        }
        let root = txn.root_id();
        let noted = self.table.note_pending(key, root);
        match apply(&self.table) {
            Ok(before) => {
                if noted {
                    txn.remember_pending(Arc::clone(&self.table), key.to_vec());
                }
                txn.push_undo(Undo {
                    table: Arc::clone(&self.table),
                    key: key.to_vec(),
                    before,
                });
                Ok(())
            }
            Err(err) => {
                if noted {
                    self.table.resolve_pending(key, root);
                }
                Err(err)
            }
        }
    }
}

/// A position in a database.
///
/// A fresh cursor has no position: `next` then behaves like `first` and
/// `prev` like `last`. The position survives deletion of the pair under it.
pub struct Cursor {
    db: Database,
    txn: Option<Txn>,
    current: Option<Pair>,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("db", &self.db.name())
            .field("txn", &self.txn.as_ref().map(|t| t.id()))
            .finish_non_exhaustive()
    }
}

impl Cursor {
    /// Database the cursor walks.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Moves to the first pair.
    pub fn first(&mut self) -> DbResult<Pair> {
        self.settle(|t| t.first())
    }

    /// Moves to the last pair.
    pub fn last(&mut self) -> DbResult<Pair> {
        self.settle(|t| t.last())
    }

    /// Moves to the next pair, or the first one from an unset cursor.
    pub fn next(&mut self) -> DbResult<Pair> {
        match self.current.clone() {
            Some((key, data)) => self.settle(|t| t.after(&key, &data)),
            None => self.first(),
        }
    }

    /// Moves to the previous pair, or the last one from an unset cursor.
    pub fn prev(&mut self) -> DbResult<Pair> {
        match self.current.clone() {
            Some((key, data)) => self.settle(|t| t.before(&key, &data)),
            None => self.last(),
        }
    }

    /// Next data item of the current key.
    pub fn next_dup(&mut self) -> DbResult<Pair> {
        let (key, data) = self.position()?;
        self.settle(|t| t.next_dup(&key, &data))
    }

    /// Previous data item of the current key.
    pub fn prev_dup(&mut self) -> DbResult<Pair> {
        let (key, data) = self.position()?;
        self.settle(|t| t.prev_dup(&key, &data))
    }

    /// First pair of the next key.
    pub fn next_nodup(&mut self) -> DbResult<Pair> {
        match self.current.clone() {
            Some((key, _)) => self.settle(|t| t.next_key(&key)),
            None => self.first(),
        }
    }

    /// Last pair of the previous key.
    pub fn prev_nodup(&mut self) -> DbResult<Pair> {
        match self.current.clone() {
            Some((key, _)) => self.settle(|t| t.prev_key(&key)),
            None => self.last(),
        }
    }

    /// Moves to the first pair of `key`.
    pub fn set(&mut self, key: &[u8]) -> DbResult<Pair> {
        self.settle(|t| t.seek(key))
    }

    /// Moves to the first pair at or after `key`.
    pub fn set_range(&mut self, key: &[u8]) -> DbResult<Pair> {
        self.settle(|t| t.seek_range(key))
    }

    /// Moves to the exact pair.
    pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> DbResult<Pair> {
        self.settle(|t| t.seek_both(key, data))
    }

    /// Moves to the first pair of `key` with data at or after `data`.
    pub fn get_both_range(&mut self, key: &[u8], data: &[u8]) -> DbResult<Pair> {
        self.settle(|t| t.seek_both_range(key, data))
    }

    /// Moves to the pair at 1-based position `recno`.
    pub fn set_recno(&mut self, recno: u32) -> DbResult<Pair> {
        self.require_recnum()?;
        self.settle(|t| t.at_recno(recno))
    }

    /// The pair under the cursor.
    pub fn current(&self) -> DbResult<Pair> {
        let (key, data) = self.position()?;
        self.db.read_lock(self.txn.as_ref(), &key)?;
        self.db
            .table
            .seek_both(&key, &data)
            .ok_or(DbError::NotFound)
    }

    /// 1-based position of the pair under the cursor.
    pub fn recno(&self) -> DbResult<u32> {
        self.require_recnum()?;
        let (key, data) = self.position()?;
        self.db
            .table
            .recno_of(&key, &data)
            .ok_or(DbError::NotFound)
    }

    /// Number of data items under the current key.
    pub fn count(&self) -> DbResult<usize> {
        let (key, _) = self.position()?;
        Ok(self.db.table.count(&key))
    }

    /// Stores a pair and moves onto it.
    pub fn put(&mut self, key: &[u8], data: &[u8], mode: PutMode) -> DbResult<()> {
        self.db.put_with(self.txn.as_ref(), key, data, mode)?;
        self.current = Some((key.to_vec(), data.to_vec()));
        Ok(())
    }

    /// Deletes the pair under the cursor.
    pub fn del(&mut self) -> DbResult<()> {
        let (key, data) = self.position()?;
        if self.db.table.is_dupsort() {
            self.db.del_pair(self.txn.as_ref(), &key, &data)
        } else {
            self.db.del(self.txn.as_ref(), &key)
        }
    }

    fn position(&self) -> DbResult<Pair> {
        self.current
            .clone()
            .ok_or_else(|| DbError::invalid_operation("cursor not positioned"))
    }

    fn require_recnum(&self) -> DbResult<()> {
        if self.db.table.flags().contains(DbOpenFlags::RECNUM) {
            Ok(())
        } else {
            Err(DbError::unsupported(format!(
                "record numbers on {} (opened without RECNUM)",
                self.db.name()
            )))
        }
    }

    /// Finds a pair, locks its key and checks it is still there.
    fn settle<F>(&mut self, mut find: F) -> DbResult<Pair>
    where
        F: FnMut(&Table) -> Option<Pair>,
    {
        loop {
            let Some(pair) = find(&self.db.table) else {
                return Err(DbError::NotFound);
            };
            self.db.read_lock(self.txn.as_ref(), &pair.0)?;
            if self.db.table.seek_both(&pair.0, &pair.1).is_some() {
                self.current = Some(pair.clone());
                return Ok(pair);
            }
        }
    }
}
