//! Checkpoints, cache trickle and log archiving.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::engine::log::{log_file_name, LogRecord, Lsn};
use crate::engine::table::{Snapshot, Table};
use crate::engine::Environment;
use crate::error::{DbError, DbResult};

bitflags! {
    /// Flags for [`Environment::log_archive`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArchiveFlags: u32 {
        /// Return absolute paths.
        const ABS = 0x0001;
        /// Return every log file, needed or not.
        const LOG = 0x0002;
    }
}

#[derive(Debug, Default)]
pub(crate) struct CheckpointState {
    /// Position recorded by the last checkpoint.
    pub(crate) last: Option<Lsn>,
    /// Log end right after the last checkpoint record.
    pub(crate) log_end: Lsn,
}

impl Environment {
    /// Takes a checkpoint: every committed change is written to the table
    /// files and a checkpoint record is logged.
    ///
    /// Without `force`, nothing happens when no table is dirty and nothing
    /// was logged since the previous checkpoint. Returns the checkpoint
    /// position, or `None` if it was skipped.
    pub fn txn_checkpoint(&self, force: bool) -> DbResult<Option<Lsn>> {
        self.inner.ensure_open()?;
        let Some(log) = self.inner.log.as_ref() else {
            self.persist_all(Lsn::ZERO)?;
            return Ok(None);
        };

        let _persist = self.inner.persist_lock.lock();
        let commit = self.inner.commit_lock.write();
        let current = log.current_lsn();
        let quiet = current == self.inner.checkpoints.lock().log_end;
        let tables = self.open_tables();
        if !force && quiet && !tables.iter().any(|t| t.is_dirty()) {
            return Ok(None);
        }
        log.flush(true)?;
        let stamp = log.current_lsn();
        let snapshots = capture(&tables, tables.len());
        let oldest_active = self.oldest_active();
        drop(commit);

        for (table, snapshot) in snapshots {
            table.persist(snapshot, stamp)?;
        }
        let record = LogRecord::Checkpoint {
            ckp_lsn: stamp,
            oldest_active,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        log.put_and_flush(&record, true)?;

        let mut state = self.inner.checkpoints.lock();
        state.last = Some(stamp);
        state.log_end = log.current_lsn();
        tracing::debug!(ckp_lsn = %stamp, "checkpoint taken");
        Ok(Some(stamp))
    }

    /// Position recorded by the most recent checkpoint.
    pub fn last_checkpoint(&self) -> Option<Lsn> {
        self.inner.checkpoints.lock().last
    }

    /// Writes out up to `percent` percent of the dirty tables (at least
    /// one when any is dirty); returns how many were written.
    pub fn memp_trickle(&self, percent: u32) -> DbResult<usize> {
        self.inner.ensure_open()?;
        if percent == 0 || percent > 100 {
            return Err(DbError::invalid_operation(format!(
                "trickle percentage {percent} out of range 1..=100"
            )));
        }
        let _persist = self.inner.persist_lock.lock();
        let commit = self.inner.commit_lock.write();
        let stamp = match self.inner.log.as_ref() {
            Some(log) => {
                log.flush(false)?;
                log.current_lsn()
            }
            None => Lsn::ZERO,
        };
        let dirty: Vec<Arc<Table>> = self
            .open_tables()
            .into_iter()
            .filter(|t| t.is_dirty())
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }
        let quota = (dirty.len() * percent as usize).div_ceil(100).max(1);
        let snapshots = capture(&dirty, quota);
        drop(commit);

        let written = snapshots.len();
        for (table, snapshot) in snapshots {
            table.persist(snapshot, stamp)?;
        }
        Ok(written)
    }

    /// Lists log files.
    ///
    /// By default only files no longer needed for recovery are listed:
    /// those older than both the last checkpoint and the oldest unresolved
    /// transaction, never the file being written. Nothing is listed before
    /// the first checkpoint.
    pub fn log_archive(&self, flags: ArchiveFlags) -> DbResult<Vec<PathBuf>> {
        let Some(log) = self.inner.log.as_ref() else {
            return Ok(Vec::new());
        };
        let files = log.files()?;
        let selected: Vec<u32> = if flags.contains(ArchiveFlags::LOG) {
            files
        } else {
            let Some(last) = self.last_checkpoint() else {
                return Ok(Vec::new());
            };
            let mut limit = last.file;
            if let Some(oldest) = self.oldest_active() {
                limit = limit.min(oldest.file);
            }
            let current = log.current_file();
            files
                .into_iter()
                .filter(|&n| n < limit && n != current)
                .collect()
        };

        selected
            .into_iter()
            .map(|n| {
                if flags.contains(ArchiveFlags::ABS) {
                    Ok(std::path::absolute(log.path(n))?)
                } else {
                    Ok(PathBuf::from(log_file_name(n)))
                }
            })
            .collect()
    }

    /// Rebuilds the checkpoint bookkeeping from the log after an open.
    pub(crate) fn load_checkpoint_state(&self) -> DbResult<()> {
        let Some(log) = self.inner.log.as_ref() else {
            return Ok(());
        };
        let first = log.files()?.first().copied().unwrap_or(1);
        let mut last = None;
        log.scan(Lsn::new(first, 0), |_, record| {
            if let LogRecord::Checkpoint { ckp_lsn, .. } = record {
                last = Some(*ckp_lsn);
            }
            Ok(())
        })?;
        let mut state = self.inner.checkpoints.lock();
        state.last = last;
        state.log_end = log.current_lsn();
        Ok(())
    }

    /// Writes every dirty table with `stamp`.
    pub(crate) fn persist_all(&self, stamp: Lsn) -> DbResult<()> {
        let _persist = self.inner.persist_lock.lock();
        let tables = self.open_tables();
        let count = tables.len();
        for (table, snapshot) in capture(&tables, count) {
            table.persist(snapshot, stamp)?;
        }
        Ok(())
    }
}

fn capture(tables: &[Arc<Table>], limit: usize) -> Vec<(Arc<Table>, Snapshot)> {
    tables
        .iter()
        .filter_map(|t| t.snapshot(false).map(|s| (Arc::clone(t), s)))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::engine::{
        ArchiveFlags, DbOpenFlags, EnvBuilder, EnvConfig, EnvFlags, Environment, TxnFlags,
    };
    use tempfile::tempdir;

    fn small_log_env(dir: &std::path::Path) -> Environment {
        EnvBuilder::new(EnvConfig::default().with_log_file_max(512))
            .open(dir, EnvFlags::transactional())
            .unwrap()
    }

    fn write_some(env: &Environment, n: u32) {
        let db = env.db_open("t.db", DbOpenFlags::CREATE).unwrap();
        for i in 0..n {
            let txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
            db.put(Some(&txn), &i.to_be_bytes(), &[7u8; 64]).unwrap();
            env.txn_commit(&txn, TxnFlags::empty()).unwrap();
        }
    }

    #[test]
    fn idle_checkpoint_is_skipped() {
        let dir = tempdir().unwrap();
        let env = small_log_env(dir.path());
        write_some(&env, 3);
        assert!(env.txn_checkpoint(false).unwrap().is_some());
        assert!(env.txn_checkpoint(false).unwrap().is_none());
        assert!(env.txn_checkpoint(true).unwrap().is_some());
        env.close().unwrap();
    }

    #[test]
    fn nothing_archivable_before_first_checkpoint() {
        let dir = tempdir().unwrap();
        let env = small_log_env(dir.path());
        write_some(&env, 20);
        assert!(env.log_archive(ArchiveFlags::empty()).unwrap().is_empty());
        assert!(env.log_archive(ArchiveFlags::LOG).unwrap().len() > 1);
        env.txn_checkpoint(true).unwrap();
        let archivable = env.log_archive(ArchiveFlags::ABS).unwrap();
        assert!(!archivable.is_empty());
        assert!(archivable.iter().all(|p| p.is_absolute()));
        env.close().unwrap();
    }

    #[test]
    fn open_transaction_pins_log() {
        let dir = tempdir().unwrap();
        let env = small_log_env(dir.path());
        let pin = env.txn_begin(None, TxnFlags::empty()).unwrap();
        write_some(&env, 20);
        env.txn_checkpoint(true).unwrap();
        assert!(env.log_archive(ArchiveFlags::empty()).unwrap().is_empty());
        env.txn_abort(&pin).unwrap();
        env.txn_checkpoint(true).unwrap();
        assert!(!env.log_archive(ArchiveFlags::empty()).unwrap().is_empty());
        env.close().unwrap();
    }

    #[test]
    fn trickle_writes_a_share_of_dirty_tables() {
        let dir = tempdir().unwrap();
        let env = small_log_env(dir.path());
        for name in ["a.db", "b.db", "c.db", "d.db"] {
            let db = env.db_open(name, DbOpenFlags::CREATE).unwrap();
            db.put(None, b"k", b"v").unwrap();
        }
        assert_eq!(env.memp_trickle(50).unwrap(), 2);
        assert_eq!(env.memp_trickle(1).unwrap(), 1);
        assert!(env.memp_trickle(0).is_err());
        env.close().unwrap();
    }
}
