//! Record locks and deadlock detection.
//!
//! Transactions take shared locks to read a key and exclusive locks to
//! write it, and hold them until they resolve. A nested transaction may take
//! locks its ancestors hold; on commit its locks pass to the parent.
//!
//! Blocked requests record whom they wait for. The detector walks that
//! waits-for graph and picks one victim per cycle according to a
//! [`DeadlockPolicy`]; the victim's pending request fails with
//! [`DbError::Deadlock`].

use crate::error::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// How long a blocked request sleeps before re-checking its lock.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared.
    Read,
    /// Exclusive.
    Write,
}

impl LockMode {
    fn conflicts(self, other: Self) -> bool {
        self == Self::Write || other == Self::Write
    }
}

/// Which transaction in a deadlock cycle is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockPolicy {
    /// Detection disabled.
    NoRun,
    /// Engine default (youngest).
    Default,
    /// The transaction holding the most locks.
    MaxLocks,
    /// The transaction holding the fewest locks.
    MinLocks,
    /// The oldest transaction.
    Oldest,
    /// The youngest transaction.
    Youngest,
}

impl DeadlockPolicy {
    /// Highest accepted numeric policy.
    pub const MAX_CODE: u32 = 9;

    /// Decodes a numeric policy as stored in configuration.
    ///
    /// Codes without a dedicated strategy use the default.
    ///
    /// # Errors
    ///
    /// Returns a configuration error above [`Self::MAX_CODE`].
    pub fn from_code(code: u32) -> DbResult<Self> {
        Ok(match code {
            0 => Self::NoRun,
            3 => Self::MaxLocks,
            5 => Self::MinLocks,
            7 => Self::Oldest,
            9 => Self::Youngest,
            1 | 2 | 4 | 6 | 8 => Self::Default,
            other => {
                return Err(DbError::config(format!(
                    "deadlock policy {other} is out of range 0..={}",
                    Self::MAX_CODE
                )))
            }
        })
    }
}

/// Lock table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStat {
    /// Locks currently held.
    pub nlocks: u32,
    /// Size of the lock table.
    pub maxlocks: u32,
    /// Requests currently blocked.
    pub nwaiting: u32,
    /// Victims chosen so far.
    pub ndeadlocks: u64,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    txn: u32,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockTable {
    objects: HashMap<Vec<u8>, Vec<Holder>>,
    owned: HashMap<u32, HashSet<Vec<u8>>>,
    waiting: HashMap<u32, Vec<u32>>,
    victims: HashSet<u32>,
    nlocks: u32,
    ndeadlocks: u64,
}

/// The lock manager.
#[derive(Debug)]
pub(crate) struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    max_locks: u32,
}

/// Builds the lock object name for a key of a database.
pub(crate) fn lock_object(db: &str, key: &[u8]) -> Vec<u8> {
    let mut object = Vec::with_capacity(db.len() + 1 + key.len());
    object.extend_from_slice(db.as_bytes());
    object.push(0);
    object.extend_from_slice(key);
    object
}

impl LockManager {
    pub(crate) fn new(max_locks: u32) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            max_locks,
        }
    }

    /// Acquires `object` for `family[0]`; the rest of `family` are its
    /// ancestors, whose locks never conflict with it.
    pub(crate) fn acquire(
        &self,
        family: &[u32],
        object: &[u8],
        mode: LockMode,
        nowait: bool,
    ) -> DbResult<()> {
        let txn = family[0];
        let mut table = self.table.lock();
        loop {
            if table.victims.remove(&txn) {
                table.waiting.remove(&txn);
                return Err(DbError::Deadlock {
                    message: format!("transaction {txn} chosen as deadlock victim"),
                });
            }

            let holders = table.objects.get(object).map(Vec::as_slice).unwrap_or(&[]);
            let blockers: Vec<u32> = holders
                .iter()
                .filter(|h| !family.contains(&h.txn) && h.mode.conflicts(mode))
                .map(|h| h.txn)
                .collect();

            if blockers.is_empty() {
                table.waiting.remove(&txn);
                return self.grant(&mut table, txn, object, mode);
            }
            if nowait {
                return Err(DbError::LockNotGranted {
                    message: format!(
                        "{mode:?} lock held by transaction {}",
                        blockers[0]
                    ),
                });
            }
            table.waiting.insert(txn, blockers);
            self.released.wait_for(&mut table, WAIT_SLICE);
        }
    }

    fn grant(
        &self,
        table: &mut LockTable,
        txn: u32,
        object: &[u8],
        mode: LockMode,
    ) -> DbResult<()> {
        if let Some(holders) = table.objects.get_mut(object) {
            if let Some(held) = holders.iter_mut().find(|h| h.txn == txn) {
                if held.mode < mode {
                    held.mode = mode;
                }
                return Ok(());
            }
        }
        if table.nlocks >= self.max_locks {
            return Err(DbError::OutOfLocks {
                max: self.max_locks,
            });
        }
        table
            .objects
            .entry(object.to_vec())
            .or_default()
            .push(Holder { txn, mode });
        table.owned.entry(txn).or_default().insert(object.to_vec());
        table.nlocks += 1;
        Ok(())
    }

    /// Drops every lock of `txn`.
    pub(crate) fn release_all(&self, txn: u32) {
        let mut table = self.table.lock();
        table.waiting.remove(&txn);
        table.victims.remove(&txn);
        if let Some(objects) = table.owned.remove(&txn) {
            for object in objects {
                let now_empty = match table.objects.get_mut(&object) {
                    Some(holders) => {
                        holders.retain(|h| h.txn != txn);
                        holders.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    table.objects.remove(&object);
                }
                table.nlocks = table.nlocks.saturating_sub(1);
            }
        }
        drop(table);
        self.released.notify_all();
    }

    /// Hands the locks of a committed child to its parent.
    pub(crate) fn transfer(&self, child: u32, parent: u32) {
        let mut table = self.table.lock();
        let Some(objects) = table.owned.remove(&child) else {
            return;
        };
        for object in objects {
            let mut dropped = false;
            if let Some(holders) = table.objects.get_mut(&object) {
                let child_mode = holders
                    .iter()
                    .find(|h| h.txn == child)
                    .map(|h| h.mode)
                    .unwrap_or(LockMode::Read);
                holders.retain(|h| h.txn != child);
                if let Some(held) = holders.iter_mut().find(|h| h.txn == parent) {
                    if held.mode < child_mode {
                        held.mode = child_mode;
                    }
                    dropped = true;
                } else {
                    holders.push(Holder {
                        txn: parent,
                        mode: child_mode,
                    });
                }
            }
            if dropped {
                table.nlocks = table.nlocks.saturating_sub(1);
            } else {
                table.owned.entry(parent).or_default().insert(object);
            }
        }
        drop(table);
        self.released.notify_all();
    }

    /// Runs one detection pass; returns how many victims were chosen.
    pub(crate) fn detect(&self, policy: DeadlockPolicy) -> usize {
        if policy == DeadlockPolicy::NoRun {
            return 0;
        }
        let mut table = self.table.lock();
        let mut victims = 0;
        while let Some(cycle) = find_cycle(&table.waiting, &table.victims) {
            let victim = choose_victim(&table, &cycle, policy);
            tracing::debug!(victim, cycle = ?cycle, "deadlock detected");
            table.waiting.remove(&victim);
            table.victims.insert(victim);
            table.ndeadlocks += 1;
            victims += 1;
        }
        drop(table);
        if victims > 0 {
            self.released.notify_all();
        }
        victims
    }

    pub(crate) fn stat(&self) -> LockStat {
        let table = self.table.lock();
        LockStat {
            nlocks: table.nlocks,
            maxlocks: self.max_locks,
            nwaiting: table.waiting.len() as u32,
            ndeadlocks: table.ndeadlocks,
        }
    }
}

/// Finds one cycle in the waits-for graph, ignoring already chosen victims.
fn find_cycle(waiting: &HashMap<u32, Vec<u32>>, victims: &HashSet<u32>) -> Option<Vec<u32>> {
    let mut starts: Vec<u32> = waiting.keys().copied().collect();
    starts.sort_unstable();
    let mut finished = HashSet::new();
    for start in starts {
        if finished.contains(&start) || victims.contains(&start) {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = walk(start, waiting, victims, &mut path, &mut finished) {
            return Some(cycle);
        }
    }
    None
}

fn walk(
    node: u32,
    waiting: &HashMap<u32, Vec<u32>>,
    victims: &HashSet<u32>,
    path: &mut Vec<u32>,
    finished: &mut HashSet<u32>,
) -> Option<Vec<u32>> {
    if let Some(pos) = path.iter().position(|&n| n == node) {
        return Some(path[pos..].to_vec());
    }
    if finished.contains(&node) || victims.contains(&node) {
        return None;
    }
    path.push(node);
    if let Some(next) = waiting.get(&node) {
        for &blocker in next {
            if let Some(cycle) = walk(blocker, waiting, victims, path, finished) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    finished.insert(node);
    None
}

fn choose_victim(table: &LockTable, cycle: &[u32], policy: DeadlockPolicy) -> u32 {
    let locks = |txn: &u32| table.owned.get(txn).map_or(0, HashSet::len);
    let chosen = match policy {
        DeadlockPolicy::Oldest => cycle.iter().min().copied(),
        DeadlockPolicy::MaxLocks => cycle.iter().max_by_key(|t| (locks(*t), **t)).copied(),
        DeadlockPolicy::MinLocks => cycle
            .iter()
            .min_by_key(|t| (locks(*t), std::cmp::Reverse(**t)))
            .copied(),
        DeadlockPolicy::Default | DeadlockPolicy::Youngest | DeadlockPolicy::NoRun => {
            cycle.iter().max().copied()
        }
    };
    chosen.unwrap_or(cycle[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_locks_coexist() {
        let locks = LockManager::new(100);
        let obj = lock_object("cn.db", b"=bob");
        locks.acquire(&[1], &obj, LockMode::Read, true).unwrap();
        locks.acquire(&[2], &obj, LockMode::Read, true).unwrap();
        assert_eq!(locks.stat().nlocks, 2);
    }

    #[test]
    fn nowait_conflict_fails_fast() {
        let locks = LockManager::new(100);
        let obj = lock_object("id2entry.db", b"1");
        locks.acquire(&[1], &obj, LockMode::Write, true).unwrap();
        let err = locks.acquire(&[2], &obj, LockMode::Read, true).unwrap_err();
        assert!(err.is_deadlock());

        locks.release_all(1);
        locks.acquire(&[2], &obj, LockMode::Read, true).unwrap();
    }

    #[test]
    fn child_may_use_ancestor_locks() {
        let locks = LockManager::new(100);
        let obj = lock_object("id2entry.db", b"1");
        locks.acquire(&[1], &obj, LockMode::Write, true).unwrap();
        locks.acquire(&[2, 1], &obj, LockMode::Write, true).unwrap();

        locks.transfer(2, 1);
        assert_eq!(locks.stat().nlocks, 1);
        locks.release_all(1);
        assert_eq!(locks.stat().nlocks, 0);
    }

    #[test]
    fn table_full_reports_out_of_locks() {
        let locks = LockManager::new(1);
        locks.acquire(&[1], b"a", LockMode::Read, true).unwrap();
        let err = locks.acquire(&[1], b"b", LockMode::Read, true).unwrap_err();
        assert!(matches!(err, DbError::OutOfLocks { max: 1 }));
    }

    #[test]
    fn policy_codes() {
        assert_eq!(DeadlockPolicy::from_code(9).unwrap(), DeadlockPolicy::Youngest);
        assert_eq!(DeadlockPolicy::from_code(0).unwrap(), DeadlockPolicy::NoRun);
        assert_eq!(DeadlockPolicy::from_code(2).unwrap(), DeadlockPolicy::Default);
        assert!(DeadlockPolicy::from_code(10).is_err());
    }

    #[test]
    fn detector_aborts_youngest_in_cycle() {
        let locks = Arc::new(LockManager::new(100));
        locks.acquire(&[1], b"a", LockMode::Write, false).unwrap();
        locks.acquire(&[2], b"b", LockMode::Write, false).unwrap();

        let older = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire(&[1], b"b", LockMode::Write, false))
        };
        let younger = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire(&[2], b"a", LockMode::Write, false))
        };

        while locks.stat().nwaiting < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(locks.detect(DeadlockPolicy::Youngest), 1);

        let younger_result = younger.join().unwrap();
        assert!(matches!(younger_result, Err(DbError::Deadlock { .. })));
        locks.release_all(2);
        older.join().unwrap().unwrap();
    }
}
