//! Ordered key/data tables.
//!
//! A table lives in memory as a sorted vector of keys, each carrying one or
//! more data items (more than one only for `DUPSORT` tables). Writes go
//! straight to the in-memory image; the owning transaction keeps the
//! before-image so it can undo them. The image is persisted as a whole file
//! at checkpoint or trickle time, with uncommitted keys rolled back to their
//! committed state in the written copy.
//!
//! ## File format
//!
//! ```text
//! magic "DBLT" | version u16 | flags u32 | stamp (file u32, offset u32)
//! | entry count u32 | entries | crc32 u32
//! entry: key (len u32, bytes) | dup count u32 | dups (len u32, bytes)*
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::log::record::{put_bytes, put_len, put_lsn, PayloadReader};
use crate::engine::log::Lsn;
use crate::engine::DbOpenFlags;
use crate::error::{DbError, DbResult};

const TABLE_MAGIC: &[u8; 4] = b"DBLT";
const TABLE_VERSION: u16 = 1;

/// Orders the data items stored under one key.
pub type DupCompare = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Every data item stored under a key, or `None` when the key is absent.
pub(crate) type Image = Option<Vec<Vec<u8>>>;

/// A key/data pair handed out by navigation.
pub(crate) type Pair = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) key: Vec<u8>,
    pub(crate) dups: Vec<Vec<u8>>,
}

/// How a put treats an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Replace the data (or add a duplicate in a `DUPSORT` table).
    Overwrite,
    /// Fail with `KeyExists` if the key is present.
    NoOverwrite,
    /// Fail with `KeyExists` if the exact pair is present.
    NoDupData,
    /// Fail with `NotFound` unless the key is present.
    Replace,
}

#[derive(Debug)]
struct Pending {
    owner: u32,
    before: Image,
}

#[derive(Debug)]
struct TableState {
    entries: Vec<Entry>,
    stamp: Lsn,
    dirty: bool,
    generation: u64,
    pending: HashMap<Vec<u8>, Pending>,
}

impl TableState {
    fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    fn image(&self, key: &[u8]) -> Image {
        self.search(key).ok().map(|i| self.entries[i].dups.clone())
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }
}

/// A consistent copy of a table taken for persisting.
pub(crate) struct Snapshot {
    entries: Vec<Entry>,
    generation: u64,
}

/// One open database.
pub(crate) struct Table {
    name: String,
    path: PathBuf,
    flags: DbOpenFlags,
    dup_compare: RwLock<Option<DupCompare>>,
    state: RwLock<TableState>,
    removed: AtomicBool,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// An empty table that exists only in memory until first persisted.
    pub(crate) fn empty(name: &str, path: PathBuf, flags: DbOpenFlags) -> Self {
        Self {
            name: name.to_string(),
            path,
            flags: flags & DbOpenFlags::STRUCTURE,
            dup_compare: RwLock::new(None),
            state: RwLock::new(TableState {
                entries: Vec::new(),
                stamp: Lsn::ZERO,
                dirty: false,
                generation: 0,
                pending: HashMap::new(),
            }),
            removed: AtomicBool::new(false),
        }
    }

    /// Creates the table file right away.
    pub(crate) fn create(name: &str, path: PathBuf, flags: DbOpenFlags, stamp: Lsn) -> DbResult<Self> {
        let table = Self::empty(name, path, flags);
        let bytes = encode_image(table.flags, stamp, &[])?;
        write_atomically(&table.path, &bytes)?;
        table.state.write().stamp = stamp;
        Ok(table)
    }

    /// Loads a table file. The structure flags stored in the file win over
    /// the ones requested.
    pub(crate) fn load(name: &str, path: PathBuf, requested: DbOpenFlags) -> DbResult<Self> {
        let bytes = fs::read(&path)?;
        let (stored, stamp, entries) = decode_image(&bytes).map_err(|err| match err {
            DbError::Corrupted { message } => DbError::Corrupted {
                message: format!("{}: {message}", path.display()),
            },
            other => other,
        })?;
        if requested.intersects(DbOpenFlags::STRUCTURE) && (requested & DbOpenFlags::STRUCTURE) != stored {
            tracing::debug!(
                table = name,
                ?requested,
                ?stored,
                "open flags differ from stored structure; using stored"
            );
        }
        let table = Self::empty(name, path, stored);
        {
            let mut state = table.state.write();
            state.entries = entries;
            state.stamp = stamp;
        }
        Ok(table)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn flags(&self) -> DbOpenFlags {
        self.flags
    }

    pub(crate) fn is_dupsort(&self) -> bool {
        self.flags.contains(DbOpenFlags::DUPSORT)
    }

    /// Detaches the table from its file; later persists are skipped.
    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, AtomicOrdering::SeqCst);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn set_dup_compare(&self, compare: DupCompare) {
        *self.dup_compare.write() = Some(compare);
    }

    /// Log position the persisted image reflects.
    pub(crate) fn stamp(&self) -> Lsn {
        self.state.read().stamp
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Approximate bytes held in memory.
    pub(crate) fn footprint(&self) -> usize {
        let state = self.state.read();
        state
            .entries
            .iter()
            .map(|e| e.key.len() + e.dups.iter().map(Vec::len).sum::<usize>())
            .sum()
    }

    /// Number of key/data pairs.
    pub(crate) fn len(&self) -> u64 {
        let state = self.state.read();
        state.entries.iter().map(|e| e.dups.len() as u64).sum()
    }

    pub(crate) fn image(&self, key: &[u8]) -> Image {
        self.state.read().image(key)
    }

    /// Puts a key back into a given state; used by undo and recovery.
    pub(crate) fn restore(&self, key: &[u8], image: Image) {
        let mut state = self.state.write();
        match (state.search(key), image) {
            (Ok(i), Some(dups)) if !dups.is_empty() => state.entries[i].dups = dups,
            (Ok(i), _) => {
                state.entries.remove(i);
            }
            (Err(i), Some(dups)) if !dups.is_empty() => state.entries.insert(
                i,
                Entry {
                    key: key.to_vec(),
                    dups,
                },
            ),
            (Err(_), _) => return,
        }
        state.touch();
    }

    /// Stores `data` under `key`; returns the key's previous image.
    pub(crate) fn put(&self, key: &[u8], data: &[u8], mode: PutMode) -> DbResult<Image> {
        let mut state = self.state.write();
        let before = state.image(key);
        match state.search(key) {
            Ok(i) => {
                if mode == PutMode::NoOverwrite {
                    return Err(DbError::KeyExists);
                }
                if self.is_dupsort() {
                    let position = self.dup_position(&state.entries[i].dups, data);
                    match position {
                        Ok(_) if mode == PutMode::NoDupData => return Err(DbError::KeyExists),
                        Ok(_) => return Ok(before),
                        Err(at) => state.entries[i].dups.insert(at, data.to_vec()),
                    }
                } else {
                    state.entries[i].dups = vec![data.to_vec()];
                }
            }
            Err(i) => {
                if mode == PutMode::Replace {
                    return Err(DbError::NotFound);
                }
                state.entries.insert(
                    i,
                    Entry {
                        key: key.to_vec(),
                        dups: vec![data.to_vec()],
                    },
                );
            }
        }
        state.touch();
        Ok(before)
    }

    /// Removes a key with all its data items.
    pub(crate) fn delete(&self, key: &[u8]) -> DbResult<Image> {
        let mut state = self.state.write();
        let i = state.search(key).map_err(|_| DbError::NotFound)?;
        let removed = state.entries.remove(i);
        state.touch();
        Ok(Some(removed.dups))
    }

    /// Removes one key/data pair.
    pub(crate) fn delete_pair(&self, key: &[u8], data: &[u8]) -> DbResult<Image> {
        let mut state = self.state.write();
        let i = state.search(key).map_err(|_| DbError::NotFound)?;
        let before = Some(state.entries[i].dups.clone());
        let d = self
            .dup_position(&state.entries[i].dups, data)
            .map_err(|_| DbError::NotFound)?;
        state.entries[i].dups.remove(d);
        if state.entries[i].dups.is_empty() {
            state.entries.remove(i);
        }
        state.touch();
        Ok(before)
    }

    /// Remembers the committed image of a key about to be changed by an
    /// uncommitted transaction. Only the first call per key counts; returns
    /// whether this call recorded it.
    pub(crate) fn note_pending(&self, key: &[u8], owner: u32) -> bool {
        let mut state = self.state.write();
        if state.pending.contains_key(key) {
            return false;
        }
        let before = state.image(key);
        state.pending.insert(key.to_vec(), Pending { owner, before });
        true
    }

    /// Forgets the pending marker of a key once `owner` has resolved.
    pub(crate) fn resolve_pending(&self, key: &[u8], owner: u32) {
        let mut state = self.state.write();
        if state.pending.get(key).is_some_and(|p| p.owner == owner) {
            state.pending.remove(key);
            state.touch();
        }
    }

    /// Copies the committed contents if there is anything to write.
    pub(crate) fn snapshot(&self, force: bool) -> Option<Snapshot> {
        let state = self.state.read();
        if !state.dirty && !force {
            return None;
        }
        let mut entries = state.entries.clone();
        for (key, pending) in &state.pending {
            let at = entries.binary_search_by(|e| e.key.as_slice().cmp(key));
            match (at, &pending.before) {
                (Ok(i), Some(dups)) => entries[i].dups.clone_from(dups),
                (Ok(i), None) => {
                    entries.remove(i);
                }
                (Err(i), Some(dups)) => entries.insert(
                    i,
                    Entry {
                        key: key.clone(),
                        dups: dups.clone(),
                    },
                ),
                (Err(_), None) => {}
            }
        }
        Some(Snapshot {
            entries,
            generation: state.generation,
        })
    }

    /// Writes a snapshot to the table file, stamped with `stamp`.
    pub(crate) fn persist(&self, snapshot: Snapshot, stamp: Lsn) -> DbResult<()> {
        if self.is_removed() {
            return Ok(());
        }
        let bytes = encode_image(self.flags, stamp, &snapshot.entries)?;
        write_atomically(&self.path, &bytes)?;
        let mut state = self.state.write();
        state.stamp = stamp;
        // Pending keys were rolled back in the written image.
        state.dirty = state.generation != snapshot.generation || !state.pending.is_empty();
        Ok(())
    }

    fn dup_position(&self, dups: &[Vec<u8>], data: &[u8]) -> Result<usize, usize> {
        if !self.is_dupsort() {
            return if dups.first().is_some_and(|d| d.as_slice() == data) {
                Ok(0)
            } else {
                Err(dups.len())
            };
        }
        let compare = self.dup_compare.read();
        match compare.as_ref() {
            Some(cmp) => dups.binary_search_by(|d| cmp(d, data)),
            None => dups.binary_search_by(|d| d.as_slice().cmp(data)),
        }
    }

    pub(crate) fn first(&self) -> Option<Pair> {
        let state = self.state.read();
        state.entries.first().map(|e| pair(e, 0))
    }

    pub(crate) fn last(&self) -> Option<Pair> {
        let state = self.state.read();
        state.entries.last().map(|e| pair(e, e.dups.len() - 1))
    }

    /// First pair of `key`.
    pub(crate) fn seek(&self, key: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        state.search(key).ok().map(|i| pair(&state.entries[i], 0))
    }

    /// First pair whose key is at or after `key`.
    pub(crate) fn seek_range(&self, key: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        let i = state.search(key).unwrap_or_else(|i| i);
        state.entries.get(i).map(|e| pair(e, 0))
    }

    /// The exact pair, if stored.
    pub(crate) fn seek_both(&self, key: &[u8], data: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        let e = &state.entries[state.search(key).ok()?];
        self.dup_position(&e.dups, data).ok().map(|d| pair(e, d))
    }

    /// First pair of `key` whose data is at or after `data`.
    pub(crate) fn seek_both_range(&self, key: &[u8], data: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        let e = &state.entries[state.search(key).ok()?];
        let d = self.dup_position(&e.dups, data).unwrap_or_else(|d| d);
        (d < e.dups.len()).then(|| pair(e, d))
    }

    /// The pair following `(key, data)` in table order.
    pub(crate) fn after(&self, key: &[u8], data: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        match state.search(key) {
            Ok(i) => {
                let e = &state.entries[i];
                let next = match self.dup_position(&e.dups, data) {
                    Ok(d) => d + 1,
                    Err(d) => d,
                };
                if next < e.dups.len() {
                    return Some(pair(e, next));
                }
                state.entries.get(i + 1).map(|e| pair(e, 0))
            }
            Err(i) => state.entries.get(i).map(|e| pair(e, 0)),
        }
    }

    /// The pair preceding `(key, data)` in table order.
    pub(crate) fn before(&self, key: &[u8], data: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        let i = match state.search(key) {
            Ok(i) => {
                let e = &state.entries[i];
                let d = self.dup_position(&e.dups, data).unwrap_or_else(|d| d);
                if d > 0 {
                    return Some(pair(e, d - 1));
                }
                i
            }
            Err(i) => i,
        };
        i.checked_sub(1)
            .map(|p| &state.entries[p])
            .map(|e| pair(e, e.dups.len() - 1))
    }

    /// Next data item under the same key.
    pub(crate) fn next_dup(&self, key: &[u8], data: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        let e = &state.entries[state.search(key).ok()?];
        let next = match self.dup_position(&e.dups, data) {
            Ok(d) => d + 1,
            Err(d) => d,
        };
        (next < e.dups.len()).then(|| pair(e, next))
    }

    /// Previous data item under the same key.
    pub(crate) fn prev_dup(&self, key: &[u8], data: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        let e = &state.entries[state.search(key).ok()?];
        let d = self.dup_position(&e.dups, data).unwrap_or_else(|d| d);
        d.checked_sub(1).map(|p| pair(e, p))
    }

    /// First pair of the next key.
    pub(crate) fn next_key(&self, key: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        let i = match state.search(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        state.entries.get(i).map(|e| pair(e, 0))
    }

    /// Last pair of the previous key.
    pub(crate) fn prev_key(&self, key: &[u8]) -> Option<Pair> {
        let state = self.state.read();
        let i = state.search(key).unwrap_or_else(|i| i);
        i.checked_sub(1)
            .map(|p| &state.entries[p])
            .map(|e| pair(e, e.dups.len() - 1))
    }

    /// Number of data items under `key`.
    pub(crate) fn count(&self, key: &[u8]) -> usize {
        let state = self.state.read();
        state.search(key).map_or(0, |i| state.entries[i].dups.len())
    }

    /// The pair at 1-based position `recno`.
    pub(crate) fn at_recno(&self, recno: u32) -> Option<Pair> {
        let mut remaining = (recno as usize).checked_sub(1)?;
        let state = self.state.read();
        for e in &state.entries {
            if remaining < e.dups.len() {
                return Some(pair(e, remaining));
            }
            remaining -= e.dups.len();
        }
        None
    }

    /// 1-based position of a stored pair.
    pub(crate) fn recno_of(&self, key: &[u8], data: &[u8]) -> Option<u32> {
        let state = self.state.read();
        let i = state.search(key).ok()?;
        let d = self.dup_position(&state.entries[i].dups, data).ok()?;
        let before: usize = state.entries[..i].iter().map(|e| e.dups.len()).sum();
        u32::try_from(before + d + 1).ok()
    }
}

fn pair(entry: &Entry, dup: usize) -> Pair {
    (entry.key.clone(), entry.dups[dup].clone())
}

fn encode_image(flags: DbOpenFlags, stamp: Lsn, entries: &[Entry]) -> DbResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(TABLE_MAGIC);
    buf.extend_from_slice(&TABLE_VERSION.to_le_bytes());
    buf.extend_from_slice(&flags.bits().to_le_bytes());
    put_lsn(&mut buf, stamp);
    put_len(&mut buf, entries.len())?;
    for entry in entries {
        put_bytes(&mut buf, &entry.key)?;
        put_len(&mut buf, entry.dups.len())?;
        for dup in &entry.dups {
            put_bytes(&mut buf, dup)?;
        }
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn decode_image(bytes: &[u8]) -> DbResult<(DbOpenFlags, Lsn, Vec<Entry>)> {
    if bytes.len() < TABLE_MAGIC.len() + 2 + 4 || &bytes[..4] != TABLE_MAGIC {
        return Err(DbError::corrupted("not a table file"));
    }
    let (body, crc) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    if crc32fast::hash(body) != stored {
        return Err(DbError::corrupted("table checksum mismatch"));
    }

    let mut reader = PayloadReader::new(&body[4..]);
    let version = u16::from_le_bytes([reader.u8()?, reader.u8()?]);
    if version != TABLE_VERSION {
        return Err(DbError::VersionMismatch {
            message: format!("table format version {version}, expected {TABLE_VERSION}"),
        });
    }
    let flags = DbOpenFlags::from_bits_truncate(reader.u32()?);
    let stamp = reader.lsn()?;
    let count = reader.u32()?;
    let mut entries = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        let key = reader.bytes()?.to_vec();
        let ndups = reader.u32()?;
        if ndups == 0 {
            return Err(DbError::corrupted("table entry without data"));
        }
        let mut dups = Vec::with_capacity(ndups.min(1 << 16) as usize);
        for _ in 0..ndups {
            dups.push(reader.bytes()?.to_vec());
        }
        entries.push(Entry { key, dups });
    }
    if !reader.is_at_end() {
        return Err(DbError::corrupted("trailing bytes in table file"));
    }
    Ok((flags, stamp, entries))
}

/// Replaces `path` with `bytes` through a synced temporary file.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> DbResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut file = File::create(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)?;
    if let Some(parent) = path.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> DbResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> DbResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dup_table(dir: &Path) -> Table {
        Table::create("dups.db", dir.join("dups.db"), DbOpenFlags::DUPSORT, Lsn::ZERO).unwrap()
    }

    #[test]
    fn put_modes() {
        let dir = tempdir().unwrap();
        let table = Table::create("t.db", dir.path().join("t.db"), DbOpenFlags::empty(), Lsn::ZERO).unwrap();

        assert_eq!(table.put(b"a", b"1", PutMode::Overwrite).unwrap(), None);
        assert!(matches!(
            table.put(b"a", b"2", PutMode::NoOverwrite),
            Err(DbError::KeyExists)
        ));
        assert!(matches!(
            table.put(b"b", b"2", PutMode::Replace),
            Err(DbError::NotFound)
        ));
        assert_eq!(
            table.put(b"a", b"3", PutMode::Replace).unwrap(),
            Some(vec![b"1".to_vec()])
        );
        assert_eq!(table.seek(b"a").unwrap().1, b"3");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicates_stay_sorted() {
        let dir = tempdir().unwrap();
        let table = dup_table(dir.path());
        for data in [b"c", b"a", b"b"] {
            table.put(b"k", data, PutMode::Overwrite).unwrap();
        }
        assert!(matches!(
            table.put(b"k", b"b", PutMode::NoDupData),
            Err(DbError::KeyExists)
        ));
        assert_eq!(table.count(b"k"), 3);
        assert_eq!(table.first().unwrap().1, b"a");
        assert_eq!(table.next_dup(b"k", b"a").unwrap().1, b"b");
        assert_eq!(table.prev_dup(b"k", b"a"), None);
        assert_eq!(table.recno_of(b"k", b"c"), Some(3));
    }

    #[test]
    fn custom_dup_order() {
        let dir = tempdir().unwrap();
        let table = dup_table(dir.path());
        table.set_dup_compare(Arc::new(|a: &[u8], b: &[u8]| b.cmp(a)));
        for data in [b"1", b"3", b"2"] {
            table.put(b"k", data, PutMode::Overwrite).unwrap();
        }
        assert_eq!(table.first().unwrap().1, b"3");
        assert_eq!(table.last().unwrap().1, b"1");
    }

    #[test]
    fn navigation_across_keys() {
        let dir = tempdir().unwrap();
        let table = dup_table(dir.path());
        table.put(b"a", b"1", PutMode::Overwrite).unwrap();
        table.put(b"a", b"2", PutMode::Overwrite).unwrap();
        table.put(b"c", b"1", PutMode::Overwrite).unwrap();

        assert_eq!(table.after(b"a", b"2").unwrap(), (b"c".to_vec(), b"1".to_vec()));
        assert_eq!(table.before(b"c", b"1").unwrap(), (b"a".to_vec(), b"2".to_vec()));
        assert_eq!(table.after(b"b", b"").unwrap().0, b"c");
        assert_eq!(table.seek_range(b"b").unwrap().0, b"c");
        assert_eq!(table.next_key(b"a").unwrap().0, b"c");
        assert_eq!(table.prev_key(b"c").unwrap(), (b"a".to_vec(), b"2".to_vec()));
        assert_eq!(table.at_recno(3).unwrap().0, b"c");
        assert_eq!(table.at_recno(0), None);
        assert_eq!(table.seek_both_range(b"a", b"15").unwrap().1, b"2");
        assert_eq!(table.after(b"c", b"1"), None);
    }

    #[test]
    fn snapshot_rolls_back_pending_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let table = Table::create("t.db", path.clone(), DbOpenFlags::empty(), Lsn::ZERO).unwrap();
        table.put(b"committed", b"1", PutMode::Overwrite).unwrap();

        assert!(table.note_pending(b"open", 9));
        assert!(!table.note_pending(b"open", 9));
        table.put(b"open", b"2", PutMode::Overwrite).unwrap();

        let snapshot = table.snapshot(false).unwrap();
        table.persist(snapshot, Lsn::new(1, 40)).unwrap();
        assert!(table.is_dirty(), "pending key keeps the table dirty");
        assert!(table.snapshot(false).is_some());

        let reloaded = Table::load("t.db", path, DbOpenFlags::empty()).unwrap();
        assert!(reloaded.seek(b"committed").is_some());
        assert!(reloaded.seek(b"open").is_none());
        assert_eq!(reloaded.stamp(), Lsn::new(1, 40));
    }

    #[test]
    fn resolved_keys_let_the_table_come_clean() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let table = Table::create("t.db", path.clone(), DbOpenFlags::empty(), Lsn::ZERO).unwrap();
        assert!(table.note_pending(b"open", 4));
        table.put(b"open", b"1", PutMode::Overwrite).unwrap();
        table.persist(table.snapshot(false).unwrap(), Lsn::new(1, 10)).unwrap();
        assert!(table.is_dirty());

        table.resolve_pending(b"open", 4);
        table.persist(table.snapshot(false).unwrap(), Lsn::new(1, 20)).unwrap();
        assert!(!table.is_dirty());
        assert!(table.snapshot(false).is_none());

        let reloaded = Table::load("t.db", path, DbOpenFlags::empty()).unwrap();
        assert_eq!(reloaded.seek(b"open").unwrap().1, b"1");
    }

    #[test]
    fn persisted_flags_win() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dups.db");
        drop(dup_table(dir.path()));
        let table = Table::load("dups.db", path, DbOpenFlags::empty()).unwrap();
        assert!(table.is_dupsort());
    }

    #[test]
    fn corrupted_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        drop(Table::create("t.db", path.clone(), DbOpenFlags::empty(), Lsn::ZERO).unwrap());
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            Table::load("t.db", path, DbOpenFlags::empty()),
            Err(DbError::Corrupted { .. })
        ));
    }

    #[test]
    fn restore_applies_images() {
        let dir = tempdir().unwrap();
        let table = dup_table(dir.path());
        table.restore(b"k", Some(vec![b"x".to_vec(), b"y".to_vec()]));
        assert_eq!(table.count(b"k"), 2);
        table.restore(b"k", None);
        assert_eq!(table.count(b"k"), 0);
        assert!(table.is_dirty());
    }
}
