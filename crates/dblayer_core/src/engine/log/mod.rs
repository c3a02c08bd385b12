//! The transaction log.
//!
//! Records are appended to numbered segments (`log.0000000001`, ...) in the
//! log directory. A position in the log is an [`Lsn`]: segment number plus
//! byte offset. When appending a record would push a segment past the
//! configured maximum size, the log rotates to the next number.
//!
//! Appends go to an in-memory buffer that is written out when it fills, on
//! rotation, and on every flush. Commit records are either flushed with an
//! fsync (durable) or only handed to the operating system (`WRITE_NOSYNC`).

pub mod record;
pub(crate) mod reader;

pub use record::{LogOp, LogRecord, LogRecordType};

use crate::error::{DbError, DbResult};
use dblayer_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use reader::SegmentReader;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Log sequence number: a position in the transaction log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
    /// Segment number.
    pub file: u32,
    /// Byte offset inside the segment.
    pub offset: u32,
}

impl Lsn {
    /// The position before any log record. Data files stamped with it are
    /// not tied to a log.
    pub const ZERO: Self = Self { file: 0, offset: 0 };

    /// Creates an LSN.
    #[must_use]
    pub const fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    /// True for [`Lsn::ZERO`].
    #[must_use]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.file, self.offset)
    }
}

/// File name prefix of log segments.
pub const LOG_FILE_PREFIX: &str = "log.";

/// Name of segment `number`.
#[must_use]
pub fn log_file_name(number: u32) -> String {
    format!("{LOG_FILE_PREFIX}{number:010}")
}

/// Segment number encoded in `name`, if it names a segment.
#[must_use]
pub fn parse_log_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(LOG_FILE_PREFIX)?;
    if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Where segments live.
///
/// The environment uses [`FileSegments`]; tests can swap in
/// [`MemorySegments`] to run without a disk or to simulate a full one.
pub trait SegmentStore: Send + Sync + fmt::Debug {
    /// Numbers of the existing segments, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    fn list(&self) -> DbResult<Vec<u32>>;

    /// Opens segment `number`, creating it when `create` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is missing (and `create` is unset)
    /// or cannot be opened.
    fn open(&self, number: u32, create: bool) -> DbResult<Box<dyn StorageBackend>>;

    /// Path of segment `number`.
    fn path(&self, number: u32) -> PathBuf;
}

/// Segments stored as files in one directory.
#[derive(Debug, Clone)]
pub struct FileSegments {
    dir: PathBuf,
}

impl FileSegments {
    /// Segments under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Lists segment numbers found in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list_dir(dir: &Path) -> DbResult<Vec<u32>> {
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(number) = entry.file_name().to_str().and_then(parse_log_file_name) {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }
}

impl SegmentStore for FileSegments {
    fn list(&self) -> DbResult<Vec<u32>> {
        Self::list_dir(&self.dir)
    }

    fn open(&self, number: u32, create: bool) -> DbResult<Box<dyn StorageBackend>> {
        let path = self.path(number);
        let backend = if create {
            FileBackend::open(&path)?
        } else if path.exists() {
            FileBackend::open_read_only(&path)?
        } else {
            return Err(DbError::directory(path, "log segment does not exist"));
        };
        Ok(Box::new(backend))
    }

    fn path(&self, number: u32) -> PathBuf {
        self.dir.join(log_file_name(number))
    }
}

/// Segments kept in memory.
#[derive(Debug, Default)]
pub struct MemorySegments {
    segments: Mutex<BTreeMap<u32, InMemoryBackend>>,
    full: AtomicBool,
}

impl MemorySegments {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every append fail as if the disk were full, or lifts that.
    pub fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
        for segment in self.segments.lock().values() {
            let limit = if full { segment.size().ok() } else { None };
            segment.set_capacity_limit(limit);
        }
    }
}

impl SegmentStore for MemorySegments {
    fn list(&self) -> DbResult<Vec<u32>> {
        Ok(self.segments.lock().keys().copied().collect())
    }

    fn open(&self, number: u32, create: bool) -> DbResult<Box<dyn StorageBackend>> {
        let mut segments = self.segments.lock();
        if let Some(segment) = segments.get(&number) {
            return Ok(Box::new(segment.clone()));
        }
        if !create {
            return Err(DbError::directory(self.path(number), "log segment does not exist"));
        }
        let segment = if self.full.load(Ordering::SeqCst) {
            InMemoryBackend::with_capacity_limit(0)
        } else {
            InMemoryBackend::new()
        };
        segments.insert(number, segment.clone());
        Ok(Box::new(segment))
    }

    fn path(&self, number: u32) -> PathBuf {
        PathBuf::from(log_file_name(number))
    }
}

struct LogState {
    file: u32,
    segment: Box<dyn StorageBackend>,
    /// Bytes of the current segment already handed to the backend.
    written: u32,
    buffer: Vec<u8>,
}

impl LogState {
    fn end(&self) -> Lsn {
        Lsn::new(self.file, self.written + self.buffer.len() as u32)
    }
}

/// Appends and reads transaction log records.
pub(crate) struct LogManager {
    store: Arc<dyn SegmentStore>,
    max_file_size: u32,
    buffer_size: usize,
    state: Mutex<LogState>,
}

impl fmt::Debug for LogManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogManager")
            .field("store", &self.store)
            .field("max_file_size", &self.max_file_size)
            .finish_non_exhaustive()
    }
}

impl LogManager {
    /// Opens the newest segment for appending, creating segment 1 in an
    /// empty store. A torn record at the end of the newest segment is cut off.
    pub(crate) fn open(
        store: Arc<dyn SegmentStore>,
        max_file_size: u32,
        buffer_size: usize,
    ) -> DbResult<Self> {
        let files = store.list()?;
        let (file, mut segment) = match files.last() {
            Some(&number) => (number, store.open(number, true)?),
            None => (1, store.open(1, true)?),
        };

        let mut reader = SegmentReader::new(segment.as_ref(), 0)?;
        for _ in reader.by_ref() {}
        if reader.is_torn() {
            tracing::warn!(
                segment = %log_file_name(file),
                valid_end = reader.valid_end(),
                len = reader.len(),
                "truncating torn record at end of log"
            );
            segment.truncate(u64::from(reader.valid_end()))?;
        }
        let written = u32::try_from(segment.size()?)
            .map_err(|_| DbError::corrupted("log segment larger than 4 GiB"))?;

        Ok(Self {
            store,
            max_file_size: max_file_size.max(1),
            buffer_size,
            state: Mutex::new(LogState {
                file,
                segment,
                written,
                buffer: Vec::with_capacity(buffer_size),
            }),
        })
    }

    /// Position where the next record will be written.
    pub(crate) fn current_lsn(&self) -> Lsn {
        self.state.lock().end()
    }

    /// Number of the segment being appended to.
    pub(crate) fn current_file(&self) -> u32 {
        self.state.lock().file
    }

    /// Existing segment numbers, ascending.
    pub(crate) fn files(&self) -> DbResult<Vec<u32>> {
        self.store.list()
    }

    /// Path of segment `number`.
    pub(crate) fn path(&self, number: u32) -> PathBuf {
        self.store.path(number)
    }

    /// Buffers a record; returns its position.
    ///
    /// The buffer is written to the segment once it fills. If that write
    /// fails, the record is dropped again and the error returned.
    pub(crate) fn put(&self, record: &LogRecord) -> DbResult<Lsn> {
        let bytes = record.encode()?;
        let mut state = self.state.lock();
        let lsn = self.append_locked(&mut state, &bytes)?;
        if state.buffer.len() >= self.buffer_size {
            if let Err(err) = Self::write_locked(&mut state) {
                Self::discard_locked(&mut state, lsn);
                return Err(err);
            }
        }
        Ok(lsn)
    }

    /// Appends a record and writes it out, with an fsync when `sync` is set.
    ///
    /// On failure nothing of this record remains in the log.
    pub(crate) fn put_and_flush(&self, record: &LogRecord, sync: bool) -> DbResult<Lsn> {
        let bytes = record.encode()?;
        let mut state = self.state.lock();
        let lsn = self.append_locked(&mut state, &bytes)?;
        let result = Self::write_locked(&mut state).and_then(|()| {
            if sync {
                state.segment.sync()?;
            }
            Ok(())
        });
        if let Err(err) = result {
            Self::discard_locked(&mut state, lsn);
            return Err(err);
        }
        Ok(lsn)
    }

    /// Writes buffered records out, with an fsync when `sync` is set.
    pub(crate) fn flush(&self, sync: bool) -> DbResult<()> {
        let mut state = self.state.lock();
        Self::write_locked(&mut state)?;
        if sync {
            state.segment.sync()?;
        }
        Ok(())
    }

    /// Calls `visit` for every record from `from` onwards and returns the
    /// position just past the last intact record.
    pub(crate) fn scan<F>(&self, from: Lsn, mut visit: F) -> DbResult<Lsn>
    where
        F: FnMut(Lsn, &LogRecord) -> DbResult<()>,
    {
        let end = {
            let mut state = self.state.lock();
            Self::write_locked(&mut state)?;
            state.end()
        };
        let mut last = from;
        for number in self.store.list()? {
            if number < from.file || number > end.file {
                continue;
            }
            let segment = self.store.open(number, false)?;
            let start = if number == from.file { from.offset } else { 0 };
            let mut reader = SegmentReader::new(segment.as_ref(), start)?;
            for (offset, record) in reader.by_ref() {
                visit(Lsn::new(number, offset), &record)?;
            }
            last = Lsn::new(number, reader.valid_end());
        }
        Ok(last)
    }

    fn append_locked(&self, state: &mut LogState, bytes: &[u8]) -> DbResult<Lsn> {
        let end = u64::from(state.written) + state.buffer.len() as u64;
        if end > 0 && end + bytes.len() as u64 > u64::from(self.max_file_size) {
            self.rotate_locked(state)?;
        }
        let lsn = state.end();
        state.buffer.extend_from_slice(bytes);
        Ok(lsn)
    }

    fn write_locked(state: &mut LogState) -> DbResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        state.segment.append(&state.buffer)?;
        state.written += state.buffer.len() as u32;
        state.buffer.clear();
        Ok(())
    }

    /// Removes the record at `lsn` and anything after it.
    fn discard_locked(state: &mut LogState, lsn: Lsn) {
        if state.file != lsn.file {
            return;
        }
        if lsn.offset >= state.written {
            state.buffer.truncate((lsn.offset - state.written) as usize);
        } else if state.segment.truncate(u64::from(lsn.offset)).is_ok() {
            state.written = lsn.offset;
            state.buffer.clear();
        }
    }

    fn rotate_locked(&self, state: &mut LogState) -> DbResult<()> {
        Self::write_locked(state)?;
        state.segment.sync()?;
        let next = state.file + 1;
        let segment = self.store.open(next, true)?;
        tracing::debug!(segment = %log_file_name(next), "switching to new log file");
        state.file = next;
        state.segment = segment;
        state.written = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remove(db: &str) -> LogRecord {
        LogRecord::DbRemove { db: db.into() }
    }

    fn memory_log(max: u32) -> (Arc<MemorySegments>, LogManager) {
        let store = Arc::new(MemorySegments::new());
        let log = LogManager::open(store.clone(), max, 64).unwrap();
        (store, log)
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(log_file_name(12), "log.0000000012");
        assert_eq!(parse_log_file_name("log.0000000012"), Some(12));
        assert_eq!(parse_log_file_name("log.12"), None);
        assert_eq!(parse_log_file_name("log.0000000012.old"), None);
    }

    #[test]
    fn lsns_increase_and_scan_sees_all() {
        let (_store, log) = memory_log(1 << 20);
        let a = log.put(&remove("a.db")).unwrap();
        let b = log.put_and_flush(&remove("b.db"), true).unwrap();
        assert!(b > a);

        let mut seen = Vec::new();
        let end = log
            .scan(Lsn::new(1, 0), |lsn, record| {
                seen.push((lsn, record.clone()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, b);
        assert_eq!(end, log.current_lsn());
    }

    #[test]
    fn rotates_past_max_file_size() {
        let (store, log) = memory_log(64);
        for i in 0..10 {
            log.put(&remove(&format!("db{i}.db"))).unwrap();
        }
        log.flush(true).unwrap();
        assert!(store.list().unwrap().len() > 1);
        assert_eq!(log.current_file(), *store.list().unwrap().last().unwrap());

        let mut count = 0;
        log.scan(Lsn::new(1, 0), |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 10);
    }

    #[test]
    fn failed_flush_leaves_no_trace() {
        let (store, log) = memory_log(1 << 20);
        log.put_and_flush(&remove("kept.db"), true).unwrap();
        let before = log.current_lsn();

        store.set_full(true);
        let err = log.put_and_flush(&remove("lost.db"), true).unwrap_err();
        assert!(err.is_disk_full());
        assert_eq!(log.current_lsn(), before);

        store.set_full(false);
        let mut names = Vec::new();
        log.scan(Lsn::new(1, 0), |_, record| {
            if let LogRecord::DbRemove { db } = record {
                names.push(db.clone());
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(names, vec!["kept.db".to_string()]);
    }

    #[test]
    fn reopen_truncates_torn_tail() {
        let store = Arc::new(MemorySegments::new());
        {
            let log = LogManager::open(store.clone(), 1 << 20, 64).unwrap();
            log.put_and_flush(&remove("a.db"), true).unwrap();
        }
        let mut segment = store.open(1, false).unwrap();
        let good = segment.size().unwrap();
        segment.append(b"DBLG\x01\x00garbage").unwrap();

        let log = LogManager::open(store.clone(), 1 << 20, 64).unwrap();
        assert_eq!(u64::from(log.current_lsn().offset), good);
    }
}
