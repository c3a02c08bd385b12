//! In-memory backend for tests.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An in-memory log segment.
///
/// Clones share the same bytes and the same capacity limit, so a test can
/// keep a handle to a segment it gave away and inspect or constrain it.
/// When a limit is set, an append that would cross it fails with
/// [`StorageError::DiskFull`], just like a write to a full volume.
///
/// # Example
///
/// ```rust
/// use dblayer_storage::{InMemoryBackend, StorageBackend};
///
/// let mut segment = InMemoryBackend::with_capacity_limit(4);
/// assert!(segment.append(b"abcd").is_ok());
/// assert!(segment.append(b"e").unwrap_err().is_disk_full());
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    limit: Arc<AtomicU64>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            data: Arc::new(RwLock::new(Vec::new())),
            limit: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }
}

impl InMemoryBackend {
    /// Creates a new empty segment with no capacity limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a segment holding pre-existing bytes.
    ///
    /// Useful for feeding recovery a hand-crafted or torn log.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let backend = Self::default();
        *backend.data.write() = data;
        backend
    }

    /// Creates an empty segment that reports a full disk past `limit` bytes.
    #[must_use]
    pub fn with_capacity_limit(limit: u64) -> Self {
        let backend = Self::default();
        backend.set_capacity_limit(Some(limit));
        backend
    }

    /// Changes the capacity limit; `None` removes it.
    pub fn set_capacity_limit(&self, limit: Option<u64>) {
        self.limit.store(limit.unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Returns a copy of all bytes in the segment.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(len);
        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        let limit = self.limit.load(Ordering::SeqCst);
        if offset.saturating_add(new_data.len() as u64) > limit {
            return Err(StorageError::DiskFull(io::Error::new(
                io::ErrorKind::StorageFull,
                format!("segment capacity of {limit} bytes exhausted"),
            )));
        }
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let current = data.len() as u64;
        if new_size > current {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot truncate segment of {current} bytes to {new_size}"),
            )));
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clones_share_bytes() {
        let mut writer = InMemoryBackend::new();
        let observer = writer.clone();
        writer.append(b"shared").unwrap();
        assert_eq!(observer.data(), b"shared");
    }

    #[test]
    fn capacity_limit_reports_disk_full() {
        let mut segment = InMemoryBackend::with_capacity_limit(8);
        segment.append(b"12345678").unwrap();

        let err = segment.append(b"9").unwrap_err();
        assert!(err.is_disk_full());
        assert_eq!(segment.size().unwrap(), 8);

        segment.set_capacity_limit(None);
        assert_eq!(segment.append(b"9").unwrap(), 8);
    }

    #[test]
    fn limit_set_through_clone_applies() {
        let mut segment = InMemoryBackend::new();
        let control = segment.clone();
        control.set_capacity_limit(Some(0));
        assert!(segment.append(b"x").unwrap_err().is_disk_full());
    }

    #[test]
    fn truncate_and_read_past_end() {
        let mut segment = InMemoryBackend::with_data(b"abcdef".to_vec());
        segment.truncate(3).unwrap();
        assert_eq!(segment.read_all().unwrap(), b"abc");
        assert!(matches!(
            segment.read_at(2, 2),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(segment.truncate(10).is_err());
    }

    proptest! {
        #[test]
        fn appends_are_contiguous(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..16)) {
            let mut segment = InMemoryBackend::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                let offset = segment.append(chunk).unwrap();
                prop_assert_eq!(offset, expected.len() as u64);
                expected.extend_from_slice(chunk);
            }
            prop_assert_eq!(segment.read_all().unwrap(), expected);
        }
    }
}
