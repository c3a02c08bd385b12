//! File-based backend for log segments.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A log segment stored in a regular file.
///
/// `flush()` pushes data to the OS, `sync()` calls `File::sync_data()`.
/// Segments are append-only, so the cached size is the write position.
///
/// # Example
///
/// ```no_run
/// use dblayer_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut segment = FileBackend::create(Path::new("log.0000000001")).unwrap();
/// segment.append(b"record").unwrap();
/// segment.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    size: RwLock<u64>,
    read_only: bool,
}

impl FileBackend {
    /// Opens an existing segment or creates an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file, false)
    }

    /// Creates a new segment, failing if the file already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be created.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::from_file(path, file, false)
    }

    /// Opens an existing segment for reading only.
    ///
    /// Appends and truncation on the returned backend fail with
    /// [`StorageError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(path, file, true)
    }

    /// Opens or creates a segment, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    fn from_file(path: &Path, file: File, read_only: bool) -> StorageResult<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: RwLock::new(size),
            read_only,
        })
    }

    /// Returns the path to the segment file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut size = self.size.write();
        if data.is_empty() {
            return Ok(*size);
        }

        let mut file = self.file.lock();
        let offset = *size;
        file.seek(SeekFrom::Start(offset))?;
        if let Err(err) = file.write_all(data) {
            // A short write leaves garbage past the old end; drop it so the
            // next append starts at a record boundary.
            let _ = file.set_len(offset);
            return Err(err.into());
        }
        *size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_writable()?;
        let mut size = self.size.write();
        if new_size > *size {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot truncate segment of {} bytes to {new_size}", *size),
            )));
        }

        let file = self.file.lock();
        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn segment_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.0000000001");

        let mut segment = FileBackend::create(&path).unwrap();
        assert_eq!(segment.append(b"first").unwrap(), 0);
        assert_eq!(segment.append(b"second").unwrap(), 5);
        assert_eq!(segment.size().unwrap(), 11);
        assert_eq!(segment.read_at(5, 6).unwrap(), b"second");
        assert_eq!(segment.read_all().unwrap(), b"firstsecond");
    }

    #[test]
    fn create_refuses_existing_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.0000000001");
        FileBackend::create(&path).unwrap();

        assert!(FileBackend::create(&path).is_err());
        assert!(FileBackend::open(&path).is_ok());
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut segment = FileBackend::open(&dir.path().join("seg")).unwrap();
        segment.append(b"abc").unwrap();

        let result = segment.read_at(2, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn reopened_segment_keeps_synced_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.0000000003");
        {
            let mut segment = FileBackend::open(&path).unwrap();
            segment.append(b"durable").unwrap();
            segment.sync().unwrap();
        }

        let segment = FileBackend::open_read_only(&path).unwrap();
        assert_eq!(segment.size().unwrap(), 7);
        assert_eq!(segment.read_all().unwrap(), b"durable");
    }

    #[test]
    fn read_only_segment_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        FileBackend::open(&path).unwrap();

        let mut segment = FileBackend::open_read_only(&path).unwrap();
        assert!(matches!(segment.append(b"x"), Err(StorageError::Closed)));
        assert!(matches!(segment.truncate(0), Err(StorageError::Closed)));
    }

    #[test]
    fn truncate_drops_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let mut segment = FileBackend::open(&path).unwrap();
        segment.append(b"complete").unwrap();
        segment.append(b"torn").unwrap();

        segment.truncate(8).unwrap();
        assert_eq!(segment.size().unwrap(), 8);
        assert_eq!(segment.append(b"!").unwrap(), 8);
        assert!(segment.truncate(100).is_err());
    }

    #[test]
    fn create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("nested").join("log.0000000001");

        let segment = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(segment.size().unwrap(), 0);
        assert_eq!(segment.path(), path);
    }
}
