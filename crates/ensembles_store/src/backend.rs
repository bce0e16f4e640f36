//! Byte storage underneath the event log.

use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Append-only byte storage for the event log.
///
/// Implementations must be safe to share across threads. All mutation
/// goes through `&mut self`, so the log is single-writer.
pub trait LogBackend: Send + Sync {
    /// Reads the whole log.
    fn read_all(&self) -> StoreResult<Vec<u8>>;

    /// Appends bytes and returns the offset they were written at.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Pushes buffered writes to the OS, and to disk when `sync` is set.
    fn flush(&mut self, sync: bool) -> StoreResult<()>;

    /// Current size in bytes.
    fn size(&self) -> u64;

    /// Drops everything after `len` bytes.
    fn truncate(&mut self, len: u64) -> StoreResult<()>;

    /// Replaces the whole content.
    fn replace(&mut self, data: &[u8]) -> StoreResult<()>;
}

/// In-memory log backend, used for stores without a root directory.
#[derive(Debug, Default)]
pub struct MemoryLogBackend {
    data: RwLock<Vec<u8>>,
}

impl MemoryLogBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogBackend for MemoryLogBackend {
    fn read_all(&self) -> StoreResult<Vec<u8>> {
        Ok(self.data.read().clone())
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let mut buf = self.data.write();
        let offset = buf.len() as u64;
        buf.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self, _sync: bool) -> StoreResult<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        self.data.write().truncate(len as usize);
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StoreResult<()> {
        *self.data.write() = data.to_vec();
        Ok(())
    }
}

/// File-backed log.
///
/// `flush(true)` calls `File::sync_all()`. Replacing the content writes a
/// sibling temp file and renames it over the log.
#[derive(Debug)]
pub struct FileLogBackend {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileLogBackend {
    /// Opens or creates the log file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogBackend for FileLogBackend {
    fn read_all(&self) -> StoreResult<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let mut data = Vec::with_capacity(self.size as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let offset = self.size;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self, sync: bool) -> StoreResult<()> {
        self.file.flush()?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        if len > self.size {
            return Err(StoreError::corrupted(format!(
                "cannot truncate log of {} bytes to {len}",
                self.size
            )));
        }
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.size = len;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StoreResult<()> {
        let temp_path = self.path.with_extension("compact");
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(data)?;
            temp.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.size = data.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(backend: &mut dyn LogBackend) {
        assert_eq!(backend.append(b"abc").unwrap(), 0);
        assert_eq!(backend.append(b"defg").unwrap(), 3);
        backend.flush(true).unwrap();
        assert_eq!(backend.size(), 7);
        assert_eq!(backend.read_all().unwrap(), b"abcdefg");

        backend.truncate(5).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"abcde");

        backend.replace(b"xy").unwrap();
        assert_eq!(backend.size(), 2);
        assert_eq!(backend.append(b"z").unwrap(), 2);
        assert_eq!(backend.read_all().unwrap(), b"xyz");
    }

    #[test]
    fn memory_backend() {
        exercise(&mut MemoryLogBackend::new());
    }

    #[test]
    fn file_backend() {
        let dir = TempDir::new().unwrap();
        let mut backend = FileLogBackend::open(&dir.path().join("events.log")).unwrap();
        exercise(&mut backend);
    }

    #[test]
    fn file_backend_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.log");
        {
            let mut backend = FileLogBackend::open(&path).unwrap();
            backend.append(b"durable").unwrap();
            backend.flush(true).unwrap();
        }
        let backend = FileLogBackend::open(&path).unwrap();
        assert_eq!(backend.size(), 7);
        assert_eq!(backend.read_all().unwrap(), b"durable");
    }
}
