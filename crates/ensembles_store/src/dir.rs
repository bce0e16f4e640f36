//! Store directory layout.
//!
//! ```text
//! <root>/
//! ├─ LOCK            # Advisory lock, one process per store
//! ├─ metadata.cbor   # StoreMetadata, replaced atomically
//! ├─ events.log      # Append-only event log
//! ├─ data/           # Content-addressed data files
//! └─ transit/        # Staging area for cloud transfers
//! ```

use crate::error::{StoreError, StoreResult};
use crate::metadata::StoreMetadata;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const METADATA_FILE: &str = "metadata.cbor";
const METADATA_TEMP: &str = "metadata.cbor.tmp";
const LOG_FILE: &str = "events.log";
const DATA_DIR: &str = "data";
const TRANSIT_DIR: &str = "transit";

/// A locked store directory.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens the directory, creating it if missing, and takes the lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process holds the lock.
    pub fn open(path: &Path) -> StoreResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(StoreError::corrupted(format!(
                "store path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the event log.
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Directory of data files.
    pub fn data_dir(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    /// Staging directory for transfers.
    pub fn transit_dir(&self) -> PathBuf {
        self.path.join(TRANSIT_DIR)
    }

    /// Loads metadata, or `None` if the store was never prepared.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or decoded.
    pub fn load_metadata(&self) -> StoreResult<Option<StoreMetadata>> {
        let path = self.path.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.is_empty() {
            return Ok(None);
        }
        StoreMetadata::decode(&data).map(Some)
    }

    /// Writes metadata atomically: temp file, fsync, rename, directory fsync.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn save_metadata(&self, metadata: &StoreMetadata) -> StoreResult<()> {
        let temp_path = self.path.join(METADATA_TEMP);
        let data = metadata.encode()?;
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, self.path.join(METADATA_FILE))?;
        self.sync_directory()
    }

    /// Removes metadata, log, data files and transit files. The lock is kept.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn clear(&self) -> StoreResult<()> {
        for file in [METADATA_FILE, METADATA_TEMP, LOG_FILE] {
            let path = self.path.join(file);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        for dir in [self.data_dir(), self.transit_dir()] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        Ok(())
    }
}
