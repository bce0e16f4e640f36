//! Content-addressed data files.
//!
//! Large attribute values are kept out of the event log. Each file is named
//! by the hex SHA-256 of its bytes, so identical payloads share one file and
//! a received file can be verified against its name.

use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Computes the data file name for some bytes.
pub fn data_file_name(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug)]
enum Backing {
    Memory(RwLock<BTreeMap<String, Vec<u8>>>),
    Directory(PathBuf),
}

/// The data file directory of one store.
#[derive(Debug)]
pub struct DataFileStore {
    backing: Backing,
}

impl DataFileStore {
    /// Creates an in-memory data file store.
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(RwLock::new(BTreeMap::new())),
        }
    }

    /// Creates a data file store in a directory.
    pub fn in_directory(path: impl Into<PathBuf>) -> Self {
        Self {
            backing: Backing::Directory(path.into()),
        }
    }

    /// Directory holding the files, for on-disk stores.
    pub fn directory(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Directory(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// Stores bytes and returns their file name.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn store(&self, bytes: &[u8]) -> StoreResult<String> {
        let name = data_file_name(bytes);
        self.write(&name, bytes)?;
        Ok(name)
    }

    /// Stores bytes received from elsewhere under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DataFileMismatch`] if the bytes do not hash to
    /// `name`.
    pub fn import(&self, name: &str, bytes: &[u8]) -> StoreResult<()> {
        let actual = data_file_name(bytes);
        if actual != name {
            return Err(StoreError::DataFileMismatch {
                name: name.to_string(),
                actual,
            });
        }
        self.write(name, bytes)
    }

    fn write(&self, name: &str, bytes: &[u8]) -> StoreResult<()> {
        match &self.backing {
            Backing::Memory(files) => {
                files.write().insert(name.to_string(), bytes.to_vec());
            }
            Backing::Directory(dir) => {
                let path = dir.join(name);
                if !path.exists() {
                    fs::create_dir_all(dir)?;
                    let temp = dir.join(format!("{name}.tmp"));
                    fs::write(&temp, bytes)?;
                    fs::rename(&temp, &path)?;
                }
            }
        }
        Ok(())
    }

    /// Reads a data file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DataFileNotFound`] if the file is missing.
    pub fn read(&self, name: &str) -> StoreResult<Vec<u8>> {
        match &self.backing {
            Backing::Memory(files) => files
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::DataFileNotFound(name.to_string())),
            Backing::Directory(dir) => {
                let path = dir.join(name);
                if !path.exists() {
                    return Err(StoreError::DataFileNotFound(name.to_string()));
                }
                Ok(fs::read(path)?)
            }
        }
    }

    /// Returns true if the file is present.
    pub fn contains(&self, name: &str) -> bool {
        match &self.backing {
            Backing::Memory(files) => files.read().contains_key(name),
            Backing::Directory(dir) => dir.join(name).is_file(),
        }
    }

    /// Names of all stored files.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be listed.
    pub fn names(&self) -> StoreResult<BTreeSet<String>> {
        match &self.backing {
            Backing::Memory(files) => Ok(files.read().keys().cloned().collect()),
            Backing::Directory(dir) => {
                let mut names = BTreeSet::new();
                if !dir.exists() {
                    return Ok(names);
                }
                for entry in fs::read_dir(dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str() {
                        if !name.ends_with(".tmp") {
                            names.insert(name.to_string());
                        }
                    }
                }
                Ok(names)
            }
        }
    }

    /// Removes a file. Missing files are ignored.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn remove(&self, name: &str) -> StoreResult<()> {
        match &self.backing {
            Backing::Memory(files) => {
                files.write().remove(name);
            }
            Backing::Directory(dir) => {
                let path = dir.join(name);
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }

    /// Removes every file not in `referenced`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn retain_only(&self, referenced: &BTreeSet<String>) -> StoreResult<usize> {
        let mut removed = 0;
        for name in self.names()? {
            if !referenced.contains(&name) {
                self.remove(&name)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes every file.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn clear(&self) -> StoreResult<()> {
        self.retain_only(&BTreeSet::new()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(files: &DataFileStore) {
        let name = files.store(b"large payload").unwrap();
        assert_eq!(name.len(), 64);
        assert!(files.contains(&name));
        assert_eq!(files.read(&name).unwrap(), b"large payload");
        assert_eq!(files.store(b"large payload").unwrap(), name);

        let other = files.store(b"other").unwrap();
        let removed = files
            .retain_only(&BTreeSet::from([name.clone()]))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!files.contains(&other));
        assert!(matches!(
            files.read(&other),
            Err(StoreError::DataFileNotFound(_))
        ));
    }

    #[test]
    fn memory_files() {
        exercise(&DataFileStore::in_memory());
    }

    #[test]
    fn directory_files() {
        let temp = TempDir::new().unwrap();
        exercise(&DataFileStore::in_directory(temp.path().join("data")));
    }

    #[test]
    fn import_verifies_hash() {
        let files = DataFileStore::in_memory();
        let name = data_file_name(b"abc");
        files.import(&name, b"abc").unwrap();
        assert!(matches!(
            files.import(&name, b"abd"),
            Err(StoreError::DataFileMismatch { .. })
        ));
    }
}
