//! In-memory cloud file system for tests.

use super::file_system::{join_remote, CloudFileSystem, CloudItem};
use crate::error::{CloudError, CloudResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(path: &str) -> Option<&str> {
    let (parent, _) = path.rsplit_once('/')?;
    Some(if parent.is_empty() { "/" } else { parent })
}

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<String, Vec<u8>>,
    directories: BTreeSet<String>,
}

impl Tree {
    fn create_directory(&mut self, path: &str) {
        let mut current = path;
        while current != "/" {
            self.directories.insert(current.to_string());
            match parent_of(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.files.contains_key(path) || self.directories.contains(path)
    }
}

/// Cloud file system held in memory.
///
/// Supports switching the identity token, simulated disconnection, a
/// number of injected failures, and an artificial latency for timeout
/// tests.
#[derive(Debug)]
pub struct MemoryCloudFileSystem {
    tree: Mutex<Tree>,
    identity: RwLock<Option<String>>,
    connected: AtomicBool,
    failures_remaining: AtomicU32,
    latency_millis: AtomicU64,
}

impl Default for MemoryCloudFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloudFileSystem {
    /// Creates an empty, connected file system signed in as "memory".
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Tree::default()),
            identity: RwLock::new(Some("memory".to_string())),
            connected: AtomicBool::new(true),
            failures_remaining: AtomicU32::new(0),
            latency_millis: AtomicU64::new(0),
        }
    }

    /// Changes the identity token.
    pub fn set_identity_token(&self, token: Option<String>) {
        *self.identity.write() = token;
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes the next `count` operations fail with a retryable error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delays every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_millis
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Paths of every file, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        self.tree.lock().files.keys().cloned().collect()
    }

    /// Contents of a file.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().files.get(&normalize(path)).cloned()
    }

    /// Writes a file directly, creating parent directories.
    pub fn write_file(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let path = normalize(path);
        let mut tree = self.tree.lock();
        if let Some(parent) = parent_of(&path) {
            tree.create_directory(parent);
        }
        tree.files.insert(path, bytes.into());
    }

    async fn begin(&self, operation: &str) -> CloudResult<()> {
        let latency = self.latency_millis.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_connected() {
            return Err(CloudError::NotConnected);
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CloudError::transport_retryable(format!(
                "injected failure during {operation}"
            )));
        }
        Ok(())
    }
}

impl CloudFileSystem for MemoryCloudFileSystem {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> CloudResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn identity_token(&self) -> CloudResult<Option<String>> {
        self.begin("identity").await?;
        Ok(self.identity.read().clone())
    }

    async fn file_exists(&self, path: &str) -> CloudResult<bool> {
        self.begin("exists").await?;
        Ok(self.tree.lock().exists(&normalize(path)))
    }

    async fn create_directory(&self, path: &str) -> CloudResult<()> {
        self.begin("create directory").await?;
        self.tree.lock().create_directory(&normalize(path));
        Ok(())
    }

    async fn contents_of_directory(&self, path: &str) -> CloudResult<Vec<CloudItem>> {
        self.begin("list").await?;
        let path = normalize(path);
        let tree = self.tree.lock();
        if !tree.directories.contains(&path) && path != "/" {
            return Err(CloudError::NotFound(path));
        }
        let files = tree
            .files
            .iter()
            .filter(|(p, _)| parent_of(p) == Some(path.as_str()))
            .map(|(p, bytes)| (p, false, bytes.len() as u64));
        let directories = tree
            .directories
            .iter()
            .filter(|p| parent_of(p) == Some(path.as_str()))
            .map(|p| (p, true, 0));
        let mut items: Vec<CloudItem> = files
            .chain(directories)
            .map(|(p, is_directory, size)| {
                let name = p.rsplit('/').next().unwrap_or_default().to_string();
                CloudItem {
                    path: join_remote(&path, &name),
                    name,
                    is_directory,
                    size,
                }
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn remove_item(&self, path: &str) -> CloudResult<()> {
        self.begin("remove").await?;
        let path = normalize(path);
        let mut tree = self.tree.lock();
        if !tree.exists(&path) {
            return Err(CloudError::NotFound(path));
        }
        let prefix = format!("{path}/");
        tree.files.retain(|p, _| *p != path && !p.starts_with(&prefix));
        tree.directories
            .retain(|p| *p != path && !p.starts_with(&prefix));
        Ok(())
    }

    async fn upload_local_file(&self, local: &Path, remote: &str) -> CloudResult<()> {
        self.begin("upload").await?;
        let bytes = tokio::fs::read(local).await?;
        self.write_file(remote, bytes);
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> CloudResult<()> {
        self.begin("download").await?;
        let bytes = self
            .read_file(remote)
            .ok_or_else(|| CloudError::NotFound(remote.to_string()))?;
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }
}
