//! A directory on disk acting as the shared location.

use super::file_system::{join_remote, CloudFileSystem, CloudItem};
use crate::error::{CloudError, CloudResult};
use parking_lot::RwLock;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloud file system backed by a local directory, such as a folder a
/// desktop sync client mirrors.
#[derive(Debug)]
pub struct LocalCloudFileSystem {
    root: PathBuf,
    identity: RwLock<Option<String>>,
    connected: AtomicBool,
}

impl LocalCloudFileSystem {
    /// Creates a file system rooted at `root`, signed in as "local".
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            identity: RwLock::new(Some("local".to_string())),
            connected: AtomicBool::new(false),
        }
    }

    /// Sets the identity token.
    pub fn with_identity_token(self, token: Option<String>) -> Self {
        *self.identity.write() = token;
        self
    }

    /// Changes the identity token, as when the user switches accounts.
    pub fn set_identity_token(&self, token: Option<String>) {
        *self.identity.write() = token;
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local_path(&self, remote: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(remote.split('/').filter(|c| !c.is_empty() && *c != ".."));
        path
    }
}

fn map_not_found(err: io::Error, path: &str) -> CloudError {
    if err.kind() == io::ErrorKind::NotFound {
        CloudError::NotFound(path.to_string())
    } else {
        CloudError::Io(err)
    }
}

impl CloudFileSystem for LocalCloudFileSystem {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> CloudResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn identity_token(&self) -> CloudResult<Option<String>> {
        Ok(self.identity.read().clone())
    }

    async fn file_exists(&self, path: &str) -> CloudResult<bool> {
        Ok(tokio::fs::try_exists(self.local_path(path)).await?)
    }

    async fn create_directory(&self, path: &str) -> CloudResult<()> {
        tokio::fs::create_dir_all(self.local_path(path)).await?;
        Ok(())
    }

    async fn contents_of_directory(&self, path: &str) -> CloudResult<Vec<CloudItem>> {
        let mut entries = tokio::fs::read_dir(self.local_path(path))
            .await
            .map_err(|e| map_not_found(e, path))?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await?;
            items.push(CloudItem {
                path: join_remote(path, &name),
                name,
                is_directory: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn remove_item(&self, path: &str) -> CloudResult<()> {
        let local = self.local_path(path);
        let metadata = tokio::fs::metadata(&local)
            .await
            .map_err(|e| map_not_found(e, path))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&local).await?;
        } else {
            tokio::fs::remove_file(&local).await?;
        }
        Ok(())
    }

    async fn upload_local_file(&self, local: &Path, remote: &str) -> CloudResult<()> {
        let target = self.local_path(remote);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write next to the target and rename so readers never see a partial file.
        let staging = target.with_extension("uploading");
        tokio::fs::copy(local, &staging).await?;
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> CloudResult<()> {
        tokio::fs::copy(self.local_path(remote), local)
            .await
            .map_err(|e| map_not_found(e, remote))?;
        Ok(())
    }
}
