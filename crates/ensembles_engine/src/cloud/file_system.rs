//! The file transfer seam between peers.

use crate::error::CloudResult;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// An entry of a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudItem {
    /// Last path component.
    pub name: String,
    /// Full remote path.
    pub path: String,
    /// Whether the item is a directory.
    pub is_directory: bool,
    /// Size in bytes, for files.
    pub size: u64,
}

/// Joins remote path components with `/`.
pub fn join_remote(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// A shared location peers exchange event and data files through.
///
/// Remote paths are absolute and `/`-separated. Every operation is
/// asynchronous and reports success or failure; callers bound the waits.
pub trait CloudFileSystem: Send + Sync {
    /// Returns true if the file system is reachable.
    fn is_connected(&self) -> bool;

    /// Connects to the file system.
    fn connect(&self) -> impl Future<Output = CloudResult<()>> + Send;

    /// Identifies the account the files belong to. `None` means no
    /// account is signed in.
    fn identity_token(&self) -> impl Future<Output = CloudResult<Option<String>>> + Send;

    /// Returns true if an item exists at `path`.
    fn file_exists(&self, path: &str) -> impl Future<Output = CloudResult<bool>> + Send;

    /// Creates a directory, including missing parents.
    fn create_directory(&self, path: &str) -> impl Future<Output = CloudResult<()>> + Send;

    /// Lists the items of a directory.
    fn contents_of_directory(
        &self,
        path: &str,
    ) -> impl Future<Output = CloudResult<Vec<CloudItem>>> + Send;

    /// Removes a file or directory tree.
    fn remove_item(&self, path: &str) -> impl Future<Output = CloudResult<()>> + Send;

    /// Copies a local file to `remote`.
    fn upload_local_file(
        &self,
        local: &Path,
        remote: &str,
    ) -> impl Future<Output = CloudResult<()>> + Send;

    /// Copies `remote` to a local file.
    fn download_file(
        &self,
        remote: &str,
        local: &Path,
    ) -> impl Future<Output = CloudResult<()>> + Send;
}

impl<T: CloudFileSystem> CloudFileSystem for Arc<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn connect(&self) -> impl Future<Output = CloudResult<()>> + Send {
        (**self).connect()
    }

    fn identity_token(&self) -> impl Future<Output = CloudResult<Option<String>>> + Send {
        (**self).identity_token()
    }

    fn file_exists(&self, path: &str) -> impl Future<Output = CloudResult<bool>> + Send {
        (**self).file_exists(path)
    }

    fn create_directory(&self, path: &str) -> impl Future<Output = CloudResult<()>> + Send {
        (**self).create_directory(path)
    }

    fn contents_of_directory(
        &self,
        path: &str,
    ) -> impl Future<Output = CloudResult<Vec<CloudItem>>> + Send {
        (**self).contents_of_directory(path)
    }

    fn remove_item(&self, path: &str) -> impl Future<Output = CloudResult<()>> + Send {
        (**self).remove_item(path)
    }

    fn upload_local_file(
        &self,
        local: &Path,
        remote: &str,
    ) -> impl Future<Output = CloudResult<()>> + Send {
        (**self).upload_local_file(local, remote)
    }

    fn download_file(
        &self,
        remote: &str,
        local: &Path,
    ) -> impl Future<Output = CloudResult<()>> + Send {
        (**self).download_file(remote, local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths() {
        assert_eq!(join_remote("/ens", "events"), "/ens/events");
        assert_eq!(join_remote("/ens/", "/events"), "/ens/events");
    }
}
