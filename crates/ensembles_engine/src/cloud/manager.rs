//! Moving event and data files between the event store and the cloud.
//!
//! The remote layout under the ensemble directory:
//!
//! ```text
//! /<ensemble>/events/     save and merge event files
//! /<ensemble>/baselines/  baseline event files
//! /<ensemble>/data/       data files, named by content hash
//! /<ensemble>/stores/     one registration file per leeched store
//! ```

use super::file_system::{join_remote, CloudFileSystem, CloudItem};
use crate::config::EnsembleConfig;
use crate::error::{CloudError, CloudResult, EnsembleError, EnsembleResult};
use ensembles_model::{
    decode_event, encode_event, EventFileKind, EventFileName, StoreModificationEvent,
};
use ensembles_store::{EventStore, StoreError};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const EVENTS_DIR: &str = "events";
const BASELINES_DIR: &str = "baselines";
const DATA_DIR: &str = "data";
const STORES_DIR: &str = "stores";

/// Imports and exports files for one event store.
pub struct CloudManager<'a, C: CloudFileSystem> {
    store: &'a EventStore,
    cloud: &'a C,
    timeout: Duration,
    root: String,
    /// Remote baseline files present at the last import.
    seen_baselines: Mutex<BTreeSet<String>>,
}

impl<'a, C: CloudFileSystem> CloudManager<'a, C> {
    /// Creates a manager.
    pub fn new(store: &'a EventStore, cloud: &'a C, config: &EnsembleConfig) -> Self {
        Self {
            store,
            cloud,
            timeout: config.transfer_timeout,
            root: format!("/{}", store.ensemble_id()),
            seen_baselines: Mutex::new(BTreeSet::new()),
        }
    }

    /// Remote ensemble directory.
    pub fn remote_root(&self) -> &str {
        &self.root
    }

    fn remote_dir(&self, name: &str) -> String {
        join_remote(&self.root, name)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        future: impl Future<Output = CloudResult<T>>,
    ) -> EnsembleResult<T> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(operation, timeout = ?self.timeout, "cloud operation timed out");
                Err(CloudError::Timeout {
                    operation: operation.to_string(),
                }
                .into())
            }
        }
    }

    async fn list(&self, dir: &str) -> EnsembleResult<Vec<CloudItem>> {
        match self
            .bounded("list directory", self.cloud.contents_of_directory(dir))
            .await
        {
            Ok(items) => Ok(items.into_iter().filter(|i| !i.is_directory).collect()),
            Err(EnsembleError::Cloud(CloudError::NotFound(_))) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn transit_path(&self) -> EnsembleResult<PathBuf> {
        let dir = match self.store.transit_dir() {
            Some(dir) => dir,
            None => std::env::temp_dir()
                .join("ensembles-transit")
                .join(self.store.persistent_store_id()?),
        };
        tokio::fs::create_dir_all(&dir).await.map_err(CloudError::Io)?;
        Ok(dir.join(uuid::Uuid::new_v4().to_string()))
    }

    async fn discard_transit_file(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %e, "could not remove transit file");
        }
    }

    async fn upload_bytes(&self, bytes: &[u8], remote: &str) -> EnsembleResult<()> {
        let local = self.transit_path().await?;
        tokio::fs::write(&local, bytes).await.map_err(CloudError::Io)?;
        let result = self
            .bounded("upload", self.cloud.upload_local_file(&local, remote))
            .await;
        Self::discard_transit_file(&local).await;
        result
    }

    async fn download_bytes(&self, remote: &str) -> EnsembleResult<Vec<u8>> {
        let local = self.transit_path().await?;
        let result = self
            .bounded("download", self.cloud.download_file(remote, &local))
            .await;
        let bytes = match result {
            Ok(()) => tokio::fs::read(&local)
                .await
                .map_err(|e| EnsembleError::from(CloudError::Io(e))),
            Err(e) => Err(e),
        };
        Self::discard_transit_file(&local).await;
        bytes
    }

    /// Connects the cloud file system if needed.
    ///
    /// # Errors
    ///
    /// Fails if the connection cannot be made in time.
    pub async fn ensure_connected(&self) -> EnsembleResult<()> {
        if self.cloud.is_connected() {
            return Ok(());
        }
        self.bounded("connect", self.cloud.connect()).await
    }

    /// Checks that the cloud account has not changed since leeching. The
    /// first check records the token.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::CloudIdentityChanged`] if it has.
    pub async fn check_identity(&self) -> EnsembleResult<()> {
        let current = self
            .bounded("identity token", self.cloud.identity_token())
            .await?;
        match self.store.identity_token()? {
            None => {
                self.store.set_identity_token(current)?;
                self.store.flush()?;
                Ok(())
            }
            Some(stored) if current.as_deref() == Some(stored.as_str()) => Ok(()),
            Some(_) => {
                warn!(ensemble = %self.store.ensemble_id(), "cloud identity changed");
                Err(EnsembleError::CloudIdentityChanged)
            }
        }
    }

    /// Creates the ensemble directories that do not exist yet.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors.
    pub async fn create_remote_directory_structure(&self) -> EnsembleResult<()> {
        let mut dirs = vec![self.root.clone()];
        dirs.extend(
            [EVENTS_DIR, BASELINES_DIR, DATA_DIR, STORES_DIR]
                .iter()
                .map(|d| self.remote_dir(d)),
        );
        for dir in dirs {
            if !self.bounded("exists", self.cloud.file_exists(&dir)).await? {
                self.bounded("create directory", self.cloud.create_directory(&dir))
                    .await?;
                debug!(dir = %dir, "created remote directory");
            }
        }
        Ok(())
    }

    /// Uploads the registration file of the local store.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors.
    pub async fn register_local_store(&self) -> EnsembleResult<()> {
        let store_id = self.store.persistent_store_id()?;
        let path = join_remote(&self.remote_dir(STORES_DIR), &store_id);
        self.upload_bytes(store_id.as_bytes(), &path).await
    }

    /// Removes the registration file of the local store, if present.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors other than a missing file.
    pub async fn unregister_local_store(&self) -> EnsembleResult<()> {
        let store_id = self.store.persistent_store_id()?;
        let path = join_remote(&self.remote_dir(STORES_DIR), &store_id);
        match self.bounded("remove", self.cloud.remove_item(&path)).await {
            Ok(()) | Err(EnsembleError::Cloud(CloudError::NotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Identifiers of every registered store.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors.
    pub async fn registered_store_ids(&self) -> EnsembleResult<BTreeSet<String>> {
        Ok(self
            .list(&self.remote_dir(STORES_DIR))
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect())
    }

    fn already_held(&self, name: &EventFileName, local: &str) -> bool {
        let covered = self
            .store
            .current_baseline()
            .map(|b| b.revision_set())
            .unwrap_or_default();
        match (name.kind, name.revision_number, &name.unique_identifier) {
            (EventFileKind::Event, Some(revision), _) => {
                name.store_id == local
                    || revision <= covered.revision_number_for_store(&name.store_id)
                    || self.store.contains_revision(&name.store_id, revision)
            }
            (EventFileKind::Baseline, _, Some(id)) => self.store.contains_event(id),
            _ => true,
        }
    }

    fn is_superseded_baseline(&self, event: &StoreModificationEvent) -> bool {
        self.store.current_baseline().is_some_and(|current| {
            current.unique_identifier != event.unique_identifier
                && event.revision_set().is_covered_by(&current.revision_set())
        })
    }

    /// Downloads event files the store does not hold and adds them.
    ///
    /// Imported events are registered as mandatory incomplete events until
    /// the whole batch is in, so merges wait for it and a crash midway
    /// drops the partial batch. Returns the number of events imported.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors or undecodable files.
    pub async fn import_new_remote_events(&self) -> EnsembleResult<usize> {
        let local = self.store.persistent_store_id()?;
        let mut wanted = Vec::new();
        let mut baselines_seen = BTreeSet::new();
        for (kind, dir) in [
            (EventFileKind::Baseline, self.remote_dir(BASELINES_DIR)),
            (EventFileKind::Event, self.remote_dir(EVENTS_DIR)),
        ] {
            for item in self.list(&dir).await? {
                let name = match EventFileName::parse(kind, &item.name) {
                    Ok(name) => name,
                    Err(e) => {
                        warn!(file = %item.path, error = %e, "skipping unrecognised remote file");
                        continue;
                    }
                };
                if kind == EventFileKind::Baseline {
                    baselines_seen.insert(item.name.clone());
                }
                if !self.already_held(&name, &local) {
                    wanted.push((name, item.path));
                }
            }
        }
        *self.seen_baselines.lock() = baselines_seen;
        if wanted.is_empty() {
            return Ok(0);
        }
        wanted.sort_by(|(a, _), (b, _)| {
            (a.global_count, &a.store_id).cmp(&(b.global_count, &b.store_id))
        });

        let mut events = Vec::with_capacity(wanted.len());
        for (name, path) in &wanted {
            let bytes = self.download_bytes(path).await?;
            let event = decode_event(&bytes)?;
            if EventFileName::for_event(&event)? != *name {
                warn!(file = %path, "event file name does not match its content");
                continue;
            }
            if self.is_superseded_baseline(&event) {
                debug!(baseline = %event.unique_identifier, "skipping superseded baseline");
                continue;
            }
            events.push(event);
        }

        for event in &events {
            self.store
                .register_incomplete_event_identifier(&event.unique_identifier, true)?;
        }
        self.store.flush()?;
        let mut added = 0;
        let mut result = Ok(());
        for event in &events {
            match self.store.add_event(event.clone()) {
                Ok(()) => added += 1,
                Err(StoreError::DuplicateEvent(_) | StoreError::DuplicateRevision { .. }) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        for event in &events {
            self.store
                .deregister_incomplete_event_identifier(&event.unique_identifier)?;
        }
        self.store.flush()?;
        result?;
        if added > 0 {
            info!(events = added, "imported remote events");
        }
        Ok(added)
    }

    /// Downloads data files the store does not hold. Files whose content
    /// does not match their name are skipped.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors.
    pub async fn import_new_data_files(&self) -> EnsembleResult<usize> {
        let mut imported = 0;
        for item in self.list(&self.remote_dir(DATA_DIR)).await? {
            if self.store.data_files().contains(&item.name) {
                continue;
            }
            let bytes = self.download_bytes(&item.path).await?;
            match self.store.data_files().import(&item.name, &bytes) {
                Ok(()) => imported += 1,
                Err(StoreError::DataFileMismatch { name, actual }) => {
                    warn!(file = %name, actual = %actual, "skipping data file with wrong content");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if imported > 0 {
            debug!(files = imported, "imported data files");
        }
        Ok(imported)
    }

    /// Uploads local save and merge events, and the current baseline, that
    /// are not in the cloud yet. Returns the number of files uploaded.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors.
    pub async fn export_new_local_events(&self) -> EnsembleResult<usize> {
        let local = self.store.persistent_store_id()?;
        let events_dir = self.remote_dir(EVENTS_DIR);
        let remote: BTreeSet<String> = self
            .list(&events_dir)
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect();

        let mut exported = 0;
        for event in self.store.events_for_store(&local) {
            let name = EventFileName::for_event(&event)?.file_name();
            if remote.contains(&name) {
                continue;
            }
            self.upload_bytes(&encode_event(&event)?, &join_remote(&events_dir, &name))
                .await?;
            exported += 1;
        }

        if let Some(baseline) = self.store.current_baseline() {
            let baselines_dir = self.remote_dir(BASELINES_DIR);
            let name = EventFileName::for_event(&baseline)?.file_name();
            if !self
                .bounded(
                    "exists",
                    self.cloud.file_exists(&join_remote(&baselines_dir, &name)),
                )
                .await?
            {
                self.upload_bytes(
                    &encode_event(&baseline)?,
                    &join_remote(&baselines_dir, &name),
                )
                .await?;
                exported += 1;
            }
        }
        if exported > 0 {
            info!(files = exported, "exported local events");
        }
        Ok(exported)
    }

    /// Uploads local data files missing from the cloud.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors.
    pub async fn export_data_files(&self) -> EnsembleResult<usize> {
        let data_dir = self.remote_dir(DATA_DIR);
        let remote: BTreeSet<String> = self
            .list(&data_dir)
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect();
        let mut exported = 0;
        for name in self.store.data_files().names()? {
            if remote.contains(&name) {
                continue;
            }
            let bytes = self.store.data_files().read(&name)?;
            self.upload_bytes(&bytes, &join_remote(&data_dir, &name))
                .await?;
            exported += 1;
        }
        if exported > 0 {
            debug!(files = exported, "exported data files");
        }
        Ok(exported)
    }

    /// After a rebase, removes remote baselines the current baseline
    /// replaced and event files it covers.
    ///
    /// Only baselines listed by the last import are candidates, so a
    /// baseline another peer uploaded since is left alone.
    ///
    /// # Errors
    ///
    /// Fails on cloud errors.
    pub async fn remove_outdated_remote_files(&self) -> EnsembleResult<usize> {
        let Some(current) = self.store.current_baseline() else {
            return Ok(0);
        };
        let current_name = EventFileName::for_event(&current)?.file_name();
        let baselines_dir = self.remote_dir(BASELINES_DIR);
        if !self
            .bounded(
                "exists",
                self.cloud.file_exists(&join_remote(&baselines_dir, &current_name)),
            )
            .await?
        {
            return Ok(0);
        }

        let seen = self.seen_baselines.lock().clone();
        let mut removed = 0;
        for item in self.list(&baselines_dir).await? {
            if item.name == current_name || !seen.contains(&item.name) {
                continue;
            }
            self.remove_if_present(&item.path).await?;
            removed += 1;
        }

        let covered = current.revision_set();
        for item in self.list(&self.remote_dir(EVENTS_DIR)).await? {
            let Ok(name) = EventFileName::parse(EventFileKind::Event, &item.name) else {
                continue;
            };
            let revision = name.revision_number.unwrap_or_default();
            if revision <= covered.revision_number_for_store(&name.store_id) {
                self.remove_if_present(&item.path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(files = removed, "removed outdated remote files");
        }
        Ok(removed)
    }

    async fn remove_if_present(&self, path: &str) -> EnsembleResult<()> {
        match self.bounded("remove", self.cloud.remove_item(path)).await {
            Ok(()) | Err(EnsembleError::Cloud(CloudError::NotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
