//! The event store.
//!
//! Holds every event known to the local replica, indexed by unique
//! identifier and by `(store_id, revision_number)`, plus the metadata
//! record, the global identifier registry and the data files.
//!
//! The log is single-writer: every mutation takes the log lock first and
//! the state lock second. Readers only take the state lock and receive
//! clones, so they see a consistent snapshot while a write is prepared.

use crate::backend::{FileLogBackend, LogBackend, MemoryLogBackend};
use crate::config::StoreConfig;
use crate::data_files::DataFileStore;
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::identifiers::{IdentifierRegistry, ObjectId};
use crate::log::EventLog;
use crate::metadata::StoreMetadata;
use crate::record::LogRecord;
use ensembles_model::{
    sort_canonically, EventType, GlobalCount, GlobalIdentifier, RevisionNumber,
    StoreModificationEvent,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Default)]
struct StoreState {
    metadata: Option<StoreMetadata>,
    events: BTreeMap<String, StoreModificationEvent>,
    revisions: BTreeMap<(String, RevisionNumber), String>,
    identifiers: IdentifierRegistry,
}

impl StoreState {
    fn metadata(&self) -> StoreResult<&StoreMetadata> {
        self.metadata.as_ref().ok_or(StoreError::NotPrepared)
    }

    fn metadata_mut(&mut self) -> StoreResult<&mut StoreMetadata> {
        self.metadata.as_mut().ok_or(StoreError::NotPrepared)
    }

    /// Applies a replayed record and returns how many records it made dead.
    fn apply(&mut self, record: LogRecord) -> usize {
        match record {
            LogRecord::PutEvent(event) => usize::from(self.insert_event(event).is_some()),
            LogRecord::RemoveEvent(id) => {
                if self.remove_event(&id).is_some() {
                    2
                } else {
                    1
                }
            }
            LogRecord::MapIdentifier {
                object_id,
                identifier,
            } => {
                self.identifiers.map(object_id, identifier);
                0
            }
        }
    }

    fn insert_event(&mut self, event: StoreModificationEvent) -> Option<StoreModificationEvent> {
        if event.event_type.is_revisioned() {
            self.revisions.insert(
                (event.store_id().to_string(), event.revision_number()),
                event.unique_identifier.clone(),
            );
        }
        self.events.insert(event.unique_identifier.clone(), event)
    }

    fn remove_event(&mut self, id: &str) -> Option<StoreModificationEvent> {
        let event = self.events.remove(id)?;
        if event.event_type.is_revisioned() {
            self.revisions
                .remove(&(event.store_id().to_string(), event.revision_number()));
        }
        Some(event)
    }

    fn check_can_add(&self, event: &StoreModificationEvent) -> StoreResult<()> {
        if !event.is_committed() {
            return Err(StoreError::IncompleteEvent(event.unique_identifier.clone()));
        }
        if self.events.contains_key(&event.unique_identifier) {
            return Err(StoreError::DuplicateEvent(event.unique_identifier.clone()));
        }
        if event.event_type.is_revisioned()
            && self
                .revisions
                .contains_key(&(event.store_id().to_string(), event.revision_number()))
        {
            return Err(StoreError::DuplicateRevision {
                store_id: event.store_id().to_string(),
                revision_number: event.revision_number(),
            });
        }
        Ok(())
    }

    /// Brings counters in the metadata up to date with an event.
    fn note_event(&mut self, event: &StoreModificationEvent) -> StoreResult<()> {
        let metadata = self.metadata_mut()?;
        metadata.max_global_count = metadata.max_global_count.max(event.global_count);
        if event.store_id() == metadata.persistent_store_id {
            let revision = event.revision_number();
            match event.event_type {
                EventType::Save => {
                    metadata.last_save_revision = metadata.last_save_revision.max(revision)
                }
                EventType::Merge => {
                    metadata.last_merge_revision = metadata.last_merge_revision.max(revision)
                }
                EventType::Baseline | EventType::Incomplete => {}
            }
        }
        Ok(())
    }

    /// Lowers the local revision counters to the remaining local events,
    /// never below what the current baseline covers, after events were
    /// dropped without being superseded.
    fn rewind_local_revisions(&mut self) -> StoreResult<()> {
        let metadata = self.metadata()?;
        let local = metadata.persistent_store_id.clone();
        let floor = metadata
            .baseline_identifier
            .as_ref()
            .and_then(|id| self.events.get(id))
            .map_or(0, |b| b.revision_set().revision_number_for_store(&local));
        let (mut save, mut merge) = (0, 0);
        for event in self.events.values().filter(|e| e.store_id() == local) {
            match event.event_type {
                EventType::Save => save = save.max(event.revision_number()),
                EventType::Merge => merge = merge.max(event.revision_number()),
                EventType::Baseline | EventType::Incomplete => {}
            }
        }
        let metadata = self.metadata_mut()?;
        metadata.last_save_revision = metadata.last_save_revision.min(save.max(floor));
        metadata.last_merge_revision = metadata.last_merge_revision.min(merge.max(floor));
        Ok(())
    }

    fn live_records(&self) -> Vec<LogRecord> {
        let mut records: Vec<LogRecord> = self
            .identifiers
            .iter()
            .map(|(object_id, identifier)| LogRecord::MapIdentifier {
                object_id,
                identifier: identifier.clone(),
            })
            .collect();
        records.extend(self.events.values().cloned().map(LogRecord::PutEvent));
        records
    }
}

/// Durable log of events for one local replica.
pub struct EventStore {
    config: StoreConfig,
    dir: Option<StoreDir>,
    data_files: DataFileStore,
    log: Mutex<Option<EventLog>>,
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("ensemble_id", &self.config.ensemble_id)
            .field("root", &self.config.root)
            .field("events", &self.state.read().events.len())
            .finish()
    }
}

impl EventStore {
    /// Opens the store described by `config`.
    ///
    /// An on-disk store that was prepared before is loaded, a torn log
    /// tail is truncated, and events left incomplete by a crash are
    /// removed.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked, the metadata belongs to another
    /// ensemble, or the log is corrupted.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let dir = config.root.as_deref().map(StoreDir::open).transpose()?;
        let data_files = match &dir {
            Some(dir) => DataFileStore::in_directory(dir.data_dir()),
            None => DataFileStore::in_memory(),
        };

        let mut state = StoreState::default();
        let mut log = None;
        if let Some(dir) = &dir {
            if let Some(metadata) = dir.load_metadata()? {
                if metadata.ensemble_id != config.ensemble_id {
                    return Err(StoreError::corrupted(format!(
                        "store belongs to ensemble {}, expected {}",
                        metadata.ensemble_id, config.ensemble_id
                    )));
                }
                let (mut event_log, records) =
                    EventLog::open(Box::new(FileLogBackend::open(&dir.log_path())?))?;
                state.metadata = Some(metadata);
                let mut dead = 0;
                for record in records {
                    dead += state.apply(record);
                }
                event_log.mark_dead(dead);
                let events: Vec<_> = state.events.values().cloned().collect();
                for event in &events {
                    state.note_event(event)?;
                }
                debug!(events = events.len(), "loaded event store");
                log = Some(event_log);
            }
        }

        let store = Self {
            config,
            dir,
            data_files,
            log: Mutex::new(log),
            state: RwLock::new(state),
        };
        store.remove_incomplete_events()?;
        Ok(store)
    }

    /// Opens an in-memory store.
    pub fn in_memory(ensemble_id: impl Into<String>) -> Self {
        Self {
            config: StoreConfig::in_memory(ensemble_id),
            dir: None,
            data_files: DataFileStore::in_memory(),
            log: Mutex::new(None),
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Ensemble identifier.
    pub fn ensemble_id(&self) -> &str {
        &self.config.ensemble_id
    }

    /// Returns true once the store has been prepared.
    pub fn contains_event_data(&self) -> bool {
        self.state.read().metadata.is_some()
    }

    /// Initializes an empty log with a new persistent store identifier and
    /// revision 0. Returns the identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyPrepared`] if the store holds data.
    pub fn prepare_new_event_store(&self) -> StoreResult<String> {
        let mut log_guard = self.log.lock();
        let mut state = self.state.write();
        if state.metadata.is_some() {
            return Err(StoreError::AlreadyPrepared);
        }

        let store_id = uuid::Uuid::new_v4().to_string();
        let metadata = StoreMetadata::new(self.config.ensemble_id.clone(), store_id.clone());
        let backend: Box<dyn LogBackend> = match &self.dir {
            Some(dir) => {
                dir.clear()?;
                Box::new(FileLogBackend::open(&dir.log_path())?)
            }
            None => Box::new(MemoryLogBackend::new()),
        };
        let (event_log, _) = EventLog::open(backend)?;
        if let Some(dir) = &self.dir {
            dir.save_metadata(&metadata)?;
        }

        *state = StoreState {
            metadata: Some(metadata),
            ..StoreState::default()
        };
        *log_guard = Some(event_log);
        info!(
            store_id = %store_id,
            ensemble = %self.config.ensemble_id,
            "prepared new event store"
        );
        Ok(store_id)
    }

    /// Deletes all events, metadata and data files.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn remove_event_store(&self) -> StoreResult<()> {
        let mut log_guard = self.log.lock();
        let mut state = self.state.write();
        match &self.dir {
            Some(dir) => dir.clear()?,
            None => self.data_files.clear()?,
        }
        *state = StoreState::default();
        *log_guard = None;
        info!(ensemble = %self.config.ensemble_id, "removed event store");
        Ok(())
    }

    /// Snapshot of the metadata record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotPrepared`] before preparation.
    pub fn metadata(&self) -> StoreResult<StoreMetadata> {
        self.state.read().metadata().cloned()
    }

    fn read_metadata<T>(&self, f: impl FnOnce(&StoreMetadata) -> T) -> StoreResult<T> {
        Ok(f(self.state.read().metadata()?))
    }

    /// Changes the metadata and writes it to disk.
    fn update_metadata<T>(&self, f: impl FnOnce(&mut StoreMetadata) -> T) -> StoreResult<T> {
        let _log_guard = self.log.lock();
        let mut state = self.state.write();
        let metadata = state.metadata_mut()?;
        let result = f(metadata);
        if let Some(dir) = &self.dir {
            dir.save_metadata(metadata)?;
        }
        Ok(result)
    }

    /// Identifier of the local persistent store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotPrepared`] before preparation.
    pub fn persistent_store_id(&self) -> StoreResult<String> {
        self.read_metadata(|m| m.persistent_store_id.clone())
    }

    /// Revision of the latest local save event.
    pub fn last_save_revision(&self) -> StoreResult<RevisionNumber> {
        self.read_metadata(|m| m.last_save_revision)
    }

    /// Revision of the latest local merge event.
    pub fn last_merge_revision(&self) -> StoreResult<RevisionNumber> {
        self.read_metadata(|m| m.last_merge_revision)
    }

    /// Latest revision of any local event.
    pub fn last_revision(&self) -> StoreResult<RevisionNumber> {
        self.read_metadata(StoreMetadata::last_revision)
    }

    /// Highest global count seen.
    pub fn max_global_count(&self) -> StoreResult<GlobalCount> {
        self.read_metadata(|m| m.max_global_count)
    }

    /// Identifier of the current baseline.
    pub fn baseline_identifier(&self) -> StoreResult<Option<String>> {
        self.read_metadata(|m| m.baseline_identifier.clone())
    }

    /// Sets the current baseline.
    pub fn set_baseline_identifier(&self, id: Option<String>) -> StoreResult<()> {
        self.update_metadata(|m| m.baseline_identifier = id)
    }

    /// Baseline the local structured store was last rebuilt from.
    pub fn baseline_used_to_construct_store(&self) -> StoreResult<Option<String>> {
        self.read_metadata(|m| m.baseline_used_to_construct_store.clone())
    }

    /// Records the baseline the local structured store reflects.
    pub fn set_baseline_used_to_construct_store(&self, id: Option<String>) -> StoreResult<()> {
        self.update_metadata(|m| m.baseline_used_to_construct_store = id)
    }

    /// Cloud identity token recorded at leech time.
    pub fn identity_token(&self) -> StoreResult<Option<String>> {
        self.read_metadata(|m| m.identity_token.clone())
    }

    /// Records the cloud identity token.
    pub fn set_identity_token(&self, token: Option<String>) -> StoreResult<()> {
        self.update_metadata(|m| m.identity_token = token)
    }

    /// Increments the unknown-model-version counter and returns it.
    pub fn note_unknown_version_merge(&self) -> StoreResult<u32> {
        self.update_metadata(|m| {
            m.unknown_version_merges += 1;
            m.unknown_version_merges
        })
    }

    /// Clears the unknown-model-version counter.
    pub fn reset_unknown_version_merges(&self) -> StoreResult<()> {
        self.update_metadata(|m| m.unknown_version_merges = 0)
    }

    // ---- incomplete events ----

    /// Marks an event as under construction. Mandatory events block merges
    /// until they are deregistered.
    pub fn register_incomplete_event_identifier(
        &self,
        id: &str,
        mandatory: bool,
    ) -> StoreResult<()> {
        self.update_metadata(|m| {
            m.incomplete_events.insert(id.to_string(), mandatory);
        })
    }

    /// Removes the under-construction mark.
    pub fn deregister_incomplete_event_identifier(&self, id: &str) -> StoreResult<()> {
        self.update_metadata(|m| {
            m.incomplete_events.remove(id);
        })
    }

    /// Identifiers of events under construction.
    pub fn incomplete_event_identifiers(&self) -> StoreResult<Vec<String>> {
        self.read_metadata(|m| m.incomplete_events.keys().cloned().collect())
    }

    /// Identifiers of mandatory events under construction.
    pub fn incomplete_mandatory_event_identifiers(&self) -> StoreResult<Vec<String>> {
        self.read_metadata(|m| {
            m.incomplete_events
                .iter()
                .filter(|(_, mandatory)| **mandatory)
                .map(|(id, _)| id.clone())
                .collect()
        })
    }

    fn remove_incomplete_events(&self) -> StoreResult<()> {
        let ids = match self.incomplete_event_identifiers() {
            Ok(ids) => ids,
            Err(StoreError::NotPrepared) => return Ok(()),
            Err(e) => return Err(e),
        };
        if ids.is_empty() {
            return Ok(());
        }
        let local = self.persistent_store_id()?;
        let mut local_removed = false;
        for id in &ids {
            if self.contains_event(id) {
                warn!(event = %id, "removing event left incomplete");
                local_removed |= self.remove_event(id)?.store_id() == local;
            }
        }
        if local_removed {
            let _log_guard = self.log.lock();
            self.state.write().rewind_local_revisions()?;
        }
        self.update_metadata(|m| m.incomplete_events.clear())?;
        self.flush()
    }

    // ---- events ----

    /// Appends a committed event.
    ///
    /// # Errors
    ///
    /// Fails for incomplete events, duplicate identifiers, or a save/merge
    /// event whose `(store_id, revision_number)` is already taken.
    pub fn add_event(&self, event: StoreModificationEvent) -> StoreResult<()> {
        let mut log_guard = self.log.lock();
        let log = log_guard.as_mut().ok_or(StoreError::NotPrepared)?;
        let mut state = self.state.write();
        state.check_can_add(&event)?;
        log.append(&LogRecord::PutEvent(event.clone()))?;
        state.note_event(&event)?;
        debug!(
            event = %event.unique_identifier,
            revision = %event.own_revision,
            kind = ?event.event_type,
            "added event"
        );
        state.insert_event(event);
        Ok(())
    }

    /// Appends a committed save or merge event of the local store and
    /// returns it as stored.
    ///
    /// The event takes the revision after the latest local one and a
    /// global count above every count seen, both assigned under the log
    /// lock. Its incomplete mark is cleared in the same metadata write, so
    /// a number is only consumed once the event is in the log, and an event
    /// lost to a crash before that write gives its number back on reopen.
    ///
    /// # Errors
    ///
    /// Fails for incomplete or baseline events, events of another store,
    /// duplicate identifiers, or I/O errors.
    pub fn add_local_event(
        &self,
        mut event: StoreModificationEvent,
    ) -> StoreResult<StoreModificationEvent> {
        let mut log_guard = self.log.lock();
        let log = log_guard.as_mut().ok_or(StoreError::NotPrepared)?;
        let mut state = self.state.write();
        let metadata = state.metadata()?;
        if event.store_id() != metadata.persistent_store_id || !event.event_type.is_revisioned() {
            return Err(StoreError::ForeignEvent(event.unique_identifier));
        }
        let global_count = event.global_count.max(metadata.max_global_count + 1);
        event.own_revision.revision_number = metadata.last_revision() + 1;
        event.own_revision.global_count = global_count;
        event.global_count = global_count;
        state.check_can_add(&event)?;

        log.append(&LogRecord::PutEvent(event.clone()))?;
        log.flush(self.config.sync_on_flush)?;
        state.note_event(&event)?;
        let metadata = state.metadata_mut()?;
        metadata.incomplete_events.remove(&event.unique_identifier);
        if let Some(dir) = &self.dir {
            dir.save_metadata(metadata)?;
        }
        debug!(
            event = %event.unique_identifier,
            revision = %event.own_revision,
            kind = ?event.event_type,
            "added local event"
        );
        state.insert_event(event.clone());
        Ok(event)
    }

    /// Removes an event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EventNotFound`] for unknown identifiers.
    pub fn remove_event(&self, id: &str) -> StoreResult<StoreModificationEvent> {
        let mut log_guard = self.log.lock();
        let log = log_guard.as_mut().ok_or(StoreError::NotPrepared)?;
        let mut state = self.state.write();
        if !state.events.contains_key(id) {
            return Err(StoreError::EventNotFound(id.to_string()));
        }
        log.append(&LogRecord::RemoveEvent(id.to_string()))?;
        log.mark_dead(2);
        state
            .remove_event(id)
            .ok_or_else(|| StoreError::EventNotFound(id.to_string()))
    }

    /// Returns true if an event has the identifier.
    pub fn contains_event(&self, id: &str) -> bool {
        self.state.read().events.contains_key(id)
    }

    /// Returns true if a save or merge event occupies the revision.
    pub fn contains_revision(&self, store_id: &str, revision_number: RevisionNumber) -> bool {
        self.state
            .read()
            .revisions
            .contains_key(&(store_id.to_string(), revision_number))
    }

    /// Returns an event by identifier.
    pub fn event(&self, id: &str) -> Option<StoreModificationEvent> {
        self.state.read().events.get(id).cloned()
    }

    /// Returns the save or merge event at a revision.
    pub fn event_for_revision(
        &self,
        store_id: &str,
        revision_number: RevisionNumber,
    ) -> Option<StoreModificationEvent> {
        let state = self.state.read();
        state
            .revisions
            .get(&(store_id.to_string(), revision_number))
            .and_then(|id| state.events.get(id))
            .cloned()
    }

    /// Save and merge events of a store with revision above `after`, in
    /// revision order.
    pub fn events_for_store_after(
        &self,
        store_id: &str,
        after: RevisionNumber,
    ) -> Vec<StoreModificationEvent> {
        let state = self.state.read();
        state
            .revisions
            .range(
                (store_id.to_string(), after.saturating_add(1))
                    ..=(store_id.to_string(), RevisionNumber::MAX),
            )
            .filter_map(|(_, id)| state.events.get(id))
            .cloned()
            .collect()
    }

    /// Save and merge events of a store, in revision order.
    pub fn events_for_store(&self, store_id: &str) -> Vec<StoreModificationEvent> {
        self.events_for_store_after(store_id, RevisionNumber::MIN)
    }

    /// Every event, in canonical replay order.
    pub fn all_events(&self) -> Vec<StoreModificationEvent> {
        let mut events: Vec<_> = self.state.read().events.values().cloned().collect();
        sort_canonically(&mut events);
        events
    }

    /// Save and merge events, in canonical replay order.
    pub fn revisioned_events(&self) -> Vec<StoreModificationEvent> {
        let mut events: Vec<_> = self
            .state
            .read()
            .events
            .values()
            .filter(|e| e.event_type.is_revisioned())
            .cloned()
            .collect();
        sort_canonically(&mut events);
        events
    }

    /// Baseline events, in canonical order.
    pub fn baseline_events(&self) -> Vec<StoreModificationEvent> {
        let mut events: Vec<_> = self
            .state
            .read()
            .events
            .values()
            .filter(|e| e.event_type == EventType::Baseline)
            .cloned()
            .collect();
        sort_canonically(&mut events);
        events
    }

    /// The baseline named by the metadata.
    pub fn current_baseline(&self) -> Option<StoreModificationEvent> {
        let state = self.state.read();
        let id = state.metadata.as_ref()?.baseline_identifier.as_ref()?;
        state.events.get(id).cloned()
    }

    /// Stores that produced save or merge events.
    pub fn store_ids(&self) -> BTreeSet<String> {
        self.state
            .read()
            .revisions
            .keys()
            .map(|(store_id, _)| store_id.clone())
            .collect()
    }

    /// Number of events.
    pub fn event_count(&self) -> usize {
        self.state.read().events.len()
    }

    /// Number of object changes across all events.
    pub fn object_change_count(&self) -> usize {
        self.state
            .read()
            .events
            .values()
            .map(|e| e.object_changes.len())
            .sum()
    }

    // ---- global identifiers ----

    /// Global identifier of a local object.
    pub fn global_identifier_for_object(&self, object_id: ObjectId) -> Option<GlobalIdentifier> {
        self.state
            .read()
            .identifiers
            .identifier_for_object(object_id)
            .cloned()
    }

    /// Local object of a global identifier.
    pub fn object_for_global_identifier(&self, identifier: &GlobalIdentifier) -> Option<ObjectId> {
        self.state.read().identifiers.object_for_identifier(identifier)
    }

    /// Records identifier mappings.
    ///
    /// # Errors
    ///
    /// Fails before preparation or on I/O errors.
    pub fn map_global_identifiers(
        &self,
        mappings: &[(ObjectId, GlobalIdentifier)],
    ) -> StoreResult<()> {
        let mut log_guard = self.log.lock();
        let log = log_guard.as_mut().ok_or(StoreError::NotPrepared)?;
        let mut state = self.state.write();
        for (object_id, identifier) in mappings {
            if state.identifiers.object_for_identifier(identifier) == Some(*object_id) {
                continue;
            }
            log.append(&LogRecord::MapIdentifier {
                object_id: *object_id,
                identifier: identifier.clone(),
            })?;
            state.identifiers.map(*object_id, identifier.clone());
        }
        Ok(())
    }

    /// Snapshot of the identifier registry.
    pub fn identifier_registry(&self) -> IdentifierRegistry {
        self.state.read().identifiers.clone()
    }

    // ---- data files ----

    /// The data file directory.
    pub fn data_files(&self) -> &DataFileStore {
        &self.data_files
    }

    /// Data files referenced by any event.
    pub fn referenced_data_files(&self) -> BTreeSet<String> {
        self.state
            .read()
            .events
            .values()
            .flat_map(StoreModificationEvent::data_filenames)
            .collect()
    }

    /// Deletes data files no event references. Returns how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn remove_unreferenced_data_files(&self) -> StoreResult<usize> {
        let referenced = self.referenced_data_files();
        let removed = self.data_files.retain_only(&referenced)?;
        if removed > 0 {
            debug!(removed, "removed unreferenced data files");
        }
        Ok(removed)
    }

    /// Staging directory for transfers, for on-disk stores.
    pub fn transit_dir(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(StoreDir::transit_dir)
    }

    // ---- durability ----

    /// Flushes the log and writes the metadata.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn flush(&self) -> StoreResult<()> {
        let mut log_guard = self.log.lock();
        let state = self.state.read();
        if let Some(log) = log_guard.as_mut() {
            log.flush(self.config.sync_on_flush)?;
        }
        if let (Some(dir), Some(metadata)) = (&self.dir, &state.metadata) {
            dir.save_metadata(metadata)?;
        }
        Ok(())
    }

    /// Size of the log in bytes.
    pub fn log_size(&self) -> u64 {
        self.log.lock().as_ref().map(EventLog::size).unwrap_or(0)
    }

    /// Rewrites the log with live records only.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn compact(&self) -> StoreResult<()> {
        let mut log_guard = self.log.lock();
        let log = log_guard.as_mut().ok_or(StoreError::NotPrepared)?;
        let state = self.state.read();
        let before = log.size();
        log.rewrite(&state.live_records())?;
        log.flush(self.config.sync_on_flush)?;
        info!(before, after = log.size(), "compacted event log");
        Ok(())
    }

    /// Compacts when dead records exceed the configured ratio. Returns
    /// whether compaction ran.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn compact_if_needed(&self) -> StoreResult<bool> {
        let ratio = match self.log.lock().as_ref() {
            Some(log) => log.dead_ratio(),
            None => return Ok(false),
        };
        if ratio <= self.config.compaction_ratio {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembles_model::{
        AttributeValue, ObjectChange, PropertyChangeValue, Revision, RevisionSet,
    };
    use tempfile::TempDir;

    fn event(
        store: &str,
        revision: i64,
        global_count: i64,
        kind: EventType,
    ) -> StoreModificationEvent {
        let mut e = StoreModificationEvent::new_incomplete(
            uuid::Uuid::new_v4().to_string(),
            Revision::new(store, revision, global_count),
            RevisionSet::new(),
            "v1",
        );
        e.commit(kind).unwrap();
        e
    }

    fn prepared() -> (EventStore, String) {
        let store = EventStore::in_memory("ens");
        let id = store.prepare_new_event_store().unwrap();
        (store, id)
    }

    #[test]
    fn prepare_starts_at_revision_zero() {
        let (store, id) = prepared();
        assert!(store.contains_event_data());
        assert_eq!(store.persistent_store_id().unwrap(), id);
        assert_eq!(store.last_revision().unwrap(), 0);
        assert!(matches!(
            store.prepare_new_event_store(),
            Err(StoreError::AlreadyPrepared)
        ));
    }

    #[test]
    fn unprepared_store_rejects_writes() {
        let store = EventStore::in_memory("ens");
        assert!(matches!(
            store.add_event(event("A", 1, 1, EventType::Save)),
            Err(StoreError::NotPrepared)
        ));
        assert!(store.persistent_store_id().is_err());
    }

    #[test]
    fn own_events_advance_revisions() {
        let (store, id) = prepared();
        store.add_event(event(&id, 1, 1, EventType::Save)).unwrap();
        store.add_event(event(&id, 2, 4, EventType::Merge)).unwrap();
        store.add_event(event("other", 7, 9, EventType::Save)).unwrap();

        assert_eq!(store.last_save_revision().unwrap(), 1);
        assert_eq!(store.last_merge_revision().unwrap(), 2);
        assert_eq!(store.last_revision().unwrap(), 2);
        assert_eq!(store.max_global_count().unwrap(), 9);
    }

    #[test]
    fn local_events_take_the_next_revision() {
        let (store, id) = prepared();
        store.add_event(event(&id, 1, 1, EventType::Save)).unwrap();
        store.add_event(event("other", 4, 6, EventType::Save)).unwrap();

        let added = store
            .add_local_event(event(&id, 99, 2, EventType::Merge))
            .unwrap();
        assert_eq!(added.revision_number(), 2);
        assert_eq!(added.global_count, 7);
        assert_eq!(added.own_revision.global_count, 7);
        assert_eq!(store.last_merge_revision().unwrap(), 2);
        assert_eq!(store.event_for_revision(&id, 2), Some(added));

        assert!(matches!(
            store.add_local_event(event("other", 5, 8, EventType::Save)),
            Err(StoreError::ForeignEvent(_))
        ));
        assert!(matches!(
            store.add_local_event(event(&id, 3, 8, EventType::Baseline)),
            Err(StoreError::ForeignEvent(_))
        ));
    }

    #[test]
    fn add_local_event_clears_incomplete_mark() {
        let (store, id) = prepared();
        let e = event(&id, 1, 1, EventType::Save);
        store
            .register_incomplete_event_identifier(&e.unique_identifier, false)
            .unwrap();
        store.add_local_event(e).unwrap();
        assert!(store.incomplete_event_identifiers().unwrap().is_empty());
    }

    #[test]
    fn revision_of_event_lost_in_crash_is_reused() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig::at_path("ens", temp.path().join("store"));
        let (store_id, lost);
        {
            let store = EventStore::open(config.clone()).unwrap();
            store_id = store.prepare_new_event_store().unwrap();
            store.add_local_event(event(&store_id, 0, 1, EventType::Save)).unwrap();

            // Appended to the log, but the metadata write that would have
            // completed it never happened.
            let e = event(&store_id, 2, 2, EventType::Save);
            lost = e.unique_identifier.clone();
            store
                .register_incomplete_event_identifier(&lost, false)
                .unwrap();
            store.add_event(e).unwrap();
            store.flush().unwrap();
        }

        let store = EventStore::open(config).unwrap();
        assert!(!store.contains_event(&lost));
        assert_eq!(store.last_revision().unwrap(), 1);
        let next = store
            .add_local_event(event(&store_id, 0, 3, EventType::Save))
            .unwrap();
        assert_eq!(next.revision_number(), 2);
        let revisions: Vec<_> = store
            .events_for_store(&store_id)
            .iter()
            .map(StoreModificationEvent::revision_number)
            .collect();
        assert_eq!(revisions, vec![1, 2]);
    }

    #[test]
    fn duplicate_revisions_are_rejected() {
        let (store, _) = prepared();
        store.add_event(event("A", 1, 1, EventType::Save)).unwrap();
        assert!(matches!(
            store.add_event(event("A", 1, 2, EventType::Merge)),
            Err(StoreError::DuplicateRevision { .. })
        ));
    }

    #[test]
    fn baselines_do_not_occupy_revisions() {
        let (store, _) = prepared();
        store.add_event(event("A", 1, 1, EventType::Save)).unwrap();
        store.add_event(event("A", 1, 1, EventType::Baseline)).unwrap();
        assert_eq!(store.baseline_events().len(), 1);
        assert_eq!(store.events_for_store("A").len(), 1);
    }

    #[test]
    fn events_for_store_are_ordered() {
        let (store, _) = prepared();
        for revision in [3, 1, 2] {
            store
                .add_event(event("A", revision, revision, EventType::Save))
                .unwrap();
        }
        let revisions: Vec<_> = store
            .events_for_store("A")
            .iter()
            .map(StoreModificationEvent::revision_number)
            .collect();
        assert_eq!(revisions, vec![1, 2, 3]);
        assert_eq!(store.events_for_store_after("A", 1).len(), 2);
    }

    #[test]
    fn remove_event_frees_revision() {
        let (store, _) = prepared();
        let e = event("A", 1, 1, EventType::Save);
        let id = e.unique_identifier.clone();
        store.add_event(e).unwrap();
        store.remove_event(&id).unwrap();
        assert!(!store.contains_revision("A", 1));
        assert!(matches!(
            store.remove_event(&id),
            Err(StoreError::EventNotFound(_))
        ));
    }

    #[test]
    fn incomplete_registration() {
        let (store, _) = prepared();
        store.register_incomplete_event_identifier("x", false).unwrap();
        store.register_incomplete_event_identifier("y", true).unwrap();
        assert_eq!(store.incomplete_event_identifiers().unwrap().len(), 2);
        assert_eq!(
            store.incomplete_mandatory_event_identifiers().unwrap(),
            vec!["y".to_string()]
        );
        store.deregister_incomplete_event_identifier("y").unwrap();
        assert!(store.incomplete_mandatory_event_identifiers().unwrap().is_empty());
    }

    #[test]
    fn unreferenced_data_files_are_collected() {
        let (store, id) = prepared();
        let kept = store.data_files().store(b"kept").unwrap();
        store.data_files().store(b"orphan").unwrap();

        let mut e = event(&id, 1, 1, EventType::Save);
        e.object_changes.push(ObjectChange::insert(
            GlobalIdentifier::new("Photo", "p1"),
            vec![PropertyChangeValue::attribute(
                "image",
                AttributeValue::DataFile(kept.clone()),
            )],
        ));
        store.add_event(e).unwrap();

        assert_eq!(store.remove_unreferenced_data_files().unwrap(), 1);
        assert!(store.data_files().contains(&kept));
    }

    #[test]
    fn file_store_reopens_with_events_and_identifiers() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig::at_path("ens", temp.path().join("store"));
        let store_id;
        {
            let store = EventStore::open(config.clone()).unwrap();
            store_id = store.prepare_new_event_store().unwrap();
            store.add_event(event(&store_id, 1, 1, EventType::Save)).unwrap();
            store
                .map_global_identifiers(&[(42, GlobalIdentifier::new("Person", "g1"))])
                .unwrap();
            store.flush().unwrap();
        }

        let store = EventStore::open(config).unwrap();
        assert_eq!(store.persistent_store_id().unwrap(), store_id);
        assert_eq!(store.last_save_revision().unwrap(), 1);
        assert_eq!(
            store.object_for_global_identifier(&GlobalIdentifier::new("Person", "g1")),
            Some(42)
        );
    }

    #[test]
    fn incomplete_events_are_removed_on_open() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig::at_path("ens", temp.path());
        let leftover;
        {
            let store = EventStore::open(config.clone()).unwrap();
            store.prepare_new_event_store().unwrap();
            let e = event("remote", 1, 1, EventType::Save);
            leftover = e.unique_identifier.clone();
            store.register_incomplete_event_identifier(&leftover, true).unwrap();
            store.add_event(e).unwrap();
            store.flush().unwrap();
        }

        let store = EventStore::open(config).unwrap();
        assert!(!store.contains_event(&leftover));
        assert!(store.incomplete_event_identifiers().unwrap().is_empty());
    }

    #[test]
    fn other_ensemble_is_rejected() {
        let temp = TempDir::new().unwrap();
        {
            let store = EventStore::open(StoreConfig::at_path("one", temp.path())).unwrap();
            store.prepare_new_event_store().unwrap();
        }
        assert!(EventStore::open(StoreConfig::at_path("two", temp.path())).is_err());
    }

    #[test]
    fn compaction_keeps_live_state() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig::at_path("ens", temp.path()).with_compaction_ratio(0.1);
        {
            let store = EventStore::open(config.clone()).unwrap();
            store.prepare_new_event_store().unwrap();
            let doomed = event("A", 1, 1, EventType::Save);
            let doomed_id = doomed.unique_identifier.clone();
            store.add_event(doomed).unwrap();
            store.add_event(event("A", 2, 2, EventType::Save)).unwrap();
            store.remove_event(&doomed_id).unwrap();

            let before = store.log_size();
            assert!(store.compact_if_needed().unwrap());
            assert!(store.log_size() < before);
            store.flush().unwrap();
        }
        let store = EventStore::open(config).unwrap();
        assert_eq!(store.event_count(), 1);
        assert!(store.contains_revision("A", 2));
    }

    #[test]
    fn remove_event_store_resets() {
        let (store, id) = prepared();
        store.add_event(event(&id, 1, 1, EventType::Save)).unwrap();
        store.remove_event_store().unwrap();
        assert!(!store.contains_event_data());
        assert_eq!(store.event_count(), 0);
    }
}
