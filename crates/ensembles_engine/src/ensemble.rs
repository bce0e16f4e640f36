//! The ensemble: the host-facing API tying the engine together.

use crate::baseline::BaselineConsolidator;
use crate::builder::EventBuilder;
use crate::cloud::{CloudFileSystem, CloudManager};
use crate::config::EnsembleConfig;
use crate::delegate::{EnsembleDelegate, EnsembleNotification, NoopDelegate};
use crate::error::{EnsembleError, EnsembleResult};
use crate::importer::PersistentStoreImporter;
use crate::integrator::{EventIntegrator, IntegratorState, MergeOutcome};
use crate::rebaser::{RebaseOutcome, Rebaser};
use crate::record_store::{ChangeBatch, RecordStore};
use ensembles_model::{EventType, ModelSchema, StoreModificationEvent};
use ensembles_store::EventStore;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

const NOTIFICATION_CAPACITY: usize = 64;

/// Whether the local store takes part in syncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleState {
    /// Not syncing.
    Deleeched,
    /// Setting up sync state.
    Leeching,
    /// Syncing.
    Leeched,
    /// Tearing down sync state.
    Deleeching,
}

impl EnsembleState {
    /// Returns true while a leech or deleech is under way.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, EnsembleState::Leeching | EnsembleState::Deleeching)
    }
}

/// Statistics about merges.
#[derive(Debug, Clone, Default)]
pub struct EnsembleStats {
    /// Merges that completed.
    pub merges_completed: u64,
    /// Remote events integrated.
    pub events_integrated: u64,
    /// Local event files exported.
    pub events_exported: u64,
    /// Rebases performed.
    pub rebases: u64,
    /// Merge attempts retried after transient errors.
    pub retries: u64,
    /// When the last merge completed.
    pub last_merge_time: Option<Instant>,
    /// Last merge error.
    pub last_error: Option<String>,
}

/// What one merge did.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Remote events downloaded.
    pub events_imported: usize,
    /// Data files downloaded.
    pub data_files_imported: usize,
    /// Result of replaying events.
    pub integration: MergeOutcome,
    /// Local event files uploaded, including baselines.
    pub events_exported: usize,
    /// Rebase performed after the merge.
    pub rebase: Option<RebaseOutcome>,
    /// Wall time of the merge.
    pub duration: Duration,
}

/// A local record store synchronised with its peers through a cloud file
/// system.
///
/// Merges are queued: only one runs against the local store at a time,
/// and leeching and deleeching wait for it. Local saves are captured with
/// [`capture_local_changes`](Self::capture_local_changes) and may happen
/// at any time; a save during a merge makes that merge retry.
pub struct Ensemble<R: RecordStore, C: CloudFileSystem> {
    config: EnsembleConfig,
    schema: Arc<ModelSchema>,
    store: EventStore,
    records: Arc<R>,
    cloud: Arc<C>,
    delegate: Arc<dyn EnsembleDelegate>,
    state: RwLock<EnsembleState>,
    integrator_state: RwLock<IntegratorState>,
    merge_queue: Mutex<()>,
    cancelled: AtomicBool,
    save_generation: AtomicU64,
    stats: RwLock<EnsembleStats>,
    notifications: broadcast::Sender<EnsembleNotification>,
}

impl<R: RecordStore, C: CloudFileSystem> Ensemble<R, C> {
    /// Opens the event store described by `config`. The ensemble starts
    /// leeched if the store was set up before.
    ///
    /// # Errors
    ///
    /// Fails if the event store cannot be opened.
    pub fn new(
        config: EnsembleConfig,
        schema: Arc<ModelSchema>,
        records: Arc<R>,
        cloud: Arc<C>,
    ) -> EnsembleResult<Self> {
        let store = EventStore::open(config.store_config())?;
        let state = if store.contains_event_data() {
            EnsembleState::Leeched
        } else {
            EnsembleState::Deleeched
        };
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            config,
            schema,
            store,
            records,
            cloud,
            delegate: Arc::new(NoopDelegate),
            state: RwLock::new(state),
            integrator_state: RwLock::new(IntegratorState::Idle),
            merge_queue: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            save_generation: AtomicU64::new(0),
            stats: RwLock::new(EnsembleStats::default()),
            notifications,
        })
    }

    /// Sets the host delegate.
    pub fn with_delegate(mut self, delegate: Arc<dyn EnsembleDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Configuration.
    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Model schema.
    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    /// The event store.
    pub fn event_store(&self) -> &EventStore {
        &self.store
    }

    /// The record store.
    pub fn records(&self) -> &R {
        &self.records
    }

    /// The cloud file system.
    pub fn cloud(&self) -> &C {
        &self.cloud
    }

    /// Current state.
    pub fn state(&self) -> EnsembleState {
        *self.state.read()
    }

    /// Phase of the merge in progress, if any.
    pub fn integrator_state(&self) -> IntegratorState {
        *self.integrator_state.read()
    }

    /// Returns true while leeched.
    pub fn is_leeched(&self) -> bool {
        self.state() == EnsembleState::Leeched
    }

    /// Statistics.
    pub fn stats(&self) -> EnsembleStats {
        self.stats.read().clone()
    }

    /// Subscribes to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EnsembleNotification> {
        self.notifications.subscribe()
    }

    /// Identifier of the local persistent store, while leeched.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::NotLeeched`] otherwise.
    pub fn local_store_id(&self) -> EnsembleResult<String> {
        self.require_leeched()?;
        Ok(self.store.persistent_store_id()?)
    }

    fn notify(&self, notification: EnsembleNotification) {
        // Sending only fails when nobody is subscribed.
        if self.notifications.send(notification).is_err() {
            debug!("no notification subscribers");
        }
    }

    fn require_leeched(&self) -> EnsembleResult<()> {
        if self.is_leeched() {
            Ok(())
        } else {
            Err(EnsembleError::NotLeeched)
        }
    }

    fn check_cancelled(&self) -> EnsembleResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(EnsembleError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn cloud_manager(&self) -> CloudManager<'_, C> {
        CloudManager::new(&self.store, &*self.cloud, &self.config)
    }

    // ---- leeching ----

    /// Sets up sync state: prepares the event store, records the cloud
    /// identity, registers the store remotely and captures existing
    /// records as a first save event.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::AlreadyLeeched`] if syncing already, or
    /// the setup error, after which the ensemble is deleeched again.
    pub async fn start_synchronization(&self) -> EnsembleResult<()> {
        let _queue = self.merge_queue.lock().await;
        {
            let mut state = self.state.write();
            match *state {
                EnsembleState::Deleeched => *state = EnsembleState::Leeching,
                EnsembleState::Leeched => return Err(EnsembleError::AlreadyLeeched),
                other => {
                    return Err(EnsembleError::DisallowedStateChange {
                        from: format!("{other:?}"),
                        to: format!("{:?}", EnsembleState::Leeching),
                    })
                }
            }
        }

        match self.leech().await {
            Ok(store_id) => {
                *self.state.write() = EnsembleState::Leeched;
                info!(ensemble = %self.config.ensemble_id, store_id = %store_id, "leeched");
                self.notify(EnsembleNotification::Leeched { store_id });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "leech failed");
                if self.store.contains_event_data() {
                    if let Err(cleanup) = self.store.remove_event_store() {
                        warn!(error = %cleanup, "could not remove partial event store");
                    }
                }
                *self.state.write() = EnsembleState::Deleeched;
                Err(e)
            }
        }
    }

    async fn leech(&self) -> EnsembleResult<String> {
        let manager = self.cloud_manager();
        manager.ensure_connected().await?;
        let store_id = self.store.prepare_new_event_store()?;
        manager.check_identity().await?;
        manager.create_remote_directory_structure().await?;
        manager.register_local_store().await?;
        PersistentStoreImporter::new(
            &self.store,
            &*self.records,
            &self.schema,
            self.config.data_file_threshold,
        )
        .import(&*self.delegate)?;
        manager.export_new_local_events().await?;
        manager.export_data_files().await?;
        Ok(store_id)
    }

    /// Tears down sync state and unregisters the store remotely. Waits for
    /// a merge in progress, cancelling it if it has not begun committing.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::NotLeeched`] if not syncing.
    pub async fn stop_synchronization(&self) -> EnsembleResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                EnsembleState::Leeched => *state = EnsembleState::Deleeching,
                EnsembleState::Deleeched => return Err(EnsembleError::NotLeeched),
                other => {
                    return Err(EnsembleError::DisallowedStateChange {
                        from: format!("{other:?}"),
                        to: format!("{:?}", EnsembleState::Deleeching),
                    })
                }
            }
        }
        self.cancel_merge();
        let _queue = self.merge_queue.lock().await;

        if let Err(e) = self.cloud_manager().unregister_local_store().await {
            warn!(error = %e, "could not unregister store");
        }
        let result = self.tear_down();
        info!(ensemble = %self.config.ensemble_id, "deleeched");
        result
    }

    fn tear_down(&self) -> EnsembleResult<()> {
        let result = self.store.remove_event_store();
        *self.state.write() = EnsembleState::Deleeched;
        self.notify(EnsembleNotification::Deleeched);
        Ok(result?)
    }

    fn force_reset(&self, error: &EnsembleError) {
        warn!(error = %error, "sync state invalid, forcing reset");
        if let Err(e) = self.tear_down() {
            warn!(error = %e, "could not remove event store during reset");
        }
        self.delegate.did_force_reset(error);
        self.notify(EnsembleNotification::ForcedReset {
            reason: error.to_string(),
        });
    }

    // ---- local saves ----

    /// Records committed local record changes as a save event.
    ///
    /// Must not be called with batches the ensemble itself committed
    /// during a merge. Returns `None` if the batch changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::NotLeeched`] if not syncing, or the error
    /// that prevented the event from being built.
    pub fn capture_local_changes(
        &self,
        batch: &ChangeBatch,
    ) -> EnsembleResult<Option<StoreModificationEvent>> {
        self.require_leeched()?;
        self.save_generation.fetch_add(1, Ordering::SeqCst);
        if batch.is_empty() {
            return Ok(None);
        }

        let mut builder =
            EventBuilder::new(&self.store, &self.schema, self.config.data_file_threshold);
        builder.make_new_event(EventType::Save, None)?;
        if let Err(e) = self.add_batch(&mut builder, batch) {
            builder.discard_new_event()?;
            return Err(e);
        }
        if !builder.has_changes() {
            builder.discard_new_event()?;
            return Ok(None);
        }
        let event = builder.finalize_new_event()?;
        self.notify(EnsembleNotification::LocalSaveCaptured {
            revision_number: event.revision_number(),
        });
        Ok(Some(event))
    }

    fn add_batch(&self, builder: &mut EventBuilder<'_>, batch: &ChangeBatch) -> EnsembleResult<()> {
        builder.add_changes_for_inserted_objects(&batch.inserted, &*self.delegate)?;
        builder.add_changes_for_updated_objects(&batch.updated)?;
        builder.add_changes_for_deleted_objects(&batch.deleted)
    }

    /// Waits until queued merges and leech operations have finished.
    pub async fn process_pending_changes(&self) {
        let _queue = self.merge_queue.lock().await;
    }

    // ---- merging ----

    /// Requests cancellation of the merge in progress. Returns false if
    /// the merge is already committing and will run to completion.
    pub fn cancel_merge(&self) -> bool {
        if self.integrator_state().is_committing() {
            return false;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        true
    }

    /// Imports remote events, integrates them, exports local events and
    /// rebases when worthwhile. Queued behind any merge in progress.
    ///
    /// Transient failures are retried per the retry configuration, except
    /// deferrals, which wait for more data and are returned at once.
    /// State-invalidating failures reset sync state, notify the delegate
    /// and are returned.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the merge.
    pub async fn merge(&self) -> EnsembleResult<MergeReport> {
        let _queue = self.merge_queue.lock().await;
        self.require_leeched()?;
        self.cancelled.store(false, Ordering::SeqCst);
        self.notify(EnsembleNotification::MergeStarted);

        let retry = &self.config.retry;
        let mut attempt = 0;
        let result = loop {
            let error = match self.merge_once().await {
                Ok(report) => break Ok(report),
                Err(e) => e,
            };
            let retryable = error.is_retryable() && !error.is_deferral();
            if !retryable || attempt + 1 >= retry.max_attempts {
                break Err(error);
            }
            attempt += 1;
            self.stats.write().retries += 1;
            debug!(attempt, error = %error, "retrying merge");
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            if let Err(e) = self.check_cancelled() {
                break Err(e);
            }
        };

        match result {
            Ok(report) => {
                {
                    let mut stats = self.stats.write();
                    stats.merges_completed += 1;
                    stats.events_integrated += report.integration.events_integrated as u64;
                    stats.events_exported += report.events_exported as u64;
                    stats.rebases += u64::from(report.rebase.is_some());
                    stats.last_merge_time = Some(Instant::now());
                    stats.last_error = None;
                }
                self.notify(EnsembleNotification::MergeCompleted {
                    events_integrated: report.integration.events_integrated,
                    events_exported: report.events_exported,
                });
                Ok(report)
            }
            Err(error) => {
                if error.is_deferral() {
                    warn!(error = %error, "merge deferred");
                } else {
                    warn!(error = %error, "merge failed");
                }
                self.stats.write().last_error = Some(error.to_string());
                self.notify(EnsembleNotification::MergeFailed {
                    message: error.to_string(),
                });
                if error.requires_reset() {
                    self.force_reset(&error);
                }
                Err(error)
            }
        }
    }

    async fn merge_once(&self) -> EnsembleResult<MergeReport> {
        let started = Instant::now();
        let mut report = MergeReport::default();
        let manager = self.cloud_manager();

        manager.ensure_connected().await?;
        manager.check_identity().await?;
        self.check_cancelled()?;

        report.events_imported = manager.import_new_remote_events().await?;
        report.data_files_imported = manager.import_new_data_files().await?;
        self.check_cancelled()?;

        let consolidator = BaselineConsolidator::new(&self.store);
        if consolidator.baseline_needs_consolidation()? {
            consolidator.consolidate_baseline()?;
        }

        report.integration = self.integrate()?;
        let batch = &report.integration.batch;
        if !batch.is_empty() {
            self.notify(EnsembleNotification::MergedChangesSaved {
                inserted: batch.inserted.len(),
                updated: batch.updated.len(),
                deleted: batch.deleted.len(),
            });
        }

        // Past this point the merge is committed and runs to completion.
        report.events_exported = manager.export_new_local_events().await?;
        manager.export_data_files().await?;

        if self.config.rebase.automatic {
            let rebaser = Rebaser::new(&self.store, &self.schema, &self.config.rebase);
            if rebaser.should_rebase()? {
                report.rebase = rebaser.rebase()?;
            }
        }
        if let Some(rebase) = &report.rebase {
            self.notify(EnsembleNotification::Rebased {
                events_removed: rebase.events_removed,
            });
            report.events_exported += manager.export_new_local_events().await?;
            manager.remove_outdated_remote_files().await?;
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    fn integrate(&self) -> EnsembleResult<MergeOutcome> {
        EventIntegrator::new(
            &self.store,
            &*self.records,
            &self.schema,
            &*self.delegate,
            &self.config,
            &self.integrator_state,
            &self.cancelled,
            &self.save_generation,
        )
        .merge()
    }

    /// Rebases now, regardless of the automatic rebase setting, and
    /// exports the new baseline.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::NotLeeched`] if not syncing, or the rebase
    /// or export error.
    pub async fn rebase(&self) -> EnsembleResult<Option<RebaseOutcome>> {
        let _queue = self.merge_queue.lock().await;
        self.require_leeched()?;
        let outcome = Rebaser::new(&self.store, &self.schema, &self.config.rebase).rebase()?;
        if let Some(rebase) = &outcome {
            self.stats.write().rebases += 1;
            self.notify(EnsembleNotification::Rebased {
                events_removed: rebase.events_removed,
            });
            let manager = self.cloud_manager();
            manager.export_new_local_events().await?;
            manager.remove_outdated_remote_files().await?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloudFileSystem;
    use crate::config::RetryConfig;
    use crate::record_store::{MemoryRecordStore, Record};
    use ensembles_model::{AttributeType, EntityDescriptor};

    type TestEnsemble = Ensemble<MemoryRecordStore, MemoryCloudFileSystem>;

    fn schema() -> Arc<ModelSchema> {
        Arc::new(
            ModelSchema::new("v1").with_entity(
                EntityDescriptor::new("Note").with_attribute("text", AttributeType::Text),
            ),
        )
    }

    fn ensemble(cloud: Arc<MemoryCloudFileSystem>) -> TestEnsemble {
        let schema = schema();
        let records = Arc::new(MemoryRecordStore::new(schema.clone()));
        let config = EnsembleConfig::new("notes").with_retry(RetryConfig::no_retry());
        Ensemble::new(config, schema, records, cloud).unwrap()
    }

    #[tokio::test]
    async fn leech_and_deleech() {
        let cloud = Arc::new(MemoryCloudFileSystem::new());
        let ensemble = ensemble(cloud.clone());
        let mut notifications = ensemble.subscribe();
        assert_eq!(ensemble.state(), EnsembleState::Deleeched);
        assert!(matches!(ensemble.merge().await, Err(EnsembleError::NotLeeched)));

        ensemble.start_synchronization().await.unwrap();
        assert!(ensemble.is_leeched());
        let store_id = ensemble.local_store_id().unwrap();
        assert_eq!(
            notifications.recv().await.unwrap(),
            EnsembleNotification::Leeched {
                store_id: store_id.clone()
            }
        );
        assert!(cloud
            .file_paths()
            .contains(&format!("/notes/stores/{store_id}")));
        assert!(matches!(
            ensemble.start_synchronization().await,
            Err(EnsembleError::AlreadyLeeched)
        ));

        ensemble.stop_synchronization().await.unwrap();
        assert_eq!(ensemble.state(), EnsembleState::Deleeched);
        assert!(!ensemble.event_store().contains_event_data());
        assert!(!cloud
            .file_paths()
            .contains(&format!("/notes/stores/{store_id}")));
    }

    #[tokio::test]
    async fn failed_leech_leaves_ensemble_deleeched() {
        let cloud = Arc::new(MemoryCloudFileSystem::new());
        let ensemble = ensemble(cloud.clone());
        cloud.fail_next(1);
        assert!(ensemble.start_synchronization().await.is_err());
        assert_eq!(ensemble.state(), EnsembleState::Deleeched);
        assert!(!ensemble.event_store().contains_event_data());
        ensemble.start_synchronization().await.unwrap();
    }

    #[tokio::test]
    async fn local_saves_are_captured_and_exported() {
        let cloud = Arc::new(MemoryCloudFileSystem::new());
        let ensemble = ensemble(cloud.clone());
        ensemble.start_synchronization().await.unwrap();

        let (_, batch) = ensemble
            .records()
            .insert(Record::new("Note").with_attribute("text", "hi"))
            .unwrap();
        let event = ensemble.capture_local_changes(&batch).unwrap().unwrap();
        assert_eq!(event.revision_number(), 1);
        assert!(ensemble
            .capture_local_changes(&ChangeBatch::default())
            .unwrap()
            .is_none());

        let report = ensemble.merge().await.unwrap();
        assert_eq!(report.events_exported, 1);
        assert!(report.integration.is_empty());
        let store_id = ensemble.local_store_id().unwrap();
        assert!(cloud
            .file_paths()
            .contains(&format!("/notes/events/1_{store_id}_1.cbor")));
        assert_eq!(ensemble.stats().merges_completed, 1);
    }

    #[tokio::test]
    async fn identity_change_forces_reset() {
        let cloud = Arc::new(MemoryCloudFileSystem::new());
        let ensemble = ensemble(cloud.clone());
        ensemble.start_synchronization().await.unwrap();
        let mut notifications = ensemble.subscribe();

        cloud.set_identity_token(Some("another account".into()));
        let err = ensemble.merge().await.unwrap_err();
        assert!(matches!(err, EnsembleError::CloudIdentityChanged));
        assert_eq!(ensemble.state(), EnsembleState::Deleeched);
        assert!(!ensemble.event_store().contains_event_data());

        let mut saw_reset = false;
        while let Ok(notification) = notifications.try_recv() {
            saw_reset |= matches!(notification, EnsembleNotification::ForcedReset { .. });
        }
        assert!(saw_reset);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let cloud = Arc::new(MemoryCloudFileSystem::new());
        let schema = schema();
        let records = Arc::new(MemoryRecordStore::new(schema.clone()));
        let config = EnsembleConfig::new("notes").with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        );
        let ensemble: TestEnsemble = Ensemble::new(config, schema, records, cloud.clone()).unwrap();
        ensemble.start_synchronization().await.unwrap();

        cloud.fail_next(1);
        ensemble.merge().await.unwrap();
        assert_eq!(ensemble.stats().retries, 1);

        cloud.fail_next(10);
        assert!(ensemble.merge().await.is_err());
        assert_eq!(ensemble.stats().retries, 3);
        assert!(ensemble.stats().last_error.is_some());
        assert!(ensemble.is_leeched());
    }

    #[tokio::test]
    async fn merge_can_be_cancelled_between_stages() {
        let cloud = Arc::new(MemoryCloudFileSystem::new());
        let ensemble = Arc::new(ensemble(cloud.clone()));
        ensemble.start_synchronization().await.unwrap();

        cloud.set_latency(Duration::from_millis(100));
        let merging = {
            let ensemble = ensemble.clone();
            tokio::spawn(async move { ensemble.merge().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ensemble.cancel_merge());
        let result = merging.await.unwrap();
        assert!(matches!(result, Err(EnsembleError::Cancelled)));
        assert!(ensemble.is_leeched());
    }
}
