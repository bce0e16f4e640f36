//! The event integrator: replays events and commits the merged state.

use crate::builder::EventBuilder;
use crate::config::EnsembleConfig;
use crate::delegate::{EnsembleDelegate, Reparation};
use crate::error::{EnsembleError, EnsembleResult};
use crate::merge_context::MergeContext;
use crate::record_store::{ChangeBatch, ObjectId, RecordStore};
use crate::revision_manager::RevisionManager;
use ensembles_model::{EventType, ModelSchema, RevisionSet};
use ensembles_store::EventStore;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Phase of the integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegratorState {
    /// No merge in progress.
    #[default]
    Idle,
    /// Replaying events into the working copy.
    Merging,
    /// Committing the merged state.
    Committing,
    /// Discarding the working copy.
    Aborting,
}

impl IntegratorState {
    /// Returns true while a merge is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, IntegratorState::Idle)
    }

    /// Returns true once cancellation is no longer honoured.
    pub fn is_committing(&self) -> bool {
        matches!(self, IntegratorState::Committing)
    }
}

/// What a merge changed.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// New events integrated.
    pub events_integrated: usize,
    /// Events replayed, including concurrent events replayed again.
    pub events_replayed: usize,
    /// Merge event recorded, if anything was integrated.
    pub merge_event_id: Option<String>,
    /// Changes committed to the record store.
    pub batch: ChangeBatch,
}

impl MergeOutcome {
    /// Returns true if nothing was integrated.
    pub fn is_empty(&self) -> bool {
        self.events_integrated == 0
    }
}

/// Merges pending events into the record store.
///
/// The integrator is single-writer: callers serialize merges. A merge is
/// all-or-nothing; the record store sees one commit or none.
pub struct EventIntegrator<'a> {
    store: &'a EventStore,
    records: &'a dyn RecordStore,
    schema: &'a ModelSchema,
    delegate: &'a dyn EnsembleDelegate,
    config: &'a EnsembleConfig,
    state: &'a RwLock<IntegratorState>,
    cancelled: &'a AtomicBool,
    save_generation: &'a AtomicU64,
}

impl<'a> EventIntegrator<'a> {
    /// Creates an integrator.
    ///
    /// `cancelled` is polled between stages. `save_generation` is bumped
    /// by every local save; a change during the merge aborts it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a EventStore,
        records: &'a dyn RecordStore,
        schema: &'a ModelSchema,
        delegate: &'a dyn EnsembleDelegate,
        config: &'a EnsembleConfig,
        state: &'a RwLock<IntegratorState>,
        cancelled: &'a AtomicBool,
        save_generation: &'a AtomicU64,
    ) -> Self {
        Self {
            store,
            records,
            schema,
            delegate,
            config,
            state,
            cancelled,
            save_generation,
        }
    }

    fn set_state(&self, state: IntegratorState) {
        *self.state.write() = state;
    }

    fn check_cancelled(&self) -> EnsembleResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(EnsembleError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Integrates every pending remote event.
    ///
    /// # Errors
    ///
    /// Fails if the integrity checks fail, the merge is cancelled before
    /// commit, the host vetoes it, a local save happens meanwhile, or the
    /// commit cannot be repaired. The record store is unchanged on error.
    pub fn merge(&self) -> EnsembleResult<MergeOutcome> {
        if self.state.read().is_active() {
            return Err(EnsembleError::DisallowedStateChange {
                from: format!("{:?}", *self.state.read()),
                to: format!("{:?}", IntegratorState::Merging),
            });
        }
        self.set_state(IntegratorState::Merging);
        let result = self.run();
        if result.is_err() {
            self.set_state(IntegratorState::Aborting);
        }
        self.set_state(IntegratorState::Idle);
        result
    }

    fn run(&self) -> EnsembleResult<MergeOutcome> {
        let manager = RevisionManager::new(self.store);
        manager.check_local_store_not_abandoned()?;

        let (events, events_integrated) = manager.events_to_integrate()?;
        if events_integrated == 0 {
            debug!("no events to integrate");
            return Ok(MergeOutcome::default());
        }

        match manager.check_integration_prerequisites(&events, self.schema) {
            Ok(()) => self.store.reset_unknown_version_merges()?,
            Err(EnsembleError::UnknownModelVersion { version }) => {
                let attempts = self.store.note_unknown_version_merge()?;
                warn!(%version, attempts, "events recorded with unknown model version");
                if attempts >= self.config.max_unknown_model_version_merges {
                    return Err(EnsembleError::corruption(format!(
                        "model version {version} still unknown after {attempts} merges"
                    )));
                }
                return Err(EnsembleError::UnknownModelVersion { version });
            }
            Err(e) => return Err(e),
        }
        self.check_cancelled()?;

        let saves_at_start = self.save_generation.load(Ordering::SeqCst);
        let mut context = MergeContext::new(self.store, self.records, self.schema);
        context.replay(&events)?;
        self.check_cancelled()?;

        self.set_state(IntegratorState::Committing);
        let mut changes = context.change_set();
        let mut repaired = BTreeSet::new();
        {
            let mut reparation = Reparation::new(&mut changes, self.records, &mut repaired);
            if !self.delegate.should_save_merged_changes(&mut reparation) {
                info!("merge vetoed by host");
                return Err(EnsembleError::MergeAborted);
            }
        }
        if self.save_generation.load(Ordering::SeqCst) != saves_at_start {
            return Err(EnsembleError::SaveOccurredDuringMerge);
        }

        let batch = self.commit_with_repairs(&mut changes, &mut repaired)?;

        self.store
            .map_global_identifiers(&context.staged_identifiers())?;
        let baseline = events
            .iter()
            .find(|e| e.event_type == EventType::Baseline)
            .map(|e| e.unique_identifier.clone());
        let merged = events.iter().fold(
            manager.revision_set_for_last_merge_or_baseline(),
            |set: RevisionSet, event| set.store_wise_maximum(&event.revision_set()),
        );
        let merge_event_id = self.record_merge_event(merged, &batch, &repaired)?;
        if let Some(baseline) = baseline {
            self.store.set_baseline_used_to_construct_store(Some(baseline))?;
        }
        self.store.flush()?;

        info!(
            events = events_integrated,
            replayed = events.len(),
            inserted = batch.inserted.len(),
            updated = batch.updated.len(),
            deleted = batch.deleted.len(),
            "merged events"
        );
        self.delegate.did_save_merged_changes(&batch);

        Ok(MergeOutcome {
            events_integrated,
            events_replayed: events.len(),
            merge_event_id: Some(merge_event_id),
            batch,
        })
    }

    fn commit_with_repairs(
        &self,
        changes: &mut crate::record_store::ChangeSet,
        repaired: &mut BTreeSet<ObjectId>,
    ) -> EnsembleResult<ChangeBatch> {
        let max_attempts = self.config.max_save_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.records.commit(changes) {
                Ok(batch) => return Ok(batch),
                Err(error) => {
                    warn!(attempts, %error, "saving merged changes failed");
                    let retry = attempts < max_attempts && {
                        let mut reparation = Reparation::new(changes, self.records, repaired);
                        self.delegate
                            .did_fail_to_save_merged_changes(&error, &mut reparation)
                    };
                    if !retry {
                        return Err(EnsembleError::MergeCommitFailed {
                            attempts,
                            message: error.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Records the merge, including any objects the host repaired.
    fn record_merge_event(
        &self,
        merged: RevisionSet,
        batch: &ChangeBatch,
        repaired: &BTreeSet<ObjectId>,
    ) -> EnsembleResult<String> {
        let mut builder =
            EventBuilder::new(self.store, self.schema, self.config.data_file_threshold);
        builder.make_new_event(EventType::Merge, None)?;
        builder.set_revision_set_of_other_stores(merged);

        let result = self.add_repairs(&mut builder, batch, repaired);
        if let Err(e) = result {
            builder.discard_new_event()?;
            return Err(e);
        }
        let event = builder.finalize_new_event()?;
        Ok(event.unique_identifier)
    }

    fn add_repairs(
        &self,
        builder: &mut EventBuilder<'_>,
        batch: &ChangeBatch,
        repaired: &BTreeSet<ObjectId>,
    ) -> EnsembleResult<()> {
        if repaired.is_empty() {
            return Ok(());
        }
        let inserted: Vec<_> = batch
            .inserted
            .iter()
            .filter(|(id, _)| repaired.contains(id))
            .cloned()
            .collect();
        let updated: Vec<_> = batch
            .updated
            .iter()
            .filter(|u| repaired.contains(&u.object_id))
            .cloned()
            .collect();
        let deleted: Vec<_> = batch
            .deleted
            .iter()
            .filter(|(id, _)| repaired.contains(id))
            .cloned()
            .collect();
        builder.add_changes_for_inserted_objects(&inserted, self.delegate)?;
        builder.add_changes_for_updated_objects(&updated)?;
        builder.add_changes_for_deleted_objects(&deleted)
    }
}
