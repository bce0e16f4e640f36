//! Compacting history into a baseline.

use crate::baseline::{make_baseline, ChangeFold};
use crate::config::RebaseConfig;
use crate::error::EnsembleResult;
use crate::revision_manager::RevisionManager;
use ensembles_model::{ModelSchema, StoreModificationEvent};
use ensembles_store::EventStore;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Result of a rebase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseOutcome {
    /// The new baseline.
    pub baseline_id: String,
    /// Save and merge events folded into it.
    pub events_removed: usize,
    /// Data files no longer referenced.
    pub data_files_removed: usize,
}

/// Folds events every peer has incorporated into a new baseline.
pub struct Rebaser<'a> {
    store: &'a EventStore,
    schema: &'a ModelSchema,
    config: &'a RebaseConfig,
}

impl<'a> Rebaser<'a> {
    /// Creates a rebaser.
    pub fn new(store: &'a EventStore, schema: &'a ModelSchema, config: &'a RebaseConfig) -> Self {
        Self {
            store,
            schema,
            config,
        }
    }

    /// Events a rebase would fold, in replay order. Empty while the
    /// current baseline has not been replayed locally.
    fn foldable_events(&self) -> EnsembleResult<Vec<StoreModificationEvent>> {
        let baseline = self.store.baseline_identifier()?;
        if baseline.is_some() && baseline != self.store.baseline_used_to_construct_store()? {
            return Ok(Vec::new());
        }
        let manager = RevisionManager::new(self.store);
        let common = manager.common_revision_set()?;
        Ok(manager.events_covered_by(&common))
    }

    /// Estimated fraction of all object changes a rebase would remove.
    ///
    /// # Errors
    ///
    /// Fails before the event store is prepared.
    pub fn estimated_compaction_following_rebase(&self) -> EnsembleResult<f64> {
        let total = self.store.object_change_count();
        if total == 0 {
            return Ok(0.0);
        }
        let events = self.foldable_events()?;
        if events.is_empty() {
            return Ok(0.0);
        }
        let current = self.store.current_baseline();
        let mut fold = ChangeFold::from_baseline(current.as_ref());
        let mut folded = current.as_ref().map_or(0, |b| b.object_changes.len());
        for event in &events {
            fold.apply_event(event);
            folded += event.object_changes.len();
        }
        let saved = folded.saturating_sub(fold.len());
        Ok(saved as f64 / total as f64)
    }

    /// Returns true if a rebase is worthwhile.
    ///
    /// Without a baseline, that is once enough events exist. With one, it
    /// is when the estimated compaction reaches the threshold.
    ///
    /// # Errors
    ///
    /// Fails before the event store is prepared.
    pub fn should_rebase(&self) -> EnsembleResult<bool> {
        if self.foldable_events()?.is_empty() {
            return Ok(false);
        }
        if self.store.current_baseline().is_none() {
            return Ok(self.store.event_count() >= self.config.min_events_without_baseline);
        }
        Ok(self.estimated_compaction_following_rebase()? >= self.config.compaction_threshold)
    }

    /// Replaces the current baseline and every event covered by the
    /// common revision set with one new baseline, then removes unreferenced
    /// data files and compacts the log.
    ///
    /// Returns `None` if there is nothing to fold.
    ///
    /// # Errors
    ///
    /// Fails on event store errors.
    pub fn rebase(&self) -> EnsembleResult<Option<RebaseOutcome>> {
        let events = self.foldable_events()?;
        if events.is_empty() {
            debug!("nothing to rebase");
            return Ok(None);
        }
        let manager = RevisionManager::new(self.store);
        let mut covered = manager.common_revision_set()?;
        let current = self.store.current_baseline();
        let mut fold = ChangeFold::from_baseline(current.as_ref());
        let mut global_count = current.as_ref().map_or(0, |b| b.global_count);
        if let Some(baseline) = &current {
            covered = covered.store_wise_maximum(&baseline.revision_set());
        }
        for event in &events {
            fold.apply_event(event);
            global_count = global_count.max(event.global_count);
        }

        let store_id = self.store.persistent_store_id()?;
        let baseline = make_baseline(
            &store_id,
            &covered,
            global_count,
            self.schema.version(),
            fold.into_changes(),
        )?;
        let baseline_id = baseline.unique_identifier.clone();

        self.store.add_event(baseline)?;
        let mut removed: BTreeSet<String> = events
            .iter()
            .map(|e| e.unique_identifier.clone())
            .collect();
        if let Some(old) = current {
            removed.insert(old.unique_identifier);
        }
        for id in &removed {
            self.store.remove_event(id)?;
        }
        self.store.set_baseline_identifier(Some(baseline_id.clone()))?;
        self.store
            .set_baseline_used_to_construct_store(Some(baseline_id.clone()))?;
        let data_files_removed = self.store.remove_unreferenced_data_files()?;
        self.store.flush()?;
        self.store.compact()?;

        info!(
            baseline = %baseline_id,
            events_removed = events.len(),
            data_files_removed,
            "rebased event store"
        );
        Ok(Some(RebaseOutcome {
            baseline_id,
            events_removed: events.len(),
            data_files_removed,
        }))
    }
}
