//! Baselines: folding history into one event, and consolidating the
//! baselines of peers that rebased concurrently.

use crate::error::EnsembleResult;
use crate::revision_manager::RevisionManager;
use ensembles_model::{
    EventType, GlobalCount, GlobalIdentifier, ObjectChange, ObjectChangeType, Revision,
    RevisionSet, StoreModificationEvent,
};
use ensembles_store::EventStore;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Net effect of a sequence of object changes, keyed by object.
#[derive(Debug, Default)]
pub(crate) struct ChangeFold {
    changes: BTreeMap<GlobalIdentifier, ObjectChange>,
}

impl ChangeFold {
    /// Starts from the changes of a baseline.
    pub(crate) fn from_baseline(baseline: Option<&StoreModificationEvent>) -> Self {
        let mut fold = Self::default();
        if let Some(baseline) = baseline {
            fold.apply_event(baseline);
        }
        fold
    }

    /// Folds every change of an event, which must come after everything
    /// folded so far.
    pub(crate) fn apply_event(&mut self, event: &StoreModificationEvent) {
        for change in &event.object_changes {
            self.apply(change);
        }
    }

    /// Later changes take priority. A delete drops the object; an object
    /// first inserted stays an insert.
    pub(crate) fn apply(&mut self, change: &ObjectChange) {
        let identifier = &change.global_identifier;
        if change.change_type == ObjectChangeType::Delete {
            self.changes.remove(identifier);
            return;
        }
        let mut folded = change.clone();
        if let Some(earlier) = self.changes.get(identifier) {
            folded.merge_values_from_subordinate(earlier);
            if earlier.change_type == ObjectChangeType::Insert {
                folded.change_type = ObjectChangeType::Insert;
            }
        }
        folded.property_change_values.retain(|v| !v.is_empty());
        self.changes.insert(identifier.clone(), folded);
    }

    pub(crate) fn len(&self) -> usize {
        self.changes.len()
    }

    pub(crate) fn into_changes(self) -> Vec<ObjectChange> {
        self.changes.into_values().collect()
    }
}

/// Builds a committed baseline covering `covered`.
pub(crate) fn make_baseline(
    store_id: &str,
    covered: &RevisionSet,
    global_count: GlobalCount,
    model_version: &str,
    changes: Vec<ObjectChange>,
) -> EnsembleResult<StoreModificationEvent> {
    let mut others = covered.clone();
    let own = others
        .remove(store_id)
        .map(|r| Revision::new(store_id, r.revision_number, global_count))
        .unwrap_or_else(|| Revision::new(store_id, 0, global_count));
    let mut baseline = StoreModificationEvent::new_incomplete(
        uuid::Uuid::new_v4().to_string(),
        own,
        others,
        model_version,
    );
    baseline.object_changes = changes;
    baseline.commit(EventType::Baseline)?;
    Ok(baseline)
}

/// Reduces the baselines in the event store to one.
pub struct BaselineConsolidator<'a> {
    store: &'a EventStore,
}

impl<'a> BaselineConsolidator<'a> {
    /// Creates a consolidator for `store`.
    pub fn new(store: &'a EventStore) -> Self {
        Self { store }
    }

    /// Returns true if several baselines exist, or the only one is not
    /// yet the current baseline.
    pub fn baseline_needs_consolidation(&self) -> EnsembleResult<bool> {
        let baselines = self.store.baseline_events();
        Ok(match baselines.as_slice() {
            [] => false,
            [only] => {
                self.store.baseline_identifier()?.as_deref()
                    != Some(only.unique_identifier.as_str())
            }
            _ => true,
        })
    }

    /// Folds all baselines into one, in replay order, and makes it current.
    /// Save and merge events the result covers are removed.
    ///
    /// Returns the identifier of the current baseline, if any.
    ///
    /// # Errors
    ///
    /// Fails on event store errors.
    pub fn consolidate_baseline(&self) -> EnsembleResult<Option<String>> {
        let baselines = self.store.baseline_events();
        let current = match baselines.as_slice() {
            [] => return Ok(None),
            [only] => only.clone(),
            [.., latest] => {
                let mut fold = ChangeFold::default();
                let mut covered = RevisionSet::new();
                let mut global_count = 0;
                for baseline in &baselines {
                    fold.apply_event(baseline);
                    covered = covered.store_wise_maximum(&baseline.revision_set());
                    global_count = global_count.max(baseline.global_count);
                }
                let merged = make_baseline(
                    latest.store_id(),
                    &covered,
                    global_count,
                    &latest.model_version,
                    fold.into_changes(),
                )?;
                self.store.add_event(merged.clone())?;
                for baseline in &baselines {
                    self.store.remove_event(&baseline.unique_identifier)?;
                }
                info!(
                    baselines = baselines.len(),
                    baseline = %merged.unique_identifier,
                    "consolidated baselines"
                );
                merged
            }
        };

        let current_id = Some(current.unique_identifier.as_str());
        if self.store.baseline_identifier()?.as_deref() != current_id {
            self.store
                .set_baseline_identifier(Some(current.unique_identifier.clone()))?;
        }
        let covered = current.revision_set();
        let removed = RevisionManager::new(self.store).events_covered_by(&covered);
        for event in &removed {
            self.store.remove_event(&event.unique_identifier)?;
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "removed events covered by baseline");
        }
        self.store.flush()?;
        Ok(Some(current.unique_identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembles_model::{PropertyChange, PropertyChangeValue};

    fn gid(id: &str) -> GlobalIdentifier {
        GlobalIdentifier::new("Tag", id)
    }

    fn baseline(
        id: &str,
        store: &str,
        rev: i64,
        gc: i64,
        changes: Vec<ObjectChange>,
    ) -> StoreModificationEvent {
        let mut event = StoreModificationEvent::new_incomplete(
            id,
            Revision::new(store, rev, gc),
            RevisionSet::new(),
            "v1",
        );
        event.object_changes = changes;
        event.commit(EventType::Baseline).unwrap();
        event
    }

    #[test]
    fn fold_rules() {
        let mut fold = ChangeFold::default();
        fold.apply(&ObjectChange::insert(
            gid("a"),
            vec![PropertyChangeValue::attribute("name", "first")],
        ));
        fold.apply(&ObjectChange::update(
            gid("a"),
            vec![PropertyChangeValue::attribute("name", "second")],
        ));
        fold.apply(&ObjectChange::insert(gid("b"), vec![]));
        fold.apply(&ObjectChange::delete(gid("b")));

        let changes = fold.into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ObjectChangeType::Insert);
        assert_eq!(
            changes[0].property_change("name").unwrap().change,
            PropertyChange::Attribute("second".into())
        );
    }

    #[test]
    fn consolidates_concurrent_baselines() {
        let store = EventStore::in_memory("t");
        store.prepare_new_event_store().unwrap();
        store
            .add_event(baseline(
                "b1",
                "A",
                3,
                5,
                vec![ObjectChange::insert(
                    gid("x"),
                    vec![PropertyChangeValue::attribute("name", "from A")],
                )],
            ))
            .unwrap();
        store
            .add_event(baseline(
                "b2",
                "B",
                4,
                6,
                vec![ObjectChange::insert(
                    gid("x"),
                    vec![PropertyChangeValue::attribute("name", "from B")],
                )],
            ))
            .unwrap();

        let consolidator = BaselineConsolidator::new(&store);
        assert!(consolidator.baseline_needs_consolidation().unwrap());
        let id = consolidator.consolidate_baseline().unwrap().unwrap();

        let baselines = store.baseline_events();
        assert_eq!(baselines.len(), 1);
        let merged = &baselines[0];
        assert_eq!(merged.unique_identifier, id);
        assert_eq!(store.baseline_identifier().unwrap(), Some(id));
        let set = merged.revision_set();
        assert_eq!(set.revision_number_for_store("A"), 3);
        assert_eq!(set.revision_number_for_store("B"), 4);
        assert_eq!(merged.global_count, 6);
        assert_eq!(merged.object_changes.len(), 1);
        assert_eq!(
            merged.object_changes[0].property_change("name").unwrap().change,
            PropertyChange::Attribute("from B".into())
        );
        assert!(!consolidator.baseline_needs_consolidation().unwrap());
    }
}
