//! Deciding which events to replay and whether replay is safe.

use crate::error::{EnsembleError, EnsembleResult};
use ensembles_model::{GlobalCount, ModelSchema, RevisionSet, StoreModificationEvent};
use ensembles_store::EventStore;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Read-only view over an [`EventStore`] answering revision questions.
pub struct RevisionManager<'a> {
    store: &'a EventStore,
}

impl<'a> RevisionManager<'a> {
    /// Creates a manager for `store`.
    pub fn new(store: &'a EventStore) -> Self {
        Self { store }
    }

    fn local_store_id(&self) -> EnsembleResult<String> {
        Ok(self.store.persistent_store_id()?)
    }

    /// Everything the local record store already reflects: the store-wise
    /// maximum of the current baseline and the latest local merge event.
    pub fn revision_set_for_last_merge_or_baseline(&self) -> RevisionSet {
        let mut set = self
            .store
            .current_baseline()
            .map(|b| b.revision_set())
            .unwrap_or_default();
        let last_merge = self.store.last_merge_revision().unwrap_or(0);
        if last_merge > 0 {
            if let Ok(store_id) = self.store.persistent_store_id() {
                if let Some(merge) = self.store.event_for_revision(&store_id, last_merge) {
                    set = set.store_wise_maximum(&merge.revision_set());
                }
            }
        }
        set
    }

    /// Remote save and merge events the local record store has not
    /// applied, in replay order. A baseline that was not used to build the
    /// local record store comes first.
    ///
    /// # Errors
    ///
    /// Fails before the event store is prepared.
    pub fn fetch_uncommitted_events(&self) -> EnsembleResult<Vec<StoreModificationEvent>> {
        let local = self.local_store_id()?;
        let applied = self.revision_set_for_last_merge_or_baseline();

        let mut events = Vec::new();
        if let Some(baseline) = self.store.current_baseline() {
            let used = self.store.baseline_used_to_construct_store()?;
            if used.as_deref() != Some(baseline.unique_identifier.as_str()) {
                events.push(baseline);
            }
        }
        for store_id in self.store.store_ids() {
            if store_id == local {
                continue;
            }
            let after = applied.revision_number_for_store(&store_id);
            events.extend(self.store.events_for_store_after(&store_id, after));
        }
        ensembles_model::sort_canonically(&mut events);
        Ok(events)
    }

    /// Already applied events concurrent with the given events, closed
    /// over concurrency.
    ///
    /// An event is concurrent with another if the other did not know it
    /// when it was created. Each event added is itself checked against the
    /// remaining applied events until nothing new is found, so the replay
    /// also covers the events that decided the state the concurrent ones
    /// are replayed over. Every replica then resolves conflicting property
    /// changes by the same replay order, however its events were batched.
    pub fn fetch_concurrent_events(
        &self,
        events: &[StoreModificationEvent],
    ) -> Vec<StoreModificationEvent> {
        let incoming: BTreeSet<&str> = events
            .iter()
            .map(|e| e.unique_identifier.as_str())
            .collect();
        let mut knowledge: Vec<RevisionSet> = events
            .iter()
            .filter(|e| e.event_type.is_revisioned())
            .map(StoreModificationEvent::revision_set)
            .collect();
        if knowledge.is_empty() {
            return Vec::new();
        }
        let baseline = self
            .store
            .current_baseline()
            .map(|b| b.revision_set())
            .unwrap_or_default();

        let mut remaining: Vec<StoreModificationEvent> = self
            .store
            .revisioned_events()
            .into_iter()
            .filter(|e| !incoming.contains(e.unique_identifier.as_str()))
            .filter(|e| e.revision_number() > baseline.revision_number_for_store(e.store_id()))
            .collect();
        let mut concurrent = Vec::new();
        loop {
            let (found, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|e| {
                knowledge
                    .iter()
                    .any(|set| set.revision_number_for_store(e.store_id()) < e.revision_number())
            });
            if found.is_empty() {
                break;
            }
            knowledge.extend(found.iter().map(StoreModificationEvent::revision_set));
            concurrent.extend(found);
            remaining = rest;
        }
        debug!(events = concurrent.len(), "expanded concurrent events");
        concurrent
    }

    /// Events to replay in a merge: uncommitted events plus the concurrent
    /// events they did not know about, in replay order.
    ///
    /// # Errors
    ///
    /// Fails before the event store is prepared.
    pub fn events_to_integrate(&self) -> EnsembleResult<(Vec<StoreModificationEvent>, usize)> {
        let uncommitted = self.fetch_uncommitted_events()?;
        let new_count = uncommitted.len();
        let mut events = self.fetch_concurrent_events(&uncommitted);
        events.extend(uncommitted);
        ensembles_model::sort_canonically(&mut events);
        Ok((events, new_count))
    }

    /// Verifies that `events` can be replayed.
    ///
    /// Checks, in order: no mandatory event is still being imported, every
    /// model version is known, every event matches the schema, each store's
    /// revisions continue from the last applied one without gaps, every
    /// revision an event claims to know is available, and every referenced
    /// data file is present.
    ///
    /// # Errors
    ///
    /// Returns the first failed check. All failures except schema
    /// mismatches are deferrals.
    pub fn check_integration_prerequisites(
        &self,
        events: &[StoreModificationEvent],
        schema: &ModelSchema,
    ) -> EnsembleResult<()> {
        let pending = self.store.incomplete_mandatory_event_identifiers()?;
        if !pending.is_empty() {
            return Err(EnsembleError::IncompleteEventsPending {
                identifiers: pending,
            });
        }

        if let Some(event) = events
            .iter()
            .find(|e| !schema.is_known_version(&e.model_version))
        {
            return Err(EnsembleError::UnknownModelVersion {
                version: event.model_version.clone(),
            });
        }

        for event in events {
            schema.validate_event(event).map_err(|e| {
                EnsembleError::corruption(format!("event {}: {e}", event.unique_identifier))
            })?;
        }

        self.check_continuity(events)?;
        self.check_dependencies(events)?;
        self.check_data_files(events)
    }

    fn check_continuity(&self, events: &[StoreModificationEvent]) -> EnsembleResult<()> {
        let local = self.local_store_id()?;
        let applied = self.revision_set_for_last_merge_or_baseline();
        let mut by_store: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        for event in events.iter().filter(|e| e.event_type.is_revisioned()) {
            if event.store_id() != local {
                by_store
                    .entry(event.store_id())
                    .or_default()
                    .push(event.revision_number());
            }
        }
        for (store_id, mut revisions) in by_store {
            revisions.sort_unstable();
            let mut expected = applied.revision_number_for_store(store_id) + 1;
            for found in revisions {
                if found < expected {
                    continue;
                }
                if found != expected {
                    return Err(EnsembleError::DiscontinuousRevisions {
                        store_id: store_id.to_string(),
                        expected,
                        found,
                    });
                }
                expected += 1;
            }
        }
        Ok(())
    }

    fn check_dependencies(&self, events: &[StoreModificationEvent]) -> EnsembleResult<()> {
        let local = self.local_store_id()?;
        let local_last = self.store.last_revision()?;
        let applied = self.revision_set_for_last_merge_or_baseline();
        for event in events.iter().filter(|e| e.event_type.is_revisioned()) {
            for revision in event.revision_set_of_other_stores_at_creation.iter() {
                let store_id = revision.store_id.as_str();
                let needed = revision.revision_number;
                let available = if store_id == local {
                    needed <= local_last
                } else {
                    needed <= applied.revision_number_for_store(store_id)
                        || self.store.contains_revision(store_id, needed)
                };
                if !available {
                    return Err(EnsembleError::MissingDependencies {
                        event_id: event.unique_identifier.clone(),
                        store_id: store_id.to_string(),
                        revision_number: needed,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_data_files(&self, events: &[StoreModificationEvent]) -> EnsembleResult<()> {
        let missing: Vec<String> = events
            .iter()
            .flat_map(StoreModificationEvent::data_filenames)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|name| !self.store.data_files().contains(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            debug!(count = missing.len(), "data files not yet available");
            Err(EnsembleError::MissingDataFiles { filenames: missing })
        }
    }

    /// Fails if the current baseline covers local revisions this store
    /// never produced, meaning peers dropped the local history.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::StoreUnregistered`] in that case.
    pub fn check_local_store_not_abandoned(&self) -> EnsembleResult<()> {
        let Some(baseline) = self.store.current_baseline() else {
            return Ok(());
        };
        let local = self.local_store_id()?;
        if baseline.revision_set().revision_number_for_store(&local) > self.store.last_revision()? {
            return Err(EnsembleError::StoreUnregistered);
        }
        Ok(())
    }

    /// Highest global count of any event.
    pub fn maximum_global_count(&self) -> GlobalCount {
        self.store
            .all_events()
            .iter()
            .map(|e| e.global_count)
            .max()
            .unwrap_or(0)
    }

    /// Store-wise maximum over every known event.
    pub fn revision_set_of_most_recent_events(&self) -> RevisionSet {
        self.store
            .all_events()
            .iter()
            .fold(RevisionSet::new(), |set, event| {
                set.store_wise_maximum(&event.revision_set())
            })
    }

    /// Revisions every participating store is known to have incorporated.
    ///
    /// Participants are the local store and every store with save or merge
    /// events. A remote participant's knowledge is the revision set of its
    /// latest event; the local store's is what it has merged plus its own
    /// latest revision. Stores some participant has never heard of are
    /// left out, deferring their history.
    ///
    /// # Errors
    ///
    /// Fails before the event store is prepared.
    pub fn common_revision_set(&self) -> EnsembleResult<RevisionSet> {
        let local = self.local_store_id()?;
        let mut local_knowledge = self.revision_set_for_last_merge_or_baseline();
        if let Some(latest) = self.latest_event_of_store(&local) {
            local_knowledge.include(latest.own_revision);
        }

        // A store whose events were all folded into the baseline knew at
        // least what the baseline covers.
        let baseline = self
            .store
            .current_baseline()
            .map(|b| b.revision_set())
            .unwrap_or_default();
        let mut participants = self.store.store_ids();
        participants.extend(baseline.iter().map(|r| r.store_id.clone()));

        let mut knowledge = vec![local_knowledge];
        for store_id in participants {
            if store_id == local {
                continue;
            }
            match self.latest_event_of_store(&store_id) {
                Some(latest) => knowledge.push(latest.revision_set()),
                None => knowledge.push(baseline.clone()),
            }
        }
        Ok(RevisionSet::common_minimum(knowledge.iter()))
    }

    fn latest_event_of_store(&self, store_id: &str) -> Option<StoreModificationEvent> {
        self.store.events_for_store(store_id).pop()
    }

    /// Events entirely covered by `set`, excluding baselines.
    pub fn events_covered_by(&self, set: &RevisionSet) -> Vec<StoreModificationEvent> {
        self.store
            .revisioned_events()
            .into_iter()
            .filter(|e| e.revision_number() <= set.revision_number_for_store(e.store_id()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembles_model::{
        AttributeType, EntityDescriptor, EventType, GlobalIdentifier, ObjectChange,
        PropertyChangeValue, Revision,
    };

    fn schema() -> ModelSchema {
        ModelSchema::new("v1")
            .with_entity(EntityDescriptor::new("Note").with_attribute("text", AttributeType::Text))
    }

    fn remote(store: &str, rev: i64, gc: i64, others: RevisionSet) -> StoreModificationEvent {
        let mut event = StoreModificationEvent::new_incomplete(
            format!("{store}-{rev}"),
            Revision::new(store, rev, gc),
            others,
            "v1",
        );
        event.object_changes.push(ObjectChange::update(
            GlobalIdentifier::new("Note", "n"),
            vec![PropertyChangeValue::attribute("text", format!("{store}{rev}"))],
        ));
        event.commit(EventType::Save).unwrap();
        event
    }

    fn store() -> (EventStore, String) {
        let store = EventStore::in_memory("test");
        let id = store.prepare_new_event_store().unwrap();
        (store, id)
    }

    #[test]
    fn uncommitted_events_are_remote_and_sorted() {
        let (store, _) = store();
        store.add_event(remote("B", 2, 5, RevisionSet::new())).unwrap();
        store.add_event(remote("B", 1, 2, RevisionSet::new())).unwrap();
        store.add_event(remote("C", 1, 3, RevisionSet::new())).unwrap();

        let manager = RevisionManager::new(&store);
        let events = manager.fetch_uncommitted_events().unwrap();
        let order: Vec<_> = events.iter().map(|e| e.unique_identifier.as_str()).collect();
        assert_eq!(order, vec!["B-1", "C-1", "B-2"]);
        manager
            .check_integration_prerequisites(&events, &schema())
            .unwrap();
    }

    #[test]
    fn gap_in_revisions_is_rejected() {
        let (store, _) = store();
        for (rev, gc) in [(1, 1), (2, 2), (4, 4)] {
            store.add_event(remote("S", rev, gc, RevisionSet::new())).unwrap();
        }
        let manager = RevisionManager::new(&store);
        let events = manager.fetch_uncommitted_events().unwrap();
        let err = manager
            .check_integration_prerequisites(&events, &schema())
            .unwrap_err();
        match err {
            EnsembleError::DiscontinuousRevisions {
                store_id,
                expected,
                found,
            } => {
                assert_eq!(store_id, "S");
                assert_eq!(expected, 3);
                assert_eq!(found, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }

        store.add_event(remote("S", 3, 3, RevisionSet::new())).unwrap();
        let events = manager.fetch_uncommitted_events().unwrap();
        manager
            .check_integration_prerequisites(&events, &schema())
            .unwrap();
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let (store, _) = store();
        let others = RevisionSet::from_revisions([Revision::new("C", 3, 3)]);
        store.add_event(remote("B", 1, 4, others)).unwrap();
        let manager = RevisionManager::new(&store);
        let events = manager.fetch_uncommitted_events().unwrap();
        assert!(matches!(
            manager.check_integration_prerequisites(&events, &schema()),
            Err(EnsembleError::MissingDependencies { revision_number: 3, .. })
        ));
    }

    #[test]
    fn unknown_model_version_and_pending_imports_defer() {
        let (store, _) = store();
        let mut event = remote("B", 1, 1, RevisionSet::new());
        event.model_version = "v9".into();
        store.add_event(event).unwrap();
        let manager = RevisionManager::new(&store);
        let events = manager.fetch_uncommitted_events().unwrap();
        let err = manager
            .check_integration_prerequisites(&events, &schema())
            .unwrap_err();
        assert!(err.is_deferral());

        store.register_incomplete_event_identifier("x", true).unwrap();
        assert!(matches!(
            manager.check_integration_prerequisites(&events, &schema()),
            Err(EnsembleError::IncompleteEventsPending { .. })
        ));
    }

    #[test]
    fn concurrent_events_are_expanded() {
        let (store, _) = store();
        store.add_event(remote("B", 1, 1, RevisionSet::new())).unwrap();
        let manager = RevisionManager::new(&store);
        let first = manager.fetch_uncommitted_events().unwrap();
        assert_eq!(first.len(), 1);

        let knows_b = RevisionSet::from_revisions([Revision::new("B", 1, 1)]);
        let unaware = remote("C", 1, 2, RevisionSet::new());
        let aware = remote("D", 1, 3, knows_b);
        let concurrent = manager.fetch_concurrent_events(&[aware.clone()]);
        assert!(concurrent.is_empty());
        let concurrent = manager.fetch_concurrent_events(&[unaware]);
        assert_eq!(concurrent.len(), 1);
        assert_eq!(concurrent[0].unique_identifier, "B-1");
    }

    #[test]
    fn concurrent_expansion_is_transitive() {
        let (store, _) = store();
        let x = RevisionSet::from_revisions([Revision::new("X", 1, 1)]);
        let c = RevisionSet::from_revisions([Revision::new("C", 1, 5)]);
        let x_and_c = x.store_wise_maximum(&c);
        store.add_event(remote("X", 1, 1, RevisionSet::new())).unwrap();
        store.add_event(remote("B", 1, 3, RevisionSet::new())).unwrap();
        store.add_event(remote("C", 1, 5, x)).unwrap();

        // D knows C but not B; B in turn did not know C.
        let d = remote("D", 1, 10, x_and_c);
        let manager = RevisionManager::new(&store);
        let mut ids: Vec<_> = manager
            .fetch_concurrent_events(&[d])
            .into_iter()
            .map(|e| e.unique_identifier)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["B-1", "C-1", "X-1"]);
    }

    #[test]
    fn common_revision_set_is_minimum_over_participants() {
        let (store, local) = store();
        let b_knows = RevisionSet::from_revisions([Revision::new(local.as_str(), 0, 0)]);
        store.add_event(remote("B", 1, 1, b_knows.clone())).unwrap();
        store.add_event(remote("B", 2, 2, b_knows)).unwrap();

        let manager = RevisionManager::new(&store);
        let common = manager.common_revision_set().unwrap();
        // The local store has not merged anything from B.
        assert_eq!(common.revision_number_for_store("B"), 0);
        assert!(!common.has_revision_for_store("C"));
        assert_eq!(manager.maximum_global_count(), 2);
        assert_eq!(
            manager
                .revision_set_of_most_recent_events()
                .revision_number_for_store("B"),
            2
        );
    }

    #[test]
    fn abandoned_store_detected() {
        let (store, local) = store();
        let mut baseline = StoreModificationEvent::new_incomplete(
            "base",
            Revision::new("B", 4, 9),
            RevisionSet::from_revisions([Revision::new(local.as_str(), 5, 8)]),
            "v1",
        );
        baseline.commit(EventType::Baseline).unwrap();
        store.add_event(baseline).unwrap();
        store.set_baseline_identifier(Some("base".into())).unwrap();

        let manager = RevisionManager::new(&store);
        assert!(matches!(
            manager.check_local_store_not_abandoned(),
            Err(EnsembleError::StoreUnregistered)
        ));
    }
}
