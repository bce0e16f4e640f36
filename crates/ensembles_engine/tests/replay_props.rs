//! Property tests for replay determinism, batched delivery and rebase
//! safety.

use ensembles_engine::{
    EnsembleConfig, EventIntegrator, IntegratorState, MemoryRecordStore, NoopDelegate,
    RebaseConfig, Rebaser,
};
use ensembles_model::{
    AttributeValue, ModelSchema, RevisionNumber, RevisionSet, StoreModificationEvent,
};
use ensembles_testkit::{
    concurrent_history_strategy, history_schema, shuffled_history_strategy, PropTestConfig,
    TestEventStore,
};
use parking_lot::RwLock;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

type ObjectState = BTreeMap<String, BTreeMap<String, AttributeValue>>;

struct Replica {
    store: TestEventStore,
    records: MemoryRecordStore,
    schema: ModelSchema,
    config: EnsembleConfig,
}

impl Replica {
    fn new() -> Self {
        let schema = history_schema();
        Self {
            store: TestEventStore::memory("props"),
            records: MemoryRecordStore::new(Arc::new(schema.clone())),
            schema,
            config: EnsembleConfig::new("props"),
        }
    }

    fn merge(&self) {
        let state = RwLock::new(IntegratorState::Idle);
        let cancelled = AtomicBool::new(false);
        let saves = AtomicU64::new(0);
        EventIntegrator::new(
            &self.store,
            &self.records,
            &self.schema,
            &NoopDelegate,
            &self.config,
            &state,
            &cancelled,
            &saves,
        )
        .merge()
        .expect("merge failed");
    }

    /// Object state keyed by global identifier, independent of local handles.
    fn state(&self) -> ObjectState {
        self.records
            .snapshot()
            .into_iter()
            .map(|(object_id, record)| {
                let gid = self
                    .store
                    .global_identifier_for_object(object_id)
                    .expect("object without global identifier");
                let attributes = record
                    .fields
                    .keys()
                    .filter_map(|name| {
                        record
                            .attribute(name)
                            .map(|value| (name.clone(), value.clone()))
                    })
                    .collect();
                (gid.global_id, attributes)
            })
            .collect()
    }
}

fn replay(events: &[StoreModificationEvent]) -> ObjectState {
    let replica = Replica::new();
    replica.store.add_all(events.iter().cloned());
    replica.merge();
    replica.state()
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn replay_is_deterministic(events in concurrent_history_strategy(3, 24)) {
        prop_assert_eq!(replay(&events), replay(&events));
    }

    #[test]
    fn arrival_order_does_not_matter((events, shuffled) in shuffled_history_strategy(3, 24)) {
        prop_assert_eq!(replay(&events), replay(&shuffled));
    }

    #[test]
    fn batched_delivery_matches_one_merge(
        events in concurrent_history_strategy(3, 24),
        cuts in prop::collection::vec(0usize..24, 0..4),
    ) {
        let mut cuts: Vec<usize> = cuts.into_iter().map(|cut| cut.min(events.len())).collect();
        cuts.push(events.len());
        cuts.sort_unstable();
        cuts.dedup();

        let replica = Replica::new();
        let mut start = 0;
        for cut in cuts {
            replica.store.add_all(events[start..cut].iter().cloned());
            replica.merge();
            start = cut;
        }
        prop_assert_eq!(replica.state(), replay(&events));
    }

    #[test]
    fn rebase_never_removes_needed_events(events in concurrent_history_strategy(3, 24)) {
        let replica = Replica::new();
        replica.store.add_all(events.iter().cloned());
        replica.merge();

        // What each store had seen when it last wrote.
        let mut knowledge: BTreeMap<String, RevisionSet> = BTreeMap::new();
        for event in &events {
            knowledge.insert(event.store_id().to_string(), event.revision_set());
        }
        let before: BTreeSet<(String, RevisionNumber)> = replica
            .store
            .revisioned_events()
            .iter()
            .map(|e| (e.store_id().to_string(), e.revision_number()))
            .collect();

        let config = RebaseConfig::default();
        Rebaser::new(&replica.store, &replica.schema, &config)
            .rebase()
            .expect("rebase failed");

        let after: BTreeSet<(String, RevisionNumber)> = replica
            .store
            .revisioned_events()
            .iter()
            .map(|e| (e.store_id().to_string(), e.revision_number()))
            .collect();
        for (store_id, revision) in before.difference(&after) {
            for (peer, known) in &knowledge {
                prop_assert!(
                    *revision <= known.revision_number_for_store(store_id),
                    "{} still needs {}-{}", peer, store_id, revision
                );
            }
        }
    }
}
