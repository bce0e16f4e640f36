//! Property-based test generators using proptest.
//!
//! Provides strategies for revision sets and for multi-store event
//! histories whose revision bookkeeping is consistent.

use ensembles_model::{
    AttributeType, AttributeValue, EntityDescriptor, EventType, GlobalCount, GlobalIdentifier,
    ModelSchema, ObjectChange, PropertyChangeValue, Revision, RevisionNumber, RevisionSet,
    StoreModificationEvent,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Entity touched by generated histories.
pub const HISTORY_ENTITY: &str = "Item";

/// Schema matching generated histories.
pub fn history_schema() -> ModelSchema {
    ModelSchema::new(crate::fixtures::FIXTURE_MODEL_VERSION).with_entity(
        EntityDescriptor::new(HISTORY_ENTITY)
            .with_attribute("value", AttributeType::Integer)
            .with_attribute("label", AttributeType::Text),
    )
}

/// Strategy for store identifiers drawn from a small alphabet.
pub fn store_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["A", "B", "C", "D", "E"]).prop_map(str::to_string)
}

/// Strategy for scalar attribute values.
pub fn attribute_value_strategy() -> impl Strategy<Value = AttributeValue> {
    prop_oneof![
        Just(AttributeValue::Null),
        any::<bool>().prop_map(AttributeValue::Bool),
        any::<i64>().prop_map(AttributeValue::Integer),
        prop::string::string_regex("[a-z ]{0,16}")
            .expect("Invalid regex")
            .prop_map(AttributeValue::Text),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(AttributeValue::Bytes),
    ]
}

/// Strategy for revision sets over the store alphabet.
pub fn revision_set_strategy() -> impl Strategy<Value = RevisionSet> {
    prop::collection::btree_map(store_id_strategy(), (0i64..20, 0i64..100), 0..5).prop_map(
        |entries| {
            RevisionSet::from_revisions(
                entries
                    .into_iter()
                    .map(|(store, (rev, gc))| Revision::new(store, rev, gc)),
            )
        },
    )
}

/// One step of a generated history, before revision bookkeeping.
#[derive(Debug, Clone)]
struct Step {
    store: usize,
    seen: Vec<u8>,
    object: u8,
    delete: bool,
    value: i64,
}

fn step_strategy(store_count: usize, object_count: u8) -> impl Strategy<Value = Step> {
    (
        0..store_count,
        prop::collection::vec(any::<u8>(), store_count),
        0..object_count,
        prop::bool::weighted(0.15),
        -1000i64..1000,
    )
        .prop_map(|(store, seen, object, delete, value)| Step {
            store,
            seen,
            object,
            delete,
            value,
        })
}

/// Strategy for a history of `store_count` stores editing a few shared
/// objects concurrently.
///
/// Each event's knowledge of other stores only grows and never exceeds
/// what those stores had produced; global counts exceed every known
/// revision's count. Events are returned in creation order.
pub fn concurrent_history_strategy(
    store_count: usize,
    max_events: usize,
) -> impl Strategy<Value = Vec<StoreModificationEvent>> {
    prop::collection::vec(step_strategy(store_count, 4), 1..max_events.max(2))
        .prop_map(move |steps| build_history(store_count, &steps))
}

/// Strategy for a generated history together with a permutation of it.
pub fn shuffled_history_strategy(
    store_count: usize,
    max_events: usize,
) -> impl Strategy<Value = (Vec<StoreModificationEvent>, Vec<StoreModificationEvent>)> {
    concurrent_history_strategy(store_count, max_events).prop_flat_map(|events| {
        let shuffled = Just(events.clone()).prop_shuffle();
        (Just(events), shuffled)
    })
}

fn store_name(index: usize) -> String {
    format!("S{index}")
}

fn build_history(store_count: usize, steps: &[Step]) -> Vec<StoreModificationEvent> {
    let mut produced: Vec<RevisionNumber> = vec![0; store_count];
    let mut knowledge: Vec<Vec<RevisionNumber>> = vec![vec![0; store_count]; store_count];
    let mut counts: BTreeMap<(usize, RevisionNumber), GlobalCount> = BTreeMap::new();
    let mut events = Vec::with_capacity(steps.len());

    for step in steps {
        let s = step.store;
        for t in 0..store_count {
            if t == s {
                continue;
            }
            let reachable = produced[t] * i64::from(step.seen[t]) / 255;
            knowledge[s][t] = knowledge[s][t].max(reachable);
        }
        let revision_number = produced[s] + 1;
        let mut others = RevisionSet::new();
        let mut global_count = counts.get(&(s, produced[s])).copied().unwrap_or(0) + 1;
        for t in (0..store_count).filter(|t| *t != s && knowledge[s][*t] > 0) {
            let known = knowledge[s][t];
            let gc = counts.get(&(t, known)).copied().unwrap_or(0);
            global_count = global_count.max(gc + 1);
            others.insert(Revision::new(store_name(t), known, gc));
        }

        let gid = GlobalIdentifier::new(HISTORY_ENTITY, format!("o{}", step.object));
        let change = if step.delete {
            ObjectChange::delete(gid)
        } else {
            ObjectChange::insert(
                gid,
                vec![
                    PropertyChangeValue::attribute("value", step.value),
                    PropertyChangeValue::attribute(
                        "label",
                        format!("{}@{}", store_name(s), revision_number),
                    ),
                ],
            )
        };

        let mut event = StoreModificationEvent::new_incomplete(
            format!("{}-{revision_number}", store_name(s)),
            Revision::new(store_name(s), revision_number, global_count),
            others,
            crate::fixtures::FIXTURE_MODEL_VERSION,
        );
        event.object_changes.push(change);
        event
            .commit(EventType::Save)
            .expect("Failed to commit generated event");

        produced[s] = revision_number;
        counts.insert((s, revision_number), global_count);
        events.push(event);
    }
    events
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn history_revisions_are_contiguous(events in concurrent_history_strategy(3, 20)) {
            let mut last: BTreeMap<String, RevisionNumber> = BTreeMap::new();
            for event in &events {
                let previous = last.insert(event.store_id().to_string(), event.revision_number());
                prop_assert_eq!(event.revision_number(), previous.unwrap_or(0) + 1);
            }
        }

        #[test]
        fn history_knowledge_precedes_event(events in concurrent_history_strategy(3, 20)) {
            for (index, event) in events.iter().enumerate() {
                for known in event.revision_set_of_other_stores_at_creation.iter() {
                    let exists = events[..index].iter().any(|e| {
                        e.store_id() == known.store_id
                            && e.revision_number() == known.revision_number
                    });
                    prop_assert!(exists);
                    prop_assert!(known.global_count < event.global_count);
                }
            }
        }

        #[test]
        fn shuffle_keeps_events((events, shuffled) in shuffled_history_strategy(2, 10)) {
            prop_assert_eq!(events.len(), shuffled.len());
        }
    }
}
