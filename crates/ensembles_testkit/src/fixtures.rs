//! Test fixtures and event store helpers.
//!
//! Provides throwaway event stores and a builder for hand-written events,
//! plus a compact JSON format for event histories.

use ensembles_model::{
    AttributeValue, EventType, GlobalCount, GlobalIdentifier, ObjectChange, PropertyChangeValue,
    Revision, RevisionNumber, RevisionSet, StoreModificationEvent,
};
use ensembles_store::{EventStore, StoreConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

/// Model version stamped on fixture events unless overridden.
pub const FIXTURE_MODEL_VERSION: &str = "v1";

/// A prepared event store with automatic cleanup.
pub struct TestEventStore {
    /// The event store.
    pub store: EventStore,
    /// Local persistent store identifier.
    pub store_id: String,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestEventStore {
    /// Creates a prepared in-memory event store.
    pub fn memory(ensemble_id: &str) -> Self {
        let store = EventStore::in_memory(ensemble_id);
        let store_id = store
            .prepare_new_event_store()
            .expect("Failed to prepare in-memory event store");
        Self {
            store,
            store_id,
            _temp_dir: None,
        }
    }

    /// Creates a prepared event store in a temporary directory.
    pub fn file(ensemble_id: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = EventStore::open(StoreConfig::at_path(
            ensemble_id,
            temp_dir.path().join(ensemble_id),
        ))
        .expect("Failed to open event store");
        let store_id = store
            .prepare_new_event_store()
            .expect("Failed to prepare event store");
        Self {
            store,
            store_id,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Directory of a file-based store.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(|d| d.path())
    }

    /// Adds events, panicking on failure.
    pub fn add_all(&self, events: impl IntoIterator<Item = StoreModificationEvent>) {
        for event in events {
            self.store.add_event(event).expect("Failed to add event");
        }
    }
}

impl std::ops::Deref for TestEventStore {
    type Target = EventStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Builder for hand-written events.
///
/// # Example
///
/// ```rust,ignore
/// let event = EventFixture::save("B", 2)
///     .global_count(3)
///     .knows("A", 1)
///     .update("Task", "t1", vec![PropertyChangeValue::attribute("title", "x")])
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct EventFixture {
    event_type: EventType,
    store_id: String,
    revision_number: RevisionNumber,
    global_count: Option<GlobalCount>,
    others: RevisionSet,
    model_version: String,
    unique_identifier: Option<String>,
    changes: Vec<ObjectChange>,
}

impl EventFixture {
    fn new(event_type: EventType, store_id: &str, revision_number: RevisionNumber) -> Self {
        Self {
            event_type,
            store_id: store_id.to_string(),
            revision_number,
            global_count: None,
            others: RevisionSet::new(),
            model_version: FIXTURE_MODEL_VERSION.to_string(),
            unique_identifier: None,
            changes: Vec::new(),
        }
    }

    /// A save event.
    pub fn save(store_id: &str, revision_number: RevisionNumber) -> Self {
        Self::new(EventType::Save, store_id, revision_number)
    }

    /// A merge event.
    pub fn merge(store_id: &str, revision_number: RevisionNumber) -> Self {
        Self::new(EventType::Merge, store_id, revision_number)
    }

    /// A baseline created by `store_id`, covering `revision_number` of it
    /// and whatever [`knows`](Self::knows) adds.
    pub fn baseline(store_id: &str, revision_number: RevisionNumber) -> Self {
        Self::new(EventType::Baseline, store_id, revision_number)
    }

    /// Sets the global count. Defaults to the revision number.
    pub fn global_count(mut self, global_count: GlobalCount) -> Self {
        self.global_count = Some(global_count);
        self
    }

    /// Records that the creator had seen `revision_number` of `store_id`.
    pub fn knows(mut self, store_id: &str, revision_number: RevisionNumber) -> Self {
        self.others
            .insert(Revision::new(store_id, revision_number, revision_number));
        self
    }

    /// Sets the model version.
    pub fn model_version(mut self, version: &str) -> Self {
        self.model_version = version.to_string();
        self
    }

    /// Sets the unique identifier. Defaults to `store-revision` for save
    /// and merge events and `baseline-store-count` for baselines.
    pub fn identifier(mut self, id: &str) -> Self {
        self.unique_identifier = Some(id.to_string());
        self
    }

    /// Adds an insert.
    pub fn insert(
        mut self,
        entity: &str,
        global_id: &str,
        values: Vec<PropertyChangeValue>,
    ) -> Self {
        self.changes
            .push(ObjectChange::insert(GlobalIdentifier::new(entity, global_id), values));
        self
    }

    /// Adds an update.
    pub fn update(
        mut self,
        entity: &str,
        global_id: &str,
        values: Vec<PropertyChangeValue>,
    ) -> Self {
        self.changes
            .push(ObjectChange::update(GlobalIdentifier::new(entity, global_id), values));
        self
    }

    /// Adds a delete.
    pub fn delete(mut self, entity: &str, global_id: &str) -> Self {
        self.changes
            .push(ObjectChange::delete(GlobalIdentifier::new(entity, global_id)));
        self
    }

    /// Adds an arbitrary object change.
    pub fn change(mut self, change: ObjectChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Builds the committed event.
    pub fn build(self) -> StoreModificationEvent {
        let global_count = self.global_count.unwrap_or(self.revision_number);
        let id = self.unique_identifier.unwrap_or_else(|| match self.event_type {
            EventType::Baseline => format!("baseline-{}-{global_count}", self.store_id),
            _ => format!("{}-{}", self.store_id, self.revision_number),
        });
        let mut event = StoreModificationEvent::new_incomplete(
            id,
            Revision::new(self.store_id.as_str(), self.revision_number, global_count),
            self.others,
            self.model_version,
        );
        event.object_changes = self.changes;
        event
            .commit(self.event_type)
            .expect("Failed to commit fixture event");
        event
    }
}

/// One event in the JSON fixture format.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonEvent {
    store: String,
    revision: RevisionNumber,
    #[serde(default)]
    global_count: Option<GlobalCount>,
    #[serde(default = "default_event_type", rename = "type")]
    event_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    knows: BTreeMap<String, RevisionNumber>,
    #[serde(default)]
    changes: Vec<JsonChange>,
}

fn default_event_type() -> String {
    "save".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonChange {
    op: String,
    entity: String,
    id: String,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    to_one: BTreeMap<String, Option<String>>,
    #[serde(default)]
    to_many: BTreeMap<String, JsonToMany>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonToMany {
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    removed: Vec<String>,
}

fn attribute_from_json(value: serde_json::Value) -> Result<AttributeValue, String> {
    use serde_json::Value;
    match value {
        Value::Null => Ok(AttributeValue::Null),
        Value::Bool(b) => Ok(AttributeValue::Bool(b)),
        Value::String(s) => Ok(AttributeValue::Text(s)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(AttributeValue::Integer(i)),
            None => n
                .as_f64()
                .map(AttributeValue::Float)
                .ok_or_else(|| format!("unsupported number {n}")),
        },
        other => Err(format!("unsupported attribute value {other}")),
    }
}

impl JsonChange {
    fn into_object_change(self) -> Result<ObjectChange, String> {
        let mut values = Vec::new();
        for (name, value) in self.attributes {
            values.push(PropertyChangeValue::attribute(name, attribute_from_json(value)?));
        }
        for (name, related) in self.to_one {
            values.push(PropertyChangeValue::to_one(name, related));
        }
        for (name, members) in self.to_many {
            values.push(PropertyChangeValue::to_many(name, members.added, members.removed));
        }
        let gid = GlobalIdentifier::new(self.entity, self.id);
        match self.op.as_str() {
            "insert" => Ok(ObjectChange::insert(gid, values)),
            "update" => Ok(ObjectChange::update(gid, values)),
            "delete" => Ok(ObjectChange::delete(gid)),
            other => Err(format!("unknown change op {other:?}")),
        }
    }
}

/// Parses an event history in the fixture format:
///
/// ```json
/// [{"store": "B", "revision": 1, "global_count": 2, "knows": {"A": 1},
///   "changes": [{"op": "insert", "entity": "Task", "id": "t1",
///                "attributes": {"title": "write"}}]}]
/// ```
///
/// `type` is one of `save` (default), `merge` or `baseline`.
///
/// # Panics
///
/// Panics on malformed input.
pub fn events_from_json(json: &str) -> Vec<StoreModificationEvent> {
    let parsed: Vec<JsonEvent> = serde_json::from_str(json).expect("Invalid fixture JSON");
    parsed
        .into_iter()
        .map(|e| {
            let mut fixture = match e.event_type.as_str() {
                "save" => EventFixture::save(&e.store, e.revision),
                "merge" => EventFixture::merge(&e.store, e.revision),
                "baseline" => EventFixture::baseline(&e.store, e.revision),
                other => panic!("Unknown fixture event type {other:?}"),
            };
            if let Some(gc) = e.global_count {
                fixture = fixture.global_count(gc);
            }
            if let Some(id) = &e.id {
                fixture = fixture.identifier(id);
            }
            if let Some(version) = &e.model_version {
                fixture = fixture.model_version(version);
            }
            for (store, revision) in &e.knows {
                fixture = fixture.knows(store, *revision);
            }
            for change in e.changes {
                let change = change.into_object_change().expect("Invalid fixture change");
                fixture = fixture.change(change);
            }
            fixture.build()
        })
        .collect()
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// `count` consecutive save events of one store, each inserting one
    /// object of `entity`.
    pub fn linear_history(
        store_id: &str,
        entity: &str,
        count: usize,
    ) -> Vec<StoreModificationEvent> {
        (1..=count as RevisionNumber)
            .map(|rev| {
                EventFixture::save(store_id, rev)
                    .insert(
                        entity,
                        &format!("{store_id}-{rev}"),
                        vec![PropertyChangeValue::attribute("index", rev)],
                    )
                    .build()
            })
            .collect()
    }
}
