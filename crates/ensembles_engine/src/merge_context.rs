//! Working copy of the record store used while replaying events.
//!
//! Replay never writes to the record store directly. Objects are loaded
//! into the context on first touch and changed there; the result is one
//! [`ChangeSet`] committed at the end, so a failed merge leaves the store
//! untouched.

use crate::error::{EnsembleError, EnsembleResult};
use crate::record_store::{ChangeSet, FieldValue, ObjectId, Record, RecordStore};
use ensembles_model::{
    AttributeValue, GlobalIdentifier, ModelSchema, ObjectChange, ObjectChangeType, PropertyChange,
    PropertyChangeValue, StoreModificationEvent,
};
use ensembles_store::EventStore;
use std::collections::{BTreeMap, BTreeSet};

pub(crate) struct MergeContext<'a> {
    store: &'a EventStore,
    records: &'a dyn RecordStore,
    schema: &'a ModelSchema,
    originals: BTreeMap<ObjectId, Record>,
    working: BTreeMap<ObjectId, Record>,
    inserted: BTreeSet<ObjectId>,
    deleted: BTreeSet<ObjectId>,
    staged: BTreeMap<GlobalIdentifier, ObjectId>,
}

impl<'a> MergeContext<'a> {
    pub(crate) fn new(
        store: &'a EventStore,
        records: &'a dyn RecordStore,
        schema: &'a ModelSchema,
    ) -> Self {
        Self {
            store,
            records,
            schema,
            originals: BTreeMap::new(),
            working: BTreeMap::new(),
            inserted: BTreeSet::new(),
            deleted: BTreeSet::new(),
            staged: BTreeMap::new(),
        }
    }

    /// Replays events in the given order.
    ///
    /// Each event applies its inserts, then its property changes, then
    /// its deletes, before the next event starts. A later event's insert
    /// re-creates an object an earlier event deleted; a later update of a
    /// deleted object is dropped.
    pub(crate) fn replay(&mut self, events: &[StoreModificationEvent]) -> EnsembleResult<()> {
        for event in events {
            self.replay_event(event)?;
        }
        Ok(())
    }

    fn replay_event(&mut self, event: &StoreModificationEvent) -> EnsembleResult<()> {
        let changes = &event.object_changes;
        for change in changes_of(changes, |t| t == ObjectChangeType::Insert) {
            self.insert_object(&change.global_identifier)?;
        }
        for change in changes_of(changes, |t| t != ObjectChangeType::Delete) {
            let Some(object_id) = self.object_for(&change.global_identifier)? else {
                continue;
            };
            for value in &change.property_change_values {
                self.apply_property(object_id, change.entity_name(), value)?;
            }
        }
        for change in changes_of(changes, |t| t == ObjectChangeType::Delete) {
            self.delete_object(&change.global_identifier)?;
        }
        Ok(())
    }

    /// Live local object for a global identifier.
    fn object_for(&mut self, identifier: &GlobalIdentifier) -> EnsembleResult<Option<ObjectId>> {
        let candidate = self
            .staged
            .get(identifier)
            .copied()
            .or_else(|| self.store.object_for_global_identifier(identifier));
        let Some(object_id) = candidate else {
            return Ok(None);
        };
        if self.deleted.contains(&object_id) {
            return Ok(None);
        }
        Ok(self.load(object_id)?.map(|_| object_id))
    }

    fn load(&mut self, object_id: ObjectId) -> EnsembleResult<Option<&mut Record>> {
        if !self.working.contains_key(&object_id) {
            let Some(record) = self.records.fetch(object_id)? else {
                return Ok(None);
            };
            self.originals.insert(object_id, record.clone());
            self.working.insert(object_id, record);
        }
        Ok(self.working.get_mut(&object_id))
    }

    /// Finds the object or creates an empty one. Inserting an existing
    /// object is a no-op.
    fn insert_object(&mut self, identifier: &GlobalIdentifier) -> EnsembleResult<ObjectId> {
        if let Some(object_id) = self.object_for(identifier)? {
            return Ok(object_id);
        }
        self.schema.entity(&identifier.entity_name)?;
        let object_id = self.records.allocate_object_id();
        self.working
            .insert(object_id, Record::new(identifier.entity_name.clone()));
        self.inserted.insert(object_id);
        self.staged.insert(identifier.clone(), object_id);
        Ok(object_id)
    }

    /// Deletes the object if it exists.
    fn delete_object(&mut self, identifier: &GlobalIdentifier) -> EnsembleResult<()> {
        let Some(object_id) = self.object_for(identifier)? else {
            return Ok(());
        };
        self.working.remove(&object_id);
        if self.inserted.remove(&object_id) {
            self.staged.remove(identifier);
        } else {
            self.deleted.insert(object_id);
        }
        Ok(())
    }

    fn related(&mut self, destination: &str, global_id: &str) -> EnsembleResult<Option<ObjectId>> {
        self.object_for(&GlobalIdentifier::new(destination, global_id))
    }

    fn related_set<'s>(
        &mut self,
        destination: &str,
        ids: impl IntoIterator<Item = &'s String>,
    ) -> EnsembleResult<Vec<ObjectId>> {
        let mut resolved = Vec::new();
        for id in ids {
            if let Some(object_id) = self.related(destination, id)? {
                resolved.push(object_id);
            }
        }
        Ok(resolved)
    }

    fn apply_property(
        &mut self,
        object_id: ObjectId,
        entity: &str,
        value: &PropertyChangeValue,
    ) -> EnsembleResult<()> {
        let kind = self.schema.property(entity, &value.property_name)?;
        let destination = kind.destination().unwrap_or_default().to_string();
        let field = match &value.change {
            PropertyChange::Attribute(AttributeValue::DataFile(name)) => {
                let bytes = self.store.data_files().read(name).map_err(|_| {
                    EnsembleError::MissingDataFiles {
                        filenames: vec![name.clone()],
                    }
                })?;
                FieldValue::Attribute(AttributeValue::Bytes(bytes))
            }
            PropertyChange::Attribute(attribute) => FieldValue::Attribute(attribute.clone()),
            PropertyChange::ToOne(related) => {
                let related = match related {
                    Some(id) => self.related(&destination, id)?,
                    None => None,
                };
                FieldValue::ToOne(related)
            }
            PropertyChange::ToMany { added, removed } => {
                let added = self.related_set(&destination, added)?;
                let removed = self.related_set(&destination, removed)?;
                let mut members = match self.current_field(object_id, &value.property_name)? {
                    Some(FieldValue::ToMany(members)) => members,
                    _ => BTreeSet::new(),
                };
                members.extend(added);
                for id in removed {
                    members.remove(&id);
                }
                FieldValue::ToMany(members)
            }
            PropertyChange::OrderedToMany {
                added,
                removed,
                moved_by_index,
            } => {
                let removed = self.related_set(&destination, removed)?;
                let mut moved = Vec::new();
                for (index, id) in moved_by_index {
                    if let Some(object_id) = self.related(&destination, id)? {
                        moved.push((*index as usize, object_id));
                    }
                }
                let added = self.related_set(&destination, added)?;
                let mut members = match self.current_field(object_id, &value.property_name)? {
                    Some(FieldValue::OrderedToMany(members)) => members,
                    _ => Vec::new(),
                };
                members.retain(|id| !removed.contains(id));
                for (index, id) in moved {
                    members.retain(|m| *m != id);
                    members.insert(index.min(members.len()), id);
                }
                for id in added {
                    if !members.contains(&id) {
                        members.push(id);
                    }
                }
                FieldValue::OrderedToMany(members)
            }
        };
        if let Some(record) = self.load(object_id)? {
            record.set(value.property_name.clone(), field);
        }
        Ok(())
    }

    fn current_field(
        &mut self,
        object_id: ObjectId,
        name: &str,
    ) -> EnsembleResult<Option<FieldValue>> {
        Ok(self
            .load(object_id)?
            .and_then(|record| record.field(name).cloned()))
    }

    /// The changes replay produced. Objects whose content ended where it
    /// started are left out.
    pub(crate) fn change_set(&self) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for (object_id, record) in &self.working {
            if self.inserted.contains(object_id) {
                changes.inserted.insert(*object_id, record.clone());
            } else if self.originals.get(object_id) != Some(record) {
                changes.updated.insert(*object_id, record.clone());
            }
        }
        changes.deleted = self.deleted.clone();
        changes
    }

    /// Identifiers of objects created by replay.
    pub(crate) fn staged_identifiers(&self) -> Vec<(ObjectId, GlobalIdentifier)> {
        self.staged
            .iter()
            .map(|(identifier, object_id)| (*object_id, identifier.clone()))
            .collect()
    }
}

fn changes_of(
    changes: &[ObjectChange],
    keep: impl Fn(ObjectChangeType) -> bool,
) -> impl Iterator<Item = &ObjectChange> {
    changes.iter().filter(move |c| keep(c.change_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::MemoryRecordStore;
    use ensembles_model::{AttributeType, EntityDescriptor, EventType, Revision, RevisionSet};
    use std::sync::Arc;

    fn schema() -> ModelSchema {
        ModelSchema::new("v1").with_entity(
            EntityDescriptor::new("Item")
                .with_attribute("title", AttributeType::Text)
                .with_to_many("tags", "Item")
                .with_ordered_to_many("steps", "Item"),
        )
    }

    fn event(store: &str, rev: i64, gc: i64, changes: Vec<ObjectChange>) -> StoreModificationEvent {
        let mut event = StoreModificationEvent::new_incomplete(
            format!("{store}-{rev}"),
            Revision::new(store, rev, gc),
            RevisionSet::new(),
            "v1",
        );
        event.object_changes = changes;
        event.commit(EventType::Save).unwrap();
        event
    }

    fn item(id: &str) -> GlobalIdentifier {
        GlobalIdentifier::new("Item", id)
    }

    fn title(text: &str) -> Vec<PropertyChangeValue> {
        vec![PropertyChangeValue::attribute("title", text)]
    }

    #[test]
    fn last_event_wins_and_deletes_win() {
        let schema = schema();
        let records = MemoryRecordStore::new(Arc::new(schema.clone()));
        let store = EventStore::in_memory("t");
        store.prepare_new_event_store().unwrap();

        let events = vec![
            event(
                "A",
                1,
                1,
                vec![
                    ObjectChange::insert(item("x"), title("a")),
                    ObjectChange::insert(item("y"), vec![]),
                ],
            ),
            event(
                "B",
                1,
                2,
                vec![
                    ObjectChange::update(item("x"), title("b")),
                    ObjectChange::delete(item("y")),
                ],
            ),
            event("C", 1, 3, vec![ObjectChange::update(item("y"), title("c"))]),
        ];

        let mut context = MergeContext::new(&store, &records, &schema);
        context.replay(&events).unwrap();
        let changes = context.change_set();

        assert_eq!(changes.inserted.len(), 1);
        let x = changes.inserted.values().next().unwrap();
        assert_eq!(x.attribute("title"), Some(&AttributeValue::Text("b".into())));
        assert_eq!(context.staged_identifiers().len(), 1);
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn insert_after_delete_recreates_object() {
        let schema = schema();
        let records = MemoryRecordStore::new(Arc::new(schema.clone()));
        let store = EventStore::in_memory("t");
        store.prepare_new_event_store().unwrap();

        let recreated = vec![
            event("A", 1, 1, vec![ObjectChange::insert(item("x"), title("a"))]),
            event("B", 1, 2, vec![ObjectChange::delete(item("x"))]),
            event("C", 1, 3, vec![ObjectChange::insert(item("x"), title("c"))]),
        ];
        let mut context = MergeContext::new(&store, &records, &schema);
        context.replay(&recreated).unwrap();
        let changes = context.change_set();
        assert_eq!(changes.inserted.len(), 1);
        let x = changes.inserted.values().next().unwrap();
        assert_eq!(x.attribute("title"), Some(&AttributeValue::Text("c".into())));

        let deleted = vec![
            event("A", 1, 1, vec![ObjectChange::insert(item("x"), title("a"))]),
            event("C", 1, 2, vec![ObjectChange::insert(item("x"), title("c"))]),
            event("B", 1, 3, vec![ObjectChange::delete(item("x"))]),
        ];
        let mut context = MergeContext::new(&store, &records, &schema);
        context.replay(&deleted).unwrap();
        assert!(context.change_set().inserted.is_empty());
        assert!(context.staged_identifiers().is_empty());
    }

    #[test]
    fn ordered_moves_and_set_membership() {
        let schema = schema();
        let records = MemoryRecordStore::new(Arc::new(schema.clone()));
        let store = EventStore::in_memory("t");
        store.prepare_new_event_store().unwrap();

        let inserts: Vec<ObjectChange> = ["p", "s1", "s2", "s3"]
            .iter()
            .map(|id| ObjectChange::insert(item(id), vec![]))
            .collect();
        let mut moves = BTreeMap::new();
        moves.insert(0, "s3".to_string());
        let events = vec![
            event("A", 1, 1, inserts),
            event(
                "A",
                2,
                2,
                vec![ObjectChange::update(
                    item("p"),
                    vec![
                        PropertyChangeValue::ordered_to_many(
                            "steps",
                            ["s1", "s2", "s3"].iter().map(|s| s.to_string()).collect(),
                            BTreeSet::new(),
                            BTreeMap::new(),
                        ),
                        PropertyChangeValue::to_many("tags", ["s1", "s2"], Vec::<String>::new()),
                    ],
                )],
            ),
            event(
                "B",
                1,
                3,
                vec![ObjectChange::update(
                    item("p"),
                    vec![
                        PropertyChangeValue::ordered_to_many(
                            "steps",
                            BTreeSet::new(),
                            ["s2".to_string()].into(),
                            moves,
                        ),
                        PropertyChangeValue::to_many("tags", Vec::<String>::new(), ["s1"]),
                    ],
                )],
            ),
        ];

        let mut context = MergeContext::new(&store, &records, &schema);
        context.replay(&events).unwrap();
        let changes = context.change_set();
        let staged: BTreeMap<String, ObjectId> = context
            .staged_identifiers()
            .into_iter()
            .map(|(id, gid)| (gid.global_id, id))
            .collect();
        let parent = &changes.inserted[&staged["p"]];
        assert_eq!(parent.to_many("steps"), vec![staged["s3"], staged["s1"]]);
        assert_eq!(parent.to_many("tags"), vec![staged["s2"]]);
    }
}
