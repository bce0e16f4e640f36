//! Building store modification events from committed record changes.

use crate::delegate::EnsembleDelegate;
use crate::error::{EnsembleError, EnsembleResult};
use crate::record_store::{FieldValue, ObjectId, Record, UpdatedObject};
use crate::revision_manager::RevisionManager;
use ensembles_model::{
    AttributeValue, EventType, GlobalIdentifier, ModelSchema, ObjectChange, ObjectChangeType,
    PropertyChangeValue, Revision, RevisionSet, StoreModificationEvent,
};
use ensembles_store::EventStore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Builds one event at a time.
///
/// [`make_new_event`](Self::make_new_event) opens an event and registers it
/// as incomplete; the `add_changes_for_*` methods translate record changes
/// into object changes; [`finalize_new_event`](Self::finalize_new_event)
/// commits it. The revision number is only fixed when the event is added
/// to the store, so an abandoned event leaves no gap.
pub struct EventBuilder<'a> {
    store: &'a EventStore,
    schema: &'a ModelSchema,
    data_file_threshold: usize,
    event: Option<StoreModificationEvent>,
    final_type: EventType,
    minted: BTreeMap<ObjectId, GlobalIdentifier>,
}

impl<'a> EventBuilder<'a> {
    /// Creates a builder writing to `store`.
    pub fn new(store: &'a EventStore, schema: &'a ModelSchema, data_file_threshold: usize) -> Self {
        Self {
            store,
            schema,
            data_file_threshold,
            event: None,
            final_type: EventType::Save,
            minted: BTreeMap::new(),
        }
    }

    /// The event under construction.
    pub fn event(&self) -> Option<&StoreModificationEvent> {
        self.event.as_ref()
    }

    /// Returns true if the event under construction holds changes.
    pub fn has_changes(&self) -> bool {
        self.event
            .as_ref()
            .is_some_and(|e| !e.object_changes.is_empty())
    }

    /// Opens a new save or merge event.
    ///
    /// The event is numbered after the latest local revision with a global
    /// count one above the highest seen. Both are confirmed when the event
    /// is finalized. Its view of other stores is the revision set of the
    /// last merge or baseline.
    ///
    /// # Errors
    ///
    /// Fails with [`EnsembleError::InvalidInput`] for other event types or
    /// when an event is already open.
    pub fn make_new_event(
        &mut self,
        event_type: EventType,
        unique_identifier: Option<String>,
    ) -> EnsembleResult<&StoreModificationEvent> {
        if !event_type.is_revisioned() {
            return Err(EnsembleError::InvalidInput(format!(
                "cannot build a {event_type:?} event"
            )));
        }
        if self.event.is_some() {
            return Err(EnsembleError::InvalidInput(
                "an event is already under construction".into(),
            ));
        }

        let store_id = self.store.persistent_store_id()?;
        let revision_number = self.store.last_revision()? + 1;
        let global_count = self.store.max_global_count()? + 1;
        let mut others = RevisionManager::new(self.store).revision_set_for_last_merge_or_baseline();
        others.remove(&store_id);

        let unique_identifier =
            unique_identifier.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.store
            .register_incomplete_event_identifier(&unique_identifier, false)?;

        let event = StoreModificationEvent::new_incomplete(
            unique_identifier,
            Revision::new(store_id, revision_number, global_count),
            others,
            self.schema.version(),
        );
        self.final_type = event_type;
        let event: &StoreModificationEvent = self.event.insert(event);
        Ok(event)
    }

    /// Replaces the other stores' revisions recorded in the open event.
    pub fn set_revision_set_of_other_stores(&mut self, mut others: RevisionSet) {
        if let Some(event) = &mut self.event {
            others.remove(event.store_id());
            event.revision_set_of_other_stores_at_creation = others;
        }
    }

    /// Adds insert changes carrying every set field.
    ///
    /// Global identifiers are minted for all objects first, asking the
    /// delegate for application identifiers, so the objects may reference
    /// each other.
    ///
    /// # Errors
    ///
    /// Fails if no event is open or a relationship points at an object
    /// without a global identifier.
    pub fn add_changes_for_inserted_objects(
        &mut self,
        objects: &[(ObjectId, Record)],
        delegate: &dyn EnsembleDelegate,
    ) -> EnsembleResult<()> {
        self.ensure_open()?;
        let unidentified: Vec<(ObjectId, &Record)> = objects
            .iter()
            .filter(|(id, _)| self.global_identifier(*id).is_none())
            .map(|(id, record)| (*id, record))
            .collect();
        let supplied = delegate.global_identifiers_for_objects(&unidentified);
        for (index, (object_id, record)) in unidentified.iter().enumerate() {
            let identifier = match supplied.get(index).cloned().flatten() {
                Some(global_id) => GlobalIdentifier::new(record.entity_name.clone(), global_id),
                None => GlobalIdentifier::generate(record.entity_name.clone()),
            };
            self.minted.insert(*object_id, identifier);
        }

        for (object_id, record) in objects {
            let identifier = self.require_identifier(*object_id)?;
            let mut values = Vec::new();
            for (name, value) in &record.fields {
                if let Some(change) = self.property_change(record, name, None, Some(value))? {
                    values.push(change);
                }
            }
            self.push_change(ObjectChange::insert(identifier, values));
        }
        Ok(())
    }

    /// Adds update changes for the fields that differ between before and
    /// after. Objects without differences are skipped.
    ///
    /// # Errors
    ///
    /// Fails if no event is open, an object has no global identifier, or a
    /// relationship cannot be resolved.
    pub fn add_changes_for_updated_objects(
        &mut self,
        objects: &[UpdatedObject],
    ) -> EnsembleResult<()> {
        self.ensure_open()?;
        for updated in objects {
            let identifier = self.require_identifier(updated.object_id)?;
            let names: BTreeSet<&String> = updated
                .before
                .fields
                .keys()
                .chain(updated.after.fields.keys())
                .collect();
            let mut values = Vec::new();
            for name in names {
                let before = updated.before.fields.get(name);
                let after = updated.after.fields.get(name);
                if before == after {
                    continue;
                }
                if let Some(change) = self.property_change(&updated.after, name, before, after)? {
                    values.push(change);
                }
            }
            if !values.is_empty() {
                self.push_change(ObjectChange::update(identifier, values));
            }
        }
        Ok(())
    }

    /// Adds delete changes.
    ///
    /// # Errors
    ///
    /// Fails if no event is open or an object has no global identifier.
    pub fn add_changes_for_deleted_objects(
        &mut self,
        objects: &[(ObjectId, Record)],
    ) -> EnsembleResult<()> {
        self.ensure_open()?;
        for (object_id, _) in objects {
            let identifier = self.require_identifier(*object_id)?;
            self.push_change(ObjectChange::delete(identifier));
        }
        Ok(())
    }

    /// Commits the open event, stores it and maps minted identifiers.
    ///
    /// # Errors
    ///
    /// Fails if no event is open, the event does not match the schema, or
    /// the event store rejects it.
    pub fn finalize_new_event(&mut self) -> EnsembleResult<StoreModificationEvent> {
        let mut event = self
            .event
            .take()
            .ok_or_else(|| EnsembleError::InvalidInput("no event under construction".into()))?;
        let event = match self.commit_event(&mut event) {
            Ok(stored) => stored,
            Err(e) => {
                self.store
                    .deregister_incomplete_event_identifier(&event.unique_identifier)?;
                return Err(e);
            }
        };
        self.store.flush()?;
        debug!(
            event = %event.unique_identifier,
            revision = %event.own_revision,
            changes = event.object_changes.len(),
            "finalized event"
        );
        Ok(event)
    }

    /// Abandons the open event.
    ///
    /// # Errors
    ///
    /// Fails if the incomplete mark cannot be removed.
    pub fn discard_new_event(&mut self) -> EnsembleResult<()> {
        self.minted.clear();
        if let Some(event) = self.event.take() {
            self.store
                .deregister_incomplete_event_identifier(&event.unique_identifier)?;
        }
        Ok(())
    }

    fn commit_event(
        &mut self,
        event: &mut StoreModificationEvent,
    ) -> EnsembleResult<StoreModificationEvent> {
        self.schema
            .validate_event(event)
            .map_err(|e| EnsembleError::corruption(e.to_string()))?;
        event.commit(self.final_type)?;
        let minted: Vec<(ObjectId, GlobalIdentifier)> = std::mem::take(&mut self.minted)
            .into_iter()
            .collect();
        self.store.map_global_identifiers(&minted)?;
        Ok(self.store.add_local_event(event.clone())?)
    }

    fn ensure_open(&self) -> EnsembleResult<()> {
        if self.event.is_none() {
            return Err(EnsembleError::InvalidInput(
                "no event under construction".into(),
            ));
        }
        Ok(())
    }

    fn global_identifier(&self, object_id: ObjectId) -> Option<GlobalIdentifier> {
        self.minted
            .get(&object_id)
            .cloned()
            .or_else(|| self.store.global_identifier_for_object(object_id))
    }

    fn require_identifier(&self, object_id: ObjectId) -> EnsembleResult<GlobalIdentifier> {
        self.global_identifier(object_id)
            .ok_or(EnsembleError::MissingGlobalIdentifier(object_id))
    }

    fn related_identifier(
        &self,
        record: &Record,
        property: &str,
        object_id: ObjectId,
    ) -> EnsembleResult<String> {
        self.global_identifier(object_id)
            .map(|identifier| identifier.global_id)
            .ok_or_else(|| EnsembleError::DanglingReference {
                entity: record.entity_name.clone(),
                property: property.to_string(),
                object_id,
            })
    }

    fn related_identifiers<'r>(
        &self,
        record: &Record,
        property: &str,
        ids: impl IntoIterator<Item = &'r ObjectId>,
    ) -> EnsembleResult<BTreeSet<String>> {
        ids.into_iter()
            .map(|id| self.related_identifier(record, property, *id))
            .collect()
    }

    fn attribute_value(&self, value: &AttributeValue) -> EnsembleResult<AttributeValue> {
        match value {
            AttributeValue::Bytes(bytes) if bytes.len() > self.data_file_threshold => Ok(
                AttributeValue::DataFile(self.store.data_files().store(bytes)?),
            ),
            other => Ok(other.clone()),
        }
    }

    /// Translates one field transition into a property change. Returns
    /// `None` when the change would have no effect.
    fn property_change(
        &self,
        record: &Record,
        name: &str,
        before: Option<&FieldValue>,
        after: Option<&FieldValue>,
    ) -> EnsembleResult<Option<PropertyChangeValue>> {
        let change = match (before, after) {
            (_, Some(FieldValue::Attribute(value))) => {
                PropertyChangeValue::attribute(name, self.attribute_value(value)?)
            }
            (Some(FieldValue::Attribute(_)), None) => {
                PropertyChangeValue::attribute(name, AttributeValue::Null)
            }
            (_, Some(FieldValue::ToOne(related))) => {
                let related = related
                    .map(|id| self.related_identifier(record, name, id))
                    .transpose()?;
                PropertyChangeValue::to_one(name, related)
            }
            (Some(FieldValue::ToOne(_)), None) => PropertyChangeValue::to_one(name, None),
            (_, Some(FieldValue::ToMany(members))) => {
                let previous = match before {
                    Some(FieldValue::ToMany(previous)) => previous.clone(),
                    _ => BTreeSet::new(),
                };
                PropertyChangeValue::to_many(
                    name,
                    self.related_identifiers(record, name, members.difference(&previous))?,
                    self.related_identifiers(record, name, previous.difference(members))?,
                )
            }
            (Some(FieldValue::ToMany(previous)), None) => PropertyChangeValue::to_many(
                name,
                Vec::<String>::new(),
                self.related_identifiers(record, name, previous)?,
            ),
            (_, Some(FieldValue::OrderedToMany(members))) => {
                let previous: &[ObjectId] = match before {
                    Some(FieldValue::OrderedToMany(previous)) => previous,
                    _ => &[],
                };
                self.ordered_change(record, name, previous, members)?
            }
            (Some(FieldValue::OrderedToMany(previous)), None) => {
                self.ordered_change(record, name, previous, &[])?
            }
            (None, None) => return Ok(None),
        };
        Ok((!change.is_empty()).then_some(change))
    }

    fn ordered_change(
        &self,
        record: &Record,
        name: &str,
        previous: &[ObjectId],
        members: &[ObjectId],
    ) -> EnsembleResult<PropertyChangeValue> {
        let previous_set: BTreeSet<ObjectId> = previous.iter().copied().collect();
        let member_set: BTreeSet<ObjectId> = members.iter().copied().collect();
        let previous_index: HashMap<ObjectId, usize> =
            previous.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut moved = BTreeMap::new();
        for (index, id) in members.iter().enumerate() {
            if previous_index.get(id) != Some(&index) {
                moved.insert(index as u32, self.related_identifier(record, name, *id)?);
            }
        }
        Ok(PropertyChangeValue::ordered_to_many(
            name,
            self.related_identifiers(record, name, member_set.difference(&previous_set))?,
            self.related_identifiers(record, name, previous_set.difference(&member_set))?,
            moved,
        ))
    }

    /// Adds a change, folding it into an existing change for the same
    /// object. A delete replaces everything; an insert stays an insert.
    fn push_change(&mut self, mut change: ObjectChange) {
        let Some(event) = self.event.as_mut() else {
            return;
        };
        let existing = event
            .object_changes
            .iter()
            .position(|c| c.global_identifier == change.global_identifier);
        match existing {
            None => event.object_changes.push(change),
            Some(index) => {
                let earlier = &event.object_changes[index];
                if change.change_type != ObjectChangeType::Delete {
                    change.merge_values_from_subordinate(earlier);
                    if earlier.change_type == ObjectChangeType::Insert {
                        change.change_type = ObjectChangeType::Insert;
                    }
                }
                event.object_changes[index] = change;
            }
        }
    }
}
