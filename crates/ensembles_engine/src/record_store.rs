//! The structured record store seam.
//!
//! The engine never owns application data. It reads and writes objects of
//! the host's structured store through [`RecordStore`], using local
//! [`ObjectId`] handles. [`MemoryRecordStore`] is a complete in-memory
//! implementation that enforces the schema, used by tests and the CLI.

use crate::error::{RecordError, RecordResult};
use ensembles_model::{AttributeValue, ModelSchema, PropertyKind};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use ensembles_store::ObjectId;

/// Value of one field of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Scalar attribute.
    Attribute(AttributeValue),
    /// To-one relationship.
    ToOne(Option<ObjectId>),
    /// Unordered to-many relationship.
    ToMany(BTreeSet<ObjectId>),
    /// Ordered to-many relationship.
    OrderedToMany(Vec<ObjectId>),
}

impl FieldValue {
    /// Objects referenced by this field.
    pub fn referenced_objects(&self) -> Vec<ObjectId> {
        match self {
            FieldValue::Attribute(_) => Vec::new(),
            FieldValue::ToOne(related) => related.iter().copied().collect(),
            FieldValue::ToMany(members) => members.iter().copied().collect(),
            FieldValue::OrderedToMany(members) => members.clone(),
        }
    }

    fn without(&self, removed: &BTreeSet<ObjectId>) -> Option<FieldValue> {
        match self {
            FieldValue::ToOne(Some(id)) if removed.contains(id) => Some(FieldValue::ToOne(None)),
            FieldValue::ToMany(members) if members.iter().any(|m| removed.contains(m)) => {
                Some(FieldValue::ToMany(
                    members.difference(removed).copied().collect(),
                ))
            }
            FieldValue::OrderedToMany(members) if members.iter().any(|m| removed.contains(m)) => {
                Some(FieldValue::OrderedToMany(
                    members
                        .iter()
                        .filter(|m| !removed.contains(m))
                        .copied()
                        .collect(),
                ))
            }
            _ => None,
        }
    }
}

/// One object of the structured store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Entity of the object.
    pub entity_name: String,
    /// Field values by property name. Absent fields are unset.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Creates a record without fields.
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Sets an attribute.
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.fields
            .insert(name.into(), FieldValue::Attribute(value.into()));
        self
    }

    /// Sets a to-one relationship.
    pub fn with_to_one(mut self, name: impl Into<String>, related: Option<ObjectId>) -> Self {
        self.fields.insert(name.into(), FieldValue::ToOne(related));
        self
    }

    /// Sets an unordered to-many relationship.
    pub fn with_to_many(
        mut self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = ObjectId>,
    ) -> Self {
        self.fields.insert(
            name.into(),
            FieldValue::ToMany(members.into_iter().collect()),
        );
        self
    }

    /// Sets an ordered to-many relationship.
    pub fn with_ordered_to_many(
        mut self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = ObjectId>,
    ) -> Self {
        self.fields.insert(
            name.into(),
            FieldValue::OrderedToMany(members.into_iter().collect()),
        );
        self
    }

    /// Returns a field.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Sets a field.
    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Returns an attribute value.
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        match self.fields.get(name) {
            Some(FieldValue::Attribute(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns a to-one target.
    pub fn to_one(&self, name: &str) -> Option<ObjectId> {
        match self.fields.get(name) {
            Some(FieldValue::ToOne(related)) => *related,
            _ => None,
        }
    }

    /// Returns to-many members, ordered or not.
    pub fn to_many(&self, name: &str) -> Vec<ObjectId> {
        match self.fields.get(name) {
            Some(FieldValue::ToMany(members)) => members.iter().copied().collect(),
            Some(FieldValue::OrderedToMany(members)) => members.clone(),
            _ => Vec::new(),
        }
    }
}

/// Changes to apply to the store in one atomic commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// New objects with their full content.
    pub inserted: BTreeMap<ObjectId, Record>,
    /// Existing objects with their full new content.
    pub updated: BTreeMap<ObjectId, Record>,
    /// Objects to delete.
    pub deleted: BTreeSet<ObjectId>,
}

impl ChangeSet {
    /// Returns true if nothing changes.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of affected objects.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// An updated object with its content before and after the save.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedObject {
    /// Object handle.
    pub object_id: ObjectId,
    /// Content before the save.
    pub before: Record,
    /// Content after the save.
    pub after: Record,
}

/// What a commit changed, with before and after content.
///
/// This is the input of the event builder and the payload of the
/// after-successful-commit notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Inserted objects.
    pub inserted: Vec<(ObjectId, Record)>,
    /// Updated objects.
    pub updated: Vec<UpdatedObject>,
    /// Deleted objects with their last content.
    pub deleted: Vec<(ObjectId, Record)>,
}

impl ChangeBatch {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of affected objects.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// The host's structured record store.
pub trait RecordStore: Send + Sync {
    /// Reads an object.
    fn fetch(&self, object_id: ObjectId) -> RecordResult<Option<Record>>;

    /// Reads every object.
    fn all_objects(&self) -> RecordResult<Vec<(ObjectId, Record)>>;

    /// Reserves a handle for a new object.
    fn allocate_object_id(&self) -> ObjectId;

    /// Applies all changes or none. Relationships pointing at deleted
    /// objects are cleared, and the affected objects reported as updated.
    fn commit(&self, changes: &ChangeSet) -> RecordResult<ChangeBatch>;
}

/// Application-level validation run on every inserted or updated object.
pub type Validator = Box<dyn Fn(ObjectId, &Record) -> Result<(), String> + Send + Sync>;

/// In-memory record store that validates against a schema.
pub struct MemoryRecordStore {
    schema: Arc<ModelSchema>,
    objects: RwLock<BTreeMap<ObjectId, Record>>,
    next_id: AtomicU64,
    validator: RwLock<Option<Validator>>,
}

impl std::fmt::Debug for MemoryRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecordStore")
            .field("objects", &self.objects.read().len())
            .finish()
    }
}

impl MemoryRecordStore {
    /// Creates an empty store.
    pub fn new(schema: Arc<ModelSchema>) -> Self {
        Self {
            schema,
            objects: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            validator: RwLock::new(None),
        }
    }

    /// Installs a validator.
    pub fn set_validator(
        &self,
        validator: impl Fn(ObjectId, &Record) -> Result<(), String> + Send + Sync + 'static,
    ) {
        *self.validator.write() = Some(Box::new(validator));
    }

    /// Removes the validator.
    pub fn clear_validator(&self) {
        *self.validator.write() = None;
    }

    /// Copy of every object.
    pub fn snapshot(&self) -> BTreeMap<ObjectId, Record> {
        self.objects.read().clone()
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Objects of one entity.
    pub fn objects_of_entity(&self, entity_name: &str) -> Vec<(ObjectId, Record)> {
        self.objects
            .read()
            .iter()
            .filter(|(_, r)| r.entity_name == entity_name)
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }

    /// Inserts one object and returns its handle with the commit batch.
    ///
    /// # Errors
    ///
    /// Fails if the record does not validate.
    pub fn insert(&self, record: Record) -> RecordResult<(ObjectId, ChangeBatch)> {
        let object_id = self.allocate_object_id();
        let mut changes = ChangeSet::default();
        changes.inserted.insert(object_id, record);
        Ok((object_id, self.commit(&changes)?))
    }

    /// Replaces one object.
    ///
    /// # Errors
    ///
    /// Fails if the object is missing or the record does not validate.
    pub fn update(&self, object_id: ObjectId, record: Record) -> RecordResult<ChangeBatch> {
        let mut changes = ChangeSet::default();
        changes.updated.insert(object_id, record);
        self.commit(&changes)
    }

    /// Deletes one object.
    ///
    /// # Errors
    ///
    /// Fails if clearing references produces an invalid object.
    pub fn delete(&self, object_id: ObjectId) -> RecordResult<ChangeBatch> {
        let mut changes = ChangeSet::default();
        changes.deleted.insert(object_id);
        self.commit(&changes)
    }

    fn validate_fields(
        &self,
        objects: &BTreeMap<ObjectId, Record>,
        object_id: ObjectId,
        record: &Record,
    ) -> RecordResult<()> {
        let invalid = |message: String| RecordError::ValidationFailed { object_id, message };
        let entity = self
            .schema
            .entity(&record.entity_name)
            .map_err(|_| RecordError::UnknownEntity(record.entity_name.clone()))?;

        for (name, value) in &record.fields {
            let kind = entity
                .property(name)
                .ok_or_else(|| invalid(format!("unknown property {name}")))?;
            let matches = match (kind, value) {
                (PropertyKind::Attribute(ty), FieldValue::Attribute(v)) => ty.accepts(v),
                (PropertyKind::ToOne { .. }, FieldValue::ToOne(_)) => true,
                (PropertyKind::ToMany { ordered: false, .. }, FieldValue::ToMany(_)) => true,
                (PropertyKind::ToMany { ordered: true, .. }, FieldValue::OrderedToMany(_)) => true,
                _ => false,
            };
            if !matches {
                return Err(invalid(format!("value of {name} does not match its type")));
            }
            if let Some(destination) = kind.destination() {
                for related in value.referenced_objects() {
                    match objects.get(&related) {
                        Some(target) if target.entity_name == destination => {}
                        Some(target) => {
                            return Err(invalid(format!(
                                "{name} expects {destination}, object {related} is {}",
                                target.entity_name
                            )))
                        }
                        None => {
                            return Err(invalid(format!(
                                "{name} references missing object {related}"
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn fetch(&self, object_id: ObjectId) -> RecordResult<Option<Record>> {
        Ok(self.objects.read().get(&object_id).cloned())
    }

    fn all_objects(&self) -> RecordResult<Vec<(ObjectId, Record)>> {
        Ok(self
            .objects
            .read()
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect())
    }

    fn allocate_object_id(&self) -> ObjectId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn commit(&self, changes: &ChangeSet) -> RecordResult<ChangeBatch> {
        let mut objects = self.objects.write();
        let mut next = objects.clone();
        let mut batch = ChangeBatch::default();
        let mut updated: BTreeMap<ObjectId, Record> = BTreeMap::new();

        for (id, record) in &changes.inserted {
            if next.contains_key(id) {
                return Err(RecordError::ValidationFailed {
                    object_id: *id,
                    message: "object already exists".into(),
                });
            }
            next.insert(*id, record.clone());
        }
        for (id, record) in &changes.updated {
            let before = next
                .get(id)
                .cloned()
                .ok_or(RecordError::ObjectNotFound(*id))?;
            if before.entity_name != record.entity_name {
                return Err(RecordError::ValidationFailed {
                    object_id: *id,
                    message: format!(
                        "entity cannot change from {} to {}",
                        before.entity_name, record.entity_name
                    ),
                });
            }
            next.insert(*id, record.clone());
        }

        let removed: BTreeSet<ObjectId> = changes
            .deleted
            .iter()
            .filter(|id| !changes.inserted.contains_key(id))
            .copied()
            .collect();
        for id in &removed {
            if let Some(before) = objects.get(id) {
                batch.deleted.push((*id, before.clone()));
            }
            next.remove(id);
        }

        // Clear relationships that point at deleted objects.
        for (id, record) in next.iter_mut() {
            let cleared: Vec<(String, FieldValue)> = record
                .fields
                .iter()
                .filter_map(|(name, value)| value.without(&removed).map(|v| (name.clone(), v)))
                .collect();
            if cleared.is_empty() {
                continue;
            }
            for (name, value) in cleared {
                record.fields.insert(name, value);
            }
            if !changes.inserted.contains_key(id) {
                updated.insert(*id, record.clone());
            }
        }
        for (id, record) in &changes.updated {
            if next.contains_key(id) {
                updated.entry(*id).or_insert_with(|| record.clone());
            }
        }

        let validator = self.validator.read();
        for id in changes.inserted.keys().chain(updated.keys()) {
            let Some(record) = next.get(id) else {
                continue;
            };
            self.validate_fields(&next, *id, record)?;
            if let Some(validate) = validator.as_ref() {
                validate(*id, record).map_err(|message| RecordError::ValidationFailed {
                    object_id: *id,
                    message,
                })?;
            }
        }

        for (id, _) in &changes.inserted {
            if let Some(record) = next.get(id) {
                batch.inserted.push((*id, record.clone()));
            }
        }
        for id in updated.keys() {
            if let (Some(before), Some(after)) = (objects.get(id), next.get(id)) {
                if before != after {
                    batch.updated.push(UpdatedObject {
                        object_id: *id,
                        before: before.clone(),
                        after: after.clone(),
                    });
                }
            }
        }

        *objects = next;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembles_model::{AttributeType, EntityDescriptor};

    fn store() -> MemoryRecordStore {
        let schema = ModelSchema::new("v1").with_entity(
            EntityDescriptor::new("Person")
                .with_attribute("name", AttributeType::Text)
                .with_to_one("parent", "Person")
                .with_to_many("friends", "Person"),
        );
        MemoryRecordStore::new(Arc::new(schema))
    }

    #[test]
    fn insert_update_delete() {
        let store = store();
        let (ann, batch) = store
            .insert(Record::new("Person").with_attribute("name", "Ann"))
            .unwrap();
        assert_eq!(batch.inserted.len(), 1);

        let batch = store
            .update(ann, Record::new("Person").with_attribute("name", "Anne"))
            .unwrap();
        assert_eq!(batch.updated.len(), 1);
        assert_eq!(
            batch.updated[0].before.attribute("name"),
            Some(&AttributeValue::Text("Ann".into()))
        );

        let batch = store.delete(ann).unwrap();
        assert_eq!(batch.deleted.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn deleting_clears_references() {
        let store = store();
        let (parent, _) = store.insert(Record::new("Person")).unwrap();
        let (child, _) = store
            .insert(
                Record::new("Person")
                    .with_to_one("parent", Some(parent))
                    .with_to_many("friends", [parent]),
            )
            .unwrap();

        let batch = store.delete(parent).unwrap();

        assert_eq!(batch.updated.len(), 1);
        assert_eq!(batch.updated[0].object_id, child);
        let child_record = store.fetch(child).unwrap().unwrap();
        assert_eq!(child_record.to_one("parent"), None);
        assert!(child_record.to_many("friends").is_empty());
    }

    #[test]
    fn schema_violations_are_rejected() {
        let store = store();
        assert!(matches!(
            store.insert(Record::new("Car")),
            Err(RecordError::UnknownEntity(_))
        ));
        assert!(store
            .insert(Record::new("Person").with_attribute("name", 5i64))
            .is_err());
        assert!(store
            .insert(Record::new("Person").with_to_one("parent", Some(999)))
            .is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn validator_rejects_whole_commit() {
        let store = store();
        store.set_validator(|_, record| match record.attribute("name") {
            Some(AttributeValue::Text(name)) if name.is_empty() => Err("empty name".into()),
            _ => Ok(()),
        });

        let mut changes = ChangeSet::default();
        changes.inserted.insert(
            store.allocate_object_id(),
            Record::new("Person").with_attribute("name", "ok"),
        );
        changes.inserted.insert(
            store.allocate_object_id(),
            Record::new("Person").with_attribute("name", ""),
        );
        assert!(matches!(
            store.commit(&changes),
            Err(RecordError::ValidationFailed { .. })
        ));
        assert!(store.is_empty());
    }
}
