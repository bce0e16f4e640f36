//! Changes to single objects.

use crate::property::PropertyChangeValue;
use serde::{Deserialize, Serialize};

/// Identifier of an object that is stable across stores.
///
/// A global identifier is unique within its entity and is never reused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalIdentifier {
    /// Entity of the object.
    pub entity_name: String,
    /// Stable identifier string.
    pub global_id: String,
}

impl GlobalIdentifier {
    /// Creates a global identifier.
    pub fn new(entity_name: impl Into<String>, global_id: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            global_id: global_id.into(),
        }
    }

    /// Mints a fresh random identifier for an entity.
    pub fn generate(entity_name: impl Into<String>) -> Self {
        Self::new(entity_name, uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for GlobalIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_name, self.global_id)
    }
}

/// Kind of object change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectChangeType {
    /// Object was created.
    Insert,
    /// Object properties changed.
    Update,
    /// Object was deleted.
    Delete,
}

impl ObjectChangeType {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u16 {
        match self {
            ObjectChangeType::Insert => 100,
            ObjectChangeType::Update => 200,
            ObjectChangeType::Delete => 300,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            100 => Some(ObjectChangeType::Insert),
            200 => Some(ObjectChangeType::Update),
            300 => Some(ObjectChangeType::Delete),
            _ => None,
        }
    }
}

/// One object's insert, update or delete within an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectChange {
    /// Kind of change.
    pub change_type: ObjectChangeType,
    /// Object affected.
    pub global_identifier: GlobalIdentifier,
    /// Changed properties, in capture order. At most one entry per property.
    pub property_change_values: Vec<PropertyChangeValue>,
}

impl ObjectChange {
    /// Creates an insert.
    pub fn insert(
        global_identifier: GlobalIdentifier,
        property_change_values: Vec<PropertyChangeValue>,
    ) -> Self {
        Self {
            change_type: ObjectChangeType::Insert,
            global_identifier,
            property_change_values,
        }
    }

    /// Creates an update.
    pub fn update(
        global_identifier: GlobalIdentifier,
        property_change_values: Vec<PropertyChangeValue>,
    ) -> Self {
        Self {
            change_type: ObjectChangeType::Update,
            global_identifier,
            property_change_values,
        }
    }

    /// Creates a delete.
    pub fn delete(global_identifier: GlobalIdentifier) -> Self {
        Self {
            change_type: ObjectChangeType::Delete,
            global_identifier,
            property_change_values: Vec::new(),
        }
    }

    /// Entity name of the changed object.
    pub fn entity_name(&self) -> &str {
        &self.global_identifier.entity_name
    }

    /// Returns the change for a property.
    pub fn property_change(&self, property_name: &str) -> Option<&PropertyChangeValue> {
        self.property_change_values
            .iter()
            .find(|v| v.property_name == property_name)
    }

    /// Data files referenced by this change.
    pub fn data_filenames(&self) -> impl Iterator<Item = &str> {
        self.property_change_values
            .iter()
            .filter_map(PropertyChangeValue::data_filename)
    }

    /// Folds a change to the same object from an earlier event into this one.
    ///
    /// Where both changes specify a property, `self` keeps its value
    /// (relationship membership is combined). Properties only the
    /// subordinate specifies are adopted. The change type is unaffected.
    pub fn merge_values_from_subordinate(&mut self, subordinate: &ObjectChange) {
        for theirs in &subordinate.property_change_values {
            match self
                .property_change_values
                .iter_mut()
                .find(|mine| mine.property_name == theirs.property_name)
            {
                Some(mine) => mine.merge_from_subordinate(theirs),
                None => self.property_change_values.push(theirs.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyChange;
    use crate::value::AttributeValue;

    #[test]
    fn change_type_codes() {
        assert_eq!(ObjectChangeType::Insert.to_code(), 100);
        assert_eq!(
            ObjectChangeType::from_code(300),
            Some(ObjectChangeType::Delete)
        );
        assert_eq!(ObjectChangeType::from_code(1), None);
    }

    #[test]
    fn generated_identifiers_are_unique() {
        let a = GlobalIdentifier::generate("Person");
        let b = GlobalIdentifier::generate("Person");
        assert_ne!(a, b);
        assert_eq!(a.entity_name, "Person");
    }

    #[test]
    fn subordinate_merge_keeps_receiver_and_adopts_rest() {
        let gid = GlobalIdentifier::new("Person", "g1");
        let mut receiver = ObjectChange::insert(
            gid.clone(),
            vec![PropertyChangeValue::attribute("name", "Bob")],
        );
        let subordinate = ObjectChange::insert(
            gid,
            vec![
                PropertyChangeValue::attribute("name", "Alice"),
                PropertyChangeValue::attribute("age", 41i64),
            ],
        );

        receiver.merge_values_from_subordinate(&subordinate);

        assert_eq!(receiver.property_change_values.len(), 2);
        assert_eq!(
            receiver.property_change("name").unwrap().change,
            PropertyChange::Attribute("Bob".into())
        );
        assert_eq!(
            receiver.property_change("age").unwrap().change,
            PropertyChange::Attribute(AttributeValue::Integer(41))
        );
    }

    #[test]
    fn data_filenames_are_collected() {
        let change = ObjectChange::insert(
            GlobalIdentifier::new("Photo", "p1"),
            vec![
                PropertyChangeValue::attribute("image", AttributeValue::DataFile("abc".into())),
                PropertyChangeValue::attribute("title", "Sunset"),
            ],
        );
        assert_eq!(change.data_filenames().collect::<Vec<_>>(), vec!["abc"]);
    }
}
