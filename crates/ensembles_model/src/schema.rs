//! Explicit schema descriptor.
//!
//! The schema lists every entity and its typed properties. The event
//! builder consults it to know which fields to diff and how; the revision
//! manager uses it to validate incoming changes.

use crate::error::{ModelError, ModelResult};
use crate::event::StoreModificationEvent;
use crate::object_change::{ObjectChange, ObjectChangeType};
use crate::property::{PropertyChange, PropertyChangeType};
use crate::value::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    /// Boolean.
    Bool,
    /// 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Text.
    Text,
    /// Binary data; may be stored in a data file.
    Bytes,
    /// Date in milliseconds since the Unix epoch.
    Date,
}

impl AttributeType {
    /// Returns true if `value` can be stored in an attribute of this type.
    /// Null is accepted for every type.
    pub fn accepts(&self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (_, AttributeValue::Null)
                | (AttributeType::Bool, AttributeValue::Bool(_))
                | (AttributeType::Integer, AttributeValue::Integer(_))
                | (AttributeType::Float, AttributeValue::Float(_))
                | (AttributeType::Float, AttributeValue::Integer(_))
                | (AttributeType::Text, AttributeValue::Text(_))
                | (AttributeType::Bytes, AttributeValue::Bytes(_))
                | (AttributeType::Bytes, AttributeValue::DataFile(_))
                | (AttributeType::Date, AttributeValue::Date(_))
        )
    }
}

/// Kind of a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Scalar attribute.
    Attribute(AttributeType),
    /// Relationship to at most one object.
    ToOne {
        /// Entity of the related object.
        destination: String,
    },
    /// Relationship to many objects.
    ToMany {
        /// Entity of the related objects.
        destination: String,
        /// Whether member order is significant.
        ordered: bool,
    },
}

impl PropertyKind {
    /// Property change type used for this kind.
    pub fn change_type(&self) -> PropertyChangeType {
        match self {
            PropertyKind::Attribute(_) => PropertyChangeType::Attribute,
            PropertyKind::ToOne { .. } => PropertyChangeType::ToOne,
            PropertyKind::ToMany { ordered: false, .. } => PropertyChangeType::ToMany,
            PropertyKind::ToMany { ordered: true, .. } => PropertyChangeType::OrderedToMany,
        }
    }

    /// Destination entity of a relationship.
    pub fn destination(&self) -> Option<&str> {
        match self {
            PropertyKind::Attribute(_) => None,
            PropertyKind::ToOne { destination } | PropertyKind::ToMany { destination, .. } => {
                Some(destination)
            }
        }
    }
}

/// Description of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity name.
    pub name: String,
    properties: BTreeMap<String, PropertyKind>,
}

impl EntityDescriptor {
    /// Creates an entity without properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, ty: AttributeType) -> Self {
        self.properties
            .insert(name.into(), PropertyKind::Attribute(ty));
        self
    }

    /// Adds a to-one relationship.
    pub fn with_to_one(mut self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.properties.insert(
            name.into(),
            PropertyKind::ToOne {
                destination: destination.into(),
            },
        );
        self
    }

    /// Adds an unordered to-many relationship.
    pub fn with_to_many(mut self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.properties.insert(
            name.into(),
            PropertyKind::ToMany {
                destination: destination.into(),
                ordered: false,
            },
        );
        self
    }

    /// Adds an ordered to-many relationship.
    pub fn with_ordered_to_many(
        mut self,
        name: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        self.properties.insert(
            name.into(),
            PropertyKind::ToMany {
                destination: destination.into(),
                ordered: true,
            },
        );
        self
    }

    /// Returns a property's kind.
    pub fn property(&self, name: &str) -> Option<&PropertyKind> {
        self.properties.get(name)
    }

    /// Properties in name order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyKind)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The full schema with its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    version: String,
    compatible_versions: BTreeSet<String>,
    entities: BTreeMap<String, EntityDescriptor>,
}

impl ModelSchema {
    /// Creates an empty schema with a version string.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            compatible_versions: BTreeSet::new(),
            entities: BTreeMap::new(),
        }
    }

    /// Adds an entity.
    pub fn with_entity(mut self, entity: EntityDescriptor) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Declares an older version whose events this schema can read.
    pub fn with_compatible_version(mut self, version: impl Into<String>) -> Self {
        self.compatible_versions.insert(version.into());
        self
    }

    /// Current version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns true if events recorded with `version` can be replayed.
    pub fn is_known_version(&self, version: &str) -> bool {
        version == self.version || self.compatible_versions.contains(version)
    }

    /// Returns an entity descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::UnknownEntity`] if the entity is not declared.
    pub fn entity(&self, name: &str) -> ModelResult<&EntityDescriptor> {
        self.entities
            .get(name)
            .ok_or_else(|| ModelError::UnknownEntity(name.to_string()))
    }

    /// Entities in name order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    /// Returns a property's kind.
    ///
    /// # Errors
    ///
    /// Fails for unknown entities or properties.
    pub fn property(&self, entity: &str, property: &str) -> ModelResult<&PropertyKind> {
        self.entity(entity)?
            .property(property)
            .ok_or_else(|| ModelError::UnknownProperty {
                entity: entity.to_string(),
                property: property.to_string(),
            })
    }

    /// Checks an object change against the schema.
    ///
    /// # Errors
    ///
    /// Fails if the entity or a property is unknown, a change kind does
    /// not match its property, an attribute value has the wrong type, or a
    /// delete carries property values.
    pub fn validate_object_change(&self, change: &ObjectChange) -> ModelResult<()> {
        let entity = change.entity_name();
        self.entity(entity)?;

        if change.change_type == ObjectChangeType::Delete
            && !change.property_change_values.is_empty()
        {
            return Err(ModelError::InvalidStructure(format!(
                "delete of {} carries property values",
                change.global_identifier
            )));
        }

        for value in &change.property_change_values {
            let kind = self.property(entity, &value.property_name)?;
            let expected = kind.change_type();
            if expected != value.change_type() {
                return Err(ModelError::PropertyKindMismatch {
                    entity: entity.to_string(),
                    property: value.property_name.clone(),
                    expected: expected.name().to_string(),
                    found: value.change_type().name().to_string(),
                });
            }
            if let (PropertyKind::Attribute(ty), PropertyChange::Attribute(v)) =
                (kind, &value.change)
            {
                if !ty.accepts(v) {
                    return Err(ModelError::PropertyKindMismatch {
                        entity: entity.to_string(),
                        property: value.property_name.clone(),
                        expected: format!("{ty:?}"),
                        found: v.kind_name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks every change of an event.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate_event(&self, event: &StoreModificationEvent) -> ModelResult<()> {
        event
            .object_changes
            .iter()
            .try_for_each(|c| self.validate_object_change(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_change::GlobalIdentifier;
    use crate::property::PropertyChangeValue;

    fn schema() -> ModelSchema {
        ModelSchema::new("v2")
            .with_compatible_version("v1")
            .with_entity(
                EntityDescriptor::new("Person")
                    .with_attribute("name", AttributeType::Text)
                    .with_to_one("parent", "Person")
                    .with_to_many("friends", "Person"),
            )
    }

    #[test]
    fn known_versions() {
        let s = schema();
        assert!(s.is_known_version("v2"));
        assert!(s.is_known_version("v1"));
        assert!(!s.is_known_version("v3"));
    }

    #[test]
    fn validates_property_kinds() {
        let s = schema();
        let gid = GlobalIdentifier::new("Person", "p1");

        let ok = ObjectChange::insert(
            gid.clone(),
            vec![
                PropertyChangeValue::attribute("name", "Ann"),
                PropertyChangeValue::to_one("parent", Some("p0".into())),
            ],
        );
        s.validate_object_change(&ok).unwrap();

        let wrong_kind = ObjectChange::update(
            gid.clone(),
            vec![PropertyChangeValue::attribute("friends", "x")],
        );
        assert!(matches!(
            s.validate_object_change(&wrong_kind),
            Err(ModelError::PropertyKindMismatch { .. })
        ));

        let wrong_type =
            ObjectChange::update(gid.clone(), vec![PropertyChangeValue::attribute("name", 3i64)]);
        assert!(s.validate_object_change(&wrong_type).is_err());

        let unknown = ObjectChange::update(gid, vec![PropertyChangeValue::attribute("age", 3i64)]);
        assert!(matches!(
            s.validate_object_change(&unknown),
            Err(ModelError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn unknown_entity() {
        let change = ObjectChange::delete(GlobalIdentifier::new("Car", "c1"));
        assert!(matches!(
            schema().validate_object_change(&change),
            Err(ModelError::UnknownEntity(_))
        ));
    }
}
