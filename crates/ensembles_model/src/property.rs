//! Typed diffs of a single property.

use crate::value::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of property change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyChangeType {
    /// Scalar attribute.
    Attribute,
    /// To-one relationship.
    ToOne,
    /// Unordered to-many relationship.
    ToMany,
    /// Ordered to-many relationship.
    OrderedToMany,
}

impl PropertyChangeType {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            PropertyChangeType::Attribute => 1,
            PropertyChangeType::ToOne => 2,
            PropertyChangeType::ToMany => 3,
            PropertyChangeType::OrderedToMany => 4,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PropertyChangeType::Attribute),
            2 => Some(PropertyChangeType::ToOne),
            3 => Some(PropertyChangeType::ToMany),
            4 => Some(PropertyChangeType::OrderedToMany),
            _ => None,
        }
    }

    /// Human readable name.
    pub fn name(&self) -> &'static str {
        match self {
            PropertyChangeType::Attribute => "attribute",
            PropertyChangeType::ToOne => "to-one relationship",
            PropertyChangeType::ToMany => "to-many relationship",
            PropertyChangeType::OrderedToMany => "ordered to-many relationship",
        }
    }
}

/// Payload of a property change.
///
/// Relationship payloads always hold global identifiers, never local
/// object handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyChange {
    /// New attribute value.
    Attribute(AttributeValue),
    /// New related object, or `None` when the relationship was cleared.
    ToOne(Option<String>),
    /// Members added to and removed from an unordered relationship.
    ToMany {
        /// Identifiers added.
        added: BTreeSet<String>,
        /// Identifiers removed.
        removed: BTreeSet<String>,
    },
    /// Members added, removed and moved in an ordered relationship.
    ///
    /// Every added identifier also appears in `moved_by_index` so that its
    /// position is known.
    OrderedToMany {
        /// Identifiers added.
        added: BTreeSet<String>,
        /// Identifiers removed.
        removed: BTreeSet<String>,
        /// Final index of every identifier whose position changed.
        moved_by_index: BTreeMap<u32, String>,
    },
}

/// The change to one property of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChangeValue {
    /// Name of the property.
    pub property_name: String,
    /// What changed.
    pub change: PropertyChange,
}

impl PropertyChangeValue {
    /// Creates an attribute change.
    pub fn attribute(property_name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            property_name: property_name.into(),
            change: PropertyChange::Attribute(value.into()),
        }
    }

    /// Creates a to-one change.
    pub fn to_one(property_name: impl Into<String>, related: Option<String>) -> Self {
        Self {
            property_name: property_name.into(),
            change: PropertyChange::ToOne(related),
        }
    }

    /// Creates an unordered to-many change.
    pub fn to_many<A, R>(property_name: impl Into<String>, added: A, removed: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            property_name: property_name.into(),
            change: PropertyChange::ToMany {
                added: added.into_iter().map(Into::into).collect(),
                removed: removed.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Creates an ordered to-many change.
    pub fn ordered_to_many(
        property_name: impl Into<String>,
        added: BTreeSet<String>,
        removed: BTreeSet<String>,
        moved_by_index: BTreeMap<u32, String>,
    ) -> Self {
        Self {
            property_name: property_name.into(),
            change: PropertyChange::OrderedToMany {
                added,
                removed,
                moved_by_index,
            },
        }
    }

    /// Kind of this change.
    pub fn change_type(&self) -> PropertyChangeType {
        match &self.change {
            PropertyChange::Attribute(_) => PropertyChangeType::Attribute,
            PropertyChange::ToOne(_) => PropertyChangeType::ToOne,
            PropertyChange::ToMany { .. } => PropertyChangeType::ToMany,
            PropertyChange::OrderedToMany { .. } => PropertyChangeType::OrderedToMany,
        }
    }

    /// Name of the data file referenced by an attribute change.
    pub fn data_filename(&self) -> Option<&str> {
        match &self.change {
            PropertyChange::Attribute(value) => value.data_filename(),
            _ => None,
        }
    }

    /// Returns true when the change has no effect.
    pub fn is_empty(&self) -> bool {
        match &self.change {
            PropertyChange::ToMany { added, removed } => added.is_empty() && removed.is_empty(),
            PropertyChange::OrderedToMany {
                added,
                removed,
                moved_by_index,
            } => added.is_empty() && removed.is_empty() && moved_by_index.is_empty(),
            _ => false,
        }
    }

    /// Folds an earlier change to the same property into this one.
    ///
    /// Attribute and to-one values of `self` win. Relationship membership
    /// is combined as sets: a removal in `self` cancels an addition in the
    /// subordinate and vice versa. Changes of a different kind are ignored.
    pub fn merge_from_subordinate(&mut self, subordinate: &PropertyChangeValue) {
        match (&mut self.change, &subordinate.change) {
            (
                PropertyChange::ToMany { added, removed },
                PropertyChange::ToMany {
                    added: sub_added,
                    removed: sub_removed,
                },
            ) => merge_membership(added, removed, sub_added, sub_removed),
            (
                PropertyChange::OrderedToMany {
                    added,
                    removed,
                    moved_by_index,
                },
                PropertyChange::OrderedToMany {
                    added: sub_added,
                    removed: sub_removed,
                    moved_by_index: sub_moved,
                },
            ) => {
                merge_membership(added, removed, sub_added, sub_removed);

                let placed: BTreeSet<String> = moved_by_index.values().cloned().collect();
                let mut next_free = moved_by_index
                    .keys()
                    .next_back()
                    .map(|i| i + 1)
                    .unwrap_or(0);
                for (index, identifier) in sub_moved {
                    if placed.contains(identifier) || removed.contains(identifier) {
                        continue;
                    }
                    if moved_by_index.contains_key(index) {
                        while moved_by_index.contains_key(&next_free) {
                            next_free += 1;
                        }
                        moved_by_index.insert(next_free, identifier.clone());
                    } else {
                        moved_by_index.insert(*index, identifier.clone());
                    }
                }
            }
            _ => {}
        }
    }
}

fn merge_membership(
    added: &mut BTreeSet<String>,
    removed: &mut BTreeSet<String>,
    sub_added: &BTreeSet<String>,
    sub_removed: &BTreeSet<String>,
) {
    let carried_added: Vec<String> = sub_added
        .iter()
        .filter(|id| !removed.contains(*id))
        .cloned()
        .collect();
    let carried_removed: Vec<String> = sub_removed
        .iter()
        .filter(|id| !added.contains(*id))
        .cloned()
        .collect();
    added.extend(carried_added);
    removed.extend(carried_removed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_roundtrip() {
        for t in [
            PropertyChangeType::Attribute,
            PropertyChangeType::ToOne,
            PropertyChangeType::ToMany,
            PropertyChangeType::OrderedToMany,
        ] {
            assert_eq!(PropertyChangeType::from_code(t.to_code()), Some(t));
        }
        assert_eq!(PropertyChangeType::from_code(0), None);
    }

    #[test]
    fn receiver_attribute_wins() {
        let mut receiver = PropertyChangeValue::attribute("name", "Bob");
        let subordinate = PropertyChangeValue::attribute("name", "Alice");
        receiver.merge_from_subordinate(&subordinate);
        assert_eq!(receiver.change, PropertyChange::Attribute("Bob".into()));
    }

    #[test]
    fn to_many_membership_is_combined() {
        let mut receiver = PropertyChangeValue::to_many("friends", ["g2"], ["g4"]);
        let subordinate = PropertyChangeValue::to_many("friends", ["g4", "g5"], ["g3", "g2"]);
        receiver.merge_from_subordinate(&subordinate);

        let PropertyChange::ToMany { added, removed } = &receiver.change else {
            panic!("expected to-many change");
        };
        assert!(added.contains("g2"));
        assert!(added.contains("g5"));
        assert!(!added.contains("g4"));
        assert!(removed.contains("g4"));
        assert!(removed.contains("g3"));
        assert!(!removed.contains("g2"));
    }

    #[test]
    fn ordered_moves_keep_receiver_positions() {
        let mut receiver = PropertyChangeValue::ordered_to_many(
            "items",
            ["a".to_string()].into(),
            BTreeSet::new(),
            [(0, "a".to_string())].into(),
        );
        let subordinate = PropertyChangeValue::ordered_to_many(
            "items",
            ["b".to_string()].into(),
            BTreeSet::new(),
            [(0, "b".to_string())].into(),
        );
        receiver.merge_from_subordinate(&subordinate);

        let PropertyChange::OrderedToMany { moved_by_index, .. } = &receiver.change else {
            panic!("expected ordered change");
        };
        assert_eq!(moved_by_index.get(&0).map(String::as_str), Some("a"));
        assert_eq!(moved_by_index.get(&1).map(String::as_str), Some("b"));
    }

    #[test]
    fn empty_relationship_change() {
        let empty =
            PropertyChangeValue::to_many("friends", Vec::<String>::new(), Vec::<String>::new());
        assert!(empty.is_empty());
        assert!(!PropertyChangeValue::to_one("owner", None).is_empty());
    }
}
