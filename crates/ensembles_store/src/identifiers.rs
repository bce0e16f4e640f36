//! Mapping between local object handles and global identifiers.

use ensembles_model::GlobalIdentifier;
use std::collections::BTreeMap;

/// Handle of an object in the local structured store.
pub type ObjectId = u64;

/// Two-way map between local objects and global identifiers.
///
/// A global identifier maps to at most one local object. Remapping an
/// identifier (for example after the object was deleted and recreated by a
/// merge) drops the previous object's entry.
#[derive(Debug, Clone, Default)]
pub struct IdentifierRegistry {
    by_object: BTreeMap<ObjectId, GlobalIdentifier>,
    by_identifier: BTreeMap<GlobalIdentifier, ObjectId>,
}

impl IdentifierRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a mapping.
    pub fn map(&mut self, object_id: ObjectId, identifier: GlobalIdentifier) {
        if let Some(previous) = self.by_identifier.insert(identifier.clone(), object_id) {
            if previous != object_id {
                self.by_object.remove(&previous);
            }
        }
        if let Some(old) = self.by_object.insert(object_id, identifier.clone()) {
            if old != identifier {
                self.by_identifier.remove(&old);
            }
        }
    }

    /// Global identifier of a local object.
    pub fn identifier_for_object(&self, object_id: ObjectId) -> Option<&GlobalIdentifier> {
        self.by_object.get(&object_id)
    }

    /// Local object for a global identifier.
    pub fn object_for_identifier(&self, identifier: &GlobalIdentifier) -> Option<ObjectId> {
        self.by_identifier.get(identifier).copied()
    }

    /// Number of mappings.
    pub fn len(&self) -> usize {
        self.by_object.len()
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.by_object.is_empty()
    }

    /// All mappings in object order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &GlobalIdentifier)> {
        self.by_object.iter().map(|(id, gid)| (*id, gid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_both_ways() {
        let mut registry = IdentifierRegistry::new();
        let gid = GlobalIdentifier::new("Person", "g1");
        registry.map(1, gid.clone());
        assert_eq!(registry.identifier_for_object(1), Some(&gid));
        assert_eq!(registry.object_for_identifier(&gid), Some(1));
    }

    #[test]
    fn remapping_identifier_moves_object() {
        let mut registry = IdentifierRegistry::new();
        let gid = GlobalIdentifier::new("Person", "g1");
        registry.map(1, gid.clone());
        registry.map(5, gid.clone());

        assert_eq!(registry.object_for_identifier(&gid), Some(5));
        assert_eq!(registry.identifier_for_object(1), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remapping_object_drops_old_identifier() {
        let mut registry = IdentifierRegistry::new();
        let first = GlobalIdentifier::new("Person", "g1");
        let second = GlobalIdentifier::new("Person", "g2");
        registry.map(1, first.clone());
        registry.map(1, second.clone());

        assert_eq!(registry.object_for_identifier(&first), None);
        assert_eq!(registry.object_for_identifier(&second), Some(1));
    }
}
