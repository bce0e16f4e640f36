//! Host callbacks and notifications.
//!
//! The merge pipeline calls [`EnsembleDelegate`] synchronously at fixed
//! points: before committing merged changes, after a failed commit, after
//! a successful commit, and when sync state is forcibly reset. During the
//! first two the host receives a [`Reparation`] through which it can patch
//! the pending changes.

use crate::error::{EnsembleError, RecordError, RecordResult};
use crate::record_store::{ChangeBatch, ChangeSet, ObjectId, Record, RecordStore};
use std::collections::BTreeSet;

/// Callbacks from the ensemble to its host. Every method has a default.
pub trait EnsembleDelegate: Send + Sync {
    /// Called before merged changes are committed. Returning false vetoes
    /// the merge.
    fn should_save_merged_changes(&self, _reparation: &mut Reparation<'_>) -> bool {
        true
    }

    /// Called after a commit of merged changes failed. Returning true
    /// retries the commit with whatever repairs were made; false aborts.
    fn did_fail_to_save_merged_changes(
        &self,
        _error: &RecordError,
        _reparation: &mut Reparation<'_>,
    ) -> bool {
        false
    }

    /// Called after merged changes were committed. The host should
    /// refresh its live views from `batch`.
    fn did_save_merged_changes(&self, _batch: &ChangeBatch) {}

    /// Called when local sync state was torn down. The host must leech
    /// again to resume syncing.
    fn did_force_reset(&self, _error: &EnsembleError) {}

    /// Supplies application global identifiers for newly inserted
    /// objects, one entry per object. `None` lets the engine mint one.
    fn global_identifiers_for_objects(
        &self,
        objects: &[(ObjectId, &Record)],
    ) -> Vec<Option<String>> {
        vec![None; objects.len()]
    }
}

/// Delegate that accepts every merge and ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl EnsembleDelegate for NoopDelegate {}

/// Writable view of the merged changes awaiting commit.
///
/// Reads see pending changes first and the committed store second.
/// Objects touched through the reparation are recorded so the merge event
/// can carry the repairs to other replicas.
pub struct Reparation<'a> {
    changes: &'a mut ChangeSet,
    store: &'a dyn RecordStore,
    touched: &'a mut BTreeSet<ObjectId>,
}

impl<'a> Reparation<'a> {
    pub(crate) fn new(
        changes: &'a mut ChangeSet,
        store: &'a dyn RecordStore,
        touched: &'a mut BTreeSet<ObjectId>,
    ) -> Self {
        Self {
            changes,
            store,
            touched,
        }
    }

    /// Pending changes.
    pub fn pending(&self) -> &ChangeSet {
        self.changes
    }

    /// Reads an object as it will be after the commit.
    ///
    /// # Errors
    ///
    /// Propagates record store failures.
    pub fn fetch(&self, object_id: ObjectId) -> RecordResult<Option<Record>> {
        if self.changes.deleted.contains(&object_id) {
            return Ok(None);
        }
        if let Some(record) = self
            .changes
            .inserted
            .get(&object_id)
            .or_else(|| self.changes.updated.get(&object_id))
        {
            return Ok(Some(record.clone()));
        }
        self.store.fetch(object_id)
    }

    /// Adds an object to the commit.
    pub fn insert(&mut self, record: Record) -> ObjectId {
        let object_id = self.store.allocate_object_id();
        self.changes.inserted.insert(object_id, record);
        self.touched.insert(object_id);
        object_id
    }

    /// Replaces the pending content of an object.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::ObjectNotFound`] if the object neither exists
    /// nor is pending insertion.
    pub fn update(&mut self, object_id: ObjectId, record: Record) -> RecordResult<()> {
        if let Some(pending) = self.changes.inserted.get_mut(&object_id) {
            *pending = record;
        } else if self.changes.updated.contains_key(&object_id)
            || self.store.fetch(object_id)?.is_some()
        {
            self.changes.deleted.remove(&object_id);
            self.changes.updated.insert(object_id, record);
        } else {
            return Err(RecordError::ObjectNotFound(object_id));
        }
        self.touched.insert(object_id);
        Ok(())
    }

    /// Deletes an object as part of the commit.
    pub fn delete(&mut self, object_id: ObjectId) {
        if self.changes.inserted.remove(&object_id).is_none() {
            self.changes.updated.remove(&object_id);
            self.changes.deleted.insert(object_id);
        }
        self.touched.insert(object_id);
    }
}

/// Events published on the ensemble's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EnsembleNotification {
    /// Synchronization started.
    Leeched {
        /// Local persistent store identifier.
        store_id: String,
    },
    /// Synchronization stopped.
    Deleeched,
    /// A merge began.
    MergeStarted,
    /// A merge finished.
    MergeCompleted {
        /// Events replayed.
        events_integrated: usize,
        /// Local events exported.
        events_exported: usize,
    },
    /// A merge ended in an error.
    MergeFailed {
        /// Error text.
        message: String,
    },
    /// Merged changes were committed to the record store.
    MergedChangesSaved {
        /// Objects inserted.
        inserted: usize,
        /// Objects updated.
        updated: usize,
        /// Objects deleted.
        deleted: usize,
    },
    /// A local save was recorded as an event.
    LocalSaveCaptured {
        /// Revision of the save event.
        revision_number: i64,
    },
    /// History was compacted into a baseline.
    Rebased {
        /// Events folded into the baseline.
        events_removed: usize,
    },
    /// Sync state was torn down.
    ForcedReset {
        /// Error text.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::MemoryRecordStore;
    use ensembles_model::{AttributeType, AttributeValue, EntityDescriptor, ModelSchema};
    use std::sync::Arc;

    #[test]
    fn reparation_overlays_pending_changes() {
        let schema = ModelSchema::new("v1")
            .with_entity(EntityDescriptor::new("Note").with_attribute("text", AttributeType::Text));
        let store = MemoryRecordStore::new(Arc::new(schema));
        let (existing, _) = store.insert(Record::new("Note")).unwrap();

        let mut changes = ChangeSet::default();
        let mut touched = BTreeSet::new();
        let mut reparation = Reparation::new(&mut changes, &store, &mut touched);

        let added = reparation.insert(Record::new("Note").with_attribute("text", "new"));
        reparation
            .update(existing, Record::new("Note").with_attribute("text", "fixed"))
            .unwrap();
        assert!(reparation.update(9999, Record::new("Note")).is_err());
        assert_eq!(
            reparation.fetch(existing).unwrap().unwrap().attribute("text"),
            Some(&AttributeValue::Text("fixed".into()))
        );

        reparation.delete(added);
        assert!(reparation.fetch(added).unwrap().is_none());
        assert!(reparation.pending().inserted.is_empty());

        assert_eq!(touched.len(), 2);
        assert!(changes.updated.contains_key(&existing));
    }

    #[test]
    fn noop_delegate_defaults() {
        let delegate = NoopDelegate;
        let record = Record::new("Note");
        assert_eq!(
            delegate.global_identifiers_for_objects(&[(1, &record), (2, &record)]),
            vec![None, None]
        );
    }
}
