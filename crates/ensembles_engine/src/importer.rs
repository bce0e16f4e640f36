//! Capturing the existing contents of a record store when leeching.

use crate::builder::EventBuilder;
use crate::delegate::EnsembleDelegate;
use crate::error::EnsembleResult;
use crate::record_store::RecordStore;
use ensembles_model::{EventType, ModelSchema, StoreModificationEvent};
use ensembles_store::EventStore;
use tracing::info;

/// Records every object of a record store as inserts in one save event.
pub struct PersistentStoreImporter<'a> {
    store: &'a EventStore,
    records: &'a dyn RecordStore,
    schema: &'a ModelSchema,
    data_file_threshold: usize,
}

impl<'a> PersistentStoreImporter<'a> {
    /// Creates an importer.
    pub fn new(
        store: &'a EventStore,
        records: &'a dyn RecordStore,
        schema: &'a ModelSchema,
        data_file_threshold: usize,
    ) -> Self {
        Self {
            store,
            records,
            schema,
            data_file_threshold,
        }
    }

    /// Builds the import event. Returns `None` for an empty record store.
    ///
    /// # Errors
    ///
    /// Fails if the records cannot be read or the event cannot be built.
    pub fn import(
        &self,
        delegate: &dyn EnsembleDelegate,
    ) -> EnsembleResult<Option<StoreModificationEvent>> {
        let objects = self.records.all_objects()?;
        if objects.is_empty() {
            return Ok(None);
        }
        let mut builder = EventBuilder::new(self.store, self.schema, self.data_file_threshold);
        builder.make_new_event(EventType::Save, None)?;
        if let Err(e) = builder.add_changes_for_inserted_objects(&objects, delegate) {
            builder.discard_new_event()?;
            return Err(e);
        }
        let event = builder.finalize_new_event()?;
        info!(
            objects = objects.len(),
            event = %event.unique_identifier,
            "imported existing records"
        );
        Ok(Some(event))
    }
}
