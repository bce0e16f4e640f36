//! Store modification events.

use crate::error::{ModelError, ModelResult};
use crate::object_change::{GlobalIdentifier, ObjectChange};
use crate::revision::{GlobalCount, Revision, RevisionNumber, RevisionSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state and kind of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Under construction. Never exported or merged.
    Incomplete,
    /// Synthetic event holding the net state up to a revision set.
    Baseline,
    /// Changes saved locally by the application.
    Save,
    /// Result of merging other stores' events.
    Merge,
}

impl EventType {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u16 {
        match self {
            EventType::Incomplete => 0,
            EventType::Baseline => 100,
            EventType::Save => 200,
            EventType::Merge => 300,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(EventType::Incomplete),
            100 => Some(EventType::Baseline),
            200 => Some(EventType::Save),
            300 => Some(EventType::Merge),
            _ => None,
        }
    }

    /// Returns true for save and merge events, which occupy a revision of
    /// their store.
    pub fn is_revisioned(&self) -> bool {
        matches!(self, EventType::Save | EventType::Merge)
    }
}

/// An ordered batch of object changes produced by one store.
///
/// Events are immutable once committed; the only transition is from
/// [`EventType::Incomplete`] to a final type, performed by
/// [`commit`](Self::commit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreModificationEvent {
    /// Unique identifier of the event.
    pub unique_identifier: String,
    /// Kind of event.
    pub event_type: EventType,
    /// Revision of the producing store.
    pub own_revision: Revision,
    /// What the producing store knew about every other store when the
    /// event was created.
    pub revision_set_of_other_stores_at_creation: RevisionSet,
    /// Global count, equal to `own_revision.global_count`.
    pub global_count: GlobalCount,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Schema version the changes were captured with.
    pub model_version: String,
    /// Changes, at most one per object.
    pub object_changes: Vec<ObjectChange>,
}

impl StoreModificationEvent {
    /// Creates an incomplete event.
    pub fn new_incomplete(
        unique_identifier: impl Into<String>,
        own_revision: Revision,
        revision_set_of_other_stores_at_creation: RevisionSet,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            unique_identifier: unique_identifier.into(),
            event_type: EventType::Incomplete,
            global_count: own_revision.global_count,
            own_revision,
            revision_set_of_other_stores_at_creation,
            timestamp_ms: now_millis(),
            model_version: model_version.into(),
            object_changes: Vec::new(),
        }
    }

    /// Store that produced the event.
    pub fn store_id(&self) -> &str {
        &self.own_revision.store_id
    }

    /// Revision number within the producing store.
    pub fn revision_number(&self) -> RevisionNumber {
        self.own_revision.revision_number
    }

    /// Returns true once the event has a final type.
    pub fn is_committed(&self) -> bool {
        self.event_type != EventType::Incomplete
    }

    /// Everything the event covers: the other stores' revisions plus its
    /// own revision.
    pub fn revision_set(&self) -> RevisionSet {
        let mut set = self.revision_set_of_other_stores_at_creation.clone();
        set.insert(self.own_revision.clone());
        set
    }

    /// Finalizes an incomplete event.
    ///
    /// # Errors
    ///
    /// Fails if the event is already committed or `event_type` is
    /// [`EventType::Incomplete`].
    pub fn commit(&mut self, event_type: EventType) -> ModelResult<()> {
        if self.is_committed() {
            return Err(ModelError::InvalidStructure(format!(
                "event {} is already committed",
                self.unique_identifier
            )));
        }
        if event_type == EventType::Incomplete {
            return Err(ModelError::InvalidStructure(
                "cannot commit an event as incomplete".into(),
            ));
        }
        self.event_type = event_type;
        self.timestamp_ms = now_millis();
        Ok(())
    }

    /// Returns the change for an object.
    pub fn object_change_for(&self, identifier: &GlobalIdentifier) -> Option<&ObjectChange> {
        self.object_changes
            .iter()
            .find(|c| &c.global_identifier == identifier)
    }

    /// Data files referenced by any change.
    pub fn data_filenames(&self) -> BTreeSet<String> {
        self.object_changes
            .iter()
            .flat_map(|c| c.data_filenames().map(str::to_string))
            .collect()
    }

    /// Deterministic total order used for replay.
    ///
    /// Baselines come first. Other events order by global count, then
    /// store identifier, then revision number. The unique identifier breaks
    /// any remaining tie.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        let self_baseline = self.event_type == EventType::Baseline;
        let other_baseline = other.event_type == EventType::Baseline;
        other_baseline
            .cmp(&self_baseline)
            .then_with(|| self.global_count.cmp(&other.global_count))
            .then_with(|| self.store_id().cmp(other.store_id()))
            .then_with(|| self.revision_number().cmp(&other.revision_number()))
            .then_with(|| self.unique_identifier.cmp(&other.unique_identifier))
    }
}

/// Sorts events into replay order.
pub fn sort_canonically(events: &mut [StoreModificationEvent]) {
    events.sort_by(StoreModificationEvent::canonical_cmp);
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
