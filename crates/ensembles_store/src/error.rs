//! Error types for the event store.

use ensembles_model::{ModelError, RevisionNumber};
use std::io;
use thiserror::Error;

/// Result type for event store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A model or codec error.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Persisted data failed validation.
    #[error("event store corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store directory.
    #[error("event store is locked by another process")]
    Locked,

    /// The store has not been prepared.
    #[error("event store has not been prepared")]
    NotPrepared,

    /// The store already holds event data.
    #[error("event store already contains event data")]
    AlreadyPrepared,

    /// An event with the same unique identifier exists.
    #[error("duplicate event {0}")]
    DuplicateEvent(String),

    /// A save or merge event already occupies the revision.
    #[error("store {store_id} already has an event at revision {revision_number}")]
    DuplicateRevision {
        /// Store identifier.
        store_id: String,
        /// Revision number.
        revision_number: RevisionNumber,
    },

    /// Only committed events may be stored.
    #[error("event {0} is incomplete")]
    IncompleteEvent(String),

    /// No event has the identifier.
    #[error("event not found: {0}")]
    EventNotFound(String),

    /// A local event was produced by another store.
    #[error("event {0} was not produced by the local store")]
    ForeignEvent(String),

    /// No data file has the name.
    #[error("data file not found: {0}")]
    DataFileNotFound(String),

    /// Imported data does not hash to its file name.
    #[error("data file {name} does not match its content hash {actual}")]
    DataFileMismatch {
        /// Expected name.
        name: String,
        /// Hash of the received bytes.
        actual: String,
    },
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true if the error means persisted data cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupted(_) | StoreError::DataFileMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::DuplicateRevision {
            store_id: "A".into(),
            revision_number: 3,
        };
        assert_eq!(err.to_string(), "store A already has an event at revision 3");
        assert!(StoreError::corrupted("bad checksum").is_corruption());
        assert!(!StoreError::Locked.is_corruption());
    }
}
