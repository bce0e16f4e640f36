//! Error types for the sync engine.

use crate::record_store::ObjectId;
use ensembles_model::{ModelError, RevisionNumber};
use ensembles_store::StoreError;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EnsembleResult<T> = Result<T, EnsembleError>;

/// Result type for record store operations.
pub type RecordResult<T> = Result<T, RecordError>;

/// Result type for cloud file system operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// How an error affects sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing was corrupted; retry later.
    Transient,
    /// Local sync state is invalid and must be reset.
    StateInvalidating,
    /// The caller misused the API; nothing was mutated.
    Contract,
}

/// Errors raised by the structured record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The store rejected an object.
    #[error("validation failed for object {object_id}: {message}")]
    ValidationFailed {
        /// Offending object.
        object_id: ObjectId,
        /// Reason given by the store.
        message: String,
    },

    /// The entity is not part of the schema.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// No object has the handle.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// Store-specific failure.
    #[error("record store failure: {0}")]
    Other(String),
}

/// Errors raised by cloud file systems.
#[derive(Error, Debug)]
pub enum CloudError {
    /// The file system is not connected.
    #[error("cloud file system is not connected")]
    NotConnected,

    /// No item at the path.
    #[error("no cloud item at {0}")]
    NotFound(String),

    /// Transfer failed.
    #[error("transfer error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A wait on the file system exceeded the configured timeout.
    #[error("cloud operation timed out: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Local I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CloudError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::Transport { retryable, .. } => *retryable,
            CloudError::Timeout { .. } | CloudError::NotConnected | CloudError::Io(_) => true,
            CloudError::NotFound(_) => false,
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Error, Debug)]
pub enum EnsembleError {
    /// Event store failure.
    #[error("event store error: {0}")]
    Store(#[from] StoreError),

    /// Model or codec failure.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Structured record store failure.
    #[error("record store error: {0}")]
    Record(#[from] RecordError),

    /// Cloud file system failure.
    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// The merge was cancelled between stages.
    #[error("merge cancelled")]
    Cancelled,

    /// The requested transition is not allowed from the current state.
    #[error("invalid state transition from {from} to {to}")]
    DisallowedStateChange {
        /// Current state.
        from: String,
        /// Attempted state.
        to: String,
    },

    /// The operation needs a leeched ensemble.
    #[error("ensemble is not leeched")]
    NotLeeched,

    /// The ensemble is already leeched.
    #[error("ensemble is already leeched")]
    AlreadyLeeched,

    /// The input batch is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A store's events do not continue from the last applied revision.
    #[error("discontinuous revisions for store {store_id}: expected {expected}, found {found}")]
    DiscontinuousRevisions {
        /// Store with the gap.
        store_id: String,
        /// Revision that should come next.
        expected: RevisionNumber,
        /// Revision that was found.
        found: RevisionNumber,
    },

    /// An event depends on an event that is not available.
    #[error("event {event_id} depends on missing revision {revision_number} of store {store_id}")]
    MissingDependencies {
        /// Dependent event.
        event_id: String,
        /// Store of the missing event.
        store_id: String,
        /// Missing revision.
        revision_number: RevisionNumber,
    },

    /// Referenced data files have not been downloaded.
    #[error("{} data files are missing", .filenames.len())]
    MissingDataFiles {
        /// Names of the missing files.
        filenames: Vec<String>,
    },

    /// An event was recorded with a schema version not known locally.
    #[error("unknown model version {version}")]
    UnknownModelVersion {
        /// Version found in the event.
        version: String,
    },

    /// Mandatory events are still under construction.
    #[error("{} mandatory events are incomplete", .identifiers.len())]
    IncompleteEventsPending {
        /// Incomplete event identifiers.
        identifiers: Vec<String>,
    },

    /// The cloud account changed since leeching.
    #[error("cloud identity changed")]
    CloudIdentityChanged,

    /// Local or remote sync data failed validation.
    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    /// Peers no longer carry the local store's history.
    #[error("local store was abandoned by the ensemble")]
    StoreUnregistered,

    /// The application saved while a merge was replaying.
    #[error("a save occurred during the merge")]
    SaveOccurredDuringMerge,

    /// The host vetoed the merged changes.
    #[error("merge aborted by host")]
    MergeAborted,

    /// Saving the merged changes failed and was not repaired.
    #[error("saving merged changes failed after {attempts} attempts: {message}")]
    MergeCommitFailed {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },

    /// A relationship points to an object without a global identifier.
    #[error("{entity}.{property} references object {object_id} which has no global identifier")]
    DanglingReference {
        /// Entity of the referencing object.
        entity: String,
        /// Relationship name.
        property: String,
        /// Referenced object.
        object_id: ObjectId,
    },

    /// An updated or deleted object has no global identifier.
    #[error("object {0} has no global identifier")]
    MissingGlobalIdentifier(ObjectId),
}

impl EnsembleError {
    /// Creates a data corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::DataCorruption(message.into())
    }

    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            EnsembleError::Store(e) if e.is_corruption() => ErrorClass::StateInvalidating,
            EnsembleError::Store(StoreError::Io(_)) => ErrorClass::Transient,
            EnsembleError::Store(_) => ErrorClass::Contract,
            EnsembleError::Model(_)
            | EnsembleError::CloudIdentityChanged
            | EnsembleError::DataCorruption(_)
            | EnsembleError::StoreUnregistered
            | EnsembleError::DanglingReference { .. }
            | EnsembleError::MissingGlobalIdentifier(_) => ErrorClass::StateInvalidating,
            EnsembleError::DisallowedStateChange { .. }
            | EnsembleError::NotLeeched
            | EnsembleError::AlreadyLeeched
            | EnsembleError::InvalidInput(_) => ErrorClass::Contract,
            EnsembleError::Record(_)
            | EnsembleError::Cloud(_)
            | EnsembleError::Cancelled
            | EnsembleError::DiscontinuousRevisions { .. }
            | EnsembleError::MissingDependencies { .. }
            | EnsembleError::MissingDataFiles { .. }
            | EnsembleError::UnknownModelVersion { .. }
            | EnsembleError::IncompleteEventsPending { .. }
            | EnsembleError::SaveOccurredDuringMerge
            | EnsembleError::MergeAborted
            | EnsembleError::MergeCommitFailed { .. } => ErrorClass::Transient,
        }
    }

    /// Returns true if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EnsembleError::Cancelled => false,
            EnsembleError::Cloud(e) => e.is_retryable(),
            _ => self.class() == ErrorClass::Transient,
        }
    }

    /// Returns true if local sync state must be torn down.
    pub fn requires_reset(&self) -> bool {
        self.class() == ErrorClass::StateInvalidating
    }

    /// Returns true if the merge should wait for more data rather than
    /// retry immediately.
    pub fn is_deferral(&self) -> bool {
        matches!(
            self,
            EnsembleError::DiscontinuousRevisions { .. }
                | EnsembleError::MissingDependencies { .. }
                | EnsembleError::MissingDataFiles { .. }
                | EnsembleError::UnknownModelVersion { .. }
                | EnsembleError::IncompleteEventsPending { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            EnsembleError::CloudIdentityChanged.class(),
            ErrorClass::StateInvalidating
        );
        assert_eq!(
            EnsembleError::MissingDataFiles { filenames: vec![] }.class(),
            ErrorClass::Transient
        );
        assert_eq!(EnsembleError::NotLeeched.class(), ErrorClass::Contract);
        assert_eq!(
            EnsembleError::Store(StoreError::corrupted("bad")).class(),
            ErrorClass::StateInvalidating
        );
        assert_eq!(
            EnsembleError::Store(StoreError::NotPrepared).class(),
            ErrorClass::Contract
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(EnsembleError::Cloud(CloudError::transport_retryable("offline")).is_retryable());
        assert!(!EnsembleError::Cloud(CloudError::transport_fatal("denied")).is_retryable());
        assert!(EnsembleError::SaveOccurredDuringMerge.is_retryable());
        assert!(!EnsembleError::Cancelled.is_retryable());
        assert!(!EnsembleError::DataCorruption("x".into()).is_retryable());
        assert!(EnsembleError::DataCorruption("x".into()).requires_reset());
    }

    #[test]
    fn deferrals() {
        let err = EnsembleError::DiscontinuousRevisions {
            store_id: "S".into(),
            expected: 3,
            found: 4,
        };
        assert!(err.is_deferral());
        assert!(err.to_string().contains("expected 3, found 4"));
        assert!(!EnsembleError::MergeAborted.is_deferral());
    }
}
