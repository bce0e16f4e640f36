//! Error types for the event model.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised by model types and the event codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Two revisions from different stores were compared.
    #[error("cannot compare revision of store {left} with revision of store {right}")]
    IncomparableRevisions {
        /// Store of the left-hand revision.
        left: String,
        /// Store of the right-hand revision.
        right: String,
    },

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// An event file carries a format version this build cannot read.
    #[error("unsupported event file format version {found} (supported: {supported})")]
    UnsupportedFormat {
        /// Version found in the file.
        found: u16,
        /// Highest version understood.
        supported: u16,
    },

    /// A file name does not follow the event file naming scheme.
    #[error("invalid event file name: {0}")]
    InvalidFileName(String),

    /// The entity is not described by the schema.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The property is not described for the entity.
    #[error("unknown property {property} on entity {entity}")]
    UnknownProperty {
        /// Entity name.
        entity: String,
        /// Property name.
        property: String,
    },

    /// A property change does not match the property's declared kind.
    #[error("property {entity}.{property} expects {expected}, change carries {found}")]
    PropertyKindMismatch {
        /// Entity name.
        entity: String,
        /// Property name.
        property: String,
        /// Declared kind.
        expected: String,
        /// Kind found in the change.
        found: String,
    },

    /// Structurally invalid data.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
}

impl ModelError {
    /// Creates a codec error from any displayable error.
    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }
}
