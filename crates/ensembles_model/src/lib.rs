//! # Ensembles Model
//!
//! Event, revision and change types for the Ensembles sync engine.
//!
//! This crate provides:
//! - Per-store revisions and revision vectors (`Revision`, `RevisionSet`)
//! - Typed property diffs (`PropertyChangeValue`)
//! - Object changes keyed by global identifier (`ObjectChange`)
//! - Store modification events and their canonical replay order
//! - An explicit schema descriptor used for diffing and validation
//! - Event file naming and CBOR encoding
//!
//! This crate performs no I/O. Storage lives in `ensembles_store`, merging
//! in `ensembles_engine`.
//!
//! ## Key Invariants
//!
//! - Revision numbers of a store strictly increase and are never reused
//! - A revision set holds at most one revision per store
//! - Events are immutable once committed
//! - Relationship changes reference global identifiers, never local handles

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod event_file;
mod object_change;
mod property;
mod revision;
mod schema;
mod value;

pub use error::{ModelError, ModelResult};
pub use event::{now_millis, sort_canonically, EventType, StoreModificationEvent};
pub use event_file::{
    decode_event, encode_event, EventFileKind, EventFileName, EVENT_FILE_EXTENSION,
    EVENT_FILE_FORMAT_VERSION,
};
pub use object_change::{GlobalIdentifier, ObjectChange, ObjectChangeType};
pub use property::{PropertyChange, PropertyChangeType, PropertyChangeValue};
pub use revision::{GlobalCount, Revision, RevisionNumber, RevisionSet};
pub use schema::{AttributeType, EntityDescriptor, ModelSchema, PropertyKind};
pub use value::AttributeValue;
