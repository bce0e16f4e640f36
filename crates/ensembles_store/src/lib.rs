//! # Ensembles Store
//!
//! The event store of one local replica.
//!
//! This crate provides:
//! - A durable, append-only event log with checksummed records
//! - Indices by event identifier and by `(store_id, revision_number)`
//! - The metadata record (last save/merge revisions, baseline identifier,
//!   incomplete event bookkeeping, cloud identity token)
//! - The registry mapping local object handles to global identifiers
//! - Content-addressed data files for large attribute values
//!
//! ## Key Invariants
//!
//! - The log never holds two save/merge events with the same
//!   `(store_id, revision_number)`
//! - Committed events are never modified, only removed whole
//! - One process owns a store directory at a time (LOCK file)
//! - Metadata is replaced atomically

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod data_files;
mod dir;
mod error;
mod event_store;
mod identifiers;
mod log;
mod metadata;
mod record;

pub use backend::{FileLogBackend, LogBackend, MemoryLogBackend};
pub use config::StoreConfig;
pub use data_files::{data_file_name, DataFileStore};
pub use error::{StoreError, StoreResult};
pub use event_store::EventStore;
pub use identifiers::{IdentifierRegistry, ObjectId};
pub use metadata::{StoreMetadata, METADATA_FORMAT_VERSION};
pub use record::{scan_records, LogRecord, RecordType, ScanOutcome, RECORD_MAGIC, RECORD_VERSION};
