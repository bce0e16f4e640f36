//! # Ensembles Engine
//!
//! Peer-to-peer synchronisation of a structured record store through a
//! shared cloud file system, by exchanging immutable event files.
//!
//! This crate provides:
//! - Event building from committed local changes
//! - Integrity checks over the event history (continuity, dependencies,
//!   data files, model versions)
//! - The event integrator that replays history into the record store
//! - Baseline consolidation and rebasing of the history
//! - Cloud file transfer and the cloud file system abstraction
//! - The [`Ensemble`] host API with its merge queue and notifications
//!
//! ## Architecture
//!
//! Every replica keeps its own event store. A merge runs in stages:
//! 1. Import new event and data files from the cloud
//! 2. Consolidate baselines if more than one is present
//! 3. Check integrity and replay new events over the record store
//! 4. Commit the merged changes in one batch and record a merge event
//! 5. Export local events and data files
//! 6. Rebase when enough history is known to every peer
//!
//! ## Key Invariants
//!
//! - Replicas that hold the same events reach the same record state
//! - A store's revisions are applied without gaps
//! - A merge commits all of its changes or none
//! - A rebase folds only events every participating store has seen
//! - Committed events are never modified

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod baseline;
mod builder;
mod cloud;
mod config;
mod delegate;
mod ensemble;
mod error;
mod importer;
mod integrator;
mod merge_context;
mod rebaser;
mod record_store;
mod revision_manager;

pub use baseline::BaselineConsolidator;
pub use builder::EventBuilder;
pub use cloud::{
    join_remote, CloudFileSystem, CloudItem, CloudManager, LocalCloudFileSystem,
    MemoryCloudFileSystem,
};
pub use config::{EnsembleConfig, RebaseConfig, RetryConfig};
pub use delegate::{EnsembleDelegate, EnsembleNotification, NoopDelegate, Reparation};
pub use ensemble::{Ensemble, EnsembleState, EnsembleStats, MergeReport};
pub use error::{
    CloudError, CloudResult, EnsembleError, EnsembleResult, ErrorClass, RecordError, RecordResult,
};
pub use importer::PersistentStoreImporter;
pub use integrator::{EventIntegrator, IntegratorState, MergeOutcome};
pub use rebaser::{RebaseOutcome, Rebaser};
pub use record_store::{
    ChangeBatch, ChangeSet, FieldValue, MemoryRecordStore, ObjectId, Record, RecordStore,
    UpdatedObject, Validator,
};
pub use revision_manager::RevisionManager;
