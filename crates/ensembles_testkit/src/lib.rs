//! # Ensembles Testkit
//!
//! Test utilities for the Ensembles sync engine.
//!
//! This crate provides:
//! - Prepared in-memory and file-based event stores
//! - A builder and a JSON format for hand-written event histories
//! - Property-based generators for revision sets and concurrent
//!   multi-store histories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ensembles_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     let store = TestEventStore::memory("notes");
//!     store.add_all(scenarios::linear_history("B", "Task", 3));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
