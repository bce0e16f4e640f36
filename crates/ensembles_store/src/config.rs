//! Event store configuration.

use std::path::PathBuf;

/// Configuration for an [`EventStore`](crate::EventStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Ensemble the store belongs to.
    pub ensemble_id: String,
    /// Directory holding the store. `None` keeps everything in memory.
    pub root: Option<PathBuf>,
    /// Whether `flush` forces data to disk.
    pub sync_on_flush: bool,
    /// Dead-to-total record ratio above which the log is rewritten.
    pub compaction_ratio: f64,
}

impl StoreConfig {
    /// Configuration for an in-memory store.
    pub fn in_memory(ensemble_id: impl Into<String>) -> Self {
        Self {
            ensemble_id: ensemble_id.into(),
            root: None,
            sync_on_flush: false,
            compaction_ratio: 0.5,
        }
    }

    /// Configuration for a store under `root`.
    pub fn at_path(ensemble_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            ensemble_id: ensemble_id.into(),
            root: Some(root.into()),
            sync_on_flush: true,
            compaction_ratio: 0.5,
        }
    }

    /// Sets whether `flush` syncs to disk.
    pub fn with_sync_on_flush(mut self, sync: bool) -> Self {
        self.sync_on_flush = sync;
        self
    }

    /// Sets the compaction ratio.
    pub fn with_compaction_ratio(mut self, ratio: f64) -> Self {
        self.compaction_ratio = ratio.clamp(0.0, 1.0);
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory("default")
    }
}
