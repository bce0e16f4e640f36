//! The store's metadata record.

use crate::error::{StoreError, StoreResult};
use ensembles_model::{GlobalCount, ModelError, RevisionNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current metadata format version.
pub const METADATA_FORMAT_VERSION: u16 = 1;

/// Small record describing the local replica's position in the ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Format version.
    pub format_version: u16,
    /// Ensemble identifier.
    pub ensemble_id: String,
    /// Identifier of the local persistent store.
    pub persistent_store_id: String,
    /// Revision of the latest local save event.
    pub last_save_revision: RevisionNumber,
    /// Revision of the latest local merge event.
    pub last_merge_revision: RevisionNumber,
    /// Highest global count seen in any event.
    pub max_global_count: GlobalCount,
    /// Identifier of the current baseline event.
    pub baseline_identifier: Option<String>,
    /// Baseline the local structured store was last rebuilt from.
    pub baseline_used_to_construct_store: Option<String>,
    /// Identity token of the cloud account at leech time.
    pub identity_token: Option<String>,
    /// Events under construction, with their mandatory flag.
    pub incomplete_events: BTreeMap<String, bool>,
    /// Consecutive merges deferred because of an unknown model version.
    pub unknown_version_merges: u32,
}

impl StoreMetadata {
    /// Creates metadata for a freshly prepared store.
    pub fn new(ensemble_id: impl Into<String>, persistent_store_id: impl Into<String>) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            ensemble_id: ensemble_id.into(),
            persistent_store_id: persistent_store_id.into(),
            last_save_revision: 0,
            last_merge_revision: 0,
            max_global_count: 0,
            baseline_identifier: None,
            baseline_used_to_construct_store: None,
            identity_token: None,
            incomplete_events: BTreeMap::new(),
            unknown_version_merges: 0,
        }
    }

    /// Latest revision of any local event.
    pub fn last_revision(&self) -> RevisionNumber {
        self.last_save_revision.max(self.last_merge_revision)
    }

    /// Encodes as CBOR.
    ///
    /// # Errors
    ///
    /// Fails if encoding fails.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(ModelError::codec)?;
        Ok(buf)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Fails on malformed data or a newer format version.
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        let metadata: StoreMetadata = ciborium::from_reader(data)
            .map_err(|e| StoreError::corrupted(format!("undecodable metadata: {e}")))?;
        if metadata.format_version > METADATA_FORMAT_VERSION {
            return Err(StoreError::corrupted(format!(
                "unsupported metadata version {}",
                metadata.format_version
            )));
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metadata_starts_at_zero() {
        let metadata = StoreMetadata::new("ens", "store");
        assert_eq!(metadata.last_revision(), 0);
        assert!(metadata.baseline_identifier.is_none());
    }

    #[test]
    fn encoded_metadata_decodes() {
        let mut metadata = StoreMetadata::new("ens", "store");
        metadata.last_save_revision = 4;
        metadata.last_merge_revision = 6;
        metadata.incomplete_events.insert("e9".into(), true);
        let decoded = StoreMetadata::decode(&metadata.encode().unwrap()).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.last_revision(), 6);
    }

    #[test]
    fn garbage_metadata_is_corruption() {
        assert!(StoreMetadata::decode(&[0xff, 0x01]).unwrap_err().is_corruption());
    }
}
