//! Info command implementation.

use ensembles_store::EventStore;
use serde::Serialize;

/// Store summary.
#[derive(Debug, Serialize)]
pub struct InfoResult {
    /// Ensemble identifier.
    pub ensemble_id: String,
    /// Local persistent store identifier.
    pub persistent_store_id: String,
    /// Latest local save revision.
    pub last_save_revision: i64,
    /// Latest local merge revision.
    pub last_merge_revision: i64,
    /// Highest global count seen.
    pub max_global_count: i64,
    /// Current baseline.
    pub baseline_identifier: Option<String>,
    /// Whether a cloud identity is recorded.
    pub has_identity_token: bool,
    /// Events in the store, including baselines.
    pub event_count: usize,
    /// Baseline events.
    pub baseline_count: usize,
    /// Object changes across all events.
    pub object_change_count: usize,
    /// Stores with events.
    pub store_ids: Vec<String>,
    /// Data files held locally.
    pub data_file_count: usize,
    /// Events still under construction.
    pub incomplete_events: usize,
    /// Log size in bytes.
    pub log_size: u64,
}

/// Collects the summary.
pub fn collect(store: &EventStore) -> Result<InfoResult, Box<dyn std::error::Error>> {
    let metadata = store.metadata()?;
    Ok(InfoResult {
        ensemble_id: metadata.ensemble_id,
        persistent_store_id: metadata.persistent_store_id,
        last_save_revision: metadata.last_save_revision,
        last_merge_revision: metadata.last_merge_revision,
        max_global_count: metadata.max_global_count,
        baseline_identifier: metadata.baseline_identifier,
        has_identity_token: metadata.identity_token.is_some(),
        event_count: store.event_count(),
        baseline_count: store.baseline_events().len(),
        object_change_count: store.object_change_count(),
        store_ids: store.store_ids().into_iter().collect(),
        data_file_count: store.data_files().names()?.len(),
        incomplete_events: metadata.incomplete_events.len(),
        log_size: store.log_size(),
    })
}

/// Runs the info command.
pub fn run(store: &EventStore, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(store)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("Event Store Information");
    println!("=======================");
    println!("Ensemble:          {}", result.ensemble_id);
    println!("Persistent store:  {}", result.persistent_store_id);
    println!("Last save:         {}", result.last_save_revision);
    println!("Last merge:        {}", result.last_merge_revision);
    println!("Max global count:  {}", result.max_global_count);
    println!(
        "Baseline:          {}",
        result.baseline_identifier.as_deref().unwrap_or("(none)")
    );
    println!("Identity recorded: {}", result.has_identity_token);
    println!();
    println!("Events:            {} ({} baselines)", result.event_count, result.baseline_count);
    println!("Object changes:    {}", result.object_change_count);
    println!("Stores:            {}", result.store_ids.join(", "));
    println!("Data files:        {}", result.data_file_count);
    println!("Incomplete events: {}", result.incomplete_events);
    println!("Log size:          {} bytes", result.log_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembles_testkit::{scenarios, TestEventStore};

    #[test]
    fn test_collect() {
        let store = TestEventStore::memory("ens");
        store.add_all(scenarios::linear_history("B", "Task", 2));
        let info = collect(&store).unwrap();
        assert_eq!(info.ensemble_id, "ens");
        assert_eq!(info.event_count, 2);
        assert_eq!(info.store_ids, vec!["B".to_string()]);
        assert_eq!(info.baseline_identifier, None);
    }
}
