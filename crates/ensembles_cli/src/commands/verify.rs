//! Verify command implementation.

use ensembles_model::{EventType, RevisionNumber};
use ensembles_store::EventStore;
use std::collections::{BTreeMap, BTreeSet};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of events checked.
    pub events_checked: usize,
    /// Problems that make the history unusable.
    pub errors: Vec<String>,
    /// Problems that only waste space or delay merges.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks the store's history and data files.
pub fn verify(store: &EventStore) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    let events = store.all_events();
    result.events_checked = events.len();

    let baselines: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::Baseline)
        .collect();
    if baselines.len() > 1 {
        result.warnings.push(format!(
            "{} baselines present; the next merge consolidates them",
            baselines.len()
        ));
    }
    let covered = store
        .current_baseline()
        .map(|b| b.revision_set())
        .unwrap_or_default();

    let mut revisions: BTreeMap<String, BTreeMap<RevisionNumber, Vec<String>>> = BTreeMap::new();
    for event in events.iter().filter(|e| e.event_type.is_revisioned()) {
        revisions
            .entry(event.store_id().to_string())
            .or_default()
            .entry(event.revision_number())
            .or_default()
            .push(event.unique_identifier.clone());
    }

    for (store_id, by_revision) in &revisions {
        for (revision, ids) in by_revision.iter().filter(|(_, ids)| ids.len() > 1) {
            result.errors.push(format!(
                "store {store_id} has {} events with revision {revision}: {}",
                ids.len(),
                ids.join(", ")
            ));
        }

        let base = covered.revision_number_for_store(store_id);
        let mut expected = base + 1;
        for revision in by_revision.keys().filter(|r| **r > base) {
            if *revision != expected {
                result.errors.push(format!(
                    "store {store_id} skips from revision {} to {revision}",
                    expected - 1
                ));
            }
            expected = revision + 1;
        }
        let stale = by_revision.keys().filter(|r| **r <= base).count();
        if stale > 0 {
            result.warnings.push(format!(
                "store {store_id} has {stale} events already covered by the baseline"
            ));
        }
    }

    let referenced = store.referenced_data_files();
    let present = store.data_files().names()?;
    for missing in referenced.difference(&present) {
        result.errors.push(format!("missing data file {missing}"));
    }
    let unreferenced: BTreeSet<_> = present.difference(&referenced).collect();
    if !unreferenced.is_empty() {
        result.warnings.push(format!(
            "{} unreferenced data files",
            unreferenced.len()
        ));
    }

    let incomplete = store.incomplete_event_identifiers()?;
    if !incomplete.is_empty() {
        result
            .warnings
            .push(format!("{} events under construction", incomplete.len()));
    }

    Ok(result)
}

/// Runs the verify command.
pub fn run(store: &EventStore) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying event store of ensemble {}", store.ensemble_id());
    println!();

    let result = verify(store)?;
    println!("Events checked: {}", result.events_checked);
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Event store verification passed");
        Ok(())
    } else {
        println!("✗ Event store verification failed");
        Err("Verification failed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembles_model::{AttributeValue, PropertyChangeValue};
    use ensembles_store::data_file_name;
    use ensembles_testkit::{scenarios, EventFixture, TestEventStore};

    #[test]
    fn test_clean_history_passes() {
        let store = TestEventStore::memory("ens");
        store.add_all(scenarios::linear_history("B", "Task", 3));
        let result = verify(&store).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.events_checked, 3);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_gap_is_reported() {
        let store = TestEventStore::memory("ens");
        store.add_all([
            EventFixture::save("B", 1).build(),
            EventFixture::save("B", 2).build(),
            EventFixture::save("B", 4).build(),
        ]);
        let result = verify(&store).unwrap();
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("skips from revision 2 to 4"));
    }

    #[test]
    fn test_baseline_sets_starting_revision() {
        let store = TestEventStore::memory("ens");
        store.add_all([
            EventFixture::baseline("B", 5).build(),
            EventFixture::save("B", 6).build(),
        ]);
        store
            .set_baseline_identifier(Some("baseline-B-5".to_string()))
            .unwrap();
        let result = verify(&store).unwrap();
        assert!(result.is_ok());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_data_files_checked() {
        let store = TestEventStore::memory("ens");
        let bytes = b"large attachment".to_vec();
        let name = data_file_name(&bytes);
        store.add_all([EventFixture::save("B", 1)
            .insert(
                "Task",
                "t1",
                vec![PropertyChangeValue::attribute(
                    "blob",
                    AttributeValue::DataFile(name.clone()),
                )],
            )
            .build()]);

        let result = verify(&store).unwrap();
        assert!(result.errors.iter().any(|e| e.contains(&name)));

        store.data_files().store(&bytes).unwrap();
        store.data_files().store(b"orphan").unwrap();
        let result = verify(&store).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.warnings, vec!["1 unreferenced data files".to_string()]);
    }
}
