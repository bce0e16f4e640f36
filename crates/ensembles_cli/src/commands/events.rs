//! Events command implementation.

use ensembles_model::{sort_canonically, StoreModificationEvent};
use ensembles_store::EventStore;

/// Events in replay order, optionally of one store.
pub fn select(
    store: &EventStore,
    only: Option<&str>,
    limit: Option<usize>,
) -> Vec<StoreModificationEvent> {
    let mut events = match only {
        Some(store_id) => store.events_for_store(store_id),
        None => store.all_events(),
    };
    sort_canonically(&mut events);
    if let Some(limit) = limit {
        events.truncate(limit);
    }
    events
}

/// Runs the events command.
pub fn run(
    store: &EventStore,
    only: Option<&str>,
    limit: Option<usize>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let events = select(store, only, limit);
    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    println!(
        "{:>8}  {:<36}  {:>6}  {:<8}  {:>7}  ID",
        "COUNT", "STORE", "REV", "TYPE", "CHANGES"
    );
    for event in &events {
        println!(
            "{:>8}  {:<36}  {:>6}  {:<8}  {:>7}  {}",
            event.global_count,
            event.store_id(),
            event.revision_number(),
            format!("{:?}", event.event_type),
            event.object_changes.len(),
            event.unique_identifier
        );
    }
    println!();
    println!("{} events", events.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembles_testkit::{EventFixture, TestEventStore};

    #[test]
    fn test_select_orders_and_filters() {
        let store = TestEventStore::memory("ens");
        store.add_all([
            EventFixture::save("B", 1).global_count(3).build(),
            EventFixture::save("A", 1).global_count(1).build(),
            EventFixture::save("A", 2).global_count(2).build(),
        ]);

        let all = select(&store, None, None);
        let ids: Vec<_> = all.iter().map(|e| e.unique_identifier.as_str()).collect();
        assert_eq!(ids, vec!["A-1", "A-2", "B-1"]);

        let only_b = select(&store, Some("B"), None);
        assert_eq!(only_b.len(), 1);
        assert_eq!(select(&store, None, Some(2)).len(), 2);
    }
}
