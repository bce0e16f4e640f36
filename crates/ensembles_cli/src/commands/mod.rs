//! CLI command implementations.

pub mod compact;
pub mod events;
pub mod info;
pub mod verify;

use ensembles_store::{EventStore, StoreConfig};
use std::path::Path;

/// Opens the event store at `path`.
///
/// The ensemble identifier defaults to the last component of the path,
/// which is where the engine places each ensemble's store.
pub fn open_store(
    path: &Path,
    ensemble: Option<&str>,
) -> Result<EventStore, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No event store found at {:?}", path).into());
    }
    let ensemble_id = match ensemble {
        Some(id) => id.to_string(),
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or("Cannot derive the ensemble identifier from the path")?
            .to_string(),
    };
    let store = EventStore::open(StoreConfig::at_path(ensemble_id, path))?;
    if !store.contains_event_data() {
        return Err(format!("Event store at {:?} has not been prepared", path).into());
    }
    Ok(store)
}
