//! Compact command implementation.

use ensembles_store::EventStore;

/// Runs the compact command.
pub fn run(
    store: &EventStore,
    data_files: bool,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting event store of ensemble {}", store.ensemble_id());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let referenced = store.referenced_data_files();
    let present = store.data_files().names()?;
    let unreferenced = present.difference(&referenced).count();
    let before = store.log_size();

    println!("  Live events:         {}", store.event_count());
    println!("  Log size:            {} bytes", before);
    println!(
        "  Unreferenced files:  {} (will be {})",
        unreferenced,
        if data_files { "removed" } else { "kept" }
    );

    if dry_run {
        return Ok(());
    }

    store.compact()?;
    let removed = if data_files {
        store.remove_unreferenced_data_files()?
    } else {
        0
    };
    let after = store.log_size();

    println!();
    println!("  Size after:          {} bytes", after);
    println!("  Space saved:         {} bytes", before.saturating_sub(after));
    println!("  Data files removed:  {}", removed);
    Ok(())
}
