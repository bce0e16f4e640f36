//! Ensembles CLI
//!
//! Command-line tools for inspecting the event store of one replica.
//!
//! # Commands
//!
//! - `info` - Display store metadata and statistics
//! - `events` - List events in replay order
//! - `verify` - Check revision continuity and data files
//! - `compact` - Rewrite the log with live records only

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Ensembles event store tools.
#[derive(Parser)]
#[command(name = "ensembles")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the event store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Ensemble identifier (defaults to the directory name)
    #[arg(global = true, short, long)]
    ensemble: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store metadata and statistics
    Info {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List events in replay order
    Events {
        /// Only events of this store
        #[arg(short, long)]
        store: Option<String>,

        /// Maximum number of events to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print full events as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check revision continuity and data files
    Verify,

    /// Rewrite the log with live records only
    Compact {
        /// Also remove data files no event references
        #[arg(long)]
        data_files: bool,

        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("Ensembles CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let path = cli.path.ok_or("Event store path required")?;
    let store = commands::open_store(&path, cli.ensemble.as_deref())?;

    match cli.command {
        Commands::Info { json } => commands::info::run(&store, json)?,
        Commands::Events { store: only, limit, json } => {
            commands::events::run(&store, only.as_deref(), limit, json)?
        }
        Commands::Verify => commands::verify::run(&store)?,
        Commands::Compact { data_files, dry_run } => {
            commands::compact::run(&store, data_files, dry_run)?
        }
        Commands::Version => {}
    }

    Ok(())
}
