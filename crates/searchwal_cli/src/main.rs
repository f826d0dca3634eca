//! searchwal CLI
//!
//! Command-line tools for a data directory holding a search log
//! (`search.wal`) and the index files it describes (`index/`).
//!
//! # Commands
//!
//! - `dump-wal` - Print log records through their resource manager
//! - `verify` - Check every frame of the log
//! - `recover` - Replay the log into the index files after a crash
//! - `catch-up` - Bring a standby's index files up to date with the log
//! - `status` - Show applied positions and files needing a rebuild

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// searchwal log and index tools.
#[derive(Parser)]
#[command(name = "searchwal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print log records for debugging
    DumpWal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this log position
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify log integrity
    Verify {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replay the log into the index files after a crash
    Recover {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Apply the log to a standby data directory
    CatchUp {
        /// Standby data directory
        #[arg(short, long)]
        standby: PathBuf,

        /// Records applied per batch
        #[arg(short, long, default_value = "256")]
        batch_size: usize,
    },

    /// Show index file status
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::DumpWal {
            limit,
            offset,
            format,
        } => {
            let path = cli.path.ok_or("Data directory required for dump-wal")?;
            commands::dump_wal::run(&path, limit, offset, &format)?;
        }
        Commands::Verify { format } => {
            let path = cli.path.ok_or("Data directory required for verify")?;
            commands::verify::run(&path, &format)?;
        }
        Commands::Recover { format } => {
            let path = cli.path.ok_or("Data directory required for recover")?;
            commands::recover::run(&path, &format)?;
        }
        Commands::CatchUp {
            standby,
            batch_size,
        } => {
            let path = cli.path.ok_or("Primary data directory required for catch-up")?;
            commands::catch_up::run(&path, &standby, batch_size)?;
        }
        Commands::Status { format } => {
            let path = cli.path.ok_or("Data directory required for status")?;
            commands::status::run(&path, &format)?;
        }
        Commands::Version => {
            println!("searchwal CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "log format v{}",
                searchwal_core::wal::FORMAT_VERSION
            );
        }
    }

    Ok(())
}
