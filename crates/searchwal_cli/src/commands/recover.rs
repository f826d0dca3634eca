//! Recover command implementation.

use super::{DataDir, OutputFormat};
use searchwal_core::{recover, Config, RecoveryReport, ResourceManagerTable, Wal};
use searchwal_replica::{CursorStore, FileCursorStore, ReplicaState};
use searchwal_storage::DirectorySegmentStore;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Replays the log of a data directory into its index files.
///
/// Replay starts at the cursor saved by the previous run, and the new
/// cursor is saved once recovery succeeds.
pub fn recover_dir(path: &Path) -> Result<RecoveryReport, Box<dyn std::error::Error>> {
    let data = DataDir::new(path);
    let config = Config::default();
    let log = data.open_log()?;
    let wal = Wal::open(Box::new(log), &config)?;
    let store = DirectorySegmentStore::open(&data.index_dir())?;

    let cursors = FileCursorStore::new(data.recovery_cursor_path());
    let mut saved = cursors.load()?.unwrap_or_default();
    info!(applied = %saved.cursor.applied_lsn, restart = %saved.cursor.restart_lsn, "loaded recovery cursor");

    let report = recover(
        &wal,
        &store,
        Arc::new(ResourceManagerTable::search_only()),
        saved.cursor,
        &config,
    )?;

    saved = ReplicaState {
        cursor: report.cursor,
        ..saved
    };
    cursors.save(&saved)?;
    Ok(report)
}

/// Runs the recover command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let format = OutputFormat::parse(format)?;
    let report = recover_dir(path)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Recovery complete");
            println!("  Applied through:  {}", report.cursor.applied_lsn);
            println!("  Restart point:    {}", report.cursor.restart_lsn);
            println!("  Log end:          {}", report.log_end);
            println!("  Records replayed: {}", report.stats.records);
            println!(
                "  Transactions:     {} committed, {} already applied, {} aborted",
                report.stats.committed, report.stats.already_applied, report.stats.aborted
            );
            if let Some(torn) = report.truncated_tail {
                println!("  Cut torn tail at {torn}");
            }
            if !report.aborted.is_empty() {
                let ids: Vec<u64> = report.aborted.iter().map(|t| t.as_u64()).collect();
                println!("  Aborted transactions without outcome: {ids:?}");
            }
        }
    }
    Ok(())
}
