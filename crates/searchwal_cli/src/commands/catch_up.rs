//! Catch-up command implementation.

use super::DataDir;
use searchwal_core::ResourceManagerTable;
use searchwal_replica::{BackendSource, CatchUp, FileCursorStore, ReplicaApplyLoop, ReplicaConfig};
use searchwal_storage::{DirectorySegmentStore, SegmentStore};
use std::path::Path;
use std::sync::Arc;

/// Applies the primary's log to a standby data directory until nothing
/// is left to apply.
///
/// The standby keeps its own index files and replica state; the primary's
/// directory is only read.
pub fn catch_up_dir(
    primary: &Path,
    standby: &Path,
    batch_size: usize,
) -> Result<CatchUp, Box<dyn std::error::Error>> {
    let log = DataDir::new(primary).open_log()?;
    let standby = DataDir::new(standby);
    let store = DirectorySegmentStore::open(&standby.index_dir())?;

    let mut apply = ReplicaApplyLoop::open(
        BackendSource::new(log),
        FileCursorStore::new(standby.replica_state_path()),
        Arc::new(store) as Arc<dyn SegmentStore>,
        Arc::new(ResourceManagerTable::search_only()),
        ReplicaConfig::new().with_batch_size(batch_size),
    )?;
    Ok(apply.catch_up()?)
}

/// Runs the catch-up command.
pub fn run(primary: &Path, standby: &Path, batch_size: usize) -> Result<(), Box<dyn std::error::Error>> {
    let caught = catch_up_dir(primary, standby, batch_size)?;
    println!("Standby at {standby:?}");
    println!("  Batches applied:  {}", caught.batches);
    println!("  Records applied:  {}", caught.records);
    println!("  Applied through:  {}", caught.applied_through);
    if caught.caught_up {
        println!("  ✓ Caught up with the primary");
    } else {
        println!("  More records remain; run again to continue");
    }
    Ok(())
}
