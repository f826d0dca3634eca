//! Status command implementation.

use super::{scan_log, DataDir, OutputFormat};
use searchwal_core::{index_status, list_broken_files, BrokenFile, IndexStatus, Lsn};
use searchwal_storage::DirectorySegmentStore;
use serde::Serialize;
use std::path::Path;

/// Status of a data directory.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Per-file lengths and stamps.
    pub index: IndexStatus,
    /// End of the intact log, if there is a log.
    pub log_end: Option<Lsn>,
    /// Files that need a rebuild.
    pub broken: Vec<BrokenFile>,
}

/// Collects the status of a data directory.
///
/// Without a log no file can be checked against it, so `broken` stays
/// empty.
pub fn collect_status(path: &Path) -> Result<StatusReport, Box<dyn std::error::Error>> {
    let data = DataDir::new(path);
    let store = DirectorySegmentStore::open(&data.index_dir())?;
    let index = index_status(&store)?;

    let (log_end, broken) = if data.wal_path().exists() {
        let log = data.open_log()?;
        let end = Lsn::new(scan_log(&log, 0, |_| true)?.end);
        (Some(end), list_broken_files(&store, end)?)
    } else {
        (None, Vec::new())
    };

    Ok(StatusReport {
        index,
        log_end,
        broken,
    })
}

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let format = OutputFormat::parse(format)?;
    let report = collect_status(path)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &StatusReport) {
    println!("Index Status");
    println!("============");
    println!();
    println!("  Files:        {}", report.index.files.len());
    println!("  Total bytes:  {}", report.index.total_bytes);
    println!("  Max applied:  {}", report.index.max_applied_lsn);
    match report.log_end {
        Some(end) => println!("  Log end:      {end}"),
        None => println!("  Log end:      (no log)"),
    }
    println!();

    for file in &report.index.files {
        println!(
            "  file {:08x}  {:>10} bytes  applied {}",
            file.file, file.len, file.applied_lsn
        );
    }

    if report.broken.is_empty() {
        println!();
        println!("  ✓ No broken files");
    } else {
        println!();
        println!("  ✗ {} file(s) need a rebuild:", report.broken.len());
        for broken in &report.broken {
            println!("    - {:08x}: {}", broken.file, broken.reason);
        }
    }
}
