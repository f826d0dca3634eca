//! Dump-wal command implementation.

use super::{scan_log, DataDir, LogScan, OutputFormat};
use searchwal_core::{LogRecord, ResourceManagerTable};
use searchwal_storage::LogBackend;
use serde::Serialize;
use std::path::Path;

/// One log record as printed.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Log position where the frame starts.
    pub start: u64,
    /// Position just past the frame.
    pub lsn: u64,
    /// Resource manager id.
    pub rm_id: u8,
    /// Host transaction id.
    pub txid: u64,
    /// Record type name.
    pub record_type: &'static str,
    /// Target file of a data record.
    pub file: Option<u32>,
    /// Description from the resource manager.
    pub description: String,
}

impl RecordInfo {
    fn new(table: &ResourceManagerTable, record: &LogRecord) -> Self {
        Self {
            start: record.start(),
            lsn: record.lsn.as_u64(),
            rm_id: record.rm_id.as_u8(),
            txid: record.txid.as_u64(),
            record_type: record.record_type().name(),
            file: record.file().map(|f| f.as_u32()),
            description: table.describe(record),
        }
    }
}

/// Reads up to `limit` records starting at log position `offset`.
pub fn collect_records(
    log: &dyn LogBackend,
    limit: Option<usize>,
    offset: u64,
) -> Result<(Vec<RecordInfo>, LogScan), Box<dyn std::error::Error>> {
    let table = ResourceManagerTable::search_only();
    let limit = limit.unwrap_or(usize::MAX);
    let mut records = Vec::new();
    let scan = scan_log(log, offset, |record| {
        if records.len() < limit {
            records.push(RecordInfo::new(&table, record));
        }
        records.len() < limit
    })?;
    Ok((records, scan))
}

/// Runs the dump-wal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    offset: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = OutputFormat::parse(format)?;
    let log = DataDir::new(path).open_log()?;
    let (records, scan) = collect_records(&log, limit, offset)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => print_text_output(&records, &scan),
    }
    Ok(())
}

fn print_text_output(records: &[RecordInfo], scan: &LogScan) {
    println!("Log Records");
    println!("===========");
    println!();

    if records.is_empty() {
        println!("No records found.");
    }
    for record in records {
        println!("[{:>10}] tx {:>6}  {}", record.start, record.txid, record.description);
    }

    println!();
    println!("Log size: {} bytes", scan.size);
    if let Some(torn) = scan.torn_tail {
        println!("Torn tail at {torn} ({} bytes)", scan.size - torn);
    }
    if let Some(error) = &scan.error {
        println!("Stopped at damaged record: {error}");
    }
}
