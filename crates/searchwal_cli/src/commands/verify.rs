//! Verify command implementation.

use super::{scan_log, CliError, DataDir, OutputFormat};
use searchwal_core::{RecordBody, TransactionId};
use searchwal_storage::LogBackend;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// Number of intact records.
    pub records_checked: u64,
    /// Record counts by type name.
    pub by_type: BTreeMap<&'static str, u64>,
    /// Transactions with a commit record.
    pub committed: u64,
    /// Transactions with an abort record.
    pub aborted: u64,
    /// Transactions with records but no outcome yet.
    pub open: Vec<u64>,
    /// Position just past the last intact record.
    pub valid_end: u64,
    /// Size of the log file.
    pub size: u64,
    /// Start of a torn tail. Opening the log cuts it off.
    pub torn_tail: Option<u64>,
    /// Damage that makes the log unusable.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks every frame of `log`.
pub fn verify_log(log: &dyn LogBackend) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    let mut open = BTreeSet::<TransactionId>::new();
    let scan = scan_log(log, 0, |record| {
        *result.by_type.entry(record.record_type().name()).or_insert(0) += 1;
        match record.body {
            RecordBody::TxCommit => {
                open.remove(&record.txid);
                result.committed += 1;
            }
            RecordBody::TxAbort => {
                open.remove(&record.txid);
                result.aborted += 1;
            }
            _ => {
                open.insert(record.txid);
            }
        }
        true
    })?;

    result.records_checked = scan.records;
    result.open = open.into_iter().map(TransactionId::as_u64).collect();
    result.valid_end = scan.end;
    result.size = scan.size;
    result.torn_tail = scan.torn_tail;
    if let Some(error) = scan.error {
        result.errors.push(error.to_string());
    }
    Ok(result)
}

/// Runs the verify command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let format = OutputFormat::parse(format)?;
    let data = DataDir::new(path);
    let log = data.open_log()?;
    let result = verify_log(&log)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => {
            println!("Verifying log at {:?}", data.wal_path());
            println!();
            print_result(&result);
        }
    }

    if result.is_ok() {
        Ok(())
    } else {
        Err(CliError::VerificationFailed(result.errors.join("; ")).into())
    }
}

fn print_result(result: &VerifyResult) {
    println!("  Records checked: {}", result.records_checked);
    for (name, count) in &result.by_type {
        println!("    {name:<20} {count}");
    }
    println!("  Committed transactions: {}", result.committed);
    println!("  Aborted transactions:   {}", result.aborted);
    if !result.open.is_empty() {
        println!("  Transactions without outcome: {:?}", result.open);
    }
    println!("  Valid prefix: {} of {} bytes", result.valid_end, result.size);
    if let Some(torn) = result.torn_tail {
        println!("  Torn tail at {torn}, cut off on next open");
    }

    if result.is_ok() {
        println!("  ✓ Log OK");
    } else {
        println!("  ✗ {} error(s) found:", result.errors.len());
        for error in &result.errors {
            println!("    - {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::write_log;
    use tempfile::tempdir;

    #[test]
    fn healthy_log_verifies() {
        let dir = tempdir().unwrap();
        let log = write_log(dir.path());
        let result = verify_log(&log).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.records_checked, 4);
        assert_eq!(result.committed, 1);
        assert_eq!(result.open, vec![2]);
        assert_eq!(result.by_type["RANGE_WRITE"], 2);
        assert_eq!(result.valid_end, result.size);
    }

    #[test]
    fn torn_tail_is_not_an_error() {
        let dir = tempdir().unwrap();
        let mut log = write_log(dir.path());
        let size = log.size().unwrap();
        log.append(&[0u8; 10]).unwrap();
        let result = verify_log(&log).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.torn_tail, Some(size));
        assert_eq!(result.valid_end, size);
    }

    #[test]
    fn damaged_frame_is_an_error() {
        let dir = tempdir().unwrap();
        let log = write_log(dir.path());
        drop(log);
        let path = dir.path().join(crate::commands::WAL_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[30] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let log = searchwal_storage::FileLog::open(&path).unwrap();
        let result = verify_log(&log).unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.records_checked, 0);
        assert_eq!(result.valid_end, 0);
    }
}
