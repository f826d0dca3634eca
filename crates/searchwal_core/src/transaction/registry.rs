//! Per-file ownership and open-transaction bookkeeping.

use crate::error::{CoreError, CoreResult};
use crate::types::{FileId, TransactionId};
use crate::wal::LogRecord;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
struct RegistryInner {
    owners: HashMap<FileId, TransactionId>,
    /// Start position of the first record of every transaction that has
    /// logged something and not yet ended.
    first_start: BTreeMap<TransactionId, u64>,
}

/// Tracks which active transaction owns which file, and where the oldest
/// open transaction's records begin.
#[derive(Debug, Default)]
pub(crate) struct TransactionRegistry {
    inner: Mutex<RegistryInner>,
}

impl TransactionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claims `file` for `txid`. Claiming a file twice is a no-op.
    pub(crate) fn claim(&self, file: FileId, txid: TransactionId) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        match inner.owners.get(&file) {
            Some(owner) if *owner != txid => Err(CoreError::FileLocked {
                file,
                owner: *owner,
            }),
            Some(_) => Ok(()),
            None => {
                inner.owners.insert(file, txid);
                Ok(())
            }
        }
    }

    /// Logs the first record of a transaction.
    ///
    /// The append runs under the registry lock so the record's position is
    /// registered before anyone can compute a restart point past it.
    pub(crate) fn log_first(
        &self,
        txid: TransactionId,
        append: impl FnOnce() -> CoreResult<LogRecord>,
    ) -> CoreResult<LogRecord> {
        let mut inner = self.inner.lock();
        let record = append()?;
        inner.first_start.entry(txid).or_insert(record.start());
        Ok(record)
    }

    /// Releases everything `txid` holds.
    pub(crate) fn release(&self, txid: TransactionId, files: &BTreeSet<FileId>) {
        let mut inner = self.inner.lock();
        for file in files {
            if inner.owners.get(file) == Some(&txid) {
                inner.owners.remove(file);
            }
        }
        inner.first_start.remove(&txid);
    }

    /// Returns where the records of the oldest open transaction start.
    pub(crate) fn oldest_start(&self) -> Option<u64> {
        self.inner.lock().first_start.values().min().copied()
    }

    /// Returns the owner of `file`, if any.
    pub(crate) fn owner(&self, file: FileId) -> Option<TransactionId> {
        self.inner.lock().owners.get(&file).copied()
    }
}
