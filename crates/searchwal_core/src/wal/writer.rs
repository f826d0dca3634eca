//! The host log: LSN assignment, appends and flushes.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, ResourceManagerId, TransactionId};
use crate::wal::iterator::{self, LogBatch, LogReader};
use crate::wal::record::{encode, frame_len, LogRecord, RecordBody};
use parking_lot::{Condvar, Mutex};
use searchwal_storage::LogBackend;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

struct WalInner {
    backend: Box<dyn LogBackend>,
    /// Position where the next frame starts.
    end: u64,
    /// Prefix known to be on durable storage.
    durable: u64,
    max_txid: TransactionId,
    /// Set once the log can no longer vouch for its durable prefix.
    poisoned: Option<String>,
}

impl WalInner {
    fn ensure_writable(&self) -> CoreResult<()> {
        match &self.poisoned {
            Some(reason) => Err(CoreError::write_ordering_failure(format!(
                "log refuses writes until recovery: {reason}"
            ))),
            None => Ok(()),
        }
    }
}

/// The host log.
///
/// Assigns LSNs, appends frames, and makes prefixes of the log durable.
/// Readers only ever see the durable prefix, so nothing downstream can
/// observe a record before it is safe to act on.
///
/// # Opening
///
/// [`Wal::open`] scans the whole log once. A torn tail left by a crash is
/// cut off so new appends continue right after the last valid record;
/// corruption before the tail refuses the open.
///
/// # Poisoning
///
/// A failed flush leaves the durable prefix unknown: the bytes may or may
/// not have reached storage. A later successful flush would silently make
/// them durable, so instead the log poisons itself and refuses every
/// further append and flush. Reads of the known-durable prefix keep
/// working. Only reopening the log and running recovery clears the state.
pub struct Wal {
    inner: Mutex<WalInner>,
    durable_advanced: Condvar,
    sync_on_flush: bool,
    truncated_tail: Option<u64>,
}

impl Wal {
    /// Opens the log held by `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] or
    /// [`CoreError::UnsupportedRecordType`] if the existing log is damaged
    /// anywhere but its tail, or an I/O error.
    pub fn open(mut backend: Box<dyn LogBackend>, config: &Config) -> CoreResult<Self> {
        let size = backend.size()?;
        let mut max_txid = TransactionId::default();
        let mut records = 0u64;

        let (end, torn) = {
            let mut reader = LogReader::new(backend.as_ref(), 0, size, 0);
            for item in reader.by_ref() {
                match item {
                    Ok(record) => {
                        max_txid = max_txid.max(record.txid);
                        records += 1;
                    }
                    Err(CoreError::TornTailRecord { .. }) => break,
                    Err(e) => return Err(e),
                }
            }
            (reader.position(), reader.torn_tail())
        };

        if let Some(offset) = torn {
            warn!(offset, dropped = size - end, "cutting torn tail off the log");
            backend.truncate(end)?;
            backend.sync()?;
        }
        info!(records, end, max_txid = max_txid.as_u64(), "log opened");

        Ok(Self {
            inner: Mutex::new(WalInner {
                backend,
                end,
                durable: end,
                max_txid,
                poisoned: None,
            }),
            durable_advanced: Condvar::new(),
            sync_on_flush: config.sync_on_flush,
            truncated_tail: torn,
        })
    }

    /// Appends a record and returns it with its assigned LSN.
    ///
    /// The record is not durable until [`Wal::flush`] covers its LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded or written, or
    /// [`CoreError::WriteOrderingFailure`] if the log is poisoned.
    pub fn append(
        &self,
        rm_id: ResourceManagerId,
        txid: TransactionId,
        body: RecordBody,
    ) -> CoreResult<LogRecord> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        let lsn = Lsn::new(inner.end + frame_len(body.payload_len()) as u64);
        let frame = encode(rm_id, txid, lsn, &body)?;

        let offset = inner.backend.append(&frame)?;
        if offset != inner.end {
            return Err(CoreError::invalid_operation(format!(
                "log backend appended at {offset}, expected {}",
                inner.end
            )));
        }
        inner.end = lsn.as_u64();
        inner.max_txid = inner.max_txid.max(txid);
        debug!(lsn = lsn.as_u64(), txid = txid.as_u64(), kind = body.record_type().name(), "appended record");

        Ok(LogRecord {
            rm_id,
            txid,
            lsn,
            body,
        })
    }

    /// Makes every record up to and including `upto` durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails; the durable position
    /// does not move and the log is poisoned. Returns
    /// [`CoreError::WriteOrderingFailure`] if it already was.
    pub fn flush(&self, upto: Lsn) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        if inner.durable >= upto.as_u64() {
            return Ok(());
        }
        if upto.as_u64() > inner.end {
            return Err(CoreError::invalid_operation(format!(
                "cannot flush to {upto}, log ends at {}",
                Lsn::new(inner.end)
            )));
        }

        let flushed = if self.sync_on_flush {
            inner.backend.sync()
        } else {
            inner.backend.flush()
        };
        if let Err(e) = flushed {
            error!(durable = inner.durable, end = inner.end, error = %e, "log flush failed, refusing further writes");
            inner.poisoned = Some(format!("flush to {upto} failed: {e}"));
            return Err(e.into());
        }
        inner.durable = inner.end;
        drop(inner);

        self.durable_advanced.notify_all();
        Ok(())
    }

    /// Stops all further appends and flushes.
    ///
    /// Used when the caller can no longer keep storage in step with the
    /// log. The first reason sticks.
    pub fn poison(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.poisoned.is_none() {
            let reason = reason.into();
            warn!(reason = %reason, "log poisoned");
            inner.poisoned = Some(reason);
        }
    }

    /// Returns whether the log refuses writes.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().poisoned.is_some()
    }

    /// Returns the position where the next record will start.
    #[must_use]
    pub fn end_lsn(&self) -> Lsn {
        Lsn::new(self.inner.lock().end)
    }

    /// Returns the end of the durable prefix.
    #[must_use]
    pub fn durable_lsn(&self) -> Lsn {
        Lsn::new(self.inner.lock().durable)
    }

    /// Returns the highest transaction ID seen in the log.
    #[must_use]
    pub fn max_txid(&self) -> TransactionId {
        self.inner.lock().max_txid
    }

    /// Returns where the torn tail cut at open started, if there was one.
    #[must_use]
    pub fn truncated_tail(&self) -> Option<u64> {
        self.truncated_tail
    }

    /// Reads up to `max_records` durable records starting at `from`.
    ///
    /// # Errors
    ///
    /// Returns corruption, unsupported-type and I/O errors.
    pub fn read_batch(&self, from: Lsn, valid_tail: Lsn, max_records: usize) -> CoreResult<LogBatch> {
        let inner = self.inner.lock();
        if from.as_u64() > inner.durable {
            return Err(CoreError::ordering_violation(format!(
                "read position {from} is beyond the durable log end {}",
                Lsn::new(inner.durable)
            )));
        }
        iterator::read_batch(
            inner.backend.as_ref(),
            from.as_u64(),
            inner.durable,
            valid_tail.as_u64(),
            max_records,
        )
    }

    /// Blocks until the durable prefix extends beyond `position` or the
    /// timeout passes. Returns the durable position.
    pub fn wait_for_durable(&self, position: Lsn, timeout: Duration) -> Lsn {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.durable <= position.as_u64() {
            if self
                .durable_advanced
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                break;
            }
        }
        Lsn::new(inner.durable)
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("sync_on_flush", &self.sync_on_flush)
            .field("truncated_tail", &self.truncated_tail)
            .finish_non_exhaustive()
    }
}
