//! Where a replica reads the log from.

use searchwal_core::wal::{self, LogBatch};
use searchwal_core::{CoreError, CoreResult, Lsn, Wal};
use searchwal_storage::LogBackend;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sleep between polls of a source that cannot signal new data.
const POLL_STEP: Duration = Duration::from_millis(5);

/// A stream of log records a replica consumes.
///
/// Sources only expose data that is safe to act on. For the host log that
/// is its durable prefix.
pub trait LogSource: Send + Sync {
    /// Reads up to `max_records` records starting at `from`.
    ///
    /// `valid_tail` is the position up to which the caller has already read
    /// the log successfully; damage before it is corruption, not a torn
    /// tail.
    ///
    /// # Errors
    ///
    /// Returns corruption, unsupported-type and I/O errors.
    fn read_batch(&self, from: Lsn, valid_tail: Lsn, max_records: usize) -> CoreResult<LogBatch>;

    /// Returns the end of the data currently available.
    ///
    /// # Errors
    ///
    /// Returns an I/O error.
    fn end_lsn(&self) -> CoreResult<Lsn>;

    /// Blocks until data past `after` is available or `timeout` passes,
    /// and returns the end of the available data.
    ///
    /// The default implementation polls [`LogSource::end_lsn`].
    ///
    /// # Errors
    ///
    /// Returns an I/O error.
    fn wait_for_records(&self, after: Lsn, timeout: Duration) -> CoreResult<Lsn> {
        let deadline = Instant::now() + timeout;
        loop {
            let end = self.end_lsn()?;
            let now = Instant::now();
            if end > after || now >= deadline {
                return Ok(end);
            }
            std::thread::sleep(POLL_STEP.min(deadline - now));
        }
    }
}

impl LogSource for Wal {
    fn read_batch(&self, from: Lsn, valid_tail: Lsn, max_records: usize) -> CoreResult<LogBatch> {
        Wal::read_batch(self, from, valid_tail, max_records)
    }

    fn end_lsn(&self) -> CoreResult<Lsn> {
        Ok(self.durable_lsn())
    }

    fn wait_for_records(&self, after: Lsn, timeout: Duration) -> CoreResult<Lsn> {
        Ok(self.wait_for_durable(after, timeout))
    }
}

impl<T: LogSource + ?Sized> LogSource for Arc<T> {
    fn read_batch(&self, from: Lsn, valid_tail: Lsn, max_records: usize) -> CoreResult<LogBatch> {
        (**self).read_batch(from, valid_tail, max_records)
    }

    fn end_lsn(&self) -> CoreResult<Lsn> {
        (**self).end_lsn()
    }

    fn wait_for_records(&self, after: Lsn, timeout: Duration) -> CoreResult<Lsn> {
        (**self).wait_for_records(after, timeout)
    }
}

/// Reads a log straight from a backend, e.g. a shipped log file.
///
/// Everything in the backend counts as available; a frame still being
/// written shows up as a torn tail and is picked up once complete.
#[derive(Debug)]
pub struct BackendSource<B> {
    backend: B,
}

impl<B: LogBackend> BackendSource<B> {
    /// Wraps a backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the wrapped backend.
    pub fn into_inner(self) -> B {
        self.backend
    }
}

impl<B: LogBackend> LogSource for BackendSource<B> {
    fn read_batch(&self, from: Lsn, valid_tail: Lsn, max_records: usize) -> CoreResult<LogBatch> {
        let size = self.backend.size()?;
        if from.as_u64() > size {
            return Err(CoreError::ordering_violation(format!(
                "read position {from} is beyond the log end {}",
                Lsn::new(size)
            )));
        }
        wal::read_batch(&self.backend, from.as_u64(), size, valid_tail.as_u64(), max_records)
    }

    fn end_lsn(&self) -> CoreResult<Lsn> {
        Ok(Lsn::new(self.backend.size()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchwal_core::{Config, FileId, RecordBody, SEARCH_RESOURCE_MANAGER_ID, TransactionId};
    use searchwal_storage::InMemoryLog;

    fn filled_log(records: u32) -> InMemoryLog {
        let log = InMemoryLog::new();
        let wal = Wal::open(Box::new(log.clone()), &Config::default()).unwrap();
        for i in 0..records {
            wal.append(
                SEARCH_RESOURCE_MANAGER_ID,
                TransactionId::new(1),
                RecordBody::SegmentAlloc {
                    file: FileId::new(i),
                    len: 0,
                },
            )
            .unwrap();
        }
        wal.flush(wal.end_lsn()).unwrap();
        log
    }

    #[test]
    fn backend_source_reads_in_batches() {
        let source = BackendSource::new(filled_log(5));
        let first = source.read_batch(Lsn::ZERO, Lsn::ZERO, 3).unwrap();
        assert_eq!(first.records.len(), 3);

        let rest = source.read_batch(first.end, first.end, 10).unwrap();
        assert_eq!(rest.records.len(), 2);
        assert_eq!(rest.end, source.end_lsn().unwrap());
    }

    #[test]
    fn partial_frame_is_a_torn_tail() {
        let log = filled_log(2);
        let complete = log.data().len();
        let mut writer = log.clone();
        writer.append(b"SWAL\x01\x00").unwrap();

        let source = BackendSource::new(log);
        let batch = source.read_batch(Lsn::ZERO, Lsn::ZERO, 10).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.end, Lsn::new(complete as u64));
        assert_eq!(batch.torn_tail, Some(complete as u64));
    }

    #[test]
    fn wait_times_out_without_new_data() {
        let source = BackendSource::new(filled_log(1));
        let end = source.end_lsn().unwrap();
        let waited = source.wait_for_records(end, Duration::from_millis(15)).unwrap();
        assert_eq!(waited, end);
    }

    #[test]
    fn wal_source_exposes_durable_prefix() {
        let wal = Arc::new(Wal::open(Box::new(InMemoryLog::new()), &Config::default()).unwrap());
        wal.append(SEARCH_RESOURCE_MANAGER_ID, TransactionId::new(1), RecordBody::TxAbort)
            .unwrap();
        assert_eq!(LogSource::end_lsn(&wal).unwrap(), Lsn::ZERO);

        wal.flush(Wal::end_lsn(&wal)).unwrap();
        assert_eq!(LogSource::end_lsn(&wal).unwrap(), Wal::end_lsn(&wal));
    }
}
