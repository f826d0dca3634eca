//! Streaming log reader.
//!
//! Reads frames one by one from a [`LogBackend`] through a bounded buffer,
//! and decides for every damaged frame whether it is a torn tail or
//! corruption.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use crate::wal::record::{decode_at, parse_header, LogRecord, HEADER_SIZE};
use searchwal_storage::LogBackend;
use tracing::debug;

/// Read buffer size for streaming iteration.
const READ_BUFFER_SIZE: usize = 64 * 1024; // 64 KB

/// A streaming iterator over log records.
///
/// # Torn tails and corruption
///
/// The reader is given a *valid tail*: the log position up to which the
/// caller has already read the log successfully. A damaged frame is a
/// **torn tail** when it starts at or after the valid tail and nothing
/// follows it:
///
/// - fewer bytes than a header remain
/// - the header is intact but the frame runs past the readable end
/// - the frame ends exactly at the readable end but fails its checksum
/// - the magic is wrong and every remaining byte is zero
///
/// A torn tail is yielded once as [`CoreError::TornTailRecord`] and ends
/// the iteration. Anything else is [`CoreError::CorruptRecord`].
pub struct LogReader<'a> {
    backend: &'a dyn LogBackend,
    position: u64,
    limit: u64,
    valid_tail: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
    torn_tail: Option<u64>,
    finished: bool,
}

impl<'a> LogReader<'a> {
    /// Creates a reader over `[from, limit)` of the backend.
    #[must_use]
    pub fn new(backend: &'a dyn LogBackend, from: u64, limit: u64, valid_tail: u64) -> Self {
        Self {
            backend,
            position: from,
            limit,
            valid_tail,
            buffer: Vec::new(),
            buffer_start: from,
            torn_tail: None,
            finished: false,
        }
    }

    /// Returns the position just past the last record returned.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns where the torn tail starts, once one has been found.
    #[must_use]
    pub fn torn_tail(&self) -> Option<u64> {
        self.torn_tail
    }

    /// Returns `len` bytes at `start`, refilling the buffer if needed.
    fn bytes(&mut self, start: u64, len: usize) -> CoreResult<&[u8]> {
        let buffered_end = self.buffer_start + self.buffer.len() as u64;
        if start < self.buffer_start || start + len as u64 > buffered_end {
            let want = len.max(READ_BUFFER_SIZE) as u64;
            let read_len = want.min(self.limit - start) as usize;
            self.buffer = self.backend.read_at(start, read_len)?;
            self.buffer_start = start;
        }
        let from = (start - self.buffer_start) as usize;
        Ok(&self.buffer[from..from + len])
    }

    fn rest_is_zero(&mut self, from: u64) -> CoreResult<bool> {
        let mut at = from;
        while at < self.limit {
            let len = (self.limit - at).min(READ_BUFFER_SIZE as u64) as usize;
            if self.bytes(at, len)?.iter().any(|b| *b != 0) {
                return Ok(false);
            }
            at += len as u64;
        }
        Ok(true)
    }

    fn tail_or_corrupt(&mut self, torn: bool, reason: &str) -> CoreError {
        self.finished = true;
        let offset = self.position;
        if torn && offset >= self.valid_tail {
            debug!(offset, reason, "torn tail in log");
            self.torn_tail = Some(offset);
            CoreError::TornTailRecord { offset }
        } else {
            CoreError::corrupt_record(offset, reason)
        }
    }

    fn read_next(&mut self) -> CoreResult<Option<LogRecord>> {
        let start = self.position;
        let remaining = self.limit - start;
        if remaining == 0 {
            self.finished = true;
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            return Err(self.tail_or_corrupt(true, "truncated frame header"));
        }

        let header = parse_header(self.bytes(start, HEADER_SIZE)?);
        let Some(header) = header else {
            let zeroed = self.rest_is_zero(start)?;
            return Err(self.tail_or_corrupt(zeroed, "bad frame magic"));
        };

        let frame_len = header.frame_len();
        if frame_len > remaining {
            let header_consistent = header.lsn.as_u64() == start + frame_len;
            return Err(self.tail_or_corrupt(header_consistent, "frame runs past end of log"));
        }

        let frame = self.bytes(start, frame_len as usize)?.to_vec();
        match decode_at(&frame, start) {
            Ok(record) => {
                self.position = start + frame_len;
                Ok(Some(record))
            }
            Err(CoreError::CorruptRecord { reason, .. }) => {
                let at_end = start + frame_len == self.limit;
                Err(self.tail_or_corrupt(at_end, &reason))
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }
}

impl Iterator for LogReader<'_> {
    type Item = CoreResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.read_next().transpose()
    }
}

/// Records read from the log in one go.
#[derive(Debug, Clone, Default)]
pub struct LogBatch {
    /// Records in log order.
    pub records: Vec<LogRecord>,
    /// Position just past the last record in `records` (or the start
    /// position if there are none).
    pub end: Lsn,
    /// Start of a torn tail, if reading stopped at one.
    pub torn_tail: Option<u64>,
}

impl LogBatch {
    /// Returns `true` if the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Reads up to `max_records` records from `[from, limit)` of a backend.
///
/// A torn tail ends the batch without an error. Any other error ends the
/// batch at the record before it; the error is returned by the next read,
/// which starts at the bad record.
///
/// # Errors
///
/// Returns corruption, unsupported-type and I/O errors hit at `from`.
pub fn read_batch(
    backend: &dyn LogBackend,
    from: u64,
    limit: u64,
    valid_tail: u64,
    max_records: usize,
) -> CoreResult<LogBatch> {
    let mut reader = LogReader::new(backend, from, limit, valid_tail);
    let mut records = Vec::new();
    while records.len() < max_records {
        match reader.next() {
            Some(Ok(record)) => records.push(record),
            Some(Err(CoreError::TornTailRecord { .. })) | None => break,
            Some(Err(e)) if records.is_empty() => return Err(e),
            Some(Err(e)) => {
                debug!(offset = reader.position(), error = %e, "batch ends before a bad record");
                break;
            }
        }
    }
    Ok(LogBatch {
        records,
        end: Lsn::new(reader.position()),
        torn_tail: reader.torn_tail(),
    })
}
