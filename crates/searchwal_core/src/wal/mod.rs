//! The host log and its record codec.
//!
//! Every structural change to an index file is described by one
//! self-contained, redo-only record. Records are framed, checksummed and
//! appended to a single log; a record's LSN is the log position just past
//! its frame.
//!
//! ## Frame Format
//!
//! ```text
//! | magic (4) | version (2) | rm id (1) | type (1) | txid (8) | lsn (8) | len (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Tail Policy
//!
//! | Condition | Result |
//! |---|---|
//! | damaged frame at the end of readable data, at or past the valid tail | torn tail, clean stop |
//! | damaged frame before the valid tail, or followed by more data | `CorruptRecord`, fatal |
//! | intact frame of unknown type or newer version | `UnsupportedRecordType`, fatal |
//!
//! ## Invariants
//!
//! - the log is **append-only**; a record never changes once it has an LSN
//! - LSNs strictly increase and frames are contiguous
//! - readers see only the **durable prefix**

mod iterator;
mod record;
mod writer;

pub use iterator::{read_batch, LogBatch, LogReader};
pub use record::{
    decode, decode_at, encode, frame_len, parse_header, FrameHeader, LogRecord, RecordBody,
    RecordType, CRC_SIZE, FORMAT_VERSION, FRAME_MAGIC, HEADER_SIZE,
};
pub use writer::Wal;
