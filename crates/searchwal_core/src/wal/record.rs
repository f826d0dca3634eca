//! Log record types and the frame codec.

use crate::error::{CoreError, CoreResult};
use crate::types::{FileId, Lsn, ResourceManagerId, TransactionId};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SWAL";

/// Current frame format version.
pub const FORMAT_VERSION: u16 = 1;

/// magic (4) + version (2) + rm id (1) + type (1) + txid (8) + lsn (8) + payload len (4)
pub const HEADER_SIZE: usize = 28;

/// Trailing CRC32.
pub const CRC_SIZE: usize = 4;

/// Type of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Create or reset a zero-filled file.
    SegmentAlloc = 1,
    /// Patch bytes in place or append at the end.
    RangeWrite = 2,
    /// Shrink a file.
    RangeTruncate = 3,
    /// Delete a file.
    FileRemove = 4,
    /// Replace a file with the output of compaction.
    CompactionRewrite = 5,
    /// A transaction committed.
    TxCommit = 6,
    /// A transaction aborted.
    TxAbort = 7,
}

impl RecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::SegmentAlloc),
            2 => Some(Self::RangeWrite),
            3 => Some(Self::RangeTruncate),
            4 => Some(Self::FileRemove),
            5 => Some(Self::CompactionRewrite),
            6 => Some(Self::TxCommit),
            7 => Some(Self::TxAbort),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the diagnostic name of the type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SegmentAlloc => "SEGMENT_ALLOC",
            Self::RangeWrite => "RANGE_WRITE",
            Self::RangeTruncate => "RANGE_TRUNCATE",
            Self::FileRemove => "FILE_REMOVE",
            Self::CompactionRewrite => "COMPACTION_REWRITE",
            Self::TxCommit => "TX_COMMIT",
            Self::TxAbort => "TX_ABORT",
        }
    }
}

/// The redo payload of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    /// Create `file` (or reset it) as `len` zero bytes.
    SegmentAlloc {
        /// Target file.
        file: FileId,
        /// Initial length.
        len: u64,
    },
    /// Write `data` at `offset`.
    RangeWrite {
        /// Target file.
        file: FileId,
        /// Byte offset.
        offset: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Shrink `file` to `len` bytes.
    RangeTruncate {
        /// Target file.
        file: FileId,
        /// New length.
        len: u64,
    },
    /// Delete `file`.
    FileRemove {
        /// Target file.
        file: FileId,
    },
    /// Replace the whole of `file` with `data`.
    CompactionRewrite {
        /// Target file.
        file: FileId,
        /// The compacted layout.
        data: Vec<u8>,
    },
    /// Makes the transaction's records observable.
    TxCommit,
    /// Discards the transaction's records.
    TxAbort,
}

impl RecordBody {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::SegmentAlloc { .. } => RecordType::SegmentAlloc,
            Self::RangeWrite { .. } => RecordType::RangeWrite,
            Self::RangeTruncate { .. } => RecordType::RangeTruncate,
            Self::FileRemove { .. } => RecordType::FileRemove,
            Self::CompactionRewrite { .. } => RecordType::CompactionRewrite,
            Self::TxCommit => RecordType::TxCommit,
            Self::TxAbort => RecordType::TxAbort,
        }
    }

    /// Returns the target file of a data record.
    #[must_use]
    pub fn file(&self) -> Option<FileId> {
        match self {
            Self::SegmentAlloc { file, .. }
            | Self::RangeWrite { file, .. }
            | Self::RangeTruncate { file, .. }
            | Self::FileRemove { file }
            | Self::CompactionRewrite { file, .. } => Some(*file),
            Self::TxCommit | Self::TxAbort => None,
        }
    }

    /// Returns the encoded payload length.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::SegmentAlloc { .. } | Self::RangeTruncate { .. } => 12,
            Self::RangeWrite { data, .. } => 12 + data.len(),
            Self::FileRemove { .. } => 4,
            Self::CompactionRewrite { data, .. } => 4 + data.len(),
            Self::TxCommit | Self::TxAbort => 0,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::SegmentAlloc { file, len } | Self::RangeTruncate { file, len } => {
                buf.put_u32_le(file.as_u32());
                buf.put_u64_le(*len);
            }
            Self::RangeWrite { file, offset, data } => {
                buf.put_u32_le(file.as_u32());
                buf.put_u64_le(*offset);
                buf.put_slice(data);
            }
            Self::FileRemove { file } => buf.put_u32_le(file.as_u32()),
            Self::CompactionRewrite { file, data } => {
                buf.put_u32_le(file.as_u32());
                buf.put_slice(data);
            }
            Self::TxCommit | Self::TxAbort => {}
        }
    }

    fn decode_payload(record_type: RecordType, mut payload: &[u8], offset: u64) -> CoreResult<Self> {
        let body = match record_type {
            RecordType::SegmentAlloc => Self::SegmentAlloc {
                file: FileId::new(take_u32(&mut payload, offset)?),
                len: take_u64(&mut payload, offset)?,
            },
            RecordType::RangeWrite => Self::RangeWrite {
                file: FileId::new(take_u32(&mut payload, offset)?),
                offset: take_u64(&mut payload, offset)?,
                data: take_rest(&mut payload),
            },
            RecordType::RangeTruncate => Self::RangeTruncate {
                file: FileId::new(take_u32(&mut payload, offset)?),
                len: take_u64(&mut payload, offset)?,
            },
            RecordType::FileRemove => Self::FileRemove {
                file: FileId::new(take_u32(&mut payload, offset)?),
            },
            RecordType::CompactionRewrite => Self::CompactionRewrite {
                file: FileId::new(take_u32(&mut payload, offset)?),
                data: take_rest(&mut payload),
            },
            RecordType::TxCommit => Self::TxCommit,
            RecordType::TxAbort => Self::TxAbort,
        };

        if payload.has_remaining() {
            return Err(CoreError::corrupt_record(
                offset,
                format!(
                    "{} trailing bytes in {} payload",
                    payload.remaining(),
                    record_type.name()
                ),
            ));
        }
        Ok(body)
    }
}

impl fmt::Display for RecordBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.record_type().name();
        match self {
            Self::SegmentAlloc { file, len } | Self::RangeTruncate { file, len } => {
                write!(f, "{name} {file} len={len}")
            }
            Self::RangeWrite { file, offset, data } => {
                write!(f, "{name} {file} offset={offset} len={}", data.len())
            }
            Self::FileRemove { file } => write!(f, "{name} {file}"),
            Self::CompactionRewrite { file, data } => {
                write!(f, "{name} {file} len={}", data.len())
            }
            Self::TxCommit | Self::TxAbort => f.write_str(name),
        }
    }
}

fn take_u32(buf: &mut &[u8], offset: u64) -> CoreResult<u32> {
    if buf.remaining() < 4 {
        return Err(CoreError::corrupt_record(offset, "unexpected end of payload"));
    }
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8], offset: u64) -> CoreResult<u64> {
    if buf.remaining() < 8 {
        return Err(CoreError::corrupt_record(offset, "unexpected end of payload"));
    }
    Ok(buf.get_u64_le())
}

fn take_rest(buf: &mut &[u8]) -> Vec<u8> {
    let rest = buf.to_vec();
    buf.advance(rest.len());
    rest
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Owning resource manager.
    pub rm_id: ResourceManagerId,
    /// Host transaction the record belongs to.
    pub txid: TransactionId,
    /// Position just past the end of the record's frame.
    pub lsn: Lsn,
    /// Redo payload.
    pub body: RecordBody,
}

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        self.body.record_type()
    }

    /// Returns the target file of a data record.
    #[must_use]
    pub fn file(&self) -> Option<FileId> {
        self.body.file()
    }

    /// Returns the size of the encoded frame.
    #[must_use]
    pub fn frame_len(&self) -> u64 {
        frame_len(self.body.payload_len()) as u64
    }

    /// Returns the log position where the frame starts.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.lsn.as_u64().saturating_sub(self.frame_len())
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.lsn, self.rm_id, self.txid, self.body)
    }
}

/// Returns the frame size for a payload of `payload_len` bytes.
#[must_use]
pub const fn frame_len(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len + CRC_SIZE
}

/// Fixed header fields of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Format version.
    pub version: u16,
    /// Resource manager ID.
    pub rm_id: ResourceManagerId,
    /// Raw type byte.
    pub type_byte: u8,
    /// Transaction ID.
    pub txid: TransactionId,
    /// LSN claimed by the frame.
    pub lsn: Lsn,
    /// Payload length.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Returns the size of the whole frame this header announces.
    #[must_use]
    pub fn frame_len(&self) -> u64 {
        frame_len(self.payload_len as usize) as u64
    }
}

/// Parses the fixed header at the start of `bytes`.
///
/// Returns `None` if fewer than [`HEADER_SIZE`] bytes are given or the
/// magic does not match. Nothing is checksummed here.
#[must_use]
pub fn parse_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < HEADER_SIZE || bytes[..4] != FRAME_MAGIC {
        return None;
    }
    let mut buf = &bytes[4..HEADER_SIZE];
    Some(FrameHeader {
        version: buf.get_u16_le(),
        rm_id: ResourceManagerId::new(buf.get_u8()),
        type_byte: buf.get_u8(),
        txid: TransactionId::new(buf.get_u64_le()),
        lsn: Lsn::new(buf.get_u64_le()),
        payload_len: buf.get_u32_le(),
    })
}

/// Encodes a record into a frame.
///
/// ```text
/// | magic (4) | version (2) | rm id (1) | type (1) | txid (8) | lsn (8) | len (4) | payload | crc32 (4) |
/// ```
///
/// # Errors
///
/// Returns [`CoreError::RecordTooLarge`] if the payload does not fit the
/// 4-byte length field.
pub fn encode(
    rm_id: ResourceManagerId,
    txid: TransactionId,
    lsn: Lsn,
    body: &RecordBody,
) -> CoreResult<Vec<u8>> {
    let payload_len = body.payload_len();
    let len = u32::try_from(payload_len).map_err(|_| CoreError::RecordTooLarge {
        size: payload_len,
        max: u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(frame_len(payload_len));
    buf.put_slice(&FRAME_MAGIC);
    buf.put_u16_le(FORMAT_VERSION);
    buf.put_u8(rm_id.as_u8());
    buf.put_u8(body.record_type().as_byte());
    buf.put_u64_le(txid.as_u64());
    buf.put_u64_le(lsn.as_u64());
    buf.put_u32_le(len);
    body.encode_payload(&mut buf);

    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    Ok(buf.to_vec())
}

/// Decodes one complete frame without checking where it sits in the log.
///
/// # Errors
///
/// - [`CoreError::CorruptRecord`] on a bad magic, length or checksum
/// - [`CoreError::UnsupportedRecordType`] on an unknown type or newer version
pub fn decode(frame: &[u8]) -> CoreResult<LogRecord> {
    decode_frame(frame, 0, false)
}

/// Decodes one complete frame that starts at log position `offset`.
///
/// In addition to [`decode`], the LSN in the header must equal the
/// position just past the frame.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_at(frame: &[u8], offset: u64) -> CoreResult<LogRecord> {
    decode_frame(frame, offset, true)
}

fn decode_frame(frame: &[u8], offset: u64, check_position: bool) -> CoreResult<LogRecord> {
    if frame.len() < HEADER_SIZE + CRC_SIZE {
        return Err(CoreError::corrupt_record(
            offset,
            format!("frame of {} bytes is shorter than a header", frame.len()),
        ));
    }
    let header =
        parse_header(frame).ok_or_else(|| CoreError::corrupt_record(offset, "bad frame magic"))?;

    let expected_len = header.frame_len();
    if frame.len() as u64 != expected_len {
        return Err(CoreError::corrupt_record(
            offset,
            format!(
                "length mismatch: header announces {expected_len} bytes, frame has {}",
                frame.len()
            ),
        ));
    }

    let crc_start = frame.len() - CRC_SIZE;
    let stored = (&frame[crc_start..]).get_u32_le();
    let computed = crc32fast::hash(&frame[..crc_start]);
    if stored != computed {
        return Err(CoreError::corrupt_record(
            offset,
            format!("checksum mismatch: stored {stored:08x}, computed {computed:08x}"),
        ));
    }

    if header.version > FORMAT_VERSION {
        return Err(CoreError::UnsupportedRecordType {
            type_byte: header.type_byte,
            version: header.version,
        });
    }
    let record_type =
        RecordType::from_byte(header.type_byte).ok_or(CoreError::UnsupportedRecordType {
            type_byte: header.type_byte,
            version: header.version,
        })?;

    if check_position && header.lsn.as_u64() != offset + expected_len {
        return Err(CoreError::corrupt_record(
            offset,
            format!(
                "frame claims LSN {} but ends at {}",
                header.lsn.as_u64(),
                offset + expected_len
            ),
        ));
    }

    let body = RecordBody::decode_payload(record_type, &frame[HEADER_SIZE..crc_start], offset)?;
    Ok(LogRecord {
        rm_id: header.rm_id,
        txid: header.txid,
        lsn: header.lsn,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RM: ResourceManagerId = ResourceManagerId::new(138);

    fn frame(body: &RecordBody) -> Vec<u8> {
        let len = frame_len(body.payload_len()) as u64;
        encode(RM, TransactionId::new(9), Lsn::new(len), body).unwrap()
    }

    #[test]
    fn record_type_bytes_are_stable() {
        for t in [
            RecordType::SegmentAlloc,
            RecordType::RangeWrite,
            RecordType::RangeTruncate,
            RecordType::FileRemove,
            RecordType::CompactionRewrite,
            RecordType::TxCommit,
            RecordType::TxAbort,
        ] {
            assert_eq!(RecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(RecordType::from_byte(0), None);
        assert_eq!(RecordType::from_byte(8), None);
    }

    #[test]
    fn range_write_decodes_at_its_position() {
        let body = RecordBody::RangeWrite {
            file: FileId::new(3),
            offset: 17,
            data: b"Groonga".to_vec(),
        };
        let bytes = frame(&body);
        assert_eq!(bytes.len(), HEADER_SIZE + 12 + 7 + CRC_SIZE);

        let record = decode_at(&bytes, 0).unwrap();
        assert_eq!(record.body, body);
        assert_eq!(record.rm_id, RM);
        assert_eq!(record.start(), 0);
        assert_eq!(record.lsn.as_u64(), bytes.len() as u64);
    }

    #[test]
    fn wrong_position_is_corrupt() {
        let bytes = frame(&RecordBody::TxCommit);
        assert!(decode(&bytes).is_ok());
        assert!(matches!(
            decode_at(&bytes, 100),
            Err(CoreError::CorruptRecord { offset: 100, .. })
        ));
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut bytes = frame(&RecordBody::FileRemove {
            file: FileId::new(1),
        });
        bytes[HEADER_SIZE] ^= 0x01;
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn truncated_frame_is_length_mismatch() {
        let bytes = frame(&RecordBody::CompactionRewrite {
            file: FileId::new(1),
            data: vec![7; 40],
        });
        let err = decode(&bytes[..bytes.len() - 5]).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn unknown_type_with_valid_checksum_is_unsupported() {
        let mut bytes = frame(&RecordBody::TxAbort);
        bytes[7] = 42;
        let crc_start = bytes.len() - CRC_SIZE;
        let crc = crc32fast::hash(&bytes[..crc_start]);
        bytes[crc_start..].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            decode(&bytes),
            Err(CoreError::UnsupportedRecordType { type_byte: 42, .. })
        ));
    }

    #[test]
    fn newer_version_is_unsupported() {
        let mut bytes = frame(&RecordBody::TxCommit);
        bytes[4..6].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        let crc_start = bytes.len() - CRC_SIZE;
        let crc = crc32fast::hash(&bytes[..crc_start]);
        bytes[crc_start..].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            decode(&bytes),
            Err(CoreError::UnsupportedRecordType { version: 2, .. })
        ));
    }

    #[test]
    fn trailing_bytes_in_fixed_body_are_corrupt() {
        let body = RecordBody::FileRemove {
            file: FileId::new(1),
        };
        let mut raw = BytesMut::new();
        raw.put_slice(&FRAME_MAGIC);
        raw.put_u16_le(FORMAT_VERSION);
        raw.put_u8(RM.as_u8());
        raw.put_u8(body.record_type().as_byte());
        raw.put_u64_le(1);
        raw.put_u64_le(frame_len(6) as u64);
        raw.put_u32_le(6);
        raw.put_u32_le(1);
        raw.put_u16_le(0xBEEF);
        let crc = crc32fast::hash(&raw);
        raw.put_u32_le(crc);

        let err = decode(&raw).unwrap_err();
        assert!(err.to_string().contains("trailing bytes"));
    }

    #[test]
    fn display_is_human_readable() {
        let body = RecordBody::RangeWrite {
            file: FileId::new(2),
            offset: 4,
            data: vec![0; 3],
        };
        assert_eq!(body.to_string(), "RANGE_WRITE file:2 offset=4 len=3");
    }

    fn body_strategy() -> impl Strategy<Value = RecordBody> {
        let file = (0u32..16).prop_map(FileId::new);
        let data = prop::collection::vec(any::<u8>(), 0..64);
        prop_oneof![
            (file.clone(), any::<u64>()).prop_map(|(file, len)| RecordBody::SegmentAlloc { file, len }),
            (file.clone(), any::<u64>(), data.clone())
                .prop_map(|(file, offset, data)| RecordBody::RangeWrite { file, offset, data }),
            (file.clone(), any::<u64>()).prop_map(|(file, len)| RecordBody::RangeTruncate { file, len }),
            file.clone().prop_map(|file| RecordBody::FileRemove { file }),
            (file, data).prop_map(|(file, data)| RecordBody::CompactionRewrite { file, data }),
            Just(RecordBody::TxCommit),
            Just(RecordBody::TxAbort),
        ]
    }

    proptest! {
        #[test]
        fn any_damaged_byte_is_detected(
            body in body_strategy(),
            at in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut bytes = frame(&body);
            let at = at.index(bytes.len());
            bytes[at] ^= flip;
            prop_assert!(decode(&bytes).is_err());
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
            let _ = decode(&bytes);
            let _ = parse_header(&bytes);
        }
    }
}
