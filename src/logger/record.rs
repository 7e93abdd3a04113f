//! Typed WAL record payloads and their on-disk framing (spec §4.5 "A
//! segment begins with an 8-byte magic and 4-byte format version, followed
//! by length-prefixed, CRC-terminated records. Each record is
//! `{total-length, type-tag, LSN, payload, CRC32(header+payload),
//! total-length-repeated}`").
//!
//! Framing mirrors [`crate::serializer`]'s node-image framing exactly: a
//! 4-byte length prefix covering everything up to and including the CRC,
//! then the CRC, then the length repeated, so a reader can validate a
//! record from either end — the point of `rbuf.h`'s length-prefixed read
//! style, which this crate also uses for segment recovery's backward scan.
//! The payload itself is `bincode`-encoded; only the outer tag and LSN are
//! hand-framed so a scanner can classify a record without decoding it.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};

use crate::error::{Error, Result};
use crate::fingerprint::crc32;
use crate::message::TxnId;
use crate::node::{Lsn, NodeOffset};

/// The segment magic written at the start of every segment file.
pub const SEGMENT_MAGIC: &[u8; 8] = b"BRTWALv1";
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// One typed WAL record (spec §4.5 "Typed record payload"). Only the
/// record families the core actually emits are represented; there is no
/// generic "extra" variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordPayload {
    Begin { txn: TxnId, parent: Option<TxnId> },
    Commit { txn: TxnId },
    Checkpoint,

    FCreate { txn: TxnId, filename: String, mode: u32 },
    FOpen { txn: TxnId, filename: String, file_num: u32 },
    FHeader { txn: TxnId, file_num: u32, header_image: Vec<u8> },

    NewBrtNode {
        file_num: u32,
        offset: u64,
        height: u32,
        node_size: u32,
        dup_flags: u32,
        salt: u32,
    },

    AddChild { file_num: u32, offset: u64, child_index: u32, child: u64 },
    DelChild { file_num: u32, offset: u64, child_index: u32, old_child: u64 },
    SetChild { file_num: u32, offset: u64, child_index: u32, old_child: u64, new_child: u64 },
    SetPivot { file_num: u32, offset: u64, pivot_index: u32, old_pivot: Vec<u8>, new_pivot: Vec<u8> },
    ChangeChildFingerprint { file_num: u32, offset: u64, child_index: u32, old_fingerprint: u32, new_fingerprint: u32 },
    BrtEnq { file_num: u32, offset: u64, child_index: u32, message: Vec<u8> },
    BrtDeq { file_num: u32, offset: u64, child_index: u32, message: Vec<u8> },

    InsertInLeaf { file_num: u32, offset: u64, position: u32, key: Vec<u8>, value: Vec<u8>, txn: TxnId },
    DeleteInLeaf { file_num: u32, offset: u64, position: u32, key: Vec<u8>, value: Vec<u8>, txn: TxnId },
    ResizePma { file_num: u32, offset: u64, old_size: u32, new_size: u32 },
    PmaDistribute { file_num: u32, old_offset: u64, new_offset: u64, index_pairs: Vec<(u32, u32)> },

    ChangeUnnamedRoot { file_num: u32, old_root: u64, new_root: u64 },
    ChangeNamedRoot { file_num: u32, name: String, old_root: u64, new_root: u64 },
    ChangeUnusedMemory { file_num: u32, old: u64, new: u64 },
}

impl RecordPayload {
    /// A stable per-variant tag, written into the outer frame ahead of the
    /// `bincode`-encoded payload so a scanner can classify a record (e.g.
    /// to decide whether it belongs to the rollback log's structural
    /// no-op family) without decoding the whole thing.
    pub fn tag(&self) -> u16 {
        match self {
            RecordPayload::Begin { .. } => 1,
            RecordPayload::Commit { .. } => 2,
            RecordPayload::Checkpoint => 3,
            RecordPayload::FCreate { .. } => 4,
            RecordPayload::FOpen { .. } => 5,
            RecordPayload::FHeader { .. } => 6,
            RecordPayload::NewBrtNode { .. } => 7,
            RecordPayload::AddChild { .. } => 8,
            RecordPayload::DelChild { .. } => 9,
            RecordPayload::SetChild { .. } => 10,
            RecordPayload::SetPivot { .. } => 11,
            RecordPayload::ChangeChildFingerprint { .. } => 12,
            RecordPayload::BrtEnq { .. } => 13,
            RecordPayload::BrtDeq { .. } => 14,
            RecordPayload::InsertInLeaf { .. } => 15,
            RecordPayload::DeleteInLeaf { .. } => 16,
            RecordPayload::ResizePma { .. } => 17,
            RecordPayload::PmaDistribute { .. } => 18,
            RecordPayload::ChangeUnnamedRoot { .. } => 19,
            RecordPayload::ChangeNamedRoot { .. } => 20,
            RecordPayload::ChangeUnusedMemory { .. } => 21,
        }
    }

    /// True for the structural-edit family that the rollback log treats as
    /// a no-op on abort (spec §9 "Structural undo... is intentionally not
    /// implemented").
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RecordPayload::NewBrtNode { .. }
                | RecordPayload::AddChild { .. }
                | RecordPayload::DelChild { .. }
                | RecordPayload::SetChild { .. }
                | RecordPayload::SetPivot { .. }
                | RecordPayload::ChangeChildFingerprint { .. }
                | RecordPayload::BrtEnq { .. }
                | RecordPayload::BrtDeq { .. }
                | RecordPayload::ResizePma { .. }
                | RecordPayload::PmaDistribute { .. }
                | RecordPayload::ChangeUnnamedRoot { .. }
                | RecordPayload::ChangeNamedRoot { .. }
                | RecordPayload::ChangeUnusedMemory { .. }
        )
    }
}

/// A framed record: its LSN plus the typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub payload: RecordPayload,
}

/// Encode one record as `{total-length, type-tag, LSN, payload, CRC32,
/// total-length-repeated}` and append it to `out`.
pub fn encode_record(out: &mut Vec<u8>, record: &LogRecord) -> Result<()> {
    let encoded_payload =
        bincode::serialize(&record.payload).map_err(|e| Error::FormatError(e.to_string()))?;

    let mut body = Vec::with_capacity(2 + 8 + encoded_payload.len());
    body.write_u16::<BigEndian>(record.payload.tag())?;
    body.write_u64::<BigEndian>(record.lsn.0)?;
    body.extend_from_slice(&encoded_payload);

    let crc = crc32(&body);
    let total_len = (body.len() + 4) as u32; // body + trailing crc
    out.write_u32::<BigEndian>(total_len)?;
    out.extend_from_slice(&body);
    out.write_u32::<BigEndian>(crc)?;
    out.write_u32::<BigEndian>(total_len)?;
    Ok(())
}

/// Decode exactly one record starting at `cur`'s current position,
/// validating the CRC and the prefix/postfix agreement. Returns
/// `FormatError` on any mismatch or truncation — the caller (recovery)
/// treats that as "stop replaying here".
pub fn decode_record(cur: &mut Cursor<&[u8]>) -> Result<LogRecord> {
    let total_len = cur
        .read_u32::<BigEndian>()
        .map_err(|e| Error::FormatError(e.to_string()))? as usize;
    let body_start = cur.position() as usize;
    let image = *cur.get_ref();
    if body_start + total_len > image.len() || total_len < 4 {
        return Err(Error::FormatError("log record truncated".into()));
    }
    let body_end = body_start + total_len - 4;
    let body = &image[body_start..body_end];
    let crc_stored = (&image[body_end..body_end + 4]).read_u32::<BigEndian>()?;
    let len_postfix = (&image[body_end + 4..body_end + 8]).read_u32::<BigEndian>()?;
    if total_len as u32 != len_postfix {
        return Err(Error::FormatError("log record length prefix/postfix mismatch".into()));
    }
    if crc32(body) != crc_stored {
        return Err(Error::FormatError("log record CRC mismatch".into()));
    }

    let mut body_cur = Cursor::new(body);
    let tag = body_cur.read_u16::<BigEndian>()?;
    let lsn = Lsn(body_cur.read_u64::<BigEndian>()?);
    let payload_bytes = &body[body_cur.position() as usize..];
    let payload: RecordPayload =
        bincode::deserialize(payload_bytes).map_err(|e| Error::FormatError(e.to_string()))?;
    if payload.tag() != tag {
        return Err(Error::FormatError("log record tag/payload mismatch".into()));
    }

    cur.set_position((body_end + 8) as u64);
    Ok(LogRecord { lsn, payload })
}

/// Convenience for building offsets out of [`NodeOffset`] in call sites
/// that otherwise only deal in raw `u64`s.
pub fn offset_of(o: NodeOffset) -> u64 {
    o.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_record() {
        let record = LogRecord {
            lsn: Lsn(42),
            payload: RecordPayload::InsertInLeaf {
                file_num: 1,
                offset: 4096,
                position: 3,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                txn: 0,
            },
        };
        let mut buf = Vec::new();
        encode_record(&mut buf, &record).unwrap();
        let mut cur = Cursor::new(buf.as_slice());
        let decoded = decode_record(&mut cur).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(cur.position() as usize, buf.len());
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let record = LogRecord {
            lsn: Lsn(1),
            payload: RecordPayload::Commit { txn: 7 },
        };
        let mut buf = Vec::new();
        encode_record(&mut buf, &record).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let mut cur = Cursor::new(buf.as_slice());
        assert!(decode_record(&mut cur).is_err());
    }

    #[test]
    fn structural_records_are_flagged() {
        assert!(RecordPayload::AddChild { file_num: 0, offset: 0, child_index: 0, child: 0 }.is_structural());
        assert!(!RecordPayload::Commit { txn: 1 }.is_structural());
    }
}
