//! Tagged insert/delete messages queued in an internal node's per-child
//! FIFO, and the duplicate-key mode that governs how they apply (spec §3
//! "Message", §4.3 "Duplicate mode").

use serde::{Deserialize, Serialize};

use crate::cow_bytes::{CowBytes, SlicedCowBytes};

/// The per-database duplicate-key mode, persisted in the header flags
/// (spec §6 "Flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DupMode {
    /// At most one value per key.
    Unique,
    /// Multiple values per key, insertion order preserved.
    DuplicateUnsorted,
    /// Multiple values per key, ordered by the value comparator.
    DuplicateSorted,
}

impl DupMode {
    pub const DUP_BIT: u32 = 1 << 0;
    pub const DUP_SORT_BIT: u32 = 1 << 1;

    pub fn allows_duplicates(self) -> bool {
        !matches!(self, DupMode::Unique)
    }

    pub fn is_sorted(self) -> bool {
        matches!(self, DupMode::DuplicateSorted)
    }

    /// Encode as the persisted header flag bits.
    pub fn to_flags(self) -> u32 {
        match self {
            DupMode::Unique => 0,
            DupMode::DuplicateUnsorted => Self::DUP_BIT,
            DupMode::DuplicateSorted => Self::DUP_BIT | Self::DUP_SORT_BIT,
        }
    }

    /// Decode from persisted header flag bits.
    pub fn from_flags(flags: u32) -> Self {
        if flags & Self::DUP_BIT == 0 {
            DupMode::Unique
        } else if flags & Self::DUP_SORT_BIT != 0 {
            DupMode::DuplicateSorted
        } else {
            DupMode::DuplicateUnsorted
        }
    }
}

/// A transaction identifier, stamped on every message so rollback can find
/// the records belonging to an aborting transaction.
pub type TxnId = u64;

/// The three message types a BRT operation can enqueue (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Insert `(key, value)`. If the key is already present under `Unique`
    /// mode, replaces the existing value.
    Insert,
    /// Delete every value stored under `key`.
    DeletePoint,
    /// Delete exactly the `(key, value)` pair.
    DeleteBoth,
}

/// A single queued message: type tag, key, optional value, owning txn.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageType,
    pub key: CowBytes,
    pub value: Option<SlicedCowBytes>,
    pub txn_id: TxnId,
}

impl Message {
    pub fn insert(key: CowBytes, value: SlicedCowBytes, txn_id: TxnId) -> Self {
        Message {
            kind: MessageType::Insert,
            key,
            value: Some(value),
            txn_id,
        }
    }

    pub fn delete_point(key: CowBytes, txn_id: TxnId) -> Self {
        Message {
            kind: MessageType::DeletePoint,
            key,
            value: None,
            txn_id,
        }
    }

    pub fn delete_both(key: CowBytes, value: SlicedCowBytes, txn_id: TxnId) -> Self {
        Message {
            kind: MessageType::DeleteBoth,
            key,
            value: Some(value),
            txn_id,
        }
    }

    /// Approximate in-memory/on-disk footprint, used for buffer byte-count
    /// accounting (spec §3 "Internal node" per-child byte count).
    pub fn size(&self) -> usize {
        // tag + txn id + key length prefix + key bytes + optional value
        1 + 8 + 4 + self.key.len() + self.value.as_ref().map_or(0, |v| 4 + v.len())
    }

    /// CRC32 contribution of this message to the node's local fingerprint.
    pub fn crc(&self) -> u32 {
        crate::fingerprint::crc32_pair(&self.key, self.value.as_deref().unwrap_or(&[]))
    }
}
