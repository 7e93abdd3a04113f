//! Per-transaction reverse undo lists and abort dispatch (spec §4.6
//! "Rollback Log"). Grounded on `original_source/newbrt/roll.c`: every
//! `toku_rollback_*` handler for a structural record family (`newbrtnode`,
//! `addchild`, `delchild`, `setchild`, `setpivot`,
//! `changechildfingerprint`, `brtenq`, `brtdeq`, `resizepma`,
//! `pmadistribute`, the root-pointer changes) is a stub (`ABORTIT`) in the
//! source; the spec codifies that as "structural records are no-ops on
//! abort" (§9). Only the leaf-level handlers (`insertinleaf`,
//! `deleteinleaf`) do real work, undoing the PMA edit directly.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::logger::record::RecordPayload;
use crate::message::TxnId;

/// Implemented by whatever owns the actual leaf storage (the BRT engine),
/// so this module can dispatch leaf-level undo without depending on the
/// tree module itself.
pub trait UndoApplier {
    fn undo_insert_in_leaf(
        &mut self,
        file_num: u32,
        offset: u64,
        position: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()>;

    fn undo_delete_in_leaf(
        &mut self,
        file_num: u32,
        offset: u64,
        position: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()>;
}

/// Apply the inverse of a single logged record. Structural records and
/// transaction/file bookkeeping records are no-ops (spec §9 "Structural
/// undo... is intentionally not implemented").
pub fn undo_one(applier: &mut impl UndoApplier, payload: &RecordPayload) -> Result<()> {
    match payload {
        RecordPayload::InsertInLeaf { file_num, offset, position, key, value, .. } => {
            applier.undo_insert_in_leaf(*file_num, *offset, *position, key, value)
        }
        RecordPayload::DeleteInLeaf { file_num, offset, position, key, value, .. } => {
            applier.undo_delete_in_leaf(*file_num, *offset, *position, key, value)
        }
        _ => Ok(()),
    }
}

struct TxnEntries {
    parent: Option<TxnId>,
    entries: Vec<RecordPayload>,
}

/// The engine-wide rollback log: one reverse undo list per live
/// transaction (spec §3 "Transaction": "aborts replay in reverse").
pub struct RollbackLog {
    txns: HashMap<TxnId, TxnEntries>,
}

impl RollbackLog {
    pub fn new() -> Self {
        RollbackLog { txns: HashMap::new() }
    }

    pub fn begin(&mut self, txn: TxnId, parent: Option<TxnId>) {
        self.txns.insert(txn, TxnEntries { parent, entries: Vec::new() });
    }

    /// Append one undo entry to the back of `txn`'s list; entries are
    /// popped from the back on abort, so the list replays in the reverse
    /// order the forward records were logged.
    pub fn record(&mut self, txn: TxnId, payload: RecordPayload) -> Result<()> {
        self.txns
            .get_mut(&txn)
            .ok_or(Error::NotFound)?
            .entries
            .push(payload);
        Ok(())
    }

    /// Commit splices a nested transaction's undo list onto its parent's
    /// (so an outer abort still undoes the nested work); a root-level
    /// commit simply discards its list, since committed state never needs
    /// undoing.
    pub fn commit(&mut self, txn: TxnId) -> Result<()> {
        let entries = self.txns.remove(&txn).ok_or(Error::NotFound)?;
        if let Some(parent) = entries.parent {
            let parent_entries = self.txns.get_mut(&parent).ok_or(Error::NotFound)?;
            parent_entries.entries.extend(entries.entries);
        }
        Ok(())
    }

    /// Abort: pop and apply every undo entry in reverse-logged order, then
    /// discard the transaction's list.
    pub fn abort(&mut self, txn: TxnId, applier: &mut impl UndoApplier) -> Result<()> {
        let mut entries = self.txns.remove(&txn).ok_or(Error::NotFound)?;
        while let Some(payload) = entries.entries.pop() {
            undo_one(applier, &payload)?;
        }
        Ok(())
    }

    pub fn is_live(&self, txn: TxnId) -> bool {
        self.txns.contains_key(&txn)
    }
}

impl Default for RollbackLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingApplier {
        inserts_undone: Vec<(u32, u64, u32)>,
        deletes_undone: Vec<(u32, u64, u32)>,
    }

    impl UndoApplier for RecordingApplier {
        fn undo_insert_in_leaf(&mut self, file_num: u32, offset: u64, position: u32, _key: &[u8], _value: &[u8]) -> Result<()> {
            self.inserts_undone.push((file_num, offset, position));
            Ok(())
        }
        fn undo_delete_in_leaf(&mut self, file_num: u32, offset: u64, position: u32, _key: &[u8], _value: &[u8]) -> Result<()> {
            self.deletes_undone.push((file_num, offset, position));
            Ok(())
        }
    }

    #[test]
    fn abort_replays_in_reverse_order() {
        let mut log = RollbackLog::new();
        log.begin(1, None);
        log.record(1, RecordPayload::InsertInLeaf { file_num: 0, offset: 0, position: 0, key: b"a".to_vec(), value: b"1".to_vec(), txn: 1 }).unwrap();
        log.record(1, RecordPayload::InsertInLeaf { file_num: 0, offset: 0, position: 1, key: b"b".to_vec(), value: b"2".to_vec(), txn: 1 }).unwrap();
        log.record(1, RecordPayload::AddChild { file_num: 0, offset: 0, child_index: 0, child: 1 }).unwrap();

        let mut applier = RecordingApplier { inserts_undone: vec![], deletes_undone: vec![] };
        log.abort(1, &mut applier).unwrap();
        assert_eq!(applier.inserts_undone, vec![(0, 0, 1), (0, 0, 0)]);
        assert!(!log.is_live(1));
    }

    #[test]
    fn commit_splices_into_parent() {
        let mut log = RollbackLog::new();
        log.begin(1, None);
        log.begin(2, Some(1));
        log.record(2, RecordPayload::InsertInLeaf { file_num: 0, offset: 0, position: 0, key: b"a".to_vec(), value: b"1".to_vec(), txn: 2 }).unwrap();
        log.commit(2).unwrap();
        assert!(!log.is_live(2));

        let mut applier = RecordingApplier { inserts_undone: vec![], deletes_undone: vec![] };
        log.abort(1, &mut applier).unwrap();
        assert_eq!(applier.inserts_undone, vec![(0, 0, 0)]);
    }

    #[test]
    fn structural_records_do_not_call_the_applier() {
        let mut log = RollbackLog::new();
        log.begin(1, None);
        log.record(1, RecordPayload::NewBrtNode { file_num: 0, offset: 0, height: 0, node_size: 4096, dup_flags: 0, salt: 1 }).unwrap();
        let mut applier = RecordingApplier { inserts_undone: vec![], deletes_undone: vec![] };
        log.abort(1, &mut applier).unwrap();
        assert!(applier.inserts_undone.is_empty());
        assert!(applier.deletes_undone.is_empty());
    }
}
