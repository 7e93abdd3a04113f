//! Flushing buffered messages from an internal node into a child (spec
//! §4.2 "Flush of a child buffer") and deciding when a node must flush or
//! split after a mutation (spec §4.2 "Descent and message application").
//!
//! Grounded on `original_source/newbrt/brt.c`'s `flush_this_child`: the
//! heaviest-buffered child is drained message by message, in FIFO order,
//! until either the buffer empties or the child itself splits.

use crate::error::Result;
use crate::logger::record::RecordPayload;
use crate::message::TxnId;
use crate::node::NodeOffset;

use super::Brt;

/// A message's own `txn_id` of 0 means "no transaction" (spec §3
/// "Transaction"; `tree::mod`'s `insert`/`delete_point`/`delete_both` store
/// `txn.unwrap_or(0)`). Flushing later re-applies a message under *its own*
/// transaction, not whatever transaction (if any) triggered the flush.
fn owning_txn(txn_id: TxnId) -> Option<TxnId> {
    if txn_id == 0 {
        None
    } else {
        Some(txn_id)
    }
}

impl Brt {
    /// If the node at `offset` is over its node-size budget, drain its
    /// heaviest child's buffer to make room; if it has grown past its
    /// fanout, split it. Loops because a single drain may not be enough to
    /// bring an internal node back under budget.
    pub(super) fn maybe_flush_oversized(
        &mut self,
        offset: NodeOffset,
    ) -> Result<Option<super::SplitResult>> {
        loop {
            let (oversized, over_fanout, has_buffered) = {
                let handle = self.pin_node(offset)?;
                let (oversized, over_fanout, has_buffered) = {
                    let item = handle.borrow();
                    let node = item
                        .0
                        .as_internal()
                        .expect("maybe_flush_oversized called on an internal offset");
                    (
                        item.0.approx_serialized_size() > self.node_size as usize,
                        node.child_count() > self.fanout,
                        node.heaviest_child().is_some(),
                    )
                };
                self.unpin_node(offset, false)?;
                (oversized, over_fanout, has_buffered)
            };

            if over_fanout {
                return Ok(Some(self.split_internal(offset)?));
            }
            if !oversized || !has_buffered {
                return Ok(None);
            }
            self.drain_and_absorb(offset)?;
        }
    }

    /// Pick the heaviest-buffered child and drain its whole FIFO into it
    /// (spec §9 open question: tie-break to lowest index).
    pub(super) fn drain_and_absorb(&mut self, parent_offset: NodeOffset) -> Result<()> {
        let child_idx = {
            let handle = self.pin_node(parent_offset)?;
            let idx = handle
                .borrow()
                .0
                .as_internal()
                .expect("drain_and_absorb called on an internal offset")
                .heaviest_child();
            self.unpin_node(parent_offset, false)?;
            idx
        };
        match child_idx {
            Some(idx) => self.drain_child_fully(parent_offset, idx),
            None => Ok(()),
        }
    }

    /// Dequeue every message buffered for `child_idx`, in FIFO order,
    /// applying each to the subtree under that child. Stops as soon as the
    /// child splits: the remaining (not yet dequeued) messages were never
    /// touched, and the ones already redistributed into both new halves by
    /// `handle_split_of_child` must not be drained twice.
    pub(super) fn drain_child_fully(&mut self, parent_offset: NodeOffset, child_idx: usize) -> Result<()> {
        loop {
            let msg = {
                let handle = self.pin_node(parent_offset)?;
                let msg = handle
                    .borrow_mut()
                    .0
                    .as_internal_mut()
                    .expect("drain_child_fully called on an internal offset")
                    .dequeue_front(child_idx);
                self.unpin_node(parent_offset, true)?;
                msg
            };
            let Some(msg) = msg else { return Ok(()) };

            self.log_and_record(
                None,
                RecordPayload::BrtDeq {
                    file_num: self.file_num,
                    offset: parent_offset.0,
                    child_index: child_idx as u32,
                    message: crate::serializer::encode_message(&msg)?,
                },
            )?;

            let child_offset = {
                let handle = self.pin_node(parent_offset)?;
                let off = handle
                    .borrow()
                    .0
                    .as_internal()
                    .expect("drain_child_fully called on an internal offset")
                    .children[child_idx];
                self.unpin_node(parent_offset, false)?;
                off
            };

            let msg_txn = owning_txn(msg.txn_id);
            if let Some(split) = self.put_cmd(child_offset, msg, msg_txn)? {
                self.handle_split_of_child(parent_offset, child_idx, split)?;
                return Ok(());
            }
            self.refresh_subtree_fingerprint(parent_offset, child_idx)?;
        }
    }

    /// Recompute `subtree_fingerprints[child_idx]` in `parent_offset` from
    /// the child's current local fingerprint (and subtree sum, if the
    /// child is itself internal), and log the change (spec §3
    /// "Fingerprints"; structural, so untied to any transaction).
    pub(super) fn refresh_subtree_fingerprint(&mut self, parent_offset: NodeOffset, child_idx: usize) -> Result<()> {
        let child_offset = {
            let handle = self.pin_node(parent_offset)?;
            let off = handle
                .borrow()
                .0
                .as_internal()
                .expect("refresh_subtree_fingerprint called on an internal offset")
                .children[child_idx];
            self.unpin_node(parent_offset, false)?;
            off
        };

        let (child_local, child_subtree_sum) = {
            let handle = self.pin_node(child_offset)?;
            let item = handle.borrow();
            let local = item.0.local_fingerprint();
            let subtree_sum = item.0.as_internal().map(|n| n.subtree_fingerprint_sum()).unwrap_or(0);
            drop(item);
            (local, subtree_sum)
        };
        self.unpin_node(child_offset, false)?;

        let (old_fp, new_fp) = {
            let handle = self.pin_node(parent_offset)?;
            let (old, new) = {
                let mut item = handle.borrow_mut();
                let node = item
                    .0
                    .as_internal_mut()
                    .expect("refresh_subtree_fingerprint called on an internal offset");
                let old = node.subtree_fingerprints[child_idx];
                node.set_subtree_fingerprint(child_idx, child_local, child_subtree_sum);
                (old, node.subtree_fingerprints[child_idx])
            };
            (old, new)
        };
        self.unpin_node(parent_offset, true)?;

        self.log_and_record(
            None,
            RecordPayload::ChangeChildFingerprint {
                file_num: self.file_num,
                offset: parent_offset.0,
                child_index: child_idx as u32,
                old_fingerprint: old_fp,
                new_fingerprint: new_fp,
            },
        )
    }
}
