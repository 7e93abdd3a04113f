//! Node splitting: dividing an over-budget leaf or internal node into two,
//! and folding the result back into its parent (spec §4.2 "Leaf split",
//! "Internal split", "Handle split of a child", "New root").
//!
//! Grounded on `original_source/newbrt/brt.c`'s `brtleaf_split`,
//! `brt_nonleaf_split` and `handle_split_of_child`: a leaf split keeps the
//! old offset for the left half and allocates one fresh offset for the
//! right half; an internal split allocates two fresh offsets for both
//! halves and abandons the old one outright, matching §4.2's "the old
//! internal node is removed from cache; its offset is not immediately
//! reused".

use std::cmp::Ordering;

use crate::cachetable::CacheKey;
use crate::error::Result;
use crate::leaf_store::LeafStore;
use crate::logger::record::RecordPayload;
use crate::message::{DupMode, Message, MessageType};
use crate::node::{compare_keys, InternalNode, LeafNode, Node, NodeOffset};

use super::{Brt, SplitResult};

impl Brt {
    /// Split a leaf that has grown past its node-size budget. The left
    /// half keeps `offset`; the right half is written to a freshly
    /// allocated offset (spec §4.2 "Leaf split").
    pub(super) fn split_leaf(&mut self, offset: NodeOffset) -> Result<SplitResult> {
        let right_offset = self.allocate_node_offset()?;
        let right_salt = self.new_salt();

        let (split_key, right_leaf) = {
            let handle = self.pin_node(offset)?;
            let mut item = handle.borrow_mut();
            let leaf = item.0.as_leaf_mut().expect("split_leaf called on a leaf offset");
            let mut right_store = LeafStore::new(leaf.store.dup_mode(), right_salt);
            let split_key = leaf.store.split_to(&mut right_store);
            let mut right_leaf = LeafNode::new(leaf.store.dup_mode(), right_salt);
            right_leaf.store = right_store;
            item.0.mark_dirty();
            (split_key, right_leaf)
        };
        self.unpin_node(offset, true)?;

        self.log_and_record(None, RecordPayload::NewBrtNode {
            file_num: self.file_num,
            offset: right_offset.0,
            height: 0,
            node_size: self.node_size,
            dup_flags: right_leaf.store.dup_mode().to_flags(),
            salt: right_salt,
        })?;
        self.put_new_node(right_offset, Node::Leaf(right_leaf))?;
        self.unpin_node(right_offset, true)?;

        self.cursor_hook_leaf_split(offset, right_offset, &split_key)?;
        Ok(SplitResult { left: offset, right: right_offset, split_key })
    }

    /// Split an internal node that has grown past its fanout bound (spec
    /// §4.2 "Internal split"). Per-child FIFOs, pivots and subtree
    /// fingerprints are moved, not copied, to the right half; the pivot at
    /// the split boundary is promoted to the parent rather than kept by
    /// either half.
    pub(super) fn split_internal(&mut self, offset: NodeOffset) -> Result<SplitResult> {
        let left_offset = self.allocate_node_offset()?;
        let right_offset = self.allocate_node_offset()?;
        let left_salt = self.new_salt();
        let right_salt = self.new_salt();

        let (left_node, right_node, split_key) = {
            let handle = self.pin_node(offset)?;
            let mut item = handle.borrow_mut();
            let node = item.0.as_internal_mut().expect("split_internal called on an internal offset");
            let n = node.child_count();
            let mid = n / 2;
            let split_key = node.pivots[mid - 1].clone();

            let right_children = node.children.split_off(mid);
            let right_pivots = node.pivots.split_off(mid);
            let right_fifos = node.child_fifos.split_off(mid);
            let right_fps = node.subtree_fingerprints.split_off(mid);
            node.pivots.pop(); // drop the promoted pivot from the left half
            let height = node.height;

            let left_node = InternalNode::new_from_parts(
                height,
                std::mem::take(&mut node.children),
                std::mem::take(&mut node.pivots),
                std::mem::take(&mut node.child_fifos),
                std::mem::take(&mut node.subtree_fingerprints),
                left_salt,
            );
            let right_node =
                InternalNode::new_from_parts(height, right_children, right_pivots, right_fifos, right_fps, right_salt);
            debug_assert!(left_node.pivots_strictly_increasing());
            debug_assert!(right_node.pivots_strictly_increasing());
            (left_node, right_node, split_key)
        };
        self.unpin_node(offset, false)?;
        self.cache.remove(CacheKey::new(self.file_id, offset), false)?;

        let height = left_node.height;
        self.log_and_record(None, RecordPayload::NewBrtNode {
            file_num: self.file_num,
            offset: left_offset.0,
            height,
            node_size: self.node_size,
            dup_flags: 0,
            salt: left_salt,
        })?;
        self.log_and_record(None, RecordPayload::NewBrtNode {
            file_num: self.file_num,
            offset: right_offset.0,
            height,
            node_size: self.node_size,
            dup_flags: 0,
            salt: right_salt,
        })?;
        self.put_new_node(left_offset, Node::Internal(left_node))?;
        self.unpin_node(left_offset, true)?;
        self.put_new_node(right_offset, Node::Internal(right_node))?;
        self.unpin_node(right_offset, true)?;

        self.cursor_hook_nonleaf_split(offset, left_offset, right_offset)?;
        Ok(SplitResult { left: left_offset, right: right_offset, split_key })
    }

    /// Fold a child's split result into its parent (spec §4.2 "Handle
    /// split of a child"): insert the new right-half offset and promoted
    /// pivot, redistribute any messages still buffered for the old child
    /// slot across both halves by pivot comparison, and recompute both
    /// halves' subtree fingerprints.
    ///
    /// The parent's own oversize/fanout state is re-checked by the caller
    /// (`flush::maybe_flush_oversized`'s loop), not here: a child split
    /// does not by itself decide whether the parent must also split.
    pub(super) fn handle_split_of_child(
        &mut self,
        parent_offset: NodeOffset,
        child_idx: usize,
        split: SplitResult,
    ) -> Result<()> {
        let handle = self.pin_node(parent_offset)?;
        {
            let mut item = handle.borrow_mut();
            let node = item.0.as_internal_mut().expect("handle_split_of_child on an internal offset");
            debug_assert_eq!(node.children[child_idx], split.left);

            // Any messages still queued for the old child slot must be
            // redistributed across both new halves by pivot comparison
            // (spec §4.2). `MessageFifo::drain` only resets the fifo's own
            // byte/fingerprint accounting, not the node-level accumulator
            // those messages were added to via `enqueue`, so the
            // accumulator is rebuilt from scratch once the old fifo is
            // emptied and before the redistributed messages are
            // re-enqueued through the normal incremental path.
            let leftover: Vec<Message> = node.child_fifos[child_idx].drain().collect();
            node.reset_fingerprint_accumulator();

            node.insert_child_after_split(child_idx, split.split_key.clone(), split.right);

            for msg in leftover {
                // Strict-less routing, matching `InternalNode::child_for_key`:
                // a key equal to the split key lives in the *right* half
                // (the right half's first key, by construction of
                // `LeafStore::split_to`), not the left.
                let strictly_left = compare_keys(&msg.key, &split.split_key) == Ordering::Less;
                if strictly_left {
                    node.enqueue(child_idx, msg);
                    continue;
                }
                // Under duplicate-sort mode pivots may tie with keys in
                // both adjacent children (spec §3: "ties allowed under
                // duplicate mode"), so a DELETE_POINT landing exactly on
                // the split key must also reach the left half in case
                // matching entries are still there (spec §4.2 "Handle
                // split of a child": "messages destined for both halves,
                // under duplicate-sort DELETE_POINT, are sent to both").
                if self.dup_mode == DupMode::DuplicateSorted
                    && msg.kind == MessageType::DeletePoint
                    && msg.key.as_slice() == split.split_key.as_slice()
                {
                    node.enqueue(child_idx, msg.clone());
                }
                node.enqueue(child_idx + 1, msg);
            }
        }
        self.unpin_node(parent_offset, true)?;

        self.refresh_subtree_fingerprint(parent_offset, child_idx)?;
        self.refresh_subtree_fingerprint(parent_offset, child_idx + 1)?;

        self.log_and_record(None, RecordPayload::AddChild {
            file_num: self.file_num,
            offset: parent_offset.0,
            child_index: (child_idx + 1) as u32,
            child: split.right.0,
        })?;
        self.log_and_record(None, RecordPayload::SetPivot {
            file_num: self.file_num,
            offset: parent_offset.0,
            pivot_index: child_idx as u32,
            old_pivot: Vec::new(),
            new_pivot: split.split_key.as_slice().to_vec(),
        })?;

        self.cursor_hook_nonleaf_expand(parent_offset, child_idx)?;
        Ok(())
    }

    /// Allocate a new root over `split`'s two halves and install it in the
    /// header (spec §4.2 "New root"). Never logged under a transaction: a
    /// root change is purely structural and is a no-op on abort (spec §9).
    pub(super) fn new_root(&mut self, split: SplitResult) -> Result<()> {
        let new_offset = self.allocate_node_offset()?;
        let old_root = self.root_offset();
        let height = {
            let handle = self.pin_node(split.left)?;
            let h = handle.borrow().0.height();
            self.unpin_node(split.left, false)?;
            h
        };
        let salt = self.new_salt();
        let root_node = InternalNode::new_root(split.left, split.right, split.split_key.clone(), height + 1, salt);

        self.log_and_record(None, RecordPayload::NewBrtNode {
            file_num: self.file_num,
            offset: new_offset.0,
            height: height + 1,
            node_size: self.node_size,
            dup_flags: 0,
            salt,
        })?;
        self.put_new_node(new_offset, Node::Internal(root_node))?;
        self.unpin_node(new_offset, true)?;

        self.header.root_directory.set_unnamed_root(new_offset);
        self.header.dirty = true;
        self.log_and_record(None, RecordPayload::ChangeUnnamedRoot {
            file_num: self.file_num,
            old_root: old_root.0,
            new_root: new_offset.0,
        })?;

        self.cursor_hook_new_root(old_root, new_offset)?;
        Ok(())
    }
}
