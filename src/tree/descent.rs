//! Descent and message application (spec §4.2 "Descent and message
//! application", "Push vs enqueue"): walking a message from the root
//! toward the leaf it targets, either pushing it straight through an
//! uncontended child or buffering it for later flushing.
//!
//! Grounded on `original_source/newbrt/brt.c`'s `brtnode_put_cmd` /
//! `brt_nonleaf_put_cmd_child` / `brt_leaf_put_cmd`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cachetable::CacheKey;
use crate::error::Result;
use crate::leaf_store::DeleteOutcome;
use crate::logger::record::RecordPayload;
use crate::message::{DupMode, Message, MessageType, TxnId};
use crate::node::{ChildIndex, NodeOffset};

use super::cursor::PathEntry;
use super::{Brt, CachedItem, SplitResult};

impl Brt {
    /// Apply `msg` starting at `offset`, recursing toward the leaf it
    /// targets. Returns the split that resulted from this application, if
    /// any; the caller folds it into its own parent (or, if `offset` was
    /// the root, installs a new root).
    pub(super) fn put_cmd(
        &mut self,
        offset: NodeOffset,
        msg: Message,
        txn: Option<TxnId>,
    ) -> Result<Option<SplitResult>> {
        let handle = self.pin_node(offset)?;
        let is_leaf = handle.borrow().0.is_leaf();
        if is_leaf {
            self.put_cmd_leaf(offset, handle, msg, txn)
        } else {
            self.put_cmd_internal(offset, handle, msg, txn)
        }
    }

    fn put_cmd_leaf(
        &mut self,
        offset: NodeOffset,
        handle: Rc<RefCell<CachedItem>>,
        msg: Message,
        txn: Option<TxnId>,
    ) -> Result<Option<SplitResult>> {
        let mut log_payloads: Vec<RecordPayload> = Vec::new();
        {
            let mut item = handle.borrow_mut();
            let leaf = item.0.as_leaf_mut().expect("put_cmd_leaf called on a leaf offset");
            match msg.kind {
                MessageType::Insert => {
                    let value = msg.value.clone().expect("INSERT message always carries a value");
                    // A replace under Unique mode discards the old pair;
                    // log it as a delete-then-insert so an abort can
                    // restore the old value (spec §4.6 "Rollback Log").
                    if leaf.store.dup_mode() == DupMode::Unique {
                        if let Some(old_value) = leaf.store.lookup(&msg.key) {
                            log_payloads.push(RecordPayload::DeleteInLeaf {
                                file_num: self.file_num,
                                offset: offset.0,
                                position: 0,
                                key: msg.key.as_slice().to_vec(),
                                value: old_value.as_slice().to_vec(),
                                txn: txn.unwrap_or(0),
                            });
                        }
                    }
                    leaf.store.insert_or_replace(msg.key.clone(), value.clone());
                    log_payloads.push(RecordPayload::InsertInLeaf {
                        file_num: self.file_num,
                        offset: offset.0,
                        position: 0,
                        key: msg.key.as_slice().to_vec(),
                        value: value.as_slice().to_vec(),
                        txn: txn.unwrap_or(0),
                    });
                }
                MessageType::DeletePoint => {
                    for (k, v) in leaf.store.delete_collect(&msg.key) {
                        log_payloads.push(RecordPayload::DeleteInLeaf {
                            file_num: self.file_num,
                            offset: offset.0,
                            position: 0,
                            key: k.as_slice().to_vec(),
                            value: v.as_slice().to_vec(),
                            txn: txn.unwrap_or(0),
                        });
                    }
                }
                MessageType::DeleteBoth => {
                    let value = msg.value.clone().expect("DELETE_BOTH message always carries a value");
                    if let DeleteOutcome::Removed(_) = leaf.store.delete_both(&msg.key, &value) {
                        log_payloads.push(RecordPayload::DeleteInLeaf {
                            file_num: self.file_num,
                            offset: offset.0,
                            position: 0,
                            key: msg.key.as_slice().to_vec(),
                            value: value.as_slice().to_vec(),
                            txn: txn.unwrap_or(0),
                        });
                    }
                }
            }
            item.0.mark_dirty();
        }
        for payload in log_payloads {
            self.log_and_record(txn, payload)?;
        }

        let oversized = handle.borrow().0.approx_serialized_size() > self.node_size as usize;
        self.unpin_node(offset, true)?;
        if oversized {
            Ok(Some(self.split_leaf(offset)?))
        } else {
            Ok(None)
        }
    }

    fn put_cmd_internal(
        &mut self,
        offset: NodeOffset,
        handle: Rc<RefCell<CachedItem>>,
        msg: Message,
        txn: Option<TxnId>,
    ) -> Result<Option<SplitResult>> {
        let targets: Vec<ChildIndex> = {
            let item = handle.borrow();
            let node = item
                .0
                .as_internal()
                .expect("put_cmd_internal called on an internal offset");
            match msg.kind {
                MessageType::DeletePoint => node.children_for_point_delete(&msg.key),
                MessageType::Insert | MessageType::DeleteBoth => vec![node.child_for_key(&msg.key)],
            }
        };

        for child_idx in targets {
            self.route_message_to_child(offset, &handle, child_idx, msg.clone(), txn)?;
        }
        self.unpin_node(offset, true)?;

        self.maybe_flush_oversized(offset)
    }

    /// Decide whether to push `msg` straight through to the child (when
    /// its buffer is empty and nothing else holds it pinned, approximating
    /// "no open cursor is currently in this child") or enqueue it for
    /// later flushing (spec §4.2 "Push vs enqueue").
    fn route_message_to_child(
        &mut self,
        parent_offset: NodeOffset,
        parent_handle: &Rc<RefCell<CachedItem>>,
        child_idx: ChildIndex,
        msg: Message,
        txn: Option<TxnId>,
    ) -> Result<()> {
        let (child_offset, buffer_empty) = {
            let item = parent_handle.borrow();
            let node = item
                .0
                .as_internal()
                .expect("route_message_to_child called on an internal offset");
            (node.children[child_idx], node.child_fifos[child_idx].is_empty())
        };
        let can_push = buffer_empty && self.cache.pin_count(CacheKey::new(self.file_id, child_offset)) == 0;

        if can_push {
            if let Some(split) = self.put_cmd(child_offset, msg, txn)? {
                self.handle_split_of_child(parent_offset, child_idx, split)?;
            }
        } else {
            {
                let mut item = parent_handle.borrow_mut();
                let node = item.0.as_internal_mut().expect("route_message_to_child called on an internal offset");
                node.enqueue(child_idx, msg.clone());
            }
            self.log_and_record(
                None,
                RecordPayload::BrtEnq {
                    file_num: self.file_num,
                    offset: parent_offset.0,
                    child_index: child_idx as u32,
                    message: crate::serializer::encode_message(&msg)?,
                },
            )?;
        }
        Ok(())
    }

    /// Descend from the root to the leaf that should hold `key`, draining
    /// every ancestor's buffer for the chosen child along the way so the
    /// leaf reflects every previously buffered message for this key (spec
    /// §4.2 "Reads descend the tree; at each internal node any queued
    /// messages bound for the chosen child are first drained"). Returns
    /// the full descent path alongside the leaf, for cursor stepping.
    pub(super) fn descend_collecting_path(&mut self, key: &[u8]) -> Result<(Vec<PathEntry>, NodeOffset)> {
        let mut path = Vec::new();
        let mut offset = self.root_offset();
        loop {
            let handle = self.pin_node(offset)?;
            let is_leaf = handle.borrow().0.is_leaf();
            if is_leaf {
                self.unpin_node(offset, false)?;
                return Ok((path, offset));
            }
            let child_idx = handle
                .borrow()
                .0
                .as_internal()
                .expect("descend_collecting_path at an internal offset")
                .child_for_key(key);
            self.unpin_node(offset, false)?;

            self.drain_child_fully(offset, child_idx)?;

            let handle = self.pin_node(offset)?;
            let next = handle
                .borrow()
                .0
                .as_internal()
                .expect("descend_collecting_path at an internal offset")
                .children[child_idx];
            self.unpin_node(offset, false)?;

            path.push(PathEntry { offset, child_idx });
            offset = next;
        }
    }

    /// Same descent as [`descend_collecting_path`], discarding the path:
    /// used by `lookup`, which has no cursor to maintain.
    pub(super) fn descend_draining(&mut self, key: &[u8]) -> Result<NodeOffset> {
        let (_, leaf) = self.descend_collecting_path(key)?;
        Ok(leaf)
    }
}
