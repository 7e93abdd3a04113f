//! The buffered repository tree itself (spec §4.2 "BRT Engine"): the
//! `Brt` type ties the node cache, the on-disk file, the header, the
//! logger, the rollback log and the transaction manager together behind
//! the public operations (spec §6).
//!
//! Grounded on `original_source/newbrt/brt.c`'s `brt_search`/`brt_insert`
//! pair and on the teacher's `tree/imp/mod.rs` for how a single owning
//! struct wires a node cache to a backing file. Node objects are held
//! behind `Rc<RefCell<CachedItem>>` handles from [`crate::cachetable`] so a
//! descent can hold a parent and child pinned at once without fighting one
//! `&mut Brt` borrow.

mod cursor;
mod descent;
mod flush;
mod recovery;
mod split;

use std::cell::RefCell;
use std::path::Path;
use std::rc::{Rc, Weak};

use log::trace;
use rand::random;

use crate::cachetable::{CacheFileId, CacheKey, CacheSize, Cachetable, FlushCallback};
use crate::config::EngineConfig;
use crate::cow_bytes::{CowBytes, SlicedCowBytes};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::logger::record::RecordPayload;
use crate::logger::Logger;
use crate::message::{DupMode, Message, TxnId};
use crate::node::{compare_keys, LeafNode, Node, NodeOffset};
use crate::rollback::{RollbackLog, UndoApplier};
use crate::serializer;
use crate::store::NodeFile;
use crate::txn::TxnManager;

pub use cursor::BrtCursor;
use cursor::CursorState;

/// The single kind of object the tree ever pins: a node. Kept as its own
/// type (rather than handing `Node` straight to the cache) so the cache
/// crate boundary doesn't need to know about node internals at all -
/// mirrors the teacher's thin per-kind cache wrapper types.
#[derive(Debug)]
pub(crate) struct CachedItem(pub Node);

impl CacheSize for CachedItem {
    fn cache_size(&self) -> usize {
        self.0.approx_serialized_size()
    }
}

/// The outcome of a node splitting: the caller (whichever level of descent
/// triggered the split) is responsible for either folding it into its own
/// parent via [`Brt::handle_split_of_child`] or, if the split node was the
/// root, creating a new root (spec §4.2 "New root"). There is no
/// back-pointer from a node to its parent - splits propagate purely
/// through return values.
pub(crate) struct SplitResult {
    pub left: NodeOffset,
    pub right: NodeOffset,
    pub split_key: CowBytes,
}

/// One open tree file: node cache, backing store, header, and the
/// transactional machinery that guards writes to it.
pub struct Brt {
    store: Rc<RefCell<NodeFile>>,
    cache: Cachetable<CachedItem>,
    file_id: CacheFileId,
    file_num: u32,
    node_size: u32,
    fanout: usize,
    dup_mode: DupMode,
    header: Header,
    logger: Logger,
    rollback: RollbackLog,
    txns: TxnManager,
    cursors: Vec<Weak<RefCell<CursorState>>>,
}

impl Brt {
    /// Open (creating if necessary) the tree file at `path`. If the file
    /// already exists, `dup_mode` must match the persisted header flags
    /// unless `load_flags` is set, in which case the header's own flags
    /// win (spec §6 "Opening with mismatched flags fails unless
    /// load_flags").
    pub fn open(path: impl AsRef<Path>, config: &EngineConfig, dup_mode: DupMode, load_flags: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut raw_store = NodeFile::open(path, config.node_size, true)?;
        let is_new = raw_store.is_empty()?;

        let (header, dup_mode) = if is_new {
            let root_offset = NodeOffset(u64::from(config.node_size) * 2);
            let header = Header::new_unnamed(config.node_size, dup_mode.to_flags(), root_offset);
            let salt: u32 = random();
            let root_leaf = Node::Leaf(LeafNode::new(dup_mode, salt));
            let image = serializer::encode_node(&root_leaf, config.node_size)?;
            raw_store.write_block(root_offset, &image)?;
            let header_image = serializer::encode_header(&header, config.node_size)?;
            raw_store.write_block(NodeOffset::HEADER, &header_image)?;
            raw_store.fsync()?;
            (header, dup_mode)
        } else {
            let image = raw_store.read_block(NodeOffset::HEADER)?;
            let header = serializer::decode_header(&image)?;
            let header_mode = DupMode::from_flags(header.flags);
            if !load_flags && header_mode != dup_mode {
                return Err(Error::FlagsMismatch { header: header_mode, requested: dup_mode });
            }
            (header, header_mode)
        };

        let store = Rc::new(RefCell::new(raw_store));
        let mut cache = Cachetable::new(config.cache_limit_bytes, config.cache_table_size_hint);
        let file_id = cache.open_file(path)?;
        let logger = Logger::open(config)?;

        Ok(Brt {
            store,
            cache,
            file_id,
            file_num: file_id.0,
            node_size: config.node_size,
            fanout: config.fanout,
            dup_mode,
            header,
            logger,
            rollback: RollbackLog::new(),
            txns: TxnManager::new(),
            cursors: Vec::new(),
        })
    }

    pub fn dup_mode(&self) -> DupMode {
        self.dup_mode
    }

    /// Snapshot the node cache's per-entry pin/dirty/size state (spec §4.4
    /// introspection): cheap, read-only, meant for tests and for an
    /// operator chasing a pin leak.
    pub fn cache_debug_state(&self) -> crate::cachetable::CachetableDebugState {
        self.cache.debug_state()
    }

    /// Flush every dirty node and the header, then close the logger and
    /// fsync the store (spec §5 "Close").
    pub fn close(mut self) -> Result<()> {
        self.checkpoint()?;
        self.cache.close_file(self.file_id)?;
        self.logger.close()?;
        self.store.borrow().fsync()?;
        Ok(())
    }

    /// Write back every dirty node and the header without closing
    /// anything (spec §5 "Shared resources": the BRT must fsync the log
    /// up to a node's `log_lsn` before that node's image becomes
    /// eligible for writeback - enforced inside each node's flush
    /// callback, see [`Brt::make_flush_cb`]).
    pub fn checkpoint(&mut self) -> Result<()> {
        trace!("checkpoint: enter");
        self.cache.flush_all(self.file_id)?;
        self.flush_header()?;
        self.logger.log(RecordPayload::Checkpoint)?;
        self.logger.fsync()?;
        trace!("checkpoint: done");
        Ok(())
    }

    fn flush_header(&mut self) -> Result<()> {
        if self.header.dirty {
            let image = serializer::encode_header(&self.header, self.node_size)?;
            self.store.borrow_mut().write_block(NodeOffset::HEADER, &image)?;
            self.header.dirty = false;
        }
        Ok(())
    }

    fn root_offset(&self) -> NodeOffset {
        self.header.root_directory.unnamed_root().expect("unnamed root")
    }

    fn new_salt(&self) -> u32 {
        random()
    }

    fn allocate_node_offset(&mut self) -> Result<NodeOffset> {
        let old = self.header.unused_memory;
        let offset = self.header.allocate(self.node_size);
        self.logger.log(RecordPayload::ChangeUnusedMemory {
            file_num: self.file_num,
            old: old.0,
            new: self.header.unused_memory.0,
        })?;
        Ok(offset)
    }

    fn make_flush_cb(&self) -> FlushCallback<CachedItem> {
        let store = self.store.clone();
        let node_size = self.node_size;
        Rc::new(move |key: CacheKey, item: &CachedItem| {
            let mut image = serializer::encode_node(&item.0, node_size)?;
            image.resize(node_size as usize, 0);
            store.borrow_mut().write_block(key.offset, &image)
        })
    }

    fn pin_node(&mut self, offset: NodeOffset) -> Result<Rc<RefCell<CachedItem>>> {
        let key = CacheKey::new(self.file_id, offset);
        let store = self.store.clone();
        let flush_cb = self.make_flush_cb();
        self.cache.get_and_pin(key, move || {
            let image = store.borrow_mut().read_block(offset)?;
            let node = serializer::decode_node(&image)?;
            Ok((CachedItem(node), flush_cb))
        })
    }

    fn unpin_node(&mut self, offset: NodeOffset, dirty: bool) -> Result<()> {
        self.cache.unpin(CacheKey::new(self.file_id, offset), dirty)
    }

    fn put_new_node(&mut self, offset: NodeOffset, node: Node) -> Result<Rc<RefCell<CachedItem>>> {
        let key = CacheKey::new(self.file_id, offset);
        let flush_cb = self.make_flush_cb();
        self.cache.put(key, CachedItem(node), flush_cb)
    }

    /// Log a record, and (if `txn` names a live transaction) record it in
    /// the rollback log too, so an abort can undo it (spec §4.6). Records
    /// are logged unconditionally: durability does not depend on whether
    /// the write happened under an explicit transaction.
    fn log_and_record(&mut self, txn: Option<TxnId>, payload: RecordPayload) -> Result<()> {
        self.logger.log(payload.clone())?;
        if let Some(txn) = txn {
            if self.txns.is_live(txn) {
                self.rollback.record(txn, payload)?;
            }
        }
        Ok(())
    }

    fn live_cursor_states(&self) -> Vec<Rc<RefCell<CursorState>>> {
        self.cursors.iter().filter_map(|w| w.upgrade()).collect()
    }

    /// Drop weak references whose cursor has already been dropped, so the
    /// registry doesn't grow without bound across a long-lived tree.
    fn prune_dead_cursors(&mut self) {
        self.cursors.retain(|w| w.strong_count() > 0);
    }

    // ---- transactions ----

    pub fn txn_begin(&mut self, parent: Option<TxnId>) -> Result<TxnId> {
        self.txns.begin(parent, &mut self.logger, &mut self.rollback)
    }

    pub fn txn_commit(&mut self, txn: TxnId, nosync: bool) -> Result<()> {
        self.txns.commit(txn, nosync, &mut self.logger, &mut self.rollback)
    }

    pub fn txn_abort(&mut self, txn: TxnId) -> Result<()> {
        let mut txns = std::mem::replace(&mut self.txns, TxnManager::new());
        let mut rollback = std::mem::replace(&mut self.rollback, RollbackLog::new());
        let result = txns.abort(txn, &mut rollback, self);
        self.txns = txns;
        self.rollback = rollback;
        result
    }

    // ---- public operations (spec §6) ----

    pub fn insert(&mut self, key: CowBytes, value: SlicedCowBytes, txn: Option<TxnId>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        let msg = Message::insert(key, value, txn.unwrap_or(0));
        self.apply_at_root(msg, txn)
    }

    pub fn delete_point(&mut self, key: CowBytes, txn: Option<TxnId>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        let msg = Message::delete_point(key, txn.unwrap_or(0));
        self.apply_at_root(msg, txn)
    }

    pub fn delete_both(&mut self, key: CowBytes, value: SlicedCowBytes, txn: Option<TxnId>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        let msg = Message::delete_both(key, value, txn.unwrap_or(0));
        self.apply_at_root(msg, txn)
    }

    fn apply_at_root(&mut self, msg: Message, txn: Option<TxnId>) -> Result<()> {
        let root = self.root_offset();
        if let Some(split) = self.put_cmd(root, msg, txn)? {
            self.new_root(split)?;
        }
        Ok(())
    }

    /// Point lookup (spec §4.2 "lookup"): descends to the leaf, draining
    /// every ancestor buffer it passes through so the leaf reflects every
    /// message enqueued for this key, then reads the leaf directly.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<SlicedCowBytes>> {
        let leaf = self.descend_draining(key)?;
        let handle = self.pin_node(leaf)?;
        let result = {
            let item = handle.borrow();
            item.0.as_leaf().expect("descend_draining returns a leaf").store.lookup(key)
        };
        self.unpin_node(leaf, false)?;
        Ok(result)
    }

    /// Row counts on either side of `key` as `(less, equal, greater)`
    /// (spec §6 "keyrange"; §8 scenario 1: `keyrange(key=512)` on 1024
    /// sequential keys returns `(less≈512, equal=1, greater≈511)`).
    /// Grounded on `original_source/newbrt/brt.h`'s
    /// `toku_brt_keyrange(brt, key, less, equal, greater)` signature; the
    /// body of the original was not part of the retrieved source, and
    /// this node model carries no per-subtree row-count estimate
    /// (TokuDB's nodes keep a `subtree_estimates` field alongside
    /// fingerprints; this crate's `InternalNode` does not), so rather
    /// than invent an estimator this walks every leaf and every buffered
    /// message under `key`'s root, producing an exact count. The
    /// "approximate" of the spec's wording still applies: a message still
    /// sitting in an ancestor's FIFO is counted on whichever side its key
    /// falls even if applying it would later overwrite or cancel an
    /// existing leaf entry, so the same logical row can be counted twice
    /// until its buffered message is flushed down to the leaf.
    pub fn keyrange(&mut self, key: &[u8]) -> Result<(u64, u64, u64)> {
        let root = self.root_offset();
        self.keyrange_at(root, key)
    }

    fn keyrange_at(&mut self, offset: NodeOffset, key: &[u8]) -> Result<(u64, u64, u64)> {
        enum Step {
            Leaf(u64, u64, u64),
            Internal { child_idx: usize, children: Vec<NodeOffset>, fifo_counts: Vec<(u64, u64, u64)> },
        }

        let handle = self.pin_node(offset)?;
        let step = {
            let item = handle.borrow();
            match &item.0 {
                Node::Leaf(leaf) => {
                    let (mut less, mut equal, mut greater) = (0u64, 0u64, 0u64);
                    for (k, _) in leaf.store.iter() {
                        match compare_keys(k.as_slice(), key) {
                            std::cmp::Ordering::Less => less += 1,
                            std::cmp::Ordering::Equal => equal += 1,
                            std::cmp::Ordering::Greater => greater += 1,
                        }
                    }
                    Step::Leaf(less, equal, greater)
                }
                Node::Internal(internal) => {
                    let child_idx = internal.child_for_key(key);
                    let fifo_counts = internal
                        .child_fifos
                        .iter()
                        .map(|fifo| {
                            let (mut less, mut equal, mut greater) = (0u64, 0u64, 0u64);
                            for msg in fifo.iter() {
                                match compare_keys(msg.key.as_slice(), key) {
                                    std::cmp::Ordering::Less => less += 1,
                                    std::cmp::Ordering::Equal => equal += 1,
                                    std::cmp::Ordering::Greater => greater += 1,
                                }
                            }
                            (less, equal, greater)
                        })
                        .collect();
                    Step::Internal { child_idx, children: internal.children.clone(), fifo_counts }
                }
            }
        };
        self.unpin_node(offset, false)?;

        match step {
            Step::Leaf(less, equal, greater) => Ok((less, equal, greater)),
            Step::Internal { child_idx, children, fifo_counts } => {
                let (mut less, mut equal, mut greater) = (0u64, 0u64, 0u64);
                for (i, &child) in children.iter().enumerate() {
                    let (child_less, child_equal, child_greater) = self.keyrange_at(child, key)?;
                    let (fifo_less, fifo_equal, fifo_greater) = fifo_counts[i];
                    match i.cmp(&child_idx) {
                        std::cmp::Ordering::Less => {
                            less += child_less + child_equal + child_greater + fifo_less + fifo_equal + fifo_greater;
                        }
                        std::cmp::Ordering::Equal => {
                            less += child_less + fifo_less;
                            equal += child_equal + fifo_equal;
                            greater += child_greater + fifo_greater;
                        }
                        std::cmp::Ordering::Greater => {
                            greater += child_less + child_equal + child_greater + fifo_less + fifo_equal + fifo_greater;
                        }
                    }
                }
                Ok((less, equal, greater))
            }
        }
    }

}

impl UndoApplier for Brt {
    /// Undo of an INSERT: the forward operation added `(key, value)` to
    /// the leaf at `offset`, so the inverse removes exactly that pair.
    /// `position` is recorded in the log for introspection but is not
    /// needed here since [`crate::leaf_store::LeafStore`] addresses
    /// entries by key/value rather than by raw slot.
    fn undo_insert_in_leaf(&mut self, _file_num: u32, offset: u64, _position: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let offset = NodeOffset(offset);
        let handle = self.pin_node(offset)?;
        {
            let mut item = handle.borrow_mut();
            let leaf = item.0.as_leaf_mut().ok_or_else(|| Error::FormatError("undo target is not a leaf".into()))?;
            leaf.store.delete_both(key, value);
            item.0.mark_dirty();
        }
        self.unpin_node(offset, true)
    }

    /// Undo of a DELETE: re-insert the pair the forward operation removed.
    fn undo_delete_in_leaf(&mut self, _file_num: u32, offset: u64, _position: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let offset = NodeOffset(offset);
        let handle = self.pin_node(offset)?;
        {
            let mut item = handle.borrow_mut();
            let leaf = item.0.as_leaf_mut().ok_or_else(|| Error::FormatError("undo target is not a leaf".into()))?;
            leaf.store.insert_or_replace(CowBytes::from_slice(key), CowBytes::from_slice(value).into_sliced());
            item.0.mark_dirty();
        }
        self.unpin_node(offset, true)
    }
}
