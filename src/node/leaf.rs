//! Leaf (height = 0) node: wraps the sorted [`LeafStore`] plus the LSN and
//! dirty bookkeeping every node carries (spec §3 "Leaf node").

use crate::leaf_store::LeafStore;
use crate::message::DupMode;
use crate::node::Lsn;

const LEAF_NODE_FIXED_OVERHEAD: usize = 48;

#[derive(Debug)]
pub struct LeafNode {
    pub store: LeafStore,
    pub dirty: bool,
    pub disk_lsn: Lsn,
    pub log_lsn: Lsn,
}

impl LeafNode {
    pub fn new(dup_mode: DupMode, salt: u32) -> Self {
        LeafNode {
            store: LeafStore::new(dup_mode, salt),
            dirty: true,
            disk_lsn: Lsn::ZERO,
            log_lsn: Lsn::ZERO,
        }
    }

    pub fn approx_serialized_size(&self) -> usize {
        LEAF_NODE_FIXED_OVERHEAD + self.store.byte_count()
    }
}
