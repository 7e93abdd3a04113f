//! Internal (height > 0) node: fanout, pivots, per-child message buffers,
//! and subtree fingerprints (spec §3 "Internal node").

use itertools::Itertools;

use crate::fifo::MessageFifo;
use crate::fingerprint::{FingerprintAccumulator, Fingerprint};
use crate::message::Message;
use crate::node::{compare_keys, Lsn, NodeOffset, Pivot};

/// Fixed per-node overhead budgeted against `node_size`, independent of
/// child count: the 4-byte length prefix, type tag, layout version, height,
/// flags, N, salt, LSNs and the trailing CRC32 + length postfix (spec §4.1
/// "Serializer").
const INTERNAL_NODE_FIXED_OVERHEAD: usize = 64;
/// Approximate per-child overhead: one 8-byte offset, one subtree
/// fingerprint, and the per-child FIFO's own byte-count field.
const PER_CHILD_FIXED_OVERHEAD: usize = 8 + 4 + 4;

#[derive(Debug)]
pub struct InternalNode {
    pub height: u32,
    pub children: Vec<NodeOffset>,
    /// `pivots.len() == children.len() - 1`.
    pub pivots: Vec<Pivot>,
    pub child_fifos: Vec<MessageFifo>,
    pub subtree_fingerprints: Vec<Fingerprint>,
    pub salt: u32,
    pub(crate) local_fingerprint_acc: FingerprintAccumulator,
    pub dirty: bool,
    pub disk_lsn: Lsn,
    pub log_lsn: Lsn,
}

impl InternalNode {
    /// Rebuild an internal node from its decoded parts (used only by the
    /// serializer, which already validated the fingerprint against `acc`).
    pub(crate) fn from_decoded(
        height: u32,
        children: Vec<NodeOffset>,
        pivots: Vec<Pivot>,
        child_fifos: Vec<MessageFifo>,
        subtree_fingerprints: Vec<Fingerprint>,
        salt: u32,
        local_fingerprint_acc: FingerprintAccumulator,
        disk_lsn: Lsn,
        log_lsn: Lsn,
    ) -> Self {
        InternalNode {
            height,
            children,
            pivots,
            child_fifos,
            subtree_fingerprints,
            salt,
            local_fingerprint_acc,
            dirty: false,
            disk_lsn,
            log_lsn,
        }
    }

    /// A fresh internal node with exactly two children and one pivot
    /// (spec §4.2 "New root").
    pub fn new_root(left: NodeOffset, right: NodeOffset, pivot: Pivot, height: u32, salt: u32) -> Self {
        InternalNode {
            height,
            children: vec![left, right],
            pivots: vec![pivot],
            child_fifos: vec![MessageFifo::new(), MessageFifo::new()],
            subtree_fingerprints: vec![0, 0],
            salt,
            local_fingerprint_acc: FingerprintAccumulator::new(),
            dirty: true,
            disk_lsn: Lsn::ZERO,
            log_lsn: Lsn::ZERO,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// The local fingerprint covers only the messages currently buffered
    /// in this node's per-child FIFOs (spec §3 "Fingerprints"), not the
    /// children's own contents (those are covered by `subtree_fingerprints`).
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.local_fingerprint_acc.fingerprint(self.salt)
    }

    /// Recompute the local fingerprint from scratch by rescanning every
    /// buffered message. Used by decode validation and by tests asserting
    /// invariant §8 "For every node: local_fingerprint = salt * sum(...)".
    pub fn recompute_local_fingerprint(&self) -> Fingerprint {
        let mut acc = FingerprintAccumulator::new();
        for fifo in &self.child_fifos {
            for msg in fifo.iter() {
                acc.add(msg.crc());
            }
        }
        acc.fingerprint(self.salt)
    }

    /// Recompute `subtree_fingerprint[i]` for a child, given the child's
    /// own local fingerprint and (if internal) the sum of its subtree
    /// fingerprints (spec §3 "Fingerprints").
    pub fn set_subtree_fingerprint(&mut self, child_idx: usize, child_local: Fingerprint, child_subtree_sum: Fingerprint) {
        self.subtree_fingerprints[child_idx] = child_local.wrapping_add(child_subtree_sum);
    }

    /// Sum of this node's own subtree fingerprints, as contributed to a
    /// parent's `subtree_fingerprint` entry for this node.
    pub fn subtree_fingerprint_sum(&self) -> Fingerprint {
        self.subtree_fingerprints
            .iter()
            .fold(0u32, |acc, f| acc.wrapping_add(*f))
    }

    /// Index of the left-most child whose pivot is `> key`, with the last
    /// child as catch-all (spec §4.2: INSERT/DELETE_BOTH routing;
    /// "tie-breaker: equal keys go right"; §3 "child i's keys <= pivot[i]
    /// <= child i+1's keys"). A key equal to `pivot[i]` must route to
    /// child `i+1`: the leaf split promotes `split_key` as the smallest
    /// key of the *right* half (`leaf_store::split_to`) and that key lives
    /// in the right child, so routing on `key <= pivot[i]` would send an
    /// exact pivot match left, past where it actually lives.
    pub fn child_for_key(&self, key: &[u8]) -> usize {
        for (i, pivot) in self.pivots.iter().enumerate() {
            if compare_keys(key, pivot) == std::cmp::Ordering::Less {
                return i;
            }
        }
        self.pivots.len()
    }

    /// All children whose key range intersects `key` — for `DELETE_POINT`
    /// under duplicate-sort mode, this can be exactly one child because
    /// pivots are plain keys and every duplicate of `key` lives under the
    /// same pivot bucket; kept as a range for symmetry with the spec's
    /// wording (spec §4.2 "DELETE_POINT under duplicate-sort mode").
    pub fn children_for_point_delete(&self, key: &[u8]) -> Vec<usize> {
        vec![self.child_for_key(key)]
    }

    pub fn enqueue(&mut self, child_idx: usize, msg: Message) {
        self.local_fingerprint_acc.add(msg.crc());
        self.child_fifos[child_idx].enqueue(msg);
        self.dirty = true;
    }

    pub fn dequeue_front(&mut self, child_idx: usize) -> Option<Message> {
        let msg = self.child_fifos[child_idx].dequeue_front()?;
        self.local_fingerprint_acc.remove(msg.crc());
        self.dirty = true;
        Some(msg)
    }

    /// Index of the child with the most buffered bytes, ties broken by
    /// lowest child index (spec §9 open question, preserved exactly).
    pub fn heaviest_child(&self) -> Option<usize> {
        self.child_fifos
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_empty())
            .max_by_key(|(i, f)| (f.byte_count(), std::cmp::Reverse(*i)))
            .map(|(i, _)| i)
    }

    /// Insert a new child at `idx + 1`, sliding later children right, and
    /// insert `pivot` as the new pivot at `idx` (spec §4.2 "Handle split of
    /// a child"). The new slot gets an empty FIFO and zero subtree
    /// fingerprint; callers must redistribute queued messages and
    /// recompute both halves' subtree fingerprints afterward.
    pub fn insert_child_after_split(&mut self, idx: usize, pivot: Pivot, new_child: NodeOffset) {
        self.children.insert(idx + 1, new_child);
        self.pivots.insert(idx, pivot);
        self.child_fifos.insert(idx + 1, MessageFifo::new());
        self.subtree_fingerprints.insert(idx + 1, 0);
        self.dirty = true;
    }

    /// Approximate serialized size: fixed overhead + per-child overhead +
    /// pivot bytes + buffered message bytes (spec §4.1 "Serializer";
    /// used against the node-size budget).
    pub fn approx_serialized_size(&self) -> usize {
        let pivot_bytes: usize = self.pivots.iter().map(|p| 4 + p.len()).sum();
        let message_bytes: usize = self.child_fifos.iter().map(|f| f.byte_count()).sum();
        INTERNAL_NODE_FIXED_OVERHEAD
            + self.children.len() * PER_CHILD_FIXED_OVERHEAD
            + pivot_bytes
            + message_bytes
    }

    /// Total bytes buffered across all child FIFOs.
    pub fn total_buffered_bytes(&self) -> usize {
        self.child_fifos.iter().map(|f| f.byte_count()).sum()
    }

    /// Insert a new child at `idx`, with an empty FIFO and zero subtree
    /// fingerprint, shifting later children right. Used by recovery to
    /// replay an `AddChild` record against an already-existing parent; the
    /// split-creation path instead uses [`InternalNode::insert_child_after_split`],
    /// which also places the new pivot in the same call.
    pub fn insert_child(&mut self, idx: usize, child: NodeOffset) {
        self.children.insert(idx, child);
        self.child_fifos.insert(idx, MessageFifo::new());
        self.subtree_fingerprints.insert(idx, 0);
        self.dirty = true;
    }

    /// Remove the child at `idx` along with its FIFO and subtree
    /// fingerprint, and whichever adjoining pivot separated it from its
    /// neighbor. No forward code path removes a child; this exists so
    /// recovery can replay a `DelChild` record.
    pub fn remove_child(&mut self, idx: usize) {
        self.children.remove(idx);
        self.child_fifos.remove(idx);
        self.subtree_fingerprints.remove(idx);
        if idx < self.pivots.len() {
            self.pivots.remove(idx);
        } else if idx > 0 {
            self.pivots.remove(idx - 1);
        }
        self.dirty = true;
    }

    /// Overwrite the child offset at `idx` in place, leaving its pivot,
    /// FIFO and subtree fingerprint untouched. Replays a `SetChild` record.
    pub fn set_child(&mut self, idx: usize, child: NodeOffset) {
        self.children[idx] = child;
        self.dirty = true;
    }

    /// Replay a `SetPivot` record: an empty `old_pivot` is the sentinel the
    /// forward path logs for a split-introduced pivot (insert a new slot);
    /// anything else is a plain in-place replacement.
    pub fn replay_pivot(&mut self, idx: usize, old_pivot_was_insert: bool, pivot: Pivot) {
        if old_pivot_was_insert {
            self.pivots.insert(idx, pivot);
        } else {
            self.pivots[idx] = pivot;
        }
        self.dirty = true;
    }

    /// Overwrite `subtree_fingerprints[idx]` with an already-computed value
    /// read back from a `ChangeChildFingerprint` record, rather than
    /// recomputing it from a child's local fingerprint and subtree sum.
    pub fn set_subtree_fingerprint_raw(&mut self, idx: usize, value: Fingerprint) {
        self.subtree_fingerprints[idx] = value;
        self.dirty = true;
    }

    /// Build a fresh internal node out of already-partitioned parts (used
    /// by an internal split, spec §4.2 "Internal split": both halves are
    /// freshly constructed from moved, not copied, children/pivots/FIFOs).
    /// The fingerprint accumulator is rebuilt by rescanning the moved
    /// FIFOs rather than threaded through arithmetically, since a split is
    /// rare enough that the rescan cost does not matter.
    pub fn new_from_parts(
        height: u32,
        children: Vec<NodeOffset>,
        pivots: Vec<Pivot>,
        child_fifos: Vec<MessageFifo>,
        subtree_fingerprints: Vec<Fingerprint>,
        salt: u32,
    ) -> Self {
        let local_fingerprint_acc = scan_fifo_accumulator(&child_fifos);
        InternalNode {
            height,
            children,
            pivots,
            child_fifos,
            subtree_fingerprints,
            salt,
            local_fingerprint_acc,
            dirty: true,
            disk_lsn: Lsn::ZERO,
            log_lsn: Lsn::ZERO,
        }
    }

    /// Rebuild `local_fingerprint_acc` from scratch by rescanning every
    /// buffered message. Used after directly mutating `child_fifos`
    /// in place (e.g. moving a whole FIFO to a sibling during a split)
    /// where incremental `enqueue`/`dequeue_front` bookkeeping was
    /// bypassed.
    pub fn reset_fingerprint_accumulator(&mut self) {
        self.local_fingerprint_acc = scan_fifo_accumulator(&self.child_fifos);
    }

    /// Spec §8 invariant: adjacent pivots are strictly increasing (ties
    /// allowed under duplicate mode are between keys *within* a child, not
    /// between pivots themselves, so this check is mode-independent).
    /// Exposed for tests and for a caller that wants a cheap sanity check
    /// after a split or a recovery replay step.
    pub fn pivots_strictly_increasing(&self) -> bool {
        self.pivots
            .iter()
            .tuple_windows()
            .all(|(a, b)| compare_keys(a, b) == std::cmp::Ordering::Less)
    }
}

fn scan_fifo_accumulator(fifos: &[MessageFifo]) -> FingerprintAccumulator {
    let mut acc = FingerprintAccumulator::new();
    for fifo in fifos {
        for msg in fifo.iter() {
            acc.add(msg.crc());
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cow_bytes::CowBytes;

    fn node_with_pivots(pivots: &[&str]) -> InternalNode {
        let children: Vec<NodeOffset> = (0..=pivots.len() as u64).map(NodeOffset).collect();
        InternalNode {
            height: 1,
            pivots: pivots.iter().map(|p| CowBytes::from_slice(p.as_bytes())).collect(),
            child_fifos: children.iter().map(|_| MessageFifo::new()).collect(),
            subtree_fingerprints: vec![0; children.len()],
            children,
            salt: 1,
            local_fingerprint_acc: FingerprintAccumulator::new(),
            dirty: false,
            disk_lsn: Lsn::ZERO,
            log_lsn: Lsn::ZERO,
        }
    }

    #[test]
    fn child_for_key_routes_ties_right() {
        let node = node_with_pivots(&["m"]);
        assert_eq!(node.child_for_key(b"a"), 0);
        assert_eq!(node.child_for_key(b"m"), 1);
        assert_eq!(node.child_for_key(b"n"), 1);
        assert_eq!(node.child_for_key(b"z"), 1);
    }

    #[test]
    fn heaviest_child_ties_break_to_lowest_index() {
        let mut node = node_with_pivots(&["m", "z"]);
        let msg = |k: &str| Message::insert(CowBytes::from_slice(k.as_bytes()), (&b"v"[..]).into(), 1);
        node.enqueue(0, msg("a"));
        node.enqueue(2, msg("zz"));
        assert_eq!(node.heaviest_child(), Some(0));
    }

    #[test]
    fn pivots_strictly_increasing_detects_disorder() {
        assert!(node_with_pivots(&["b", "m", "z"]).pivots_strictly_increasing());
        assert!(node_with_pivots(&[]).pivots_strictly_increasing());
        let mut node = node_with_pivots(&["b", "m", "z"]);
        node.pivots.swap(0, 1);
        assert!(!node.pivots_strictly_increasing());
    }
}
