//! Salt-multiplied CRC sums used as a structural-accounting integrity check
//! (spec §3 "Fingerprints (integrity)").
//!
//! A node's `local_fingerprint` is `salt * sum(CRC32(content))` over
//! whatever it directly stores (buffered messages for an internal node,
//! key/value pairs for a leaf). An internal node additionally keeps, per
//! child, a `subtree_fingerprint` equal to the child's own local
//! fingerprint plus the sum of *its* children's subtree fingerprints. This
//! is not a cryptographic hash: its only job is to catch bookkeeping bugs,
//! so all arithmetic is wrapping.

/// A 32-bit structural fingerprint.
pub type Fingerprint = u32;

/// CRC32 of an arbitrary byte string, used as the per-item contribution to
/// a fingerprint sum.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// CRC32 of a key/value pair, as stored by a leaf.
pub fn crc32_pair(key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Combine a node's random salt with the sum of its item CRCs.
///
/// Multiplication (rather than XOR) is deliberate: it is what the original
/// TokuDB `newbrt` sources use, and it makes the fingerprint sensitive to
/// the *count* of accumulated items, not only their bitwise union.
pub fn fold(salt: u32, crc_sum: std::num::Wrapping<u32>) -> Fingerprint {
    (std::num::Wrapping(salt) * crc_sum).0
}

/// Running accumulator for a node's `local_fingerprint`: tracks the sum of
/// item CRCs so items can be added and removed incrementally without
/// rescanning the whole node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerprintAccumulator {
    crc_sum: std::num::Wrapping<u32>,
}

impl FingerprintAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item_crc: u32) {
        self.crc_sum += std::num::Wrapping(item_crc);
    }

    pub fn remove(&mut self, item_crc: u32) {
        self.crc_sum -= std::num::Wrapping(item_crc);
    }

    pub fn fingerprint(&self, salt: u32) -> Fingerprint {
        fold(salt, self.crc_sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_is_identity() {
        let mut acc = FingerprintAccumulator::new();
        let a = crc32_pair(b"k1", b"v1");
        let b = crc32_pair(b"k2", b"v2");
        acc.add(a);
        acc.add(b);
        acc.remove(a);
        let mut only_b = FingerprintAccumulator::new();
        only_b.add(b);
        assert_eq!(acc.fingerprint(7), only_b.fingerprint(7));
    }

    #[test]
    fn fold_is_deterministic() {
        let sum = std::num::Wrapping(12345u32);
        assert_eq!(fold(99, sum), fold(99, sum));
    }
}
