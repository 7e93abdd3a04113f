//! The cachetable's own chained hash table, sized to a prime from a fixed
//! table and resized by doubling/halving (spec §4.4 "Hash table").
//!
//! A plain `std::collections::HashMap` would do the job just as well, but
//! the spec calls out this exact resizing policy as part of the
//! cachetable's documented behavior, so it is implemented explicitly
//! rather than delegated to the standard map.

use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// A fixed ladder of bucket-count primes to step through as the table
/// grows or shrinks (spec §4.4: "sized to a prime from a fixed table of
/// primes").
const PRIMES: &[usize] = &[
    17, 37, 79, 163, 331, 673, 1361, 2729, 5471, 10949, 21911, 43853, 87719, 175447, 350899,
    701819, 1403641, 2807303, 5614657, 11229331, 22458671, 44917381, 89834777, 179669557,
];

fn next_prime_at_least(n: usize) -> usize {
    PRIMES
        .iter()
        .copied()
        .find(|&p| p >= n)
        .unwrap_or(*PRIMES.last().unwrap())
}

fn prev_prime_at_most(n: usize) -> usize {
    PRIMES
        .iter()
        .rev()
        .copied()
        .find(|&p| p <= n)
        .unwrap_or(PRIMES[0])
}

fn bucket_hash<K: Hash>(key: &K, n_buckets: usize) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    (hasher.finish() % n_buckets as u64) as usize
}

/// A simple separate-chaining hash table with prime bucket counts that
/// doubles when `len > buckets.len()` and halves when `4 * len <
/// buckets.len()` (spec §4.4).
pub(crate) struct ChainedHashTable<K, V> {
    buckets: Vec<Vec<(K, V)>>,
    len: usize,
}

impl<K: Hash + Eq + Clone, V> ChainedHashTable<K, V> {
    pub fn new(size_hint: usize) -> Self {
        let n = next_prime_at_least(size_hint.max(1));
        ChainedHashTable {
            buckets: (0..n).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let idx = bucket_hash(key, self.buckets.len());
        self.buckets[idx].iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = bucket_hash(key, self.buckets.len());
        self.buckets[idx]
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let idx = bucket_hash(&key, self.buckets.len());
        if let Some(slot) = self.buckets[idx].iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.buckets[idx].push((key, value));
        self.len += 1;
        self.maybe_grow();
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = bucket_hash(key, self.buckets.len());
        let bucket = &mut self.buckets[idx];
        let pos = bucket.iter().position(|(k, _)| k == key)?;
        let (_, v) = bucket.remove(pos);
        self.len -= 1;
        self.maybe_shrink();
        Some(v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets.iter().flat_map(|b| b.iter().map(|(k, v)| (k, v)))
    }

    fn maybe_grow(&mut self) {
        if self.len > self.buckets.len() {
            self.resize(next_prime_at_least(self.buckets.len() * 2 + 1));
        }
    }

    fn maybe_shrink(&mut self) {
        if 4 * self.len < self.buckets.len() && self.buckets.len() > PRIMES[0] {
            self.resize(prev_prime_at_most((self.buckets.len() / 2).max(PRIMES[0])));
        }
    }

    fn resize(&mut self, new_bucket_count: usize) {
        let old = std::mem::replace(&mut self.buckets, (0..new_bucket_count).map(|_| Vec::new()).collect());
        for (k, v) in old.into_iter().flatten() {
            let idx = bucket_hash(&k, self.buckets.len());
            self.buckets[idx].push((k, v));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_shrinks() {
        let mut t: ChainedHashTable<u64, u64> = ChainedHashTable::new(1);
        let initial_buckets = t.bucket_count();
        for i in 0..200u64 {
            t.insert(i, i * 2);
        }
        assert!(t.bucket_count() > initial_buckets);
        for i in 0..200u64 {
            assert_eq!(t.get(&i), Some(&(i * 2)));
        }
        for i in 0..190u64 {
            t.remove(&i);
        }
        assert!(t.bucket_count() < PRIMES[PRIMES.len() - 1]);
        for i in 190..200u64 {
            assert_eq!(t.get(&i), Some(&(i * 2)));
        }
    }

    #[test]
    fn insert_replace_returns_old() {
        let mut t: ChainedHashTable<&str, i32> = ChainedHashTable::new(4);
        assert_eq!(t.insert("a", 1), None);
        assert_eq!(t.insert("a", 2), Some(1));
        assert_eq!(t.get(&"a"), Some(&2));
    }
}
