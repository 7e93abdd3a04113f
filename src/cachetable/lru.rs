//! Intrusive-style LRU ordering over cache keys, adapted from
//! `replication/lru.rs`'s head/tail touch-cut-stitch list idiom: that list
//! links pinned memory slots by raw pointer, this one links `HashMap`
//! entries by key since there is no fixed PMEM arena to index into here.

use std::collections::HashMap;
use std::hash::Hash;

struct Links<K> {
    prev: Option<K>,
    next: Option<K>,
}

/// A doubly linked list of cache keys ordered from least- to
/// most-recently-used, supporting O(1) touch/insert/remove.
pub(crate) struct LruList<K: Eq + Hash + Clone> {
    links: HashMap<K, Links<K>>,
    head: Option<K>, // most recently used
    tail: Option<K>, // least recently used
}

impl<K: Eq + Hash + Clone> LruList<K> {
    pub fn new() -> Self {
        LruList {
            links: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    /// Insert `key` as most-recently-used. `key` must not already be present.
    pub fn insert_mru(&mut self, key: K) {
        debug_assert!(!self.links.contains_key(&key));
        let old_head = self.head.take();
        self.links.insert(
            key.clone(),
            Links {
                prev: None,
                next: old_head.clone(),
            },
        );
        if let Some(old_head) = &old_head {
            if let Some(links) = self.links.get_mut(old_head) {
                links.prev = Some(key.clone());
            }
        }
        self.head = Some(key.clone());
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    /// Move an already-present key to the most-recently-used end.
    pub fn touch(&mut self, key: &K) {
        if self.head.as_ref() == Some(key) {
            return;
        }
        self.unlink(key);
        self.insert_mru(key.clone());
    }

    /// Remove `key` from the list entirely. No-op if absent.
    pub fn remove(&mut self, key: &K) {
        self.unlink(key);
    }

    fn unlink(&mut self, key: &K) {
        let Some(Links { prev, next }) = self.links.remove(key) else {
            return;
        };
        match &prev {
            Some(p) => self.links.get_mut(p).unwrap().next = next.clone(),
            None => self.head = next.clone(),
        }
        match &next {
            Some(n) => self.links.get_mut(n).unwrap().prev = prev.clone(),
            None => self.tail = prev.clone(),
        }
    }

    pub fn least_recently_used(&self) -> Option<&K> {
        self.tail.as_ref()
    }

    /// Iterate from least- to most-recently-used, the order eviction walks.
    pub fn iter_lru_to_mru(&self) -> impl Iterator<Item = &K> {
        let mut cur = self.tail.clone();
        std::iter::from_fn(move || {
            let key = cur.take()?;
            cur = self.links.get(&key).and_then(|l| l.prev.clone());
            // SAFETY-free indirection: look the owned key back up in the map
            // to hand back a borrowed reference with the iterator's lifetime.
            self.links.get_key_value(&key).map(|(k, _)| k)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_moves_to_front_eviction_picks_oldest() {
        let mut lru: LruList<u32> = LruList::new();
        lru.insert_mru(1);
        lru.insert_mru(2);
        lru.insert_mru(3);
        assert_eq!(lru.least_recently_used(), Some(&1));
        lru.touch(&1);
        assert_eq!(lru.least_recently_used(), Some(&2));
        let order: Vec<u32> = lru.iter_lru_to_mru().copied().collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn remove_stitches_neighbors() {
        let mut lru: LruList<u32> = LruList::new();
        for k in [1, 2, 3, 4] {
            lru.insert_mru(k);
        }
        lru.remove(&2);
        let order: Vec<u32> = lru.iter_lru_to_mru().copied().collect();
        assert_eq!(order, vec![1, 3, 4]);
        lru.remove(&1);
        let order: Vec<u32> = lru.iter_lru_to_mru().copied().collect();
        assert_eq!(order, vec![3, 4]);
    }
}
