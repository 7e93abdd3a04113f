//! Cheaply-cloneable immutable byte buffers used for keys, values, and
//! message payloads throughout the tree.
//!
//! Mirrors the teacher's `cow_bytes::{CowBytes, SlicedCowBytes}` split: a
//! `CowBytes` owns a full buffer, a `SlicedCowBytes` is a clone-free view
//! into a range of one. Both are `Arc`-backed so splitting a leaf or
//! re-enqueuing a message into a child FIFO never copies key/value bytes.

use std::{cmp::Ordering, fmt, ops::Deref, sync::Arc};

/// An owned, reference-counted, immutable byte buffer.
#[derive(Clone, Eq)]
pub struct CowBytes(Arc<[u8]>);

impl CowBytes {
    pub fn from_slice(data: &[u8]) -> Self {
        CowBytes(Arc::from(data))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// View the whole buffer as a [`SlicedCowBytes`] without copying.
    pub fn into_sliced(self) -> SlicedCowBytes {
        let len = self.0.len();
        SlicedCowBytes {
            data: self.0,
            start: 0,
            end: len,
        }
    }

    /// View a sub-range of the buffer as a [`SlicedCowBytes`] without
    /// copying.
    pub fn slice(&self, start: usize, end: usize) -> SlicedCowBytes {
        assert!(start <= end && end <= self.0.len());
        SlicedCowBytes {
            data: self.0.clone(),
            start,
            end,
        }
    }
}

impl Deref for CowBytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for CowBytes {
    fn from(data: &[u8]) -> Self {
        CowBytes::from_slice(data)
    }
}

impl From<Vec<u8>> for CowBytes {
    fn from(data: Vec<u8>) -> Self {
        CowBytes(Arc::from(data.into_boxed_slice()))
    }
}

impl PartialEq for CowBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl PartialOrd for CowBytes {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CowBytes {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl fmt::Debug for CowBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CowBytes({} bytes)", self.0.len())
    }
}

/// A clone-free view into a [`CowBytes`] buffer, as produced by a leaf
/// store range read or a message FIFO dequeue.
#[derive(Clone, Eq)]
pub struct SlicedCowBytes {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl SlicedCowBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn to_owned_bytes(&self) -> CowBytes {
        CowBytes::from_slice(self.as_slice())
    }
}

impl Deref for SlicedCowBytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<&[u8]> for SlicedCowBytes {
    fn from(data: &[u8]) -> Self {
        CowBytes::from_slice(data).into_sliced()
    }
}

impl From<CowBytes> for SlicedCowBytes {
    fn from(b: CowBytes) -> Self {
        b.into_sliced()
    }
}

impl PartialEq for SlicedCowBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl PartialOrd for SlicedCowBytes {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlicedCowBytes {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl fmt::Debug for SlicedCowBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlicedCowBytes({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_roundtrip() {
        let owned = CowBytes::from_slice(b"hello world");
        let sliced = owned.clone().into_sliced();
        assert_eq!(sliced.as_slice(), b"hello world");
        assert_eq!(sliced.to_owned_bytes(), owned);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = CowBytes::from_slice(b"aaa");
        let b = CowBytes::from_slice(b"aab");
        assert!(a < b);
    }
}
