//! Size accounting traits used to decide when a leaf, a node's message
//! buffers, or a cachetable entry has grown past its budget.

use crate::cow_bytes::{CowBytes, SlicedCowBytes};

/// Implementing types have a size known without inspecting their contents.
pub trait StaticSize {
    fn static_size() -> usize;
}

/// Implementing types can report their current serialized/in-memory size.
pub trait Size {
    fn size(&self) -> usize;
}

macro_rules! static_size_for_int {
    ($($t:ty),*) => {
        $(impl StaticSize for $t {
            fn static_size() -> usize { std::mem::size_of::<$t>() }
        })*
    };
}

static_size_for_int!(u8, u16, u32, u64, i8, i16, i32, i64, bool);

impl Size for CowBytes {
    fn size(&self) -> usize {
        self.len()
    }
}

impl Size for SlicedCowBytes {
    fn size(&self) -> usize {
        self.len()
    }
}
