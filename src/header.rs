//! The file header: one per tree file, always at offset 0 (spec §3
//! "Header", §6 "File layout").

use crate::node::NodeOffset;

/// Either a single unnamed root, or an ordered table of named sub-database
/// roots (spec §3 "Header").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootDirectory {
    Unnamed(NodeOffset),
    Named(Vec<(String, NodeOffset)>),
}

impl RootDirectory {
    pub fn unnamed_root(&self) -> Option<NodeOffset> {
        match self {
            RootDirectory::Unnamed(off) => Some(*off),
            RootDirectory::Named(_) => None,
        }
    }

    pub fn named_root(&self, name: &str) -> Option<NodeOffset> {
        match self {
            RootDirectory::Unnamed(_) => None,
            RootDirectory::Named(entries) => {
                entries.iter().find(|(n, _)| n == name).map(|(_, o)| *o)
            }
        }
    }

    pub fn set_unnamed_root(&mut self, offset: NodeOffset) {
        match self {
            RootDirectory::Unnamed(off) => *off = offset,
            RootDirectory::Named(_) => panic!("header directory is named, not unnamed"),
        }
    }

    pub fn set_named_root(&mut self, name: &str, offset: NodeOffset) {
        match self {
            RootDirectory::Named(entries) => {
                if let Some(entry) = entries.iter_mut().find(|(n, _)| n == name) {
                    entry.1 = offset;
                } else {
                    entries.push((name.to_string(), offset));
                }
            }
            RootDirectory::Unnamed(_) => panic!("header directory is unnamed, not named"),
        }
    }
}

/// The single per-file header (spec §3 "Header"). Dirty-tracked and pinned
/// like any other cached object (spec §5 "Shared resources").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flags: u32,
    pub node_size: u32,
    pub freelist_head: Option<NodeOffset>,
    pub unused_memory: NodeOffset,
    pub root_directory: RootDirectory,
    pub dirty: bool,
}

impl Header {
    /// A fresh header for a newly-created file: one empty unnamed root
    /// directly after the header block.
    pub fn new_unnamed(node_size: u32, flags: u32, root: NodeOffset) -> Self {
        Header {
            flags,
            node_size,
            freelist_head: None,
            unused_memory: NodeOffset(u64::from(node_size) * 2),
            root_directory: RootDirectory::Unnamed(root),
            dirty: true,
        }
    }

    /// Allocate the next node offset from the watermark and bump it. The
    /// freelist is intentionally never consulted here (spec §9 open
    /// question: space reclamation is a future extension).
    pub fn allocate(&mut self, node_size: u32) -> NodeOffset {
        let offset = self.unused_memory;
        self.unused_memory = NodeOffset(offset.0 + u64::from(node_size));
        self.dirty = true;
        offset
    }
}
