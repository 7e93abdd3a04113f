//! Fixed-block file I/O: the tree file is a sequence of `node_size`-byte
//! slots addressed by [`NodeOffset`] (spec §3 "Node offset", §6 "File
//! layout"). Generalized from the teacher's `storage_pool::DiskOffset`
//! concept and from `original_source/newbrt/cachetable.c`'s `cachefile`,
//! which owns the raw file descriptor behind the cache.
//!
//! Multiple cachefiles may reference the same underlying inode; that
//! reference counting lives in [`crate::cachetable`], not here — this
//! module only ever deals with one already-open file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::node::NodeOffset;

/// A single fixed-block-size file backing one tree.
pub struct NodeFile {
    file: File,
    path: PathBuf,
    node_size: u32,
}

impl NodeFile {
    /// Open an existing file, or create it if `create` is set.
    pub fn open(path: impl AsRef<Path>, node_size: u32, create: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;
        Ok(NodeFile {
            file,
            path,
            node_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn node_size(&self) -> u32 {
        self.node_size
    }

    /// True if the file contains no data yet (a brand-new file that still
    /// needs a header and empty root written to it).
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.file.metadata()?.len() == 0)
    }

    /// Read exactly one `node_size`-byte block at `offset`.
    pub fn read_block(&mut self, offset: NodeOffset) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.node_size as usize];
        self.file.seek(SeekFrom::Start(offset.0))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write exactly one `node_size`-byte block at `offset`. `data` must
    /// already be padded to `node_size` (the serializer guarantees this).
    pub fn write_block(&mut self, offset: NodeOffset, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.node_size as usize);
        self.file.seek(SeekFrom::Start(offset.0))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Flush the OS write cache for this file to stable storage.
    pub fn fsync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
