//! `brt_storage_core`: an embedded, transactional, ordered key-value
//! storage core built on a buffered repository tree (BRT) — a B-tree
//! variant whose internal nodes carry per-child message queues so that
//! mutations are absorbed high in the tree and trickled down in batches.
//!
//! The crate is organized leaves-first, following the module layout of
//! `betree_storage_stack`, the teacher this crate was grown from (see
//! `DESIGN.md` for the grounding of every module):
//!
//! - [`cow_bytes`] — cheaply-cloneable immutable byte buffers for keys and
//!   values.
//! - [`size`] — size-accounting traits used for node-budget bookkeeping.
//! - [`fingerprint`] — the salt-multiplied CRC32 integrity fingerprint.
//! - [`message`] — the tagged insert/delete message record and duplicate
//!   mode.
//! - [`fifo`] — the per-child message FIFO.
//! - [`leaf_store`] — the sorted key/value container inside a leaf.
//! - [`node`] — the internal/leaf node model.
//! - [`serializer`] — the fixed-layout on-disk wire format.
//! - [`store`] — fixed-block file I/O and the watermark allocator.
//! - [`header`] — the file header (flags, watermark, root directory).
//! - [`cachetable`] — the bounded-memory pinning page cache.
//! - [`logger`] — the write-ahead log.
//! - [`rollback`] — per-transaction logical undo.
//! - [`txn`] — transaction lifecycle and nested commit/abort.
//! - [`tree`] — the BRT engine itself: the [`tree::Brt`] type tying
//!   everything above together behind the public operations of spec §6.
//! - [`config`] — engine configuration.
//! - [`error`] — the crate-wide error and result types.

pub mod cachetable;
pub mod config;
pub mod cow_bytes;
pub mod error;
pub mod fifo;
pub mod fingerprint;
pub mod header;
pub mod leaf_store;
pub mod logger;
pub mod message;
pub mod node;
pub mod rollback;
pub mod serializer;
pub mod size;
pub mod store;
pub mod tree;
pub mod txn;

pub use config::EngineConfig;
pub use cow_bytes::{CowBytes, SlicedCowBytes};
pub use error::{Error, Result};
pub use message::{DupMode, TxnId};
pub use tree::{Brt, BrtCursor};
