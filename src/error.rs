//! Error and result types for the storage core.
//!
//! Every fallible internal function returns a [`Result`]; error paths unpin
//! anything they pinned and unwind to the top-level operation, which
//! releases the header pin before surfacing the error (see spec §7
//! "Propagation").

use std::io;

use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Boundary error codes, per spec §6/§7.
#[derive(Debug, Error)]
pub enum Error {
    /// `lookup`/cursor seek found no matching entry.
    #[error("key not found")]
    NotFound,

    /// `cachetable_put` on a key that is already present.
    #[error("already present")]
    AlreadyPresent,

    /// Insert/delete with a zero-length key.
    #[error("key must not be empty")]
    KeyEmpty,

    /// CRC, fingerprint, or layout-tag mismatch in a serialized image.
    #[error("format error: {0}")]
    FormatError(String),

    /// The cachetable could not make room: every entry was pinned.
    #[error("cachetable over budget")]
    OverBudget,

    /// The logger (or a cachefile sharing it) has latched a prior I/O
    /// failure; no further operation may touch disk until reopened.
    #[error("logger panicked: {0}")]
    Panicked(String),

    /// A caller-supplied argument violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested range was empty or not well-ordered.
    #[error("invalid range")]
    InvalidRange,

    /// A database was opened with flags that do not match the header's
    /// persisted duplicate mode and no `load_flags` override was given.
    #[error("duplicate-mode flags mismatch: header has {header:?}, requested {requested:?}")]
    FlagsMismatch {
        header: crate::message::DupMode,
        requested: crate::message::DupMode,
    },

    /// Propagated I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the two "expected, return to caller" kinds of spec §7.
    pub fn is_expected(&self) -> bool {
        matches!(self, Error::NotFound | Error::AlreadyPresent)
    }
}
