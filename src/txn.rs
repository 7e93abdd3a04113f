//! Transaction bookkeeping and commit/abort orchestration (spec §3
//! "Transaction"). Grounded on `original_source/newbrt/log.c`'s
//! `toku_logger_txn_begin`/`toku_logger_commit`: a transaction either has
//! no parent (a root transaction, whose commit logs a `commit` record and
//! fsyncs unless `nosync` was requested) or it does (a nested transaction,
//! whose commit logs a `commit` record but splices its rollback entries
//! onto the parent's list instead of discarding them — only a root commit
//! is truly durable).
//!
//! Actually writing the forward `commit` record is the logger's job; this
//! module owns transaction identity, parent/child bookkeeping, and the
//! commit/abort orchestration against [`crate::rollback::RollbackLog`] and
//! the logger.

use crate::error::{Error, Result};
use crate::logger::record::RecordPayload;
use crate::logger::Logger;
use crate::message::TxnId;
use crate::rollback::{RollbackLog, UndoApplier};

struct TxnState {
    parent: Option<TxnId>,
}

/// Tracks every live transaction's parent link; paired with a
/// [`RollbackLog`] that tracks their undo entries.
pub struct TxnManager {
    next_id: TxnId,
    live: std::collections::HashMap<TxnId, TxnState>,
}

impl TxnManager {
    pub fn new() -> Self {
        TxnManager {
            next_id: 1,
            live: std::collections::HashMap::new(),
        }
    }

    pub fn is_live(&self, txn: TxnId) -> bool {
        self.live.contains_key(&txn)
    }

    pub fn parent_of(&self, txn: TxnId) -> Option<TxnId> {
        self.live.get(&txn).and_then(|s| s.parent)
    }

    pub fn is_root(&self, txn: TxnId) -> bool {
        self.parent_of(txn).is_none()
    }

    /// Begin a new transaction, optionally nested under `parent`. Logs a
    /// `begin` record and registers the transaction with the rollback log.
    pub fn begin(
        &mut self,
        parent: Option<TxnId>,
        logger: &mut Logger,
        rollback: &mut RollbackLog,
    ) -> Result<TxnId> {
        if let Some(p) = parent {
            if !self.is_live(p) {
                return Err(Error::InvalidArgument("parent transaction is not live".into()));
            }
        }
        let txn = self.next_id;
        self.next_id += 1;
        logger.log(RecordPayload::Begin { txn, parent })?;
        rollback.begin(txn, parent);
        self.live.insert(txn, TxnState { parent });
        Ok(txn)
    }

    /// Commit: log the `commit` record, fsync if this is a root transaction
    /// and the caller did not ask to skip it, then splice the rollback
    /// entries into the parent (or discard them, for a root commit).
    pub fn commit(
        &mut self,
        txn: TxnId,
        nosync: bool,
        logger: &mut Logger,
        rollback: &mut RollbackLog,
    ) -> Result<()> {
        let state = self.live.remove(&txn).ok_or(Error::NotFound)?;
        logger.log(RecordPayload::Commit { txn })?;
        if state.parent.is_none() && !nosync {
            logger.fsync()?;
        }
        rollback.commit(txn)
    }

    /// Abort: replay the rollback log in reverse against `applier`, then
    /// drop the transaction. No `abort` record family exists in the WAL
    /// (spec §4.5 lists only `begin`/`commit`/`checkpoint` for transaction
    /// bookkeeping) — an unresolved transaction found at end-of-log is
    /// simply the one recovery aborts (spec §4.7).
    pub fn abort(&mut self, txn: TxnId, rollback: &mut RollbackLog, applier: &mut impl UndoApplier) -> Result<()> {
        self.live.remove(&txn).ok_or(Error::NotFound)?;
        rollback.abort(txn, applier)
    }

    /// Register a transaction observed via a replayed `Begin` record,
    /// without logging anything (the record is already on disk). Advances
    /// `next_id` past `txn` so a freshly recovered database never reissues
    /// an id a replayed transaction already used.
    pub fn recovery_begin(&mut self, txn: TxnId, parent: Option<TxnId>) {
        self.live.insert(txn, TxnState { parent });
        if txn >= self.next_id {
            self.next_id = txn + 1;
        }
    }

    /// Drop the bookkeeping for a transaction observed committing via a
    /// replayed `Commit` record. The rollback log's own splice/discard is
    /// handled separately by the caller, since recovery drives it directly.
    pub fn recovery_forget(&mut self, txn: TxnId) {
        self.live.remove(&txn);
    }

    /// Every transaction still open after the WAL has been fully replayed —
    /// recovery aborts each of these in turn (spec §4.7).
    pub fn live_txns(&self) -> Vec<TxnId> {
        self.live.keys().copied().collect()
    }
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    struct NullApplier;
    impl UndoApplier for NullApplier {
        fn undo_insert_in_leaf(&mut self, _: u32, _: u64, _: u32, _: &[u8], _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn undo_delete_in_leaf(&mut self, _: u32, _: u64, _: u32, _: &[u8], _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn test_logger(dir: &std::path::Path) -> Logger {
        let mut config = EngineConfig::default();
        config.log_directory = dir.to_string_lossy().into_owned();
        Logger::open(&config).unwrap()
    }

    #[test]
    fn root_commit_is_durable_and_clears_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = test_logger(dir.path());
        let mut rollback = RollbackLog::new();
        let mut txns = TxnManager::new();

        let t = txns.begin(None, &mut logger, &mut rollback).unwrap();
        assert!(txns.is_root(t));
        txns.commit(t, false, &mut logger, &mut rollback).unwrap();
        assert!(!txns.is_live(t));
        assert!(!rollback.is_live(t));
    }

    #[test]
    fn nested_commit_leaves_parent_live() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = test_logger(dir.path());
        let mut rollback = RollbackLog::new();
        let mut txns = TxnManager::new();

        let parent = txns.begin(None, &mut logger, &mut rollback).unwrap();
        let child = txns.begin(Some(parent), &mut logger, &mut rollback).unwrap();
        txns.commit(child, false, &mut logger, &mut rollback).unwrap();
        assert!(txns.is_live(parent));
        assert!(rollback.is_live(parent));
    }

    #[test]
    fn abort_drops_the_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = test_logger(dir.path());
        let mut rollback = RollbackLog::new();
        let mut txns = TxnManager::new();
        let mut applier = NullApplier;

        let t = txns.begin(None, &mut logger, &mut rollback).unwrap();
        txns.abort(t, &mut rollback, &mut applier).unwrap();
        assert!(!txns.is_live(t));
    }
}
