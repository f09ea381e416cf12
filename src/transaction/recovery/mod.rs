// Crash recovery: the dispatch registry, the per-record-type handlers
// and the multi-pass recovery driver.

pub mod dispatch;
pub mod driver;
pub mod handlers;

use std::collections::HashMap;

use thiserror::Error;

use crate::common::types::{Lsn, TxnId};
use crate::storage::buffer::BufferError;
use crate::storage::page::PageError;
use crate::transaction::wal::codec::CodecError;
use crate::transaction::wal::log_store::LogStoreError;

/// Error type for recovery operations. Anything that goes wrong during a
/// recovery attempt is fatal to the attempt: partial recovery would leave
/// the database inconsistent.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("log error: {0}")]
    Log(#[from] LogStoreError),

    #[error("record decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("page error: {0}")]
    Page(#[from] PageError),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("recovery handler failed for LSN {lsn}: {detail}")]
    Handler { lsn: Lsn, detail: String },

    #[error("no handler registered for record type tag {0}")]
    Unregistered(u32),
}

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// How a transaction looked from the log at crash time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnClass {
    /// No commit or abort seen: a loser, must be undone
    Running,
    Committed,
    Aborted,
    /// Prepared but unresolved: survives recovery untouched
    Prepared,
}

/// Transaction classification built up by the backward pass. A
/// transaction is `Running` until a commit, abort or prepare record for
/// it is seen (the backward scan visits those first).
#[derive(Debug, Default)]
pub struct TxnClassifier {
    classes: HashMap<TxnId, TxnClass>,
    max_txn_id: TxnId,
}

impl TxnClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a transaction id appeared in the log.
    pub fn observe(&mut self, txn_id: TxnId) {
        if txn_id == 0 {
            return;
        }
        self.max_txn_id = self.max_txn_id.max(txn_id);
        self.classes.entry(txn_id).or_insert(TxnClass::Running);
    }

    pub fn note_commit(&mut self, txn_id: TxnId) {
        self.observe(txn_id);
        self.classes.insert(txn_id, TxnClass::Committed);
    }

    pub fn note_abort(&mut self, txn_id: TxnId) {
        self.observe(txn_id);
        self.classes.insert(txn_id, TxnClass::Aborted);
    }

    /// Prepare does not override a commit: the commit record is newer
    /// and was already seen by the backward scan.
    pub fn note_prepare(&mut self, txn_id: TxnId) {
        self.observe(txn_id);
        self.classes.entry(txn_id).and_modify(|c| {
            if *c == TxnClass::Running {
                *c = TxnClass::Prepared;
            }
        });
    }

    pub fn classify(&self, txn_id: TxnId) -> TxnClass {
        self.classes.get(&txn_id).copied().unwrap_or(TxnClass::Running)
    }

    pub fn max_txn_id(&self) -> TxnId {
        self.max_txn_id
    }

    pub fn count(&self, class: TxnClass) -> usize {
        self.classes.values().filter(|c| **c == class).count()
    }
}
