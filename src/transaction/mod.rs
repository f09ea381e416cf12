// Transactions: the manager, the write-ahead log and crash recovery.

pub mod manager;
pub mod recovery;
pub mod wal;

pub use manager::TransactionManager;

use thiserror::Error;

use crate::common::types::{Lsn, TxnId};
use crate::transaction::recovery::RecoveryError;
use crate::transaction::wal::codec::CodecError;
use crate::transaction::wal::log_store::LogStoreError;

/// Error type for transaction operations
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("log error: {0}")]
    Log(#[from] LogStoreError),

    #[error("record decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("transaction {0} is not active")]
    NotActive(TxnId),

    #[error("invalid transaction state: {0}")]
    InvalidState(String),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Running,
    Prepared,
    Committed,
    Aborted,
}

/// Book-keeping for one live transaction. The record chain hangs off
/// `last_lsn`: following each record's prev-LSN backpointer walks the
/// transaction's history newest-first.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxnId,
    /// Set for nested child transactions
    pub parent: Option<TxnId>,
    /// LSN of the begin record; pins the log for reclamation purposes
    pub begin_lsn: Lsn,
    /// LSN of the most recent record in this transaction's chain
    pub last_lsn: Lsn,
    pub status: TxnStatus,
}
