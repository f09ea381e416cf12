// Transaction manager: id assignment, the active-transaction table, and
// the commit/abort/prepare paths that drive the write-ahead log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use parking_lot::Mutex;

use crate::common::types::{Lsn, TxnId, TXN_MINIMUM};
use crate::storage::buffer::PageCache;
use crate::transaction::recovery::dispatch::{table, RecoveryContext, RecoveryPass};
use crate::transaction::recovery::driver::{self, RecoveryOptions, RecoveryReport};
use crate::transaction::wal::log_record::{decode, encode, RecordPayload, RecordType};
use crate::transaction::wal::log_store::LogStore;
use crate::transaction::{Result, Transaction, TransactionError, TxnStatus};

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Creates and tracks transactions and writes their log records.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    log: Arc<LogStore>,
    active: Mutex<HashMap<TxnId, Transaction>>,
}

impl TransactionManager {
    pub fn new(log: Arc<LogStore>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(TXN_MINIMUM),
            log,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    /// Wire this manager into the log store's space reclamation: the
    /// in-memory ring asks for the oldest LSN any active transaction
    /// still needs before discarding anything.
    pub fn install_reclaim_hook(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.log.set_oldest_lsn_hook(Box::new(move || {
            weak.upgrade().and_then(|mgr| mgr.active_min_lsn())
        }));
    }

    /// Oldest begin-LSN among active transactions, `None` when nothing
    /// pins the log.
    pub fn active_min_lsn(&self) -> Option<Lsn> {
        self.active.lock().values().map(|txn| txn.begin_lsn).min()
    }

    /// Begin a top-level transaction.
    pub fn begin(&self) -> Result<TxnId> {
        self.begin_internal(None)
    }

    /// Begin a child transaction nested under `parent`. The child's fate
    /// follows the parent: its commit merely links it into the parent's
    /// chain.
    pub fn begin_child(&self, parent: TxnId) -> Result<TxnId> {
        {
            let active = self.active.lock();
            let p = active.get(&parent).ok_or(TransactionError::NotActive(parent))?;
            if p.status != TxnStatus::Running {
                return Err(TransactionError::InvalidState(format!(
                    "parent transaction {parent} is {:?}",
                    p.status
                )));
            }
        }
        self.begin_internal(Some(parent))
    }

    fn begin_internal(&self, parent: Option<TxnId>) -> Result<TxnId> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let lsn = self
            .log
            .append(&encode(id, Lsn::ZERO, &RecordPayload::TxnBegin { timestamp: now_secs() }))?;
        let txn = Transaction {
            id,
            parent,
            begin_lsn: lsn,
            last_lsn: lsn,
            status: TxnStatus::Running,
        };
        self.active.lock().insert(id, txn);
        debug!("begin txn {} at {}", id, lsn);
        Ok(id)
    }

    /// Append an operation record on behalf of a transaction, chaining
    /// it to the transaction's previous record. This is the log half of
    /// the mutation sequence: the caller holds the page write lock, has
    /// adjusted cursors, and will stamp the returned LSN onto the page.
    pub fn record_update(&self, txn_id: TxnId, payload: &RecordPayload<'_>) -> Result<Lsn> {
        let mut active = self.active.lock();
        let txn = active.get_mut(&txn_id).ok_or(TransactionError::NotActive(txn_id))?;
        if txn.status != TxnStatus::Running {
            return Err(TransactionError::InvalidState(format!(
                "transaction {txn_id} is {:?}",
                txn.status
            )));
        }
        let lsn = self.log.append(&encode(txn_id, txn.last_lsn, payload))?;
        txn.last_lsn = lsn;
        Ok(lsn)
    }

    /// Flag a transaction as prepared; it survives recovery without
    /// being rolled back until resolved.
    pub fn prepare(&self, txn_id: TxnId) -> Result<Lsn> {
        let lsn = {
            let mut active = self.active.lock();
            let txn = active.get_mut(&txn_id).ok_or(TransactionError::NotActive(txn_id))?;
            if txn.status != TxnStatus::Running {
                return Err(TransactionError::InvalidState(format!(
                    "transaction {txn_id} is {:?}",
                    txn.status
                )));
            }
            let lsn = self.log.append(&encode(txn_id, txn.last_lsn, &RecordPayload::TxnPrepare))?;
            txn.last_lsn = lsn;
            txn.status = TxnStatus::Prepared;
            lsn
        };
        // A prepare is a durability promise.
        self.log.flush(Some(lsn))?;
        Ok(lsn)
    }

    /// Commit a transaction. For a child this links it into the parent's
    /// chain; for a top-level transaction it writes the commit record
    /// and forces it out when the store is configured to sync.
    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        let mut active = self.active.lock();
        let txn = active.remove(&txn_id).ok_or(TransactionError::NotActive(txn_id))?;

        let lsn = match txn.parent {
            Some(parent) => {
                let p = active.get_mut(&parent).ok_or_else(|| {
                    TransactionError::InvalidState(format!(
                        "child {txn_id} outlived parent {parent}"
                    ))
                })?;
                let lsn = self.log.append(&encode(
                    parent,
                    p.last_lsn,
                    &RecordPayload::TxnChild { child: txn_id, child_lsn: txn.last_lsn },
                ))?;
                p.last_lsn = lsn;
                lsn
            }
            None => self.log.append(&encode(
                txn_id,
                txn.last_lsn,
                &RecordPayload::TxnCommit { timestamp: now_secs() },
            ))?,
        };
        drop(active);

        // Child commits become durable with their parent.
        if txn.parent.is_none() && self.log.config().force_sync {
            self.log.flush(Some(lsn))?;
        }
        debug!("commit txn {} at {}", txn_id, lsn);
        Ok(())
    }

    /// Abort a transaction: walk its record chain backward, undoing each
    /// operation through the dispatch table, then log the abort. Child
    /// transactions already linked into the chain are undone with it.
    pub fn abort(&self, txn_id: TxnId, cache: &dyn PageCache) -> Result<()> {
        let txn = self
            .active
            .lock()
            .remove(&txn_id)
            .ok_or(TransactionError::NotActive(txn_id))?;

        let dispatch = table();
        let mut ctx = RecoveryContext::for_abort(cache);
        let mut chain = vec![txn.last_lsn];
        while let Some(mut lsn) = chain.pop() {
            while !lsn.is_zero() {
                let payload = self.log.read_record(lsn)?;
                let rec = decode(&payload)?;
                match rec.rec_type {
                    RecordType::TxnChild => {
                        if let RecordPayload::TxnChild { child_lsn, .. } = &rec.payload {
                            // The child's records are ours to undo too.
                            chain.push(*child_lsn);
                        }
                    }
                    // Transaction bookkeeping records carry nothing to
                    // undo; an abort reverses even a prepared chain.
                    RecordType::TxnBegin
                    | RecordType::TxnCommit
                    | RecordType::TxnAbort
                    | RecordType::TxnPrepare
                    | RecordType::Checkpoint
                    | RecordType::FileOpen
                    | RecordType::FileClose => {}
                    _ => {
                        dispatch
                            .dispatch(RecoveryPass::BackwardRoll, &mut ctx, lsn, &rec)
                            .map_err(TransactionError::Recovery)?;
                    }
                }
                lsn = rec.prev_lsn;
            }
        }

        let abort_lsn = self.log.append(&encode(
            txn_id,
            txn.last_lsn,
            &RecordPayload::TxnAbort { timestamp: now_secs() },
        ))?;
        if self.log.config().force_sync {
            self.log.flush(Some(abort_lsn))?;
        }
        info!("aborted txn {} at {}", txn_id, abort_lsn);
        Ok(())
    }

    /// How a transaction currently looks to this manager, `None` if it
    /// is not in the active table.
    pub fn classify(&self, txn_id: TxnId) -> Option<TxnStatus> {
        self.active.lock().get(&txn_id).map(|txn| txn.status)
    }

    pub fn active_txn_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.active.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Write a checkpoint record: the previous checkpoint link, the
    /// current open-file set as reported by the caller, and a timestamp.
    pub fn checkpoint(&self, last_ckp: Lsn, open_files: &[(u32, String)]) -> Result<Lsn> {
        let refs: Vec<crate::transaction::wal::log_record::OpenFileRef<'_>> = open_files
            .iter()
            .map(|(id, path)| crate::transaction::wal::log_record::OpenFileRef {
                file_id: *id,
                path: path.as_str(),
            })
            .collect();
        let lsn = self.log.append(&encode(0, Lsn::ZERO, &RecordPayload::Checkpoint {
            last_ckp,
            timestamp: now_secs(),
            open_files: refs,
        }))?;
        self.log.flush(Some(lsn))?;
        Ok(lsn)
    }

    /// Run crash recovery and reset the transaction id counter past
    /// everything the log has seen.
    pub fn recover(&self, cache: &dyn PageCache, options: RecoveryOptions) -> Result<RecoveryReport> {
        let report = driver::recover(&self.log, cache, options)?;
        self.active.lock().clear();
        let next = report.max_txn_id.saturating_add(1).max(TXN_MINIMUM);
        self.next_txn_id.store(next, Ordering::SeqCst);
        Ok(report)
    }
}
