// Record-type dispatch registry.
//
// Maps each record type tag to its handler entry: one function per
// recovery pass plus a print function for the log-dump tool. The table
// is built once, at first use, from the compiled-in handler sets;
// registering a tag twice is a programming error and panics.

use std::collections::HashMap;

use log::debug;
use once_cell::sync::Lazy;

use crate::common::types::{FileId, Lsn};
use crate::storage::buffer::PageCache;
use crate::transaction::recovery::{handlers, Result, TxnClass, TxnClassifier};
use crate::transaction::wal::log_record::{LogRecordView, RecordType};

/// Which recovery pass is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPass {
    /// Forward pass replaying only file open/close state
    OpenFiles,
    /// Backward pass: classify transactions, undo losers
    BackwardRoll,
    /// Forward pass: redo committed transactions
    ForwardRoll,
}

/// Shared state the handlers operate on.
pub struct RecoveryContext<'a> {
    pub cache: &'a dyn PageCache,
    pub txns: TxnClassifier,
    /// Logical files considered open at this point of the replay
    pub open_files: HashMap<FileId, String>,
}

impl<'a> RecoveryContext<'a> {
    pub fn new(cache: &'a dyn PageCache) -> Self {
        Self { cache, txns: TxnClassifier::new(), open_files: HashMap::new() }
    }

    /// Context for a live abort: the aborting transaction is the only
    /// one in scope and is by definition still running.
    pub fn for_abort(cache: &'a dyn PageCache) -> Self {
        Self::new(cache)
    }
}

pub type HandlerFn = fn(&mut RecoveryContext<'_>, Lsn, &LogRecordView<'_>) -> Result<()>;
pub type PrintFn = fn(Lsn, &LogRecordView<'_>) -> String;

/// Handlers for one record type. A `None` slot means the type does not
/// participate in that pass.
pub struct DispatchEntry {
    pub open_files: Option<HandlerFn>,
    pub redo: Option<HandlerFn>,
    pub undo: Option<HandlerFn>,
    pub print: PrintFn,
    /// Page mutations owned by a transaction: their redo/undo is gated
    /// on the owner's classification.
    pub transactional: bool,
}

/// The record-type → handler mapping.
pub struct DispatchTable {
    entries: HashMap<u32, DispatchEntry>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Register handlers for a record type. Panics if the tag is already
    /// taken: the table is composed once at startup from a fixed set of
    /// modules, so a collision is a bug, not a runtime condition.
    pub fn register(&mut self, rec_type: RecordType, entry: DispatchEntry) {
        let tag = rec_type.to_tag();
        if self.entries.insert(tag, entry).is_some() {
            panic!("record type tag {tag} registered twice");
        }
    }

    fn entry(&self, rec_type: RecordType) -> Result<&DispatchEntry> {
        self.entries
            .get(&rec_type.to_tag())
            .ok_or(super::RecoveryError::Unregistered(rec_type.to_tag()))
    }

    /// Invoke the pass-appropriate handler for a record. Types with no
    /// handler for the pass are a no-op, not an error; e.g. the
    /// open-files pass only acts on file bookkeeping records, and a
    /// checkpoint encountered mid-pass is simply walked over.
    pub fn dispatch(
        &self,
        pass: RecoveryPass,
        ctx: &mut RecoveryContext<'_>,
        lsn: Lsn,
        record: &LogRecordView<'_>,
    ) -> Result<()> {
        let entry = self.entry(record.rec_type)?;

        let handler = match pass {
            RecoveryPass::OpenFiles => entry.open_files,
            RecoveryPass::BackwardRoll => {
                ctx.txns.observe(record.txn_id);
                if entry.transactional {
                    match ctx.txns.classify(record.txn_id) {
                        // Committed work is replayed forward; prepared
                        // transactions must survive for later resolution.
                        TxnClass::Committed | TxnClass::Prepared => {
                            debug!("skip undo of {} at {}: owner resolved", tag_name(record), lsn);
                            None
                        }
                        TxnClass::Running | TxnClass::Aborted => entry.undo,
                    }
                } else {
                    entry.undo
                }
            }
            RecoveryPass::ForwardRoll => {
                if entry.transactional && ctx.txns.classify(record.txn_id) != TxnClass::Committed {
                    debug!("skip redo of {} at {}: owner not committed", tag_name(record), lsn);
                    None
                } else {
                    entry.redo
                }
            }
        };

        match handler {
            Some(f) => f(ctx, lsn, record),
            None => Ok(()),
        }
    }

    /// Render a record for the log-dump tool.
    pub fn print(&self, lsn: Lsn, record: &LogRecordView<'_>) -> Result<String> {
        Ok((self.entry(record.rec_type)?.print)(lsn, record))
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

fn tag_name(record: &LogRecordView<'_>) -> &'static str {
    handlers::type_name(record.rec_type)
}

static TABLE: Lazy<DispatchTable> = Lazy::new(|| {
    let mut table = DispatchTable::new();
    handlers::register_txn_ops(&mut table);
    handlers::register_file_ops(&mut table);
    handlers::register_page_ops(&mut table);
    table
});

/// The process-wide dispatch table.
pub fn table() -> &'static DispatchTable {
    &TABLE
}
