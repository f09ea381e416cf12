// The recovery driver.
//
// Recovery runs in four steps over the log:
//
//   0. Locate the start point: find the newest checkpoint and follow its
//      previous-checkpoint link one hop back. Crashing after a checkpoint
//      was written but before its open-file information settled is why
//      the hop is needed.
//   1. Open-files pass, forward from the start point to the end of the
//      log, replaying only file open/close bookkeeping.
//   2. Backward pass from the end of the log, classifying transactions
//      and undoing operations of unresolved ones, down to the start
//      point (or the beginning of the log for catastrophic recovery or
//      when no checkpoint exists).
//   3. Forward pass from where the backward pass stopped, redoing
//      operations of committed transactions.
//
// Any error mid-pass aborts the whole attempt; re-running starts over
// from the same checkpoint search, which the page-LSN protocol makes
// safe.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info};

use crate::common::types::{Lsn, TxnId};
use crate::storage::buffer::PageCache;
use crate::transaction::recovery::dispatch::{table, RecoveryContext, RecoveryPass};
use crate::transaction::recovery::{Result, TxnClass};
use crate::transaction::wal::log_record::{decode, encode, RecordPayload};
use crate::transaction::wal::log_store::{LogStore, LogStoreError};

/// Normal recovery bounds its work by checkpoints; catastrophic recovery
/// rebuilds from the very beginning of whatever log survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryKind {
    #[default]
    Normal,
    Catastrophic,
}

/// Cosmetic progress observer: called with 0..=100 as the passes walk
/// the log.
pub type FeedbackFn = Box<dyn Fn(u8) + Send>;

#[derive(Default)]
pub struct RecoveryOptions {
    pub kind: RecoveryKind,
    pub feedback: Option<FeedbackFn>,
}

/// What a recovery run found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Oldest LSN the passes looked at
    pub scanned_from: Lsn,
    /// Newest LSN in the log at recovery time
    pub scanned_to: Lsn,
    pub committed: usize,
    /// Transactions with no resolution in the log, rolled back
    pub rolled_back: usize,
    pub prepared: usize,
    /// The fresh checkpoint written on completion
    pub checkpoint_lsn: Option<Lsn>,
    /// Highest transaction id seen; the id counter resumes above it
    pub max_txn_id: TxnId,
}

impl RecoveryReport {
    fn empty() -> Self {
        Self {
            scanned_from: Lsn::ZERO,
            scanned_to: Lsn::ZERO,
            committed: 0,
            rolled_back: 0,
            prepared: 0,
            checkpoint_lsn: None,
            max_txn_id: 0,
        }
    }
}

/// Walk backward from the end of the log to the newest checkpoint.
/// Returns the checkpoint's LSN and its previous-checkpoint link.
fn find_last_checkpoint(store: &LogStore) -> Result<Option<(Lsn, Lsn)>> {
    let mut pos = match store.last_lsn() {
        Ok(lsn) => lsn,
        Err(LogStoreError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    loop {
        let payload = store.read_record(pos)?;
        let rec = decode(&payload)?;
        if let RecordPayload::Checkpoint { last_ckp, .. } = rec.payload {
            return Ok(Some((pos, last_ckp)));
        }
        match store.prev_lsn(pos) {
            Ok(prev) => pos = prev,
            Err(LogStoreError::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Fraction of the log between `low` and `current` (forward) or between
/// `current` and `high` (backward), measured in segment-sized units for
/// the progress estimate.
fn lsn_diff(low: Lsn, high: Lsn, current: Lsn, segment_size: u32, forward: bool) -> f32 {
    let max = segment_size as f32;
    if forward {
        if current.file == low.file {
            (current.offset.saturating_sub(low.offset)) as f32 / max
        } else if current.offset < low.offset {
            (current.file - low.file - 1) as f32
                + (segment_size - low.offset + current.offset) as f32 / max
        } else {
            (current.file - low.file) as f32 + (current.offset - low.offset) as f32 / max
        }
    } else if current.file == high.file {
        (high.offset.saturating_sub(current.offset)) as f32 / max
    } else if current.offset > high.offset {
        (high.file - current.file - 1) as f32
            + (segment_size - current.offset + high.offset) as f32 / max
    } else {
        (high.file - current.file) as f32 + (high.offset - current.offset) as f32 / max
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Run crash recovery over `store`, applying page effects through
/// `cache`. On success the environment is consistent: committed work is
/// present, unresolved work is rolled back, and a fresh checkpoint
/// bounds the next recovery.
pub fn recover(
    store: &LogStore,
    cache: &dyn PageCache,
    options: RecoveryOptions,
) -> Result<RecoveryReport> {
    let last_lsn = match store.last_lsn() {
        Ok(lsn) => lsn,
        Err(LogStoreError::NotFound) => {
            // A fresh, empty log: nothing to recover.
            info!("recovery: empty log, nothing to do");
            return Ok(RecoveryReport::empty());
        }
        Err(e) => return Err(e.into()),
    };

    let dispatch = table();
    let mut ctx = RecoveryContext::new(cache);
    let segment_size = store.config().segment_size;

    // Step 0: find where the open-files pass begins.
    let checkpoint = find_last_checkpoint(store)?;
    let open_lsn = match checkpoint {
        Some((_, link)) if !link.is_zero() && store.read_record(link).is_ok() => link,
        _ => store.first_lsn()?,
    };
    info!("recovery starting from {}", open_lsn);

    let span = lsn_diff(open_lsn, last_lsn, last_lsn, segment_size, true).max(f32::EPSILON);
    let feedback = |pass_base: u8, frac: f32| {
        if let Some(f) = &options.feedback {
            let pct = pass_base + (33.0 * frac.clamp(0.0, 1.0)) as u8;
            f(pct.min(100));
        }
    };

    // Pass 1: rebuild the open-file set as of the crash.
    let mut pos = open_lsn;
    loop {
        let payload = store.read_record(pos)?;
        let rec = decode(&payload).inspect_err(|e| {
            error!("recovery: bad record at {}: {}", pos, e);
        })?;
        dispatch.dispatch(RecoveryPass::OpenFiles, &mut ctx, pos, &rec)?;
        feedback(0, lsn_diff(open_lsn, last_lsn, pos, segment_size, true) / span);
        match store.next_lsn(pos) {
            Ok(next) => pos = next,
            Err(LogStoreError::NotFound) => break,
            Err(e) => return Err(e.into()),
        }
    }

    // Pass 2: backward roll. With a checkpoint we stop there; without
    // one, or for a catastrophic rebuild, we go to the beginning.
    let floor = match (options.kind, checkpoint) {
        (RecoveryKind::Catastrophic, _) | (_, None) => None,
        (RecoveryKind::Normal, Some(_)) => Some(open_lsn),
    };

    let mut pos = last_lsn;
    let mut reached_start = false;
    loop {
        if floor.is_some_and(|f| pos <= f) {
            break;
        }
        let payload = store.read_record(pos)?;
        let rec = decode(&payload).inspect_err(|e| {
            error!("recovery: bad record at {}: {}", pos, e);
        })?;
        dispatch.dispatch(RecoveryPass::BackwardRoll, &mut ctx, pos, &rec)?;
        feedback(34, lsn_diff(open_lsn, last_lsn, pos, segment_size, false) / span);
        match store.prev_lsn(pos) {
            Ok(prev) => pos = prev,
            Err(LogStoreError::NotFound) => {
                reached_start = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!(
        "backward roll done: {} committed, {} running, {} prepared, {} aborted",
        ctx.txns.count(TxnClass::Committed),
        ctx.txns.count(TxnClass::Running),
        ctx.txns.count(TxnClass::Prepared),
        ctx.txns.count(TxnClass::Aborted),
    );

    // Pass 3: forward roll from just after where the backward pass
    // stopped.
    let redo_start = if reached_start {
        Some(store.first_lsn()?)
    } else {
        match store.next_lsn(pos) {
            Ok(next) => Some(next),
            Err(LogStoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        }
    };
    if let Some(start) = redo_start {
        let mut pos = start;
        loop {
            let payload = store.read_record(pos)?;
            let rec = decode(&payload).inspect_err(|e| {
                error!("recovery: bad record at {}: {}", pos, e);
            })?;
            dispatch.dispatch(RecoveryPass::ForwardRoll, &mut ctx, pos, &rec)?;
            feedback(67, lsn_diff(open_lsn, last_lsn, pos, segment_size, true) / span);
            match store.next_lsn(pos) {
                Ok(next) => pos = next,
                Err(LogStoreError::NotFound) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Close everything the replay opened purely for recovery.
    for (file_id, path) in ctx.open_files.drain() {
        debug!("recovery: closing file {} ({})", file_id, path);
    }

    // Take a fresh checkpoint recording the resolved last-checkpoint
    // link, so the next recovery is bounded by this one.
    let resolved = checkpoint.map(|(lsn, _)| lsn).unwrap_or(Lsn::ZERO);
    let ckp_payload = RecordPayload::Checkpoint {
        last_ckp: resolved,
        timestamp: now_secs(),
        open_files: Vec::new(),
    };
    let ckp_lsn = store.append(&encode(0, Lsn::ZERO, &ckp_payload))?;
    store.flush(None)?;

    if let Some(f) = &options.feedback {
        f(100);
    }

    let report = RecoveryReport {
        scanned_from: if reached_start { store.first_lsn()? } else { open_lsn },
        scanned_to: last_lsn,
        committed: ctx.txns.count(TxnClass::Committed),
        rolled_back: ctx.txns.count(TxnClass::Running),
        prepared: ctx.txns.count(TxnClass::Prepared),
        checkpoint_lsn: Some(ckp_lsn),
        max_txn_id: ctx.txns.max_txn_id(),
    };
    info!(
        "recovery complete: {} committed, {} rolled back, {} prepared, checkpoint at {}",
        report.committed, report.rolled_back, report.prepared, ckp_lsn
    );
    Ok(report)
}
