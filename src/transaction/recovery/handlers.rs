// Recovery handlers, one generic core for every page operation.
//
// Page handlers implement the page-LSN protocol:
//   redo: apply iff the record's LSN is strictly greater than the page
//         LSN, then advance the page LSN to the record's LSN;
//   undo: apply iff the page LSN equals the record's LSN, then roll the
//         page LSN back to the prior page LSN carried in the record.
// Multi-page records run the comparison per affected page. The protocol
// makes both directions idempotent, so recovery can be re-run from the
// same checkpoint after an interruption.

use log::debug;

use crate::common::types::{Lsn, PageId};
use crate::storage::buffer::BufferError;
use crate::storage::page::{decode_items, Page, PageItem, PageState, PageType};
use crate::transaction::recovery::dispatch::{DispatchEntry, DispatchTable, RecoveryContext};
use crate::transaction::recovery::{RecoveryError, Result, TxnClass};
use crate::transaction::wal::log_record::{LogRecordView, RecordPayload, RecordType};

pub fn type_name(rec_type: RecordType) -> &'static str {
    match rec_type {
        RecordType::TxnBegin => "txn_begin",
        RecordType::TxnCommit => "txn_commit",
        RecordType::TxnAbort => "txn_abort",
        RecordType::TxnPrepare => "txn_prepare",
        RecordType::TxnChild => "txn_child",
        RecordType::Checkpoint => "checkpoint",
        RecordType::FileOpen => "file_open",
        RecordType::FileClose => "file_close",
        RecordType::PageAlloc => "page_alloc",
        RecordType::PageFree => "page_free",
        RecordType::GroupAlloc => "group_alloc",
        RecordType::ItemInsert => "item_insert",
        RecordType::ItemDelete => "item_delete",
        RecordType::ItemReplace => "item_replace",
        RecordType::PageSplit => "page_split",
        RecordType::PageMerge => "page_merge",
    }
}

fn mismatch(lsn: Lsn) -> RecoveryError {
    RecoveryError::Handler { lsn, detail: "record type does not match payload".to_string() }
}

fn handler_err(lsn: Lsn, detail: impl Into<String>) -> RecoveryError {
    RecoveryError::Handler { lsn, detail: detail.into() }
}

/// Fetch a page, run `f` under its write latch, and mark it dirty if `f`
/// reports a modification. A missing page with `create` false is a skip,
/// not an error: the operation's effect never reached the disk.
fn with_page<F>(ctx: &mut RecoveryContext<'_>, pgno: PageId, create: bool, f: F) -> Result<bool>
where
    F: FnOnce(&mut Page) -> Result<bool>,
{
    let handle = match ctx.cache.fetch(pgno, create) {
        Ok(h) => h,
        Err(BufferError::PageNotFound(_)) => {
            debug!("page {} not present, nothing to do", pgno);
            return Ok(false);
        }
    };
    let modified = {
        let mut page = handle.write();
        f(&mut page)?
    };
    if modified {
        ctx.cache.mark_dirty(pgno);
    }
    ctx.cache.release(handle);
    Ok(modified)
}

// -- transaction records -------------------------------------------------

fn txn_commit_undo(ctx: &mut RecoveryContext<'_>, _lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    ctx.txns.note_commit(rec.txn_id);
    Ok(())
}

fn txn_abort_undo(ctx: &mut RecoveryContext<'_>, _lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    ctx.txns.note_abort(rec.txn_id);
    Ok(())
}

fn txn_prepare_undo(ctx: &mut RecoveryContext<'_>, _lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    ctx.txns.note_prepare(rec.txn_id);
    Ok(())
}

/// A child's fate follows its parent. The parent's commit or abort is
/// newer than this record, so the backward scan has already classified
/// the parent by the time we get here.
fn txn_child_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::TxnChild { child, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    match ctx.txns.classify(rec.txn_id) {
        TxnClass::Committed => ctx.txns.note_commit(*child),
        TxnClass::Aborted => ctx.txns.note_abort(*child),
        _ => ctx.txns.observe(*child),
    }
    Ok(())
}

pub fn register_txn_ops(table: &mut DispatchTable) {
    let plain = |undo: Option<super::dispatch::HandlerFn>| DispatchEntry {
        open_files: None,
        redo: None,
        undo,
        print: print_record,
        transactional: false,
    };
    table.register(RecordType::TxnBegin, plain(None));
    table.register(RecordType::TxnCommit, plain(Some(txn_commit_undo)));
    table.register(RecordType::TxnAbort, plain(Some(txn_abort_undo)));
    table.register(RecordType::TxnPrepare, plain(Some(txn_prepare_undo)));
    table.register(RecordType::TxnChild, plain(Some(txn_child_undo)));
}

// -- file records --------------------------------------------------------

fn file_open_apply(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::FileOpen { file_id, path } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    debug!("open-files pass: file {} -> {}", file_id, path);
    ctx.open_files.insert(*file_id, (*path).to_string());
    Ok(())
}

fn file_close_apply(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::FileClose { file_id } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    ctx.open_files.remove(file_id);
    Ok(())
}

/// A checkpoint names every file open at the time it was taken; seed the
/// open-file set from it so files opened before the scan window are not
/// missed.
fn checkpoint_open_files(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::Checkpoint { open_files, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    for f in open_files {
        ctx.open_files.entry(f.file_id).or_insert_with(|| f.path.to_string());
    }
    Ok(())
}

pub fn register_file_ops(table: &mut DispatchTable) {
    table.register(RecordType::FileOpen, DispatchEntry {
        open_files: Some(file_open_apply),
        redo: None,
        undo: None,
        print: print_record,
        transactional: false,
    });
    table.register(RecordType::FileClose, DispatchEntry {
        open_files: Some(file_close_apply),
        redo: None,
        undo: None,
        print: print_record,
        transactional: false,
    });
    table.register(RecordType::Checkpoint, DispatchEntry {
        open_files: Some(checkpoint_open_files),
        redo: None,
        undo: None,
        print: print_record,
        transactional: false,
    });
}

// -- page records --------------------------------------------------------

fn page_type(tag: u32, lsn: Lsn) -> Result<PageType> {
    PageType::from_tag(tag).ok_or_else(|| handler_err(lsn, format!("unknown page type tag {tag}")))
}

fn split_image(image: &[u8], indx: u32, lsn: Lsn) -> Result<(Vec<PageItem>, Vec<PageItem>)> {
    let mut left = decode_items(image)?;
    let at = indx as usize;
    if at > left.len() {
        return Err(handler_err(lsn, format!("split index {at} beyond image of {} items", left.len())));
    }
    let right = left.split_off(at);
    Ok((left, right))
}

fn item_insert_redo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::ItemInsert { pgno, indx, key, data, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let item = PageItem { key: key.to_vec(), data: data.to_vec() };
    with_page(ctx, *pgno, true, |page| {
        if lsn > page.lsn {
            page.insert_item(*indx, item)?;
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn item_insert_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::ItemInsert { pgno, page_lsn, indx, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    with_page(ctx, *pgno, false, |page| {
        if page.lsn == lsn {
            page.remove_item(*indx)?;
            page.lsn = *page_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn item_delete_redo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::ItemDelete { pgno, indx, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    with_page(ctx, *pgno, true, |page| {
        if lsn > page.lsn {
            page.remove_item(*indx)?;
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn item_delete_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::ItemDelete { pgno, page_lsn, indx, key, data } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let item = PageItem { key: key.to_vec(), data: data.to_vec() };
    with_page(ctx, *pgno, false, |page| {
        if page.lsn == lsn {
            page.insert_item(*indx, item)?;
            page.lsn = *page_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn item_replace_redo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::ItemReplace { pgno, indx, after, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let after = after.to_vec();
    with_page(ctx, *pgno, true, |page| {
        if lsn > page.lsn {
            page.replace_data(*indx, after)?;
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn item_replace_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::ItemReplace { pgno, page_lsn, indx, before, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let before = before.to_vec();
    with_page(ctx, *pgno, false, |page| {
        if page.lsn == lsn {
            page.replace_data(*indx, before)?;
            page.lsn = *page_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn page_alloc_redo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::PageAlloc { pgno, ptype, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let ptype = page_type(*ptype, lsn)?;
    with_page(ctx, *pgno, true, |page| {
        if lsn > page.lsn {
            page.state = PageState::Allocated(ptype);
            page.items.clear();
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn page_alloc_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::PageAlloc { pgno, page_lsn, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    with_page(ctx, *pgno, false, |page| {
        if page.lsn == lsn {
            page.state = PageState::Free;
            page.items.clear();
            page.lsn = *page_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn page_free_redo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::PageFree { pgno, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    with_page(ctx, *pgno, true, |page| {
        if lsn > page.lsn {
            page.items.clear();
            page.state = PageState::Free;
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn page_free_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::PageFree { pgno, page_lsn, ptype, image } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let ptype = page_type(*ptype, lsn)?;
    let items = decode_items(image)?;
    with_page(ctx, *pgno, true, |page| {
        if page.lsn == lsn {
            page.items = items;
            page.state = PageState::Allocated(ptype);
            page.lsn = *page_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn group_alloc_redo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::GroupAlloc { meta_pgno, start_pgno, count, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let applied = with_page(ctx, *meta_pgno, true, |page| {
        if lsn > page.lsn {
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    if applied {
        // Materialize the group as free pages; allocation records for the
        // individual pages follow in the log.
        for pgno in *start_pgno..start_pgno + count {
            with_page(ctx, pgno, true, |_| Ok(false))?;
        }
    }
    Ok(())
}

fn group_alloc_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::GroupAlloc { meta_pgno, meta_lsn, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    // The group pages themselves are free and harmless; only the meta
    // page's LSN rolls back.
    with_page(ctx, *meta_pgno, false, |page| {
        if page.lsn == lsn {
            page.lsn = *meta_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn page_split_redo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::PageSplit { left_pgno, right_pgno, indx, image, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let (left_items, right_items) = split_image(image, *indx, lsn)?;

    let mut left_state = PageState::Allocated(PageType::Leaf);
    with_page(ctx, *left_pgno, true, |page| {
        left_state = page.state;
        if lsn > page.lsn {
            page.items = left_items;
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    with_page(ctx, *right_pgno, true, |page| {
        if lsn > page.lsn {
            page.items = right_items;
            // The new sibling is the same kind of page as the one that
            // split.
            page.state = left_state;
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn page_split_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::PageSplit { left_pgno, left_lsn, right_pgno, right_lsn, image, .. } = &rec.payload
    else {
        return Err(mismatch(lsn));
    };
    let full = decode_items(image)?;
    with_page(ctx, *left_pgno, false, |page| {
        if page.lsn == lsn {
            page.items = full;
            page.lsn = *left_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    with_page(ctx, *right_pgno, false, |page| {
        if page.lsn == lsn {
            page.items.clear();
            page.state = PageState::Free;
            page.lsn = *right_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn page_merge_redo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::PageMerge { from_pgno, to_pgno, image, .. } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let moved = decode_items(image)?;
    with_page(ctx, *to_pgno, true, |page| {
        if lsn > page.lsn {
            page.items.extend(moved);
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    with_page(ctx, *from_pgno, true, |page| {
        if lsn > page.lsn {
            page.items.clear();
            page.state = PageState::Free;
            page.lsn = lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

fn page_merge_undo(ctx: &mut RecoveryContext<'_>, lsn: Lsn, rec: &LogRecordView<'_>) -> Result<()> {
    let RecordPayload::PageMerge { from_pgno, from_lsn, to_pgno, to_lsn, image } = &rec.payload else {
        return Err(mismatch(lsn));
    };
    let moved = decode_items(image)?;

    let mut to_state = PageState::Allocated(PageType::Leaf);
    with_page(ctx, *to_pgno, false, |page| {
        to_state = page.state;
        if page.lsn == lsn {
            let keep = page.items.len().checked_sub(moved.len()).ok_or_else(|| {
                handler_err(lsn, format!(
                    "merge undo would remove {} items from a page of {}",
                    moved.len(),
                    page.items.len()
                ))
            })?;
            page.items.truncate(keep);
            page.lsn = *to_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    with_page(ctx, *from_pgno, true, |page| {
        if page.lsn == lsn {
            page.items = moved;
            // Merge peers are the same kind of page.
            page.state = to_state;
            page.lsn = *from_lsn;
            Ok(true)
        } else {
            Ok(false)
        }
    })?;
    Ok(())
}

pub fn register_page_ops(table: &mut DispatchTable) {
    let entry = |redo: super::dispatch::HandlerFn, undo: super::dispatch::HandlerFn| DispatchEntry {
        open_files: None,
        redo: Some(redo),
        undo: Some(undo),
        print: print_record,
        transactional: true,
    };
    table.register(RecordType::PageAlloc, entry(page_alloc_redo, page_alloc_undo));
    table.register(RecordType::PageFree, entry(page_free_redo, page_free_undo));
    table.register(RecordType::GroupAlloc, entry(group_alloc_redo, group_alloc_undo));
    table.register(RecordType::ItemInsert, entry(item_insert_redo, item_insert_undo));
    table.register(RecordType::ItemDelete, entry(item_delete_redo, item_delete_undo));
    table.register(RecordType::ItemReplace, entry(item_replace_redo, item_replace_undo));
    table.register(RecordType::PageSplit, entry(page_split_redo, page_split_undo));
    table.register(RecordType::PageMerge, entry(page_merge_redo, page_merge_undo));
}

// -- printing ------------------------------------------------------------

/// Render one record for the log-dump tool.
pub fn print_record(lsn: Lsn, rec: &LogRecordView<'_>) -> String {
    let head = format!("{}{}: txn {} prev {}", lsn, type_name(rec.rec_type), rec.txn_id, rec.prev_lsn);
    let body = match &rec.payload {
        RecordPayload::TxnBegin { timestamp }
        | RecordPayload::TxnCommit { timestamp }
        | RecordPayload::TxnAbort { timestamp } => format!(" time {timestamp}"),
        RecordPayload::TxnPrepare => String::new(),
        RecordPayload::TxnChild { child, child_lsn } => {
            format!(" child {child} child_lsn {child_lsn}")
        }
        RecordPayload::Checkpoint { last_ckp, timestamp, open_files } => {
            format!(" last_ckp {last_ckp} time {timestamp} open_files {}", open_files.len())
        }
        RecordPayload::FileOpen { file_id, path } => format!(" file {file_id} path {path}"),
        RecordPayload::FileClose { file_id } => format!(" file {file_id}"),
        RecordPayload::PageAlloc { pgno, page_lsn, ptype } => {
            format!(" pgno {pgno} page_lsn {page_lsn} ptype {ptype}")
        }
        RecordPayload::PageFree { pgno, page_lsn, ptype, image } => {
            format!(" pgno {pgno} page_lsn {page_lsn} ptype {ptype} image {} bytes", image.len())
        }
        RecordPayload::GroupAlloc { meta_pgno, meta_lsn, start_pgno, count } => {
            format!(" meta {meta_pgno} meta_lsn {meta_lsn} start {start_pgno} count {count}")
        }
        RecordPayload::ItemInsert { pgno, page_lsn, indx, key, data }
        | RecordPayload::ItemDelete { pgno, page_lsn, indx, key, data } => {
            format!(
                " pgno {pgno} page_lsn {page_lsn} indx {indx} key {} bytes data {} bytes",
                key.len(),
                data.len()
            )
        }
        RecordPayload::ItemReplace { pgno, page_lsn, indx, before, after } => {
            format!(
                " pgno {pgno} page_lsn {page_lsn} indx {indx} before {} bytes after {} bytes",
                before.len(),
                after.len()
            )
        }
        RecordPayload::PageSplit { left_pgno, left_lsn, right_pgno, right_lsn, indx, image } => {
            format!(
                " left {left_pgno} left_lsn {left_lsn} right {right_pgno} right_lsn {right_lsn} indx {indx} image {} bytes",
                image.len()
            )
        }
        RecordPayload::PageMerge { from_pgno, from_lsn, to_pgno, to_lsn, image } => {
            format!(
                " from {from_pgno} from_lsn {from_lsn} to {to_pgno} to_lsn {to_lsn} image {} bytes",
                image.len()
            )
        }
    };
    format!("{head}{body}")
}
