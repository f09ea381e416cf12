// Log record types and their wire codec.
//
// A record is self-contained: fixed header (type tag, owning txn id,
// prev-LSN backpointer for undo chaining), fixed-size typed fields, then
// length-prefixed variable buffers. Decoding borrows variable buffers
// from the input (`RecordPayload<'a>`), so a decoded record must not
// outlive the buffer it was decoded from.

use crate::common::types::{FileId, Lsn, PageId, TxnId};
use crate::transaction::wal::codec::{CodecError, RecordReader, RecordWriter, Result};

/// Types of log records supported by the WAL system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    TxnBegin,
    TxnCommit,
    TxnAbort,
    TxnPrepare,
    /// Links a committed child transaction into its parent's chain
    TxnChild,
    Checkpoint,
    FileOpen,
    FileClose,
    PageAlloc,
    PageFree,
    GroupAlloc,
    ItemInsert,
    ItemDelete,
    ItemReplace,
    PageSplit,
    PageMerge,
}

impl RecordType {
    pub fn to_tag(self) -> u32 {
        match self {
            RecordType::TxnBegin => 1,
            RecordType::TxnCommit => 2,
            RecordType::TxnAbort => 3,
            RecordType::TxnPrepare => 4,
            RecordType::TxnChild => 5,
            RecordType::Checkpoint => 10,
            RecordType::FileOpen => 20,
            RecordType::FileClose => 21,
            RecordType::PageAlloc => 40,
            RecordType::PageFree => 41,
            RecordType::GroupAlloc => 42,
            RecordType::ItemInsert => 50,
            RecordType::ItemDelete => 51,
            RecordType::ItemReplace => 52,
            RecordType::PageSplit => 60,
            RecordType::PageMerge => 61,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(RecordType::TxnBegin),
            2 => Some(RecordType::TxnCommit),
            3 => Some(RecordType::TxnAbort),
            4 => Some(RecordType::TxnPrepare),
            5 => Some(RecordType::TxnChild),
            10 => Some(RecordType::Checkpoint),
            20 => Some(RecordType::FileOpen),
            21 => Some(RecordType::FileClose),
            40 => Some(RecordType::PageAlloc),
            41 => Some(RecordType::PageFree),
            42 => Some(RecordType::GroupAlloc),
            50 => Some(RecordType::ItemInsert),
            51 => Some(RecordType::ItemDelete),
            52 => Some(RecordType::ItemReplace),
            60 => Some(RecordType::PageSplit),
            61 => Some(RecordType::PageMerge),
            _ => None,
        }
    }
}

/// A logical file named by a checkpoint or file-open record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFileRef<'a> {
    pub file_id: FileId,
    pub path: &'a str,
}

/// Operation-specific payload, one variant per record type. Optional
/// LSN fields use `Lsn::ZERO` for "absent"; they are always present in
/// the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload<'a> {
    TxnBegin {
        timestamp: u64,
    },
    TxnCommit {
        timestamp: u64,
    },
    TxnAbort {
        timestamp: u64,
    },
    TxnPrepare,
    TxnChild {
        child: TxnId,
        /// Last LSN of the child's own record chain
        child_lsn: Lsn,
    },
    Checkpoint {
        /// LSN of the previous checkpoint; ZERO for the first one
        last_ckp: Lsn,
        timestamp: u64,
        open_files: Vec<OpenFileRef<'a>>,
    },
    FileOpen {
        file_id: FileId,
        path: &'a str,
    },
    FileClose {
        file_id: FileId,
    },
    PageAlloc {
        pgno: PageId,
        /// Page LSN before the allocation took effect
        page_lsn: Lsn,
        ptype: u32,
    },
    PageFree {
        pgno: PageId,
        page_lsn: Lsn,
        /// Page type before the free, for undo
        ptype: u32,
        /// Item image of the page as it was freed
        image: &'a [u8],
    },
    GroupAlloc {
        meta_pgno: PageId,
        meta_lsn: Lsn,
        start_pgno: PageId,
        count: u32,
    },
    ItemInsert {
        pgno: PageId,
        page_lsn: Lsn,
        indx: u32,
        key: &'a [u8],
        data: &'a [u8],
    },
    ItemDelete {
        pgno: PageId,
        page_lsn: Lsn,
        indx: u32,
        key: &'a [u8],
        data: &'a [u8],
    },
    ItemReplace {
        pgno: PageId,
        page_lsn: Lsn,
        indx: u32,
        before: &'a [u8],
        after: &'a [u8],
    },
    PageSplit {
        left_pgno: PageId,
        left_lsn: Lsn,
        right_pgno: PageId,
        /// Right page LSN before the split; ZERO for a fresh page
        right_lsn: Lsn,
        indx: u32,
        /// Pre-split item image of the left page
        image: &'a [u8],
    },
    PageMerge {
        /// The higher-numbered page being collapsed away
        from_pgno: PageId,
        from_lsn: Lsn,
        /// The surviving page
        to_pgno: PageId,
        to_lsn: Lsn,
        /// Item image of the page being collapsed
        image: &'a [u8],
    },
}

impl RecordPayload<'_> {
    pub fn rec_type(&self) -> RecordType {
        match self {
            RecordPayload::TxnBegin { .. } => RecordType::TxnBegin,
            RecordPayload::TxnCommit { .. } => RecordType::TxnCommit,
            RecordPayload::TxnAbort { .. } => RecordType::TxnAbort,
            RecordPayload::TxnPrepare => RecordType::TxnPrepare,
            RecordPayload::TxnChild { .. } => RecordType::TxnChild,
            RecordPayload::Checkpoint { .. } => RecordType::Checkpoint,
            RecordPayload::FileOpen { .. } => RecordType::FileOpen,
            RecordPayload::FileClose { .. } => RecordType::FileClose,
            RecordPayload::PageAlloc { .. } => RecordType::PageAlloc,
            RecordPayload::PageFree { .. } => RecordType::PageFree,
            RecordPayload::GroupAlloc { .. } => RecordType::GroupAlloc,
            RecordPayload::ItemInsert { .. } => RecordType::ItemInsert,
            RecordPayload::ItemDelete { .. } => RecordType::ItemDelete,
            RecordPayload::ItemReplace { .. } => RecordType::ItemReplace,
            RecordPayload::PageSplit { .. } => RecordType::PageSplit,
            RecordPayload::PageMerge { .. } => RecordType::PageMerge,
        }
    }
}

/// A decoded log record. The LSN is not part of the record body; the
/// log store derives it from the record's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecordView<'a> {
    pub rec_type: RecordType,
    /// Owning transaction, 0 if none (checkpoint, file ops)
    pub txn_id: TxnId,
    /// Previous record of the same transaction, ZERO at chain start
    pub prev_lsn: Lsn,
    pub payload: RecordPayload<'a>,
}

/// Encode a log record body.
pub fn encode(txn_id: TxnId, prev_lsn: Lsn, payload: &RecordPayload<'_>) -> Vec<u8> {
    let mut w = RecordWriter::new();
    w.put_u32(payload.rec_type().to_tag());
    w.put_u32(txn_id);
    w.put_lsn(prev_lsn);

    match payload {
        RecordPayload::TxnBegin { timestamp }
        | RecordPayload::TxnCommit { timestamp }
        | RecordPayload::TxnAbort { timestamp } => {
            w.put_u64(*timestamp);
        }
        RecordPayload::TxnPrepare => {}
        RecordPayload::TxnChild { child, child_lsn } => {
            w.put_u32(*child);
            w.put_lsn(*child_lsn);
        }
        RecordPayload::Checkpoint { last_ckp, timestamp, open_files } => {
            w.put_lsn(*last_ckp);
            w.put_u64(*timestamp);
            w.put_u32(open_files.len() as u32);
            for f in open_files {
                w.put_u32(f.file_id);
                w.put_bytes(f.path.as_bytes());
            }
        }
        RecordPayload::FileOpen { file_id, path } => {
            w.put_u32(*file_id);
            w.put_bytes(path.as_bytes());
        }
        RecordPayload::FileClose { file_id } => {
            w.put_u32(*file_id);
        }
        RecordPayload::PageAlloc { pgno, page_lsn, ptype } => {
            w.put_u32(*pgno);
            w.put_lsn(*page_lsn);
            w.put_u32(*ptype);
        }
        RecordPayload::PageFree { pgno, page_lsn, ptype, image } => {
            w.put_u32(*pgno);
            w.put_lsn(*page_lsn);
            w.put_u32(*ptype);
            w.put_bytes(image);
        }
        RecordPayload::GroupAlloc { meta_pgno, meta_lsn, start_pgno, count } => {
            w.put_u32(*meta_pgno);
            w.put_lsn(*meta_lsn);
            w.put_u32(*start_pgno);
            w.put_u32(*count);
        }
        RecordPayload::ItemInsert { pgno, page_lsn, indx, key, data }
        | RecordPayload::ItemDelete { pgno, page_lsn, indx, key, data } => {
            w.put_u32(*pgno);
            w.put_lsn(*page_lsn);
            w.put_u32(*indx);
            w.put_bytes(key);
            w.put_bytes(data);
        }
        RecordPayload::ItemReplace { pgno, page_lsn, indx, before, after } => {
            w.put_u32(*pgno);
            w.put_lsn(*page_lsn);
            w.put_u32(*indx);
            w.put_bytes(before);
            w.put_bytes(after);
        }
        RecordPayload::PageSplit { left_pgno, left_lsn, right_pgno, right_lsn, indx, image } => {
            w.put_u32(*left_pgno);
            w.put_lsn(*left_lsn);
            w.put_u32(*right_pgno);
            w.put_lsn(*right_lsn);
            w.put_u32(*indx);
            w.put_bytes(image);
        }
        RecordPayload::PageMerge { from_pgno, from_lsn, to_pgno, to_lsn, image } => {
            w.put_u32(*from_pgno);
            w.put_lsn(*from_lsn);
            w.put_u32(*to_pgno);
            w.put_lsn(*to_lsn);
            w.put_bytes(image);
        }
    }

    w.into_vec()
}

fn get_str<'a>(r: &mut RecordReader<'a>, record: &'static str) -> Result<&'a str> {
    std::str::from_utf8(r.get_bytes()?).map_err(|e| CodecError::InvalidField {
        record,
        detail: format!("path is not utf-8: {e}"),
    })
}

/// Decode a log record body. Variable fields borrow from `buf`.
pub fn decode(buf: &[u8]) -> Result<LogRecordView<'_>> {
    let mut r = RecordReader::new(buf);
    let tag = r.get_u32()?;
    let rec_type = RecordType::from_tag(tag).ok_or(CodecError::UnknownType(tag))?;
    let txn_id = r.get_u32()?;
    let prev_lsn = r.get_lsn()?;

    let payload = match rec_type {
        RecordType::TxnBegin => RecordPayload::TxnBegin { timestamp: r.get_u64()? },
        RecordType::TxnCommit => RecordPayload::TxnCommit { timestamp: r.get_u64()? },
        RecordType::TxnAbort => RecordPayload::TxnAbort { timestamp: r.get_u64()? },
        RecordType::TxnPrepare => RecordPayload::TxnPrepare,
        RecordType::TxnChild => RecordPayload::TxnChild {
            child: r.get_u32()?,
            child_lsn: r.get_lsn()?,
        },
        RecordType::Checkpoint => {
            let last_ckp = r.get_lsn()?;
            let timestamp = r.get_u64()?;
            let count = r.get_u32()? as usize;
            let mut open_files = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let file_id = r.get_u32()?;
                let path = get_str(&mut r, "checkpoint")?;
                open_files.push(OpenFileRef { file_id, path });
            }
            RecordPayload::Checkpoint { last_ckp, timestamp, open_files }
        }
        RecordType::FileOpen => RecordPayload::FileOpen {
            file_id: r.get_u32()?,
            path: get_str(&mut r, "file_open")?,
        },
        RecordType::FileClose => RecordPayload::FileClose { file_id: r.get_u32()? },
        RecordType::PageAlloc => RecordPayload::PageAlloc {
            pgno: r.get_u32()?,
            page_lsn: r.get_lsn()?,
            ptype: r.get_u32()?,
        },
        RecordType::PageFree => RecordPayload::PageFree {
            pgno: r.get_u32()?,
            page_lsn: r.get_lsn()?,
            ptype: r.get_u32()?,
            image: r.get_bytes()?,
        },
        RecordType::GroupAlloc => RecordPayload::GroupAlloc {
            meta_pgno: r.get_u32()?,
            meta_lsn: r.get_lsn()?,
            start_pgno: r.get_u32()?,
            count: r.get_u32()?,
        },
        RecordType::ItemInsert => RecordPayload::ItemInsert {
            pgno: r.get_u32()?,
            page_lsn: r.get_lsn()?,
            indx: r.get_u32()?,
            key: r.get_bytes()?,
            data: r.get_bytes()?,
        },
        RecordType::ItemDelete => RecordPayload::ItemDelete {
            pgno: r.get_u32()?,
            page_lsn: r.get_lsn()?,
            indx: r.get_u32()?,
            key: r.get_bytes()?,
            data: r.get_bytes()?,
        },
        RecordType::ItemReplace => RecordPayload::ItemReplace {
            pgno: r.get_u32()?,
            page_lsn: r.get_lsn()?,
            indx: r.get_u32()?,
            before: r.get_bytes()?,
            after: r.get_bytes()?,
        },
        RecordType::PageSplit => RecordPayload::PageSplit {
            left_pgno: r.get_u32()?,
            left_lsn: r.get_lsn()?,
            right_pgno: r.get_u32()?,
            right_lsn: r.get_lsn()?,
            indx: r.get_u32()?,
            image: r.get_bytes()?,
        },
        RecordType::PageMerge => RecordPayload::PageMerge {
            from_pgno: r.get_u32()?,
            from_lsn: r.get_lsn()?,
            to_pgno: r.get_u32()?,
            to_lsn: r.get_lsn()?,
            image: r.get_bytes()?,
        },
    };

    r.finish()?;
    Ok(LogRecordView { rec_type, txn_id, prev_lsn, payload })
}
