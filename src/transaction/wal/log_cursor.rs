// Positioned traversal over the log store.
//
// Mirrors the classic get-with-flag interface: first, last, next, prev
// and set. Underlying segments are opened lazily by the store and cached
// one at a time, so sequential scans in either direction do not reopen
// files per record.

use crate::common::types::Lsn;
use crate::transaction::wal::log_store::{LogStore, Result};

/// Positioning request for a log read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPos {
    First,
    Last,
    Next,
    Prev,
    Set(Lsn),
}

/// A cursor over log records. `get` returns the record's LSN and its
/// payload bytes; decode with `log_record::decode`.
pub struct LogCursor<'a> {
    store: &'a LogStore,
    pos: Option<Lsn>,
}

impl<'a> LogCursor<'a> {
    pub fn new(store: &'a LogStore) -> Self {
        Self { store, pos: None }
    }

    /// Current position, if the cursor is on a record.
    pub fn pos(&self) -> Option<Lsn> {
        self.pos
    }

    /// Position per `seek` and read the record there. `NotFound` from
    /// `Next`/`Prev` leaves the cursor where it was, so a scan can stop
    /// at either end and turn around.
    pub fn get(&mut self, seek: SeekPos) -> Result<(Lsn, Vec<u8>)> {
        let target = match seek {
            SeekPos::First => self.store.first_lsn()?,
            SeekPos::Last => self.store.last_lsn()?,
            SeekPos::Set(lsn) => lsn,
            SeekPos::Next => {
                let cur = self.pos.map_or_else(|| self.store.first_lsn(), Ok)?;
                if self.pos.is_some() {
                    self.store.next_lsn(cur)?
                } else {
                    cur
                }
            }
            SeekPos::Prev => {
                let cur = self.pos.map_or_else(|| self.store.last_lsn(), Ok)?;
                if self.pos.is_some() {
                    self.store.prev_lsn(cur)?
                } else {
                    cur
                }
            }
        };
        let payload = self.store.read_record(target)?;
        self.pos = Some(target);
        Ok((target, payload))
    }
}
