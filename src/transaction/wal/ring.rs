// Bounded in-memory log backend.
//
// Instead of segment files there is one byte-budgeted ring of frames,
// organized as virtual segments so that LSN addressing is identical to
// disk mode: a table tracks where each virtual segment starts, and
// retrieval maps an LSN to a ring slot instead of file I/O. Space is
// reclaimed a whole virtual segment at a time, and never past the oldest
// LSN an active transaction might still need.

use std::collections::VecDeque;

use thiserror::Error;

use crate::common::types::Lsn;
use crate::transaction::wal::segment::{frame_size, SEGMENT_HEADER_SIZE};

/// Error type for the in-memory log
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("in-memory log buffer full: {needed} bytes needed, {reclaimable} reclaimable")]
    BufferFull { needed: usize, reclaimable: usize },
}

/// Result type for the in-memory log
pub type Result<T> = std::result::Result<T, RingError>;

#[derive(Debug)]
struct MemFrame {
    /// Offset within the virtual segment, mirroring disk addressing
    offset: u32,
    prev_len: u32,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct VirtualSegment {
    file: u32,
    frames: Vec<MemFrame>,
    /// Next append offset within this segment
    used: u32,
    /// Bytes this segment charges against the ring capacity
    bytes: usize,
}

impl VirtualSegment {
    fn new(file: u32) -> Self {
        Self { file, frames: Vec::new(), used: SEGMENT_HEADER_SIZE, bytes: 0 }
    }
}

/// Frame lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingFrame {
    pub payload: Vec<u8>,
    pub prev_len: u32,
    pub next_offset: u32,
}

pub struct RingLog {
    capacity: usize,
    used_bytes: usize,
    segment_size: u32,
    segments: VecDeque<VirtualSegment>,
}

impl RingLog {
    pub fn new(capacity: usize, segment_size: u32) -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(VirtualSegment::new(1));
        Self { capacity, used_bytes: 0, segment_size, segments }
    }

    fn segment(&self, file: u32) -> Option<&VirtualSegment> {
        // Files are contiguous; index from the front.
        let front = self.segments.front()?.file;
        if file < front {
            return None;
        }
        self.segments.get((file - front) as usize)
    }

    /// Append a record payload, rotating virtual segments at the
    /// configured size and reclaiming old segments when the byte budget
    /// is exhausted. `oldest_needed` is the minimum LSN any active
    /// transaction still references; segments at or past its file are
    /// never reclaimed.
    pub fn append(&mut self, payload: &[u8], oldest_needed: Option<Lsn>) -> Result<Lsn> {
        let size = frame_size(payload.len()) as usize;

        {
            let cur = self.segments.back().expect("ring always has a segment");
            if cur.used + size as u32 > self.segment_size && !cur.frames.is_empty() {
                let next = cur.file + 1;
                self.segments.push_back(VirtualSegment::new(next));
            }
        }

        while self.used_bytes + size > self.capacity {
            let front_file = self.segments.front().map(|s| s.file);
            let back_file = self.segments.back().map(|s| s.file);
            let can_reclaim = match (front_file, back_file) {
                (Some(front), Some(back)) if front < back => {
                    oldest_needed.is_none_or(|lsn| front < lsn.file)
                }
                _ => false,
            };
            if !can_reclaim {
                let limit = match (oldest_needed, back_file) {
                    (Some(lsn), Some(back)) => lsn.file.min(back),
                    (None, Some(back)) => back,
                    _ => 0,
                };
                let reclaimable =
                    self.segments.iter().filter(|s| s.file < limit).map(|s| s.bytes).sum();
                return Err(RingError::BufferFull { needed: size, reclaimable });
            }
            let gone = self.segments.pop_front().expect("checked non-empty");
            self.used_bytes -= gone.bytes;
        }

        let cur = self.segments.back_mut().expect("ring always has a segment");
        let offset = cur.used;
        let prev_len = cur.frames.last().map_or(0, |f| f.payload.len() as u32);
        cur.frames.push(MemFrame { offset, prev_len, payload: payload.to_vec() });
        cur.used += size as u32;
        cur.bytes += size;
        self.used_bytes += size;

        Ok(Lsn::new(cur.file, offset))
    }

    /// Map an LSN to its ring slot.
    pub fn frame(&self, lsn: Lsn) -> Option<RingFrame> {
        let seg = self.segment(lsn.file)?;
        let idx = seg.frames.binary_search_by_key(&lsn.offset, |f| f.offset).ok()?;
        let f = &seg.frames[idx];
        Some(RingFrame {
            payload: f.payload.clone(),
            prev_len: f.prev_len,
            next_offset: f.offset + frame_size(f.payload.len()),
        })
    }

    /// Oldest and newest virtual segment file indexes.
    pub fn file_range(&self) -> (u32, u32) {
        let first = self.segments.front().map_or(1, |s| s.file);
        let last = self.segments.back().map_or(1, |s| s.file);
        (first, last)
    }

    pub fn first_frame_of(&self, file: u32) -> Option<Lsn> {
        let seg = self.segment(file)?;
        seg.frames.first().map(|f| Lsn::new(file, f.offset))
    }

    pub fn last_frame_of(&self, file: u32) -> Option<Lsn> {
        let seg = self.segment(file)?;
        seg.frames.last().map(|f| Lsn::new(file, f.offset))
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}
