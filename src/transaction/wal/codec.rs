// Generic log record field codec.
//
// Every record on the wire is: fixed header (type tag, txn id, prev-LSN),
// then fixed-size typed fields, then zero or more length-prefixed
// variable buffers. One writer/reader pair drives encoding for every
// record type; there is no per-type serialization code beyond the field
// lists in `log_record.rs`.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::common::types::Lsn;

/// Error type for record encode/decode
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("record truncated at byte {at} (need {need} more)")]
    Truncated { at: usize, need: usize },

    #[error("unknown record type tag {0}")]
    UnknownType(u32),

    #[error("invalid field value in {record}: {detail}")]
    InvalidField { record: &'static str, detail: String },

    #[error("{0} trailing bytes after record payload")]
    TrailingBytes(usize),
}

/// Result type for record encode/decode
pub type Result<T> = std::result::Result<T, CodecError>;

/// Append-only field writer.
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut scratch = [0u8; 4];
        LittleEndian::write_u32(&mut scratch, v);
        self.buf.extend_from_slice(&scratch);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut scratch = [0u8; 8];
        LittleEndian::write_u64(&mut scratch, v);
        self.buf.extend_from_slice(&scratch);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    /// An absent optional LSN is written as the zero-filled sentinel,
    /// never omitted from the byte stream.
    pub fn put_lsn(&mut self, lsn: Lsn) {
        self.put_u32(lsn.file);
        self.put_u32(lsn.offset);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for RecordWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequential field reader over a caller-owned buffer. Variable buffers
/// are returned as slices into that buffer: decoding copies nothing, so
/// decoded records must not outlive the buffer they came from.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated {
                at: self.pos,
                need: self.pos + n - self.buf.len(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_lsn(&mut self) -> Result<Lsn> {
        let file = self.get_u32()?;
        let offset = self.get_u32()?;
        Ok(Lsn::new(file, offset))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// All fields of a record must be consumed; trailing garbage means a
    /// codec/schema mismatch and is treated as corruption.
    pub fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(CodecError::TrailingBytes(self.buf.len() - self.pos));
        }
        Ok(())
    }
}
