// On-disk log segment format.
//
// A segment is a persistent header followed by checksummed frames:
//
//   header: magic, format version, segment size
//   frame:  crc32, payload len, previous frame's payload len, payload
//
// An all-zero frame header marks end-of-segment. The `prev_len` field is
// the back-link that makes backward scans possible without an index.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Magic number for log segments: "TGLG" in ASCII
pub const LOG_MAGIC: u32 = 0x54474C47;

/// Current log format version
pub const LOG_VERSION: u32 = 2;

/// Oldest log format version this build can still read
pub const LOG_OLDEST_VERSION: u32 = 1;

/// Size of the persistent segment header in bytes
pub const SEGMENT_HEADER_SIZE: u32 = 12;

/// Size of a frame header in bytes
pub const FRAME_HEADER_SIZE: u32 = 12;

/// Error type for segment format violations
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad segment magic {0:#x}")]
    BadMagic(u32),

    #[error("unsupported log version {0}: written by a newer release")]
    VersionUnsupported(u32),

    #[error("obsolete log version {0}: no longer readable")]
    VersionObsolete(u32),
}

/// Result type for segment operations
pub type Result<T> = std::result::Result<T, SegmentError>;

/// Persistent per-segment header, validated on every open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    /// Configured rotation size when the segment was created
    pub segment_size: u32,
}

impl SegmentHeader {
    pub fn new(segment_size: u32) -> Self {
        Self { magic: LOG_MAGIC, version: LOG_VERSION, segment_size }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.version);
        LittleEndian::write_u32(&mut buf[8..12], self.segment_size);
        w.write_all(&buf)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        r.read_exact(&mut buf)?;
        Ok(Self {
            magic: LittleEndian::read_u32(&buf[0..4]),
            version: LittleEndian::read_u32(&buf[4..8]),
            segment_size: LittleEndian::read_u32(&buf[8..12]),
        })
    }

    /// Version acceptance policy: newer than this build is fatal, older
    /// than the readable floor means the segment is skipped and none of
    /// its persistent settings are trusted.
    pub fn check(&self) -> Result<()> {
        if self.magic != LOG_MAGIC {
            return Err(SegmentError::BadMagic(self.magic));
        }
        if self.version > LOG_VERSION {
            return Err(SegmentError::VersionUnsupported(self.version));
        }
        if self.version < LOG_OLDEST_VERSION {
            return Err(SegmentError::VersionObsolete(self.version));
        }
        Ok(())
    }
}

fn frame_crc(payload: &[u8], prev_len: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    let mut scratch = [0u8; 8];
    LittleEndian::write_u32(&mut scratch[0..4], payload.len() as u32);
    LittleEndian::write_u32(&mut scratch[4..8], prev_len);
    hasher.update(&scratch);
    hasher.update(payload);
    hasher.finalize()
}

/// Encode one frame: checksum header plus payload.
pub fn encode_frame(payload: &[u8], prev_len: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
    let mut hdr = [0u8; FRAME_HEADER_SIZE as usize];
    LittleEndian::write_u32(&mut hdr[0..4], frame_crc(payload, prev_len));
    LittleEndian::write_u32(&mut hdr[4..8], payload.len() as u32);
    LittleEndian::write_u32(&mut hdr[8..12], prev_len);
    buf.extend_from_slice(&hdr);
    buf.extend_from_slice(payload);
    buf
}

/// Total on-disk size of a frame holding `payload_len` bytes.
pub fn frame_size(payload_len: usize) -> u32 {
    FRAME_HEADER_SIZE + payload_len as u32
}

/// Outcome of parsing one frame out of a loaded segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameParse<'a> {
    /// A valid frame
    Record {
        payload: &'a [u8],
        prev_len: u32,
        next_offset: u32,
    },
    /// Clean end of the segment: all-zero header or end of the bytes
    End,
    /// Bytes are present but do not form a valid frame. Tolerated as EOF
    /// at the tail of the newest segment, corruption anywhere else.
    Torn,
}

/// Parse the frame starting at `offset` in a fully loaded segment.
pub fn parse_frame(seg: &[u8], offset: u32) -> FrameParse<'_> {
    let pos = offset as usize;
    if pos >= seg.len() {
        return FrameParse::End;
    }
    if pos + FRAME_HEADER_SIZE as usize > seg.len() {
        return FrameParse::Torn;
    }
    let hdr = &seg[pos..pos + FRAME_HEADER_SIZE as usize];
    if hdr.iter().all(|b| *b == 0) {
        return FrameParse::End;
    }
    let crc = LittleEndian::read_u32(&hdr[0..4]);
    let len = LittleEndian::read_u32(&hdr[4..8]) as usize;
    let prev_len = LittleEndian::read_u32(&hdr[8..12]);

    let body_start = pos + FRAME_HEADER_SIZE as usize;
    if body_start + len > seg.len() {
        return FrameParse::Torn;
    }
    let payload = &seg[body_start..body_start + len];
    if frame_crc(payload, prev_len) != crc {
        return FrameParse::Torn;
    }
    FrameParse::Record {
        payload,
        prev_len,
        next_offset: (body_start + len) as u32,
    }
}
