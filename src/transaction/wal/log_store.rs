// Append-only, checksummed log store.
//
// Records are addressed by (segment file, byte offset) LSNs. Disk mode
// keeps numbered segment files and a write buffer with a durable /
// buffered LSN split; in-memory mode delegates to the virtual-segment
// ring. Rotation, segment discovery, version checking and torn-tail
// handling all live here.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::Lsn;
use crate::transaction::wal::ring::{RingError, RingFrame, RingLog};
use crate::transaction::wal::segment::{
    encode_frame, frame_size, parse_frame, FrameParse, SegmentError, SegmentHeader,
    LOG_VERSION, SEGMENT_HEADER_SIZE,
};

/// Error type for log store operations
#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("segment format error: {0}")]
    Segment(#[from] SegmentError),

    #[error("corrupt log at {lsn}: {detail}")]
    Corrupt { lsn: Lsn, detail: String },

    #[error("log buffer full and no space can be reclaimed")]
    BufferFull,

    #[error("no such log record")]
    NotFound,
}

impl From<RingError> for LogStoreError {
    fn from(_: RingError) -> Self {
        LogStoreError::BufferFull
    }
}

/// Result type for log store operations
pub type Result<T> = std::result::Result<T, LogStoreError>;

/// Configuration for the log store
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    /// Directory holding the log segment files
    pub log_dir: PathBuf,

    /// Base name for segment files
    pub base_name: String,

    /// Segment rotation size in bytes
    pub segment_size: u32,

    /// Keep the whole log in one bounded in-memory ring instead of files
    pub in_memory: bool,

    /// Ring capacity in bytes (in-memory mode only)
    pub buffer_capacity: usize,

    /// Sync segment files on flush
    pub force_sync: bool,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            base_name: "taigadb".to_string(),
            segment_size: 10 * 1024 * 1024,
            in_memory: false,
            buffer_capacity: 4 * 1024 * 1024,
            force_sync: true,
        }
    }
}

/// Callback answering "what is the oldest LSN an active transaction
/// might still need", consulted before the ring discards segments.
pub type OldestLsnFn = Box<dyn Fn() -> Option<Lsn> + Send + Sync>;

struct DiskLog {
    /// Readable segment files by index
    paths: BTreeMap<u32, PathBuf>,
    /// Current append segment handle
    file: File,
    cur_file: u32,
    /// Next append offset within the current segment
    cur_offset: u32,
    /// Payload length of the previous frame in the current segment
    last_len: u32,
    /// Encoded frames not yet written out
    buffered: Vec<u8>,
    /// Everything up to here is on disk
    durable: Lsn,
    /// Loaded segment bytes for positioned reads
    read_cache: Option<(u32, Arc<Vec<u8>>)>,
}

enum Backend {
    Disk(DiskLog),
    Memory(RingLog),
}

struct StoreState {
    backend: Backend,
    /// LSN of the most recently appended record, ZERO if none
    last_lsn: Lsn,
}

/// The write-ahead log store.
pub struct LogStore {
    config: LogStoreConfig,
    state: Mutex<StoreState>,
    oldest_hook: Mutex<Option<OldestLsnFn>>,
}

impl LogStore {
    /// Open (or create) the log in the configured directory. Fatal if any
    /// segment was written by a newer format version; segments older than
    /// the readable floor are skipped with a warning.
    pub fn open(config: LogStoreConfig) -> Result<Self> {
        if config.in_memory {
            info!(
                "opening in-memory log, capacity {} bytes, virtual segment size {}",
                config.buffer_capacity, config.segment_size
            );
            let ring = RingLog::new(config.buffer_capacity, config.segment_size);
            return Ok(Self {
                config,
                state: Mutex::new(StoreState { backend: Backend::Memory(ring), last_lsn: Lsn::ZERO }),
                oldest_hook: Mutex::new(None),
            });
        }

        std::fs::create_dir_all(&config.log_dir)?;
        let mut found = find_segment_files(&config.log_dir, &config.base_name)?;
        found.sort_by_key(|(seq, _)| *seq);

        let mut paths = BTreeMap::new();
        let mut max_seq_seen = 0u32;
        let mut newest_version = 0u32;
        for (seq, path) in found {
            max_seq_seen = max_seq_seen.max(seq);
            let mut f = File::open(&path)?;
            let header = SegmentHeader::read_from(&mut f)?;
            match header.check() {
                Ok(()) => {
                    newest_version = header.version;
                    paths.insert(seq, path);
                }
                Err(SegmentError::VersionObsolete(v)) => {
                    warn!("skipping log segment {}: obsolete version {}", path.display(), v);
                }
                Err(SegmentError::BadMagic(m)) => {
                    warn!("ignoring {}: bad magic {:#x}", path.display(), m);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Only keep appending to the newest segment if it is actually the
        // newest file on disk and carries the current format version; a
        // readable old-version segment stays read-only behind us.
        let continue_last = paths
            .last_key_value()
            .map(|(seq, _)| *seq == max_seq_seen && newest_version == LOG_VERSION)
            .unwrap_or(false);

        let (disk, last_lsn) = if continue_last {
            let (&cur_file, path) = paths.last_key_value().expect("non-empty");
            let bytes = std::fs::read(path)?;
            let scan = scan_segment(&bytes)?;
            if scan.torn_tail {
                warn!(
                    "log segment {} has an incomplete tail; resuming at offset {}",
                    path.display(),
                    scan.end_offset
                );
            }
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            // Drop torn bytes so the next frame lands on a clean tail.
            file.set_len(scan.end_offset as u64)?;
            file.seek(SeekFrom::Start(scan.end_offset as u64))?;

            let mut last_lsn = match scan.last_frame {
                Some((offset, _)) => Lsn::new(cur_file, offset),
                None => Lsn::ZERO,
            };
            if last_lsn.is_zero() {
                // Current segment is empty; the newest record, if any,
                // sits in an earlier segment.
                for (&seq, p) in paths.range(..cur_file).rev() {
                    let bytes = std::fs::read(p)?;
                    if let Some((offset, _)) = scan_segment(&bytes)?.last_frame {
                        last_lsn = Lsn::new(seq, offset);
                        break;
                    }
                }
            }

            let disk = DiskLog {
                paths,
                file,
                cur_file,
                cur_offset: scan.end_offset,
                last_len: scan.last_frame.map_or(0, |(_, len)| len),
                buffered: Vec::new(),
                durable: Lsn::new(cur_file, scan.end_offset),
                read_cache: None,
            };
            (disk, last_lsn)
        } else {
            // Fresh log, or the newest file on disk is unreadable: start
            // a new segment past everything we have seen.
            let cur_file = max_seq_seen + 1;
            let path = segment_path(&config.log_dir, &config.base_name, cur_file);
            let file = create_segment(&path, config.segment_size)?;
            paths.insert(cur_file, path);
            let disk = DiskLog {
                paths,
                file,
                cur_file,
                cur_offset: SEGMENT_HEADER_SIZE,
                last_len: 0,
                buffered: Vec::new(),
                durable: Lsn::new(cur_file, SEGMENT_HEADER_SIZE),
                read_cache: None,
            };
            (disk, Lsn::ZERO)
        };

        info!(
            "log open: current segment {}, next offset {}",
            disk.cur_file, disk.cur_offset
        );
        Ok(Self {
            config,
            state: Mutex::new(StoreState { backend: Backend::Disk(disk), last_lsn }),
            oldest_hook: Mutex::new(None),
        })
    }

    /// Register the oldest-active-LSN callback used for in-memory space
    /// reclamation.
    pub fn set_oldest_lsn_hook(&self, hook: OldestLsnFn) {
        *self.oldest_hook.lock() = Some(hook);
    }

    pub fn config(&self) -> &LogStoreConfig {
        &self.config
    }

    /// Append a record payload and return its LSN. LSNs are assigned
    /// under the store lock, so they are strictly increasing across
    /// concurrent appenders.
    pub fn append(&self, payload: &[u8]) -> Result<Lsn> {
        let mut state = self.state.lock();
        let lsn = match &mut state.backend {
            Backend::Memory(ring) => {
                let oldest = self.oldest_hook.lock().as_ref().and_then(|f| f());
                ring.append(payload, oldest)?
            }
            Backend::Disk(disk) => {
                let size = frame_size(payload.len());
                let fits = disk.cur_offset.saturating_add(size) <= self.config.segment_size;
                if !fits && disk.cur_offset > SEGMENT_HEADER_SIZE {
                    Self::rotate(disk, &self.config)?;
                }
                let frame = encode_frame(payload, disk.last_len);
                let lsn = Lsn::new(disk.cur_file, disk.cur_offset);
                disk.buffered.extend_from_slice(&frame);
                disk.cur_offset += frame.len() as u32;
                disk.last_len = payload.len() as u32;
                lsn
            }
        };
        state.last_lsn = lsn;
        Ok(lsn)
    }

    fn rotate(disk: &mut DiskLog, config: &LogStoreConfig) -> Result<()> {
        Self::flush_disk(disk, config)?;
        let next = disk.cur_file + 1;
        let path = segment_path(&config.log_dir, &config.base_name, next);
        debug!("rotating log to segment {}", next);
        disk.file = create_segment(&path, config.segment_size)?;
        disk.paths.insert(next, path);
        disk.cur_file = next;
        disk.cur_offset = SEGMENT_HEADER_SIZE;
        disk.last_len = 0;
        Ok(())
    }

    fn flush_disk(disk: &mut DiskLog, config: &LogStoreConfig) -> Result<()> {
        if disk.buffered.is_empty() {
            return Ok(());
        }
        let write_pos = disk.cur_offset as u64 - disk.buffered.len() as u64;
        disk.file.seek(SeekFrom::Start(write_pos))?;
        disk.file.write_all(&disk.buffered)?;
        if config.force_sync {
            disk.file.sync_data()?;
        }
        disk.buffered.clear();
        disk.durable = Lsn::new(disk.cur_file, disk.cur_offset); // end of durable bytes
        if let Some((cached_file, _)) = disk.read_cache {
            if cached_file == disk.cur_file {
                disk.read_cache = None;
            }
        }
        Ok(())
    }

    /// Force durability up to `up_to` (or everything, if `None`).
    pub fn flush(&self, up_to: Option<Lsn>) -> Result<()> {
        let mut state = self.state.lock();
        match &mut state.backend {
            Backend::Memory(_) => Ok(()), // nothing to persist
            Backend::Disk(disk) => {
                if let Some(target) = up_to {
                    if disk.durable > target {
                        return Ok(());
                    }
                }
                Self::flush_disk(disk, &self.config)
            }
        }
    }

    /// End of the durable region; records at or past this LSN may still
    /// be in the write buffer.
    pub fn durable_lsn(&self) -> Lsn {
        let state = self.state.lock();
        match &state.backend {
            Backend::Memory(_) => state.last_lsn,
            Backend::Disk(disk) => disk.durable,
        }
    }

    /// LSN of the most recently appended record; ZERO for an empty log.
    pub fn last_appended(&self) -> Lsn {
        self.state.lock().last_lsn
    }

    /// Delete segment files wholly before `before`, e.g. after a
    /// checkpoint made them unnecessary for recovery.
    pub fn remove_obsolete(&self, before: Lsn) -> Result<usize> {
        let mut state = self.state.lock();
        match &mut state.backend {
            Backend::Memory(_) => Ok(0), // the ring reclaims on its own
            Backend::Disk(disk) => {
                let victims: Vec<u32> = disk
                    .paths
                    .range(..before.file)
                    .map(|(seq, _)| *seq)
                    .filter(|seq| *seq != disk.cur_file)
                    .collect();
                let mut removed = 0;
                for seq in victims {
                    if let Some(path) = disk.paths.remove(&seq) {
                        std::fs::remove_file(&path)?;
                        info!("archived log segment {}", path.display());
                        removed += 1;
                    }
                }
                Ok(removed)
            }
        }
    }

    // -- positioned reads ------------------------------------------------

    fn load_segment(disk: &mut DiskLog, config: &LogStoreConfig, file: u32) -> Result<Arc<Vec<u8>>> {
        Self::flush_disk(disk, config)?;
        if let Some((cached, bytes)) = &disk.read_cache {
            if *cached == file {
                return Ok(bytes.clone());
            }
        }
        let path = disk.paths.get(&file).ok_or(LogStoreError::NotFound)?;
        let mut f = File::open(path)?;
        let header = SegmentHeader::read_from(&mut f)?;
        header.check()?;
        let mut bytes = Vec::with_capacity(SEGMENT_HEADER_SIZE as usize);
        header.write_to(&mut bytes)?;
        f.read_to_end(&mut bytes)?;
        let bytes = Arc::new(bytes);
        disk.read_cache = Some((file, bytes.clone()));
        Ok(bytes)
    }

    fn disk_frame_at(disk: &mut DiskLog, config: &LogStoreConfig, lsn: Lsn) -> Result<RingFrame> {
        let bytes = Self::load_segment(disk, config, lsn.file)?;
        match parse_frame(&bytes, lsn.offset) {
            FrameParse::Record { payload, prev_len, next_offset } => Ok(RingFrame {
                payload: payload.to_vec(),
                prev_len,
                next_offset,
            }),
            FrameParse::End => Err(LogStoreError::NotFound),
            FrameParse::Torn if lsn.file == disk.cur_file => Err(LogStoreError::NotFound),
            FrameParse::Torn => Err(LogStoreError::Corrupt {
                lsn,
                detail: "invalid frame in the middle of the log".to_string(),
            }),
        }
    }

    fn frame_at(state: &mut StoreState, config: &LogStoreConfig, lsn: Lsn) -> Result<RingFrame> {
        match &mut state.backend {
            Backend::Memory(ring) => ring.frame(lsn).ok_or(LogStoreError::NotFound),
            Backend::Disk(disk) => Self::disk_frame_at(disk, config, lsn),
        }
    }

    /// Read the record payload at `lsn`.
    pub fn read_record(&self, lsn: Lsn) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        Ok(Self::frame_at(&mut state, &self.config, lsn)?.payload)
    }

    fn file_range(state: &mut StoreState) -> (u32, u32) {
        match &state.backend {
            Backend::Memory(ring) => ring.file_range(),
            Backend::Disk(disk) => {
                let first = disk.paths.keys().next().copied().unwrap_or(disk.cur_file);
                (first, disk.cur_file)
            }
        }
    }

    fn first_frame_of(state: &mut StoreState, config: &LogStoreConfig, file: u32) -> Result<Option<Lsn>> {
        match &mut state.backend {
            Backend::Memory(ring) => Ok(ring.first_frame_of(file)),
            Backend::Disk(disk) => {
                if !disk.paths.contains_key(&file) {
                    return Ok(None);
                }
                let bytes = Self::load_segment(disk, config, file)?;
                match parse_frame(&bytes, SEGMENT_HEADER_SIZE) {
                    FrameParse::Record { .. } => Ok(Some(Lsn::new(file, SEGMENT_HEADER_SIZE))),
                    _ => Ok(None),
                }
            }
        }
    }

    fn last_frame_of(state: &mut StoreState, config: &LogStoreConfig, file: u32) -> Result<Option<Lsn>> {
        match &mut state.backend {
            Backend::Memory(ring) => Ok(ring.last_frame_of(file)),
            Backend::Disk(disk) => {
                if !disk.paths.contains_key(&file) {
                    return Ok(None);
                }
                let bytes = Self::load_segment(disk, config, file)?;
                Ok(scan_segment(&bytes)?.last_frame.map(|(offset, _)| Lsn::new(file, offset)))
            }
        }
    }

    /// LSN of the first record in the log, `NotFound` if empty.
    pub fn first_lsn(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        let (first, last) = Self::file_range(&mut state);
        for file in first..=last {
            if let Some(lsn) = Self::first_frame_of(&mut state, &self.config, file)? {
                return Ok(lsn);
            }
        }
        Err(LogStoreError::NotFound)
    }

    /// LSN of the last record in the log, `NotFound` if empty.
    pub fn last_lsn(&self) -> Result<Lsn> {
        let state = self.state.lock();
        if state.last_lsn.is_zero() {
            return Err(LogStoreError::NotFound);
        }
        Ok(state.last_lsn)
    }

    /// LSN of the record after `cur`, `NotFound` at end of log.
    pub fn next_lsn(&self, cur: Lsn) -> Result<Lsn> {
        let mut state = self.state.lock();
        let frame = Self::frame_at(&mut state, &self.config, cur)?;
        let candidate = Lsn::new(cur.file, frame.next_offset);
        match Self::frame_at(&mut state, &self.config, candidate) {
            Ok(_) => return Ok(candidate),
            Err(LogStoreError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let (_, last) = Self::file_range(&mut state);
        for file in cur.file + 1..=last {
            if let Some(lsn) = Self::first_frame_of(&mut state, &self.config, file)? {
                return Ok(lsn);
            }
        }
        Err(LogStoreError::NotFound)
    }

    /// LSN of the record before `cur`, `NotFound` at start of log.
    pub fn prev_lsn(&self, cur: Lsn) -> Result<Lsn> {
        let mut state = self.state.lock();
        let frame = Self::frame_at(&mut state, &self.config, cur)?;
        if cur.offset > SEGMENT_HEADER_SIZE {
            return Ok(Lsn::new(cur.file, cur.offset - frame_size(frame.prev_len as usize)));
        }
        let (first, _) = Self::file_range(&mut state);
        for file in (first..cur.file).rev() {
            if let Some(lsn) = Self::last_frame_of(&mut state, &self.config, file)? {
                return Ok(lsn);
            }
        }
        Err(LogStoreError::NotFound)
    }
}

struct SegmentScan {
    /// Offset and payload length of the last valid frame
    last_frame: Option<(u32, u32)>,
    /// Offset one past the last valid frame
    end_offset: u32,
    torn_tail: bool,
}

fn scan_segment(bytes: &[u8]) -> Result<SegmentScan> {
    let mut offset = SEGMENT_HEADER_SIZE;
    let mut last_frame = None;
    let mut torn_tail = false;
    loop {
        match parse_frame(bytes, offset) {
            FrameParse::Record { payload, next_offset, .. } => {
                last_frame = Some((offset, payload.len() as u32));
                offset = next_offset;
            }
            FrameParse::End => break,
            FrameParse::Torn => {
                torn_tail = true;
                break;
            }
        }
    }
    Ok(SegmentScan { last_frame, end_offset: offset, torn_tail })
}

fn segment_path(dir: &Path, base: &str, seq: u32) -> PathBuf {
    dir.join(format!("{base}.{seq:010}"))
}

fn create_segment(path: &Path, segment_size: u32) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    SegmentHeader::new(segment_size).write_to(&mut file)?;
    file.sync_data()?;
    Ok(file)
}

fn find_segment_files(dir: &Path, base: &str) -> Result<Vec<(u32, PathBuf)>> {
    let mut result = Vec::new();
    if !dir.exists() {
        return Ok(result);
    }
    let prefix = format!("{base}.");
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if let Ok(seq) = suffix.parse::<u32>() {
                result.push((seq, path));
            }
        }
    }
    Ok(result)
}
