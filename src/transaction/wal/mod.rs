// Write-ahead log: record codec, segment format, the append/read store
// and positioned cursors over it.

pub mod codec;
pub mod log_cursor;
pub mod log_record;
pub mod log_store;
pub mod ring;
pub mod segment;

pub use log_cursor::{LogCursor, SeekPos};
pub use log_record::{LogRecordView, RecordPayload, RecordType};
pub use log_store::{LogStore, LogStoreConfig, LogStoreError};
