// TaigaDB storage engine core: write-ahead logging, crash recovery and
// cursor maintenance.

pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::types::{FileId, Lsn, PageId, TxnId};
pub use index::cursor::{Cursor, CursorPos, CursorRegistry};
pub use storage::buffer::{MemPageCache, PageCache};
pub use storage::lock::{LockManager, LockMode, ResourceId};
pub use storage::page::{Page, PageHandle, PageItem, PageState, PageType};
pub use transaction::manager::TransactionManager;
pub use transaction::recovery::driver::{recover, RecoveryKind, RecoveryOptions, RecoveryReport};
pub use transaction::wal::{LogCursor, LogStore, LogStoreConfig, RecordPayload, SeekPos};
