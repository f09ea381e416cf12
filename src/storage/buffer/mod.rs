// Page cache collaborator seam.
//
// The recovery core issues fetch / mark dirty / release calls and never
// performs raw file I/O on data pages itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::page::{Page, PageHandle};

/// Error type for page cache operations
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("page {0} not found")]
    PageNotFound(PageId),
}

/// Result type for page cache operations
pub type Result<T> = std::result::Result<T, BufferError>;

/// The interface the recovery core requires of a buffer pool. Handles pin
/// the page until released.
pub trait PageCache: Send + Sync {
    /// Fetch a page, optionally creating it if it does not exist.
    fn fetch(&self, pgno: PageId, create_if_missing: bool) -> Result<PageHandle>;

    /// Record that the caller mutated the page behind the handle.
    fn mark_dirty(&self, pgno: PageId);

    /// Drop the pin taken by `fetch`.
    fn release(&self, handle: PageHandle);
}

/// Hash-map page cache backing recovery runs and tests. Pages live for
/// the lifetime of the cache; eviction is a buffer-pool concern outside
/// this core.
pub struct MemPageCache {
    pages: Mutex<HashMap<PageId, PageHandle>>,
    dirty: Mutex<HashSet<PageId>>,
}

impl MemPageCache {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Install a page with pre-existing contents, e.g. the crash-time
    /// disk state a test wants recovery to start from.
    pub fn install(&self, page: Page) -> PageHandle {
        let pgno = page.page_id;
        let handle: PageHandle = Arc::new(RwLock::new(page));
        self.pages.lock().insert(pgno, handle.clone());
        handle
    }

    pub fn contains(&self, pgno: PageId) -> bool {
        self.pages.lock().contains_key(&pgno)
    }

    /// Page IDs dirtied since the last `take_dirty`, for checkpointing.
    pub fn take_dirty(&self) -> Vec<PageId> {
        let mut dirty = self.dirty.lock();
        let mut ids: Vec<PageId> = dirty.drain().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for MemPageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache for MemPageCache {
    fn fetch(&self, pgno: PageId, create_if_missing: bool) -> Result<PageHandle> {
        let mut pages = self.pages.lock();
        if let Some(handle) = pages.get(&pgno) {
            return Ok(handle.clone());
        }
        if !create_if_missing {
            return Err(BufferError::PageNotFound(pgno));
        }
        let handle: PageHandle = Arc::new(RwLock::new(Page::new(pgno)));
        pages.insert(pgno, handle.clone());
        Ok(handle)
    }

    fn mark_dirty(&self, pgno: PageId) {
        self.dirty.lock().insert(pgno);
    }

    fn release(&self, handle: PageHandle) {
        drop(handle);
    }
}
