// Logical page model.
//
// The recovery core never interprets the on-disk byte layout of access
// method pages; it sees a page as an ordered list of items plus the LSN
// stamp the redo/undo protocol compares against.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use thiserror::Error;

use crate::common::types::{Lsn, PageId};

/// Error type for page operations
#[derive(Error, Debug)]
pub enum PageError {
    #[error("item index {indx} out of range on page {pgno} (len {len})")]
    IndexOutOfRange { pgno: PageId, indx: u32, len: usize },

    #[error("bad page image: {0}")]
    BadImage(String),
}

/// Result type for page operations
pub type Result<T> = std::result::Result<T, PageError>;

/// What kind of page an allocation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Meta,
    Internal,
    Leaf,
    Duplicate,
    Overflow,
}

impl PageType {
    pub fn to_tag(self) -> u32 {
        match self {
            PageType::Meta => 1,
            PageType::Internal => 2,
            PageType::Leaf => 3,
            PageType::Duplicate => 4,
            PageType::Overflow => 5,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(PageType::Meta),
            2 => Some(PageType::Internal),
            3 => Some(PageType::Leaf),
            4 => Some(PageType::Duplicate),
            5 => Some(PageType::Overflow),
            _ => None,
        }
    }
}

/// Allocation state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Free,
    Allocated(PageType),
}

/// One key/data item on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageItem {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

/// A page as seen by the recovery core: an item list plus the page-LSN
/// stamp. The stamp is the LSN of the last log record whose effect is
/// reflected on the page; it only moves backward during explicit undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub page_id: PageId,
    pub lsn: Lsn,
    pub state: PageState,
    pub items: Vec<PageItem>,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            lsn: Lsn::ZERO,
            state: PageState::Free,
            items: Vec::new(),
        }
    }

    pub fn insert_item(&mut self, indx: u32, item: PageItem) -> Result<()> {
        let indx = indx as usize;
        if indx > self.items.len() {
            return Err(PageError::IndexOutOfRange {
                pgno: self.page_id,
                indx: indx as u32,
                len: self.items.len(),
            });
        }
        self.items.insert(indx, item);
        Ok(())
    }

    pub fn remove_item(&mut self, indx: u32) -> Result<PageItem> {
        let i = indx as usize;
        if i >= self.items.len() {
            return Err(PageError::IndexOutOfRange {
                pgno: self.page_id,
                indx,
                len: self.items.len(),
            });
        }
        Ok(self.items.remove(i))
    }

    pub fn item(&self, indx: u32) -> Result<&PageItem> {
        self.items.get(indx as usize).ok_or(PageError::IndexOutOfRange {
            pgno: self.page_id,
            indx,
            len: self.items.len(),
        })
    }

    pub fn replace_data(&mut self, indx: u32, data: Vec<u8>) -> Result<Vec<u8>> {
        let len = self.items.len();
        let item = self
            .items
            .get_mut(indx as usize)
            .ok_or(PageError::IndexOutOfRange { pgno: self.page_id, indx, len })?;
        Ok(std::mem::replace(&mut item.data, data))
    }

    /// Serialize the item list into a before/after page image for a log
    /// record. The image is self-contained and position independent.
    pub fn encode_image(&self) -> Vec<u8> {
        encode_items(&self.items)
    }
}

/// Smart pointer to a page, as handed out by the page cache.
pub type PageHandle = Arc<RwLock<Page>>;

/// Encode an item list as a page image: item count, then each key and
/// data as a length-prefixed buffer.
pub fn encode_items(items: &[PageItem]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut scratch = [0u8; 4];
    LittleEndian::write_u32(&mut scratch, items.len() as u32);
    buf.extend_from_slice(&scratch);
    for item in items {
        LittleEndian::write_u32(&mut scratch, item.key.len() as u32);
        buf.extend_from_slice(&scratch);
        buf.extend_from_slice(&item.key);
        LittleEndian::write_u32(&mut scratch, item.data.len() as u32);
        buf.extend_from_slice(&scratch);
        buf.extend_from_slice(&item.data);
    }
    buf
}

/// Decode a page image back into an item list.
pub fn decode_items(image: &[u8]) -> Result<Vec<PageItem>> {
    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        if *pos + n > image.len() {
            return Err(PageError::BadImage(format!(
                "truncated at byte {} of {}",
                *pos,
                image.len()
            )));
        }
        let s = &image[*pos..*pos + n];
        *pos += n;
        Ok(s)
    };

    let count = LittleEndian::read_u32(take(&mut pos, 4)?) as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let klen = LittleEndian::read_u32(take(&mut pos, 4)?) as usize;
        let key = take(&mut pos, klen)?.to_vec();
        let dlen = LittleEndian::read_u32(take(&mut pos, 4)?) as usize;
        let data = take(&mut pos, dlen)?.to_vec();
        items.push(PageItem { key, data });
    }
    if pos != image.len() {
        return Err(PageError::BadImage(format!("{} trailing bytes", image.len() - pos)));
    }
    Ok(items)
}
