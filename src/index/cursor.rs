// Cursor adjustment protocol.
//
// Every open cursor on a table lives on one registry. When a mutation
// changes the shape of a page (an item deleted, items shifted, items
// moved to a duplicate page, a split, a reverse split, a replace) the
// mutator rewrites the position of every other cursor so it keeps
// identifying the same logical item. Only cursors in the mutating thread
// of control can be on the page (it is write-locked), so the registry
// lock is a short-lived list lock, not a page lock, and each adjustment
// is O(open cursors).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::PageId;

/// Where a cursor points: a (page, index) slot, optionally an off-page
/// duplicate (page, index), and the deleted flag maintained by delete /
/// overwrite adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPos {
    pub pgno: PageId,
    pub indx: u32,
    /// Set when the item lives on an off-page duplicate page
    pub dup: Option<(PageId, u32)>,
    /// The item this cursor referenced was deleted out from under it
    pub deleted: bool,
}

impl CursorPos {
    pub fn new(pgno: PageId, indx: u32) -> Self {
        Self { pgno, indx, dup: None, deleted: false }
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    cursors: HashMap<u64, CursorPos>,
}

/// The per-table active cursor list.
#[derive(Clone, Default)]
pub struct CursorRegistry {
    inner: Arc<Mutex<Inner>>,
}

/// A registered cursor. Closing is dropping.
pub struct Cursor {
    inner: Arc<Mutex<Inner>>,
    id: u64,
}

impl Cursor {
    /// Snapshot of the current position.
    pub fn pos(&self) -> CursorPos {
        *self.inner.lock().cursors.get(&self.id).expect("cursor outlives registry entry")
    }

    /// Point this cursor somewhere else, clearing the deleted flag.
    pub fn move_to(&self, pgno: PageId, indx: u32) {
        let mut inner = self.inner.lock();
        let pos = inner.cursors.get_mut(&self.id).expect("cursor outlives registry entry");
        *pos = CursorPos::new(pgno, indx);
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.inner.lock().cursors.remove(&self.id);
    }
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cursor at (page, index) and put it on the active list.
    pub fn open(&self, pgno: PageId, indx: u32) -> Cursor {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.cursors.insert(id, CursorPos::new(pgno, indx));
        Cursor { inner: self.inner.clone(), id }
    }

    pub fn open_cursors(&self) -> usize {
        self.inner.lock().cursors.len()
    }

    /// An item was deleted at (page, index), or an already-deleted slot
    /// was overwritten (`set_deleted` false). Cursors whose primary or
    /// duplicate position matches exactly flip their deleted flag.
    /// Returns the number of cursors affected.
    pub fn adjust_delete(&self, pgno: PageId, indx: u32, set_deleted: bool) -> usize {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for pos in inner.cursors.values_mut() {
            let on_primary = pos.pgno == pgno && pos.indx == indx;
            let on_dup = pos.dup == Some((pgno, indx));
            if on_primary || on_dup {
                pos.deleted = set_deleted;
                count += 1;
            }
        }
        count
    }

    /// Items were inserted (or removed) at (page, index): cursors at or
    /// past the point shift by `adjust`.
    pub fn adjust_shift(&self, pgno: PageId, indx: u32, adjust: i32) {
        let mut inner = self.inner.lock();
        for pos in inner.cursors.values_mut() {
            if pos.pgno == pgno && pos.indx >= indx {
                // Cursor indices never go negative.
                debug_assert!(pos.indx != 0 || adjust > 0);
                pos.indx = pos.indx.wrapping_add_signed(adjust);
            }
            if let Some((dpgno, dindx)) = &mut pos.dup {
                if *dpgno == pgno && *dindx >= indx {
                    debug_assert!(*dindx != 0 || adjust > 0);
                    *dindx = dindx.wrapping_add_signed(adjust);
                }
            }
        }
    }

    /// Items at (page, from_indx) moved to an off-page duplicate page.
    /// Matching cursors are repointed to the duplicate slot; cursors
    /// already carrying a duplicate position were relocated by an
    /// earlier call and are left alone, which makes the page-by-page
    /// relocation idempotent per cursor.
    pub fn adjust_to_duplicate(
        &self,
        from_pgno: PageId,
        first: u32,
        from_indx: u32,
        to_pgno: PageId,
        to_indx: u32,
    ) {
        let mut inner = self.inner.lock();
        for pos in inner.cursors.values_mut() {
            if pos.dup.is_none() && pos.pgno == from_pgno && pos.indx == from_indx {
                pos.indx = first;
                pos.dup = Some((to_pgno, to_indx));
            }
        }
    }

    /// Two sibling pages collapsed into the lower-numbered one: cursors
    /// on the dying page follow their items, indexes unchanged.
    pub fn adjust_reverse_split(&self, from_pgno: PageId, to_pgno: PageId) {
        let mut inner = self.inner.lock();
        for pos in inner.cursors.values_mut() {
            if pos.pgno == from_pgno {
                pos.pgno = to_pgno;
            }
        }
    }

    /// A page split at `split_indx` into `left_pgno` and `right_pgno`.
    /// Cursors below the split point stay put (or move to the left page
    /// when the original page is not reused as the left half); cursors
    /// at or past it move to the right page with their index rebased.
    pub fn adjust_split(
        &self,
        pgno: PageId,
        left_pgno: PageId,
        right_pgno: PageId,
        split_indx: u32,
        move_left: bool,
    ) {
        let mut inner = self.inner.lock();
        for pos in inner.cursors.values_mut() {
            if pos.pgno == pgno {
                if pos.indx < split_indx {
                    if move_left {
                        pos.pgno = left_pgno;
                    }
                } else {
                    pos.pgno = right_pgno;
                    pos.indx -= split_indx;
                }
            }
            if let Some((dpgno, dindx)) = &mut pos.dup {
                if *dpgno == pgno {
                    if *dindx < split_indx {
                        if move_left {
                            *dpgno = left_pgno;
                        }
                    } else {
                        *dpgno = right_pgno;
                        *dindx -= split_indx;
                    }
                }
            }
        }
    }

    /// A duplicate item moved from one off-page slot to another: cursors
    /// whose duplicate position matches the old slot follow it.
    pub fn adjust_replace(
        &self,
        dup_pgno: PageId,
        dup_indx: u32,
        new_pgno: PageId,
        new_indx: u32,
    ) {
        let mut inner = self.inner.lock();
        for pos in inner.cursors.values_mut() {
            if pos.dup == Some((dup_pgno, dup_indx)) {
                pos.dup = Some((new_pgno, new_indx));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_marks_and_overwrite_clears() {
        let reg = CursorRegistry::new();
        let c1 = reg.open(5, 3);
        let c2 = reg.open(5, 4);

        assert_eq!(reg.adjust_delete(5, 3, true), 1);
        assert!(c1.pos().deleted);
        assert!(!c2.pos().deleted);

        // A later overwrite of the same slot clears the mark and the
        // cursor reports the new item at the same index.
        assert_eq!(reg.adjust_delete(5, 3, false), 1);
        assert!(!c1.pos().deleted);
        assert_eq!(c1.pos().indx, 3);
    }

    #[test]
    fn test_shift_on_insert_and_delete() {
        let reg = CursorRegistry::new();
        let before = reg.open(5, 1);
        let at = reg.open(5, 3);
        let after = reg.open(5, 7);
        let other_page = reg.open(6, 3);

        reg.adjust_shift(5, 3, 1);
        assert_eq!(before.pos().indx, 1);
        assert_eq!(at.pos().indx, 4);
        assert_eq!(after.pos().indx, 8);
        assert_eq!(other_page.pos().indx, 3);

        reg.adjust_shift(5, 3, -1);
        assert_eq!(at.pos().indx, 3);
        assert_eq!(after.pos().indx, 7);
    }

    #[test]
    fn test_duplicate_relocation_is_idempotent() {
        let reg = CursorRegistry::new();
        let c = reg.open(5, 2);

        reg.adjust_to_duplicate(5, 2, 2, 11, 0);
        assert_eq!(c.pos().dup, Some((11, 0)));
        assert_eq!(c.pos().indx, 2);

        // Relocation happens page by page; a second pass over the same
        // leaf slot must not move the cursor again.
        reg.adjust_to_duplicate(5, 2, 2, 12, 5);
        assert_eq!(c.pos().dup, Some((11, 0)));
    }

    #[test]
    fn test_reverse_split_repoints_page() {
        let reg = CursorRegistry::new();
        let dying = reg.open(9, 4);
        let surviving = reg.open(5, 1);

        reg.adjust_reverse_split(9, 5);
        assert_eq!(dying.pos().pgno, 5);
        assert_eq!(dying.pos().indx, 4);
        assert_eq!(surviving.pos().pgno, 5);
    }

    #[test]
    fn test_split_rebases_right_side() {
        let reg = CursorRegistry::new();
        let cursors: Vec<Cursor> = (0..6).map(|i| reg.open(5, i)).collect();

        // Page 5 splits at index 3; left half stays on page 5.
        reg.adjust_split(5, 5, 9, 3, false);
        for (i, c) in cursors.iter().enumerate() {
            let pos = c.pos();
            if i < 3 {
                assert_eq!(pos.pgno, 5);
                assert_eq!(pos.indx, i as u32);
            } else {
                assert_eq!(pos.pgno, 9);
                assert_eq!(pos.indx, i as u32 - 3);
            }
        }
    }

    #[test]
    fn test_split_can_move_left_side() {
        let reg = CursorRegistry::new();
        let c = reg.open(5, 1);
        // The original page is dissolved into two fresh children.
        reg.adjust_split(5, 8, 9, 3, true);
        assert_eq!(c.pos().pgno, 8);
        assert_eq!(c.pos().indx, 1);
    }

    #[test]
    fn test_replace_moves_duplicate_position() {
        let reg = CursorRegistry::new();
        let c = reg.open(5, 2);
        reg.adjust_to_duplicate(5, 2, 2, 11, 4);

        reg.adjust_replace(11, 4, 13, 0);
        assert_eq!(c.pos().dup, Some((13, 0)));

        // Non-matching duplicate positions stay put.
        reg.adjust_replace(11, 4, 14, 1);
        assert_eq!(c.pos().dup, Some((13, 0)));
    }

    #[test]
    fn test_close_removes_from_registry() {
        let reg = CursorRegistry::new();
        let c1 = reg.open(5, 0);
        {
            let _c2 = reg.open(5, 1);
            assert_eq!(reg.open_cursors(), 2);
        }
        assert_eq!(reg.open_cursors(), 1);
        drop(c1);
        assert_eq!(reg.open_cursors(), 0);
    }
}
