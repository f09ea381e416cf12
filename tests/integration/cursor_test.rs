// Cursor adjustment integration tests: cursors keep identifying the same
// logical items while pages split, merge and mutate under them.

use anyhow::Result;

use taigadb::storage::buffer::{MemPageCache, PageCache};
use taigadb::storage::page::{PageItem, PageState, PageType};
use taigadb::{Cursor, CursorRegistry};

/// A page of n items keyed "k00".."kNN" plus one cursor per index.
fn page_with_cursors(
    cache: &MemPageCache,
    reg: &CursorRegistry,
    pgno: u32,
    n: u32,
) -> Result<Vec<Cursor>> {
    let handle = cache.fetch(pgno, true)?;
    let mut page = handle.write();
    page.state = PageState::Allocated(PageType::Leaf);
    for i in 0..n {
        page.items.push(PageItem {
            key: format!("k{i:02}").as_bytes().to_vec(),
            data: format!("v{i:02}").as_bytes().to_vec(),
        });
    }
    drop(page);
    Ok((0..n).map(|i| reg.open(pgno, i)).collect())
}

/// The key a cursor currently identifies, resolved through the cache.
fn key_under(cache: &MemPageCache, cursor: &Cursor) -> Result<Vec<u8>> {
    let pos = cursor.pos();
    let (pgno, indx) = pos.dup.unwrap_or((pos.pgno, pos.indx));
    let handle = cache.fetch(pgno, false)?;
    let page = handle.read();
    Ok(page.item(indx)?.key.clone())
}

#[test]
fn test_cursors_survive_split_at_every_index() -> Result<()> {
    // Property: with a cursor at every index of a page of N items, after
    // a split at index k every cursor still identifies the same key, on
    // whichever side it ended up.
    const N: u32 = 8;
    for split_at in 1..N {
        let cache = MemPageCache::new();
        let reg = CursorRegistry::new();
        let cursors = page_with_cursors(&cache, &reg, 5, N)?;
        let before: Vec<Vec<u8>> = cursors
            .iter()
            .map(|c| key_under(&cache, c))
            .collect::<Result<_>>()?;

        // Perform the split: right sibling takes items at and past the
        // split point, then cursors are adjusted.
        {
            let left = cache.fetch(5, true)?;
            let mut left_page = left.write();
            let moved = left_page.items.split_off(split_at as usize);
            let right = cache.fetch(9, true)?;
            let mut right_page = right.write();
            right_page.state = left_page.state;
            right_page.items = moved;
        }
        reg.adjust_split(5, 5, 9, split_at, false);

        for (i, cursor) in cursors.iter().enumerate() {
            let pos = cursor.pos();
            if (i as u32) < split_at {
                assert_eq!(pos.pgno, 5);
            } else {
                assert_eq!(pos.pgno, 9);
            }
            assert_eq!(
                key_under(&cache, cursor)?,
                before[i],
                "cursor {i} lost its item after split at {split_at}"
            );
        }
    }
    Ok(())
}

#[test]
fn test_delete_then_reinsert_scenario() -> Result<()> {
    // C1 parked at (page 5, index 3); C2 deletes that slot, then
    // reinserts into it. C1 must report deleted in between, then
    // identify the new item, never silently skipping or double-reporting.
    let cache = MemPageCache::new();
    let reg = CursorRegistry::new();
    let cursors = page_with_cursors(&cache, &reg, 5, 6)?;
    let c1 = &cursors[3];

    // C2 deletes the item under C1. The slot is logically emptied but
    // the cursor is only marked, not moved.
    {
        let handle = cache.fetch(5, false)?;
        handle.write().items[3] = PageItem { key: Vec::new(), data: Vec::new() };
    }
    let marked = reg.adjust_delete(5, 3, true);
    assert_eq!(marked, 1);
    assert!(c1.pos().deleted);
    assert_eq!(c1.pos().indx, 3);

    // C2 reinserts at the same slot: the overwrite clears the mark.
    {
        let handle = cache.fetch(5, false)?;
        handle.write().items[3] = PageItem { key: b"knew".to_vec(), data: b"vnew".to_vec() };
    }
    reg.adjust_delete(5, 3, false);
    assert!(!c1.pos().deleted);
    assert_eq!(c1.pos().indx, 3);
    assert_eq!(key_under(&cache, c1)?, b"knew");
    Ok(())
}

#[test]
fn test_insert_shifts_only_trailing_cursors() -> Result<()> {
    let cache = MemPageCache::new();
    let reg = CursorRegistry::new();
    let cursors = page_with_cursors(&cache, &reg, 5, 4)?;
    let before: Vec<Vec<u8>> = cursors
        .iter()
        .map(|c| key_under(&cache, c))
        .collect::<Result<_>>()?;

    // Insert a new item at index 2.
    {
        let handle = cache.fetch(5, false)?;
        handle
            .write()
            .items
            .insert(2, PageItem { key: b"kxx".to_vec(), data: b"vxx".to_vec() });
    }
    reg.adjust_shift(5, 2, 1);

    for (i, cursor) in cursors.iter().enumerate() {
        assert_eq!(key_under(&cache, cursor)?, before[i]);
    }
    Ok(())
}

#[test]
fn test_reverse_split_follows_surviving_page() -> Result<()> {
    let cache = MemPageCache::new();
    let reg = CursorRegistry::new();

    let left_cursors = page_with_cursors(&cache, &reg, 5, 3)?;
    let right_cursors = page_with_cursors(&cache, &reg, 9, 2)?;

    // Collapse page 9 into page 5: cursors on 9 follow their items to
    // the survivor. Their items land after page 5's existing ones, so
    // shift them first, then repoint the page number.
    let base = {
        let left = cache.fetch(5, false)?;
        let right = cache.fetch(9, false)?;
        let mut left_page = left.write();
        let mut right_page = right.write();
        let base = left_page.items.len() as u32;
        let moved = std::mem::take(&mut right_page.items);
        right_page.state = PageState::Free;
        left_page.items.extend(moved);
        base
    };
    reg.adjust_shift(9, 0, base as i32);
    reg.adjust_reverse_split(9, 5);

    for cursor in left_cursors.iter().chain(&right_cursors) {
        assert_eq!(cursor.pos().pgno, 5);
    }
    assert_eq!(key_under(&cache, &right_cursors[0])?, b"k00");
    assert_eq!(right_cursors[0].pos().indx, base);
    Ok(())
}

#[test]
fn test_duplicate_move_and_replace() -> Result<()> {
    let cache = MemPageCache::new();
    let reg = CursorRegistry::new();
    let cursors = page_with_cursors(&cache, &reg, 5, 4)?;
    let c = &cursors[2];

    // The item under the cursor moves to off-page duplicate page 11.
    {
        let dup = cache.fetch(11, true)?;
        let mut dup_page = dup.write();
        dup_page.state = PageState::Allocated(PageType::Duplicate);
        let leaf = cache.fetch(5, false)?;
        let item = leaf.read().item(2)?.clone();
        dup_page.items.push(item);
    }
    reg.adjust_to_duplicate(5, 2, 2, 11, 0);
    assert_eq!(c.pos().dup, Some((11, 0)));
    assert_eq!(key_under(&cache, c)?, b"k02");

    // Bookkeeping later moves the duplicate entry to page 13 slot 0.
    {
        let item = cache.fetch(11, false)?.write().remove_item(0)?;
        let new_dup = cache.fetch(13, true)?;
        let mut new_page = new_dup.write();
        new_page.state = PageState::Allocated(PageType::Duplicate);
        new_page.items.push(item);
    }
    reg.adjust_replace(11, 0, 13, 0);
    assert_eq!(c.pos().dup, Some((13, 0)));
    assert_eq!(key_under(&cache, c)?, b"k02");
    Ok(())
}
