// Recovery integration tests: the page-LSN protocol end to end.

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use taigadb::storage::buffer::{MemPageCache, PageCache};
use taigadb::storage::page::{PageItem, PageState, PageType};
use taigadb::transaction::wal::log_store::{LogStore, LogStoreConfig};
use taigadb::transaction::wal::RecordPayload;
use taigadb::transaction::TransactionManager;
use taigadb::{recover, Lsn, PageId, RecoveryKind, RecoveryOptions, TxnId};

/// A mutation environment with a separation between the live page cache
/// (what the crashed process had in memory) and the "disk" cache (what
/// had actually been written back when the crash hit). Recovery always
/// runs against the disk cache.
struct TestEnv {
    mgr: Arc<TransactionManager>,
    live: MemPageCache,
    disk: MemPageCache,
    _log_dir: TempDir,
}

impl TestEnv {
    fn new() -> Result<Self> {
        let log_dir = TempDir::new()?;
        let config = LogStoreConfig {
            log_dir: log_dir.path().to_path_buf(),
            base_name: "recovery_wal".to_string(),
            segment_size: 1 << 16,
            force_sync: true,
            ..Default::default()
        };
        let log = Arc::new(LogStore::open(config)?);
        Ok(Self {
            mgr: Arc::new(TransactionManager::new(log)),
            live: MemPageCache::new(),
            disk: MemPageCache::new(),
            _log_dir: log_dir,
        })
    }

    /// Page write lock held, log record appended, page stamped: the
    /// atomicity unit recovery assumes.
    fn insert(&self, txn: TxnId, pgno: PageId, indx: u32, key: &[u8], data: &[u8]) -> Result<Lsn> {
        let handle = self.live.fetch(pgno, true)?;
        let mut page = handle.write();
        if page.state == PageState::Free {
            page.state = PageState::Allocated(PageType::Leaf);
        }
        let lsn = self.mgr.record_update(txn, &RecordPayload::ItemInsert {
            pgno,
            page_lsn: page.lsn,
            indx,
            key,
            data,
        })?;
        page.insert_item(indx, PageItem { key: key.to_vec(), data: data.to_vec() })?;
        page.lsn = lsn;
        Ok(lsn)
    }

    /// Simulate the buffer pool writing a page back: the disk cache gets
    /// a snapshot of the live page.
    fn flush_page(&self, pgno: PageId) -> Result<()> {
        let handle = self.live.fetch(pgno, false)?;
        let snapshot = handle.read().clone();
        self.disk.install(snapshot);
        Ok(())
    }

    fn recover_disk(&self, kind: RecoveryKind) -> Result<taigadb::RecoveryReport> {
        Ok(self.mgr.recover(&self.disk, RecoveryOptions { kind, ..Default::default() })?)
    }
}

#[test]
fn test_committed_insert_is_redone() -> Result<()> {
    let env = TestEnv::new()?;

    // Page 5 was written back before the transaction touched it; the
    // insert itself never reached the disk.
    let txn = env.mgr.begin()?;
    env.live.fetch(5, true)?; // materialize empty page
    env.flush_page(5)?;
    let insert_lsn = env.insert(txn, 5, 0, b"key", b"value")?;
    env.mgr.commit(txn)?;

    let report = env.recover_disk(RecoveryKind::Normal)?;
    assert_eq!(report.committed, 1);
    assert_eq!(report.rolled_back, 0);

    let page = env.disk.fetch(5, false)?;
    assert_eq!(page.read().items.len(), 1);
    assert_eq!(page.read().items[0].key, b"key");
    // Redo advanced the page LSN to the insert record's LSN.
    assert_eq!(page.read().lsn, insert_lsn);
    Ok(())
}

#[test]
fn test_redo_is_idempotent() -> Result<()> {
    // Begin, insert on page P (not on disk), commit. The forward pass
    // redoes the insert; running recovery again leaves the page
    // byte-for-byte identical.
    let env = TestEnv::new()?;
    let txn = env.mgr.begin()?;
    env.live.fetch(5, true)?;
    env.flush_page(5)?;
    let insert_lsn = env.insert(txn, 5, 0, b"k", b"v")?;
    env.mgr.commit(txn)?;

    env.recover_disk(RecoveryKind::Normal)?;
    let first_pass = env.disk.fetch(5, false)?.read().clone();
    assert_eq!(first_pass.lsn, insert_lsn);

    // Second recovery over the same log range: every redo comparison
    // sees page-LSN >= record LSN and skips.
    env.recover_disk(RecoveryKind::Normal)?;
    let second_pass = env.disk.fetch(5, false)?.read().clone();
    assert_eq!(first_pass, second_pass);
    Ok(())
}

#[test]
fn test_loser_insert_is_undone() -> Result<()> {
    let env = TestEnv::new()?;

    let committed = env.mgr.begin()?;
    let base_lsn = env.insert(committed, 5, 0, b"base", b"old")?;
    env.mgr.commit(committed)?;

    // The loser's insert made it all the way to disk, but its commit
    // never happened.
    let loser = env.mgr.begin()?;
    env.insert(loser, 5, 1, b"uncommitted", b"x")?;
    env.flush_page(5)?;

    let report = env.recover_disk(RecoveryKind::Normal)?;
    assert_eq!(report.rolled_back, 1);

    let page = env.disk.fetch(5, false)?;
    assert_eq!(page.read().items.len(), 1, "loser's insert must be reversed");
    assert_eq!(page.read().items[0].key, b"base");
    // Undo rolled the page LSN back to the record's prior page LSN.
    assert_eq!(page.read().lsn, base_lsn);
    Ok(())
}

#[test]
fn test_mixed_outcome_transactions() -> Result<()> {
    let env = TestEnv::new()?;

    let t1 = env.mgr.begin()?;
    env.insert(t1, 3, 0, b"a", b"1")?;
    env.mgr.commit(t1)?;

    let t2 = env.mgr.begin()?;
    env.insert(t2, 3, 1, b"b", b"2")?;
    env.flush_page(3)?; // crash state holds both effects

    let t3 = env.mgr.begin()?;
    env.insert(t3, 4, 0, b"c", b"3")?;
    // Page 4 never flushed; t3 never committed. Nothing of t3 should
    // survive.

    let report = env.recover_disk(RecoveryKind::Normal)?;
    assert_eq!(report.committed, 1);
    assert_eq!(report.rolled_back, 2);

    let page3 = env.disk.fetch(3, false)?;
    assert_eq!(page3.read().items.len(), 1);
    assert_eq!(page3.read().items[0].key, b"a");

    // Page 4 exists only if the replay created it; either way it holds
    // nothing.
    if let Ok(page4) = env.disk.fetch(4, false) {
        assert!(page4.read().items.is_empty());
    }
    Ok(())
}

#[test]
fn test_checkpoint_bounds_recovery() -> Result<()> {
    // Recovery bounded by the second-to-last checkpoint and recovery
    // from the beginning of the log must produce identical page states.
    let env = TestEnv::new()?;

    let t1 = env.mgr.begin()?;
    env.insert(t1, 10, 0, b"one", b"1")?;
    env.mgr.commit(t1)?;
    env.flush_page(10)?;
    let ckp1 = env.mgr.checkpoint(Lsn::ZERO, &[])?;

    let t2 = env.mgr.begin()?;
    env.insert(t2, 11, 0, b"two", b"2")?;
    env.mgr.commit(t2)?;
    env.flush_page(11)?;
    // Second checkpoint links back to the first.
    env.mgr.checkpoint(ckp1, &[])?;

    let t3 = env.mgr.begin()?;
    env.insert(t3, 11, 1, b"three", b"3")?;
    env.flush_page(11)?; // uncommitted effect reached disk

    // Two identical crash images.
    let bounded = MemPageCache::new();
    let full = MemPageCache::new();
    for pgno in [10u32, 11] {
        let snapshot = env.disk.fetch(pgno, false)?.read().clone();
        bounded.install(snapshot.clone());
        full.install(snapshot);
    }

    let store = env.mgr.log();
    recover(store, &bounded, RecoveryOptions { kind: RecoveryKind::Normal, ..Default::default() })?;
    recover(store, &full, RecoveryOptions {
        kind: RecoveryKind::Catastrophic,
        ..Default::default()
    })?;

    for pgno in [10u32, 11] {
        let b = bounded.fetch(pgno, false)?.read().clone();
        let f = full.fetch(pgno, false)?.read().clone();
        assert_eq!(b, f, "page {pgno} diverged between bounded and full recovery");
    }

    // The loser's insert is gone in both.
    assert_eq!(bounded.fetch(11, false)?.read().items.len(), 1);
    Ok(())
}

#[test]
fn test_prepared_transaction_survives() -> Result<()> {
    let env = TestEnv::new()?;

    let txn = env.mgr.begin()?;
    let lsn = env.insert(txn, 6, 0, b"pending", b"?")?;
    env.flush_page(6)?;
    env.mgr.prepare(txn)?;

    let report = env.recover_disk(RecoveryKind::Normal)?;
    assert_eq!(report.prepared, 1);
    assert_eq!(report.rolled_back, 0);

    // The prepared transaction's effect must not be rolled back.
    let page = env.disk.fetch(6, false)?;
    assert_eq!(page.read().items.len(), 1);
    assert_eq!(page.read().lsn, lsn);
    Ok(())
}

#[test]
fn test_recovery_writes_fresh_checkpoint() -> Result<()> {
    let env = TestEnv::new()?;
    let txn = env.mgr.begin()?;
    env.insert(txn, 2, 0, b"x", b"y")?;
    env.mgr.commit(txn)?;

    let report = env.recover_disk(RecoveryKind::Normal)?;
    let ckp = report.checkpoint_lsn.expect("recovery takes a checkpoint");
    assert_eq!(ckp, env.mgr.log().last_lsn()?);

    // A second recovery is bounded by it and still converges.
    let report2 = env.recover_disk(RecoveryKind::Normal)?;
    assert!(report2.checkpoint_lsn.unwrap() > ckp);
    Ok(())
}

#[test]
fn test_empty_log_recovers_cleanly() -> Result<()> {
    let env = TestEnv::new()?;
    let report = env.recover_disk(RecoveryKind::Normal)?;
    assert_eq!(report.committed, 0);
    assert_eq!(report.rolled_back, 0);
    assert_eq!(report.checkpoint_lsn, None);
    Ok(())
}

#[test]
fn test_txn_id_counter_resets_past_log() -> Result<()> {
    let env = TestEnv::new()?;
    let t1 = env.mgr.begin()?;
    env.insert(t1, 1, 0, b"k", b"v")?;
    env.mgr.commit(t1)?;

    env.recover_disk(RecoveryKind::Normal)?;
    let t_next = env.mgr.begin()?;
    assert!(t_next > t1, "ids must not be reused after recovery");
    Ok(())
}

#[test]
fn test_recovery_progress_feedback() -> Result<()> {
    use std::sync::atomic::{AtomicU8, Ordering};

    let env = TestEnv::new()?;
    for i in 0..10 {
        let txn = env.mgr.begin()?;
        env.insert(txn, 20, i, format!("k{i}").as_bytes(), b"v")?;
        env.mgr.commit(txn)?;
    }

    let max_seen = Arc::new(AtomicU8::new(0));
    let observed = max_seen.clone();
    let options = RecoveryOptions {
        kind: RecoveryKind::Normal,
        feedback: Some(Box::new(move |pct| {
            observed.fetch_max(pct, Ordering::Relaxed);
        })),
    };
    env.mgr.recover(&env.disk, options)?;
    assert_eq!(max_seen.load(Ordering::Relaxed), 100);
    Ok(())
}

#[test]
fn test_abort_then_crash_recovers_consistently() -> Result<()> {
    // A live abort already rolled pages back; recovery's backward pass
    // sees the abort record, re-walks the chain and the LSN comparison
    // keeps every undo a no-op.
    let env = TestEnv::new()?;

    let keeper = env.mgr.begin()?;
    let keep_lsn = env.insert(keeper, 5, 0, b"keep", b"1")?;
    env.mgr.commit(keeper)?;

    let aborted = env.mgr.begin()?;
    env.insert(aborted, 5, 1, b"gone", b"2")?;
    env.mgr.abort(aborted, &env.live)?;
    env.flush_page(5)?; // abort's rollback reached the disk

    let report = env.recover_disk(RecoveryKind::Normal)?;
    assert_eq!(report.committed, 1);

    let page = env.disk.fetch(5, false)?;
    assert_eq!(page.read().items.len(), 1);
    assert_eq!(page.read().items[0].key, b"keep");
    assert_eq!(page.read().lsn, keep_lsn);
    Ok(())
}
