use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

use taigadb::storage::buffer::MemPageCache;
use taigadb::transaction::wal::log_store::{LogStore, LogStoreConfig};
use taigadb::transaction::wal::RecordPayload;
use taigadb::transaction::TransactionManager;
use taigadb::{recover, Lsn, RecoveryOptions};

fn setup_store(force_sync: bool) -> (Arc<LogStore>, TempDir) {
    let log_dir = tempfile::tempdir().unwrap();
    let config = LogStoreConfig {
        log_dir: log_dir.path().to_path_buf(),
        base_name: "bench_log".to_string(),
        segment_size: 1024 * 1024,
        force_sync,
        ..Default::default()
    };
    (Arc::new(LogStore::open(config).unwrap()), log_dir)
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");
    for payload_size in [64usize, 512, 4096] {
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_size),
            &payload_size,
            |b, &size| {
                let (store, _dir) = setup_store(false);
                let data = vec![0x5Au8; size];
                let mut i = 0u32;
                b.iter(|| {
                    let payload = taigadb::transaction::wal::log_record::encode(
                        1,
                        Lsn::ZERO,
                        &RecordPayload::ItemInsert {
                            pgno: i,
                            page_lsn: Lsn::ZERO,
                            indx: 0,
                            key: b"bench-key",
                            data: &data,
                        },
                    );
                    i = i.wrapping_add(1);
                    store.append(&payload).unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_commit_flush(c: &mut Criterion) {
    c.bench_function("txn_begin_commit_synced", |b| {
        let (store, _dir) = setup_store(true);
        let mgr = TransactionManager::new(store);
        b.iter(|| {
            let txn = mgr.begin().unwrap();
            mgr.commit(txn).unwrap();
        });
    });
}

fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    group.sample_size(10);
    for txn_count in [100u32, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(txn_count), &txn_count, |b, &n| {
            // One log, replayed into a fresh cache per iteration.
            let (store, _dir) = setup_store(false);
            let mgr = TransactionManager::new(store.clone());
            for i in 0..n {
                let txn = mgr.begin().unwrap();
                mgr.record_update(txn, &RecordPayload::ItemInsert {
                    pgno: i % 64,
                    page_lsn: Lsn::ZERO,
                    indx: 0,
                    key: format!("key{i}").as_bytes(),
                    data: b"benchmark payload",
                })
                .unwrap();
                if i % 10 != 0 {
                    mgr.commit(txn).unwrap();
                }
            }
            store.flush(None).unwrap();

            b.iter(|| {
                let cache = MemPageCache::new();
                let options = RecoveryOptions {
                    kind: taigadb::RecoveryKind::Catastrophic,
                    ..Default::default()
                };
                recover(&store, &cache, options).unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append, bench_commit_flush, bench_recovery);
criterion_main!(benches);
