//! Transaction benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dstore_bench::random_item;
use dstore_memory::{MemStore, MemoryConfig};
use dstore_model::PropertyMap;
use dstore_raw::{datastore, TransactionOptions};

/// Benchmark read-modify-write transactions on one entity group.
fn bench_single_group_txn(c: &mut Criterion) {
    let store = MemStore::new(MemoryConfig::new());
    let ctx = store.context();
    let key = datastore::new_key(&ctx, "Counter", 1);
    datastore::put(&ctx, &key, PropertyMap::new().with("n", 0)).unwrap();
    let opts = TransactionOptions::default();

    c.bench_function("single_group_txn", |b| {
        b.iter(|| {
            datastore::run_in_transaction(&ctx, &opts, |tx| {
                let mut value = datastore::get(tx, &key)?;
                value.set("n", black_box(1));
                datastore::put(tx, &key, value).map(|_| ())
            })
            .unwrap();
        });
    });
}

/// Benchmark cross-group transactions writing to several roots.
fn bench_cross_group_txn(c: &mut Criterion) {
    let mut group = c.benchmark_group("cross_group_txn");

    for groups in [2, 10, 25].iter() {
        group.throughput(Throughput::Elements(*groups as u64));
        group.bench_with_input(BenchmarkId::from_parameter(groups), groups, |b, &groups| {
            let store = MemStore::new(MemoryConfig::new());
            let ctx = store.context();
            let keys: Vec<_> = (1..=groups as i64)
                .map(|i| datastore::new_key(&ctx, "Root", i))
                .collect();
            let values: Vec<PropertyMap> = (0..groups).map(|_| random_item(64)).collect();
            let opts = TransactionOptions::default().cross_group(true);

            b.iter(|| {
                datastore::run_in_transaction(&ctx, &opts, |tx| {
                    for r in datastore::put_multi(tx, &keys, &values) {
                        r?;
                    }
                    Ok(())
                })
                .unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_group_txn, bench_cross_group_txn);
criterion_main!(benches);
