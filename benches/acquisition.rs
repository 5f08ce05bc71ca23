//! Benchmarks for the acquire/release cycle of the job stores.
//!
//! Each iteration reserves the most urgent triggers and hands them back,
//! so the store stays the same size across iterations.

use chrono::{Duration, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use cadence::{InMemoryJobStore, JobDetail, JobStore, Trigger};
use tokio::runtime::Runtime;

async fn populate(store: &dyn JobStore, size: usize) {
    let soon = Utc::now() + Duration::seconds(30);
    for i in 0..size {
        let job = JobDetail::new(format!("job_{}", i), "noop");
        let trigger = Trigger::builder(format!("trigger_{}", i), format!("job_{}", i))
            .starting_at(soon + Duration::milliseconds(i as i64))
            .with_priority((i % 10) as i32)
            .build()
            .unwrap();
        store.store_job_and_trigger(job, trigger).await.unwrap();
    }
}

async fn acquire_and_release(store: &dyn JobStore, batch: usize) {
    let horizon = Utc::now() + Duration::minutes(5);
    let acquired = store
        .acquire_next_triggers(horizon, batch, Duration::seconds(1))
        .await
        .unwrap();
    for trigger in &acquired {
        store.release_acquired_trigger(trigger).await.unwrap();
    }
}

fn bench_in_memory(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("acquire_in_memory");

    for size in [100, 1_000].iter() {
        let store = InMemoryJobStore::new();
        rt.block_on(populate(&store, *size));
        for batch in [1, 10].iter() {
            group.bench_with_input(
                BenchmarkId::new(format!("batch_{}", batch), size),
                batch,
                |b, &batch| {
                    b.to_async(&rt).iter(|| acquire_and_release(&store, batch));
                },
            );
        }
    }

    group.finish();
}

#[cfg(feature = "sqlite")]
fn bench_sqlite(c: &mut Criterion) {
    use cadence::{SqliteJobStore, StoreSettings};

    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("acquire_sqlite");
    group.sample_size(20);

    for size in [100, 1_000].iter() {
        let store = rt
            .block_on(SqliteJobStore::in_memory(StoreSettings::default()))
            .unwrap();
        rt.block_on(populate(&store, *size));
        group.bench_with_input(BenchmarkId::new("batch_1", size), size, |b, _| {
            b.to_async(&rt).iter(|| acquire_and_release(&store, 1));
        });
    }

    group.finish();
}

#[cfg(not(feature = "sqlite"))]
fn bench_sqlite(_c: &mut Criterion) {}

criterion_group!(benches, bench_in_memory, bench_sqlite);

criterion_main!(benches);
