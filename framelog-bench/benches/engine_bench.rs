//! Writer engine benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use framelog_engine::{EngineConfig, FsyncPolicy, WriterEngine};
use framelog_store::{Level, LogRecord, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;
use tokio::runtime::Runtime;

struct TestSetup {
    _dir: TempDir,
    engine: WriterEngine,
    sequence: AtomicU64,
}

impl TestSetup {
    fn record(&self) -> LogRecord {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        LogRecord::new(seq, Timestamp::now(), Level::Info, "benchmark record")
    }
}

fn setup_engine(rt: &Runtime, fsync: FsyncPolicy) -> TestSetup {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::new(dir.path()).with_fsync_policy(fsync);
    let engine = rt.block_on(WriterEngine::open(config)).unwrap();
    TestSetup {
        _dir: dir,
        engine,
        sequence: AtomicU64::new(1),
    }
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("engine_enqueue");
    group.throughput(Throughput::Elements(1));

    for (name, policy) in [
        ("no_fsync", FsyncPolicy::Never),
        ("fsync_every_batch", FsyncPolicy::EveryBatch),
    ] {
        let setup = setup_engine(&rt, policy);
        group.bench_function(name, |b| {
            b.to_async(&rt)
                .iter(|| async { black_box(setup.engine.enqueue(setup.record()).await.unwrap()) });
        });
        rt.block_on(setup.engine.shutdown());
    }

    group.finish();
}

fn bench_concurrent_submit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("engine_concurrent");
    let setup = setup_engine(&rt, FsyncPolicy::EveryBatch);

    for producers in [10, 100] {
        group.throughput(Throughput::Elements(producers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(producers),
            &producers,
            |b, &producers| {
                b.to_async(&rt).iter(|| async {
                    let mut pending = Vec::with_capacity(producers);
                    for _ in 0..producers {
                        pending.push(setup.engine.submit(setup.record()).await.unwrap());
                    }
                    black_box(futures::future::join_all(pending).await)
                });
            },
        );
    }

    rt.block_on(setup.engine.shutdown());
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_concurrent_submit);
criterion_main!(benches);
