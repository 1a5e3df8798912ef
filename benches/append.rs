use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use rollq::{Appender, DirectoryConfig, FixedClock, InProcessLock, RollCycle, SegmentDirectory};

const APPENDS_PER_ITER: usize = 10_000;

fn bench_directory(root: &std::path::Path) -> Arc<SegmentDirectory> {
    let config = DirectoryConfig {
        roll: RollCycle::DAILY,
        offset_millis: 0,
        segment_capacity: 256 * 1024 * 1024,
        lock_timeout: Duration::from_millis(500),
    };
    SegmentDirectory::open_with(
        root,
        config,
        Arc::new(FixedClock::new(0)),
        Arc::new(InProcessLock::new()),
    )
    .expect("directory")
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let directory = bench_directory(dir.path());
                    let appender = Appender::new(directory);
                    let payload = vec![0u8; size];
                    (dir, appender, payload)
                },
                |(_dir, mut appender, payload)| {
                    for _ in 0..APPENDS_PER_ITER {
                        appender.write(black_box(&payload)).expect("write");
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
