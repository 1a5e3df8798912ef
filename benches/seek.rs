use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use rollq::{
    Appender, CreateMode, DirectoryConfig, FixedClock, InProcessLock, RollCycle, SegmentDirectory,
};

const RECORDS: u64 = 100_000;

fn populated_directory(root: &std::path::Path) -> Arc<SegmentDirectory> {
    let config = DirectoryConfig {
        roll: RollCycle::DAILY,
        offset_millis: 0,
        segment_capacity: 256 * 1024 * 1024,
        lock_timeout: Duration::from_millis(500),
    };
    let directory = SegmentDirectory::open_with(
        root,
        config,
        Arc::new(FixedClock::new(0)),
        Arc::new(InProcessLock::new()),
    )
    .expect("directory");
    let mut appender = Appender::new(Arc::clone(&directory));
    let payload = [0u8; 128];
    for _ in 0..RECORDS {
        appender.write(&payload).expect("write");
    }
    directory
}

fn bench_seek(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let directory = populated_directory(dir.path());
    let store = directory
        .store_for_cycle(0, CreateMode::UseExisting)
        .expect("lookup")
        .expect("present");

    let mut group = c.benchmark_group("seek");
    for &sequence in &[0u64, RECORDS / 2, RECORDS - 1] {
        group.bench_with_input(
            BenchmarkId::from_parameter(sequence),
            &sequence,
            |b, &sequence| {
                b.iter(|| {
                    let record = store
                        .read(black_box(sequence))
                        .expect("read")
                        .expect("present");
                    black_box(record.payload.len())
                });
            },
        );
    }
    group.finish();

    directory.release(&store);
}

criterion_group!(benches, bench_seek);
criterion_main!(benches);
