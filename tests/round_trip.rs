use std::sync::Arc;
use std::time::Duration;

use rollq::{
    Appender, CreateMode, Direction, DirectoryConfig, FixedClock, InProcessLock, RollCycle,
    SegmentDirectory, Tailer,
};
use tempfile::tempdir;

fn open_daily(root: &std::path::Path, clock: Arc<FixedClock>) -> Arc<SegmentDirectory> {
    let config = DirectoryConfig {
        roll: RollCycle::DAILY,
        offset_millis: 0,
        segment_capacity: 1024 * 1024,
        lock_timeout: Duration::from_millis(500),
    };
    SegmentDirectory::open_with(root, config, clock, Arc::new(InProcessLock::new()))
        .expect("open directory")
}

#[test]
fn day_two_appends_read_back_by_sequence() {
    let dir = tempdir().expect("tempdir");
    // 90_000_000 ms is 25h past the epoch, one day-length into cycle 1.
    let clock = Arc::new(FixedClock::new(90_000_000));
    let directory = open_daily(dir.path(), Arc::clone(&clock));
    let roll = *directory.roll_cycle();

    assert_eq!(directory.cycle(), 1);

    let mut appender = Appender::new(Arc::clone(&directory));
    let mut indexes = Vec::new();
    for payload in [b"A".as_slice(), b"B", b"C"] {
        indexes.push(appender.write(payload).expect("write"));
    }
    assert_eq!(
        indexes
            .iter()
            .map(|&i| (roll.to_cycle(i), roll.to_sequence(i)))
            .collect::<Vec<_>>(),
        vec![(1, 0), (1, 1), (1, 2)]
    );

    let store = directory
        .store_for_cycle(1, CreateMode::UseExisting)
        .expect("lookup")
        .expect("present");
    let record = store.read(1).expect("read").expect("present");
    assert_eq!(record.payload, b"B");
    assert_eq!(record.timestamp_millis, 90_000_000);
    directory.release(&store);

    assert_eq!(
        directory
            .count_excerpts(roll.to_index(1, 0), roll.to_index(1, 2))
            .expect("count"),
        2
    );
    assert_eq!(directory.entry_count().expect("entries"), 3);

    // Segment file carries the date stem for 1970-01-02.
    assert!(dir.path().join("19700102.rq").exists());
}

#[test]
fn tailer_replays_what_the_appender_wrote() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(FixedClock::new(0));
    let directory = open_daily(dir.path(), Arc::clone(&clock));

    let mut appender = Appender::new(Arc::clone(&directory));
    let written: Vec<Vec<u8>> = (0..50)
        .map(|i| format!("record-{i:03}").into_bytes())
        .collect();
    for payload in &written {
        appender.write(payload).expect("write");
    }

    let mut tailer = Tailer::new(Arc::clone(&directory), Direction::Forward);
    let mut replayed = Vec::new();
    while let Some(excerpt) = tailer.read_next().expect("read") {
        replayed.push(excerpt.payload);
    }
    assert_eq!(replayed, written);
}

#[test]
fn reopened_directory_sees_persisted_records() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(FixedClock::new(0));
    {
        let directory = open_daily(dir.path(), Arc::clone(&clock));
        let mut appender = Appender::new(Arc::clone(&directory));
        appender.write(b"durable").expect("write");
    }

    let directory = open_daily(dir.path(), Arc::new(FixedClock::new(0)));
    let mut tailer = Tailer::new(Arc::clone(&directory), Direction::Forward);
    assert_eq!(
        tailer.read_next().expect("read").expect("present").payload,
        b"durable"
    );
}
