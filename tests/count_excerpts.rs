use std::sync::Arc;
use std::time::Duration;

use rollq::{
    Appender, DirectoryConfig, Error, FixedClock, InProcessLock, RollCycle, SegmentDirectory,
};
use tempfile::tempdir;

fn open_directory(root: &std::path::Path, clock: Arc<FixedClock>) -> Arc<SegmentDirectory> {
    let config = DirectoryConfig {
        roll: RollCycle::TEST_SECONDLY,
        offset_millis: 0,
        segment_capacity: 128 * 1024,
        lock_timeout: Duration::from_millis(500),
    };
    SegmentDirectory::open_with(root, config, clock, Arc::new(InProcessLock::new()))
        .expect("open directory")
}

#[test]
fn counting_is_additive_over_adjacent_ranges() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(FixedClock::new(0));
    let directory = open_directory(dir.path(), Arc::clone(&clock));
    let roll = *directory.roll_cycle();
    let mut appender = Appender::new(Arc::clone(&directory));

    let mut indexes = Vec::new();
    for (cycle, records) in [(0u64, 4), (1, 7), (2, 3)] {
        clock.set(cycle * 1_000);
        for i in 0..records {
            indexes.push(appender.write(format!("{cycle}/{i}").as_bytes()).expect("write"));
        }
    }

    let a = indexes[2]; // cycle 0, seq 2
    let b = indexes[6]; // cycle 1, seq 2
    let c = indexes[12]; // cycle 2, seq 1
    assert_eq!(roll.to_cycle(b), 1);
    assert_eq!(roll.to_cycle(c), 2);

    let ab = directory.count_excerpts(a, b).expect("count a..b");
    let bc = directory.count_excerpts(b, c).expect("count b..c");
    let ac = directory.count_excerpts(a, c).expect("count a..c");
    assert_eq!(ab + bc, ac);
    assert_eq!(ab, 4); // seq 2,3 of cycle 0 plus seq 0,1 of cycle 1
    assert_eq!(ac, 10);
}

#[test]
fn same_cycle_count_is_a_sequence_difference() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(FixedClock::new(0));
    let directory = open_directory(dir.path(), Arc::clone(&clock));
    let roll = *directory.roll_cycle();
    let mut appender = Appender::new(Arc::clone(&directory));

    for i in 0..10 {
        appender.write(format!("{i}").as_bytes()).expect("write");
    }

    assert_eq!(
        directory
            .count_excerpts(roll.to_index(0, 2), roll.to_index(0, 9))
            .expect("count"),
        7
    );
    assert_eq!(
        directory
            .count_excerpts(roll.to_index(0, 5), roll.to_index(0, 5))
            .expect("count"),
        0
    );
    // Reversed bounds count nothing rather than underflowing.
    assert_eq!(
        directory
            .count_excerpts(roll.to_index(0, 9), roll.to_index(0, 2))
            .expect("count"),
        0
    );
}

#[test]
fn missing_intermediate_segment_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(FixedClock::new(0));
    let directory = open_directory(dir.path(), Arc::clone(&clock));
    let roll = *directory.roll_cycle();
    let mut appender = Appender::new(Arc::clone(&directory));

    clock.set(0);
    appender.write(b"start").expect("write");
    clock.set(3_000);
    appender.write(b"end").expect("write");

    let err = directory
        .count_excerpts(roll.to_index(0, 0), roll.to_index(3, 0))
        .expect_err("cycles 1 and 2 are unresolvable");
    assert!(matches!(err, Error::UnresolvedCycle(_)));
}
