use std::sync::Arc;
use std::time::Duration;

use rollq::{
    CreateMode, DirectoryConfig, FixedClock, InProcessLock, RollCycle, SegmentDirectory,
};
use tempfile::tempdir;

fn open_directory(root: &std::path::Path) -> Arc<SegmentDirectory> {
    let config = DirectoryConfig {
        roll: RollCycle::TEST_SECONDLY,
        offset_millis: 0,
        segment_capacity: 128 * 1024,
        lock_timeout: Duration::from_millis(500),
    };
    SegmentDirectory::open_with(
        root,
        config,
        Arc::new(FixedClock::new(0)),
        Arc::new(InProcessLock::new()),
    )
    .expect("open directory")
}

#[test]
fn repeated_acquisitions_share_one_handle() {
    let dir = tempdir().expect("tempdir");
    let directory = open_directory(dir.path());

    let first = directory
        .store_for_cycle(7, CreateMode::CreateIfAbsent)
        .expect("create")
        .expect("present");
    let second = directory
        .store_for_cycle(7, CreateMode::UseExisting)
        .expect("lookup")
        .expect("present");
    let third = directory
        .store_for_cycle(7, CreateMode::CreateIfAbsent)
        .expect("lookup")
        .expect("present");

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&second, &third));
    assert_eq!(first.reference_count(), 3);

    directory.release(&first);
    directory.release(&second);
    assert_eq!(third.reference_count(), 1);
    directory.release(&third);
    assert_eq!(third.reference_count(), 0);
}

#[test]
fn release_past_zero_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let directory = open_directory(dir.path());

    let store = directory
        .store_for_cycle(1, CreateMode::CreateIfAbsent)
        .expect("create")
        .expect("present");
    store.append(b"kept", 0).expect("append");

    directory.release(&store);
    directory.release(&store);
    assert_eq!(store.reference_count(), 0);

    // A fresh acquisition maps the same file and still sees the record.
    let reopened = directory
        .store_for_cycle(1, CreateMode::UseExisting)
        .expect("lookup")
        .expect("present");
    assert_eq!(reopened.record_count(), 1);
    assert_eq!(
        reopened.read(0).expect("read").expect("present").payload,
        b"kept"
    );
    directory.release(&reopened);
}

#[test]
fn eviction_keeps_the_file_on_disk() {
    let dir = tempdir().expect("tempdir");
    let directory = open_directory(dir.path());
    let roll = *directory.roll_cycle();

    let store = directory
        .store_for_cycle(3, CreateMode::CreateIfAbsent)
        .expect("create")
        .expect("present");
    let path = dir.path().join(roll.filename(3));
    assert!(path.exists());
    directory.release(&store);
    assert!(path.exists());
    assert_eq!(directory.last_cycle().expect("last"), Some(3));
}
