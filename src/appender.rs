//! Write-side accessor of the log.
//!
//! An appender caches the current cycle's store handle and only goes back
//! to the directory on a cycle change or a full segment, keeping the hot
//! path at one atomic reservation plus the payload write.

use std::sync::Arc;

use crate::directory::{CreateMode, SegmentDirectory};
use crate::store::SegmentStore;
use crate::{Error, Result};

// A full segment rolls to the next cycle; more than a handful of
// consecutive rolls for one write means the payload cannot fit anywhere.
const MAX_ROLLS_PER_WRITE: u32 = 8;

pub struct Appender {
    directory: Arc<SegmentDirectory>,
    current: Option<(u32, Arc<SegmentStore>)>,
}

impl Appender {
    pub fn new(directory: Arc<SegmentDirectory>) -> Self {
        Self {
            directory,
            current: None,
        }
    }

    /// Appends `payload` and returns its 64-bit packed index.
    ///
    /// The target cycle is the clock's current cycle, advanced past any
    /// segment that has no room left. Sequences within a cycle are gapless
    /// across all appenders sharing the segment.
    pub fn write(&mut self, payload: &[u8]) -> Result<u64> {
        let mut cycle = self.directory.cycle();
        // Never roll backwards if the wall clock does.
        if let Some((current_cycle, _)) = self.current {
            cycle = cycle.max(current_cycle);
        }

        for _ in 0..MAX_ROLLS_PER_WRITE {
            let store = self.store_for(cycle)?;
            match store.append(payload, self.directory.now_millis()) {
                Ok(sequence) => {
                    return Ok(self.directory.roll_cycle().to_index(cycle, sequence));
                }
                Err(Error::SegmentFull) => {
                    cycle += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::SegmentFull)
    }

    /// The cycle of the segment this appender last wrote to.
    pub fn cycle(&self) -> Option<u32> {
        self.current.as_ref().map(|(cycle, _)| *cycle)
    }

    /// The index the next write to the current segment would get. `None`
    /// before the first write.
    pub fn next_index(&self) -> Option<u64> {
        let (cycle, store) = self.current.as_ref()?;
        Some(self.directory.roll_cycle().to_index(*cycle, store.record_count()))
    }

    fn store_for(&mut self, cycle: u32) -> Result<Arc<SegmentStore>> {
        if let Some((current_cycle, store)) = &self.current {
            if *current_cycle == cycle {
                return Ok(Arc::clone(store));
            }
        }
        let store = self
            .directory
            .store_for_cycle(cycle, CreateMode::CreateIfAbsent)?
            .ok_or(Error::UnresolvedCycle(cycle))?;
        if let Some((_, previous)) = self.current.take() {
            self.directory.release(&previous);
        }
        self.current = Some((cycle, Arc::clone(&store)));
        Ok(store)
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        if let Some((_, store)) = self.current.take() {
            self.directory.release(&store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::directory::DirectoryConfig;
    use crate::lock::InProcessLock;
    use crate::roll::RollCycle;
    use std::time::Duration;
    use tempfile::tempdir;

    fn open_directory(
        root: &std::path::Path,
        clock: Arc<FixedClock>,
        capacity: usize,
    ) -> Arc<SegmentDirectory> {
        let config = DirectoryConfig {
            roll: RollCycle::TEST_SECONDLY,
            offset_millis: 0,
            segment_capacity: capacity,
            lock_timeout: Duration::from_millis(200),
        };
        SegmentDirectory::open_with(root, config, clock, Arc::new(InProcessLock::new()))
            .expect("open directory")
    }

    #[test]
    fn writes_land_in_the_current_cycle() {
        let dir = tempdir().expect("tempdir");
        let clock = Arc::new(FixedClock::new(0));
        let directory = open_directory(dir.path(), Arc::clone(&clock), 256 * 1024);
        let roll = *directory.roll_cycle();
        let mut appender = Appender::new(Arc::clone(&directory));

        let first = appender.write(b"alpha").expect("write");
        let second = appender.write(b"beta").expect("write");
        assert_eq!(roll.to_cycle(first), 0);
        assert_eq!(roll.to_sequence(first), 0);
        assert_eq!(roll.to_sequence(second), 1);
        assert_eq!(appender.cycle(), Some(0));
    }

    #[test]
    fn clock_advance_rolls_to_a_new_segment() {
        let dir = tempdir().expect("tempdir");
        let clock = Arc::new(FixedClock::new(0));
        let directory = open_directory(dir.path(), Arc::clone(&clock), 256 * 1024);
        let roll = *directory.roll_cycle();
        let mut appender = Appender::new(Arc::clone(&directory));

        appender.write(b"before").expect("write");
        clock.advance(3_000);
        let index = appender.write(b"after").expect("write");

        assert_eq!(roll.to_cycle(index), 3);
        assert_eq!(roll.to_sequence(index), 0);
        assert_eq!(directory.first_cycle().expect("first"), Some(0));
        assert_eq!(directory.last_cycle().expect("last"), Some(3));
    }

    #[test]
    fn full_segment_rolls_forward_instead_of_failing() {
        let dir = tempdir().expect("tempdir");
        let clock = Arc::new(FixedClock::new(0));
        // Small enough that a few records exhaust the data area.
        let directory = open_directory(dir.path(), Arc::clone(&clock), 4 * 1024);
        let roll = *directory.roll_cycle();
        let mut appender = Appender::new(Arc::clone(&directory));

        let payload = vec![7u8; 900];
        let mut max_cycle = 0;
        for _ in 0..12 {
            let index = appender.write(&payload).expect("write");
            max_cycle = max_cycle.max(roll.to_cycle(index));
        }
        assert!(max_cycle > 0, "expected at least one forced roll");
    }

    #[test]
    fn drop_releases_the_cached_store() {
        let dir = tempdir().expect("tempdir");
        let clock = Arc::new(FixedClock::new(0));
        let directory = open_directory(dir.path(), Arc::clone(&clock), 256 * 1024);

        let mut appender = Appender::new(Arc::clone(&directory));
        appender.write(b"payload").expect("write");
        let store = directory
            .store_for_cycle(0, CreateMode::UseExisting)
            .expect("lookup")
            .expect("present");
        assert_eq!(store.reference_count(), 2);
        drop(appender);
        assert_eq!(store.reference_count(), 1);
        directory.release(&store);
    }
}
