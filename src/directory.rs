//! Segment directory: the rolling-queue core.
//!
//! Maps cycle ids to live segment stores, creates segments on demand under
//! the coordination lock, enumerates what exists on disk, and answers the
//! cross-cycle queries (first/last/next cycle, entry and excerpt counts).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::lock::{self, DirectoryLock, FileLock, DEFAULT_LOCK_TIMEOUT};
use crate::roll::RollCycle;
use crate::store::{SegmentStore, DEFAULT_SEGMENT_CAPACITY};
use crate::{Error, Result};

const LOCK_FILE: &str = "directory.lock";

/// Whether `store_for_cycle` may create a missing segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    UseExisting,
    CreateIfAbsent,
}

/// Scan direction for cycle traversal and tailing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Clone)]
pub struct DirectoryConfig {
    pub roll: RollCycle,
    /// Subtracted from the clock before cycle computation; shifts the roll
    /// boundary within the cycle period.
    pub offset_millis: i64,
    pub segment_capacity: usize,
    pub lock_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            roll: RollCycle::DAILY,
            offset_millis: 0,
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Owns the table of live segment handles for one on-disk directory.
///
/// A store handle returned by `store_for_cycle` has had its reference count
/// incremented; the caller must pass it back to `release` on every exit
/// path. Segments whose count reaches zero are unmapped and evicted from the
/// table; their files stay on disk.
pub struct SegmentDirectory {
    root: PathBuf,
    config: DirectoryConfig,
    clock: Arc<dyn Clock>,
    lock: Arc<dyn DirectoryLock>,
    stores: Mutex<HashMap<u32, Arc<SegmentStore>>>,
}

impl SegmentDirectory {
    pub fn open(root: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with_config(root, DirectoryConfig::default())
    }

    pub fn open_with_config(root: impl AsRef<Path>, config: DirectoryConfig) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        let lock = Arc::new(FileLock::new(root.join(LOCK_FILE)));
        let clock = Arc::new(SystemClock);
        Self::open_with(root, config, clock, lock)
    }

    /// Full injection point: tests substitute a fixed clock and an
    /// in-process lock here.
    pub fn open_with(
        root: impl AsRef<Path>,
        config: DirectoryConfig,
        clock: Arc<dyn Clock>,
        lock: Arc<dyn DirectoryLock>,
    ) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Arc::new(Self {
            root,
            config,
            clock,
            lock,
            stores: Mutex::new(HashMap::new()),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn roll_cycle(&self) -> &RollCycle {
        &self.config.roll
    }

    pub fn offset_millis(&self) -> i64 {
        self.config.offset_millis
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now()
    }

    /// The current cycle under this directory's policy, clock and offset.
    pub fn cycle(&self) -> u32 {
        self.config
            .roll
            .current_cycle(self.clock.as_ref(), self.config.offset_millis)
    }

    /// Returns the live handle for `cycle`, acquiring a reference.
    ///
    /// With `CreateIfAbsent` a missing segment is created under the
    /// coordination lock, re-checking existence after acquisition so racing
    /// creators converge on one file. With `UseExisting` a missing segment
    /// is `Ok(None)`, never an error.
    pub fn store_for_cycle(
        &self,
        cycle: u32,
        mode: CreateMode,
    ) -> Result<Option<Arc<SegmentStore>>> {
        let path = self.root.join(self.config.roll.filename(cycle));

        {
            let stores = self.stores.lock().expect("store table poisoned");
            if let Some(store) = stores.get(&cycle) {
                store.acquire_ref();
                return Ok(Some(Arc::clone(store)));
            }
        }

        if path.exists() {
            return Ok(Some(self.insert_open(cycle, &path)?));
        }
        if mode == CreateMode::UseExisting {
            return Ok(None);
        }

        // Lock held only around the exists-or-create decision.
        let _guard = lock::acquire(self.lock.as_ref(), self.config.lock_timeout)?;
        if path.exists() {
            return Ok(Some(self.insert_open(cycle, &path)?));
        }
        let store = SegmentStore::create(
            &path,
            cycle,
            self.config.roll.index_count,
            self.config.roll.index_spacing,
            self.config.segment_capacity,
            self.config.roll.max_sequence(),
        )?;
        Ok(Some(self.insert(cycle, store)))
    }

    /// Releases one reference; at zero the handle is unmapped and evicted.
    /// Releasing a handle already at zero references is a no-op.
    pub fn release(&self, store: &Arc<SegmentStore>) {
        let mut stores = self.stores.lock().expect("store table poisoned");
        if store.release_ref() == 0 {
            if stores.remove(&store.cycle()).is_some() {
                log::debug!("evicted segment for cycle {}", store.cycle());
            }
        }
    }

    /// Minimum existing cycle, or `None` on an empty directory.
    pub fn first_cycle(&self) -> Result<Option<u32>> {
        Ok(self.scan_cycles_lenient()?.into_iter().min())
    }

    /// Maximum existing cycle, or `None` on an empty directory.
    pub fn last_cycle(&self) -> Result<Option<u32>> {
        Ok(self.scan_cycles_lenient()?.into_iter().max())
    }

    /// Nearest existing cycle strictly after (`Forward`) or before
    /// (`Backward`) `current_cycle`. Never creates segments. A segment file
    /// whose name does not decode under the roll policy is a parse error.
    pub fn next_cycle(&self, current_cycle: u32, direction: Direction) -> Result<Option<u32>> {
        let cycles = self.scan_cycles_strict()?;
        Ok(match direction {
            Direction::Forward => cycles.into_iter().filter(|&c| c > current_cycle).min(),
            Direction::Backward => cycles.into_iter().filter(|&c| c < current_cycle).max(),
        })
    }

    /// Total records across every existing segment.
    ///
    /// Opens every segment's header read-only; intended for diagnostics,
    /// not hot paths.
    pub fn entry_count(&self) -> Result<u64> {
        let mut total = 0u64;
        for cycle in self.scan_cycles_lenient()? {
            if let Some(store) = self.store_for_cycle(cycle, CreateMode::UseExisting)? {
                total += store.record_count();
                self.release(&store);
            }
        }
        Ok(total)
    }

    /// Number of excerpts between `from_index` (inclusive) and `to_index`
    /// (exclusive). Both must reference existing records; this is not
    /// checked. Walking non-adjacent cycles opens each intermediate
    /// segment and is comparatively expensive.
    pub fn count_excerpts(&self, from_index: u64, to_index: u64) -> Result<u64> {
        let roll = &self.config.roll;
        let (from_cycle, from_seq) = (roll.to_cycle(from_index), roll.to_sequence(from_index));
        let (to_cycle, to_seq) = (roll.to_cycle(to_index), roll.to_sequence(to_index));

        if from_cycle == to_cycle {
            return Ok(to_seq.saturating_sub(from_seq));
        }
        if from_cycle > to_cycle {
            return Ok(0);
        }

        // First segment contributes its records from from_seq on, every
        // intermediate segment its full count, the last segment to_seq.
        // A from_seq past the first segment's tail contributes nothing, the
        // same degradation the same-cycle path gives.
        let mut total = self
            .resolved_record_count(from_cycle)?
            .saturating_sub(from_seq);
        for cycle in (from_cycle + 1)..to_cycle {
            total += self.resolved_record_count(cycle)?;
        }
        Ok(total + to_seq)
    }

    fn resolved_record_count(&self, cycle: u32) -> Result<u64> {
        let store = self
            .store_for_cycle(cycle, CreateMode::UseExisting)?
            .ok_or(Error::UnresolvedCycle(cycle))?;
        let count = store.record_count();
        self.release(&store);
        Ok(count)
    }

    fn insert_open(&self, cycle: u32, path: &Path) -> Result<Arc<SegmentStore>> {
        let store = SegmentStore::open(path, cycle, self.config.roll.max_sequence())?;
        Ok(self.insert(cycle, store))
    }

    fn insert(&self, cycle: u32, store: SegmentStore) -> Arc<SegmentStore> {
        let mut stores = self.stores.lock().expect("store table poisoned");
        // Another thread may have mapped the same cycle between our checks.
        let entry = stores
            .entry(cycle)
            .or_insert_with(|| Arc::new(store));
        entry.acquire_ref();
        Arc::clone(entry)
    }

    /// Cycles present on disk; files with the segment suffix but an
    /// undecodable stem are skipped with a warning.
    fn scan_cycles_lenient(&self) -> Result<Vec<u32>> {
        let mut cycles = Vec::new();
        for name in self.list_file_names()? {
            match self.config.roll.parse_filename(&name) {
                Ok(Some(cycle)) => cycles.push(cycle),
                Ok(None) => {}
                Err(_) => log::warn!("skipping undecodable segment file {name}"),
            }
        }
        Ok(cycles)
    }

    /// Like `scan_cycles_lenient`, but an undecodable segment file name is
    /// reported to the caller.
    fn scan_cycles_strict(&self) -> Result<Vec<u32>> {
        let mut cycles = Vec::new();
        for name in self.list_file_names()? {
            if let Some(cycle) = self.config.roll.parse_filename(&name)? {
                cycles.push(cycle);
            }
        }
        Ok(cycles)
    }

    fn list_file_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.root.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    #[cfg(test)]
    fn live_store_count(&self) -> usize {
        self.stores.lock().expect("store table poisoned").len()
    }
}
