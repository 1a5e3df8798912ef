//! Segment store: one cycle's records in one memory-mapped file.
//!
//! Layout: a 128-byte store header, then a data area holding records and
//! sparse-index pages interleaved. Every record starts with a 32-byte header
//! whose first word is an atomic commit word (0 = reservation in flight,
//! otherwise payload length + 1), so readers can tell "not started",
//! "in progress" and "complete" apart without blocking on writers.
//!
//! Concurrent appenders reserve space with a single `fetch_add` on a cursor
//! that packs (sequence, byte offset) into one 64-bit word; one reservation
//! therefore assigns a gapless sequence number and a disjoint byte range at
//! the same time. Only the reserving appender ever writes that range.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::mmap::MmapFile;
use crate::roll::MAX_SEQUENCE_BITS;
use crate::{Error, Result};

/// Default segment capacity (128 MB). The file is created sparse; pages
/// fault in as the write position advances.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 128 * 1024 * 1024;

pub const STORE_MAGIC: u32 = 0x524F_4C51; // 'QLOR' little-endian
pub const STORE_VERSION: u32 = 1;
pub const STORE_HEADER_SIZE: usize = 128;
pub const DATA_OFFSET: usize = 128;

pub const RECORD_HEADER_SIZE: usize = 32;
pub const RECORD_ALIGN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - 1;

const KIND_DATA: u32 = 0;
const KIND_INDEX: u32 = 1;

/// The append cursor packs the next sequence number (high `MAX_SEQUENCE_BITS`
/// bits) and the next free byte offset (low bits) so one `fetch_add` reserves
/// both. `RollCycle` validates its `sequence_bits` against the same bound, so
/// no policy can promise more sequences than the cursor can count.
const CURSOR_SEQ_SHIFT: u32 = 64 - MAX_SEQUENCE_BITS;
const CURSOR_POS_MASK: u64 = (1 << CURSOR_SEQ_SHIFT) - 1;
/// Hard per-segment sequence limit: one below the cursor field's ceiling so
/// rejecting the first out-of-range reservation never carries into the
/// offset bits.
pub const MAX_SEGMENT_SEQUENCE: u64 = (1 << MAX_SEQUENCE_BITS) - 2;
/// Largest allowed segment capacity. Records occupy at least
/// `RECORD_HEADER_SIZE` bytes each, so within this bound a segment always
/// runs out of bytes before it runs out of cursor sequence numbers.
pub const MAX_SEGMENT_CAPACITY: usize =
    (MAX_SEGMENT_SEQUENCE as usize + 1) * RECORD_HEADER_SIZE;

const COMMIT_OFFSET: usize = 0;
const KIND_OFFSET: usize = 4;
const SEQ_OFFSET: usize = 8;
const TIMESTAMP_OFFSET: usize = 16;
const CRC_OFFSET: usize = 24;

// Index page payload: next-page link, then `index_count` offset samples.
const PAGE_NEXT_OFFSET: usize = RECORD_HEADER_SIZE;
const PAGE_ENTRIES_OFFSET: usize = RECORD_HEADER_SIZE + 8;

#[repr(C, align(128))]
struct StoreHeaderBlock {
    magic: AtomicU32,
    version: AtomicU32,
    cycle: AtomicU32,
    index_count: AtomicU32,
    index_spacing: AtomicU32,
    _pad0: [u8; 4],
    append_cursor: AtomicU64,
    record_count: AtomicU64,
    index_root: AtomicU64,
    _pad1: [u8; 80],
}

/// A committed record, borrowed from the mapping.
pub struct RecordView<'a> {
    pub sequence: u64,
    pub timestamp_millis: u64,
    pub payload: &'a [u8],
}

/// One cycle's on-disk data: mapped region, header cursors, sparse index.
///
/// Shared by all holders of its handle; the directory tracks holders through
/// `acquire`/`release` and evicts the mapping when the count reaches zero.
/// The backing file is never deleted here.
pub struct SegmentStore {
    cycle: u32,
    path: PathBuf,
    mmap: MmapFile,
    base: *mut u8,
    capacity: usize,
    index_count: u32,
    index_spacing: u32,
    max_sequence: u64,
    ref_count: AtomicU32,
}

// SAFETY: all cross-thread mutation of the mapping goes through atomics
// (append cursor, commit words, index links); a reserved payload range is
// written only by the appender that won the reservation and becomes
// read-only once its commit word is published.
unsafe impl Send for SegmentStore {}
unsafe impl Sync for SegmentStore {}

impl SegmentStore {
    /// Creates the segment under a temporary name, initializes the header
    /// and atomically publishes it at `path`. If another process published
    /// the same segment first, opens that one instead; either way the caller
    /// observes a complete, header-initialized segment or none at all.
    pub fn create(
        path: &Path,
        cycle: u32,
        index_count: u32,
        index_spacing: u32,
        capacity: usize,
        max_sequence: u64,
    ) -> Result<Self> {
        if capacity < STORE_HEADER_SIZE + RECORD_HEADER_SIZE {
            return Err(Error::Unsupported("segment capacity too small"));
        }
        if capacity > MAX_SEGMENT_CAPACITY {
            return Err(Error::Unsupported("segment capacity exceeds cursor range"));
        }
        if index_count == 0 || index_spacing == 0 {
            return Err(Error::Unsupported("index geometry must be at least 1"));
        }

        let temp_path = temp_path_for(path);
        let _ = std::fs::remove_file(&temp_path);
        let mut mmap = MmapFile::create(&temp_path, capacity)?;

        let base = mmap.as_mut_ptr();
        let header = unsafe { &*(base as *const StoreHeaderBlock) };
        header.version.store(STORE_VERSION, Ordering::Relaxed);
        header.cycle.store(cycle, Ordering::Relaxed);
        header.index_count.store(index_count, Ordering::Relaxed);
        header.index_spacing.store(index_spacing, Ordering::Relaxed);
        header
            .append_cursor
            .store(DATA_OFFSET as u64, Ordering::Relaxed);
        header.record_count.store(0, Ordering::Relaxed);
        header.index_root.store(0, Ordering::Relaxed);
        header.magic.store(STORE_MAGIC, Ordering::Release);
        mmap.flush_sync()?;

        match publish_segment(&temp_path, path) {
            Ok(()) => {}
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                drop(mmap);
                let _ = std::fs::remove_file(&temp_path);
                return Self::open(path, cycle, max_sequence);
            }
            Err(err) => return Err(err),
        }

        log::debug!("created segment {} for cycle {cycle}", path.display());
        Ok(Self {
            cycle,
            path: path.to_path_buf(),
            base,
            capacity,
            index_count,
            index_spacing,
            max_sequence: max_sequence.min(MAX_SEGMENT_SEQUENCE),
            ref_count: AtomicU32::new(0),
            mmap,
        })
    }

    /// Maps an existing segment and validates its header.
    pub fn open(path: &Path, cycle: u32, max_sequence: u64) -> Result<Self> {
        let mut mmap = MmapFile::open(path)?;
        let capacity = mmap.len();
        if capacity < STORE_HEADER_SIZE + RECORD_HEADER_SIZE {
            return Err(Error::CorruptMetadata("segment too small for header"));
        }
        if capacity > MAX_SEGMENT_CAPACITY {
            return Err(Error::CorruptMetadata("segment larger than cursor range"));
        }

        let base = mmap.as_mut_ptr();
        let header = unsafe { &*(base as *const StoreHeaderBlock) };
        if header.magic.load(Ordering::Acquire) != STORE_MAGIC {
            return Err(Error::CorruptMetadata("segment magic mismatch"));
        }
        let version = header.version.load(Ordering::Acquire);
        if version != STORE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        if header.cycle.load(Ordering::Acquire) != cycle {
            return Err(Error::CorruptMetadata("segment cycle mismatch"));
        }
        let index_count = header.index_count.load(Ordering::Acquire);
        let index_spacing = header.index_spacing.load(Ordering::Acquire);
        if index_count == 0 || index_spacing == 0 {
            return Err(Error::CorruptMetadata("segment index geometry invalid"));
        }

        Ok(Self {
            cycle,
            path: path.to_path_buf(),
            base,
            capacity,
            index_count,
            index_spacing,
            max_sequence: max_sequence.min(MAX_SEGMENT_SEQUENCE),
            ref_count: AtomicU32::new(0),
            mmap,
        })
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn index_spacing(&self) -> u32 {
        self.index_spacing
    }

    /// First free byte in the data area. Monotonically non-decreasing for
    /// the life of the segment, even across failed reservations.
    pub fn write_position(&self) -> u64 {
        let pos = self.header().append_cursor.load(Ordering::Acquire) & CURSOR_POS_MASK;
        pos.min(self.capacity as u64)
    }

    /// Number of published records (highest published sequence + 1).
    pub fn record_count(&self) -> u64 {
        self.header().record_count.load(Ordering::Acquire)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        match self.record_count() {
            0 => None,
            count => Some(count - 1),
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_ref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the reference count; a release at zero is a no-op.
    pub(crate) fn release_ref(&self) -> u32 {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.ref_count.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Appends one record and returns its in-cycle sequence number.
    ///
    /// Lock-free: space is reserved by advancing the packed append cursor,
    /// the payload is written into the reserved range, then the record is
    /// published through its commit word with Release ordering. A reader
    /// never observes a committed length before the payload bytes.
    pub fn append(&self, payload: &[u8], timestamp_millis: u64) -> Result<u64> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }
        let record_len = align_up(RECORD_HEADER_SIZE + payload.len(), RECORD_ALIGN);
        if DATA_OFFSET + record_len > self.capacity {
            return Err(Error::PayloadTooLarge);
        }

        let delta = (1u64 << CURSOR_SEQ_SHIFT) | record_len as u64;
        let reserved = self.header().append_cursor.fetch_add(delta, Ordering::AcqRel);
        let sequence = reserved >> CURSOR_SEQ_SHIFT;
        let pos = (reserved & CURSOR_POS_MASK) as usize;

        // The cursor is never rolled back: a full segment stays full and the
        // write position stays monotonic.
        if sequence > self.max_sequence || pos + record_len > self.capacity {
            return Err(Error::SegmentFull);
        }

        let crc = payload_crc(payload);
        unsafe {
            let record = self.base.add(pos);
            (record.add(KIND_OFFSET) as *mut u32).write(KIND_DATA);
            (record.add(SEQ_OFFSET) as *mut u64).write(sequence);
            (record.add(TIMESTAMP_OFFSET) as *mut u64).write(timestamp_millis);
            (record.add(CRC_OFFSET) as *mut u32).write(crc);
            if !payload.is_empty() {
                ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    record.add(RECORD_HEADER_SIZE),
                    payload.len(),
                );
            }
            let commit = &*(record.add(COMMIT_OFFSET) as *const AtomicU32);
            commit.store(payload.len() as u32 + 1, Ordering::Release);
        }

        self.header()
            .record_count
            .fetch_max(sequence + 1, Ordering::AcqRel);

        if sequence % self.index_spacing as u64 == 0 {
            if let Err(err) = self.index_sample(sequence, pos as u64) {
                log::warn!(
                    "cycle {}: index sample for sequence {sequence} failed: {err}",
                    self.cycle
                );
            }
        }

        Ok(sequence)
    }

    /// Reads the record at `sequence`.
    ///
    /// `Ok(None)` past the published tail; callers use this to detect that
    /// they have caught up to the live end of the segment.
    pub fn read(&self, sequence: u64) -> Result<Option<RecordView<'_>>> {
        if sequence >= self.record_count() {
            return Ok(None);
        }

        let mut pos = self.seek_start(sequence);
        let limit = self.write_position() as usize;
        loop {
            if pos + RECORD_HEADER_SIZE > limit {
                return Ok(None);
            }
            let commit = self.load_commit(pos);
            if commit == 0 {
                // Reservation still in flight (or abandoned); the target is
                // not readable yet.
                return Ok(None);
            }
            let payload_len = (commit - 1) as usize;
            let record_len = align_up(RECORD_HEADER_SIZE + payload_len, RECORD_ALIGN);
            if pos + record_len > self.capacity {
                return Err(Error::Corrupt("record overruns segment"));
            }

            unsafe {
                let record = self.base.add(pos);
                let kind = (record.add(KIND_OFFSET) as *const u32).read();
                if kind == KIND_DATA {
                    let found = (record.add(SEQ_OFFSET) as *const u64).read();
                    if found == sequence {
                        let start = pos + RECORD_HEADER_SIZE;
                        let payload = &self.mmap.as_slice()[start..start + payload_len];
                        let crc = (record.add(CRC_OFFSET) as *const u32).read();
                        if payload_crc(payload) != crc {
                            return Err(Error::Corrupt("record crc mismatch"));
                        }
                        let timestamp_millis =
                            (record.add(TIMESTAMP_OFFSET) as *const u64).read();
                        return Ok(Some(RecordView {
                            sequence,
                            timestamp_millis,
                            payload,
                        }));
                    }
                    if found > sequence {
                        // Hole left by a reservation that never published.
                        return Ok(None);
                    }
                }
            }
            pos += record_len;
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush_async()
    }

    /// Human-readable rendering of header, index chain and records.
    pub fn dump(&self) -> String {
        let mut out = self.short_dump();
        out.push('\n');

        let mut page = self.header().index_root.load(Ordering::Acquire);
        while page != 0 {
            let pos = page as usize;
            if !self.page_in_bounds(pos) {
                let _ = writeln!(out, "index page @{pos}: out of bounds");
                break;
            }
            let base = unsafe { (self.base.add(pos + SEQ_OFFSET) as *const u64).read() };
            let mut filled = 0u32;
            for slot in 0..self.index_count as usize {
                if self.page_entry(pos, slot).load(Ordering::Acquire) != 0 {
                    filled += 1;
                }
            }
            let _ = writeln!(out, "index page @{pos}: base_seq={base} filled={filled}");
            page = unsafe { (*self.page_next(pos)).load(Ordering::Acquire) };
        }

        let limit = self.write_position() as usize;
        let mut pos = DATA_OFFSET;
        while pos + RECORD_HEADER_SIZE <= limit {
            let commit = self.load_commit(pos);
            if commit == 0 {
                let _ = writeln!(out, "record @{pos}: uncommitted");
                break;
            }
            let payload_len = (commit - 1) as usize;
            let record_len = align_up(RECORD_HEADER_SIZE + payload_len, RECORD_ALIGN);
            if pos + record_len > self.capacity {
                let _ = writeln!(out, "record @{pos}: overruns segment");
                break;
            }
            unsafe {
                let record = self.base.add(pos);
                let kind = (record.add(KIND_OFFSET) as *const u32).read();
                let seq = (record.add(SEQ_OFFSET) as *const u64).read();
                let ts = (record.add(TIMESTAMP_OFFSET) as *const u64).read();
                match kind {
                    KIND_DATA => {
                        let _ = writeln!(
                            out,
                            "record @{pos}: seq={seq} ts={ts} len={payload_len}"
                        );
                    }
                    KIND_INDEX => {
                        let _ = writeln!(out, "record @{pos}: index page base_seq={seq}");
                    }
                    other => {
                        let _ = writeln!(out, "record @{pos}: unknown kind {other}");
                    }
                }
            }
            pos += record_len;
        }
        out
    }

    /// One-line summary of the store header.
    pub fn short_dump(&self) -> String {
        format!(
            "segment cycle={} records={} write_position={} capacity={} refs={}",
            self.cycle,
            self.record_count(),
            self.write_position(),
            self.capacity,
            self.reference_count(),
        )
    }

    fn header(&self) -> &StoreHeaderBlock {
        unsafe { &*(self.base as *const StoreHeaderBlock) }
    }

    fn load_commit(&self, pos: usize) -> u32 {
        unsafe {
            let commit = &*(self.base.add(pos + COMMIT_OFFSET) as *const AtomicU32);
            commit.load(Ordering::Acquire)
        }
    }

    /// Byte offset to start a forward scan for `sequence`: the nearest
    /// sampled offset at or below the target, or the start of the data area
    /// when the index has nothing usable (linear fallback).
    fn seek_start(&self, sequence: u64) -> usize {
        let spacing = self.index_spacing as u64;
        let per_page = spacing * self.index_count as u64;

        let mut best = DATA_OFFSET;
        let mut page = self.header().index_root.load(Ordering::Acquire);
        while page != 0 {
            let pos = page as usize;
            if !self.page_in_bounds(pos) {
                log::warn!(
                    "cycle {}: index chain unusable at offset {pos}, linear scan",
                    self.cycle
                );
                return DATA_OFFSET;
            }
            let base = unsafe { (self.base.add(pos + SEQ_OFFSET) as *const u64).read() };
            if base > sequence {
                break;
            }
            let target_slot = ((sequence - base) / spacing).min(self.index_count as u64 - 1);
            let mut slot = target_slot as usize;
            loop {
                let entry = self.page_entry(pos, slot).load(Ordering::Acquire);
                if entry != 0 && (entry as usize) < self.capacity {
                    best = entry as usize;
                    break;
                }
                if slot == 0 {
                    break;
                }
                slot -= 1;
            }
            if base + per_page > sequence {
                break;
            }
            page = unsafe { (*self.page_next(pos)).load(Ordering::Acquire) };
        }
        best
    }

    /// Publishes an offset sample for `sequence` (a multiple of the index
    /// spacing), allocating and linking a fresh index page when the chain
    /// has no page covering it yet.
    fn index_sample(&self, sequence: u64, offset: u64) -> Result<()> {
        let spacing = self.index_spacing as u64;
        let per_page = spacing * self.index_count as u64;
        let base = (sequence / per_page) * per_page;

        let page = self.ensure_index_page(base)?;
        let slot = ((sequence - base) / spacing) as usize;
        self.page_entry(page as usize, slot)
            .store(offset, Ordering::Release);
        Ok(())
    }

    /// Finds the index page with `base`, inserting one into the sorted
    /// chain if absent. Insertion races are resolved by CAS on the link; a
    /// loser's freshly reserved page is abandoned in place, where record
    /// scans skip it like any other non-data record.
    fn ensure_index_page(&self, base: u64) -> Result<u64> {
        let mut link: *const AtomicU64 = &self.header().index_root;
        loop {
            let current = unsafe { (*link).load(Ordering::Acquire) };
            if current == 0 || self.page_base(current)? > base {
                let page = self.alloc_index_page(base, current)?;
                match unsafe {
                    (*link).compare_exchange(current, page, Ordering::AcqRel, Ordering::Acquire)
                } {
                    Ok(_) => return Ok(page),
                    Err(_) => continue,
                }
            }
            let current_base = self.page_base(current)?;
            if current_base == base {
                return Ok(current);
            }
            link = self.page_next(current as usize);
        }
    }

    fn alloc_index_page(&self, base: u64, next: u64) -> Result<u64> {
        let payload_len = 8 + self.index_count as usize * 8;
        let record_len = align_up(RECORD_HEADER_SIZE + payload_len, RECORD_ALIGN);

        // Bytes only; index pages do not consume sequence numbers.
        let reserved = self
            .header()
            .append_cursor
            .fetch_add(record_len as u64, Ordering::AcqRel);
        let pos = (reserved & CURSOR_POS_MASK) as usize;
        if pos + record_len > self.capacity {
            return Err(Error::SegmentFull);
        }

        unsafe {
            let record = self.base.add(pos);
            // The region may hold stale bytes from an abandoned reservation.
            ptr::write_bytes(record.add(RECORD_HEADER_SIZE), 0, payload_len);
            (record.add(KIND_OFFSET) as *mut u32).write(KIND_INDEX);
            (record.add(SEQ_OFFSET) as *mut u64).write(base);
            (record.add(TIMESTAMP_OFFSET) as *mut u64).write(0);
            (record.add(CRC_OFFSET) as *mut u32).write(0);
            (*self.page_next(pos)).store(next, Ordering::Relaxed);
            let commit = &*(record.add(COMMIT_OFFSET) as *const AtomicU32);
            commit.store(payload_len as u32 + 1, Ordering::Release);
        }
        Ok(pos as u64)
    }

    fn page_base(&self, page: u64) -> Result<u64> {
        let pos = page as usize;
        if !self.page_in_bounds(pos) {
            return Err(Error::Corrupt("index page out of bounds"));
        }
        let kind = unsafe { (self.base.add(pos + KIND_OFFSET) as *const u32).read() };
        if kind != KIND_INDEX {
            return Err(Error::Corrupt("index link does not point at a page"));
        }
        Ok(unsafe { (self.base.add(pos + SEQ_OFFSET) as *const u64).read() })
    }

    fn page_in_bounds(&self, pos: usize) -> bool {
        pos >= DATA_OFFSET
            && pos % RECORD_ALIGN == 0
            && pos + PAGE_ENTRIES_OFFSET + self.index_count as usize * 8 <= self.capacity
    }

    fn page_next(&self, pos: usize) -> *const AtomicU64 {
        unsafe { self.base.add(pos + PAGE_NEXT_OFFSET) as *const AtomicU64 }
    }

    fn page_entry(&self, pos: usize, slot: usize) -> &AtomicU64 {
        debug_assert!(slot < self.index_count as usize);
        unsafe { &*(self.base.add(pos + PAGE_ENTRIES_OFFSET + slot * 8) as *const AtomicU64) }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Atomically publishes a temp segment at its final name. On Linux uses
/// `renameat2(RENAME_NOREPLACE)` so a creation race surfaces as
/// `AlreadyExists` instead of silently replacing the winner's file.
pub(crate) fn publish_segment(temp: &Path, final_path: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let temp_c = CString::new(temp.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("segment temp path contains null byte"))?;
        let final_c = CString::new(final_path.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("segment path contains null byte"))?;
        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                temp_c.as_ptr(),
                libc::AT_FDCWD,
                final_c.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOSYS) && err.raw_os_error() != Some(libc::EINVAL) {
            return Err(Error::Io(err));
        }
    }

    if final_path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "segment already exists",
        )));
    }
    std::fs::rename(temp, final_path)?;
    Ok(())
}

fn payload_crc(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
