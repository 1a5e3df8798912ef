//! Cycle policy and cycle calculator.
//!
//! A roll cycle divides wall-clock time into fixed-length buckets ("cycles"),
//! one segment file per cycle. It also fixes the segment's index geometry and
//! the bit split of the 64-bit record index. Everything here is pure; no I/O.

use crate::clock::Clock;
use crate::{Error, Result};

/// File name suffix for segment files.
pub const SEGMENT_SUFFIX: &str = ".rq";

/// Upper bound on `RollCycle::sequence_bits`, shared with the store's packed
/// append cursor: the cursor carries this many sequence bits next to a
/// 40-bit byte offset, so no policy may promise a wider in-segment sequence
/// range than a segment can actually assign.
pub const MAX_SEQUENCE_BITS: u32 = 24;

const MILLIS_PER_DAY: u64 = 86_400_000;
const MILLIS_PER_HOUR: u64 = 3_600_000;
const MILLIS_PER_MINUTE: u64 = 60_000;

/// On-disk stem format for a cycle's segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleFormat {
    /// `yyyymmdd`, for day-granularity cycles.
    YyyyMmDd,
    /// `yyyymmddhh`, for hour-granularity cycles.
    YyyyMmDdHh,
    /// `yyyymmddhhmm`, for minute-granularity cycles.
    YyyyMmDdHhMm,
    /// Zero-padded decimal cycle number, for arbitrary cycle lengths.
    Counter,
}

impl CycleFormat {
    /// Smallest time unit the stem can express, in milliseconds.
    /// `None` for `Counter`, which has no calendar granularity.
    fn unit_millis(self) -> Option<u64> {
        match self {
            CycleFormat::YyyyMmDd => Some(MILLIS_PER_DAY),
            CycleFormat::YyyyMmDdHh => Some(MILLIS_PER_HOUR),
            CycleFormat::YyyyMmDdHhMm => Some(MILLIS_PER_MINUTE),
            CycleFormat::Counter => None,
        }
    }

    fn encode(self, cycle: u32, length_millis: u64) -> String {
        match self {
            CycleFormat::Counter => format!("{cycle:08}"),
            _ => {
                let millis = cycle as u64 * length_millis;
                let days = millis / MILLIS_PER_DAY;
                let (year, month, day) = days_since_epoch_to_ymd(days as i64);
                let in_day = millis % MILLIS_PER_DAY;
                let hour = in_day / MILLIS_PER_HOUR;
                let minute = (in_day % MILLIS_PER_HOUR) / MILLIS_PER_MINUTE;
                match self {
                    CycleFormat::YyyyMmDd => format!("{year:04}{month:02}{day:02}"),
                    CycleFormat::YyyyMmDdHh => format!("{year:04}{month:02}{day:02}{hour:02}"),
                    CycleFormat::YyyyMmDdHhMm => {
                        format!("{year:04}{month:02}{day:02}{hour:02}{minute:02}")
                    }
                    CycleFormat::Counter => unreachable!(),
                }
            }
        }
    }

    fn decode(self, stem: &str, length_millis: u64) -> Option<u32> {
        let expected_len = match self {
            CycleFormat::YyyyMmDd => 8,
            CycleFormat::YyyyMmDdHh => 10,
            CycleFormat::YyyyMmDdHhMm => 12,
            CycleFormat::Counter => 8,
        };
        if stem.len() != expected_len || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if self == CycleFormat::Counter {
            return stem.parse::<u32>().ok();
        }

        let year = stem[0..4].parse::<i32>().ok()?;
        let month = stem[4..6].parse::<u8>().ok()?;
        let day = stem[6..8].parse::<u8>().ok()?;
        let hour = if stem.len() >= 10 {
            stem[8..10].parse::<u64>().ok()?
        } else {
            0
        };
        let minute = if stem.len() >= 12 {
            stem[10..12].parse::<u64>().ok()?
        } else {
            0
        };
        if hour > 23 || minute > 59 {
            return None;
        }

        let days = ymd_to_days_since_epoch(year, month, day)?;
        let millis =
            days as u64 * MILLIS_PER_DAY + hour * MILLIS_PER_HOUR + minute * MILLIS_PER_MINUTE;
        if millis % length_millis != 0 {
            return None;
        }
        u32::try_from(millis / length_millis).ok()
    }
}

/// Immutable cycle policy: cycle length, segment index geometry, the bit
/// split of the 64-bit record index, and the segment file name format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollCycle {
    /// Duration of one cycle in milliseconds.
    pub length_millis: u64,
    /// Number of entries in one sparse-index page.
    pub index_count: u32,
    /// Records between consecutive sparse-index samples; 1 = dense.
    pub index_spacing: u32,
    /// Low-order bits of a record index holding the in-cycle sequence
    /// number; the cycle occupies the remaining high bits. At most
    /// [`MAX_SEQUENCE_BITS`].
    pub sequence_bits: u32,
    /// Stem format of the segment file name.
    pub format: CycleFormat,
}

impl RollCycle {
    /// One segment per day.
    pub const DAILY: RollCycle = RollCycle {
        length_millis: MILLIS_PER_DAY,
        index_count: 8192,
        index_spacing: 64,
        sequence_bits: 24,
        format: CycleFormat::YyyyMmDd,
    };

    /// One segment per hour.
    pub const HOURLY: RollCycle = RollCycle {
        length_millis: MILLIS_PER_HOUR,
        index_count: 4096,
        index_spacing: 16,
        sequence_bits: 20,
        format: CycleFormat::YyyyMmDdHh,
    };

    /// One segment per minute.
    pub const MINUTELY: RollCycle = RollCycle {
        length_millis: MILLIS_PER_MINUTE,
        index_count: 2048,
        index_spacing: 16,
        sequence_bits: 16,
        format: CycleFormat::YyyyMmDdHhMm,
    };

    /// One segment per second, tiny index pages. Test workloads only.
    pub const TEST_SECONDLY: RollCycle = RollCycle {
        length_millis: 1_000,
        index_count: 32,
        index_spacing: 4,
        sequence_bits: 20,
        format: CycleFormat::Counter,
    };

    pub fn new(
        length_millis: u64,
        index_count: u32,
        index_spacing: u32,
        sequence_bits: u32,
        format: CycleFormat,
    ) -> Result<Self> {
        if length_millis == 0 {
            return Err(Error::Unsupported("cycle length must be non-zero"));
        }
        if index_count == 0 {
            return Err(Error::Unsupported("index count must be at least 1"));
        }
        if index_spacing == 0 {
            return Err(Error::Unsupported("index spacing must be at least 1"));
        }
        if !(8..=MAX_SEQUENCE_BITS).contains(&sequence_bits) {
            return Err(Error::Unsupported("sequence bits out of range"));
        }
        if let Some(unit) = format.unit_millis() {
            // Stems must decode back to a whole cycle number.
            if length_millis % unit != 0 {
                return Err(Error::Unsupported(
                    "cycle length must be a whole number of format units",
                ));
            }
        }
        Ok(Self {
            length_millis,
            index_count,
            index_spacing,
            sequence_bits,
            format,
        })
    }

    /// The current cycle: `floor((clock.now() − offset_millis) / length)`,
    /// clamped at cycle 0. Deterministic for fixed inputs.
    pub fn current_cycle(&self, clock: &dyn Clock, offset_millis: i64) -> u32 {
        let effective = clock.now() as i64 - offset_millis;
        if effective <= 0 {
            return 0;
        }
        (effective as u64 / self.length_millis) as u32
    }

    pub fn sequence_mask(&self) -> u64 {
        (1u64 << self.sequence_bits) - 1
    }

    /// Highest sequence number the index bit split can address.
    pub fn max_sequence(&self) -> u64 {
        self.sequence_mask()
    }

    /// Packs (cycle, sequence) into one 64-bit record index.
    pub fn to_index(&self, cycle: u32, sequence: u64) -> u64 {
        debug_assert!(sequence <= self.max_sequence());
        ((cycle as u64) << self.sequence_bits) | (sequence & self.sequence_mask())
    }

    pub fn to_cycle(&self, index: u64) -> u32 {
        (index >> self.sequence_bits) as u32
    }

    pub fn to_sequence(&self, index: u64) -> u64 {
        index & self.sequence_mask()
    }

    /// Segment file name for a cycle, e.g. `19700102.rq` for daily cycle 1.
    /// Date stems round-trip through `parse_filename` for any cycle up to
    /// year 9999; beyond that the stem widens past four year digits.
    pub fn filename(&self, cycle: u32) -> String {
        let mut name = self.format.encode(cycle, self.length_millis);
        name.push_str(SEGMENT_SUFFIX);
        name
    }

    /// Decodes a directory entry back to a cycle.
    ///
    /// `Ok(None)` if the name is not a segment file at all (wrong suffix);
    /// `Err(ParseCycle)` if it carries the segment suffix but the stem does
    /// not decode under this policy.
    pub fn parse_filename(&self, name: &str) -> Result<Option<u32>> {
        let stem = match name.strip_suffix(SEGMENT_SUFFIX) {
            Some(stem) => stem,
            None => return Ok(None),
        };
        match self.format.decode(stem, self.length_millis) {
            Some(cycle) => Ok(Some(cycle)),
            None => Err(Error::ParseCycle(name.to_string())),
        }
    }
}

/// Convert days since the Unix epoch to (year, month, day).
fn days_since_epoch_to_ymd(mut days: i64) -> (i32, u8, u8) {
    let mut year = 1970;
    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let months = days_in_months(year);
    let mut month = 1;
    for &days_in_month in &months {
        if days < days_in_month as i64 {
            break;
        }
        days -= days_in_month as i64;
        month += 1;
    }

    let day = (days + 1) as u8;
    (year, month, day)
}

/// Inverse of `days_since_epoch_to_ymd`. `None` for dates no stem can name
/// (before 1970 or past 9999, the four-digit year ceiling).
fn ymd_to_days_since_epoch(year: i32, month: u8, day: u8) -> Option<i64> {
    if !(1970..=9999).contains(&year) || !(1..=12).contains(&month) {
        return None;
    }
    let months = days_in_months(year);
    if day < 1 || day > months[(month - 1) as usize] {
        return None;
    }

    let mut days: i64 = 0;
    for y in 1970..year {
        days += if is_leap_year(y) { 366 } else { 365 };
    }
    for m in 0..(month - 1) as usize {
        days += months[m] as i64;
    }
    Some(days + (day - 1) as i64)
}

fn days_in_months(year: i32) -> [u8; 12] {
    if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}
