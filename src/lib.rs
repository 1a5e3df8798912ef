//! Time-rolled, memory-mapped persisted record log.
//!
//! Records are appended to per-cycle segment files that roll on a clock
//! boundary (daily, hourly, minutely). Every record gets a 64-bit packed
//! index of (cycle, in-segment sequence); a sparse in-segment index keeps
//! seeks cheap. Appends are lock-free across threads and processes sharing
//! the mapping; only segment creation takes the directory lock.

pub mod appender;
pub mod clock;
pub mod directory;
pub mod error;
pub mod lock;
pub mod mmap;
pub mod roll;
pub mod store;
pub mod tailer;

pub use appender::Appender;
pub use clock::{Clock, FixedClock, QuantaClock, SystemClock};
pub use directory::{CreateMode, Direction, DirectoryConfig, SegmentDirectory};
pub use error::{Error, Result};
pub use lock::{DirectoryLock, FileLock, InProcessLock};
pub use roll::{CycleFormat, RollCycle};
pub use store::{RecordView, SegmentStore};
pub use tailer::{Excerpt, Tailer};
