//! Advisory coordination lock guarding segment creation and roll decisions.
//!
//! The lock is held only around "does this cycle's segment exist; if not,
//! create it" and never around appends or reads. It is injected into the
//! directory so single-process tests can substitute `InProcessLock`.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{Error, Result};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const ACQUIRE_BACKOFF: Duration = Duration::from_millis(1);

/// Cross-process (or in-process) mutual exclusion for one segment directory.
pub trait DirectoryLock: Send + Sync {
    /// One non-blocking acquisition attempt.
    fn try_acquire(&self) -> Result<bool>;

    /// Releases the lock. Only valid for the current holder.
    fn release(&self);
}

/// RAII holder; releases on drop so every exit path unlocks.
pub struct LockGuard<'a> {
    lock: &'a dyn DirectoryLock,
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Acquires `lock`, retrying with backoff until `timeout` elapses.
///
/// Exceeding the timeout is a reported failure, not a silent retry.
pub fn acquire(lock: &dyn DirectoryLock, timeout: Duration) -> Result<LockGuard<'_>> {
    let deadline = Instant::now() + timeout;
    loop {
        if lock.try_acquire()? {
            return Ok(LockGuard { lock });
        }
        if Instant::now() >= deadline {
            return Err(Error::LockTimeout(timeout));
        }
        std::thread::sleep(ACQUIRE_BACKOFF);
    }
}

/// Advisory file lock shared by all processes using the same directory.
///
/// Exclusion comes from `flock`; the lock file body records the holder's
/// identity (`pid starttime`) for diagnosing stale holders.
pub struct FileLock {
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl DirectoryLock for FileLock {
    fn try_acquire(&self) -> Result<bool> {
        let mut held = self.held.lock().expect("lock file state poisoned");
        if held.is_some() {
            // Another thread in this process holds it.
            return Ok(false);
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;
        if !try_flock(&file)? {
            return Ok(false);
        }
        write_holder_record(&file)?;
        *held = Some(file);
        Ok(true)
    }

    fn release(&self) {
        let mut held = self.held.lock().expect("lock file state poisoned");
        // Dropping the descriptor releases the flock.
        *held = None;
    }
}

/// In-memory lock for single-process setups and tests.
#[derive(Default)]
pub struct InProcessLock {
    held: AtomicBool,
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DirectoryLock for InProcessLock {
    fn try_acquire(&self) -> Result<bool> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

fn try_flock(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

fn write_holder_record(file: &File) -> Result<()> {
    let (pid, start_time) = holder_identity();
    let record = format!("{pid} {start_time}\n");
    let mut handle = file.try_clone()?;
    handle.set_len(0)?;
    handle.seek(SeekFrom::Start(0))?;
    handle.write_all(record.as_bytes())?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn holder_identity() -> (u32, u64) {
    let pid = std::process::id();
    (pid, proc_start_time(pid).unwrap_or(0))
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Option<u64> {
    use std::io::Read;

    let mut contents = String::new();
    File::open(format!("/proc/{pid}/stat"))
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    // Field 22 counted after the parenthesized comm, which may contain spaces.
    let end = contents.rfind(')')?;
    let mut fields = contents[end + 1..].split_whitespace();
    fields.nth(19)?.parse::<u64>().ok()
}

#[cfg(not(target_os = "linux"))]
fn holder_identity() -> (u32, u64) {
    (std::process::id(), 0)
}
