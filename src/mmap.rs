//! Memory mapping for segment files.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::{Error, Result};

/// A writable mapping over one segment file, fixed-length for its lifetime.
///
/// The store hands out raw pointers into the mapping for its atomic header
/// and commit words, so the region must never move; no remapping API is
/// exposed.
pub struct MmapFile {
    map: MmapMut,
}

impl MmapFile {
    /// Creates (or truncates) the file at `len` bytes and maps it. The file
    /// is extended sparsely; pages fault in on first touch.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("cannot map an empty file"));
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    /// Maps an existing file at its current length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(Error::Unsupported("cannot map an empty file"));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}
