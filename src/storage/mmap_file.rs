use crate::error::{Error, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// A growable memory-mapped file. Growth never shrinks and is amortized
/// by a 1.5x factor so that the O(n) cost of remapping is paid O(1) per
/// byte appended over the file's lifetime. The file length and the
/// mapping size always agree; `reserve` is the only operation that may
/// move the mapping's base address.
///
/// Any I/O error here (`ftruncate`/`mmap` failing) is treated as fatal
/// by callers.
pub struct MemoryMap {
    file: File,
    mmap: MmapMut,
}

impl MemoryMap {
    /// Opens (creating if necessary) the file at `path` read/write and
    /// maps its current contents. A brand-new file is mapped at a
    /// minimum non-zero size so that `data()` never returns an empty
    /// slice the caller can't grow from.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(1)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(MemoryMap { file, mmap })
    }

    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// If `n > size()`, grows the backing file to `max(n, ceil(n*1.5))`
    /// and remaps.
    pub fn reserve(&mut self, n: u64) -> Result<()> {
        if n <= self.size() {
            return Ok(());
        }
        let grown = ((n as f64) * 1.5).ceil() as u64;
        let new_size = grown.max(n);
        self.file.set_len(new_size)?;
        // Dropping the old mapping before creating the new one avoids
        // holding two live mappings of the same file simultaneously.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// Unmaps and flushes (OS sync of buffers and the directory entry).
    /// Consumes `self`; dropping a `MemoryMap` without calling `close`
    /// still flushes on `Drop` via `MmapMut`'s own destructor, but
    /// `close` additionally fsyncs the underlying file descriptor so
    /// callers get a deterministic durability point.
    pub fn close(mut self) -> Result<()> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.mmap.flush()?;
        self.file.sync_all().map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_file_maps_at_nonzero_size() {
        let dir = tempfile::tempdir().unwrap();
        let map = MemoryMap::open(dir.path().join("f")).unwrap();
        assert!(map.size() >= 1);
    }

    #[test]
    fn reserve_grows_by_one_point_five_and_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = MemoryMap::open(dir.path().join("f")).unwrap();
        map.reserve(100).unwrap();
        let grown = map.size();
        assert!(grown >= 100);
        map.reserve(50).unwrap();
        assert_eq!(map.size(), grown, "reserve with smaller n must not shrink");
    }

    #[test]
    fn data_persists_across_reserve() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = MemoryMap::open(dir.path().join("f")).unwrap();
        map.reserve(16).unwrap();
        map.data_mut()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        map.reserve(1000).unwrap();
        assert_eq!(&map.data()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn reopen_sees_flushed_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        {
            let mut map = MemoryMap::open(&path).unwrap();
            map.reserve(8).unwrap();
            map.data_mut()[0..8].copy_from_slice(&[9u8; 8]);
            map.close().unwrap();
        }
        let map = MemoryMap::open(&path).unwrap();
        assert_eq!(&map.data()[0..8], &[9u8; 8]);
    }
}
