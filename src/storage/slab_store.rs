use super::mmap_file::MemoryMap;
use crate::error::Result;
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

const HEADER_SIZE: u64 = 8;

/// Variable-size slab allocator: `[end:u64][slabs]`. Same crash
/// discipline as `RecordAllocator`: `allocate` advances an in-memory
/// tentative end offset and grows the mapping; only `sync` commits that
/// offset to the header.
pub struct SlabAllocator {
    map: MemoryMap,
    /// Byte offset at which this allocator's own `[end][slabs...]`
    /// layout begins; non-zero when embedded after a hash-table bucket
    /// array in the same file.
    base: u64,
    synced_end: u64,
    next_end: u64,
}

impl SlabAllocator {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut map = MemoryMap::open(path)?;
        if map.size() < HEADER_SIZE {
            map.reserve(HEADER_SIZE)?;
        }
        let mut store = SlabAllocator {
            map,
            base: 0,
            synced_end: 0,
            next_end: 0,
        };
        store.start()?;
        Ok(store)
    }

    pub(crate) fn embedded(mut map: MemoryMap, base: u64) -> Result<Self> {
        if map.size() < base + HEADER_SIZE {
            map.reserve(base + HEADER_SIZE)?;
        }
        let mut store = SlabAllocator {
            map,
            base,
            synced_end: 0,
            next_end: 0,
        };
        store.start()?;
        Ok(store)
    }

    pub(crate) fn into_map(self) -> MemoryMap {
        self.map
    }

    pub(crate) fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub(crate) fn map_mut(&mut self) -> &mut MemoryMap {
        &mut self.map
    }

    pub fn start(&mut self) -> Result<()> {
        let base = self.base as usize;
        let end = LittleEndian::read_u64(&self.map.data()[base..base + 8]);
        // A freshly created header is 0, meaning the first slab begins
        // right after the header.
        let end = end.max(self.base + HEADER_SIZE);
        self.synced_end = end;
        self.next_end = end;
        Ok(())
    }

    pub fn end(&self) -> u64 {
        self.synced_end
    }

    /// Returns the current tentative end and advances it by `size`.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        let position = self.next_end;
        self.next_end += size;
        self.map.reserve(self.next_end)?;
        Ok(position)
    }

    pub fn get(&self, position: u64, size: usize) -> Result<&[u8]> {
        let start = position as usize;
        let end = start + size;
        if end as u64 > self.map.size() {
            return Err(crate::error::Error::NotFound);
        }
        Ok(&self.map.data()[start..end])
    }

    pub fn get_mut(&mut self, position: u64, size: usize) -> Result<&mut [u8]> {
        let start = position as usize;
        let end = start + size;
        if end as u64 > self.map.size() {
            return Err(crate::error::Error::NotFound);
        }
        Ok(&mut self.map.data_mut()[start..end])
    }

    pub fn sync(&mut self) -> Result<()> {
        let base = self.base as usize;
        LittleEndian::write_u64(&mut self.map.data_mut()[base..base + 8], self.next_end);
        self.synced_end = self.next_end;
        self.map.flush()
    }

    /// Rewinds the tentative (and, once synced, the committed) end
    /// offset to `position`, discarding everything written after it.
    /// Used by the stealth database's per-height `unlink`.
    pub fn truncate(&mut self, position: u64) {
        self.next_end = position.max(self.base + HEADER_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_starts_after_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SlabAllocator::open(dir.path().join("s")).unwrap();
        let pos = store.allocate(10).unwrap();
        assert_eq!(pos, HEADER_SIZE);
    }

    #[test]
    fn allocate_then_sync_persists_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        {
            let mut store = SlabAllocator::open(&path).unwrap();
            let pos = store.allocate(16).unwrap();
            store.get_mut(pos, 16).unwrap().copy_from_slice(&[3u8; 16]);
            store.sync().unwrap();
        }
        let store = SlabAllocator::open(&path).unwrap();
        assert_eq!(store.end(), HEADER_SIZE + 16);
        assert_eq!(store.get(HEADER_SIZE, 16).unwrap(), &[3u8; 16]);
    }

    #[test]
    fn truncate_discards_trailing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SlabAllocator::open(dir.path().join("s")).unwrap();
        let first = store.allocate(8).unwrap();
        store.sync().unwrap();
        store.allocate(8).unwrap();
        store.sync().unwrap();
        assert_eq!(store.end(), HEADER_SIZE + 16);
        store.truncate(first + 8);
        store.sync().unwrap();
        assert_eq!(store.end(), HEADER_SIZE + 8);
    }
}
