use super::mmap_file::MemoryMap;
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

const HEADER_SIZE: u64 = 4;

/// Fixed-size record allocator: `[count:u32][records: count * record_size]`.
///
/// `allocate` reserves the next index and grows the mapping, but the
/// on-disk `count` is only advanced by `sync`. That split is what makes
/// crash recovery safe: a crash between `allocate` and `sync` leaves the
/// synced `count` unchanged, so the tentative record is simply never
/// reachable again once the file is reopened.
pub struct RecordAllocator {
    map: MemoryMap,
    /// Byte offset at which this allocator's own `[count][records...]`
    /// layout begins. Non-zero when the allocator is embedded after a
    /// hash-table bucket array in the same file (see `hash_table.rs`).
    base: u64,
    record_size: usize,
    /// On-disk, synced record count.
    synced_count: u32,
    /// Next index to hand out; advances ahead of `synced_count` between
    /// `allocate` and `sync`.
    next_index: u32,
}

impl RecordAllocator {
    pub fn open(path: impl AsRef<Path>, record_size: usize) -> Result<Self> {
        let mut map = MemoryMap::open(path)?;
        if map.size() < HEADER_SIZE {
            map.reserve(HEADER_SIZE)?;
        }
        let mut store = RecordAllocator {
            map,
            base: 0,
            record_size,
            synced_count: 0,
            next_index: 0,
        };
        store.start()?;
        Ok(store)
    }

    /// Builds an allocator whose header begins at `base` within an
    /// already-open mapping, for embedding after a hash-table bucket
    /// array.
    pub(crate) fn embedded(mut map: MemoryMap, base: u64, record_size: usize) -> Result<Self> {
        if map.size() < base + HEADER_SIZE {
            map.reserve(base + HEADER_SIZE)?;
        }
        let mut store = RecordAllocator {
            map,
            base,
            record_size,
            synced_count: 0,
            next_index: 0,
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

    /// Re-reads the header count, discarding any tentative (unsynced)
    /// allocations from a prior crash.
    pub fn start(&mut self) -> Result<()> {
        let base = self.base as usize;
        let count = LittleEndian::read_u32(&self.map.data()[base..base + 4]);
        self.synced_count = count;
        self.next_index = count;
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.synced_count
    }

    fn offset(&self, index: u32) -> u64 {
        self.base + HEADER_SIZE + index as u64 * self.record_size as u64
    }

    /// Reserves index `next_index`, advances it, and grows the mapping
    /// to fit. The new record's bytes are undefined until written.
    pub fn allocate(&mut self) -> Result<u32> {
        let index = self.next_index;
        self.next_index = self
            .next_index
            .checked_add(1)
            .ok_or_else(|| Error::OperationFailed("record index overflow".into()))?;
        let end = self.offset(index) + self.record_size as u64;
        self.map.reserve(end)?;
        Ok(index)
    }

    pub fn get(&self, index: u32) -> Result<&[u8]> {
        let offset = self.offset(index) as usize;
        let end = offset + self.record_size;
        if end as u64 > self.map.size() {
            return Err(Error::NotFound);
        }
        Ok(&self.map.data()[offset..end])
    }

    pub fn get_mut(&mut self, index: u32) -> Result<&mut [u8]> {
        let offset = self.offset(index) as usize;
        let end = offset + self.record_size;
        if end as u64 > self.map.size() {
            return Err(Error::NotFound);
        }
        Ok(&mut self.map.data_mut()[offset..end])
    }

    /// Writes the new count to the file header. Must be called after
    /// writing the new record's bytes.
    pub fn sync(&mut self) -> Result<()> {
        let base = self.base as usize;
        LittleEndian::write_u32(&mut self.map.data_mut()[base..base + 4], self.next_index);
        self.synced_count = self.next_index;
        self.map.flush()
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Rewinds the tentative (and, once synced, the committed) record
    /// count to `count`, discarding everything allocated after it. Used
    /// by `pop` to roll the height index back to the prior top.
    pub fn truncate(&mut self, count: u32) {
        self.next_index = count.min(self.next_index);
    }
}
