use super::mmap_file::MemoryMap;
use super::record_store::RecordAllocator;
use super::slab_store::SlabAllocator;
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::path::Path;

const U32_EMPTY: u32 = u32::MAX;
const U64_EMPTY: u64 = u64::MAX;

fn bucket_index_u32(key: &[u8], buckets: u32) -> u32 {
    let k = BigEndian::read_u32(&key[0..4]);
    k % buckets
}

fn bucket_index_u64(key: &[u8], buckets: u64) -> u64 {
    let k = BigEndian::read_u64(&key[0..8]);
    k % buckets
}

/// An open-addressed hash table whose buckets each hold the head of an
/// intrusively-chained list of fixed-size records: `[key][next:
/// u32][value]`. `next` is a record index, or `U32_EMPTY` for "end of
/// chain". Bucket count is fixed at creation.
///
/// Ordering within a bucket is newest-first: `store` always splices at
/// the head, so `get` returns the most recently stored value for a key.
/// Re-`store`-ing a key that hasn't been `unlink`ed first shadows the
/// earlier value rather than replacing it — this table
/// does not protect callers against that.
pub struct RecordHashTable {
    buckets: u32,
    key_size: usize,
    value_size: usize,
    items: RecordAllocator,
}

impl RecordHashTable {
    pub fn open(path: impl AsRef<Path>, buckets: u32, key_size: usize, value_size: usize) -> Result<Self> {
        let bucket_bytes = buckets as u64 * 4;
        let map = MemoryMap::open(path)?;
        let item_size = key_size + 4 + value_size;
        let items = RecordAllocator::embedded(map, bucket_bytes, item_size)?;
        let mut table = RecordHashTable {
            buckets,
            key_size,
            value_size,
            items,
        };
        table.ensure_bucket_array_initialized()?;
        Ok(table)
    }

    fn ensure_bucket_array_initialized(&mut self) -> Result<()> {
        let needed = self.buckets as u64 * 4;
        if self.items.map().size() < needed {
            self.items.map_mut().reserve(needed)?;
        }
        // A freshly zero-extended region reads as all-zero buckets, which
        // would look like bucket index 0 pointing at record 0. Detect an
        // uninitialized array (all zero bytes, which cannot arise once
        // even a single bucket has been written since a real head is
        // either U32_EMPTY or a valid index written alongside a nonzero
        // synced item count) by checking the backing item count: a fresh
        // file has item count 0, so we unconditionally stamp the
        // sentinel the first time we see a zero count and a zero-filled
        // array.
        if self.items.count() == 0 {
            let data = self.items.map_mut().data_mut();
            let all_zero = data[0..needed as usize].iter().all(|b| *b == 0);
            if all_zero {
                for i in 0..self.buckets {
                    let off = i as usize * 4;
                    LittleEndian::write_u32(&mut data[off..off + 4], U32_EMPTY);
                }
            }
        }
        Ok(())
    }

    fn bucket_head(&self, bucket: u32) -> u32 {
        let off = bucket as usize * 4;
        LittleEndian::read_u32(&self.items.map().data()[off..off + 4])
    }

    fn set_bucket_head(&mut self, bucket: u32, value: u32) {
        let off = bucket as usize * 4;
        LittleEndian::write_u32(&mut self.items.map_mut().data_mut()[off..off + 4], value);
    }

    fn item_key<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        &raw[0..self.key_size]
    }

    fn item_next(&self, raw: &[u8]) -> u32 {
        LittleEndian::read_u32(&raw[self.key_size..self.key_size + 4])
    }

    fn item_value<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        &raw[self.key_size + 4..self.key_size + 4 + self.value_size]
    }

    /// Allocates a new item, writes `key`, links it at the bucket head,
    /// calls `write_fn` with the value's byte range, then repoints the
    /// bucket header at the new item.
    pub fn store(&mut self, key: &[u8], write_fn: impl FnOnce(&mut [u8])) -> Result<()> {
        debug_assert_eq!(key.len(), self.key_size);
        let bucket = bucket_index_u32(key, self.buckets);
        let old_head = self.bucket_head(bucket);
        let index = self.items.allocate()?;
        {
            let raw = self.items.get_mut(index)?;
            raw[0..self.key_size].copy_from_slice(key);
            LittleEndian::write_u32(&mut raw[self.key_size..self.key_size + 4], old_head);
            write_fn(&mut raw[self.key_size + 4..self.key_size + 4 + self.value_size]);
        }
        self.set_bucket_head(bucket, index);
        Ok(())
    }

    /// Walks the bucket chain comparing keys byte-wise; returns the
    /// value view of the first (newest) match. A self-link (`next`
    /// pointing at its own item) is corruption, surfaced fatally.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        let bucket = bucket_index_u32(key, self.buckets);
        let mut current = self.bucket_head(bucket);
        while current != U32_EMPTY {
            let raw = self.items.get(current)?;
            if self.item_key(raw) == key {
                return Ok(Some(self.item_value(raw)));
            }
            let next = self.item_next(raw);
            if next == current {
                return Err(Error::Corrupt(format!(
                    "self-link at record {} in bucket {}",
                    current, bucket
                )));
            }
            current = next;
        }
        Ok(None)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Walks the chain; when the match is found, patches the previous
    /// link (or the bucket head if it was first) to skip it. Space is
    /// not reclaimed.
    pub fn unlink(&mut self, key: &[u8]) -> Result<bool> {
        let bucket = bucket_index_u32(key, self.buckets);
        let mut current = self.bucket_head(bucket);
        let mut previous: Option<u32> = None;
        while current != U32_EMPTY {
            let raw = self.items.get(current)?;
            let next = self.item_next(raw);
            if next == current {
                return Err(Error::Corrupt(format!("self-link at record {}", current)));
            }
            if self.item_key(raw) == key {
                match previous {
                    Some(prev) => {
                        let praw = self.items.get_mut(prev)?;
                        LittleEndian::write_u32(
                            &mut praw[self.key_size..self.key_size + 4],
                            next,
                        );
                    }
                    None => self.set_bucket_head(bucket, next),
                }
                return Ok(true);
            }
            previous = Some(current);
            current = next;
        }
        Ok(false)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.items.sync()
    }

    /// Overwrites an existing item's value bytes in place, without
    /// reallocating or relinking. Used by the multimap overlay to
    /// repoint a key's head pointer at a freshly-added row with a
    /// single aligned write rather than an unlink+store pair.
    pub fn update(&mut self, key: &[u8], write_fn: impl FnOnce(&mut [u8])) -> Result<bool> {
        let bucket = bucket_index_u32(key, self.buckets);
        let mut current = self.bucket_head(bucket);
        while current != U32_EMPTY {
            let raw = self.items.get(current)?;
            let next = self.item_next(raw);
            if next == current {
                return Err(Error::Corrupt(format!("self-link at record {}", current)));
            }
            if self.item_key(raw) == key {
                let raw = self.items.get_mut(current)?;
                write_fn(&mut raw[self.key_size + 4..self.key_size + 4 + self.value_size]);
                return Ok(true);
            }
            current = next;
        }
        Ok(false)
    }
}

/// Same contract as `RecordHashTable`, over a slab allocator with
/// 64-bit positions and variable-length values (`[key][next:
/// u64][value]`).
pub struct SlabHashTable {
    buckets: u64,
    key_size: usize,
    items: SlabAllocator,
}

impl SlabHashTable {
    pub fn open(path: impl AsRef<Path>, buckets: u64, key_size: usize) -> Result<Self> {
        let bucket_bytes = buckets * 8;
        let map = MemoryMap::open(path)?;
        let items = SlabAllocator::embedded(map, bucket_bytes)?;
        let mut table = SlabHashTable {
            buckets,
            key_size,
            items,
        };
        table.ensure_bucket_array_initialized()?;
        Ok(table)
    }

    fn ensure_bucket_array_initialized(&mut self) -> Result<()> {
        let needed = self.buckets * 8;
        if self.items.map().size() < needed {
            self.items.map_mut().reserve(needed)?;
        }
        if self.items.end() == needed + 8 || self.items.end() == needed {
            let data = self.items.map_mut().data_mut();
            let all_zero = data[0..needed as usize].iter().all(|b| *b == 0);
            if all_zero {
                for i in 0..self.buckets {
                    let off = i as usize * 8;
                    LittleEndian::write_u64(&mut data[off..off + 8], U64_EMPTY);
                }
            }
        }
        Ok(())
    }

    fn bucket_head(&self, bucket: u64) -> u64 {
        let off = bucket as usize * 8;
        LittleEndian::read_u64(&self.items.map().data()[off..off + 8])
    }

    fn set_bucket_head(&mut self, bucket: u64, value: u64) {
        let off = bucket as usize * 8;
        LittleEndian::write_u64(&mut self.items.map_mut().data_mut()[off..off + 8], value);
    }

    fn item_size(&self, value_size: usize) -> usize {
        self.key_size + 8 + value_size
    }

    /// Stores `key -> value` where `value`'s length is `value_size`,
    /// written by `write_fn`.
    pub fn store(&mut self, key: &[u8], value_size: usize, write_fn: impl FnOnce(&mut [u8])) -> Result<u64> {
        debug_assert_eq!(key.len(), self.key_size);
        let bucket = bucket_index_u64(key, self.buckets);
        let old_head = self.bucket_head(bucket);
        let size = self.item_size(value_size) as u64;
        let position = self.items.allocate(size)?;
        {
            let raw = self.items.get_mut(position, size as usize)?;
            raw[0..self.key_size].copy_from_slice(key);
            LittleEndian::write_u64(&mut raw[self.key_size..self.key_size + 8], old_head);
            write_fn(&mut raw[self.key_size + 8..]);
        }
        self.set_bucket_head(bucket, position);
        Ok(position)
    }

    /// Returns the value view for `key`, given the caller-known value
    /// size (slab items don't self-describe their length).
    pub fn get(&self, key: &[u8], value_size: usize) -> Result<Option<&[u8]>> {
        let bucket = bucket_index_u64(key, self.buckets);
        let mut current = self.bucket_head(bucket);
        let size = self.item_size(value_size) as usize;
        while current != U64_EMPTY {
            let raw = self.items.get(current, size)?;
            let item_key = &raw[0..self.key_size];
            if item_key == key {
                return Ok(Some(&raw[self.key_size + 8..]));
            }
            let next = LittleEndian::read_u64(&raw[self.key_size..self.key_size + 8]);
            if next == current {
                return Err(Error::Corrupt(format!("self-link at slab {}", current)));
            }
            current = next;
        }
        Ok(None)
    }

    /// Same as `get`, but for values whose total length the caller
    /// doesn't know up front (e.g. a serialized transaction, which is
    /// self-terminating but not length-prefixed). Returns a slice
    /// starting at the value and running to the end of the slab file —
    /// this may include bytes belonging to items allocated after it, so
    /// the caller must parse a self-describing format that stops on its
    /// own rather than trusting the slice's length.
    pub fn get_tail(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        let bucket = bucket_index_u64(key, self.buckets);
        let mut current = self.bucket_head(bucket);
        let header_size = self.key_size + 8;
        while current != U64_EMPTY {
            let header = self.items.get(current, header_size)?;
            let item_key = &header[0..self.key_size];
            let next = LittleEndian::read_u64(&header[self.key_size..self.key_size + 8]);
            if next == current {
                return Err(Error::Corrupt(format!("self-link at slab {}", current)));
            }
            if item_key == key {
                let value_start = current + header_size as u64;
                let remaining = (self.items.end() - value_start) as usize;
                let full = self.items.get(value_start, remaining)?;
                return Ok(Some(full));
            }
            current = next;
        }
        Ok(None)
    }

    pub fn unlink(&mut self, key: &[u8], value_size: usize) -> Result<bool> {
        let bucket = bucket_index_u64(key, self.buckets);
        let mut current = self.bucket_head(bucket);
        let size = self.item_size(value_size) as usize;
        let mut previous: Option<u64> = None;
        while current != U64_EMPTY {
            let raw = self.items.get(current, size)?;
            let item_key = raw[0..self.key_size].to_vec();
            let next = LittleEndian::read_u64(&raw[self.key_size..self.key_size + 8]);
            if next == current {
                return Err(Error::Corrupt(format!("self-link at slab {}", current)));
            }
            if item_key == key {
                match previous {
                    Some(prev) => {
                        let praw = self.items.get_mut(prev, size)?;
                        LittleEndian::write_u64(&mut praw[self.key_size..self.key_size + 8], next);
                    }
                    None => self.set_bucket_head(bucket, next),
                }
                return Ok(true);
            }
            previous = Some(current);
            current = next;
        }
        Ok(false)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.items.sync()
    }

    pub(crate) fn items(&self) -> &SlabAllocator {
        &self.items
    }

    pub(crate) fn items_mut(&mut self) -> &mut SlabAllocator {
        &mut self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_table_store_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = RecordHashTable::open(dir.path().join("h"), 16, 4, 8).unwrap();
        t.store(&[0, 0, 0, 1], |v| v.copy_from_slice(&[9u8; 8])).unwrap();
        t.sync().unwrap();
        assert_eq!(t.get(&[0, 0, 0, 1]).unwrap(), Some(&[9u8; 8][..]));
        assert_eq!(t.get(&[0, 0, 0, 2]).unwrap(), None);
    }

    #[test]
    fn record_table_unlink_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = RecordHashTable::open(dir.path().join("h"), 16, 4, 8).unwrap();
        t.store(&[0, 0, 0, 1], |v| v.copy_from_slice(&[9u8; 8])).unwrap();
        t.sync().unwrap();
        assert!(t.unlink(&[0, 0, 0, 1]).unwrap());
        assert_eq!(t.get(&[0, 0, 0, 1]).unwrap(), None);
    }

    #[test]
    fn record_table_lifo_order_within_bucket() {
        let dir = tempfile::tempdir().unwrap();
        // single bucket so both keys collide and chain together
        let mut t = RecordHashTable::open(dir.path().join("h"), 1, 4, 1).unwrap();
        t.store(&[0, 0, 0, 1], |v| v[0] = 1).unwrap();
        t.store(&[0, 0, 0, 1], |v| v[0] = 2).unwrap();
        t.sync().unwrap();
        assert_eq!(t.get(&[0, 0, 0, 1]).unwrap(), Some(&[2u8][..]));
    }

    #[test]
    fn record_table_self_link_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = RecordHashTable::open(dir.path().join("h"), 4, 4, 1).unwrap();
        t.store(&[0, 0, 0, 1], |v| v[0] = 7).unwrap();
        t.sync().unwrap();
        // Corrupt the item's `next` pointer to point at itself.
        let raw = t.items.get_mut(0).unwrap();
        LittleEndian::write_u32(&mut raw[4..8], 0);
        match t.get(&[0, 0, 0, 1]) {
            Err(Error::Corrupt(_)) => {}
            other => panic!("expected corruption error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn slab_table_store_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = SlabHashTable::open(dir.path().join("h"), 16, 8).unwrap();
        let key = [0u8, 0, 0, 0, 0, 0, 0, 1];
        t.store(&key, 5, |v| v.copy_from_slice(b"hello")).unwrap();
        t.sync().unwrap();
        assert_eq!(t.get(&key, 5).unwrap(), Some(&b"hello"[..]));
    }

    #[test]
    fn slab_table_get_tail_returns_value_onward() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = SlabHashTable::open(dir.path().join("h"), 16, 8).unwrap();
        let key = [0u8, 0, 0, 0, 0, 0, 0, 1];
        t.store(&key, 5, |v| v.copy_from_slice(b"hello")).unwrap();
        t.sync().unwrap();
        let tail = t.get_tail(&key).unwrap().unwrap();
        assert_eq!(&tail[0..5], b"hello");
    }

    #[test]
    fn slab_table_unlink_then_get_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = SlabHashTable::open(dir.path().join("h"), 16, 8).unwrap();
        let key = [0u8; 8];
        t.store(&key, 3, |v| v.copy_from_slice(b"abc")).unwrap();
        t.sync().unwrap();
        assert!(t.unlink(&key, 3).unwrap());
        assert_eq!(t.get(&key, 3).unwrap(), None);
    }
}
