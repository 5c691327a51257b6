use crate::error::{Error, Result};
use crate::storage::{RecordAllocator, RecordHashTable, SlabAllocator, SlabHashTable};
use crate::types::{BlockHeader, Hash32};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

const ROW_PREFIX: usize = BlockHeader::SERIALIZED_SIZE + 4;

/// A view over one stored block's `[header:80][tx_count:u32][tx_hash ×
/// tx_count]` slab.
pub struct BlockRow<'a> {
    raw: &'a [u8],
}

impl<'a> BlockRow<'a> {
    pub fn header(&self) -> BlockHeader {
        let mut bytes = [0u8; 80];
        bytes.copy_from_slice(&self.raw[0..80]);
        BlockHeader::from_bytes(&bytes)
    }

    pub fn tx_count(&self) -> u32 {
        LittleEndian::read_u32(&self.raw[80..84])
    }

    pub fn tx_hash(&self, index: u32) -> Option<Hash32> {
        if index >= self.tx_count() {
            return None;
        }
        let offset = ROW_PREFIX + index as usize * 32;
        Hash32::from_slice(&self.raw[offset..offset + 32])
    }
}

/// Header-indexed (by height) and hash-indexed block metadata plus the
/// ordered list of transaction hashes for each block.
pub struct BlockDb {
    index: RecordAllocator,
    lookup: SlabHashTable,
    rows: SlabAllocator,
    heights: RecordHashTable,
}

impl BlockDb {
    pub fn open(dir: impl AsRef<Path>, buckets: u64) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(BlockDb {
            index: RecordAllocator::open(dir.join("block_index"), 8)?,
            lookup: SlabHashTable::open(dir.join("block_lookup"), buckets, 32)?,
            rows: SlabAllocator::open(dir.join("block_rows"))?,
            heights: RecordHashTable::open(dir.join("block_heights"), buckets as u32, 32, 4)?,
        })
    }

    /// The height at which `hash` was stored, if it has ever been
    /// written — even a popped block's height remains resolvable here,
    /// the same way `get_by_hash` does (used by the organizer to find a
    /// branch's fork height).
    pub fn height_of(&self, hash: &Hash32) -> Result<Option<u32>> {
        Ok(self.heights.get(hash.as_bytes())?.map(LittleEndian::read_u32))
    }

    /// The height of the top block, or `None` if the chain is empty.
    pub fn top(&self) -> Option<u32> {
        let count = self.index.count();
        if count == 0 {
            None
        } else {
            Some(count - 1)
        }
    }

    fn row_bytes(header: &BlockHeader, tx_hashes: &[Hash32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ROW_PREFIX + tx_hashes.len() * 32);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&(tx_hashes.len() as u32).to_le_bytes());
        for h in tx_hashes {
            out.extend_from_slice(h.as_bytes());
        }
        out
    }

    /// Writes the block at `height = top + 1` (0 if empty): the row slab,
    /// the height index entry, and the hash lookup. Returns the assigned
    /// height.
    pub fn store(&mut self, header: &BlockHeader, tx_hashes: &[Hash32]) -> Result<u32> {
        let height = self.index.count();
        let row = Self::row_bytes(header, tx_hashes);
        let position = self.rows.allocate(row.len() as u64)?;
        self.rows.get_mut(position, row.len())?.copy_from_slice(&row);

        let idx = self.index.allocate()?;
        debug_assert_eq!(idx, height);
        LittleEndian::write_u64(self.index.get_mut(idx)?, position);

        let hash = header.hash();
        self.lookup
            .store(hash.as_bytes(), 8, |v| LittleEndian::write_u64(v, position))?;
        self.heights
            .store(hash.as_bytes(), |v| LittleEndian::write_u32(v, height))?;
        Ok(height)
    }

    fn row_at(&self, position: u64) -> Result<BlockRow<'_>> {
        let prefix = self.rows.get(position, ROW_PREFIX)?;
        let count = LittleEndian::read_u32(&prefix[80..84]);
        let raw = self.rows.get(position, ROW_PREFIX + count as usize * 32)?;
        Ok(BlockRow { raw })
    }

    pub fn get_by_height(&self, height: u32) -> Result<BlockRow<'_>> {
        if height >= self.index.count() {
            return Err(Error::NotFound);
        }
        let position = LittleEndian::read_u64(self.index.get(height)?);
        self.row_at(position)
    }

    pub fn get_by_hash(&self, hash: &Hash32) -> Result<Option<BlockRow<'_>>> {
        match self.lookup.get(hash.as_bytes(), 8)? {
            Some(v) => {
                let position = LittleEndian::read_u64(v);
                Ok(Some(self.row_at(position)?))
            }
            None => Ok(None),
        }
    }

    /// Decrements the height index so `height` is no longer reachable by
    /// `get_by_height`/`top`. Space in the row slab and the hash lookup
    /// is not reclaimed; `get_by_hash` keeps resolving the popped
    /// block's hash until overwritten by a later `store` — callers must
    /// treat `top()` as the authoritative confirmed state.
    pub fn unlink(&mut self, height: u32) {
        self.index.truncate(height);
    }

    pub fn sync(&mut self) -> Result<()> {
        self.index.sync()?;
        self.lookup.sync()?;
        self.heights.sync()?;
        self.rows.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_hash: Hash32::ZERO,
            merkle_root: Hash32::ZERO,
            timestamp: 0,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    #[test]
    fn store_then_get_by_height_and_hash_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = BlockDb::open(dir.path(), 16).unwrap();
        let h = header(1);
        let tx_hashes = vec![Hash32::from_slice(&[7u8; 32]).unwrap()];
        let height = db.store(&h, &tx_hashes).unwrap();
        db.sync().unwrap();
        assert_eq!(height, 0);
        assert_eq!(db.top(), Some(0));

        let row = db.get_by_height(0).unwrap();
        assert_eq!(row.header(), h);
        assert_eq!(row.tx_count(), 1);
        assert_eq!(row.tx_hash(0), Some(tx_hashes[0]));

        let by_hash = db.get_by_hash(&h.hash()).unwrap().unwrap();
        assert_eq!(by_hash.header(), h);
    }

    #[test]
    fn unlink_rolls_back_top_but_keeps_hash_resolvable() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = BlockDb::open(dir.path(), 16).unwrap();
        let h = header(2);
        db.store(&h, &[Hash32::from_slice(&[1u8; 32]).unwrap()]).unwrap();
        db.sync().unwrap();
        db.unlink(0);
        db.sync().unwrap();
        assert_eq!(db.top(), None);
        assert!(db.get_by_hash(&h.hash()).unwrap().is_some());
    }

    #[test]
    fn missing_height_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = BlockDb::open(dir.path(), 16).unwrap();
        match db.get_by_height(0) {
            Err(Error::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.is_ok()),
        }
    }
}
