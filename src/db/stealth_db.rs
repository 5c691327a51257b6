use crate::error::Result;
use crate::storage::{RecordAllocator, SlabAllocator};
use crate::types::Hash32;
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

/// `[ephemeral-key:32][address-hash:20][tx-hash:32]`.
pub const STEALTH_ROW_SIZE: usize = 32 + 20 + 32;

/// One stealth scan candidate: a payment whose address hash a watcher can
/// only discover by deriving it from the transaction's ephemeral key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealthRow {
    pub ephemeral_key: Hash32,
    pub address_hash: [u8; 20],
    pub tx_hash: Hash32,
}

impl StealthRow {
    fn to_bytes(self) -> [u8; STEALTH_ROW_SIZE] {
        let mut out = [0u8; STEALTH_ROW_SIZE];
        out[0..32].copy_from_slice(self.ephemeral_key.as_bytes());
        out[32..52].copy_from_slice(&self.address_hash);
        out[52..84].copy_from_slice(self.tx_hash.as_bytes());
        out
    }

    fn parse(raw: &[u8]) -> Self {
        let mut address_hash = [0u8; 20];
        address_hash.copy_from_slice(&raw[32..52]);
        StealthRow {
            ephemeral_key: Hash32::from_slice(&raw[0..32]).expect("32-byte slice"),
            address_hash,
            tx_hash: Hash32::from_slice(&raw[52..84]).expect("32-byte slice"),
        }
    }
}

/// Height-sharded scan index: each block's rows occupy a contiguous run
/// of the row slab, sorted by the scan prefix of `ephemeral_key`, so a
/// watcher can binary-search within a block's shard instead of scanning
/// the whole history.
pub struct StealthDb {
    /// `height -> start position` into `rows`.
    heights: RecordAllocator,
    rows: SlabAllocator,
}

impl StealthDb {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(StealthDb {
            heights: RecordAllocator::open(dir.join("stealth_index"), 8)?,
            rows: SlabAllocator::open(dir.join("stealth_rows"))?,
        })
    }

    /// Writes `rows` (sorted by scan prefix) as the shard for `height`.
    /// Must be called once per height in increasing order, even when
    /// `rows` is empty, to keep the height index aligned with the block
    /// chain it mirrors.
    pub fn store_block(&mut self, height: u32, rows: &[StealthRow]) -> Result<()> {
        let mut sorted = rows.to_vec();
        sorted.sort_by(|a, b| a.ephemeral_key.as_bytes().cmp(b.ephemeral_key.as_bytes()));

        let start = self.rows.allocate(sorted.len() as u64 * STEALTH_ROW_SIZE as u64)?;
        for (i, row) in sorted.iter().enumerate() {
            let position = start + i as u64 * STEALTH_ROW_SIZE as u64;
            self.rows.get_mut(position, STEALTH_ROW_SIZE)?.copy_from_slice(&row.to_bytes());
        }

        let idx = self.heights.allocate()?;
        debug_assert_eq!(idx, height);
        LittleEndian::write_u64(self.heights.get_mut(idx)?, start);
        Ok(())
    }

    fn shard_bounds(&self, height: u32) -> Result<Option<(u64, u64)>> {
        if height >= self.heights.count() {
            return Ok(None);
        }
        let start = LittleEndian::read_u64(self.heights.get(height)?);
        let end = if height + 1 < self.heights.count() {
            LittleEndian::read_u64(self.heights.get(height + 1)?)
        } else {
            self.rows.end()
        };
        Ok(Some((start, end)))
    }

    fn row_at(&self, position: u64) -> Result<StealthRow> {
        Ok(StealthRow::parse(self.rows.get(position, STEALTH_ROW_SIZE)?))
    }

    /// Binary-searches into each block's sorted shard at or above
    /// `from_height`, collecting every row whose ephemeral key starts
    /// with `prefix`.
    pub fn scan(&self, prefix: &[u8], from_height: u32) -> Result<Vec<(u32, StealthRow)>> {
        let mut out = Vec::new();
        for height in from_height..self.heights.count() {
            let (start, end) = match self.shard_bounds(height)? {
                Some(b) => b,
                None => continue,
            };
            let row_count = ((end - start) / STEALTH_ROW_SIZE as u64) as usize;
            if row_count == 0 {
                continue;
            }
            let mut lo = 0usize;
            let mut hi = row_count;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let row = self.row_at(start + mid as u64 * STEALTH_ROW_SIZE as u64)?;
                if row.ephemeral_key.as_bytes()[0..prefix.len()] < *prefix {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let mut i = lo;
            while i < row_count {
                let row = self.row_at(start + i as u64 * STEALTH_ROW_SIZE as u64)?;
                if &row.ephemeral_key.as_bytes()[0..prefix.len()] != prefix {
                    break;
                }
                out.push((height, row));
                i += 1;
            }
        }
        Ok(out)
    }

    /// Rewinds the row slab to the start of `height`'s shard and the
    /// height index to no longer reach it, discarding that block's rows.
    pub fn unlink(&mut self, height: u32) -> Result<()> {
        if let Some((start, _)) = self.shard_bounds(height)? {
            self.rows.truncate(start);
        }
        self.heights.truncate(height);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.heights.sync()?;
        self.rows.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(prefix_byte: u8, addr: u8) -> StealthRow {
        let mut ephem = [0u8; 32];
        ephem[0] = prefix_byte;
        StealthRow {
            ephemeral_key: Hash32(ephem),
            address_hash: [addr; 20],
            tx_hash: Hash32([addr; 32]),
        }
    }

    #[test]
    fn store_then_scan_finds_matching_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = StealthDb::open(dir.path()).unwrap();
        db.store_block(0, &[row(1, 1), row(3, 3), row(2, 2)]).unwrap();
        db.sync().unwrap();

        let hits = db.scan(&[2], 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.address_hash, [2u8; 20]);
    }

    #[test]
    fn unlink_discards_only_that_height() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = StealthDb::open(dir.path()).unwrap();
        db.store_block(0, &[row(5, 5)]).unwrap();
        db.sync().unwrap();
        db.store_block(1, &[row(5, 9)]).unwrap();
        db.sync().unwrap();

        db.unlink(1).unwrap();
        db.sync().unwrap();

        let hits = db.scan(&[5], 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[0].1.address_hash, [5u8; 20]);
    }

    #[test]
    fn from_height_excludes_earlier_shards() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = StealthDb::open(dir.path()).unwrap();
        db.store_block(0, &[row(7, 1)]).unwrap();
        db.store_block(1, &[row(7, 2)]).unwrap();
        db.sync().unwrap();

        let hits = db.scan(&[7], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.address_hash, [2u8; 20]);
    }
}
