use super::hash_table::RecordHashTable;
use super::record_store::RecordAllocator;
use crate::error::Result;
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

const EMPTY: u32 = u32::MAX;

/// A hash-table from key to head row index, plus a linked list of
/// equal-sized rows sharing a key. Every row's final four
/// bytes are its own `next` pointer (a row index, or `EMPTY`); rows are
/// otherwise opaque to the multimap.
///
/// Row ordering is LIFO: `add_row` always splices at the head, so
/// `delete_last_row` reverses the most recent `add_row` for that key —
/// the property `pop`/reorg rollback depends on.
pub struct MultiMap {
    heads: RecordHashTable,
    rows: RecordAllocator,
    row_size: usize,
}

impl MultiMap {
    pub fn open(
        heads_path: impl AsRef<Path>,
        rows_path: impl AsRef<Path>,
        buckets: u32,
        key_size: usize,
        row_size: usize,
    ) -> Result<Self> {
        let heads = RecordHashTable::open(heads_path, buckets, key_size, 4)?;
        let rows = RecordAllocator::open(rows_path, row_size)?;
        Ok(MultiMap { heads, rows, row_size })
    }

    fn next_offset(&self) -> usize {
        self.row_size - 4
    }

    fn row_next(&self, raw: &[u8]) -> u32 {
        LittleEndian::read_u32(&raw[self.next_offset()..self.row_size])
    }

    fn set_row_next(&self, raw: &mut [u8], next: u32) {
        LittleEndian::write_u32(&mut raw[self.next_offset()..self.row_size], next);
    }

    /// `lookup`: the stored head row index for `key`, or `None` if the
    /// key has no rows.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<u32>> {
        match self.heads.get(key)? {
            Some(bytes) => {
                let idx = LittleEndian::read_u32(bytes);
                Ok(Some(idx))
            }
            None => Ok(None),
        }
    }

    /// Allocates a fresh row, writes it via `write_fn` (which receives
    /// the row's payload bytes, excluding the trailing `next` field),
    /// splices it at the head of `key`'s list, and commits the new head.
    pub fn add_row(&mut self, key: &[u8], write_fn: impl FnOnce(&mut [u8])) -> Result<u32> {
        let old_head = self.lookup(key)?;
        let index = self.rows.allocate()?;
        {
            let raw = self.rows.get_mut(index)?;
            let payload_len = self.row_size - 4;
            write_fn(&mut raw[0..payload_len]);
            self.set_row_next(raw, old_head.unwrap_or(EMPTY));
        }
        match old_head {
            Some(_) => {
                self.heads
                    .update(key, |v| LittleEndian::write_u32(v, index))?;
            }
            None => {
                self.heads.store(key, |v| LittleEndian::write_u32(v, index))?;
            }
        }
        Ok(index)
    }

    /// Pops the most recently added row for `key`. If the list becomes
    /// empty, unlinks the key from the head table entirely.
    pub fn delete_last_row(&mut self, key: &[u8]) -> Result<bool> {
        let head = match self.lookup(key)? {
            Some(h) => h,
            None => return Ok(false),
        };
        let new_head = {
            let raw = self.rows.get(head)?;
            self.row_next(raw)
        };
        if new_head == EMPTY {
            self.heads.unlink(key)?;
        } else {
            self.heads
                .update(key, |v| LittleEndian::write_u32(v, new_head))?;
        }
        Ok(true)
    }

    pub fn row(&self, index: u32) -> Result<&[u8]> {
        self.rows.get(index)
    }

    /// Rows for `key`, newest first.
    pub fn get_all(&self, key: &[u8]) -> Result<Vec<&[u8]>> {
        let mut out = Vec::new();
        let mut current = self.lookup(key)?;
        while let Some(idx) = current {
            let raw = self.rows.get(idx)?;
            out.push(&raw[0..self.row_size - 4]);
            let next = self.row_next(raw);
            current = if next == EMPTY { None } else { Some(next) };
        }
        Ok(out)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.heads.sync()?;
        self.rows.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> MultiMap {
        MultiMap::open(
            dir.path().join("heads"),
            dir.path().join("rows"),
            16,
            4,
            8, // 4-byte payload + 4-byte next
        )
        .unwrap()
    }

    #[test]
    fn lifo_add_then_delete_restores_prior_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open(&dir);
        let key = [0, 0, 0, 1];
        m.add_row(&key, |v| v.copy_from_slice(&1u32.to_le_bytes())).unwrap();
        m.add_row(&key, |v| v.copy_from_slice(&2u32.to_le_bytes())).unwrap();
        m.sync().unwrap();

        let all = m.get_all(&key).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(&all[0][0..4], &2u32.to_le_bytes());

        m.delete_last_row(&key).unwrap();
        m.sync().unwrap();
        let all = m.get_all(&key).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][0..4], &1u32.to_le_bytes());
    }

    #[test]
    fn delete_last_row_of_only_row_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open(&dir);
        let key = [0, 0, 0, 9];
        m.add_row(&key, |v| v.copy_from_slice(&7u32.to_le_bytes())).unwrap();
        m.sync().unwrap();
        assert!(m.delete_last_row(&key).unwrap());
        assert_eq!(m.lookup(&key).unwrap(), None);
    }

    #[test]
    fn unknown_key_has_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let m = open(&dir);
        assert_eq!(m.lookup(&[9, 9, 9, 9]).unwrap(), None);
        assert!(m.get_all(&[9, 9, 9, 9]).unwrap().is_empty());
    }
}
