use crate::error::Result;
use crate::storage::RecordHashTable;
use crate::types::{Inpoint, Outpoint};
use std::path::Path;

/// `(prev-tx-hash || prev-output-index) → (spender-tx-hash ||
/// spender-input-index)`, a fixed 72-byte record.
pub struct SpendDb {
    table: RecordHashTable,
}

impl SpendDb {
    pub fn open(dir: impl AsRef<Path>, buckets: u32) -> Result<Self> {
        let table = RecordHashTable::open(dir.as_ref().join("spends"), buckets, 36, 36)?;
        Ok(SpendDb { table })
    }

    pub fn store(&mut self, outpoint: &Outpoint, inpoint: &Inpoint) -> Result<()> {
        let key = outpoint.to_bytes();
        let value = inpoint.to_bytes();
        self.table.store(&key, |v| v.copy_from_slice(&value))
    }

    pub fn get(&self, outpoint: &Outpoint) -> Result<Option<Inpoint>> {
        let key = outpoint.to_bytes();
        Ok(self.table.get(&key)?.map(|raw| {
            let mut bytes = [0u8; 36];
            bytes.copy_from_slice(raw);
            Inpoint::from_bytes(&bytes)
        }))
    }

    pub fn remove(&mut self, outpoint: &Outpoint) -> Result<bool> {
        self.table.unlink(&outpoint.to_bytes())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.table.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash32;

    #[test]
    fn store_then_get_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = SpendDb::open(dir.path(), 16).unwrap();
        let outpoint = Outpoint::new(Hash32([1u8; 32]), 0);
        let inpoint = Inpoint::new(Hash32([2u8; 32]), 3);
        db.store(&outpoint, &inpoint).unwrap();
        db.sync().unwrap();

        assert_eq!(db.get(&outpoint).unwrap(), Some(inpoint));
        assert!(db.remove(&outpoint).unwrap());
        assert_eq!(db.get(&outpoint).unwrap(), None);
    }
}
