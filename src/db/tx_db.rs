use crate::error::Result;
use crate::storage::SlabHashTable;
use crate::types::{Hash32, Transaction};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;
use std::path::Path;

/// Single hash-slab mapping tx-hash → `[height:u32][index-in-block:u32]
/// [serialized tx...]`.
pub struct TxDb {
    table: SlabHashTable,
}

/// Metadata accompanying a stored transaction.
pub struct TxEntry {
    pub height: u32,
    pub index_in_block: u32,
    pub transaction: Transaction,
}

impl TxDb {
    pub fn open(dir: impl AsRef<Path>, buckets: u64) -> Result<Self> {
        let table = SlabHashTable::open(dir.as_ref().join("txs"), buckets, 32)?;
        Ok(TxDb { table })
    }

    pub fn store(&mut self, hash: &Hash32, height: u32, index_in_block: u32, tx: &Transaction) -> Result<()> {
        let tx_bytes = tx.to_bytes();
        let value_size = 8 + tx_bytes.len();
        self.table.store(hash.as_bytes(), value_size, |v| {
            LittleEndian::write_u32(&mut v[0..4], height);
            LittleEndian::write_u32(&mut v[4..8], index_in_block);
            v[8..].copy_from_slice(&tx_bytes);
        })?;
        Ok(())
    }

    pub fn get(&self, hash: &Hash32) -> Result<Option<TxEntry>> {
        let tail = match self.table.get_tail(hash.as_bytes())? {
            Some(t) => t,
            None => return Ok(None),
        };
        let height = LittleEndian::read_u32(&tail[0..4]);
        let index_in_block = LittleEndian::read_u32(&tail[4..8]);
        let mut cursor = Cursor::new(&tail[8..]);
        let transaction = Transaction::read(&mut cursor)?;
        Ok(Some(TxEntry { height, index_in_block, transaction }))
    }

    pub fn contains(&self, hash: &Hash32) -> Result<bool> {
        Ok(self.get(hash)?.is_some())
    }

    pub fn remove(&mut self, hash: &Hash32) -> Result<bool> {
        // The value stored at this key is variable-length and not known
        // here; `unlink` only needs the key to walk and patch the chain,
        // so any (unused) value_size placeholder works.
        self.table.unlink(hash.as_bytes(), 0)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.table.sync()
    }
}
