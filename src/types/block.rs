use super::hash::Hash32;
use super::header::BlockHeader;
use super::transaction::Transaction;
use sha2::{Digest, Sha256};

/// A header plus ordered transactions. The first transaction is the
/// coinbase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash32 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Double-SHA256 Merkle root over the block's transaction ids. An
    /// odd-count level duplicates its last hash, matching Bitcoin's
    /// convention (including its famous CVE-2012-2459 duplication
    /// quirk, which is out of scope to special-case here).
    pub fn merkle_root(&self) -> Hash32 {
        let mut level: Vec<Hash32> = self.transactions.iter().map(|t| t.txid()).collect();
        if level.is_empty() {
            return Hash32::ZERO;
        }
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().unwrap());
            }
            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                let mut buf = [0u8; 64];
                buf[0..32].copy_from_slice(pair[0].as_bytes());
                buf[32..64].copy_from_slice(pair[1].as_bytes());
                let first = Sha256::digest(buf);
                let second = Sha256::digest(first);
                next.push(Hash32::from_slice(&second).unwrap());
            }
            level = next;
        }
        level[0]
    }

    /// Serialized size, used for the 1,000,000-byte block size limit.
    pub fn serialized_size(&self) -> usize {
        BlockHeader::SERIALIZED_SIZE
            + self
                .transactions
                .iter()
                .map(|t| t.to_bytes().len())
                .sum::<usize>()
    }
}
