use super::block_db::BlockDb;
use super::history_db::HistoryDb;
use super::spend_db::SpendDb;
use super::stealth_db::{StealthDb, StealthRow};
use super::tx_db::TxDb;
use crate::constants::is_bip30_exception_height;
use crate::error::{Error, Result};
use crate::types::{Block, Hash32, Inpoint, Outpoint, Script, Transaction};
use std::collections::HashMap;
use std::path::Path;

/// Coordinates a block's push/pop across the block, transaction, spend,
/// history and stealth tables in the fixed order spec §4.11 requires, and
/// keeps the block table's `sync()` last so a crash never leaves the
/// chain tip pointing at a block whose supporting rows aren't durable
/// (spec §8, invariant 2).
pub struct DatabaseFacade {
    pub block: BlockDb,
    pub tx: TxDb,
    pub spend: SpendDb,
    pub history: HistoryDb,
    pub stealth: StealthDb,
    history_start_height: u32,
    stealth_start_height: u32,
}

impl DatabaseFacade {
    pub fn open(
        dir: impl AsRef<Path>,
        buckets: u32,
        history_start_height: u32,
        stealth_start_height: u32,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(DatabaseFacade {
            block: BlockDb::open(dir, buckets as u64)?,
            tx: TxDb::open(dir, buckets as u64)?,
            spend: SpendDb::open(dir, buckets)?,
            history: HistoryDb::open(dir, buckets)?,
            stealth: StealthDb::open(dir)?,
            history_start_height,
            stealth_start_height,
        })
    }

    /// Writes the genesis block if the chain is empty; a no-op otherwise.
    pub fn initialize(&mut self, genesis: &Block) -> Result<()> {
        if self.block.top().is_some() {
            return Ok(());
        }
        self.push(genesis)?;
        Ok(())
    }

    /// Resolves the script paid by `outpoint`, checking the block's own
    /// earlier transactions first (not yet visible in `self.tx`) and
    /// falling back to the persisted transaction table.
    fn resolve_prevout_script(
        &self,
        outpoint: &Outpoint,
        local: &HashMap<Hash32, &Transaction>,
    ) -> Result<Option<Script>> {
        if let Some(tx) = local.get(&outpoint.hash) {
            return Ok(tx.outputs.get(outpoint.index as usize).map(|o| o.script_pubkey.clone()));
        }
        match self.tx.get(&outpoint.hash)? {
            Some(entry) => Ok(entry.transaction.outputs.get(outpoint.index as usize).map(|o| o.script_pubkey.clone())),
            None => Ok(None),
        }
    }

    /// Writes one block at `height = top + 1` across all five tables and
    /// returns the assigned height. Assumes the block has already passed
    /// the validator's check/accept/connect pipeline.
    pub fn push(&mut self, block: &Block) -> Result<u32> {
        let height = self.block.top().map(|h| h + 1).unwrap_or(0);
        let bip30_exception = is_bip30_exception_height(height);
        let history_active = height >= self.history_start_height;
        let stealth_active = height >= self.stealth_start_height;

        let mut tx_hashes = Vec::with_capacity(block.transactions.len());
        let mut local: HashMap<Hash32, &Transaction> = HashMap::new();
        let mut stealth_rows = Vec::new();

        for (i, tx) in block.transactions.iter().enumerate() {
            let is_coinbase = i == 0;
            let txid = tx.txid();

            if !is_coinbase {
                for (input_idx, input) in tx.inputs.iter().enumerate() {
                    let inpoint = Inpoint::new(txid, input_idx as u32);
                    self.spend.store(&input.previous_output, &inpoint)?;
                    if history_active {
                        if let Some(script) = self.resolve_prevout_script(&input.previous_output, &local)? {
                            if let Some(address) = script.payment_address_hash() {
                                self.history.add_spend(&address, &input.previous_output, &inpoint, height)?;
                            }
                        }
                    }
                }
            }

            if history_active {
                for (out_idx, output) in tx.outputs.iter().enumerate() {
                    if let Some(address) = output.script_pubkey.payment_address_hash() {
                        let outpoint = Outpoint::new(txid, out_idx as u32);
                        self.history.add_output(&address, &outpoint, height, output.value as u64)?;
                    }
                }
            }

            if stealth_active {
                let mut k = 0usize;
                while k + 1 < tx.outputs.len() {
                    let payment = &tx.outputs[k];
                    let marker = &tx.outputs[k + 1];
                    if let (Some(address), Some(ephemeral_key)) =
                        (payment.script_pubkey.payment_address_hash(), marker.script_pubkey.stealth_ephemeral_key())
                    {
                        stealth_rows.push(StealthRow {
                            ephemeral_key: Hash32(ephemeral_key),
                            address_hash: address,
                            tx_hash: txid,
                        });
                    }
                    k += 2;
                }
            }

            if !(is_coinbase && bip30_exception) {
                self.tx.store(&txid, height, i as u32, tx)?;
            }
            tx_hashes.push(txid);
            local.insert(txid, tx);
        }

        self.block.store(&block.header, &tx_hashes)?;
        self.stealth.store_block(height, &stealth_rows)?;

        self.spend.sync()?;
        self.tx.sync()?;
        self.history.sync()?;
        self.stealth.sync()?;
        self.block.sync()?;

        Ok(height)
    }

    /// Reverses `push` for the current top block: undoes every table
    /// change in reverse order, then truncates the block and stealth
    /// height indexes. Returns the popped block.
    pub fn pop(&mut self) -> Result<Block> {
        let height = self.block.top().ok_or(Error::NotFound)?;
        let (header, tx_hashes) = {
            let row = self.block.get_by_height(height)?;
            let count = row.tx_count();
            let mut hashes = Vec::with_capacity(count as usize);
            for i in 0..count {
                hashes.push(row.tx_hash(i).ok_or_else(|| Error::Corrupt("missing tx hash in block row".into()))?);
            }
            (row.header(), hashes)
        };

        let mut transactions = Vec::with_capacity(tx_hashes.len());
        for hash in &tx_hashes {
            let entry = self
                .tx
                .get(hash)?
                .ok_or_else(|| Error::Corrupt(format!("missing transaction {} while popping block {}", hash, height)))?;
            transactions.push(entry.transaction);
        }

        let bip30_exception = is_bip30_exception_height(height);
        let history_active = height >= self.history_start_height;
        let local: HashMap<Hash32, &Transaction> =
            tx_hashes.iter().cloned().zip(transactions.iter()).collect();

        for (i, tx) in transactions.iter().enumerate().rev() {
            let txid = tx_hashes[i];
            let is_coinbase = i == 0;

            if history_active {
                for output in tx.outputs.iter().rev() {
                    if let Some(address) = output.script_pubkey.payment_address_hash() {
                        self.history.delete_last_row(&address)?;
                    }
                }
            }

            if !is_coinbase {
                for input in tx.inputs.iter().rev() {
                    if history_active {
                        if let Some(script) = self.resolve_prevout_script(&input.previous_output, &local)? {
                            if let Some(address) = script.payment_address_hash() {
                                self.history.delete_last_row(&address)?;
                            }
                        }
                    }
                    self.spend.remove(&input.previous_output)?;
                }
            }

            if !(is_coinbase && bip30_exception) {
                self.tx.remove(&txid)?;
            }
        }

        self.stealth.unlink(height)?;
        self.block.unlink(height);

        self.spend.sync()?;
        self.tx.sync()?;
        self.history.sync()?;
        self.stealth.sync()?;
        self.block.sync()?;

        Ok(Block { header, transactions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::primitives::Outpoint as Op;
    use crate::types::{BlockHeader, TxIn, TxOut};

    fn p2pkh(hash: [u8; 20]) -> Script {
        let mut v = vec![0x76, 0xa9, 0x14];
        v.extend_from_slice(&hash);
        v.push(0x88);
        v.push(0xac);
        Script(v)
    }

    fn coinbase(height_marker: u8, payout_hash: [u8; 20]) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: Op::null(),
                script_sig: Script(vec![height_marker]),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOut { value: 5_000_000_000, script_pubkey: p2pkh(payout_hash) }],
            locktime: 0,
        }
    }

    fn header(prev: Hash32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_hash: prev,
            merkle_root: Hash32::ZERO,
            timestamp: 0,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    #[test]
    fn push_then_pop_restores_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut facade = DatabaseFacade::open(dir.path(), 16, 0, 0).unwrap();
        let address = [3u8; 20];
        let genesis = Block { header: header(Hash32::ZERO, 0), transactions: vec![coinbase(0, address)] };
        facade.initialize(&genesis).unwrap();
        assert_eq!(facade.block.top(), Some(0));
        assert_eq!(facade.history.balance(&address).unwrap(), 5_000_000_000);

        let popped = facade.pop().unwrap();
        assert_eq!(popped.header, genesis.header);
        assert_eq!(facade.block.top(), None);
        assert_eq!(facade.history.balance(&address).unwrap(), 0);
    }

    #[test]
    fn spend_in_later_block_clears_balance() {
        let dir = tempfile::tempdir().unwrap();
        let mut facade = DatabaseFacade::open(dir.path(), 16, 0, 0).unwrap();
        let address = [4u8; 20];
        let genesis = Block { header: header(Hash32::ZERO, 0), transactions: vec![coinbase(0, address)] };
        facade.initialize(&genesis).unwrap();
        let genesis_txid = genesis.transactions[0].txid();

        let spend_tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: Op::new(genesis_txid, 0),
                script_sig: Script(vec![]),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOut { value: 4_999_000_000, script_pubkey: p2pkh([5u8; 20]) }],
            locktime: 0,
        };
        let block1 = Block {
            header: header(genesis.hash(), 1),
            transactions: vec![coinbase(1, address), spend_tx],
        };
        let height = facade.push(&block1).unwrap();
        assert_eq!(height, 1);
        assert_eq!(facade.history.balance(&address).unwrap(), 5_000_000_000);
        assert_eq!(facade.history.balance(&[5u8; 20]).unwrap(), 4_999_000_000);
        assert!(facade.spend.get(&Op::new(genesis_txid, 0)).unwrap().is_some());

        facade.pop().unwrap();
        assert_eq!(facade.history.balance(&address).unwrap(), 5_000_000_000);
        assert_eq!(facade.history.balance(&[5u8; 20]).unwrap(), 0);
        assert!(facade.spend.get(&Op::new(genesis_txid, 0)).unwrap().is_none());
    }

    #[test]
    fn stealth_marker_pair_produces_a_scan_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut facade = DatabaseFacade::open(dir.path(), 16, 0, 0).unwrap();
        let address = [7u8; 20];
        let genesis = Block { header: header(Hash32::ZERO, 0), transactions: vec![coinbase(0, [0u8; 20])] };
        facade.initialize(&genesis).unwrap();

        let mut marker_script = vec![0x6a, 0x20];
        marker_script.extend_from_slice(&[42u8; 32]);
        let stealth_tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: Op::new(genesis.transactions[0].txid(), 0),
                script_sig: Script(vec![]),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![
                TxOut { value: 1_000, script_pubkey: p2pkh(address) },
                TxOut { value: 0, script_pubkey: Script(marker_script) },
            ],
            locktime: 0,
        };
        let block1 = Block { header: header(genesis.hash(), 1), transactions: vec![coinbase(1, [0u8; 20]), stealth_tx] };
        facade.push(&block1).unwrap();

        let hits = facade.stealth.scan(&[42], 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.address_hash, address);
    }
}
