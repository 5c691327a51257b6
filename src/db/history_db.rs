use crate::error::Result;
use crate::storage::MultiMap;
use crate::types::{Hash32, Inpoint, Outpoint};
use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use std::path::Path;

/// `[kind:1][point-hash:32][point-index:4][height:4][value-or-checksum:8]`,
/// 49 bytes of payload plus the multimap's own 4-byte `next` field (spec
/// §4.9).
const PAYLOAD_SIZE: usize = 1 + 32 + 4 + 4 + 8;
pub const HISTORY_ROW_SIZE: usize = PAYLOAD_SIZE + 4;

const KIND_OUTPUT: u8 = 0;
const KIND_SPEND: u8 = 1;

/// Distinguishes an "output" row (a payment credited to this address) from
/// a "spend" row (a previously credited output now spent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    Output,
    Spend,
}

/// One row of an address's history, newest-first order preserved by the
/// underlying multimap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRow {
    pub kind: PointKind,
    pub point_hash: Hash32,
    pub point_index: u32,
    pub height: u32,
    /// Satoshi value for an output row; `checksum(previous_outpoint)` for
    /// a spend row.
    pub value: u64,
}

impl HistoryRow {
    fn parse(raw: &[u8]) -> Self {
        let kind = if raw[0] == KIND_SPEND { PointKind::Spend } else { PointKind::Output };
        let point_hash = Hash32::from_slice(&raw[1..33]).expect("32-byte slice");
        let point_index = LittleEndian::read_u32(&raw[33..37]);
        let height = LittleEndian::read_u32(&raw[37..41]);
        let value = LittleEndian::read_u64(&raw[41..49]);
        HistoryRow { kind, point_hash, point_index, height, value }
    }
}

/// `checksum(outpoint) = truncate_to_63_bits(sha256(serialize(outpoint)))`
/// — links a spend row back to the output row it consumes
/// without storing the full 36-byte outpoint twice.
pub fn checksum(outpoint: &Outpoint) -> u64 {
    let digest = Sha256::digest(outpoint.to_bytes());
    let raw = LittleEndian::read_u64(&digest[0..8]);
    raw & 0x7FFF_FFFF_FFFF_FFFF
}

/// Address-hash-keyed multimap of payment history: every output credited
/// to a 20-byte address hash and every spend that later debited it (spec
/// §4.9).
pub struct HistoryDb {
    rows: MultiMap,
}

impl HistoryDb {
    pub fn open(dir: impl AsRef<Path>, buckets: u32) -> Result<Self> {
        let dir = dir.as_ref();
        let rows = MultiMap::open(
            dir.join("history_lookup"),
            dir.join("history_rows"),
            buckets,
            20,
            HISTORY_ROW_SIZE,
        )?;
        Ok(HistoryDb { rows })
    }

    pub fn add_output(&mut self, address: &[u8; 20], outpoint: &Outpoint, height: u32, value: u64) -> Result<u32> {
        self.rows.add_row(address, |buf| {
            buf[0] = KIND_OUTPUT;
            buf[1..33].copy_from_slice(outpoint.hash.as_bytes());
            LittleEndian::write_u32(&mut buf[33..37], outpoint.index);
            LittleEndian::write_u32(&mut buf[37..41], height);
            LittleEndian::write_u64(&mut buf[41..49], value);
        })
    }

    pub fn add_spend(&mut self, address: &[u8; 20], previous_outpoint: &Outpoint, inpoint: &Inpoint, height: u32) -> Result<u32> {
        let csum = checksum(previous_outpoint);
        self.rows.add_row(address, |buf| {
            buf[0] = KIND_SPEND;
            buf[1..33].copy_from_slice(inpoint.hash.as_bytes());
            LittleEndian::write_u32(&mut buf[33..37], inpoint.index);
            LittleEndian::write_u32(&mut buf[37..41], height);
            LittleEndian::write_u64(&mut buf[41..49], csum);
        })
    }

    /// Reverses the most recent `add_output`/`add_spend` for `address`.
    pub fn delete_last_row(&mut self, address: &[u8; 20]) -> Result<bool> {
        self.rows.delete_last_row(address)
    }

    /// Rows for `address`, newest first, limited to `limit` rows (0 means
    /// unlimited) at or above `from_height`.
    pub fn get(&self, address: &[u8; 20], limit: usize, from_height: u32) -> Result<Vec<HistoryRow>> {
        let mut out = Vec::new();
        for raw in self.rows.get_all(address)? {
            let row = HistoryRow::parse(raw);
            if row.height >= from_height {
                out.push(row);
                if limit != 0 && out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// The sum of output values not yet matched by a spend row's checksum.
    pub fn balance(&self, address: &[u8; 20]) -> Result<u64> {
        let rows: Vec<HistoryRow> = self.rows.get_all(address)?.into_iter().map(HistoryRow::parse).collect();
        let spent: Vec<u64> = rows
            .iter()
            .filter(|r| r.kind == PointKind::Spend)
            .map(|r| r.value)
            .collect();
        let mut balance = 0u64;
        for row in rows.iter().filter(|r| r.kind == PointKind::Output) {
            let outpoint = Outpoint::new(row.point_hash, row.point_index);
            if !spent.contains(&checksum(&outpoint)) {
                balance += row.value;
            }
        }
        Ok(balance)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.rows.sync()
    }
}
