use super::hash::Hash32;
use super::primitives::Outpoint;
use super::script::Script;
use super::varint::{read_varint, write_varint};
use sha2::{Digest, Sha256};
use std::io::{self, Cursor, Read};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: Outpoint,
    pub script_sig: Script,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Script,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Transaction {
    /// Coinbase iff the single input's previous outpoint is the null
    /// outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.inputs.len() as u64).unwrap();
        for input in &self.inputs {
            out.extend_from_slice(&input.previous_output.to_bytes());
            write_varint(&mut out, input.script_sig.0.len() as u64).unwrap();
            out.extend_from_slice(&input.script_sig.0);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64).unwrap();
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut out, output.script_pubkey.0.len() as u64).unwrap();
            out.extend_from_slice(&output.script_pubkey.0);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Self::read(&mut cursor)
    }

    pub fn read<R: Read>(cursor: &mut R) -> io::Result<Self> {
        use byteorder::{LittleEndian, ReadBytesExt};

        let version = cursor.read_u32::<LittleEndian>()?;
        let input_count = read_varint(cursor)?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let mut outpoint_bytes = [0u8; 36];
            cursor.read_exact(&mut outpoint_bytes)?;
            let script_len = read_varint(cursor)?;
            let mut script = vec![0u8; script_len as usize];
            cursor.read_exact(&mut script)?;
            let sequence = cursor.read_u32::<LittleEndian>()?;
            inputs.push(TxIn {
                previous_output: Outpoint::from_bytes(&outpoint_bytes),
                script_sig: Script(script),
                sequence,
            });
        }
        let output_count = read_varint(cursor)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = cursor.read_i64::<LittleEndian>()?;
            let script_len = read_varint(cursor)?;
            let mut script = vec![0u8; script_len as usize];
            cursor.read_exact(&mut script)?;
            outputs.push(TxOut {
                value,
                script_pubkey: Script(script),
            });
        }
        let locktime = cursor.read_u32::<LittleEndian>()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    pub fn txid(&self) -> Hash32 {
        let bytes = self.to_bytes();
        let first = Sha256::digest(bytes);
        let second = Sha256::digest(first);
        Hash32::from_slice(&second).unwrap()
    }

    /// Final at `(height, timestamp)` per the standard locktime rule:
    /// locktime 0, or every input sequence at the final value (0xFFFFFFFF),
    /// or locktime already in the past (block-height form compared against
    /// `height`, unix-time form compared against `timestamp`).
    pub fn is_final(&self, height: u32, timestamp: u32) -> bool {
        if self.locktime == 0 {
            return true;
        }
        const LOCKTIME_THRESHOLD: u32 = 500_000_000;
        let locktime_reached = if self.locktime < LOCKTIME_THRESHOLD {
            height >= self.locktime
        } else {
            timestamp >= self.locktime
        };
        if locktime_reached {
            return true;
        }
        self.inputs.iter().all(|i| i.sequence == 0xFFFF_FFFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: Outpoint::null(),
                script_sig: Script(vec![0x51]),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOut {
                value: 5_000_000_000,
                script_pubkey: Script(vec![0x76, 0xa9, 0x14]),
            }],
            locktime: 0,
        }
    }

    #[test]
    fn coinbase_detection() {
        assert!(sample_tx().is_coinbase());
    }

    #[test]
    fn roundtrips_through_bytes() {
        let tx = sample_tx();
        let bytes = tx.to_bytes();
        let back = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(tx, back);
    }

    #[test]
    fn zero_locktime_is_always_final() {
        let tx = sample_tx();
        assert!(tx.is_final(0, 0));
    }

    #[test]
    fn future_height_locktime_not_final_with_nonfinal_sequence() {
        let mut tx = sample_tx();
        tx.locktime = 100;
        tx.inputs[0].sequence = 0;
        assert!(!tx.is_final(50, 0));
        assert!(tx.is_final(100, 0));
    }
}
