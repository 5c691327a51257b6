use super::hash::Hash32;
use num_bigint::BigUint;
use num_traits::{One, Zero};
use sha2::{Digest, Sha256};

/// `(version, previous-hash, merkle-root, timestamp, bits, nonce)`.
/// Serializes to the canonical 80-byte header; `hash()` is double-SHA256
/// of that serialization and `proof()` is the work contributed by the
/// header's declared target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SERIALIZED_SIZE: usize = 80;

    pub fn to_bytes(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 80]) -> Self {
        BlockHeader {
            version: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            previous_hash: Hash32::from_slice(&bytes[4..36]).unwrap(),
            merkle_root: Hash32::from_slice(&bytes[36..68]).unwrap(),
            timestamp: u32::from_le_bytes(bytes[68..72].try_into().unwrap()),
            bits: u32::from_le_bytes(bytes[72..76].try_into().unwrap()),
            nonce: u32::from_le_bytes(bytes[76..80].try_into().unwrap()),
        }
    }

    /// Double-SHA256 of the 80-byte serialization, stored internally in
    /// the same little-endian byte order the serialization uses (not the
    /// conventional byte-reversed display order).
    pub fn hash(&self) -> Hash32 {
        let first = Sha256::digest(self.to_bytes());
        let second = Sha256::digest(first);
        Hash32::from_slice(&second).unwrap()
    }

    /// 256-bit work contributed by this header: 2^256 / (target + 1).
    pub fn proof(&self) -> BigUint {
        proof_of_target(&expand_target(self.bits))
    }
}

/// Expand the compact `bits` representation into a full 256-bit target.
/// `bits` is `[exponent:1][mantissa:3]`; `target = mantissa * 256^(exponent-3)`.
/// A mantissa or exponent of zero yields a zero target.
pub fn expand_target(bits: u32) -> BigUint {
    let exponent = (bits >> 24) as i64;
    let mantissa = bits & 0x00ff_ffff;
    if mantissa == 0 || exponent == 0 {
        return BigUint::zero();
    }
    if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3))
    }
}

/// Work contributed by a block whose declared target is `target`:
/// `2^256 / (target + 1)`. A zero target contributes zero work (an
/// invalid `bits` field, rejected earlier by the validator's
/// `proof_of_work` check).
pub fn proof_of_target(target: &BigUint) -> BigUint {
    if target.is_zero() {
        return BigUint::zero();
    }
    let numerator = BigUint::one() << 256;
    numerator / (target + BigUint::one())
}

/// The maximum target representable by `bits`, used to validate that a
/// header's declared target is not above the network ceiling.
pub fn max_target() -> BigUint {
    expand_target(0x1d00ffff)
}
