/// Consensus constants shared by the validator and organizer.

/// Genesis block height.
pub const HEIGHT_GENESIS: u32 = 0;

/// Heights at which a duplicate coinbase transaction hash is permitted
/// (mainnet). See BIP30.
pub const BIP30_EXCEPTION_HEIGHTS: [u32; 2] = [91842, 91880];

/// First height at which block version must be ≥ 2 and the coinbase
/// input script must begin with the serialized block height (BIP34).
pub const BIP34_HEIGHT: u32 = 237370;

/// Mainnet timestamp at or after which P2SH (BIP16) script evaluation
/// is enabled.
pub const BIP16_ACTIVATION_TIME: u32 = 1333238400;

/// Maximum serialized block size, in bytes.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum legacy sigops per block.
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;

/// Maximum representable money, in satoshis.
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Coinbase subsidy halves every this many blocks.
pub const SUBSIDY_HALVING_INTERVAL: u32 = 210_000;

/// Blocks a coinbase output must age before it can be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// Retarget period, in blocks.
pub const RETARGET_INTERVAL: u32 = 2016;

/// Target interval between retargets, in seconds (two weeks).
pub const TARGET_TIMESPAN: u32 = 1_209_600;

/// Target interval between blocks, in seconds.
pub const TARGET_SPACING: u32 = 600;

/// Maximum permitted clock skew for a block's timestamp, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;

/// Number of preceding timestamps used for the median-time-past check.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// `bits` encoding of the minimum-difficulty target.
pub const MAX_BITS: u32 = 0x1d00ffff;

pub fn is_bip30_exception_height(height: u32) -> bool {
    BIP30_EXCEPTION_HEIGHTS.contains(&height)
}

pub fn block_subsidy(height: u32) -> u64 {
    let halvings = height / SUBSIDY_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    (50 * 100_000_000u64) >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bip30_exception_heights_match_mainnet() {
        assert!(is_bip30_exception_height(91842));
        assert!(is_bip30_exception_height(91880));
        assert!(!is_bip30_exception_height(91881));
    }

    #[test]
    fn subsidy_halves_on_schedule() {
        assert_eq!(block_subsidy(0), 50 * 100_000_000);
        assert_eq!(block_subsidy(SUBSIDY_HALVING_INTERVAL), 25 * 100_000_000);
        assert_eq!(block_subsidy(SUBSIDY_HALVING_INTERVAL * 2), 1_250_000_000);
    }

    #[test]
    fn subsidy_is_zero_after_64_halvings() {
        assert_eq!(block_subsidy(SUBSIDY_HALVING_INTERVAL * 64), 0);
    }
}
