//! Context-free, context-dependent and connect-phase block/transaction
//! checks (spec §4.14).
//!
//! Grounded in the teacher's `fee_calculation.rs` (subsidy/fee
//! arithmetic) and `chainwork.rs` (target/retarget arithmetic via
//! `num-bigint`, reused from `types::header`), extended to the full
//! check/accept/connect pipeline the spec describes. Script-interpreter
//! consensus verification and prevout/chain-state lookups are external
//! collaborators (spec §1), modeled here as small traits the organizer
//! implements against the persisted database and the candidate branch.

use crate::config::Checkpoint;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::types::header::{expand_target, max_target};
use crate::types::{Block, Hash32, Outpoint, Script, Transaction};

/// Per-height facts the accept phase needs above the fork point — either
/// from the persisted chain or from earlier blocks in the same
/// candidate branch.
pub trait ChainView {
    fn bits_at(&self, height: u32) -> Option<u32>;
    fn timestamp_at(&self, height: u32) -> Option<u32>;
}

/// The previously-recorded output a transaction input spends.
#[derive(Debug, Clone)]
pub struct PrevoutInfo {
    pub script_pubkey: Script,
    pub value: i64,
    pub height: u32,
    pub is_coinbase: bool,
}

/// Resolves an input's previous output, searching (in order) the
/// block's own earlier transactions, earlier blocks in the candidate
/// branch, and the persisted chain below the fork point.
pub trait PrevoutLookup {
    fn lookup(&self, outpoint: &Outpoint) -> Option<PrevoutInfo>;
}

/// Tracks which outpoints have already been spent during this
/// connect-phase pass, across both the branch under validation and the
/// persisted chain below the fork point.
pub trait SpendTracker {
    fn is_spent(&self, outpoint: &Outpoint) -> bool;
    fn mark_spent(&mut self, outpoint: &Outpoint);
}

/// Resolves whether a transaction hash is already present on the main
/// chain with at least one output still unspent — the BIP30 condition
/// that forbids a non-exception-height block from reusing it (spec
/// §4.14 "Connect": "elsewhere, a tx hash already present on the main
/// chain is rejected unless all its outputs are spent").
pub trait DuplicateTxLookup {
    fn is_unspent_duplicate(&self, txid: &Hash32) -> bool;
}

/// The external script-interpreter predicate (spec §1: "invoked as an
/// opaque predicate"). Returns whether `input_index`'s scriptSig/
/// scriptPubKey pair satisfies consensus rules, with P2SH evaluation
/// enabled or not per the block's timestamp.
pub trait ScriptVerifier {
    fn verify(&self, tx: &Transaction, input_index: usize, prevout_script: &Script, p2sh_enabled: bool) -> bool;
}

/// Outcome of a successful connect-phase pass: the block's total fees
/// and the sigops it contributed, for the caller to accumulate against
/// the running per-block cap across earlier blocks of a multi-block
/// branch validation (sigops are already capped within this call; the
/// running total is only needed when a caller combines multiple calls).
pub struct ConnectOutcome {
    pub fees: u64,
    pub sigops: u32,
}

/// Checks independent of height or chain state (spec §4.14 "Check").
pub fn check_block(block: &Block) -> Result<()> {
    if block.transactions.is_empty() {
        return Err(Error::SizeLimits);
    }
    if block.serialized_size() > MAX_BLOCK_SIZE {
        return Err(Error::SizeLimits);
    }

    let target = expand_target(block.header.bits);
    if target.bits() == 0 || target > max_target() {
        return Err(Error::ProofOfWork);
    }
    let hash_value = num_bigint::BigUint::from_bytes_be(&reversed(block.header.hash().as_bytes()));
    if hash_value > target {
        return Err(Error::ProofOfWork);
    }

    if !block.transactions[0].is_coinbase() {
        return Err(Error::FirstNotCoinbase);
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(Error::ExtraCoinbases);
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let mut seen = std::collections::HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if !seen.insert(tx.txid()) {
            return Err(Error::DuplicateOrSpent);
        }
    }

    let mut sigops = 0u32;
    for tx in &block.transactions {
        for input in &tx.inputs {
            sigops += input.script_sig.legacy_sigop_count();
        }
        for output in &tx.outputs {
            sigops += output.script_pubkey.legacy_sigop_count();
        }
    }
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(Error::TooManySigs);
    }

    if block.merkle_root() != block.header.merkle_root {
        return Err(Error::MerkleMismatch);
    }

    Ok(())
}

/// Header-hash bytes are stored internally little-endian (spec §6);
/// target comparison needs the conventional big-endian magnitude.
fn reversed(bytes: &[u8; 32]) -> [u8; 32] {
    let mut out = *bytes;
    out.reverse();
    out
}

pub fn check_timestamp(timestamp: u32, now: u32) -> Result<()> {
    if timestamp > now.saturating_add(MAX_FUTURE_BLOCK_TIME) {
        return Err(Error::FuturisticTimestamp);
    }
    Ok(())
}

/// Per-transaction context-free checks.
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(Error::EmptyTransaction);
    }
    let mut total_out: u64 = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(Error::OutputValueOverflow);
        }
        total_out = total_out
            .checked_add(output.value as u64)
            .ok_or(Error::OutputValueOverflow)?;
        if total_out > MAX_MONEY {
            return Err(Error::OutputValueOverflow);
        }
    }
    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(Error::InvalidCoinbaseScriptSize);
        }
    } else {
        for input in &tx.inputs {
            if input.previous_output.is_null() {
                return Err(Error::PreviousOutputNull);
            }
        }
    }
    Ok(())
}

/// Retargets `bits` per the mainnet/testnet rule (spec §4.14 "Accept").
/// `use_testnet_rules` enables the 20-minute relaxation; `last_non_max`
/// is the last non-`MAX_BITS` value at or after the previous retarget
/// height, used only by that relaxation.
pub fn work_required(
    height: u32,
    timestamp: u32,
    chain: &impl ChainView,
    use_testnet_rules: bool,
) -> Result<u32> {
    if height == 0 {
        return chain.bits_at(0).ok_or(Error::OperationFailed("missing genesis bits".into()));
    }

    if height % RETARGET_INTERVAL == 0 {
        let first_height = height - RETARGET_INTERVAL;
        let first_timestamp = chain
            .timestamp_at(first_height)
            .ok_or_else(|| Error::OperationFailed(format!("missing timestamp at height {}", first_height)))?;
        let last_timestamp = chain
            .timestamp_at(height - 1)
            .ok_or_else(|| Error::OperationFailed(format!("missing timestamp at height {}", height - 1)))?;
        let prior_bits = chain
            .bits_at(height - 1)
            .ok_or_else(|| Error::OperationFailed(format!("missing bits at height {}", height - 1)))?;

        let mut span = last_timestamp.saturating_sub(first_timestamp) as i64;
        let min_span = (TARGET_TIMESPAN / 4) as i64;
        let max_span = (TARGET_TIMESPAN as i64) * 4;
        span = span.clamp(min_span, max_span);

        let old_target = expand_target(prior_bits);
        let new_target = (old_target * num_bigint::BigUint::from(span as u64))
            / num_bigint::BigUint::from(TARGET_TIMESPAN);
        let capped = new_target.min(max_target());
        return Ok(compact_from_target(&capped));
    }

    if use_testnet_rules {
        let previous_timestamp = chain
            .timestamp_at(height - 1)
            .ok_or_else(|| Error::OperationFailed(format!("missing timestamp at height {}", height - 1)))?;
        if timestamp > previous_timestamp + 2 * TARGET_SPACING {
            return Ok(MAX_BITS);
        }
        // Last non-max_bits value at or after the previous retarget
        // height.
        let last_retarget = height - (height % RETARGET_INTERVAL);
        let mut h = height - 1;
        loop {
            let bits = chain
                .bits_at(h)
                .ok_or_else(|| Error::OperationFailed(format!("missing bits at height {}", h)))?;
            if bits != MAX_BITS || h <= last_retarget {
                return Ok(bits);
            }
            h -= 1;
        }
    }

    chain
        .bits_at(height - 1)
        .ok_or_else(|| Error::OperationFailed(format!("missing bits at height {}", height - 1)))
}

fn compact_from_target(target: &num_bigint::BigUint) -> u32 {
    let bytes = target.to_bytes_be();
    if bytes.is_empty() {
        return 0;
    }
    let mut size = bytes.len() as u32;
    let mut mantissa = if bytes.len() >= 3 {
        ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
    } else {
        let mut padded = [0u8; 3];
        padded[3 - bytes.len()..].copy_from_slice(&bytes);
        ((padded[0] as u32) << 16) | ((padded[1] as u32) << 8) | padded[2] as u32
    };
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | mantissa
}

/// Median of up to the previous 11 timestamps at or below `height - 1`.
pub fn median_time_past(height: u32, chain: &impl ChainView) -> Option<u32> {
    let mut timestamps: Vec<u32> = Vec::with_capacity(MEDIAN_TIME_SPAN);
    let mut h = height;
    for _ in 0..MEDIAN_TIME_SPAN {
        if h == 0 {
            break;
        }
        h -= 1;
        match chain.timestamp_at(h) {
            Some(t) => timestamps.push(t),
            None => break,
        }
    }
    if timestamps.is_empty() {
        return None;
    }
    timestamps.sort_unstable();
    Some(timestamps[timestamps.len() / 2])
}

/// Context-dependent checks (spec §4.14 "Accept"). `chain` resolves
/// bits/timestamps for every height below this block, whether that
/// height is on the persisted chain or earlier in the candidate branch.
#[allow(clippy::too_many_arguments)]
pub fn accept_block(
    block: &Block,
    height: u32,
    now: u32,
    chain: &impl ChainView,
    checkpoints: &[Checkpoint],
    use_testnet_rules: bool,
) -> Result<()> {
    check_timestamp(block.header.timestamp, now)?;

    let required_bits = work_required(height, block.header.timestamp, chain, use_testnet_rules)?;
    if block.header.bits != required_bits {
        return Err(Error::IncorrectProofOfWork);
    }

    if let Some(median) = median_time_past(height, chain) {
        if block.header.timestamp <= median {
            return Err(Error::TimestampTooEarly);
        }
    }

    for tx in &block.transactions {
        if !tx.is_final(height, block.header.timestamp) {
            return Err(Error::NonFinalTransaction);
        }
    }

    let block_hash = block.header.hash();
    for checkpoint in checkpoints {
        if checkpoint.height == height && checkpoint.hash != block_hash {
            return Err(Error::CheckpointsFailed);
        }
    }

    if height > BIP34_HEIGHT && block.header.version < 2 {
        return Err(Error::OldVersionBlock);
    }
    if block.header.version >= 2 {
        let coinbase_script = &block.transactions[0].inputs[0].script_sig.0;
        let encoded_height = encode_bip34_height(height);
        if !coinbase_script.starts_with(&encoded_height) {
            return Err(Error::CoinbaseHeightMismatch);
        }
    }

    Ok(())
}

/// Minimal-push `CScriptNum` encoding of `height`, as BIP34 prescribes
/// for the coinbase script's leading push.
fn encode_bip34_height(height: u32) -> Vec<u8> {
    let mut n = height as i64;
    let mut bytes = Vec::new();
    let negative = n < 0;
    n = n.abs();
    while n > 0 {
        bytes.push((n & 0xff) as u8);
        n >>= 8;
    }
    if let Some(&last) = bytes.last() {
        if last & 0x80 != 0 {
            bytes.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            *bytes.last_mut().unwrap() |= 0x80;
        }
    }
    let mut out = vec![bytes.len() as u8];
    out.extend(bytes);
    out
}

/// Connects one block's transactions: resolves every input's prevout,
/// enforces coinbase maturity and the max-money ceiling, accumulates
/// P2SH sigops on top of the legacy count already checked in
/// `check_block`, invokes the external script predicate, detects double
/// spends, and rejects a duplicate transaction hash per BIP30 at
/// non-exception heights. Returns the block's total fees and block-wide
/// sigops.
#[allow(clippy::too_many_arguments)]
pub fn connect_block(
    block: &Block,
    height: u32,
    prevouts: &impl PrevoutLookup,
    spends: &mut impl SpendTracker,
    script_verifier: &impl ScriptVerifier,
    bip16_enabled: bool,
    base_sigops: u32,
    bip30_exception: bool,
    duplicates: &impl DuplicateTxLookup,
) -> Result<ConnectOutcome> {
    let mut sigops = base_sigops;
    let mut total_fees: u64 = 0;
    let mut coinbase_output_value: u64 = 0;

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let is_coinbase = tx_index == 0;
        if !(is_coinbase && bip30_exception) {
            let txid = tx.txid();
            if duplicates.is_unspent_duplicate(&txid) {
                return Err(Error::DuplicateOrSpent);
            }
        }

        if is_coinbase {
            coinbase_output_value = tx
                .outputs
                .iter()
                .try_fold(0u64, |acc, o| acc.checked_add(o.value as u64))
                .ok_or(Error::OutputValueOverflow)?;
            continue;
        }

        let mut value_in: u64 = 0;
        for (input_index, input) in tx.inputs.iter().enumerate() {
            if spends.is_spent(&input.previous_output) {
                return Err(Error::DoubleSpend);
            }
            let prevout = prevouts
                .lookup(&input.previous_output)
                .ok_or(Error::InputNotFound)?;
            if prevout.is_coinbase && height < prevout.height + COINBASE_MATURITY {
                return Err(Error::CoinbaseMaturity);
            }

            value_in = value_in
                .checked_add(prevout.value as u64)
                .ok_or(Error::OutputValueOverflow)?;
            if value_in > MAX_MONEY {
                return Err(Error::OutputValueOverflow);
            }

            sigops += input.script_sig.p2sh_sigop_count();
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(Error::TooManySigs);
            }

            if !script_verifier.verify(tx, input_index, &prevout.script_pubkey, bip16_enabled) {
                return Err(Error::ValidateInputsFailed);
            }

            spends.mark_spent(&input.previous_output);
        }

        let value_out: u64 = tx
            .outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value as u64))
            .ok_or(Error::OutputValueOverflow)?;

        if value_out > value_in {
            return Err(Error::SpendExceedsValue);
        }
        total_fees = total_fees
            .checked_add(value_in - value_out)
            .ok_or(Error::FeesOutOfRange)?;
    }

    let subsidy = block_subsidy(height);
    if coinbase_output_value > subsidy.checked_add(total_fees).ok_or(Error::CoinbaseTooLarge)? {
        return Err(Error::CoinbaseTooLarge);
    }

    Ok(ConnectOutcome { fees: total_fees, sigops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, TxIn, TxOut};
    use std::collections::HashMap;

    fn coinbase(script: Vec<u8>, value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: Outpoint::null(),
                script_sig: Script(script),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOut { value, script_pubkey: Script(vec![]) }],
            locktime: 0,
        }
    }

    fn block_with(transactions: Vec<Transaction>, bits: u32) -> Block {
        let header = BlockHeader {
            version: 1,
            previous_hash: Hash32::ZERO,
            merkle_root: Hash32::ZERO,
            timestamp: 0,
            bits,
            nonce: 0,
        };
        let merkle_root = {
            let b = Block { header, transactions: transactions.clone() };
            b.merkle_root()
        };
        Block { header: BlockHeader { merkle_root, ..header }, transactions }
    }

    #[test]
    fn empty_transaction_list_is_rejected() {
        let block = Block {
            header: BlockHeader {
                version: 1,
                previous_hash: Hash32::ZERO,
                merkle_root: Hash32::ZERO,
                timestamp: 0,
                bits: 0x1d00ffff,
                nonce: 0,
            },
            transactions: vec![],
        };
        assert!(matches!(check_block(&block), Err(Error::SizeLimits)));
    }

    #[test]
    fn second_coinbase_is_rejected() {
        let cb = coinbase(vec![1, 2, 3], 5_000_000_000);
        let block = block_with(vec![cb.clone(), cb], 0x207fffff);
        match check_block(&block) {
            Err(Error::ExtraCoinbases) => {}
            other => panic!("expected ExtraCoinbases, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn coinbase_script_length_out_of_range_is_rejected() {
        let tx = coinbase(vec![1], 5_000_000_000);
        assert!(matches!(check_transaction(&tx), Err(Error::InvalidCoinbaseScriptSize)));
    }

    #[test]
    fn non_coinbase_null_previous_output_is_rejected() {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: Outpoint::null(),
                script_sig: Script(vec![]),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOut { value: 1, script_pubkey: Script(vec![]) }],
            locktime: 0,
        };
        // single-input-null-outpoint makes this coinbase-shaped, so build
        // a two-input transaction instead to exercise the non-coinbase path.
        let tx2 = Transaction { inputs: vec![tx.inputs[0].clone(), tx.inputs[0].clone()], ..tx };
        assert!(matches!(check_transaction(&tx2), Err(Error::PreviousOutputNull)));
    }

    struct FixedChain {
        bits: HashMap<u32, u32>,
        timestamps: HashMap<u32, u32>,
    }

    impl ChainView for FixedChain {
        fn bits_at(&self, height: u32) -> Option<u32> {
            self.bits.get(&height).copied()
        }
        fn timestamp_at(&self, height: u32) -> Option<u32> {
            self.timestamps.get(&height).copied()
        }
    }

    #[test]
    fn work_required_outside_retarget_reuses_prior_bits() {
        let mut bits = HashMap::new();
        bits.insert(99, 0x1d00ffff);
        let chain = FixedChain { bits, timestamps: HashMap::new() };
        assert_eq!(work_required(100, 0, &chain, false).unwrap(), 0x1d00ffff);
    }

    #[test]
    fn median_time_past_uses_up_to_eleven_prior_blocks() {
        let mut timestamps = HashMap::new();
        for h in 0..5u32 {
            timestamps.insert(h, h * 100);
        }
        let chain = FixedChain { bits: HashMap::new(), timestamps };
        // heights 0..4 => timestamps [0,100,200,300,400], median = 200
        assert_eq!(median_time_past(5, &chain), Some(200));
    }

    #[test]
    fn bip34_height_requires_v2_and_encoded_height() {
        let mut bits = HashMap::new();
        bits.insert(BIP34_HEIGHT - 1, 0x207fffff);
        let mut timestamps = HashMap::new();
        timestamps.insert(BIP34_HEIGHT - 1, 0);
        let chain = FixedChain { bits, timestamps };

        let mut cb_script = encode_bip34_height(BIP34_HEIGHT);
        cb_script.push(0xff);
        let mut block = block_with(vec![coinbase(cb_script, 0)], 0x207fffff);
        block.header.version = 2;
        block.header.timestamp = 10_000;

        let result = accept_block(&block, BIP34_HEIGHT, 20_000, &chain, &[], false);
        assert!(result.is_ok(), "{:?}", result.err());
    }

    struct NoPrevouts;
    impl PrevoutLookup for NoPrevouts {
        fn lookup(&self, _outpoint: &Outpoint) -> Option<PrevoutInfo> {
            None
        }
    }

    #[derive(Default)]
    struct SetSpends(std::collections::HashSet<Outpoint>);
    impl SpendTracker for SetSpends {
        fn is_spent(&self, outpoint: &Outpoint) -> bool {
            self.0.contains(outpoint)
        }
        fn mark_spent(&mut self, outpoint: &Outpoint) {
            self.0.insert(*outpoint);
        }
    }

    struct AlwaysValid;
    impl ScriptVerifier for AlwaysValid {
        fn verify(&self, _tx: &Transaction, _input_index: usize, _prevout_script: &Script, _p2sh_enabled: bool) -> bool {
            true
        }
    }

    struct NoDuplicates;
    impl DuplicateTxLookup for NoDuplicates {
        fn is_unspent_duplicate(&self, _txid: &Hash32) -> bool {
            false
        }
    }

    struct AlwaysDuplicate;
    impl DuplicateTxLookup for AlwaysDuplicate {
        fn is_unspent_duplicate(&self, _txid: &Hash32) -> bool {
            true
        }
    }

    #[test]
    fn connect_fails_fast_on_missing_prevout() {
        let spend_tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: Outpoint::new(Hash32([1u8; 32]), 0),
                script_sig: Script(vec![]),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOut { value: 10, script_pubkey: Script(vec![]) }],
            locktime: 0,
        };
        let block = block_with(vec![coinbase(vec![1, 2], 5_000_000_000), spend_tx], 0x207fffff);
        let mut spends = SetSpends::default();
        let result = connect_block(&block, 1, &NoPrevouts, &mut spends, &AlwaysValid, true, 0, false, &NoDuplicates);
        assert!(matches!(result, Err(Error::InputNotFound)));
    }

    #[test]
    fn coinbase_exceeding_subsidy_plus_fees_is_rejected() {
        let block = block_with(vec![coinbase(vec![1, 2], block_subsidy(0) + 1)], 0x207fffff);
        let mut spends = SetSpends::default();
        let result = connect_block(&block, 0, &NoPrevouts, &mut spends, &AlwaysValid, true, 0, false, &NoDuplicates);
        assert!(matches!(result, Err(Error::CoinbaseTooLarge)));
    }

    #[test]
    fn duplicate_unspent_txid_is_rejected_outside_bip30_exception() {
        let block = block_with(vec![coinbase(vec![1, 2], 5_000_000_000)], 0x207fffff);
        let mut spends = SetSpends::default();
        let result = connect_block(&block, 100, &NoPrevouts, &mut spends, &AlwaysValid, true, 0, false, &AlwaysDuplicate);
        assert!(matches!(result, Err(Error::DuplicateOrSpent)));
    }

    #[test]
    fn duplicate_coinbase_is_allowed_at_bip30_exception_height() {
        let block = block_with(vec![coinbase(vec![1, 2], 5_000_000_000)], 0x207fffff);
        let mut spends = SetSpends::default();
        let result = connect_block(&block, 91842, &NoPrevouts, &mut spends, &AlwaysValid, true, 0, true, &AlwaysDuplicate);
        assert!(result.is_ok(), "{:?}", result.err());
    }
}
