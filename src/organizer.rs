//! The chain organizer (spec §4.15): accepts submitted blocks, discovers
//! the candidate branch they extend, runs the validator's check/accept/
//! connect pipeline over that branch, and reorganizes the persisted
//! chain onto it when its cumulative work strictly exceeds the current
//! tip's.
//!
//! Grounded in the teacher's `reorg.rs` (fork-point discovery followed
//! by rollback-then-replay) and `sync.rs` (the single long-lived handle
//! a service drives this from), adapted to run against our
//! `DatabaseFacade` instead of RocksDB column families and serialized
//! through `PriorityLock` instead of a bare `tokio::sync::Mutex`.

use crate::config::{Checkpoint, StoreConfig};
use crate::db::DatabaseFacade;
use crate::error::{Error, Result};
use crate::metrics;
use crate::pools::{Branch, Pool};
use crate::priority_lock::PriorityLock;
use crate::seqlock::SequenceLock;
use crate::storage::DirectoryLock;
use crate::subscribers::{ReorganizeEvent, Subscribers};
use crate::types::{Block, BlockHeader, Hash32, Outpoint};
use crate::validator::{self, ChainView, DuplicateTxLookup, PrevoutInfo, PrevoutLookup, ScriptVerifier, SpendTracker};
use num_bigint::BigUint;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// What happened to a submitted block.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Connected to the persisted chain, at `height`. `reorganized` is
    /// true when accepting this branch required popping blocks first.
    Accepted { height: u32, reorganized: bool },
    /// Its previous hash resolves neither in the pool nor on the
    /// persisted chain; held in the pool awaiting its parent.
    Orphan,
    /// Already known, either persisted or pooled.
    Duplicate,
    /// A complete branch was discovered but its cumulative work does
    /// not strictly exceed the persisted chain's; held in the pool in
    /// case a later block extends it further.
    InsufficientWork,
}

/// Owns the storage façade, the orphan/candidate pool, and the
/// subscriber registry, and serializes every mutation through a single
/// priority lock. `V` is the external script-consensus predicate (spec
/// §1); the organizer never interprets scripts itself.
pub struct Organizer<V: ScriptVerifier + Send + Sync> {
    // Held for the organizer's whole lifetime; never read, only kept
    // alive so its `Drop` releases the directory lock on shutdown.
    _directory_lock: DirectoryLock,
    facade: tokio::sync::RwLock<DatabaseFacade>,
    // Bracketed around every table mutation (spec §4.12): readers spin
    // through `top`/`get_by_height` on an odd value and re-validate
    // their snapshot against it after acquiring their own shared guard,
    // rather than contending with a writer for exclusive access.
    seqlock: SequenceLock,
    blocks: Mutex<Pool<Block>>,
    subscribers: Subscribers,
    lock: PriorityLock,
    checkpoints: Vec<Checkpoint>,
    use_testnet_rules: bool,
    block_pool_capacity: usize,
    script_verifier: V,
}

/// Bumps the sequence lock to odd on construction and back to even on
/// drop, so a mutation bracketed by this guard is always paired even if
/// it returns early via `?`.
struct SeqWriteGuard<'a> {
    lock: &'a SequenceLock,
}

impl<'a> SeqWriteGuard<'a> {
    fn new(lock: &'a SequenceLock) -> Self {
        lock.begin_write();
        SeqWriteGuard { lock }
    }
}

impl Drop for SeqWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.end_write();
    }
}

impl<V: ScriptVerifier + Send + Sync> Organizer<V> {
    /// Acquires the directory's exclusive `db_lock` (spec §5: "at most
    /// one process opens the store"), then opens each table, starting
    /// every allocator's header count and the sequence counter at its
    /// persisted value. Fails with `Error::AlreadyLocked` if another
    /// process already holds the directory.
    pub fn open(dir: impl AsRef<Path>, buckets: u32, config: &StoreConfig, script_verifier: V) -> Result<Self> {
        let dir = dir.as_ref();
        let directory_lock = DirectoryLock::acquire(dir)?;
        let facade = DatabaseFacade::open(dir, buckets, config.history_start_height, config.stealth_start_height)?;
        Ok(Organizer {
            _directory_lock: directory_lock,
            facade: tokio::sync::RwLock::new(facade),
            seqlock: SequenceLock::new(),
            blocks: Mutex::new(Pool::new()),
            subscribers: Subscribers::new(),
            lock: PriorityLock::new(),
            checkpoints: config.checkpoints.clone(),
            use_testnet_rules: config.use_testnet_rules,
            block_pool_capacity: config.block_pool_capacity,
            script_verifier,
        })
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    /// Writes `genesis` if the chain is empty; a no-op otherwise.
    /// Bypasses branch discovery and work comparison entirely, the same
    /// way `DatabaseFacade::initialize` does.
    pub async fn initialize_genesis(&self, genesis: &Block) -> Result<()> {
        let _guard = self.lock.acquire_high().await;
        let mut facade = self.facade.write().await;
        let _seq_guard = SeqWriteGuard::new(&self.seqlock);
        facade.initialize(genesis)
    }

    pub fn orphan_pool_len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    /// The height a pooled hash would occupy if connected, or `None` if
    /// it isn't currently pooled — e.g. to confirm a block rolled back by
    /// a reorganization was returned to the pool (spec §4.15 step 9).
    pub fn pooled_height(&self, hash: &Hash32) -> Option<u32> {
        self.blocks.lock().unwrap().height_of(hash)
    }

    /// The persisted chain's current tip height, or `None` if only
    /// genesis hasn't yet been written. Runs the reader side of the
    /// sequence-lock protocol (spec §4.12): a shared guard is cheap to
    /// take repeatedly, so on interference from a concurrent writer this
    /// retries instead of blocking for the writer's whole critical
    /// section the way a plain mutex would.
    pub async fn top(&self) -> Option<u32> {
        loop {
            let start = self.seqlock.begin_read();
            if start % 2 == 1 {
                tokio::task::yield_now().await;
                continue;
            }
            let snapshot = self.facade.read().await.block.top();
            if self.seqlock.is_read_valid(start) {
                return snapshot;
            }
        }
    }

    /// The header and transaction hashes persisted at `height`. Same
    /// retry discipline as `top`; `Error::NotFound` for an out-of-range
    /// height is returned directly rather than retried, since it reflects
    /// real chain state rather than a torn read.
    pub async fn get_by_height(&self, height: u32) -> Result<(BlockHeader, Vec<Hash32>)> {
        loop {
            let start = self.seqlock.begin_read();
            if start % 2 == 1 {
                tokio::task::yield_now().await;
                continue;
            }
            let snapshot = {
                let facade = self.facade.read().await;
                match facade.block.get_by_height(height) {
                    Ok(row) => {
                        let count = row.tx_count();
                        let mut hashes = Vec::with_capacity(count as usize);
                        for i in 0..count {
                            hashes.push(row.tx_hash(i).ok_or_else(|| Error::Corrupt("missing tx hash in block row".into()))?);
                        }
                        Ok((row.header(), hashes))
                    }
                    Err(e) => Err(e),
                }
            };
            match snapshot {
                Ok(value) => {
                    if self.seqlock.is_read_valid(start) {
                        return Ok(value);
                    }
                }
                Err(Error::NotFound) => {
                    if self.seqlock.is_read_valid(start) {
                        return Err(Error::NotFound);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drops pool entries shallower than the configured retention depth
    /// below the current tip. Run as background maintenance, so it
    /// takes the lock's normal (not reorganization) priority class.
    pub async fn prune_pools(&self) -> usize {
        let _guard = self.lock.acquire_normal().await;
        let top = self.top().await.unwrap_or(0);
        let mut blocks = self.blocks.lock().unwrap();
        let pruned = blocks.prune(top, self.block_pool_capacity);
        metrics::POOL_PRUNED_TOTAL.inc_by(pruned as u64);
        metrics::ORPHAN_POOL_SIZE.set(blocks.len() as i64);
        pruned
    }

    /// Submits one block. `now` is the caller's view of wall-clock time,
    /// threaded through explicitly so the futuristic-timestamp check is
    /// deterministic and testable.
    pub async fn submit_block(&self, block: Block, now: u32) -> Result<SubmitOutcome> {
        validator::check_block(&block)?;

        let _guard = self.lock.acquire_high().await;
        let mut facade = self.facade.write().await;
        let hash = block.hash();

        if facade.block.get_by_hash(&hash)?.is_some() {
            metrics::record_organize_outcome("duplicate");
            return Ok(SubmitOutcome::Duplicate);
        }
        if self.blocks.lock().unwrap().contains(&hash) {
            metrics::record_organize_outcome("duplicate");
            return Ok(SubmitOutcome::Duplicate);
        }

        let height_guess = match facade.block.height_of(&block.header.previous_hash)? {
            Some(h) => h + 1,
            None => self
                .blocks
                .lock()
                .unwrap()
                .height_of(&block.header.previous_hash)
                .map(|h| h + 1)
                .unwrap_or(0),
        };
        {
            let mut blocks = self.blocks.lock().unwrap();
            blocks.add(block, height_guess);
            metrics::ORPHAN_POOL_SIZE.set(blocks.len() as i64);
        }

        let branch = {
            let blocks = self.blocks.lock().unwrap();
            blocks.get_path(&hash, |h| facade.block.height_of(h).ok().flatten())
        };
        let branch = match branch {
            Some(b) => b,
            None => {
                metrics::record_organize_outcome("orphan");
                return Ok(SubmitOutcome::Orphan);
            }
        };

        let current_top = facade.block.top();
        let old_work = self.confirmed_work(&facade, branch.fork_height, current_top)?;
        let new_work = branch
            .items
            .iter()
            .fold(BigUint::from(0u32), |acc, b| acc + b.header.proof());

        if new_work <= old_work {
            metrics::record_organize_outcome("insufficient_work");
            return Ok(SubmitOutcome::InsufficientWork);
        }

        if let Err(e) = self.validate_branch(&facade, &branch, now) {
            metrics::record_organize_outcome("rejected");
            return Err(e);
        }

        let mut outgoing = Vec::new();
        let mut last_height = branch.fork_height;
        {
            let _seq_guard = SeqWriteGuard::new(&self.seqlock);
            if let Some(top) = current_top {
                for _ in 0..top.saturating_sub(branch.fork_height) {
                    outgoing.push(facade.pop()?);
                }
            }
            outgoing.reverse();

            for candidate in &branch.items {
                last_height = facade.push(candidate)?;
            }
        }

        {
            let mut blocks = self.blocks.lock().unwrap();
            for item in &branch.items {
                blocks.remove(&item.hash());
            }
            // Spec §4.15 step 9: the rolled-back confirmed suffix goes back
            // into the pool so it can participate in a future
            // reorganization instead of being lost the moment it's
            // outweighed.
            for (i, item) in outgoing.iter().enumerate() {
                blocks.add(item.clone(), branch.fork_height + 1 + i as u32);
            }
            metrics::ORPHAN_POOL_SIZE.set(blocks.len() as i64);
        }

        metrics::BLOCKS_PUSHED.inc_by(branch.items.len() as u64);
        let reorganized = !outgoing.is_empty();
        if reorganized {
            metrics::BLOCKS_POPPED.inc_by(outgoing.len() as u64);
            metrics::REORGANIZATIONS.inc();
            metrics::REORG_DEPTH.observe(outgoing.len() as f64);
        }
        metrics::CHAIN_TIP_HEIGHT.set(last_height as i64);
        metrics::record_organize_outcome("accepted");

        self.subscribers.notify_reorganize(&ReorganizeEvent {
            fork_height: branch.fork_height,
            incoming: branch.items,
            outgoing,
        });

        Ok(SubmitOutcome::Accepted { height: last_height, reorganized })
    }

    /// Sum of the work contributed by every persisted block strictly
    /// above `fork_height`: the work a candidate branch must beat.
    fn confirmed_work(&self, facade: &DatabaseFacade, fork_height: u32, current_top: Option<u32>) -> Result<BigUint> {
        let mut sum = BigUint::from(0u32);
        if let Some(top) = current_top {
            for h in (fork_height + 1)..=top {
                sum += facade.block.get_by_height(h)?.header().proof();
            }
        }
        Ok(sum)
    }

    /// Runs accept+connect over every block in `branch`, oldest first.
    /// On failure, evicts the failing block and everything after it
    /// (since each later block depends on it) from the pool.
    fn validate_branch(&self, facade: &DatabaseFacade, branch: &Branch<Block>, now: u32) -> Result<()> {
        let mut branch_outputs: HashMap<Outpoint, PrevoutInfo> = HashMap::new();
        let mut validated_headers: Vec<BlockHeader> = Vec::with_capacity(branch.items.len());
        let mut spend_tracker = BranchSpendTracker { facade, branch_spent: HashSet::new() };

        for (index, candidate) in branch.items.iter().enumerate() {
            let height = branch.fork_height + 1 + index as u32;
            let chain_view = BranchChainView {
                facade,
                base_height: branch.fork_height + 1,
                branch_headers: &validated_headers,
            };

            if let Err(e) = validator::accept_block(candidate, height, now, &chain_view, &self.checkpoints, self.use_testnet_rules) {
                metrics::record_validation_failure("accept");
                self.discard_tail(branch, index);
                return Err(e);
            }

            let local_outputs = block_outputs(candidate, height);
            let prevouts = BranchPrevoutLookup { facade, branch_outputs: &branch_outputs, local_outputs: &local_outputs };
            let bip16_enabled = candidate.header.timestamp >= crate::constants::BIP16_ACTIVATION_TIME;
            let base_sigops = legacy_sigop_count(candidate);
            let bip30_exception = crate::constants::is_bip30_exception_height(height);
            let duplicates = BranchDuplicateLookup { facade };

            if let Err(e) = validator::connect_block(
                candidate,
                height,
                &prevouts,
                &mut spend_tracker,
                &self.script_verifier,
                bip16_enabled,
                base_sigops,
                bip30_exception,
                &duplicates,
            ) {
                metrics::record_validation_failure("connect");
                self.discard_tail(branch, index);
                return Err(e);
            }

            branch_outputs.extend(local_outputs);
            validated_headers.push(candidate.header);
        }
        Ok(())
    }

    fn discard_tail(&self, branch: &Branch<Block>, from_index: usize) {
        let mut blocks = self.blocks.lock().unwrap();
        for b in &branch.items[from_index..] {
            blocks.remove(&b.hash());
        }
    }
}

fn legacy_sigop_count(block: &Block) -> u32 {
    let mut sigops = 0u32;
    for tx in &block.transactions {
        for input in &tx.inputs {
            sigops += input.script_sig.legacy_sigop_count();
        }
        for output in &tx.outputs {
            sigops += output.script_pubkey.legacy_sigop_count();
        }
    }
    sigops
}

/// Every output this block itself produces, keyed by outpoint. Spending
/// another transaction's output within the same block resolves through
/// this map regardless of the two transactions' relative order — a
/// small over-permissiveness accepted here since the databases never
/// record an unordered same-block double-spend as a UTXO either way.
fn block_outputs(block: &Block, height: u32) -> HashMap<Outpoint, PrevoutInfo> {
    let mut out = HashMap::new();
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let txid = tx.txid();
        for (out_index, output) in tx.outputs.iter().enumerate() {
            out.insert(
                Outpoint::new(txid, out_index as u32),
                PrevoutInfo {
                    script_pubkey: output.script_pubkey.clone(),
                    value: output.value,
                    height,
                    is_coinbase: tx_index == 0,
                },
            );
        }
    }
    out
}

struct BranchChainView<'a> {
    facade: &'a DatabaseFacade,
    base_height: u32,
    branch_headers: &'a [BlockHeader],
}

impl ChainView for BranchChainView<'_> {
    fn bits_at(&self, height: u32) -> Option<u32> {
        if height >= self.base_height {
            self.branch_headers.get((height - self.base_height) as usize).map(|h| h.bits)
        } else {
            self.facade.block.get_by_height(height).ok().map(|r| r.header().bits)
        }
    }

    fn timestamp_at(&self, height: u32) -> Option<u32> {
        if height >= self.base_height {
            self.branch_headers.get((height - self.base_height) as usize).map(|h| h.timestamp)
        } else {
            self.facade.block.get_by_height(height).ok().map(|r| r.header().timestamp)
        }
    }
}

struct BranchPrevoutLookup<'a> {
    facade: &'a DatabaseFacade,
    branch_outputs: &'a HashMap<Outpoint, PrevoutInfo>,
    local_outputs: &'a HashMap<Outpoint, PrevoutInfo>,
}

impl PrevoutLookup for BranchPrevoutLookup<'_> {
    fn lookup(&self, outpoint: &Outpoint) -> Option<PrevoutInfo> {
        if let Some(info) = self.local_outputs.get(outpoint) {
            return Some(info.clone());
        }
        if let Some(info) = self.branch_outputs.get(outpoint) {
            return Some(info.clone());
        }
        let entry = self.facade.tx.get(&outpoint.hash).ok()??;
        let output = entry.transaction.outputs.get(outpoint.index as usize)?;
        Some(PrevoutInfo {
            script_pubkey: output.script_pubkey.clone(),
            value: output.value,
            height: entry.height,
            is_coinbase: entry.index_in_block == 0,
        })
    }
}

/// Resolves the BIP30 duplicate-transaction-hash condition against the
/// persisted chain only: a txid reused within the same candidate branch
/// before it's ever connected can't yet have spent outputs to check, and
/// mainnet's exception heights are historical constants far below any
/// branch this organizer would realistically validate in one pass.
struct BranchDuplicateLookup<'a> {
    facade: &'a DatabaseFacade,
}

impl DuplicateTxLookup for BranchDuplicateLookup<'_> {
    fn is_unspent_duplicate(&self, txid: &Hash32) -> bool {
        let entry = match self.facade.tx.get(txid) {
            Ok(Some(entry)) => entry,
            _ => return false,
        };
        (0..entry.transaction.outputs.len() as u32)
            .any(|index| matches!(self.facade.spend.get(&Outpoint::new(*txid, index)), Ok(None)))
    }
}

struct BranchSpendTracker<'a> {
    facade: &'a DatabaseFacade,
    branch_spent: HashSet<Outpoint>,
}

impl SpendTracker for BranchSpendTracker<'_> {
    fn is_spent(&self, outpoint: &Outpoint) -> bool {
        self.branch_spent.contains(outpoint) || matches!(self.facade.spend.get(outpoint), Ok(Some(_)))
    }

    fn mark_spent(&mut self, outpoint: &Outpoint) {
        self.branch_spent.insert(*outpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Script, Transaction, TxIn, TxOut};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct AcceptAll;
    impl ScriptVerifier for AcceptAll {
        fn verify(&self, _tx: &Transaction, _input_index: usize, _prevout_script: &Script, _p2sh_enabled: bool) -> bool {
            true
        }
    }

    fn coinbase(marker: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: Outpoint::null(),
                script_sig: Script(vec![marker, 1, 2]),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOut { value: 5_000_000_000, script_pubkey: Script(vec![]) }],
            locktime: 0,
        }
    }

    fn built(previous_hash: Hash32, timestamp: u32, marker: u8) -> Block {
        let transactions = vec![coinbase(marker)];
        let mut header = BlockHeader {
            version: 1,
            previous_hash,
            merkle_root: Hash32::ZERO,
            timestamp,
            bits: 0x207fffff,
            nonce: 0,
        };
        header.merkle_root = Block { header, transactions: transactions.clone() }.merkle_root();
        Block { header, transactions }
    }

    fn test_config() -> StoreConfig {
        StoreConfig {
            data_directory: "/tmp".into(),
            history_start_height: 0,
            stealth_start_height: 0,
            block_pool_capacity: 100,
            checkpoints: vec![],
            use_testnet_rules: false,
            flush_reorganizations: false,
            priority_threads: 1,
            normal_threads: 1,
        }
    }

    async fn opened() -> (tempfile::TempDir, Organizer<AcceptAll>, Block) {
        let dir = tempfile::tempdir().unwrap();
        let organizer = Organizer::open(dir.path(), 16, &test_config(), AcceptAll).unwrap();
        let genesis = built(Hash32::ZERO, 1_000, 0);
        organizer.initialize_genesis(&genesis).await.unwrap();
        (dir, organizer, genesis)
    }

    #[tokio::test]
    async fn extends_tip_when_it_is_the_only_branch() {
        let (_dir, organizer, genesis) = opened().await;
        let block1 = built(genesis.hash(), 2_000, 1);
        let outcome = organizer.submit_block(block1, 10_000).await.unwrap();
        match outcome {
            SubmitOutcome::Accepted { height, reorganized } => {
                assert_eq!(height, 1);
                assert!(!reorganized);
            }
            other => panic!("expected Accepted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let (_dir, organizer, genesis) = opened().await;
        let block1 = built(genesis.hash(), 2_000, 1);
        organizer.submit_block(block1.clone(), 10_000).await.unwrap();
        let outcome = organizer.submit_block(block1, 10_000).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Duplicate));
    }

    #[tokio::test]
    async fn unknown_parent_is_pooled_as_an_orphan() {
        let (_dir, organizer, _genesis) = opened().await;
        let orphan = built(Hash32([0xEE; 32]), 2_000, 1);
        let outcome = organizer.submit_block(orphan, 10_000).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Orphan));
        assert_eq!(organizer.orphan_pool_len(), 1);
    }

    #[tokio::test]
    async fn equal_work_alternative_is_insufficient() {
        let (_dir, organizer, genesis) = opened().await;
        let block1 = built(genesis.hash(), 2_000, 1);
        organizer.submit_block(block1, 10_000).await.unwrap();

        let alternative = built(genesis.hash(), 2_000, 2);
        let outcome = organizer.submit_block(alternative, 10_000).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::InsufficientWork));
    }

    #[tokio::test]
    async fn two_block_branch_outweighs_one_block_tip_and_reorganizes() {
        let (_dir, organizer, genesis) = opened().await;
        let block1 = built(genesis.hash(), 2_000, 1);
        organizer.submit_block(block1.clone(), 10_000).await.unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = Arc::clone(&notified);
        organizer.subscribers().subscribe_reorganize(move |event| {
            assert_eq!(event.fork_height, 0);
            assert_eq!(event.incoming.len(), 2);
            assert_eq!(event.outgoing.len(), 1);
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });

        let alt1 = built(genesis.hash(), 2_000, 9);
        let insufficient = organizer.submit_block(alt1.clone(), 10_000).await.unwrap();
        assert!(matches!(insufficient, SubmitOutcome::InsufficientWork));

        let alt2 = built(alt1.hash(), 3_000, 10);
        let outcome = organizer.submit_block(alt2, 10_000).await.unwrap();
        match outcome {
            SubmitOutcome::Accepted { height, reorganized } => {
                assert_eq!(height, 2);
                assert!(reorganized);
            }
            other => panic!("expected Accepted, got {:?}", other),
        }
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // The rolled-back confirmed block must return to the pool at its
        // old height so it can participate in a future reorganization.
        assert_eq!(organizer.pooled_height(&block1.hash()), Some(1));
        assert_eq!(organizer.orphan_pool_len(), 1);
    }
}
