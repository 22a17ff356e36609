//! Chain store and chain selection
//!
//! Holds every accepted block as a tree keyed by hash, together with the
//! canonical chain (most cumulative work, first seen wins ties) and the UTXO
//! set of its tip. The store and the ledger change together during a
//! reorganization, so they live in one struct behind one lock.

use crate::config::ConsensusParams;
use crate::consensus::{
    check_block_sanity, validate_block, BlockContext, BlockRejection, BlockSummary, ErrorClass,
};
use crate::core::block::{Block, BlockHash};
use crate::core::target::CompactTarget;
use crate::crypto::Hash256;
use crate::ledger::{BlockUndo, LedgerError, UtxoSet};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use super::orphans::OrphanPool;

/// Chain store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Block {0} is already known")]
    Duplicate(BlockHash),
    #[error("Block {0} was previously found invalid")]
    KnownInvalid(BlockHash),
    #[error("Block {0} is not in the store")]
    UnknownBlock(BlockHash),
    #[error("Block rejected: {0}")]
    Rejected(#[from] BlockRejection),
    #[error("Ledger inconsistency: {0}")]
    Ledger(#[from] LedgerError),
}

impl ChainError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChainError::Rejected(r) => r.class(),
            _ => ErrorClass::Consistency,
        }
    }
}

/// A stored block with its position in the tree
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub block: Block,
    pub height: u64,
    pub cumulative_work: u128,
    /// Order in which the block was first accepted
    pub seq: u64,
}

/// Represents the canonical chain tip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u64,
    /// Total cumulative work on this chain
    pub cumulative_work: u128,
}

/// Where an inserted block ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Block extended the canonical chain
    Extended,
    /// Block made a side branch canonical
    Reorganized { disconnected: usize, connected: usize },
    /// Block was stored on a branch with no more work than the tip
    SideChain,
    /// Block was held as an orphan (waiting for parent)
    Orphaned,
}

/// One change of the canonical tip
#[derive(Debug, Clone, Default)]
pub struct TipChange {
    /// Blocks removed from the canonical chain, tip first
    pub disconnected: Vec<Block>,
    /// Blocks added to the canonical chain, in chain order
    pub connected: Vec<Block>,
}

/// Everything an insert changed
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub hash: BlockHash,
    pub status: BlockStatus,
    /// Newly stored blocks in acceptance order (the block and any orphans it unlocked)
    pub accepted: Vec<Block>,
    /// Canonical tip changes in the order they happened
    pub tip_changes: Vec<TipChange>,
}

impl InsertOutcome {
    fn new(hash: BlockHash, status: BlockStatus) -> Self {
        Self {
            hash,
            status,
            accepted: Vec::new(),
            tip_changes: Vec::new(),
        }
    }

    pub fn tip_changed(&self) -> bool {
        !self.tip_changes.is_empty()
    }
}

/// Block tree, canonical chain and tip ledger
#[derive(Debug, Clone)]
pub struct ChainState {
    params: ConsensusParams,
    entries: HashMap<BlockHash, BlockEntry>,
    children: HashMap<BlockHash, Vec<BlockHash>>,
    /// Height to block hash for the canonical chain
    canonical: Vec<BlockHash>,
    /// Undo data for canonical blocks
    undo: HashMap<BlockHash, BlockUndo>,
    invalid: HashSet<BlockHash>,
    orphans: OrphanPool,
    utxos: UtxoSet,
    next_seq: u64,
}

impl ChainState {
    /// Create a chain rooted at `genesis`
    pub fn new(
        genesis: Block,
        params: ConsensusParams,
        max_orphans: usize,
        orphan_expiry: Duration,
    ) -> Result<Self, ChainError> {
        let hash = genesis.hash();
        let mut utxos = UtxoSet::new();
        let undo = utxos.apply_block(&genesis, 0)?;
        let work = genesis.header.bits.work();

        let mut entries = HashMap::new();
        entries.insert(
            hash,
            BlockEntry {
                block: genesis,
                height: 0,
                cumulative_work: work,
                seq: 0,
            },
        );

        info!("Chain initialised at genesis {}", hash.short());
        Ok(Self {
            params,
            entries,
            children: HashMap::new(),
            canonical: vec![hash],
            undo: HashMap::from([(hash, undo)]),
            invalid: HashSet::new(),
            orphans: OrphanPool::new(max_orphans, orphan_expiry),
            utxos,
            next_seq: 1,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn tip(&self) -> ChainTip {
        let hash = self.tip_hash();
        let entry = &self.entries[&hash];
        ChainTip {
            hash,
            height: entry.height,
            cumulative_work: entry.cumulative_work,
        }
    }

    pub fn tip_hash(&self) -> BlockHash {
        // canonical always holds at least genesis
        self.canonical[self.canonical.len() - 1]
    }

    pub fn height(&self) -> u64 {
        (self.canonical.len() - 1) as u64
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.canonical[0]
    }

    /// Ledger state at the canonical tip
    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    pub fn block(&self, hash: &BlockHash) -> Option<&Block> {
        self.entries.get(hash).map(|e| &e.block)
    }

    pub fn entry(&self, hash: &BlockHash) -> Option<&BlockEntry> {
        self.entries.get(hash)
    }

    /// Canonical block at `height`
    pub fn block_at_height(&self, height: u64) -> Option<&Block> {
        self.canonical
            .get(height as usize)
            .and_then(|h| self.block(h))
    }

    /// Whether the block is stored (orphans are not)
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn is_orphan(&self, hash: &BlockHash) -> bool {
        self.orphans.contains(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_invalid(&self, hash: &BlockHash) -> bool {
        self.invalid.contains(hash)
    }

    pub fn is_canonical(&self, hash: &BlockHash) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|e| self.canonical.get(e.height as usize) == Some(hash))
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    /// Hashes of the blocks built directly on `hash`
    pub fn children_of(&self, hash: &BlockHash) -> &[BlockHash] {
        self.children.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Canonical blocks from genesis to tip
    pub fn canonical_blocks(&self) -> impl Iterator<Item = &Block> {
        self.canonical.iter().filter_map(|h| self.block(h))
    }

    /// Stored blocks in acceptance order (parents precede children)
    pub fn blocks_in_acceptance_order(&self) -> Vec<&Block> {
        let mut entries: Vec<&BlockEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| &e.block).collect()
    }

    /// Ancestor of `hash` at `height`, by explicit walk over parent links
    pub fn ancestor_at(&self, hash: &BlockHash, height: u64) -> Option<BlockHash> {
        let mut current = *hash;
        loop {
            let entry = self.entries.get(&current)?;
            if entry.height < height {
                return None;
            }
            if entry.height == height {
                return Some(current);
            }
            if self.is_canonical(&current) {
                return self.canonical.get(height as usize).copied();
            }
            current = entry.block.header.prev_hash;
        }
    }

    /// Median timestamp of up to `median_time_span` blocks ending at `hash`
    pub fn median_time_past(&self, hash: &BlockHash) -> DateTime<Utc> {
        let mut times = Vec::with_capacity(self.params.median_time_span);
        let mut current = Some(*hash);
        while let Some(h) = current {
            if times.len() >= self.params.median_time_span {
                break;
            }
            match self.entries.get(&h) {
                Some(entry) => {
                    times.push(entry.block.header.timestamp);
                    current = (entry.height > 0).then_some(entry.block.header.prev_hash);
                }
                None => break,
            }
        }
        times.sort();
        times.get(times.len() / 2).copied().unwrap_or_default()
    }

    /// Target required for a child of `parent`
    pub fn next_target(&self, parent: &BlockHash) -> Result<CompactTarget, ChainError> {
        let entry = self
            .entries
            .get(parent)
            .ok_or(ChainError::UnknownBlock(*parent))?;
        let height = entry.height + 1;
        let interval = self.params.retarget_interval;
        let bits = entry.block.header.bits;

        if interval == 0 || height % interval != 0 {
            return Ok(bits);
        }

        let first_hash = self
            .ancestor_at(parent, height - interval)
            .ok_or(ChainError::UnknownBlock(*parent))?;
        let first = &self.entries[&first_hash];
        let actual = (entry.block.header.timestamp - first.block.header.timestamp).num_seconds();
        let new_bits = bits.retarget(
            actual,
            self.params.expected_timespan(),
            self.params.max_adjust_factor,
            self.params.pow_limit,
        );
        debug!(
            "Retarget at height {}: {}s observed, {}s expected, {} -> {}",
            height,
            actual,
            self.params.expected_timespan(),
            bits,
            new_bits
        );
        Ok(new_bits)
    }

    /// Replay the canonical chain into a fresh ledger and compare digests
    pub fn verify_ledger(&self) -> Result<bool, ChainError> {
        let mut replayed = UtxoSet::new();
        replayed.rebuild_from(self.canonical_blocks())?;
        Ok(replayed.digest() == self.utxos.digest())
    }

    pub fn ledger_digest(&self) -> Hash256 {
        self.utxos.digest()
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Insert a block, selecting the best chain and connecting any orphans
    /// that were waiting on it.
    pub fn insert(&mut self, block: Block, now: DateTime<Utc>) -> Result<InsertOutcome, ChainError> {
        let hash = block.hash();
        if self.entries.contains_key(&hash) || self.orphans.contains(&hash) {
            return Err(ChainError::Duplicate(hash));
        }
        if self.invalid.contains(&hash) {
            return Err(ChainError::KnownInvalid(hash));
        }

        check_block_sanity(&block, &self.params).map_err(|e| {
            // Proof of work failed or the block is malformed; nothing to remember
            debug!("Block {} failed sanity checks: {}", hash.short(), e);
            e
        })?;

        self.orphans.prune(now);
        let parent = block.header.prev_hash;
        if self.invalid.contains(&parent) {
            self.invalid.insert(hash);
            return Err(ChainError::KnownInvalid(parent));
        }
        if !self.entries.contains_key(&parent) {
            info!(
                "Orphan block {} waiting for parent {}",
                hash.short(),
                parent.short()
            );
            self.orphans.add(block, now);
            return Ok(InsertOutcome::new(hash, BlockStatus::Orphaned));
        }

        let mut outcome = InsertOutcome::new(hash, BlockStatus::SideChain);
        outcome.status = self.connect(block, now, &mut outcome)?;

        let mut pending = vec![hash];
        while let Some(parent) = pending.pop() {
            for child in self.orphans.take_children(&parent) {
                let child_hash = child.hash();
                match self.connect(child, now, &mut outcome) {
                    Ok(status) => {
                        info!("Connected orphan {} ({:?})", child_hash.short(), status);
                        pending.push(child_hash);
                    }
                    Err(e) => warn!("Orphan {} rejected: {}", child_hash.short(), e),
                }
            }
        }

        Ok(outcome)
    }

    /// Validate and store a block whose parent is known
    fn connect(
        &mut self,
        block: Block,
        now: DateTime<Utc>,
        outcome: &mut InsertOutcome,
    ) -> Result<BlockStatus, ChainError> {
        let hash = block.hash();
        let parent_hash = block.header.prev_hash;
        if self.invalid.contains(&parent_hash) {
            self.invalid.insert(hash);
            return Err(ChainError::KnownInvalid(parent_hash));
        }
        let (parent_height, parent_work) = match self.entries.get(&parent_hash) {
            Some(p) => (p.height, p.cumulative_work),
            None => return Err(BlockRejection::OrphanBlock(parent_hash).into()),
        };

        let height = parent_height + 1;
        let ctx = BlockContext {
            height,
            expected_bits: self.next_target(&parent_hash)?,
            median_time_past: self.median_time_past(&parent_hash),
            now,
            params: &self.params,
        };

        let validated: Result<BlockSummary, BlockRejection> = if parent_hash == self.tip_hash() {
            validate_block(&block, &self.utxos, &ctx)
        } else {
            let branch_ledger = self.ledger_at(&parent_hash)?;
            validate_block(&block, &branch_ledger, &ctx)
        };
        let summary = match validated {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Block {} at height {} rejected: {}", hash.short(), height, e);
                // A future timestamp may become acceptable later
                let retryable = matches!(e, BlockRejection::BadTimestamp(_));
                if e.class() != ErrorClass::Transient && !retryable {
                    self.invalid.insert(hash);
                }
                return Err(e.into());
            }
        };

        let cumulative_work = parent_work.saturating_add(block.header.bits.work());
        self.entries.insert(
            hash,
            BlockEntry {
                block: block.clone(),
                height,
                cumulative_work,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        self.children.entry(parent_hash).or_default().push(hash);
        outcome.accepted.push(block.clone());

        let tip = self.tip();
        if cumulative_work <= tip.cumulative_work {
            info!(
                "Side-chain block {} at height {} ({} txs)",
                hash.short(),
                height,
                summary.tx_count
            );
            return Ok(BlockStatus::SideChain);
        }

        if parent_hash == tip.hash {
            let undo = match self.utxos.apply_block(&block, height) {
                Ok(undo) => undo,
                Err(e) => {
                    self.invalid.insert(hash);
                    return Err(e.into());
                }
            };
            self.canonical.push(hash);
            self.undo.insert(hash, undo);
            info!(
                "Block {} extends chain to height {} ({} txs, {} fees)",
                hash.short(),
                height,
                summary.tx_count,
                summary.fees
            );
            outcome.tip_changes.push(TipChange {
                disconnected: Vec::new(),
                connected: vec![block],
            });
            return Ok(BlockStatus::Extended);
        }

        let change = self.reorganize(&hash)?;
        let status = BlockStatus::Reorganized {
            disconnected: change.disconnected.len(),
            connected: change.connected.len(),
        };
        outcome.tip_changes.push(change);
        Ok(status)
    }

    /// Blocks from the fork point (exclusive) up to `hash`, in chain order,
    /// together with the fork height
    fn branch_to(&self, hash: &BlockHash) -> Result<(u64, Vec<BlockHash>), ChainError> {
        let mut branch = Vec::new();
        let mut current = *hash;
        while !self.is_canonical(&current) {
            let entry = self
                .entries
                .get(&current)
                .ok_or(ChainError::UnknownBlock(current))?;
            branch.push(current);
            current = entry.block.header.prev_hash;
        }
        let fork_height = self.entries[&current].height;
        branch.reverse();
        Ok((fork_height, branch))
    }

    /// Ledger as it stood after `hash`, built on a copy of the tip ledger
    fn ledger_at(&self, hash: &BlockHash) -> Result<UtxoSet, ChainError> {
        let (fork_height, branch) = self.branch_to(hash)?;
        let mut ledger = self.utxos.clone();
        self.rewind(&mut ledger, fork_height)?;
        for block_hash in branch {
            let entry = &self.entries[&block_hash];
            ledger.apply_block(&entry.block, entry.height)?;
        }
        Ok(ledger)
    }

    /// Undo canonical blocks above `fork_height` on `ledger`, returning them tip first
    fn rewind(&self, ledger: &mut UtxoSet, fork_height: u64) -> Result<Vec<Block>, ChainError> {
        let mut disconnected = Vec::new();
        for height in ((fork_height + 1)..=self.height()).rev() {
            let hash = self.canonical[height as usize];
            let undo = self.undo.get(&hash).ok_or_else(|| {
                LedgerError::UndoMismatch(format!("no undo data for {}", hash.short()))
            })?;
            ledger.revert_block(undo)?;
            disconnected.push(self.entries[&hash].block.clone());
        }
        Ok(disconnected)
    }

    /// Switch the canonical chain to end at `new_tip`. Runs on a working copy
    /// and commits only if every step succeeds.
    fn reorganize(&mut self, new_tip: &BlockHash) -> Result<TipChange, ChainError> {
        let old_tip = self.tip();
        let (fork_height, branch) = self.branch_to(new_tip)?;

        let mut working = self.utxos.clone();
        let disconnected = self.rewind(&mut working, fork_height)?;

        let mut connected = Vec::with_capacity(branch.len());
        let mut undos = Vec::with_capacity(branch.len());
        for block_hash in &branch {
            let entry = &self.entries[block_hash];
            match working.apply_block(&entry.block, entry.height) {
                Ok(undo) => {
                    undos.push((*block_hash, undo));
                    connected.push(entry.block.clone());
                }
                Err(e) => {
                    warn!(
                        "Reorg to {} aborted: block {} does not apply: {}",
                        new_tip.short(),
                        block_hash.short(),
                        e
                    );
                    self.invalid.insert(*block_hash);
                    return Err(e.into());
                }
            }
        }

        // Commit
        for hash in self.canonical.drain((fork_height as usize + 1)..) {
            self.undo.remove(&hash);
        }
        for (hash, undo) in undos {
            self.canonical.push(hash);
            self.undo.insert(hash, undo);
        }
        self.utxos = working;

        info!(
            "Reorganization: fork at height {}, {} blocks disconnected, {} connected, tip {} -> {} (height {})",
            fork_height,
            disconnected.len(),
            connected.len(),
            old_tip.hash.short(),
            new_tip.short(),
            self.height()
        );
        Ok(TipChange {
            disconnected,
            connected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{OutPoint, Transaction, TxOutput};
    use crate::crypto::{KeyPair, OwnerKey};

    struct Harness {
        chain: ChainState,
        k1: KeyPair,
        clock: DateTime<Utc>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_params(ConsensusParams::for_testing())
        }

        fn with_params(params: ConsensusParams) -> Self {
            let k1 = KeyPair::generate();
            let clock = Utc::now() - Duration::hours(1);
            let genesis = Block::genesis(&[(k1.owner(), 1000)], params.initial_target, clock);
            let chain = ChainState::new(genesis, params, 10, Duration::hours(1)).unwrap();
            Self { chain, k1, clock }
        }

        fn genesis_coin(&self) -> OutPoint {
            let genesis = self.chain.block_at_height(0).unwrap();
            OutPoint::new(genesis.transactions[0].id(), 0)
        }

        /// Build a solved block on `parent` with the given extra transactions
        fn build(&mut self, parent: BlockHash, miner: &OwnerKey, txs: Vec<Transaction>) -> Block {
            self.clock = self.clock + Duration::seconds(1);
            let entry = self.chain.entry(&parent).unwrap();
            let height = entry.height + 1;
            let mut all = vec![Transaction::coinbase(height, miner.clone(), 50)];
            all.extend(txs);
            let bits = self.chain.next_target(&parent).unwrap();
            let mut block = Block::new(parent, all, bits, self.clock);
            while !block.header.meets_target() {
                block.header.nonce += 1;
            }
            block
        }

        fn extend(&mut self, parent: BlockHash, miner: &OwnerKey) -> Block {
            let block = self.build(parent, miner, vec![]);
            self.chain.insert(block.clone(), Utc::now()).unwrap();
            block
        }
    }

    #[test]
    fn test_extend_chain() {
        let mut h = Harness::new();
        let miner = OwnerKey::new("miner");
        let g = h.chain.tip_hash();

        let b1 = h.build(g, &miner, vec![]);
        let outcome = h.chain.insert(b1.clone(), Utc::now()).unwrap();
        assert_eq!(outcome.status, BlockStatus::Extended);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(h.chain.tip().hash, b1.hash());
        assert_eq!(h.chain.height(), 1);
        assert_eq!(h.chain.utxos().balance(&miner), 50);
        assert!(h.chain.verify_ledger().unwrap());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut h = Harness::new();
        let miner = OwnerKey::new("miner");
        let g = h.chain.tip_hash();
        let b1 = h.extend(g, &miner);

        let err = h.chain.insert(b1.clone(), Utc::now()).unwrap_err();
        assert_eq!(err, ChainError::Duplicate(b1.hash()));
    }

    #[test]
    fn test_equal_work_keeps_first_seen() {
        let mut h = Harness::new();
        let g = h.chain.tip_hash();
        let a1 = h.extend(g, &OwnerKey::new("a"));
        let b1 = h.build(g, &OwnerKey::new("b"), vec![]);

        let outcome = h.chain.insert(b1.clone(), Utc::now()).unwrap();
        assert_eq!(outcome.status, BlockStatus::SideChain);
        assert_eq!(h.chain.tip_hash(), a1.hash());
        assert!(h.chain.contains(&b1.hash()));
        assert!(!h.chain.is_canonical(&b1.hash()));
    }

    #[test]
    fn test_heavier_branch_reorganizes() {
        let mut h = Harness::new();
        let a = OwnerKey::new("a");
        let b = OwnerKey::new("b");
        let g = h.chain.tip_hash();

        let a1 = h.extend(g, &a);
        let a2 = h.extend(a1.hash(), &a);
        let digest_a = h.chain.ledger_digest();

        let b1 = h.extend(g, &b);
        let b2 = h.extend(b1.hash(), &b);
        assert_eq!(h.chain.tip_hash(), a2.hash());
        assert_eq!(h.chain.ledger_digest(), digest_a);

        let b3 = h.build(b2.hash(), &b, vec![]);
        let outcome = h.chain.insert(b3.clone(), Utc::now()).unwrap();
        assert_eq!(
            outcome.status,
            BlockStatus::Reorganized {
                disconnected: 2,
                connected: 3
            }
        );
        let change = &outcome.tip_changes[0];
        assert_eq!(change.disconnected[0].hash(), a2.hash());
        assert_eq!(change.connected[2].hash(), b3.hash());

        assert_eq!(h.chain.tip_hash(), b3.hash());
        assert_eq!(h.chain.utxos().balance(&a), 0);
        assert_eq!(h.chain.utxos().balance(&b), 150);
        assert_eq!(h.chain.block_at_height(1).unwrap().hash(), b1.hash());
        assert!(h.chain.verify_ledger().unwrap());
    }

    #[test]
    fn test_no_double_spend_across_branches() {
        let mut h = Harness::new();
        let k2 = KeyPair::generate();
        let k3 = KeyPair::generate();
        let miner = OwnerKey::new("miner");
        let g = h.chain.tip_hash();
        let coin = h.genesis_coin();

        let to_k2 = Transaction::new(vec![coin.clone()], vec![TxOutput::new(1000, k2.owner())])
            .signed(&h.k1)
            .unwrap();
        let to_k3 = Transaction::new(vec![coin], vec![TxOutput::new(1000, k3.owner())])
            .signed(&h.k1)
            .unwrap();

        let a1 = h.build(g, &miner, vec![to_k2]);
        h.chain.insert(a1.clone(), Utc::now()).unwrap();
        assert_eq!(h.chain.utxos().balance(&k2.owner()), 1000);

        // The conflicting spend is valid on its own branch
        let b1 = h.build(g, &miner, vec![to_k3]);
        h.chain.insert(b1.clone(), Utc::now()).unwrap();
        let b2 = h.build(b1.hash(), &miner, vec![]);
        h.chain.insert(b2, Utc::now()).unwrap();

        assert_eq!(h.chain.utxos().balance(&k2.owner()), 0);
        assert_eq!(h.chain.utxos().balance(&k3.owner()), 1000);
        assert!(h.chain.verify_ledger().unwrap());
    }

    #[test]
    fn test_invalid_side_branch_block_rejected() {
        let mut h = Harness::new();
        let miner = OwnerKey::new("miner");
        let g = h.chain.tip_hash();
        let coin = h.genesis_coin();

        let spend = Transaction::new(vec![coin.clone()], vec![TxOutput::new(1000, miner.clone())])
            .signed(&h.k1)
            .unwrap();
        let a1 = h.build(g, &miner, vec![spend]);
        h.chain.insert(a1.clone(), Utc::now()).unwrap();
        let a2 = h.extend(a1.hash(), &miner);

        // Spending the same coin again on top of a1 is invalid
        let again = Transaction::new(vec![coin], vec![TxOutput::new(999, miner.clone())])
            .signed(&h.k1)
            .unwrap();
        let bad = h.build(a1.hash(), &miner, vec![again]);
        let err = h.chain.insert(bad.clone(), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Rejected(BlockRejection::InvalidTransactionInBlock { .. })
        ));
        assert!(h.chain.is_invalid(&bad.hash()));
        assert_eq!(h.chain.tip_hash(), a2.hash());
        assert_eq!(
            h.chain.insert(bad.clone(), Utc::now()).unwrap_err(),
            ChainError::KnownInvalid(bad.hash())
        );
    }

    #[test]
    fn test_orphans_connect_when_parent_arrives() {
        let mut h = Harness::new();
        let miner = OwnerKey::new("miner");
        let g = h.chain.tip_hash();

        let b1 = h.build(g, &miner, vec![]);
        // Build descendants without inserting b1 into the chain
        let mut shadow = h.chain.clone();
        shadow.insert(b1.clone(), Utc::now()).unwrap();
        std::mem::swap(&mut h.chain, &mut shadow);
        let b2 = h.build(b1.hash(), &miner, vec![]);
        h.chain.insert(b2.clone(), Utc::now()).unwrap();
        let b3 = h.build(b2.hash(), &miner, vec![]);
        std::mem::swap(&mut h.chain, &mut shadow);

        let outcome = h.chain.insert(b3.clone(), Utc::now()).unwrap();
        assert_eq!(outcome.status, BlockStatus::Orphaned);
        let outcome = h.chain.insert(b2.clone(), Utc::now()).unwrap();
        assert_eq!(outcome.status, BlockStatus::Orphaned);
        assert_eq!(h.chain.orphan_count(), 2);

        let outcome = h.chain.insert(b1, Utc::now()).unwrap();
        assert_eq!(outcome.accepted.len(), 3);
        assert_eq!(outcome.tip_changes.len(), 3);
        assert_eq!(h.chain.tip_hash(), b3.hash());
        assert_eq!(h.chain.orphan_count(), 0);
    }

    #[test]
    fn test_orphan_with_wrong_pow_is_not_held() {
        let mut h = Harness::new();
        let miner = OwnerKey::new("miner");
        let mut block = Block::new(
            Hash256([7u8; 32]),
            vec![Transaction::coinbase(5, miner, 50)],
            CompactTarget(0x1d00_ffff),
            Utc::now(),
        );
        block.header.nonce = 0;
        assert!(matches!(
            h.chain.insert(block, Utc::now()),
            Err(ChainError::Rejected(BlockRejection::InsufficientWork))
        ));
        assert_eq!(h.chain.orphan_count(), 0);
    }

    #[test]
    fn test_retarget_changes_expected_bits() {
        let mut params = ConsensusParams::for_testing();
        params.retarget_interval = 4;
        params.initial_target = CompactTarget(0x200f_ffff);
        let mut h = Harness::with_params(params);
        let miner = OwnerKey::new("miner");

        let mut tip = h.chain.tip_hash();
        for _ in 0..3 {
            tip = h.extend(tip, &miner).hash();
        }
        // Blocks one second apart against a 60s spacing: harder at height 4
        let next = h.chain.next_target(&tip).unwrap();
        assert!(next.work() > CompactTarget(0x200f_ffff).work());

        // A block claiming the old target is rejected
        let mut stale = h.build(tip, &miner, vec![]);
        stale.header.bits = CompactTarget(0x200f_ffff);
        while !stale.header.meets_target() {
            stale.header.nonce += 1;
        }
        assert!(matches!(
            h.chain.insert(stale, Utc::now()),
            Err(ChainError::Rejected(BlockRejection::BadDifficulty { .. }))
        ));

        let good = h.build(tip, &miner, vec![]);
        assert_eq!(good.header.bits, next);
        h.chain.insert(good, Utc::now()).unwrap();
        assert_eq!(h.chain.height(), 4);
    }

    #[test]
    fn test_median_time_past() {
        let mut h = Harness::new();
        let miner = OwnerKey::new("miner");
        let mut tip = h.chain.tip_hash();
        for _ in 0..4 {
            tip = h.extend(tip, &miner).hash();
        }
        let times: Vec<DateTime<Utc>> = h
            .chain
            .canonical_blocks()
            .map(|b| b.header.timestamp)
            .collect();
        assert_eq!(h.chain.median_time_past(&tip), times[2]);
    }

    #[test]
    fn test_value_is_conserved_across_extend_and_reorg() {
        let mut h = Harness::new();
        let k2 = KeyPair::generate();
        let k3 = KeyPair::generate();
        let a = OwnerKey::new("a");
        let b = OwnerKey::new("b");
        let g = h.chain.tip_hash();
        assert_eq!(h.chain.utxos().total_value(), 1000);

        // Two chained spends in one block, leaving 15 in fees the coinbase does not claim
        let first = Transaction::new(vec![h.genesis_coin()], vec![TxOutput::new(990, k2.owner())])
            .signed(&h.k1)
            .unwrap();
        let second = Transaction::new(
            vec![OutPoint::new(first.id(), 0)],
            vec![TxOutput::new(985, k3.owner())],
        )
        .signed(&k2)
        .unwrap();
        let a1 = h.build(g, &a, vec![first, second]);
        h.chain.insert(a1.clone(), Utc::now()).unwrap();
        assert_eq!(h.chain.utxos().total_value(), 1000 + 50 - 15);
        assert_eq!(h.chain.utxos().balance(&k3.owner()), 985);

        h.extend(a1.hash(), &a);
        assert_eq!(h.chain.utxos().total_value(), 1000 + 2 * 50 - 15);

        let b1 = h.extend(g, &b);
        let b2 = h.extend(b1.hash(), &b);
        let b3 = h.build(b2.hash(), &b, vec![]);
        let outcome = h.chain.insert(b3, Utc::now()).unwrap();
        assert!(matches!(outcome.status, BlockStatus::Reorganized { .. }));
        assert_eq!(h.chain.height(), 3);
        assert_eq!(h.chain.utxos().total_value(), 1000 + 3 * 50);
        assert_eq!(h.chain.utxos().balance(&h.k1.owner()), 1000);
        assert!(h.chain.verify_ledger().unwrap());
    }
}
