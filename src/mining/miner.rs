//! Mining engine
//!
//! Builds candidate blocks from the canonical tip and the mempool, then
//! searches the nonce space. The search holds no locks: it polls a
//! staleness check every `stale_check_interval` attempts and abandons the
//! candidate as soon as the tip moves or mining is cancelled.

use crate::chain::{ChainError, ChainState};
use crate::core::block::{truncate_to_seconds, Block, BlockHash};
use crate::core::encode::Encode;
use crate::core::transaction::Transaction;
use crate::crypto::OwnerKey;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::mempool::Mempool;

/// Published miner state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MinerState {
    Idle,
    Assembling,
    Searching,
    Found,
    Submitting,
    /// The tip moved while searching; the candidate was dropped
    Preempted,
}

impl fmt::Display for MinerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MinerState::Idle => "idle",
            MinerState::Assembling => "assembling",
            MinerState::Searching => "searching",
            MinerState::Found => "found",
            MinerState::Submitting => "submitting",
            MinerState::Preempted => "preempted",
        };
        f.write_str(name)
    }
}

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

impl MiningStats {
    fn new(attempts: u64, start: Instant) -> Self {
        let elapsed = start.elapsed().as_millis();
        let hash_rate = if elapsed > 0 {
            (attempts as f64) / (elapsed as f64 / 1000.0)
        } else {
            attempts as f64
        };
        Self {
            hash_attempts: attempts,
            time_ms: elapsed,
            hash_rate,
        }
    }
}

/// An unsolved block built on a specific parent
#[derive(Debug, Clone)]
pub struct Candidate {
    pub block: Block,
    pub parent: BlockHash,
    pub height: u64,
    pub fees: u64,
}

/// How a nonce search ended
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Found(Block, MiningStats),
    /// The parent is no longer the canonical tip
    Stale(MiningStats),
    Cancelled,
}

/// Build a candidate on the current tip paying `reward` the subsidy plus fees
pub fn assemble_candidate(
    chain: &ChainState,
    mempool: &Mempool,
    reward: &OwnerKey,
    now: DateTime<Utc>,
) -> Result<Candidate, ChainError> {
    let params = chain.params();
    let tip = chain.tip();
    let height = tip.height + 1;
    let bits = chain.next_target(&tip.hash)?;
    let earliest = chain.median_time_past(&tip.hash) + Duration::seconds(1);
    let timestamp = truncate_to_seconds(now).max(earliest);

    // Coinbase value is fixed width, so its size does not depend on the fees
    let coinbase_size = Transaction::coinbase(height, reward.clone(), 0).size();
    let header_size = Block::new(tip.hash, Vec::new(), bits, timestamp)
        .header
        .encoded_len();
    let room = params
        .max_block_bytes
        .saturating_sub(header_size + coinbase_size);
    let batch = mempool.take_batch(params.max_block_txs.saturating_sub(1), room);

    let fees = batch
        .iter()
        .fold(0u64, |acc, entry| acc.saturating_add(entry.fee));
    let coinbase = Transaction::coinbase(
        height,
        reward.clone(),
        params.block_subsidy.saturating_add(fees),
    );

    let mut transactions = Vec::with_capacity(batch.len() + 1);
    transactions.push(coinbase);
    transactions.extend(batch.into_iter().map(|entry| entry.tx));

    debug!(
        "Assembled candidate at height {} with {} transactions ({} fees, target {})",
        height,
        transactions.len(),
        fees,
        bits
    );
    Ok(Candidate {
        block: Block::new(tip.hash, transactions, bits, timestamp),
        parent: tip.hash,
        height,
        fees,
    })
}

/// Search for a nonce meeting the header target. `is_stale` and `cancel`
/// are polled before the first attempt and then every `check_interval`.
pub fn search<F>(
    mut block: Block,
    check_interval: u64,
    is_stale: F,
    cancel: &CancellationToken,
) -> SearchOutcome
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let interval = check_interval.max(1);
    let mut attempts: u64 = 0;

    loop {
        if attempts % interval == 0 {
            if cancel.is_cancelled() {
                return SearchOutcome::Cancelled;
            }
            if is_stale() {
                return SearchOutcome::Stale(MiningStats::new(attempts, start));
            }
        }

        attempts += 1;
        if block.header.meets_target() {
            return SearchOutcome::Found(block, MiningStats::new(attempts, start));
        }

        match block.header.nonce.checked_add(1) {
            Some(nonce) => block.header.nonce = nonce,
            None => {
                // Nonce space exhausted for this timestamp
                block.header.timestamp += Duration::seconds(1);
                block.header.nonce = 0;
            }
        }
    }
}

/// Synchronous miner used by tools and tests
pub struct Miner {
    /// Key receiving block rewards
    pub reward: OwnerKey,
}

impl Miner {
    pub fn new(reward: OwnerKey) -> Self {
        Self { reward }
    }

    /// Assemble and solve a block on the current tip. The block is returned,
    /// not inserted.
    pub fn mine_block(
        &self,
        chain: &ChainState,
        mempool: &Mempool,
        now: DateTime<Utc>,
    ) -> Result<(Block, MiningStats), ChainError> {
        let candidate = assemble_candidate(chain, mempool, &self.reward, now)?;
        info!(
            "Mining block {} with target {}...",
            candidate.height, candidate.block.header.bits
        );

        let never = CancellationToken::new();
        match search(candidate.block, u64::MAX, || false, &never) {
            SearchOutcome::Found(block, stats) => {
                info!(
                    "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
                    candidate.height, stats.time_ms, stats.hash_attempts, stats.hash_rate
                );
                Ok((block, stats))
            }
            // Neither can happen without a staleness signal or a cancel
            SearchOutcome::Stale(_) | SearchOutcome::Cancelled => {
                Err(ChainError::UnknownBlock(candidate.parent))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::core::target::CompactTarget;
    use crate::core::transaction::{OutPoint, TxOutput};
    use crate::crypto::KeyPair;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn chain_with(k1: &KeyPair) -> ChainState {
        let params = ConsensusParams::for_testing();
        let genesis = Block::genesis(
            &[(k1.owner(), 1000)],
            params.initial_target,
            Utc::now() - Duration::minutes(5),
        );
        ChainState::new(genesis, params, 10, Duration::hours(1)).unwrap()
    }

    #[test]
    fn test_candidate_collects_fees() {
        let k1 = KeyPair::generate();
        let chain = chain_with(&k1);
        let mut mempool = Mempool::new(10, 0);
        let coin = OutPoint::new(chain.block_at_height(0).unwrap().transactions[0].id(), 0);
        let tx = Transaction::new(
            vec![coin],
            vec![
                TxOutput::new(600, KeyPair::generate().owner()),
                TxOutput::new(390, KeyPair::generate().owner()),
            ],
        )
        .signed(&k1)
        .unwrap();
        mempool
            .submit(tx, chain.utxos(), Utc::now(), chain.params())
            .unwrap();

        let miner = OwnerKey::new("miner");
        let candidate = assemble_candidate(&chain, &mempool, &miner, Utc::now()).unwrap();
        assert_eq!(candidate.height, 1);
        assert_eq!(candidate.fees, 10);
        assert_eq!(candidate.block.transactions.len(), 2);
        assert_eq!(candidate.block.transactions[0].outputs[0].value, 60);
        assert!(candidate.block.header.timestamp > chain.median_time_past(&chain.tip_hash()));
    }

    #[test]
    fn test_mine_block_is_accepted() {
        let k1 = KeyPair::generate();
        let mut chain = chain_with(&k1);
        let mempool = Mempool::new(10, 0);
        let miner = Miner::new(OwnerKey::new("miner"));

        let (block, stats) = miner.mine_block(&chain, &mempool, Utc::now()).unwrap();
        assert!(block.header.meets_target());
        assert!(stats.hash_attempts > 0);
        chain.insert(block, Utc::now()).unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.utxos().balance(&miner.reward), 50);
    }

    #[test]
    fn test_search_abandons_stale_work() {
        // A target no nonce will meet in practice
        let block = Block::new(
            crate::crypto::Hash256::zero(),
            vec![Transaction::coinbase(1, OwnerKey::new("m"), 50)],
            CompactTarget(0x0300_0001),
            Utc::now(),
        );
        let polls = AtomicU64::new(0);
        let outcome = search(
            block,
            16,
            || polls.fetch_add(1, Ordering::SeqCst) >= 2,
            &CancellationToken::new(),
        );
        match outcome {
            SearchOutcome::Stale(stats) => assert_eq!(stats.hash_attempts, 32),
            other => panic!("expected stale outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_search_honours_cancellation() {
        let block = Block::new(
            crate::crypto::Hash256::zero(),
            vec![Transaction::coinbase(1, OwnerKey::new("m"), 50)],
            CompactTarget(0x0300_0001),
            Utc::now(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            search(block, 8, || false, &cancel),
            SearchOutcome::Cancelled
        ));
    }
}
