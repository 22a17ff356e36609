//! Node: the owning context for chain, mempool, storage and miner
//!
//! Chain state (block tree plus tip ledger) and the mempool each sit behind
//! their own async `RwLock`. Whenever both are needed the chain lock is taken
//! first. The canonical tip and the miner state are published on `watch`
//! channels so the mining search can poll for staleness without locking.

use crate::chain::{BlockStatus, ChainError, ChainState, ChainTip};
use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{ErrorClass, TxRejection};
use crate::core::block::{Block, BlockHash};
use crate::core::transaction::{OutPoint, Transaction, TxId};
use crate::crypto::{Hash256, OwnerKey};
use crate::ledger::UtxoEntry;
use crate::mining::{assemble_candidate, search, Candidate, Mempool, MinerState, SearchOutcome};
use crate::storage::{ReplayReport, Storage, StorageError, UtxoSnapshot};
use chrono::{Duration, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Transaction rejected: {0}")]
    Transaction(#[from] TxRejection),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Node halted: {0}")]
    Halted(String),
    #[error("Miner is already running")]
    MinerRunning,
    #[error("Mining worker failed: {0}")]
    Worker(String),
}

impl NodeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            NodeError::Transaction(r) => r.class(),
            NodeError::Chain(e) => e.class(),
            NodeError::Config(_) => ErrorClass::Structural,
            NodeError::MinerRunning => ErrorClass::Transient,
            NodeError::Storage(_) | NodeError::Halted(_) | NodeError::Worker(_) => {
                ErrorClass::System
            }
        }
    }
}

struct MinerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The ledger node
#[derive(Clone)]
pub struct Node {
    config: Arc<NodeConfig>,
    pub chain: Arc<RwLock<ChainState>>,
    pub mempool: Arc<RwLock<Mempool>>,
    storage: Option<Storage>,
    tip_tx: Arc<watch::Sender<ChainTip>>,
    miner_state_tx: Arc<watch::Sender<MinerState>>,
    miner: Arc<Mutex<Option<MinerHandle>>>,
    halted: Arc<RwLock<Option<String>>>,
    /// Accepted blocks the store failed to record, oldest first
    unpersisted: Arc<Mutex<Vec<Block>>>,
}

impl Node {
    /// Build the genesis block, then replay the block store if one is configured
    pub async fn open(config: NodeConfig) -> Result<Self, NodeError> {
        let (node, _) = Self::open_with_report(config).await?;
        Ok(node)
    }

    /// Like [`Node::open`], also returning what the replay found
    pub async fn open_with_report(
        config: NodeConfig,
    ) -> Result<(Self, Option<ReplayReport>), NodeError> {
        config.validate()?;
        let genesis = Block::genesis(
            &config.genesis.allocations(),
            config.consensus.initial_target,
            config.genesis.timestamp,
        );
        let mut chain = ChainState::new(
            genesis,
            config.consensus.clone(),
            config.max_orphans,
            Duration::seconds(config.orphan_expiry_secs as i64),
        )?;

        let (storage, report) = match &config.data_dir {
            Some(dir) => {
                let storage = Storage::open(dir)?;
                let report = storage.replay(&mut chain)?;
                match report.snapshot_matches {
                    Some(true) => info!("Ledger self-check passed against snapshot"),
                    Some(false) => warn!("Ledger self-check failed; snapshot discarded"),
                    None => info!("No ledger snapshot found; replay is authoritative"),
                }
                (Some(storage), Some(report))
            }
            None => (None, None),
        };

        let tip = chain.tip();
        info!(
            "Node opened at height {} (tip {})",
            tip.height,
            tip.hash.short()
        );
        let mempool = Mempool::new(config.mempool_capacity, config.min_fee_per_kb);
        let (tip_tx, _) = watch::channel(tip);
        let (miner_state_tx, _) = watch::channel(MinerState::Idle);

        let node = Self {
            config: Arc::new(config),
            chain: Arc::new(RwLock::new(chain)),
            mempool: Arc::new(RwLock::new(mempool)),
            storage,
            tip_tx: Arc::new(tip_tx),
            miner_state_tx: Arc::new(miner_state_tx),
            miner: Arc::new(Mutex::new(None)),
            halted: Arc::new(RwLock::new(None)),
            unpersisted: Arc::new(Mutex::new(Vec::new())),
        };
        Ok((node, report))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn chain_tip(&self) -> ChainTip {
        self.chain.read().await.tip()
    }

    pub async fn block(&self, hash: &BlockHash) -> Option<Block> {
        self.chain.read().await.block(hash).cloned()
    }

    pub async fn block_at_height(&self, height: u64) -> Option<Block> {
        self.chain.read().await.block_at_height(height).cloned()
    }

    pub async fn balance(&self, owner: &OwnerKey) -> u64 {
        self.chain.read().await.utxos().balance(owner)
    }

    pub async fn outputs_of(&self, owner: &OwnerKey) -> Vec<(OutPoint, UtxoEntry)> {
        self.chain.read().await.utxos().outputs_of(owner)
    }

    pub async fn rights_for_work(&self, work_hash: &Hash256) -> Vec<(OutPoint, UtxoEntry)> {
        self.chain.read().await.utxos().rights_for_work(work_hash)
    }

    pub async fn mempool_len(&self) -> usize {
        self.mempool.read().await.len()
    }

    pub async fn in_mempool(&self, tx_id: &TxId) -> bool {
        self.mempool.read().await.contains(tx_id)
    }

    /// Receive every canonical tip change
    pub fn subscribe_tip(&self) -> watch::Receiver<ChainTip> {
        self.tip_tx.subscribe()
    }

    /// Whether the published tip is no longer `parent`
    pub fn tip_moved_from(&self, parent: &BlockHash) -> bool {
        self.tip_tx.borrow().hash != *parent
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Validate a transaction against the tip ledger and admit it to the mempool
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<TxId, TxRejection> {
        let chain = self.chain.read().await;
        let mut mempool = self.mempool.write().await;
        mempool.submit(tx, chain.utxos(), Utc::now(), chain.params())
    }

    /// Insert a block, persist what was accepted and bring the mempool in
    /// line with the new tip.
    ///
    /// A storage failure halts the node, but the mempool and the published
    /// tip still follow the in-memory chain so they agree once the halt is
    /// cleared.
    pub async fn submit_block(&self, block: Block) -> Result<BlockStatus, NodeError> {
        if let Some(reason) = self.halted.read().await.clone() {
            return Err(NodeError::Halted(reason));
        }

        let now = Utc::now();
        let mut chain = self.chain.write().await;
        let outcome = chain.insert(block, now)?;
        let persisted = self.persist(&outcome.accepted).await;

        if outcome.tip_changed() {
            let mut mempool = self.mempool.write().await;
            let mut returned = Vec::new();
            for change in &outcome.tip_changes {
                // Disconnected blocks come tip first; re-admit in chain order
                for block in change.disconnected.iter().rev() {
                    returned.extend(block.transactions.iter().cloned());
                }
                for block in &change.connected {
                    mempool.remove_confirmed(block);
                }
            }
            if !returned.is_empty() {
                let reinstated =
                    mempool.reinstate(returned, chain.utxos(), now, chain.params());
                info!("Returned {} transactions to the mempool", reinstated);
            }
            mempool.reconcile(chain.utxos());
            drop(mempool);

            let tip = chain.tip();
            self.tip_tx.send_replace(tip);
            debug!("Published tip {} at height {}", tip.hash.short(), tip.height);
        }

        persisted?;
        Ok(outcome.status)
    }

    /// Append accepted blocks to the store, holding them back and halting
    /// on failure
    async fn persist(&self, accepted: &[Block]) -> Result<(), NodeError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        if let Err(e) = storage.append_blocks(accepted) {
            self.unpersisted.lock().await.extend_from_slice(accepted);
            self.halt(format!("block store append failed: {}", e)).await;
            return Err(e.into());
        }
        Ok(())
    }

    // =========================================================================
    // Mining
    // =========================================================================

    /// Build a candidate block on the current tip
    pub async fn assemble(&self, reward: &OwnerKey) -> Result<Candidate, NodeError> {
        let chain = self.chain.read().await;
        let mempool = self.mempool.read().await;
        Ok(assemble_candidate(&chain, &mempool, reward, Utc::now())?)
    }

    /// Mine one block on the current tip and submit it
    pub async fn mine_block(&self, reward: &OwnerKey) -> Result<(Block, BlockStatus), NodeError> {
        let candidate = self.assemble(reward).await?;
        let never = CancellationToken::new();
        let outcome = tokio::task::spawn_blocking(move || {
            search(candidate.block, u64::MAX, || false, &never)
        })
        .await
        .map_err(|e| NodeError::Worker(e.to_string()))?;

        match outcome {
            SearchOutcome::Found(block, _) => {
                let status = self.submit_block(block.clone()).await?;
                Ok((block, status))
            }
            SearchOutcome::Stale(_) | SearchOutcome::Cancelled => {
                Err(NodeError::Worker("search ended without a block".into()))
            }
        }
    }

    /// Start the background miner paying `reward`
    pub async fn start_mining(&self, reward: OwnerKey) -> Result<(), NodeError> {
        if let Some(reason) = self.halted.read().await.clone() {
            return Err(NodeError::Halted(reason));
        }
        let mut miner = self.miner.lock().await;
        if let Some(handle) = miner.as_ref() {
            if !handle.task.is_finished() {
                return Err(NodeError::MinerRunning);
            }
        }

        let cancel = CancellationToken::new();
        let node = self.clone();
        let token = cancel.clone();
        info!("Starting miner for {:?}", reward);
        let task = tokio::spawn(async move { node.mining_loop(reward, token).await });
        *miner = Some(MinerHandle { cancel, task });
        Ok(())
    }

    /// Stop the background miner and wait for it to finish
    pub async fn stop_mining(&self) {
        // Release the handle lock before waiting: the worker may need it to halt
        let handle = self.miner.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                error!("Miner task ended abnormally: {}", e);
            }
            info!("Miner stopped");
        }
        self.set_miner_state(MinerState::Idle);
    }

    pub fn miner_state(&self) -> MinerState {
        *self.miner_state_tx.borrow()
    }

    pub fn subscribe_miner_state(&self) -> watch::Receiver<MinerState> {
        self.miner_state_tx.subscribe()
    }

    fn set_miner_state(&self, state: MinerState) {
        let previous = self.miner_state_tx.send_replace(state);
        if previous != state {
            debug!("Miner {} -> {}", previous, state);
        }
    }

    async fn mining_loop(self, reward: OwnerKey, cancel: CancellationToken) {
        let interval = self.config.stale_check_interval;
        while !cancel.is_cancelled() {
            self.set_miner_state(MinerState::Assembling);
            let candidate = match self.assemble(&reward).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    error!("Cannot assemble a candidate block: {}", e);
                    break;
                }
            };

            self.set_miner_state(MinerState::Searching);
            let parent = candidate.parent;
            let height = candidate.height;
            let tip_rx = self.subscribe_tip();
            let token = cancel.clone();
            let searched = tokio::task::spawn_blocking(move || {
                search(
                    candidate.block,
                    interval,
                    || tip_rx.borrow().hash != parent,
                    &token,
                )
            })
            .await;

            match searched {
                Ok(SearchOutcome::Found(block, stats)) => {
                    self.set_miner_state(MinerState::Found);
                    info!(
                        "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
                        height, stats.time_ms, stats.hash_attempts, stats.hash_rate
                    );
                    self.set_miner_state(MinerState::Submitting);
                    match self.submit_block(block).await {
                        Ok(status) => debug!("Mined block at height {}: {:?}", height, status),
                        Err(e) if e.class() == ErrorClass::System => {
                            error!("Mining stopped: {}", e);
                            break;
                        }
                        Err(e) => warn!("Mined block at height {} rejected: {}", height, e),
                    }
                }
                Ok(SearchOutcome::Stale(stats)) => {
                    self.set_miner_state(MinerState::Preempted);
                    info!(
                        "Candidate at height {} abandoned after {} attempts: tip moved",
                        height, stats.hash_attempts
                    );
                }
                Ok(SearchOutcome::Cancelled) => break,
                Err(e) => {
                    error!("Mining search failed: {}", e);
                    break;
                }
            }
            self.set_miner_state(MinerState::Idle);
            tokio::task::yield_now().await;
        }
        self.set_miner_state(MinerState::Idle);
    }

    // =========================================================================
    // Halting and shutdown
    // =========================================================================

    /// Stop accepting blocks and stop the miner after a storage failure
    async fn halt(&self, reason: String) {
        error!("Node halted: {}", reason);
        *self.halted.write().await = Some(reason);
        if let Some(handle) = self.miner.lock().await.as_ref() {
            handle.cancel.cancel();
        }
    }

    pub async fn is_halted(&self) -> bool {
        self.halted.read().await.is_some()
    }

    /// Resume after the operator has dealt with a storage failure.
    ///
    /// Blocks held back by the failure are written first; if that fails
    /// again the node stays halted.
    pub async fn clear_halt(&self) -> Result<(), NodeError> {
        let mut halted = self.halted.write().await;
        if halted.is_none() {
            return Ok(());
        }
        let mut pending = self.unpersisted.lock().await;
        if let Some(storage) = &self.storage {
            storage.append_blocks(&pending)?;
            if !pending.is_empty() {
                info!("Stored {} blocks held back by the halt", pending.len());
            }
        }
        pending.clear();
        *halted = None;
        info!("Halt cleared");
        Ok(())
    }

    /// Stop mining and write the ledger snapshot
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.stop_mining().await;
        if let Some(storage) = &self.storage {
            let chain = self.chain.read().await;
            storage.save_snapshot(&UtxoSnapshot::capture(&chain))?;
            info!("Snapshot written at height {}", chain.height());
        }
        Ok(())
    }
}
