//! Rights Ledger: a single-node proof-of-work UTXO ledger for copyright
//! ownership tokens
//!
//! This crate provides:
//! - UTXO ledger with per-block undo data and a deterministic digest
//! - Transaction validation with owner signatures, multisig and time locks
//! - Copyright rights lifecycle (sovereignty, instruction, proof, secondary)
//! - Fee-ordered mempool with first-seen conflict handling
//! - Block tree with cumulative-work chain selection, reorgs and orphans
//! - Proof-of-work mining with difficulty retargeting and stale-work preemption
//! - Append-only JSON block store with snapshot self-check
//!
//! The [`Node`] type ties these together behind async locks.

pub mod chain;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod ledger;
pub mod mining;
pub mod node;
pub mod storage;

// Re-export commonly used types
pub use chain::{BlockStatus, ChainError, ChainState, ChainTip};
pub use config::{ConsensusParams, NodeConfig};
pub use consensus::{BlockRejection, ErrorClass, TxRejection};
pub use crate::core::{
    Block, CompactTarget, LockScript, OutPoint, RightsPayload, RightsStage, Transaction, TxOutput,
};
pub use crypto::{Hash256, KeyPair, OwnerKey};
pub use ledger::UtxoSet;
pub use mining::{Mempool, Miner, MinerState};
pub use node::{Node, NodeError};
pub use storage::Storage;
