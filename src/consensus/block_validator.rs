//! Block validation
//!
//! Validation is split in two:
//! - [`check_block_sanity`]: context-free checks (proof of work against the
//!   header's own target, size limits) run before the parent is looked up
//! - [`validate_block`]: everything that depends on the parent (expected
//!   difficulty, timestamps, coinbase, transactions against the parent ledger,
//!   merkle commitment)

use crate::config::ConsensusParams;
use crate::core::block::{Block, BlockHash};
use crate::core::target::CompactTarget;
use crate::ledger::{UtxoOverlay, UtxoView};
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::tx_validator::{validate_transaction, TxRejection};
use super::{ErrorClass, NoClaims, ValidationContext};

/// Why a block was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockRejection {
    #[error("Malformed block: {0}")]
    Structural(String),
    #[error("Header hash does not meet its target")]
    InsufficientWork,
    #[error("Wrong difficulty: expected {expected}, found {found}")]
    BadDifficulty {
        expected: CompactTarget,
        found: CompactTarget,
    },
    #[error("Parent {0} is unknown")]
    OrphanBlock(BlockHash),
    #[error("Invalid coinbase: {0}")]
    InvalidCoinbase(String),
    #[error("Invalid transaction at index {index}: {reason}")]
    InvalidTransactionInBlock { index: usize, reason: TxRejection },
    #[error("Merkle root does not match transactions")]
    MerkleMismatch,
    #[error("Bad timestamp: {0}")]
    BadTimestamp(String),
}

impl BlockRejection {
    pub fn class(&self) -> ErrorClass {
        match self {
            BlockRejection::Structural(_)
            | BlockRejection::InsufficientWork
            | BlockRejection::MerkleMismatch => ErrorClass::Structural,
            BlockRejection::OrphanBlock(_) => ErrorClass::Transient,
            _ => ErrorClass::Consistency,
        }
    }
}

/// Chain context a block is validated in
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    /// Height the block would occupy
    pub height: u64,
    /// Target required by the retarget rules at this height
    pub expected_bits: CompactTarget,
    /// Median timestamp of the preceding blocks on the branch
    pub median_time_past: DateTime<Utc>,
    /// Local clock
    pub now: DateTime<Utc>,
    pub params: &'a ConsensusParams,
}

/// Result of a successful validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub hash: BlockHash,
    pub height: u64,
    pub fees: u64,
    pub tx_count: usize,
    pub size: usize,
}

/// Checks that need nothing but the block itself
pub fn check_block_sanity(block: &Block, params: &ConsensusParams) -> Result<(), BlockRejection> {
    if !block.header.bits.is_valid() {
        return Err(BlockRejection::Structural(format!(
            "target {} cannot be expanded",
            block.header.bits
        )));
    }
    if !block.header.meets_target() {
        return Err(BlockRejection::InsufficientWork);
    }
    if block.transactions.is_empty() {
        return Err(BlockRejection::Structural("no transactions".into()));
    }
    if block.transactions.len() > params.max_block_txs {
        return Err(BlockRejection::Structural(format!(
            "{} transactions exceeds limit {}",
            block.transactions.len(),
            params.max_block_txs
        )));
    }
    let size = block.size();
    if size > params.max_block_bytes {
        return Err(BlockRejection::Structural(format!(
            "{} bytes exceeds limit {}",
            size, params.max_block_bytes
        )));
    }
    Ok(())
}

/// Validate a block against the ledger state of its parent. Pure.
pub fn validate_block(
    block: &Block,
    parent_utxos: &dyn UtxoView,
    ctx: &BlockContext<'_>,
) -> Result<BlockSummary, BlockRejection> {
    let params = ctx.params;
    let header = &block.header;

    if header.bits != ctx.expected_bits {
        return Err(BlockRejection::BadDifficulty {
            expected: ctx.expected_bits,
            found: header.bits,
        });
    }

    if header.timestamp <= ctx.median_time_past {
        return Err(BlockRejection::BadTimestamp(format!(
            "{} is not after median time past {}",
            header.timestamp, ctx.median_time_past
        )));
    }
    if header.timestamp > ctx.now + params.max_future_drift() {
        return Err(BlockRejection::BadTimestamp(format!(
            "{} is too far in the future",
            header.timestamp
        )));
    }

    let coinbase = match block.transactions.first() {
        Some(tx) if tx.is_coinbase() => tx,
        _ => return Err(BlockRejection::InvalidCoinbase("first transaction is not a coinbase".into())),
    };
    if coinbase.coinbase_height != Some(ctx.height) {
        return Err(BlockRejection::InvalidCoinbase(format!(
            "height tag {:?} does not match block height {}",
            coinbase.coinbase_height, ctx.height
        )));
    }
    if coinbase.outputs.len() != 1 {
        return Err(BlockRejection::InvalidCoinbase(format!(
            "{} outputs, expected exactly one",
            coinbase.outputs.len()
        )));
    }
    let reward_output = &coinbase.outputs[0];
    if reward_output.rights.is_some() {
        return Err(BlockRejection::InvalidCoinbase("coinbase cannot carry rights".into()));
    }
    reward_output
        .lock
        .check_well_formed()
        .map_err(|e| BlockRejection::InvalidCoinbase(e.to_string()))?;
    if block.transactions[1..]
        .iter()
        .any(|tx| tx.inputs.is_empty() || tx.coinbase_height.is_some())
    {
        return Err(BlockRejection::InvalidCoinbase("more than one coinbase".into()));
    }

    // Time-dependent rules use the block's own timestamp so replay is deterministic
    let tx_ctx = ValidationContext::new(header.timestamp, params);
    let mut overlay = UtxoOverlay::new(parent_utxos);
    let mut fees: u64 = 0;
    for (index, tx) in block.transactions.iter().enumerate().skip(1) {
        let summary = validate_transaction(tx, &overlay, &NoClaims, &tx_ctx)
            .map_err(|reason| BlockRejection::InvalidTransactionInBlock { index, reason })?;
        fees = fees.checked_add(summary.fee).ok_or_else(|| {
            BlockRejection::InvalidTransactionInBlock {
                index,
                reason: TxRejection::ValueOverflow,
            }
        })?;
        overlay.apply(tx, ctx.height);
    }

    let max_reward = params.block_subsidy.saturating_add(fees);
    if reward_output.value > max_reward {
        return Err(BlockRejection::InvalidCoinbase(format!(
            "claims {} but subsidy plus fees is {}",
            reward_output.value, max_reward
        )));
    }

    if !block.verify_merkle_root() {
        return Err(BlockRejection::MerkleMismatch);
    }

    Ok(BlockSummary {
        hash: block.hash(),
        height: ctx.height,
        fees,
        tx_count: block.transactions.len(),
        size: block.size(),
    })
}
