//! Transaction validation
//!
//! Checks run in a fixed order and stop at the first failure:
//! structure, input existence, mempool conflicts, unlocking proofs,
//! value conservation and finally the copyright rights lifecycle.

use crate::config::ConsensusParams;
use crate::core::lock::{LockError, MAX_MULTISIG_KEYS};
use crate::core::rights::{check_transitions, RightsError, RightsInput};
use crate::core::transaction::{OutPoint, Transaction, TxId, TX_VERSION};
use crate::ledger::UtxoView;
use std::collections::HashSet;
use thiserror::Error;

use super::{ClaimView, ErrorClass, ValidationContext};

/// Why a transaction was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxRejection {
    #[error("Malformed transaction: {0}")]
    Structural(String),
    #[error("Input {0} is unknown or already spent")]
    UnknownOrSpentInput(OutPoint),
    #[error("Input {outpoint} is already claimed by pending transaction {by}")]
    DoubleSpendInMempool { outpoint: OutPoint, by: TxId },
    #[error("Invalid signature on input {index}: {reason}")]
    InvalidSignature { index: usize, reason: String },
    #[error("Lock not satisfied on input {index}: {reason}")]
    LockNotSatisfied { index: usize, reason: String },
    #[error("Value overflow")]
    ValueOverflow,
    #[error("Outputs ({outputs}) exceed inputs ({inputs})")]
    NegativeFee { inputs: u64, outputs: u64 },
    #[error("Rights violation: {0}")]
    RightsViolation(#[from] RightsError),
    #[error("Transaction {0} is already known")]
    AlreadyKnown(TxId),
    #[error("Fee {fee} for {size} bytes is below the minimum of {required}")]
    FeeTooLow { fee: u64, size: usize, required: u64 },
    #[error("Mempool is full")]
    MempoolFull,
}

impl TxRejection {
    pub fn class(&self) -> ErrorClass {
        match self {
            TxRejection::Structural(_) => ErrorClass::Structural,
            TxRejection::FeeTooLow { .. } | TxRejection::MempoolFull => ErrorClass::Transient,
            _ => ErrorClass::Consistency,
        }
    }
}

/// Result of a successful validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSummary {
    pub tx_id: TxId,
    pub fee: u64,
    pub size: usize,
}

/// Checks that need nothing but the transaction itself
pub fn check_tx_structure(tx: &Transaction, params: &ConsensusParams) -> Result<(), TxRejection> {
    let structural = |msg: String| -> Result<(), TxRejection> { Err(TxRejection::Structural(msg)) };

    if tx.version != TX_VERSION {
        return structural(format!("unsupported version {}", tx.version));
    }
    if tx.inputs.is_empty() || tx.coinbase_height.is_some() {
        return structural("coinbase transactions are only valid inside blocks".into());
    }
    if tx.outputs.is_empty() {
        return structural("no outputs".into());
    }
    if tx.inputs.len() > params.max_tx_inputs {
        return structural(format!("{} inputs exceeds limit", tx.inputs.len()));
    }
    if tx.outputs.len() > params.max_tx_outputs {
        return structural(format!("{} outputs exceeds limit", tx.outputs.len()));
    }
    let size = tx.size();
    if size > params.max_tx_bytes {
        return structural(format!("{} bytes exceeds limit", size));
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(&input.outpoint) {
            return structural(format!("input {} referenced twice", input.outpoint));
        }
        if input.proofs.len() > MAX_MULTISIG_KEYS {
            return structural(format!("too many proofs on input {}", input.outpoint));
        }
        // Proofs are part of the txid: one canonical proof per signer
        let mut signers = HashSet::with_capacity(input.proofs.len());
        for proof in &input.proofs {
            if !proof.is_canonical() {
                return structural(format!("non-canonical proof on input {}", input.outpoint));
            }
            if !signers.insert(&proof.public_key) {
                return structural(format!(
                    "signer {} appears twice on input {}",
                    proof.public_key, input.outpoint
                ));
            }
        }
    }

    for (i, output) in tx.outputs.iter().enumerate() {
        output
            .lock
            .check_well_formed()
            .map_err(|e| TxRejection::Structural(format!("output {}: {}", i, e)))?;
        if let Some(rights) = &output.rights {
            rights
                .check_well_formed()
                .map_err(|e| TxRejection::Structural(format!("output {}: {}", i, e)))?;
        }
    }
    Ok(())
}

/// Validate a non-coinbase transaction. Pure: nothing is mutated.
pub fn validate_transaction(
    tx: &Transaction,
    utxos: &dyn UtxoView,
    claims: &dyn ClaimView,
    ctx: &ValidationContext<'_>,
) -> Result<TxSummary, TxRejection> {
    check_tx_structure(tx, ctx.params)?;

    let mut entries = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        let entry = utxos
            .utxo(&input.outpoint)
            .ok_or_else(|| TxRejection::UnknownOrSpentInput(input.outpoint.clone()))?;
        entries.push(entry);
    }

    let tx_id = tx.id();
    for input in &tx.inputs {
        if let Some(by) = claims.claimant(&input.outpoint) {
            if by != tx_id {
                return Err(TxRejection::DoubleSpendInMempool {
                    outpoint: input.outpoint.clone(),
                    by,
                });
            }
        }
    }

    let digest = tx.signing_hash();
    for (index, (input, entry)) in tx.inputs.iter().zip(&entries).enumerate() {
        entry
            .output
            .lock
            .evaluate(&entry.output.owner, &input.proofs, &digest, ctx.now)
            .map_err(|e| lock_rejection(index, e))?;
    }

    let inputs_total = entries
        .iter()
        .try_fold(0u64, |acc, e| acc.checked_add(e.output.value))
        .ok_or(TxRejection::ValueOverflow)?;
    let outputs_total = tx.output_total().ok_or(TxRejection::ValueOverflow)?;
    if outputs_total > inputs_total {
        return Err(TxRejection::NegativeFee {
            inputs: inputs_total,
            outputs: outputs_total,
        });
    }

    let rights_inputs: Vec<RightsInput<'_>> = tx
        .inputs
        .iter()
        .zip(&entries)
        .filter_map(|(input, entry)| {
            entry.output.rights.as_ref().map(|rights| RightsInput {
                outpoint: &input.outpoint,
                owner: &entry.output.owner,
                rights,
            })
        })
        .collect();
    check_transitions(
        &rights_inputs,
        &tx.outputs,
        ctx.now,
        ctx.params.rights_window(),
        ctx.params.max_future_drift(),
    )?;

    Ok(TxSummary {
        tx_id,
        fee: inputs_total - outputs_total,
        size: tx.size(),
    })
}

fn lock_rejection(index: usize, err: LockError) -> TxRejection {
    if err.is_signature_failure() {
        TxRejection::InvalidSignature {
            index,
            reason: err.to_string(),
        }
    } else {
        TxRejection::LockNotSatisfied {
            index,
            reason: err.to_string(),
        }
    }
}
