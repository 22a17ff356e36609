//! Consensus rules
//!
//! Pure validation of transactions and blocks against read-only views of
//! the ledger. Nothing in this module mutates state; callers apply the
//! effects only after validation succeeds.

pub mod block_validator;
pub mod tx_validator;

use crate::config::ConsensusParams;
use crate::core::transaction::{OutPoint, TxId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use block_validator::{
    check_block_sanity, validate_block, BlockContext, BlockRejection, BlockSummary,
};
pub use tx_validator::{check_tx_structure, validate_transaction, TxRejection, TxSummary};

/// Coarse category of every rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Malformed input that can never become valid
    Structural,
    /// Conflicts with the current ledger or chain state
    Consistency,
    /// May succeed later (missing parent, full pool)
    Transient,
    /// Local failure such as storage I/O
    System,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Structural => "structural",
            ErrorClass::Consistency => "consistency",
            ErrorClass::Transient => "transient",
            ErrorClass::System => "system",
        };
        f.write_str(name)
    }
}

/// Time and rules a validation runs under
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Local time for mempool admission, block time inside blocks
    pub now: DateTime<Utc>,
    pub params: &'a ConsensusParams,
}

impl<'a> ValidationContext<'a> {
    pub fn new(now: DateTime<Utc>, params: &'a ConsensusParams) -> Self {
        Self { now, params }
    }
}

/// Outputs already claimed by pending transactions
pub trait ClaimView {
    /// The pending transaction spending `outpoint`, if any
    fn claimant(&self, outpoint: &OutPoint) -> Option<TxId>;
}

/// No pending claims (block validation)
pub struct NoClaims;

impl ClaimView for NoClaims {
    fn claimant(&self, _outpoint: &OutPoint) -> Option<TxId> {
        None
    }
}
