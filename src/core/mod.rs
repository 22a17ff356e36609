//! Core ledger data types
//!
//! This module contains the fundamental building blocks:
//! - Canonical byte encoding used for identifiers and signing hashes
//! - Transactions (UTXO model with unlocking proofs)
//! - Blocks (header, merkle commitment, compact targets)
//! - Lock conditions (owner, m-of-n, time lock)
//! - Copyright rights payloads and their lifecycle

pub mod block;
pub mod encode;
pub mod lock;
pub mod rights;
pub mod target;
pub mod transaction;

pub use block::{Block, BlockHash, BlockHeader, BLOCK_VERSION};
pub use encode::Encode;
pub use lock::{LockError, LockScript, UnlockProof, MAX_MULTISIG_KEYS};
pub use rights::{RightsError, RightsPayload, RightsStage};
pub use target::CompactTarget;
pub use transaction::{OutPoint, Transaction, TxId, TxInput, TxOutput, TX_VERSION};
