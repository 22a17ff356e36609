//! Transaction handling for the ledger
//!
//! Implements a UTXO-based transaction model with digital signatures.
//! - Inputs reference unspent outputs and carry unlocking proofs
//! - Outputs carry value, an owner key, optional copyright rights and a lock
//! - A coinbase has no inputs, one output and the height of its block

use crate::core::encode::{
    write_hash, write_list, write_option, write_str, write_u32, write_u64, write_varint, Encode,
};
use crate::core::lock::{LockScript, UnlockProof};
use crate::core::rights::RightsPayload;
use crate::crypto::{double_sha256, Hash256, KeyError, KeyPair, OwnerKey};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Constants
// =============================================================================

/// Current transaction version
pub const TX_VERSION: u32 = 1;

/// Domain tag prepended when computing signing hashes
const SIGHASH_TAG: &[u8] = b"rights-ledger/sighash";

/// Transaction identifier
pub type TxId = Hash256;

// =============================================================================
// Output reference
// =============================================================================

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_id: TxId, index: u32) -> Self {
        Self { tx_id, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id.short(), self.index)
    }
}

impl Encode for OutPoint {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_hash(buf, &self.tx_id);
        write_u32(buf, self.index);
    }
}

// =============================================================================
// Transaction Input
// =============================================================================

/// Transaction input (reference to previous output plus unlocking proof)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub outpoint: OutPoint,
    /// Signatures over the transaction's signing hash
    #[serde(default)]
    pub proofs: Vec<UnlockProof>,
}

impl TxInput {
    pub fn new(outpoint: OutPoint) -> Self {
        Self {
            outpoint,
            proofs: Vec::new(),
        }
    }
}

// =============================================================================
// Transaction Output
// =============================================================================

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in minor units
    pub value: u64,
    /// Owner identifier (compressed public key)
    pub owner: OwnerKey,
    /// Copyright rights carried by this output
    #[serde(default)]
    pub rights: Option<RightsPayload>,
    #[serde(default)]
    pub lock: LockScript,
}

impl TxOutput {
    /// Plain value owned by `owner`
    pub fn new(value: u64, owner: OwnerKey) -> Self {
        Self {
            value,
            owner,
            rights: None,
            lock: LockScript::Owner,
        }
    }

    pub fn with_rights(mut self, rights: RightsPayload) -> Self {
        self.rights = Some(rights);
        self
    }

    pub fn with_lock(mut self, lock: LockScript) -> Self {
        self.lock = lock;
        self
    }

    /// Check if this output belongs to the given owner
    pub fn is_owned_by(&self, owner: &OwnerKey) -> bool {
        &self.owner == owner
    }
}

impl Encode for TxOutput {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.value);
        write_str(buf, self.owner.as_str());
        write_option(buf, self.rights.as_ref(), |b, r| r.encode_to(b));
        self.lock.encode_to(buf);
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A transaction transferring value and rights between owners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Height tag, present only on coinbase transactions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase_height: Option<u64>,
}

impl Transaction {
    /// Create an unsigned transaction spending `outpoints`
    pub fn new(outpoints: Vec<OutPoint>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: TX_VERSION,
            inputs: outpoints.into_iter().map(TxInput::new).collect(),
            outputs,
            coinbase_height: None,
        }
    }

    /// Create the reward transaction for a block at `height`
    pub fn coinbase(height: u64, owner: OwnerKey, value: u64) -> Self {
        Self {
            version: TX_VERSION,
            inputs: Vec::new(),
            outputs: vec![TxOutput::new(value, owner)],
            coinbase_height: Some(height),
        }
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty() && self.coinbase_height.is_some()
    }

    /// Transaction identifier: double SHA-256 of the full encoding
    pub fn id(&self) -> TxId {
        double_sha256(&self.encoded())
    }

    /// Hash signed by every input: the encoding without unlocking proofs
    pub fn signing_hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(SIGHASH_TAG);
        self.encode_body(&mut buf, false);
        double_sha256(&buf)
    }

    /// Encoded size in bytes, used for fee rates and block limits
    pub fn size(&self) -> usize {
        self.encoded_len()
    }

    /// Sum of output values, `None` on overflow
    pub fn output_total(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }

    /// Add a signature from `keypair` to the input at `index`
    pub fn add_proof(&mut self, index: usize, keypair: &KeyPair) -> Result<(), KeyError> {
        let digest = self.signing_hash();
        let signature = keypair.sign(&digest)?;
        if let Some(input) = self.inputs.get_mut(index) {
            input.proofs.push(UnlockProof::new(keypair.owner(), &signature));
        }
        Ok(())
    }

    /// Sign every input with the same key (single-owner spends)
    pub fn sign_all(&mut self, keypair: &KeyPair) -> Result<(), KeyError> {
        let digest = self.signing_hash();
        let signature = keypair.sign(&digest)?;
        let proof = UnlockProof::new(keypair.owner(), &signature);
        for input in &mut self.inputs {
            input.proofs.push(proof.clone());
        }
        Ok(())
    }

    /// Builder-style variant of [`Transaction::sign_all`]
    pub fn signed(mut self, keypair: &KeyPair) -> Result<Self, KeyError> {
        self.sign_all(keypair)?;
        Ok(self)
    }

    fn encode_body(&self, buf: &mut Vec<u8>, with_proofs: bool) {
        write_u32(buf, self.version);
        write_option(buf, self.coinbase_height.as_ref(), |b, h| write_u64(b, *h));
        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.outpoint.encode_to(buf);
            if with_proofs {
                write_list(buf, &input.proofs);
            }
        }
        write_list(buf, &self.outputs);
    }
}

impl Encode for Transaction {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.encode_body(buf, true);
    }
}
