//! Block implementation for the ledger
//!
//! A block contains a header with metadata and a list of transactions.
//! The block identifier is the double SHA-256 of the canonical header encoding.

use crate::core::encode::{write_hash, write_time, write_u32, write_u64, Encode};
use crate::core::target::CompactTarget;
use crate::core::transaction::{Transaction, TxOutput, TX_VERSION};
use crate::crypto::{double_sha256, merkle_root, Hash256, OwnerKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Block Constants
// =============================================================================

/// Current block version
pub const BLOCK_VERSION: u32 = 1;

/// Block identifier
pub type BlockHash = Hash256;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,
    /// Hash of the previous block (zero for genesis)
    pub prev_hash: BlockHash,
    /// Merkle root of all transaction identifiers
    pub merkle_root: Hash256,
    /// Block creation time, whole seconds
    pub timestamp: DateTime<Utc>,
    /// Compact difficulty target
    pub bits: CompactTarget,
    /// Nonce used for proof of work
    pub nonce: u64,
}

impl BlockHeader {
    /// Calculate the hash of the block header
    pub fn hash(&self) -> BlockHash {
        double_sha256(&self.encoded())
    }

    /// Check if the hash meets the header's own target
    pub fn meets_target(&self) -> bool {
        self.bits.is_met_by(&self.hash())
    }
}

impl Encode for BlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.version);
        write_hash(buf, &self.prev_hash);
        write_hash(buf, &self.merkle_root);
        write_time(buf, &self.timestamp);
        write_u32(buf, self.bits.0);
        write_u64(buf, self.nonce);
    }
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Transactions, coinbase first
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new unmined block on top of `prev_hash`
    pub fn new(
        prev_hash: BlockHash,
        transactions: Vec<Transaction>,
        bits: CompactTarget,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let merkle_root = Self::compute_merkle_root(&transactions);
        Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash,
                merkle_root,
                timestamp: truncate_to_seconds(timestamp),
                bits,
                nonce: 0,
            },
            transactions,
        }
    }

    /// Create the genesis block from an initial allocation.
    ///
    /// The genesis block is the trusted root of the chain: it is built
    /// deterministically from configuration and never mined or validated.
    pub fn genesis(
        allocations: &[(OwnerKey, u64)],
        bits: CompactTarget,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let allocation = Transaction {
            version: TX_VERSION,
            inputs: Vec::new(),
            outputs: allocations
                .iter()
                .map(|(owner, value)| TxOutput::new(*value, owner.clone()))
                .collect(),
            coinbase_height: Some(0),
        };
        Self::new(Hash256::zero(), vec![allocation], bits, timestamp)
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn prev_hash(&self) -> &BlockHash {
        &self.header.prev_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_hash.is_zero()
    }

    /// The first transaction, if it has coinbase shape
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Calculate the merkle root from transactions
    pub fn compute_merkle_root(transactions: &[Transaction]) -> Hash256 {
        let ids: Vec<Hash256> = transactions.iter().map(|tx| tx.id()).collect();
        merkle_root(&ids)
    }

    /// Verify the block's merkle root
    pub fn verify_merkle_root(&self) -> bool {
        Self::compute_merkle_root(&self.transactions) == self.header.merkle_root
    }

    /// Recompute the merkle root after editing the transaction list
    pub fn refresh_merkle_root(&mut self) {
        self.header.merkle_root = Self::compute_merkle_root(&self.transactions);
    }

    /// Total encoded size in bytes
    pub fn size(&self) -> usize {
        self.header.encoded_len()
            + self
                .transactions
                .iter()
                .map(|tx| tx.size())
                .sum::<usize>()
    }
}

/// Headers carry whole seconds only
pub fn truncate_to_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}
