//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 hashing and the `Hash256` identifier type
//! - ECDSA key management (secp256k1)
//! - Merkle tree calculations

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, hash_pair, sha256, Hash256, HashParseError};
pub use keys::{
    public_key_from_hex, public_key_to_address, sign_digest, verify_signature, KeyError, KeyPair,
    OwnerKey,
};
pub use merkle::{merkle_root, MerkleProof};
