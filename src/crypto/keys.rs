//! ECDSA key management for the ledger
//!
//! Provides key pair generation, signing, and verification using
//! the secp256k1 elliptic curve. Outputs are owned by a compressed public
//! key ([`OwnerKey`]); the Base58Check address form is only used for display.

use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::hash::{sha256, Hash256};

/// Errors that can occur during key operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// Identifier of an output owner: a hex-encoded compressed public key
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerKey(String);

impl OwnerKey {
    /// Wrap an identifier without checking that it is a valid public key.
    /// Outputs owned by a malformed key are simply unspendable.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and validate a hex-encoded compressed public key
    pub fn parse(hex_key: &str) -> Result<Self, KeyError> {
        public_key_from_hex(hex_key)?;
        Ok(Self(hex_key.to_lowercase()))
    }

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(hex::encode(public_key.serialize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into a secp256k1 public key
    pub fn public_key(&self) -> Result<PublicKey, KeyError> {
        public_key_from_hex(&self.0)
    }

    /// Base58Check(RIPEMD160(SHA256(pubkey))) display form
    pub fn address(&self) -> Option<String> {
        self.public_key().ok().map(|pk| public_key_to_address(&pk))
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.get(..12).unwrap_or(&self.0);
        write!(f, "OwnerKey({})", shown)
    }
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// The owner identifier outputs are locked to
    pub fn owner(&self) -> OwnerKey {
        OwnerKey::from_public_key(&self.public_key)
    }

    /// Sign a 32-byte digest, returning the 64-byte compact signature
    pub fn sign(&self, digest: &Hash256) -> Result<Vec<u8>, KeyError> {
        sign_digest(&self.secret_key, digest)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// Convert a public key to a Base58Check address
pub fn public_key_to_address(public_key: &PublicKey) -> String {
    use ripemd::Digest;

    let key_hash = sha256(&public_key.serialize());
    let mut ripemd = Ripemd160::new();
    ripemd.update(key_hash.as_bytes());
    let ripemd_hash = ripemd.finalize();

    // Version byte 0x00, then the key hash, then a 4-byte checksum
    let mut address_bytes = vec![0x00];
    address_bytes.extend_from_slice(&ripemd_hash);
    let checksum = super::hash::double_sha256(&address_bytes);
    address_bytes.extend_from_slice(&checksum.as_bytes()[..4]);

    bs58::encode(address_bytes).into_string()
}

/// Parse a public key from hex string
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(hex_key).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
    PublicKey::from_slice(&bytes).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

/// Sign a digest with a secret key
pub fn sign_digest(secret_key: &SecretKey, digest: &Hash256) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest_slice(digest.as_bytes())?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verify a compact signature over a digest.
///
/// Returns `Ok(false)` for a well-formed signature that does not verify and
/// an error only when the signature bytes cannot be decoded.
pub fn verify_signature(
    public_key: &PublicKey,
    digest: &Hash256,
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();
    let message = Message::from_digest_slice(digest.as_bytes())?;
    let sig = Signature::from_compact(signature).map_err(|_| KeyError::InvalidSignature)?;

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.private_key_hex().len(), 64);
        // Compressed public key: 33 bytes
        assert_eq!(kp.owner().as_str().len(), 66);
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let digest = sha256(b"transfer rights");

        let signature = kp.sign(&digest).unwrap();
        assert!(verify_signature(&kp.public_key, &digest, &signature).unwrap());

        let other = sha256(b"something else");
        assert!(!verify_signature(&kp.public_key, &other, &signature).unwrap());
    }

    #[test]
    fn test_wrong_key_does_not_verify() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        let digest = sha256(b"payload");
        let signature = kp1.sign(&digest).unwrap();
        assert!(!verify_signature(&kp2.public_key, &digest, &signature).unwrap());
    }

    #[test]
    fn test_garbage_signature_is_an_error() {
        let kp = KeyPair::generate();
        let digest = sha256(b"payload");
        assert_eq!(
            verify_signature(&kp.public_key, &digest, &[1, 2, 3]),
            Err(KeyError::InvalidSignature)
        );
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::from_private_key_hex(&kp1.private_key_hex()).unwrap();
        assert_eq!(kp1.owner(), kp2.owner());
    }

    #[test]
    fn test_owner_key_parse_and_address() {
        let kp = KeyPair::generate();
        let owner = OwnerKey::parse(kp.owner().as_str()).unwrap();
        assert_eq!(owner, kp.owner());
        assert!(owner.address().unwrap().starts_with('1'));

        assert!(OwnerKey::parse("not-a-key").is_err());
        assert!(OwnerKey::new("miner").address().is_none());
    }
}
