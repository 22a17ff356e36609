//! Locking conditions for transaction outputs
//!
//! Every output carries a [`LockScript`] describing what a spender must
//! present. The common case is a single signature from the output owner;
//! outputs can also require m-of-n signatures or only become spendable
//! after a point in time.

use crate::core::encode::{write_str, write_time, write_varint, Encode};
use crate::crypto::{verify_signature, Hash256, OwnerKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of keys in a multi-signature condition
pub const MAX_MULTISIG_KEYS: usize = 16;

/// Maximum nesting of time locks around another condition
pub const MAX_LOCK_DEPTH: usize = 2;

// =============================================================================
// Errors
// =============================================================================

/// Lock evaluation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Malformed lock condition: {0}")]
    Malformed(String),
    #[error("Missing signature from {0}")]
    MissingSignature(String),
    #[error("Invalid signature from {0}")]
    InvalidSignature(String),
    #[error("Threshold not met: need {need} signatures, got {got}")]
    ThresholdNotMet { need: u8, got: usize },
    #[error("Time lock active until {0}")]
    TimeLockActive(DateTime<Utc>),
}

impl LockError {
    /// Whether the failure is a bad signature rather than an unmet condition
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self,
            LockError::MissingSignature(_) | LockError::InvalidSignature(_)
        )
    }
}

// =============================================================================
// Unlocking proof
// =============================================================================

/// A public key and its signature over a transaction's signing hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockProof {
    pub public_key: OwnerKey,
    /// Compact ECDSA signature, hex encoded
    pub signature: String,
}

impl UnlockProof {
    pub fn new(public_key: OwnerKey, signature: &[u8]) -> Self {
        Self {
            public_key,
            signature: hex::encode(signature),
        }
    }

    /// Both fields are lowercase hex, the only encoding signing produces
    pub fn is_canonical(&self) -> bool {
        let lower_hex = |s: &str| {
            !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        };
        lower_hex(self.public_key.as_str()) && lower_hex(&self.signature)
    }

    /// Check the signature against `digest`
    fn verify(&self, digest: &Hash256) -> bool {
        let Ok(public_key) = self.public_key.public_key() else {
            return false;
        };
        let Ok(sig) = hex::decode(&self.signature) else {
            return false;
        };
        verify_signature(&public_key, digest, &sig).unwrap_or(false)
    }
}

impl Encode for UnlockProof {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_str(buf, self.public_key.as_str());
        write_str(buf, &self.signature);
    }
}

// =============================================================================
// Lock script
// =============================================================================

/// The condition guarding an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockScript {
    /// Spendable with a signature from the output owner
    #[default]
    Owner,

    /// Requires `threshold` signatures from distinct `keys`
    MultiSig { threshold: u8, keys: Vec<OwnerKey> },

    /// Spendable only at or after `not_before`, then `inner` applies
    TimeLock {
        not_before: DateTime<Utc>,
        inner: Box<LockScript>,
    },
}

impl LockScript {
    pub fn multisig(threshold: u8, keys: Vec<OwnerKey>) -> Self {
        LockScript::MultiSig { threshold, keys }
    }

    pub fn time_locked(not_before: DateTime<Utc>, inner: LockScript) -> Self {
        LockScript::TimeLock {
            not_before,
            inner: Box::new(inner),
        }
    }

    /// Structural checks that do not depend on the spender
    pub fn check_well_formed(&self) -> Result<(), LockError> {
        let mut current = self;
        let mut depth = 0;
        loop {
            match current {
                LockScript::Owner => return Ok(()),
                LockScript::MultiSig { threshold, keys } => {
                    if keys.is_empty() || keys.len() > MAX_MULTISIG_KEYS {
                        return Err(LockError::Malformed(format!(
                            "multisig needs 1..={} keys, has {}",
                            MAX_MULTISIG_KEYS,
                            keys.len()
                        )));
                    }
                    if *threshold == 0 || *threshold as usize > keys.len() {
                        return Err(LockError::Malformed(format!(
                            "threshold {} out of range for {} keys",
                            threshold,
                            keys.len()
                        )));
                    }
                    let distinct: HashSet<&OwnerKey> = keys.iter().collect();
                    if distinct.len() != keys.len() {
                        return Err(LockError::Malformed("duplicate multisig key".into()));
                    }
                    for key in keys {
                        key.public_key()
                            .map_err(|e| LockError::Malformed(e.to_string()))?;
                    }
                    return Ok(());
                }
                LockScript::TimeLock { inner, .. } => {
                    depth += 1;
                    if depth > MAX_LOCK_DEPTH {
                        return Err(LockError::Malformed("time locks nested too deeply".into()));
                    }
                    current = inner;
                }
            }
        }
    }

    /// Evaluate the condition for an output owned by `owner`.
    ///
    /// Every supplied proof must carry a valid signature over `digest`.
    pub fn evaluate(
        &self,
        owner: &OwnerKey,
        proofs: &[UnlockProof],
        digest: &Hash256,
        now: DateTime<Utc>,
    ) -> Result<(), LockError> {
        if let Some(bad) = proofs.iter().find(|p| !p.verify(digest)) {
            return Err(LockError::InvalidSignature(bad.public_key.to_string()));
        }
        let signers: HashSet<&OwnerKey> = proofs.iter().map(|p| &p.public_key).collect();

        let mut current = self;
        loop {
            match current {
                LockScript::Owner => {
                    return if signers.contains(owner) {
                        Ok(())
                    } else {
                        Err(LockError::MissingSignature(owner.to_string()))
                    };
                }
                LockScript::MultiSig { threshold, keys } => {
                    let got = keys.iter().filter(|k| signers.contains(k)).count();
                    return if got >= *threshold as usize {
                        Ok(())
                    } else {
                        Err(LockError::ThresholdNotMet {
                            need: *threshold,
                            got,
                        })
                    };
                }
                LockScript::TimeLock { not_before, inner } => {
                    if now < *not_before {
                        return Err(LockError::TimeLockActive(*not_before));
                    }
                    current = inner;
                }
            }
        }
    }
}

impl Encode for LockScript {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            LockScript::Owner => buf.push(0),
            LockScript::MultiSig { threshold, keys } => {
                buf.push(1);
                buf.push(*threshold);
                write_varint(buf, keys.len() as u64);
                for key in keys {
                    write_str(buf, key.as_str());
                }
            }
            LockScript::TimeLock { not_before, inner } => {
                buf.push(2);
                write_time(buf, not_before);
                inner.encode_to(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha256, KeyPair};
    use chrono::Duration;

    fn proof(kp: &KeyPair, digest: &Hash256) -> UnlockProof {
        UnlockProof::new(kp.owner(), &kp.sign(digest).unwrap())
    }

    #[test]
    fn test_owner_lock() {
        let owner = KeyPair::generate();
        let other = KeyPair::generate();
        let digest = sha256(b"tx");
        let now = Utc::now();

        let lock = LockScript::Owner;
        assert!(lock
            .evaluate(&owner.owner(), &[proof(&owner, &digest)], &digest, now)
            .is_ok());

        let err = lock
            .evaluate(&owner.owner(), &[proof(&other, &digest)], &digest, now)
            .unwrap_err();
        assert!(matches!(err, LockError::MissingSignature(_)));
        assert!(err.is_signature_failure());
    }

    #[test]
    fn test_signature_over_other_digest_rejected() {
        let owner = KeyPair::generate();
        let digest = sha256(b"tx");
        let forged = proof(&owner, &sha256(b"different tx"));

        let err = LockScript::Owner
            .evaluate(&owner.owner(), &[forged], &digest, Utc::now())
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidSignature(_)));
    }

    #[test]
    fn test_multisig_threshold() {
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let lock = LockScript::multisig(2, keys.iter().map(|k| k.owner()).collect());
        assert!(lock.check_well_formed().is_ok());

        let digest = sha256(b"joint authorization");
        let owner = keys[0].owner();
        let now = Utc::now();

        let one = vec![proof(&keys[0], &digest)];
        assert_eq!(
            lock.evaluate(&owner, &one, &digest, now),
            Err(LockError::ThresholdNotMet { need: 2, got: 1 })
        );

        // The same signer twice counts once
        let dup = vec![proof(&keys[0], &digest), proof(&keys[0], &digest)];
        assert!(lock.evaluate(&owner, &dup, &digest, now).is_err());

        let two = vec![proof(&keys[0], &digest), proof(&keys[2], &digest)];
        assert!(lock.evaluate(&owner, &two, &digest, now).is_ok());
    }

    #[test]
    fn test_time_lock() {
        let owner = KeyPair::generate();
        let digest = sha256(b"tx");
        let now = Utc::now();
        let lock = LockScript::time_locked(now + Duration::hours(1), LockScript::Owner);
        let proofs = vec![proof(&owner, &digest)];

        assert!(matches!(
            lock.evaluate(&owner.owner(), &proofs, &digest, now),
            Err(LockError::TimeLockActive(_))
        ));
        assert!(lock
            .evaluate(&owner.owner(), &proofs, &digest, now + Duration::hours(2))
            .is_ok());
    }

    #[test]
    fn test_malformed_locks() {
        let kp = KeyPair::generate();
        assert!(LockScript::multisig(0, vec![kp.owner()]).check_well_formed().is_err());
        assert!(LockScript::multisig(2, vec![kp.owner()]).check_well_formed().is_err());
        assert!(LockScript::multisig(1, vec![kp.owner(), kp.owner()])
            .check_well_formed()
            .is_err());
        assert!(LockScript::multisig(1, vec![OwnerKey::new("nope")])
            .check_well_formed()
            .is_err());

        let now = Utc::now();
        let nested = LockScript::time_locked(
            now,
            LockScript::time_locked(now, LockScript::time_locked(now, LockScript::Owner)),
        );
        assert!(nested.check_well_formed().is_err());
    }

    #[test]
    fn test_serde_tagged_form() {
        let json = serde_json::to_string(&LockScript::Owner).unwrap();
        assert_eq!(json, r#"{"type":"owner"}"#);
    }
}
