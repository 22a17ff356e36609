//! Copyright rights carried on outputs
//!
//! An output may carry a [`RightsPayload`] naming a work and the stage of
//! the rights it represents. Rights move through a small state machine:
//!
//! ```text
//! Sovereignty ──► Sovereignty      (re-mint by the author)
//! Sovereignty ──► Instruction      (authorization lock)
//! Instruction ──► Proof            (activation by the licensee)
//! Proof       ──► Proof            (renewal / re-mint)
//! Proof       ──► Secondary        (sub-licence, terminal)
//! ```
//!
//! Instruction and Proof outputs are time limited: they can no longer be
//! spent once the authorization window after `issued_at` has passed. An
//! output may not be issued further ahead of the validation time than the
//! allowed clock drift, so the window cannot be pushed into the future.

use crate::core::encode::{write_hash, write_option, write_str, write_time, write_varint, Encode};
use crate::core::transaction::{OutPoint, TxOutput};
use crate::crypto::{Hash256, OwnerKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum title length in bytes
pub const MAX_TITLE_BYTES: usize = 256;

/// Maximum number of entries in a rights scope
pub const MAX_SCOPE_ENTRIES: usize = 32;

/// Stage of a copyright right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RightsStage {
    /// Original ownership held by the author
    Sovereignty,
    /// Authorization granted but not yet activated
    Instruction,
    /// Active licence held by the licensee
    Proof,
    /// Sub-licence derived from a proof
    Secondary,
}

impl RightsStage {
    fn code(self) -> u8 {
        match self {
            RightsStage::Sovereignty => 0,
            RightsStage::Instruction => 1,
            RightsStage::Proof => 2,
            RightsStage::Secondary => 3,
        }
    }

    /// Whether an input at this stage may produce an output at `to`
    pub fn can_become(self, to: RightsStage) -> bool {
        use RightsStage::*;
        matches!(
            (self, to),
            (Sovereignty, Sovereignty)
                | (Sovereignty, Instruction)
                | (Instruction, Proof)
                | (Proof, Proof)
                | (Proof, Secondary)
        )
    }

    /// Stages that stop being spendable after the authorization window
    pub fn expires(self) -> bool {
        matches!(self, RightsStage::Instruction | RightsStage::Proof)
    }

    /// Transitions that must keep the owner of the spent input
    fn preserves_owner(self, to: RightsStage) -> bool {
        use RightsStage::*;
        matches!(
            (self, to),
            (Sovereignty, Sovereignty) | (Proof, Proof) | (Instruction, Proof)
        )
    }
}

impl fmt::Display for RightsStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RightsStage::Sovereignty => "sovereignty",
            RightsStage::Instruction => "instruction",
            RightsStage::Proof => "proof",
            RightsStage::Secondary => "secondary",
        };
        f.write_str(name)
    }
}

/// Rights violations found while validating a transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RightsError {
    #[error("Malformed rights payload: {0}")]
    Malformed(String),
    #[error("New work {0} must be registered as sovereignty, not {1}")]
    UnregisteredWork(Hash256, RightsStage),
    #[error("Illegal rights transition {from} -> {to}")]
    IllegalTransition { from: RightsStage, to: RightsStage },
    #[error("{0} rights must keep the owner of the spent input")]
    OwnerChanged(RightsStage),
    #[error("Secondary scope is not a subset of the proof scope")]
    ScopeNotSubset,
    #[error("Secondary rights must name the spent proof as parent")]
    WrongParent,
    #[error("Rights issued at {issued_at}, beyond the allowed drift from {now}")]
    IssuedInFuture {
        issued_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    #[error("{stage} rights expired at {expired_at}")]
    Expired {
        stage: RightsStage,
        expired_at: DateTime<Utc>,
    },
}

/// Copyright metadata attached to an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightsPayload {
    /// Hash identifying the work
    pub work_hash: Hash256,
    pub title: String,
    pub stage: RightsStage,
    /// Rights covered, e.g. "reproduction", "distribution"
    pub scope: Vec<String>,
    /// Proof output a secondary licence derives from
    #[serde(default)]
    pub parent: Option<OutPoint>,
    pub issued_at: DateTime<Utc>,
}

impl RightsPayload {
    /// Register a new work
    pub fn sovereignty(
        work_hash: Hash256,
        title: impl Into<String>,
        scope: Vec<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            work_hash,
            title: title.into(),
            stage: RightsStage::Sovereignty,
            scope,
            parent: None,
            issued_at,
        }
    }

    /// The same work at another stage
    pub fn advance(&self, stage: RightsStage, issued_at: DateTime<Utc>) -> Self {
        Self {
            stage,
            issued_at,
            parent: None,
            ..self.clone()
        }
    }

    /// A sub-licence of this proof with a narrower scope
    pub fn secondary(
        &self,
        parent: OutPoint,
        scope: Vec<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage: RightsStage::Secondary,
            scope,
            parent: Some(parent),
            issued_at,
            ..self.clone()
        }
    }

    /// When Instruction/Proof rights stop being spendable
    pub fn expires_at(&self, window: Duration) -> Option<DateTime<Utc>> {
        self.stage.expires().then(|| self.issued_at + window)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        matches!(self.expires_at(window), Some(at) if now >= at)
    }

    /// Structural checks independent of the ledger
    pub fn check_well_formed(&self) -> Result<(), RightsError> {
        if self.title.len() > MAX_TITLE_BYTES {
            return Err(RightsError::Malformed(format!(
                "title is {} bytes",
                self.title.len()
            )));
        }
        if self.scope.is_empty() || self.scope.len() > MAX_SCOPE_ENTRIES {
            return Err(RightsError::Malformed(format!(
                "scope must have 1..={} entries",
                MAX_SCOPE_ENTRIES
            )));
        }
        match (self.stage, &self.parent) {
            (RightsStage::Secondary, None) => {
                Err(RightsError::Malformed("secondary rights need a parent".into()))
            }
            (RightsStage::Secondary, Some(_)) | (_, None) => Ok(()),
            (stage, Some(_)) => Err(RightsError::Malformed(format!(
                "{} rights cannot name a parent",
                stage
            ))),
        }
    }

    fn scope_within(&self, outer: &RightsPayload) -> bool {
        self.scope.iter().all(|right| outer.scope.contains(right))
    }
}

impl Encode for RightsPayload {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_hash(buf, &self.work_hash);
        write_str(buf, &self.title);
        buf.push(self.stage.code());
        write_varint(buf, self.scope.len() as u64);
        for right in &self.scope {
            write_str(buf, right);
        }
        write_option(buf, self.parent.as_ref(), |b, p| p.encode_to(b));
        write_time(buf, &self.issued_at);
    }
}

/// A rights-carrying output being spent
#[derive(Debug, Clone, Copy)]
pub struct RightsInput<'a> {
    pub outpoint: &'a OutPoint,
    pub owner: &'a OwnerKey,
    pub rights: &'a RightsPayload,
}

/// Check every rights output of a transaction against its rights inputs
pub fn check_transitions(
    inputs: &[RightsInput<'_>],
    outputs: &[TxOutput],
    now: DateTime<Utc>,
    window: Duration,
    drift: Duration,
) -> Result<(), RightsError> {
    for input in inputs {
        if let Some(expired_at) = input.rights.expires_at(window) {
            if now >= expired_at {
                return Err(RightsError::Expired {
                    stage: input.rights.stage,
                    expired_at,
                });
            }
        }
    }

    for output in outputs {
        let Some(rights) = &output.rights else {
            continue;
        };
        if rights.issued_at > now + drift {
            return Err(RightsError::IssuedInFuture {
                issued_at: rights.issued_at,
                now,
            });
        }

        let mut candidates = inputs
            .iter()
            .filter(|i| i.rights.work_hash == rights.work_hash)
            .peekable();

        if candidates.peek().is_none() {
            if rights.stage != RightsStage::Sovereignty {
                return Err(RightsError::UnregisteredWork(rights.work_hash, rights.stage));
            }
            continue;
        }

        let mut first_error = None;
        let mut satisfied = false;
        for input in candidates {
            match check_one(input, &output.owner, rights) {
                Ok(()) => {
                    satisfied = true;
                    break;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if !satisfied {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
    }
    Ok(())
}

fn check_one(
    input: &RightsInput<'_>,
    owner: &OwnerKey,
    rights: &RightsPayload,
) -> Result<(), RightsError> {
    let from = input.rights.stage;
    let to = rights.stage;

    if !from.can_become(to) {
        return Err(RightsError::IllegalTransition { from, to });
    }
    if from.preserves_owner(to) && owner != input.owner {
        return Err(RightsError::OwnerChanged(to));
    }
    if to == RightsStage::Secondary {
        if rights.parent.as_ref() != Some(input.outpoint) {
            return Err(RightsError::WrongParent);
        }
        if !rights.scope_within(input.rights) {
            return Err(RightsError::ScopeNotSubset);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock::LockScript;
    use crate::crypto::sha256;

    fn scope(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn output(owner: &OwnerKey, rights: RightsPayload) -> TxOutput {
        TxOutput {
            value: 1,
            owner: owner.clone(),
            rights: Some(rights),
            lock: LockScript::Owner,
        }
    }

    fn window() -> Duration {
        Duration::days(90)
    }

    fn drift() -> Duration {
        Duration::hours(2)
    }

    #[test]
    fn test_transition_table() {
        use RightsStage::*;
        assert!(Sovereignty.can_become(Instruction));
        assert!(Instruction.can_become(Proof));
        assert!(Proof.can_become(Secondary));
        assert!(!Sovereignty.can_become(Proof));
        assert!(!Instruction.can_become(Secondary));
        assert!(!Secondary.can_become(Secondary));
        assert!(!Secondary.can_become(Proof));
    }

    #[test]
    fn test_registration_must_be_sovereignty() {
        let author = OwnerKey::new("author");
        let now = Utc::now();
        let work = sha256(b"novel");

        let ok = output(
            &author,
            RightsPayload::sovereignty(work, "Novel", scope(&["reproduction"]), now),
        );
        assert!(check_transitions(&[], &[ok.clone()], now, window(), drift()).is_ok());

        let mut bad = ok;
        bad.rights = bad.rights.map(|r| r.advance(RightsStage::Proof, now));
        assert_eq!(
            check_transitions(&[], &[bad], now, window(), drift()),
            Err(RightsError::UnregisteredWork(work, RightsStage::Proof))
        );
    }

    #[test]
    fn test_activation_and_owner_preservation() {
        let licensee = OwnerKey::new("licensee");
        let thief = OwnerKey::new("thief");
        let now = Utc::now();
        let sov = RightsPayload::sovereignty(sha256(b"w"), "W", scope(&["a", "b"]), now);
        let instruction = sov.advance(RightsStage::Instruction, now);
        let op = OutPoint::new(sha256(b"tx"), 0);

        let inputs = [RightsInput {
            outpoint: &op,
            owner: &licensee,
            rights: &instruction,
        }];

        let proof = output(&licensee, instruction.advance(RightsStage::Proof, now));
        assert!(check_transitions(&inputs, &[proof], now, window(), drift()).is_ok());

        let stolen = output(&thief, instruction.advance(RightsStage::Proof, now));
        assert_eq!(
            check_transitions(&inputs, &[stolen], now, window(), drift()),
            Err(RightsError::OwnerChanged(RightsStage::Proof))
        );
    }

    #[test]
    fn test_expired_instruction_cannot_be_spent() {
        let owner = OwnerKey::new("licensee");
        let issued = Utc::now() - Duration::days(91);
        let instruction = RightsPayload::sovereignty(sha256(b"w"), "W", scope(&["a"]), issued)
            .advance(RightsStage::Instruction, issued);
        let op = OutPoint::new(sha256(b"tx"), 0);
        let inputs = [RightsInput {
            outpoint: &op,
            owner: &owner,
            rights: &instruction,
        }];

        let result = check_transitions(&inputs, &[], Utc::now(), window(), drift());
        assert!(matches!(result, Err(RightsError::Expired { .. })));
    }

    #[test]
    fn test_secondary_scope_and_parent() {
        let holder = OwnerKey::new("holder");
        let sub = OwnerKey::new("sub");
        let now = Utc::now();
        let proof = RightsPayload::sovereignty(sha256(b"w"), "W", scope(&["a", "b"]), now)
            .advance(RightsStage::Proof, now);
        let op = OutPoint::new(sha256(b"proof tx"), 1);
        let inputs = [RightsInput {
            outpoint: &op,
            owner: &holder,
            rights: &proof,
        }];

        let renewed = output(&holder, proof.advance(RightsStage::Proof, now));
        let narrow = output(&sub, proof.secondary(op.clone(), scope(&["a"]), now));
        assert!(check_transitions(&inputs, &[renewed, narrow], now, window(), drift()).is_ok());

        let wide = output(&sub, proof.secondary(op.clone(), scope(&["a", "c"]), now));
        assert_eq!(
            check_transitions(&inputs, &[wide], now, window(), drift()),
            Err(RightsError::ScopeNotSubset)
        );

        let other_parent = OutPoint::new(sha256(b"elsewhere"), 0);
        let orphaned = output(&sub, proof.secondary(other_parent, scope(&["a"]), now));
        assert_eq!(
            check_transitions(&inputs, &[orphaned], now, window(), drift()),
            Err(RightsError::WrongParent)
        );
    }

    #[test]
    fn test_well_formed_payload() {
        let now = Utc::now();
        let sov = RightsPayload::sovereignty(sha256(b"w"), "W", scope(&["a"]), now);
        assert!(sov.check_well_formed().is_ok());

        let empty = RightsPayload::sovereignty(sha256(b"w"), "W", vec![], now);
        assert!(empty.check_well_formed().is_err());

        let mut parentless = sov.advance(RightsStage::Secondary, now);
        parentless.parent = None;
        assert!(parentless.check_well_formed().is_err());
    }

    #[test]
    fn test_expiry_boundary() {
        let issued = Utc::now();
        let proof = RightsPayload::sovereignty(sha256(b"w"), "W", scope(&["a"]), issued)
            .advance(RightsStage::Proof, issued);
        let end = issued + window();
        assert_eq!(proof.expires_at(window()), Some(end));
        assert!(!proof.is_expired(end - Duration::seconds(1), window()));
        assert!(proof.is_expired(end, window()));

        let owner = OwnerKey::new("holder");
        let op = OutPoint::new(sha256(b"tx"), 0);
        let inputs = [RightsInput {
            outpoint: &op,
            owner: &owner,
            rights: &proof,
        }];
        assert!(matches!(
            check_transitions(&inputs, &[], end, window(), drift()),
            Err(RightsError::Expired { .. })
        ));
    }

    #[test]
    fn test_future_issued_rights_are_rejected() {
        let author = OwnerKey::new("author");
        let licensee = OwnerKey::new("licensee");
        let now = Utc::now();
        let sov = RightsPayload::sovereignty(sha256(b"w"), "W", scope(&["a"]), now);
        let op = OutPoint::new(sha256(b"tx"), 0);
        let inputs = [RightsInput {
            outpoint: &op,
            owner: &author,
            rights: &sov,
        }];

        let far = now + Duration::days(36500);
        let lock = output(&licensee, sov.advance(RightsStage::Instruction, far));
        assert_eq!(
            check_transitions(&inputs, &[lock], now, window(), drift()),
            Err(RightsError::IssuedInFuture { issued_at: far, now })
        );

        let near = now + Duration::minutes(5);
        let lock = output(&licensee, sov.advance(RightsStage::Instruction, near));
        assert!(check_transitions(&inputs, &[lock], now, window(), drift()).is_ok());

        let fresh = output(
            &author,
            RightsPayload::sovereignty(sha256(b"new"), "N", scope(&["a"]), far),
        );
        assert!(matches!(
            check_transitions(&[], &[fresh], now, window(), drift()),
            Err(RightsError::IssuedInFuture { .. })
        ));
    }
}
