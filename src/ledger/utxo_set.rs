//! The authoritative set of unspent outputs
//!
//! The UTXO set is derived state: applying every transaction of the canonical
//! chain from genesis reproduces it exactly. Each applied transaction yields
//! undo data so a reorganization can walk the set back block by block.

use crate::core::block::{Block, BlockHash};
use crate::core::encode::{write_u64, Encode};
use crate::core::transaction::{OutPoint, Transaction, TxId, TxOutput};
use crate::crypto::{sha256, Hash256, OwnerKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use super::view::UtxoView;

/// Ledger mutation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Input {0} is unknown or already spent")]
    MissingInput(OutPoint),
    #[error("Transaction spends {0} twice")]
    DuplicateInput(OutPoint),
    #[error("Output {0} already exists")]
    DuplicateOutput(OutPoint),
    #[error("Undo data does not match ledger state: {0}")]
    UndoMismatch(String),
}

/// An unspent output with the context it was created in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub output: TxOutput,
    /// Height of the block that created the output
    pub height: u64,
    pub is_coinbase: bool,
}

/// What a single transaction changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxUndo {
    pub tx_id: TxId,
    /// Outputs removed by the transaction, in input order
    pub spent: Vec<(OutPoint, UtxoEntry)>,
    /// Outputs the transaction created
    pub created: Vec<OutPoint>,
}

/// Data required to undo a block during reorganization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUndo {
    pub block_hash: BlockHash,
    pub height: u64,
    /// One entry per transaction, in block order
    pub txs: Vec<TxUndo>,
}

/// UTXO set with an owner index kept in step
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    utxos: HashMap<OutPoint, UtxoEntry>,
    by_owner: HashMap<OwnerKey, HashSet<OutPoint>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.utxos.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.utxos.iter()
    }

    /// Apply one transaction. All-or-nothing: every input must be present and
    /// no new output may already exist, checked before anything changes.
    pub fn apply(&mut self, tx: &Transaction, height: u64) -> Result<TxUndo, LedgerError> {
        let tx_id = tx.id();

        let mut seen = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if !seen.insert(&input.outpoint) {
                return Err(LedgerError::DuplicateInput(input.outpoint.clone()));
            }
            if !self.utxos.contains_key(&input.outpoint) {
                return Err(LedgerError::MissingInput(input.outpoint.clone()));
            }
        }
        let created: Vec<OutPoint> = (0..tx.outputs.len() as u32)
            .map(|i| OutPoint::new(tx_id, i))
            .collect();
        if let Some(existing) = created.iter().find(|op| self.utxos.contains_key(op)) {
            return Err(LedgerError::DuplicateOutput(existing.clone()));
        }

        let mut spent = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if let Some(entry) = self.remove(&input.outpoint) {
                spent.push((input.outpoint.clone(), entry));
            }
        }
        let is_coinbase = tx.is_coinbase();
        for (outpoint, output) in created.iter().zip(&tx.outputs) {
            self.insert(
                outpoint.clone(),
                UtxoEntry {
                    output: output.clone(),
                    height,
                    is_coinbase,
                },
            );
        }

        Ok(TxUndo {
            tx_id,
            spent,
            created,
        })
    }

    /// Reverse a single applied transaction
    pub fn undo(&mut self, undo: &TxUndo) -> Result<(), LedgerError> {
        if let Some(missing) = undo.created.iter().find(|op| !self.utxos.contains_key(op)) {
            return Err(LedgerError::UndoMismatch(format!(
                "created output {} is not unspent",
                missing
            )));
        }
        if let Some((present, _)) = undo.spent.iter().find(|(op, _)| self.utxos.contains_key(op)) {
            return Err(LedgerError::UndoMismatch(format!(
                "spent output {} is already present",
                present
            )));
        }

        for outpoint in &undo.created {
            self.remove(outpoint);
        }
        for (outpoint, entry) in undo.spent.iter().rev() {
            self.insert(outpoint.clone(), entry.clone());
        }
        Ok(())
    }

    /// Apply every transaction of a block in order. On failure the
    /// transactions already applied are reverted before returning.
    pub fn apply_block(&mut self, block: &Block, height: u64) -> Result<BlockUndo, LedgerError> {
        let mut txs = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            match self.apply(tx, height) {
                Ok(undo) => txs.push(undo),
                Err(e) => {
                    for undo in txs.iter().rev() {
                        // Just applied, so the undo cannot mismatch
                        let _ = self.undo(undo);
                    }
                    return Err(e);
                }
            }
        }
        Ok(BlockUndo {
            block_hash: block.hash(),
            height,
            txs,
        })
    }

    /// Remove the outputs a block created and restore the ones it spent
    pub fn revert_block(&mut self, undo: &BlockUndo) -> Result<(), LedgerError> {
        for tx_undo in undo.txs.iter().rev() {
            self.undo(tx_undo)?;
        }
        Ok(())
    }

    /// Replace the whole set by replaying `blocks` from genesis
    pub fn rebuild_from<'a, I>(&mut self, blocks: I) -> Result<Vec<BlockUndo>, LedgerError>
    where
        I: IntoIterator<Item = &'a Block>,
    {
        let mut fresh = UtxoSet::new();
        let mut undos = Vec::new();
        for (height, block) in blocks.into_iter().enumerate() {
            undos.push(fresh.apply_block(block, height as u64)?);
        }
        *self = fresh;
        Ok(undos)
    }

    /// Total unspent value held by `owner`
    pub fn balance(&self, owner: &OwnerKey) -> u64 {
        self.by_owner
            .get(owner)
            .map(|ops| {
                ops.iter()
                    .filter_map(|op| self.utxos.get(op))
                    .fold(0u64, |acc, e| acc.saturating_add(e.output.value))
            })
            .unwrap_or(0)
    }

    /// Unspent outputs owned by `owner`, ordered by outpoint
    pub fn outputs_of(&self, owner: &OwnerKey) -> Vec<(OutPoint, UtxoEntry)> {
        let mut outputs: Vec<(OutPoint, UtxoEntry)> = self
            .by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|op| self.utxos.get(op).map(|e| (op.clone(), e.clone())))
            .collect();
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        outputs
    }

    /// Unspent outputs carrying rights to `work_hash`
    pub fn rights_for_work(&self, work_hash: &Hash256) -> Vec<(OutPoint, UtxoEntry)> {
        let mut outputs: Vec<(OutPoint, UtxoEntry)> = self
            .utxos
            .iter()
            .filter(|(_, e)| {
                e.output
                    .rights
                    .as_ref()
                    .is_some_and(|r| &r.work_hash == work_hash)
            })
            .map(|(op, e)| (op.clone(), e.clone()))
            .collect();
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        outputs
    }

    /// Sum of all unspent values
    pub fn total_value(&self) -> u128 {
        self.utxos.values().map(|e| e.output.value as u128).sum()
    }

    /// Order-independent fingerprint of the set
    pub fn digest(&self) -> Hash256 {
        let mut entries: Vec<(&OutPoint, &UtxoEntry)> = self.utxos.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut buf = Vec::with_capacity(entries.len() * 96);
        for (outpoint, entry) in entries {
            outpoint.encode_to(&mut buf);
            entry.output.encode_to(&mut buf);
            write_u64(&mut buf, entry.height);
            buf.push(entry.is_coinbase as u8);
        }
        sha256(&buf)
    }

    /// Sorted entries, for snapshots
    pub fn snapshot(&self) -> Vec<(OutPoint, UtxoEntry)> {
        let mut entries: Vec<(OutPoint, UtxoEntry)> = self
            .utxos
            .iter()
            .map(|(op, e)| (op.clone(), e.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn from_snapshot(entries: Vec<(OutPoint, UtxoEntry)>) -> Self {
        let mut set = UtxoSet::new();
        for (outpoint, entry) in entries {
            set.insert(outpoint, entry);
        }
        set
    }

    fn insert(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.by_owner
            .entry(entry.output.owner.clone())
            .or_default()
            .insert(outpoint.clone());
        self.utxos.insert(outpoint, entry);
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let entry = self.utxos.remove(outpoint)?;
        if let Some(ops) = self.by_owner.get_mut(&entry.output.owner) {
            ops.remove(outpoint);
            if ops.is_empty() {
                self.by_owner.remove(&entry.output.owner);
            }
        }
        Some(entry)
    }
}

impl UtxoView for UtxoSet {
    fn utxo(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.get(outpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::CompactTarget;
    use crate::crypto::KeyPair;
    use chrono::Utc;

    fn genesis_with(owner: &OwnerKey, value: u64) -> Block {
        Block::genesis(&[(owner.clone(), value)], CompactTarget::POW_LIMIT, Utc::now())
    }

    #[test]
    fn test_apply_and_undo_transaction() {
        let k1 = KeyPair::generate().owner();
        let k2 = KeyPair::generate().owner();
        let genesis = genesis_with(&k1, 1000);

        let mut set = UtxoSet::new();
        set.apply_block(&genesis, 0).unwrap();
        assert_eq!(set.balance(&k1), 1000);
        let before = set.digest();

        let source = OutPoint::new(genesis.transactions[0].id(), 0);
        let tx = Transaction::new(
            vec![source.clone()],
            vec![TxOutput::new(600, k2.clone()), TxOutput::new(400, k1.clone())],
        );
        let undo = set.apply(&tx, 1).unwrap();
        assert_eq!(set.balance(&k1), 400);
        assert_eq!(set.balance(&k2), 600);
        assert!(!set.contains(&source));

        set.undo(&undo).unwrap();
        assert_eq!(set.digest(), before);
        assert_eq!(set.balance(&k2), 0);
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let k1 = KeyPair::generate().owner();
        let genesis = genesis_with(&k1, 1000);
        let mut set = UtxoSet::new();
        set.apply_block(&genesis, 0).unwrap();
        let before = set.digest();

        let good = OutPoint::new(genesis.transactions[0].id(), 0);
        let missing = OutPoint::new(sha256(b"nowhere"), 0);
        let tx = Transaction::new(vec![good, missing.clone()], vec![TxOutput::new(1, k1)]);

        assert_eq!(set.apply(&tx, 1), Err(LedgerError::MissingInput(missing)));
        assert_eq!(set.digest(), before);
    }

    #[test]
    fn test_duplicate_input_rejected() {
        let k1 = KeyPair::generate().owner();
        let genesis = genesis_with(&k1, 1000);
        let mut set = UtxoSet::new();
        set.apply_block(&genesis, 0).unwrap();

        let op = OutPoint::new(genesis.transactions[0].id(), 0);
        let tx = Transaction::new(vec![op.clone(), op.clone()], vec![TxOutput::new(1, k1)]);
        assert_eq!(set.apply(&tx, 1), Err(LedgerError::DuplicateInput(op)));
    }

    #[test]
    fn test_failed_block_leaves_set_untouched() {
        let k1 = KeyPair::generate().owner();
        let genesis = genesis_with(&k1, 1000);
        let mut set = UtxoSet::new();
        set.apply_block(&genesis, 0).unwrap();
        let before = set.digest();

        let op = OutPoint::new(genesis.transactions[0].id(), 0);
        let spend = Transaction::new(vec![op.clone()], vec![TxOutput::new(900, k1.clone())]);
        let double = Transaction::new(vec![op], vec![TxOutput::new(800, k1.clone())]);
        let block = Block::new(
            genesis.hash(),
            vec![Transaction::coinbase(1, k1, 50), spend, double],
            CompactTarget::POW_LIMIT,
            Utc::now(),
        );

        assert!(matches!(
            set.apply_block(&block, 1),
            Err(LedgerError::MissingInput(_))
        ));
        assert_eq!(set.digest(), before);
    }

    #[test]
    fn test_revert_block_restores_digest() {
        let k1 = KeyPair::generate().owner();
        let k2 = KeyPair::generate().owner();
        let genesis = genesis_with(&k1, 1000);
        let mut set = UtxoSet::new();
        set.apply_block(&genesis, 0).unwrap();
        let before = set.digest();

        let op = OutPoint::new(genesis.transactions[0].id(), 0);
        let block = Block::new(
            genesis.hash(),
            vec![
                Transaction::coinbase(1, k2.clone(), 50),
                Transaction::new(vec![op], vec![TxOutput::new(1000, k2.clone())]),
            ],
            CompactTarget::POW_LIMIT,
            Utc::now(),
        );
        let undo = set.apply_block(&block, 1).unwrap();
        assert_eq!(set.balance(&k2), 1050);

        set.revert_block(&undo).unwrap();
        assert_eq!(set.digest(), before);
        assert!(set.revert_block(&undo).is_err());
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let k1 = KeyPair::generate().owner();
        let genesis = genesis_with(&k1, 1000);
        let block = Block::new(
            genesis.hash(),
            vec![Transaction::coinbase(1, k1.clone(), 50)],
            CompactTarget::POW_LIMIT,
            Utc::now(),
        );

        let mut incremental = UtxoSet::new();
        incremental.apply_block(&genesis, 0).unwrap();
        incremental.apply_block(&block, 1).unwrap();

        let mut replayed = UtxoSet::new();
        replayed.rebuild_from([&genesis, &block]).unwrap();
        assert_eq!(replayed.digest(), incremental.digest());
        assert_eq!(replayed.total_value(), 1050);

        let restored = UtxoSet::from_snapshot(incremental.snapshot());
        assert_eq!(restored.digest(), incremental.digest());
        assert_eq!(restored.outputs_of(&k1).len(), 2);
    }
}
