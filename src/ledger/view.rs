//! Read-only views over unspent outputs
//!
//! Validation never mutates the ledger. A block's transactions are checked
//! against an [`UtxoOverlay`]: the parent ledger plus the effects of the
//! block's earlier transactions, so chains of spends inside one block work.

use crate::core::transaction::{OutPoint, Transaction};
use std::collections::{HashMap, HashSet};

use super::utxo_set::UtxoEntry;

/// Lookup of unspent outputs
pub trait UtxoView {
    fn utxo(&self, outpoint: &OutPoint) -> Option<&UtxoEntry>;

    fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.utxo(outpoint).is_some()
    }
}

/// Pending changes layered over a base view
pub struct UtxoOverlay<'a> {
    base: &'a dyn UtxoView,
    added: HashMap<OutPoint, UtxoEntry>,
    spent: HashSet<OutPoint>,
}

impl<'a> UtxoOverlay<'a> {
    pub fn new(base: &'a dyn UtxoView) -> Self {
        Self {
            base,
            added: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    /// Record the effects of an already validated transaction
    pub fn apply(&mut self, tx: &Transaction, height: u64) {
        for input in &tx.inputs {
            if self.added.remove(&input.outpoint).is_none() {
                self.spent.insert(input.outpoint.clone());
            }
        }
        let tx_id = tx.id();
        let is_coinbase = tx.is_coinbase();
        for (i, output) in tx.outputs.iter().enumerate() {
            self.added.insert(
                OutPoint::new(tx_id, i as u32),
                UtxoEntry {
                    output: output.clone(),
                    height,
                    is_coinbase,
                },
            );
        }
    }
}

impl UtxoView for UtxoOverlay<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        if let Some(entry) = self.added.get(outpoint) {
            return Some(entry);
        }
        if self.spent.contains(outpoint) {
            return None;
        }
        self.base.utxo(outpoint)
    }
}
