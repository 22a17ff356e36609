//! Transaction pool (mempool) for pending transactions
//!
//! Holds validated transactions that are not yet in a canonical block.
//! - Every entry spends only outputs that are unspent in the tip ledger
//! - An output is claimed by at most one entry (first seen wins)
//! - Block assembly reads entries by fee rate without removing them
//! - At capacity the lowest fee-rate entry gives way to a strictly better one

use crate::config::ConsensusParams;
use crate::consensus::{validate_transaction, ClaimView, TxRejection, ValidationContext};
use crate::core::block::Block;
use crate::core::transaction::{OutPoint, Transaction, TxId};
use crate::ledger::UtxoView;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

// =============================================================================
// Mempool Entry
// =============================================================================

/// Entry in the mempool with metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub tx_id: TxId,
    pub fee: u64,
    /// Encoded size in bytes
    pub size: usize,
    /// Arrival order, used to break fee-rate ties
    pub seq: u64,
    pub added_at: DateTime<Utc>,
}

impl MempoolEntry {
    /// Compare fee-per-byte exactly by cross-multiplication
    pub fn cmp_fee_rate(&self, other: &MempoolEntry) -> Ordering {
        cmp_rate(self.fee, self.size, other.fee, other.size)
    }
}

fn cmp_rate(fee_a: u64, size_a: usize, fee_b: u64, size_b: usize) -> Ordering {
    let lhs = fee_a as u128 * size_b as u128;
    let rhs = fee_b as u128 * size_a as u128;
    lhs.cmp(&rhs)
}

// =============================================================================
// Mempool
// =============================================================================

/// Memory pool for pending transactions
#[derive(Debug, Default)]
pub struct Mempool {
    entries: HashMap<TxId, MempoolEntry>,
    /// Outpoint to the entry spending it
    claimed: HashMap<OutPoint, TxId>,
    capacity: usize,
    min_fee_per_kb: u64,
    next_seq: u64,
}

impl Mempool {
    pub fn new(capacity: usize, min_fee_per_kb: u64) -> Self {
        Self {
            entries: HashMap::new(),
            claimed: HashMap::new(),
            capacity,
            min_fee_per_kb,
            next_seq: 0,
        }
    }

    /// Validate and admit a transaction against the tip ledger
    pub fn submit(
        &mut self,
        tx: Transaction,
        utxos: &dyn UtxoView,
        now: DateTime<Utc>,
        params: &ConsensusParams,
    ) -> Result<TxId, TxRejection> {
        let tx_id = tx.id();
        if self.entries.contains_key(&tx_id) {
            return Err(TxRejection::AlreadyKnown(tx_id));
        }

        let ctx = ValidationContext::new(now, params);
        let summary = validate_transaction(&tx, utxos, &*self, &ctx)?;

        let required = self.required_fee(summary.size);
        if summary.fee < required {
            return Err(TxRejection::FeeTooLow {
                fee: summary.fee,
                size: summary.size,
                required,
            });
        }

        if self.entries.len() >= self.capacity {
            let lowest = self
                .lowest_entry()
                .filter(|e| {
                    cmp_rate(summary.fee, summary.size, e.fee, e.size) == Ordering::Greater
                })
                .map(|e| e.tx_id);
            match lowest {
                Some(evict) => {
                    debug!("Mempool full, evicting {}", evict.short());
                    self.remove(&evict);
                }
                None => return Err(TxRejection::MempoolFull),
            }
        }

        for input in &tx.inputs {
            self.claimed.insert(input.outpoint.clone(), tx_id);
        }
        let entry = MempoolEntry {
            tx,
            tx_id,
            fee: summary.fee,
            size: summary.size,
            seq: self.next_seq,
            added_at: now,
        };
        self.next_seq += 1;
        self.entries.insert(tx_id, entry);

        info!(
            "Accepted transaction {} (fee {}, {} bytes)",
            tx_id.short(),
            summary.fee,
            summary.size
        );
        Ok(tx_id)
    }

    fn required_fee(&self, size: usize) -> u64 {
        // Rounded up so any non-zero policy charges at least one unit
        (self.min_fee_per_kb as u128 * size as u128).div_ceil(1000) as u64
    }

    fn lowest_entry(&self) -> Option<&MempoolEntry> {
        self.entries
            .values()
            .min_by(|a, b| a.cmp_fee_rate(b).then_with(|| b.seq.cmp(&a.seq)))
    }

    /// Entries in block-assembly order: highest fee rate first, then arrival
    pub fn ordered(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| b.cmp_fee_rate(a).then_with(|| a.seq.cmp(&b.seq)));
        entries
    }

    /// Pick transactions for a block without removing them. Entries that
    /// would overflow `max_bytes` are skipped and smaller ones still considered.
    pub fn take_batch(&self, max_count: usize, max_bytes: usize) -> Vec<MempoolEntry> {
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        for entry in self.ordered() {
            if batch.len() >= max_count {
                break;
            }
            if bytes + entry.size > max_bytes {
                continue;
            }
            bytes += entry.size;
            batch.push(entry.clone());
        }
        batch
    }

    /// Remove a transaction and release its claims
    pub fn remove(&mut self, tx_id: &TxId) -> Option<Transaction> {
        let entry = self.entries.remove(tx_id)?;
        for input in &entry.tx.inputs {
            if self.claimed.get(&input.outpoint) == Some(tx_id) {
                self.claimed.remove(&input.outpoint);
            }
        }
        Some(entry.tx)
    }

    /// Drop transactions mined in `block` and any entry spending an output
    /// the block spent
    pub fn remove_confirmed(&mut self, block: &Block) -> usize {
        let mut doomed: HashSet<TxId> = HashSet::new();
        for tx in &block.transactions {
            let tx_id = tx.id();
            if self.entries.contains_key(&tx_id) {
                doomed.insert(tx_id);
            }
            for input in &tx.inputs {
                if let Some(claimant) = self.claimed.get(&input.outpoint) {
                    doomed.insert(*claimant);
                }
            }
        }
        for tx_id in &doomed {
            self.remove(tx_id);
        }
        if !doomed.is_empty() {
            debug!(
                "Removed {} mempool entries confirmed or conflicted by block {}",
                doomed.len(),
                block.hash().short()
            );
        }
        doomed.len()
    }

    /// Re-admit transactions from disconnected blocks. Coinbases and anything
    /// no longer valid are dropped. Returns how many were accepted.
    pub fn reinstate(
        &mut self,
        txs: impl IntoIterator<Item = Transaction>,
        utxos: &dyn UtxoView,
        now: DateTime<Utc>,
        params: &ConsensusParams,
    ) -> usize {
        let mut accepted = 0;
        for tx in txs {
            if tx.is_coinbase() {
                continue;
            }
            let tx_id = tx.id();
            match self.submit(tx, utxos, now, params) {
                Ok(_) => accepted += 1,
                Err(TxRejection::AlreadyKnown(_)) => {}
                Err(e) => debug!("Dropped disconnected transaction {}: {}", tx_id.short(), e),
            }
        }
        accepted
    }

    /// Drop every entry with an input that is no longer unspent
    pub fn reconcile(&mut self, utxos: &dyn UtxoView) -> usize {
        let stale: Vec<TxId> = self
            .entries
            .values()
            .filter(|e| e.tx.inputs.iter().any(|i| !utxos.is_unspent(&i.outpoint)))
            .map(|e| e.tx_id)
            .collect();
        for tx_id in &stale {
            self.remove(tx_id);
        }
        if !stale.is_empty() {
            info!("Reconciled mempool: dropped {} stale entries", stale.len());
        }
        stale.len()
    }

    pub fn get(&self, tx_id: &TxId) -> Option<&MempoolEntry> {
        self.entries.get(tx_id)
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.entries.contains_key(tx_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.claimed.clear();
    }

    /// Get mempool statistics
    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            tx_count: self.entries.len(),
            total_fees: self.entries.values().map(|e| e.fee).sum(),
            total_size: self.entries.values().map(|e| e.size).sum(),
            claimed_outputs: self.claimed.len(),
        }
    }
}

impl ClaimView for Mempool {
    fn claimant(&self, outpoint: &OutPoint) -> Option<TxId> {
        self.claimed.get(outpoint).copied()
    }
}

/// Mempool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_fees: u64,
    pub total_size: usize,
    pub claimed_outputs: usize,
}

// =============================================================================
// Tests
// =============================================================================
