//! Orphan block pool
//!
//! Blocks whose parent is not yet known are held here until the parent
//! arrives or they expire. The pool is bounded; when full, expired entries
//! are pruned first and then the oldest orphan is dropped.

use crate::core::block::{Block, BlockHash};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::HashMap;

/// An orphan block waiting for its parent
#[derive(Debug, Clone)]
pub struct OrphanBlock {
    pub block: Block,
    /// Hash of the parent block we're waiting for
    pub parent_hash: BlockHash,
    /// When this orphan was received
    pub received_at: DateTime<Utc>,
}

impl OrphanBlock {
    pub fn new(block: Block, received_at: DateTime<Utc>) -> Self {
        let parent_hash = block.header.prev_hash;
        Self {
            block,
            parent_hash,
            received_at,
        }
    }

    /// Check if this orphan has expired
    pub fn is_expired(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        now - self.received_at > expiry
    }
}

/// Bounded pool of orphan blocks indexed by parent
#[derive(Debug, Clone)]
pub struct OrphanPool {
    orphans: HashMap<BlockHash, OrphanBlock>,
    /// Map from parent hash to orphan hashes (for quick lookup when parent arrives)
    by_parent: HashMap<BlockHash, Vec<BlockHash>>,
    max_size: usize,
    expiry: Duration,
}

impl OrphanPool {
    pub fn new(max_size: usize, expiry: Duration) -> Self {
        Self {
            orphans: HashMap::new(),
            by_parent: HashMap::new(),
            max_size,
            expiry,
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Add an orphan block to the pool. Returns false if it was already held
    /// or the pool cannot take blocks at all.
    pub fn add(&mut self, block: Block, now: DateTime<Utc>) -> bool {
        let hash = block.hash();
        if self.max_size == 0 || self.orphans.contains_key(&hash) {
            return false;
        }

        if self.orphans.len() >= self.max_size {
            self.prune(now);
        }
        if self.orphans.len() >= self.max_size {
            let oldest = self
                .orphans
                .values()
                .min_by_key(|o| o.received_at)
                .map(|o| o.block.hash());
            if let Some(oldest) = oldest {
                debug!("Orphan pool full, dropping {}", oldest.short());
                self.remove(&oldest);
            }
        }

        let orphan = OrphanBlock::new(block, now);
        self.by_parent
            .entry(orphan.parent_hash)
            .or_default()
            .push(hash);
        self.orphans.insert(hash, orphan);
        true
    }

    /// Remove and return every orphan waiting on `parent`
    pub fn take_children(&mut self, parent: &BlockHash) -> Vec<Block> {
        let hashes = self.by_parent.remove(parent).unwrap_or_default();
        hashes
            .into_iter()
            .filter_map(|h| self.orphans.remove(&h))
            .map(|o| o.block)
            .collect()
    }

    /// Remove an orphan block
    pub fn remove(&mut self, hash: &BlockHash) -> Option<Block> {
        let orphan = self.orphans.remove(hash)?;
        if let Some(siblings) = self.by_parent.get_mut(&orphan.parent_hash) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&orphan.parent_hash);
            }
        }
        Some(orphan.block)
    }

    /// Remove expired orphans
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<BlockHash> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.is_expired(now, self.expiry))
            .map(|(hash, _)| *hash)
            .collect();

        for hash in &expired {
            self.remove(hash);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::CompactTarget;
    use crate::core::transaction::Transaction;
    use crate::crypto::{sha256, OwnerKey};

    fn block_on(parent: BlockHash, height: u64) -> Block {
        Block::new(
            parent,
            vec![Transaction::coinbase(height, OwnerKey::new("m"), 50)],
            CompactTarget::POW_LIMIT,
            Utc::now(),
        )
    }

    #[test]
    fn test_add_and_take_children() {
        let mut pool = OrphanPool::new(10, Duration::hours(1));
        let parent = sha256(b"parent");
        let a = block_on(parent, 1);
        let b = block_on(parent, 2);
        let now = Utc::now();

        assert!(pool.add(a.clone(), now));
        assert!(!pool.add(a.clone(), now));
        assert!(pool.add(b, now));
        assert_eq!(pool.len(), 2);

        let children = pool.take_children(&parent);
        assert_eq!(children.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.take_children(&parent).is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut pool = OrphanPool::new(10, Duration::minutes(10));
        let then = Utc::now();
        pool.add(block_on(sha256(b"p"), 1), then);

        assert_eq!(pool.prune(then + Duration::minutes(5)), 0);
        assert_eq!(pool.prune(then + Duration::minutes(11)), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_bounded_size_drops_oldest() {
        let mut pool = OrphanPool::new(2, Duration::hours(1));
        let now = Utc::now();
        let first = block_on(sha256(b"p1"), 1);
        pool.add(first.clone(), now);
        pool.add(block_on(sha256(b"p2"), 1), now + Duration::seconds(1));
        pool.add(block_on(sha256(b"p3"), 1), now + Duration::seconds(2));

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&first.hash()));
    }
}
