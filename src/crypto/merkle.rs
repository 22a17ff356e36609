//! Merkle tree implementation for transaction commitment
//!
//! Block headers commit to their transaction set through a binary hash tree
//! over transaction identifiers. Interior nodes are `double_sha256(left || right)`
//! and an odd node at any level is paired with itself.

use super::hash::{hash_pair, Hash256};

/// Calculate the merkle root from a list of transaction identifiers
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::zero();
    }

    let mut current_level: Vec<Hash256> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| {
                // Duplicate the last hash if odd number
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                hash_pair(&chunk[0], right)
            })
            .collect();
    }

    current_level[0]
}

/// Merkle proof for verifying transaction inclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Sibling hashes from leaf to root, with `true` when the sibling is on the left
    pub siblings: Vec<(Hash256, bool)>,
}

impl MerkleProof {
    /// Build the inclusion proof for the leaf at `index`
    pub fn build(hashes: &[Hash256], index: usize) -> Option<Self> {
        if index >= hashes.len() {
            return None;
        }

        let mut siblings = Vec::new();
        let mut level = hashes.to_vec();
        let mut position = index;

        while level.len() > 1 {
            let sibling_pos = position ^ 1;
            let sibling = level.get(sibling_pos).copied().unwrap_or(level[position]);
            siblings.push((sibling, sibling_pos < position));

            level = level
                .chunks(2)
                .map(|chunk| hash_pair(&chunk[0], chunk.get(1).unwrap_or(&chunk[0])))
                .collect();
            position /= 2;
        }

        Some(Self { siblings })
    }

    /// Verify the proof against a root hash
    pub fn verify(&self, leaf: &Hash256, root: &Hash256) -> bool {
        let computed = self.siblings.iter().fold(*leaf, |current, (sibling, is_left)| {
            if *is_left {
                hash_pair(sibling, &current)
            } else {
                hash_pair(&current, sibling)
            }
        });
        computed == *root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha256;

    #[test]
    fn test_merkle_root_single() {
        let hashes = vec![sha256(b"tx1")];
        assert_eq!(merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_merkle_root_two() {
        let hash1 = sha256(b"tx1");
        let hash2 = sha256(b"tx2");
        let root = merkle_root(&[hash1, hash2]);
        assert_eq!(root, hash_pair(&hash1, &hash2));
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let h: Vec<Hash256> = [b"tx1", b"tx2", b"tx3"].iter().map(|d| sha256(*d)).collect();
        let expected = hash_pair(&hash_pair(&h[0], &h[1]), &hash_pair(&h[2], &h[2]));
        assert_eq!(merkle_root(&h), expected);
    }

    #[test]
    fn test_order_matters() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn test_proofs_verify_for_every_leaf() {
        let hashes: Vec<Hash256> = (0u8..5).map(|i| sha256(&[i])).collect();
        let root = merkle_root(&hashes);

        for (i, leaf) in hashes.iter().enumerate() {
            let proof = MerkleProof::build(&hashes, i).unwrap();
            assert!(proof.verify(leaf, &root), "leaf {} failed", i);
            assert!(!proof.verify(&sha256(b"other"), &root));
        }
        assert!(MerkleProof::build(&hashes, 5).is_none());
    }

    #[test]
    fn test_empty_merkle_root() {
        assert_eq!(merkle_root(&[]), Hash256::zero());
    }
}
