//! Merkle-деревья payload'ов
//!
//! Each PoH entry commits to the payloads submitted during its tick through
//! `payload_digest`, the root of a binary tree over the payload hashes in
//! submission order. Clients holding only the entry can check that their
//! payload was sequenced at that tick with a [`MerkleProof`].
//!
//! An empty payload set has the all-zero root. A lone node at the end of a
//! level is promoted unchanged.

use crate::types::{Hash, ZERO_HASH};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximum proof depth (2^32 payloads per tick is far beyond any queue bound)
pub const MAX_PROOF_DEPTH: usize = 32;

pub const LEAF_PREFIX: &[u8] = b"PULSECHAIN_PAYLOAD_LEAF_V1:";
pub const NODE_PREFIX: &[u8] = b"PULSECHAIN_PAYLOAD_NODE_V1:";

/// Inclusion proof for one payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub siblings: Vec<Hash>,
    /// true = sibling on the right
    pub directions: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] = leaves, last = [root]
    levels: Vec<Vec<Hash>>,
    leaf_count: usize,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

/// Hash of a raw payload as it is committed into a tick
pub fn payload_hash(payload: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(LEAF_PREFIX);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Root over payload hashes; zero when there are none
pub fn payload_root(hashes: &[Hash]) -> Hash {
    MerkleTree::new(hashes.to_vec()).root()
}

impl MerkleTree {
    pub fn new(leaves: Vec<Hash>) -> Self {
        let leaf_count = leaves.len();
        let mut levels = vec![leaves];
        while levels.last().is_some_and(|l| l.len() > 1) {
            let next = levels.last().map(|l| next_level(l)).unwrap_or_default();
            levels.push(next);
        }
        Self { levels, leaf_count }
    }

    pub fn root(&self) -> Hash {
        if self.leaf_count == 0 {
            return ZERO_HASH;
        }
        self.levels.last().and_then(|l| l.first()).copied().unwrap_or(ZERO_HASH)
    }

    pub fn len(&self) -> usize {
        self.leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.leaf_count {
            return None;
        }

        let mut siblings = Vec::new();
        let mut directions = Vec::new();
        let mut idx = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            if sibling < level.len() {
                siblings.push(level[sibling]);
                directions.push(idx % 2 == 0);
            }
            idx /= 2;
        }

        Some(MerkleProof { leaf_index: leaf_index as u64, siblings, directions })
    }

    pub fn proof_by_hash(&self, leaf: &Hash) -> Option<MerkleProof> {
        let index = self.levels[0].iter().position(|h| h == leaf)?;
        self.proof(index)
    }
}

impl MerkleProof {
    pub fn verify(&self, leaf: Hash, root: Hash) -> bool {
        if self.siblings.len() != self.directions.len() || self.siblings.len() > MAX_PROOF_DEPTH {
            return false;
        }

        let mut current = leaf;
        for (sibling, &right) in self.siblings.iter().zip(&self.directions) {
            current = if right {
                hash_pair(&current, sibling)
            } else {
                hash_pair(sibling, &current)
            };
        }
        current == root
    }
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| match (pair.first(), pair.get(1)) {
            (Some(l), Some(r)) => hash_pair(l, r),
            // odd node carried up unchanged
            (Some(single), None) => *single,
            (None, _) => ZERO_HASH,
        })
        .collect()
}

/// Ordered: payload order within a tick is part of the commitment
fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(NODE_PREFIX);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| payload_hash(format!("tx-{i}").as_bytes())).collect()
    }

    #[test]
    fn test_empty_root_is_zero() {
        assert_eq!(payload_root(&[]), ZERO_HASH);
        assert!(MerkleTree::new(vec![]).proof(0).is_none());
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(1);
        let tree = MerkleTree::new(l.clone());
        assert_eq!(tree.root(), l[0]);
        let proof = tree.proof(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(proof.verify(l[0], tree.root()));
    }

    #[test]
    fn test_all_proofs_verify() {
        for n in [2, 3, 4, 5, 7, 8, 13] {
            let l = leaves(n);
            let tree = MerkleTree::new(l.clone());
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(proof.verify(*leaf, tree.root()), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn test_order_matters() {
        let l = leaves(2);
        let swapped = vec![l[1], l[0]];
        assert_ne!(payload_root(&l), payload_root(&swapped));
    }

    #[test]
    fn test_wrong_leaf_or_sibling_fails() {
        let l = leaves(4);
        let tree = MerkleTree::new(l.clone());
        let mut proof = tree.proof(2).unwrap();
        assert!(!proof.verify(payload_hash(b"other"), tree.root()));
        proof.siblings[0] = payload_hash(b"forged");
        assert!(!proof.verify(l[2], tree.root()));
    }

    #[test]
    fn test_proof_by_hash() {
        let l = leaves(3);
        let tree = MerkleTree::new(l.clone());
        let proof = tree.proof_by_hash(&l[1]).unwrap();
        assert_eq!(proof.leaf_index, 1);
        assert!(proof.verify(l[1], tree.root()));
    }
}
