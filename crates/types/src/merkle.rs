//! Simple merkle trees over byte leaves.
//!
//! Used to commit to the chunks of a block (the part-set root) so that
//! individual parts can be verified against the header before the full block
//! is available. Leaf and inner nodes are domain-separated to prevent
//! second-preimage attacks.

use crate::Hash;
use sbor::prelude::BasicSbor;
use sha2::{Digest, Sha256};

const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;

fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash::from_hash_bytes(out)
}

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash::from_hash_bytes(out)
}

/// Largest power of two strictly less than `n`. Split point of the tree.
fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut p = 1;
    while p * 2 < n {
        p *= 2;
    }
    p
}

/// Compute the merkle root of a sequence of byte leaves.
///
/// The empty sequence hashes to [`Hash::ZERO`].
pub fn merkle_root(leaves: &[impl AsRef<[u8]>]) -> Hash {
    match leaves.len() {
        0 => Hash::ZERO,
        1 => leaf_hash(leaves[0].as_ref()),
        n => {
            let split = split_point(n);
            let left = merkle_root(&leaves[..split]);
            let right = merkle_root(&leaves[split..]);
            inner_hash(&left, &right)
        }
    }
}

/// An inclusion proof for one leaf of a merkle tree.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct MerkleProof {
    /// Total number of leaves in the tree.
    pub total: u32,
    /// Index of the proven leaf.
    pub index: u32,
    /// Hash of the proven leaf.
    pub leaf_hash: Hash,
    /// Sibling hashes from the leaf up to (but excluding) the root.
    pub aunts: Vec<Hash>,
}

impl MerkleProof {
    /// Verify this proof against a known root and the leaf bytes.
    pub fn verify(&self, root: &Hash, leaf: &[u8]) -> bool {
        if self.leaf_hash != leaf_hash(leaf) {
            return false;
        }
        match self.compute_root(self.total as usize, self.index as usize, &self.aunts) {
            Some(computed) => computed == *root,
            None => false,
        }
    }

    fn compute_root(&self, total: usize, index: usize, aunts: &[Hash]) -> Option<Hash> {
        if index >= total || total == 0 {
            return None;
        }
        match total {
            1 => {
                if aunts.is_empty() {
                    Some(self.leaf_hash)
                } else {
                    None
                }
            }
            _ => {
                let (last, rest) = aunts.split_last()?;
                let split = split_point(total);
                if index < split {
                    let left = self.compute_root(split, index, rest)?;
                    Some(inner_hash(&left, last))
                } else {
                    let right = self.compute_root(total - split, index - split, rest)?;
                    Some(inner_hash(last, &right))
                }
            }
        }
    }
}

/// Compute the merkle root and an inclusion proof for every leaf.
pub fn merkle_proofs(leaves: &[impl AsRef<[u8]>]) -> (Hash, Vec<MerkleProof>) {
    let leaf_hashes: Vec<Hash> = leaves.iter().map(|l| leaf_hash(l.as_ref())).collect();
    let total = leaf_hashes.len();
    if total == 0 {
        return (Hash::ZERO, Vec::new());
    }
    let mut proofs: Vec<MerkleProof> = leaf_hashes
        .iter()
        .enumerate()
        .map(|(i, lh)| MerkleProof {
            total: total as u32,
            index: i as u32,
            leaf_hash: *lh,
            aunts: Vec::new(),
        })
        .collect();
    let root = build(&leaf_hashes, 0, &mut proofs);
    (root, proofs)
}

/// Recursively build the tree, appending sibling hashes to each proof on the
/// way back up. `offset` is the absolute index of the first leaf in `hashes`.
fn build(hashes: &[Hash], offset: usize, proofs: &mut [MerkleProof]) -> Hash {
    match hashes.len() {
        1 => hashes[0],
        n => {
            let split = split_point(n);
            let left = build(&hashes[..split], offset, proofs);
            let right = build(&hashes[split..], offset + split, proofs);
            for proof in proofs[offset..offset + split].iter_mut() {
                proof.aunts.push(right);
            }
            for proof in proofs[offset + split..offset + n].iter_mut() {
                proof.aunts.push(left);
            }
            inner_hash(&left, &right)
        }
    }
}
