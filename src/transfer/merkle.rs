//! BLAKE2b Merkle tree with index-parity proof folding (4.6.2).
//!
//! Leaf = BLAKE2b-256(chunk), internal = BLAKE2b-256(left||right). An odd
//! trailing node at a level is paired with itself. A proof for index i at
//! each level takes the sibling at `i XOR 1` (self if absent) and halves i;
//! verification folds the leaf through the proof the same way, choosing
//! `H(current||sibling)` when the current index is even and
//! `H(sibling||current)` when odd.

use blake2::{Blake2b, Digest};
use blake2::digest::consts::U32;
use serde::{Deserialize, Serialize};

type Blake2b256 = Blake2b<U32>;

pub type Hash = [u8; 32];

pub(crate) fn hash_leaf(bytes: &[u8]) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn hash_internal(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Pair off a level into parent hashes; an odd trailing node self-pairs.
fn fold_level(level: &[Hash]) -> Vec<Hash> {
    let mut next = Vec::with_capacity(level.len().div_ceil(2));
    let mut i = 0;
    while i < level.len() {
        let left = level[i];
        let right = if i + 1 < level.len() { level[i + 1] } else { level[i] };
        next.push(hash_internal(&left, &right));
        i += 2;
    }
    next
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    pub index: usize,
    pub leaf_hash: Hash,
    pub siblings: Vec<Hash>,
}

impl MerkleProof {
    /// Fold `leaf_hash` up through `siblings`, choosing left/right by the
    /// parity of the current index at each level, and compare to `root`.
    pub fn verify(&self, root: &Hash) -> bool {
        let mut current = self.leaf_hash;
        let mut index = self.index;
        for sibling in &self.siblings {
            current = if index % 2 == 0 { hash_internal(&current, sibling) } else { hash_internal(sibling, &current) };
            index /= 2;
        }
        &current == root
    }
}

/// A tree built from an ordered list of leaf hashes. The root is recomputed
/// lazily on first query after construction or append.
pub struct MerkleTree {
    leaves: Vec<Hash>,
    levels: Vec<Vec<Hash>>,
    dirty: bool,
}

impl MerkleTree {
    pub fn from_chunks(chunks: &[impl AsRef<[u8]>]) -> Self {
        let leaves: Vec<Hash> = chunks.iter().map(|c| hash_leaf(c.as_ref())).collect();
        Self::from_leaf_hashes(leaves)
    }

    pub fn from_leaf_hashes(leaves: Vec<Hash>) -> Self {
        let mut tree = Self { leaves, levels: Vec::new(), dirty: true };
        tree.rebuild();
        tree
    }

    pub fn append(&mut self, chunk: impl AsRef<[u8]>) {
        self.leaves.push(hash_leaf(chunk.as_ref()));
        self.dirty = true;
    }

    fn rebuild(&mut self) {
        if !self.dirty {
            return;
        }
        let mut levels = vec![self.leaves.clone()];
        while levels.last().map(|l| l.len()).unwrap_or(0) > 1 {
            let next = fold_level(levels.last().unwrap());
            levels.push(next);
        }
        self.levels = levels;
        self.dirty = false;
    }

    pub fn root(&mut self) -> Option<Hash> {
        self.rebuild();
        self.levels.last().and_then(|top| top.first()).copied()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Generate an inclusion proof for `index`. The sibling at each level is
    /// the node at `i XOR 1` within that level, or the node itself when that
    /// position does not exist (self-pair rule).
    pub fn proof(&mut self, index: usize) -> Option<MerkleProof> {
        self.rebuild();
        if index >= self.leaves.len() {
            return None;
        }
        let mut siblings = Vec::new();
        let mut i = index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_index = i ^ 1;
            let sibling = level.get(sibling_index).copied().unwrap_or(level[i]);
            siblings.push(sibling);
            i /= 2;
        }
        Some(MerkleProof { index, leaf_hash: self.leaves[index], siblings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_1_root_is_order_sensitive() {
        let mut a = MerkleTree::from_chunks(&["a", "b", "c"]);
        let mut b = MerkleTree::from_chunks(&["c", "b", "a"]);
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn property_2_every_index_proof_verifies_only_against_its_root() {
        let mut tree = MerkleTree::from_chunks(&["a", "b", "c", "d", "e"]);
        let root = tree.root().unwrap();
        for i in 0..tree.leaf_count() {
            let proof = tree.proof(i).unwrap();
            assert!(proof.verify(&root));
        }
        let mut other = MerkleTree::from_chunks(&["x", "y"]);
        let other_root = other.root().unwrap();
        let proof0 = tree.proof(0).unwrap();
        assert!(!proof0.verify(&other_root));
    }

    #[test]
    fn property_3_tampered_proof_byte_fails() {
        let mut tree = MerkleTree::from_chunks(&["a", "b", "c"]);
        let root = tree.root().unwrap();
        let mut proof = tree.proof(1).unwrap();
        proof.siblings[0][0] ^= 0xFF;
        assert!(!proof.verify(&root));
    }

    #[test]
    fn s2_odd_count_self_pair_rule() {
        let mut tree = MerkleTree::from_chunks(&["a", "b", "c"]);
        let root = tree.root().unwrap();
        let proof = tree.proof(2).unwrap();

        let leaf_c = hash_leaf(b"c");
        let leaf_a = hash_leaf(b"a");
        let leaf_b = hash_leaf(b"b");

        assert_eq!(proof.leaf_hash, leaf_c);
        assert_eq!(proof.siblings[0], leaf_c, "odd trailing leaf self-pairs");
        assert_eq!(proof.siblings[1], hash_internal(&leaf_a, &leaf_b));
        assert!(proof.verify(&root));
    }

    #[test]
    fn single_leaf_tree_has_empty_proof_and_root_equals_leaf() {
        let mut tree = MerkleTree::from_chunks(&["solo"]);
        let root = tree.root().unwrap();
        assert_eq!(root, hash_leaf(b"solo"));
        let proof = tree.proof(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(proof.verify(&root));
    }
}
