//! Proof verification with Reed-Solomon-assisted recovery (4.6.3).
//!
//! Pairs a standard inclusion proof with an optional [`EccBlock`] built over
//! the same chunk. The common case never touches the ECC path: a chunk whose
//! bytes hash to the proof's leaf is accepted the ordinary way. Only when
//! that check fails and a block is attached do we RS-decode, recompute the
//! leaf hash from the recovered bytes, and re-verify the proof against it.

use serde::{Deserialize, Serialize};

use crate::transfer::ecc::EccBlock;
use crate::transfer::merkle::{hash_leaf, Hash, MerkleProof};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedMerkleProof {
    pub proof: MerkleProof,
    pub ecc_block: Option<EccBlock>,
}

impl EnhancedMerkleProof {
    pub fn new(proof: MerkleProof, ecc_block: Option<EccBlock>) -> Self {
        Self { proof, ecc_block }
    }

    /// Verify `received` against `root`, falling back to ECC recovery on a
    /// standard verification failure. `received` is the wire payload: the
    /// plain chunk when no ECC block is attached, or the RS-encoded
    /// codeword (data + parity) when one is. Returns `(verified,
    /// canonical_bytes)`: when an ECC block is attached and verification
    /// succeeds, `canonical_bytes` is always `Some` with the original chunk
    /// bytes (RS-decoded and, if necessary, error-corrected); with no block
    /// attached it is `None` and the caller should use `received` as-is.
    pub fn verify_with_recovery(&self, received: &[u8], root: &Hash) -> (bool, Option<Vec<u8>>) {
        let Some(ecc_block) = &self.ecc_block else {
            let ok = hash_leaf(received) == self.proof.leaf_hash && self.proof.verify(root);
            return (ok, None);
        };

        let original_len = ecc_block.original.len();
        if received.len() >= original_len {
            let candidate = &received[..original_len];
            if hash_leaf(candidate) == self.proof.leaf_hash && self.proof.verify(root) {
                return (true, Some(candidate.to_vec()));
            }
        }

        let Ok(recovered) = ecc_block.recover(received) else {
            return (false, None);
        };
        let recovered_proof = MerkleProof {
            index: self.proof.index,
            leaf_hash: hash_leaf(&recovered),
            siblings: self.proof.siblings.clone(),
        };
        if recovered_proof.verify(root) {
            (true, Some(recovered))
        } else {
            (false, None)
        }
    }
}
