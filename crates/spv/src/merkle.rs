//! Merkle inclusion proofs.
//!
//! Besides the usual root recomputation, every intermediate node is
//! checked to not itself deserialize as a transaction: a proof whose
//! inner node doubles as a valid 64-byte transaction is the classic
//! leaf-node second-preimage forgery and is rejected outright.

use corvid_consensus::constants::MAX_MERKLE_BRANCH_LEN;
use corvid_consensus::Hash256;
use corvid_primitives::hash::sha256d;
use corvid_primitives::header::Header;
use corvid_primitives::Transaction;

use crate::session::MerkleProof;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    BranchTooLong(usize),
    /// Leftover index bits after consuming the branch: the claimed
    /// position does not fit a tree of this depth.
    PositionOutOfRange,
    InnerNodeIsValidTx,
    RootMismatch,
    MissingHeader(u32),
}

impl std::fmt::Display for MerkleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MerkleError::BranchTooLong(len) => write!(f, "merkle branch too long: {len}"),
            MerkleError::PositionOutOfRange => {
                write!(f, "leaf position too large for merkle branch")
            }
            MerkleError::InnerNodeIsValidTx => {
                write!(f, "inner node of merkle proof is a valid transaction")
            }
            MerkleError::RootMismatch => write!(f, "recomputed merkle root mismatches header"),
            MerkleError::MissingHeader(height) => {
                write!(f, "no local header at height {height}")
            }
        }
    }
}

impl std::error::Error for MerkleError {}

/// Recompute the merkle root from a leaf, its position, and a sibling
/// branch.
pub fn hash_merkle_root(
    branch: &[Hash256],
    txid: &Hash256,
    pos: u32,
) -> Result<Hash256, MerkleError> {
    let mut node = *txid;
    let mut index = pos;
    for sibling in branch {
        let mut inner = [0u8; 64];
        if index & 1 == 1 {
            inner[..32].copy_from_slice(sibling);
            inner[32..].copy_from_slice(&node);
        } else {
            inner[..32].copy_from_slice(&node);
            inner[32..].copy_from_slice(sibling);
        }
        if Transaction::parse(&inner).is_ok() {
            return Err(MerkleError::InnerNodeIsValidTx);
        }
        node = sha256d(&inner);
        index >>= 1;
    }
    if index != 0 {
        return Err(MerkleError::PositionOutOfRange);
    }
    Ok(node)
}

/// Check that `txid` is included under `header`'s merkle root.
pub fn verify_tx_in_block(
    txid: &Hash256,
    proof: &MerkleProof,
    header: &Header,
) -> Result<(), MerkleError> {
    if proof.branch.len() > MAX_MERKLE_BRANCH_LEN {
        return Err(MerkleError::BranchTooLong(proof.branch.len()));
    }
    let root = hash_merkle_root(&proof.branch, txid, proof.pos)?;
    if root != header.merkle_root {
        return Err(MerkleError::RootMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tag: u8) -> Hash256 {
        let mut out = [0u8; 32];
        out[0] = tag;
        sha256d(&out)
    }

    fn parent(left: &Hash256, right: &Hash256) -> Hash256 {
        let mut inner = [0u8; 64];
        inner[..32].copy_from_slice(left);
        inner[32..].copy_from_slice(right);
        sha256d(&inner)
    }

    /// Four-leaf tree, with the branch for each position.
    fn four_leaf_tree() -> (Hash256, Vec<Hash256>, Vec<Vec<Hash256>>) {
        let leaves: Vec<Hash256> = (0..4).map(leaf).collect();
        let ab = parent(&leaves[0], &leaves[1]);
        let cd = parent(&leaves[2], &leaves[3]);
        let root = parent(&ab, &cd);
        let branches = vec![
            vec![leaves[1], cd],
            vec![leaves[0], cd],
            vec![leaves[3], ab],
            vec![leaves[2], ab],
        ];
        (root, leaves, branches)
    }

    #[test]
    fn roots_recompute_for_every_position() {
        let (root, leaves, branches) = four_leaf_tree();
        for pos in 0..4u32 {
            let got = hash_merkle_root(&branches[pos as usize], &leaves[pos as usize], pos).unwrap();
            assert_eq!(got, root);
        }
    }

    #[test]
    fn any_single_bit_mutation_changes_the_root() {
        let (root, leaves, branches) = four_leaf_tree();

        let mut bad_leaf = leaves[2];
        bad_leaf[7] ^= 0x40;
        assert_ne!(hash_merkle_root(&branches[2], &bad_leaf, 2).unwrap(), root);

        let mut bad_branch = branches[2].clone();
        bad_branch[1][0] ^= 0x01;
        assert_ne!(hash_merkle_root(&bad_branch, &leaves[2], 2).unwrap(), root);

        // wrong position flips a concatenation order somewhere
        assert_ne!(hash_merkle_root(&branches[2], &leaves[2], 3).unwrap(), root);
    }

    #[test]
    fn position_beyond_tree_depth_is_rejected() {
        let (_, leaves, branches) = four_leaf_tree();
        assert_eq!(
            hash_merkle_root(&branches[0], &leaves[0], 4),
            Err(MerkleError::PositionOutOfRange)
        );
    }

    #[test]
    fn inner_node_that_parses_as_a_transaction_is_rejected() {
        // craft sibling ‖ leaf so the 64-byte concatenation decodes as
        // a minimal one-in one-out transaction
        let mut forged = [0u8; 64];
        forged[0..4].copy_from_slice(&1i32.to_le_bytes()); // version
        forged[4] = 1; // one input
        forged[41] = 0; // empty script_sig
        // sequence: 42..46
        forged[46] = 1; // one output
        // value: 47..55, script_pubkey len at 55
        forged[55] = 4; // bytes 56..60
        // lock_time: 60..64
        let sibling: Hash256 = forged[..32].try_into().unwrap();
        let node: Hash256 = forged[32..].try_into().unwrap();
        assert!(
            Transaction::parse(&forged).is_ok(),
            "fixture must itself parse as a transaction"
        );

        // position 0: node ‖ sibling order, so put the halves accordingly
        let err = hash_merkle_root(&[node], &sibling, 0).unwrap_err();
        assert_eq!(err, MerkleError::InnerNodeIsValidTx);
    }

    #[test]
    fn branch_length_cap_is_enforced() {
        let (_, leaves, _) = four_leaf_tree();
        let long_branch = vec![[0u8; 32]; MAX_MERKLE_BRANCH_LEN + 1];
        let proof = MerkleProof {
            block_height: 1,
            pos: 0,
            branch: long_branch,
        };
        let header = corvid_primitives::header::Header {
            version: 4,
            prev_block: [0u8; 32],
            merkle_root: leaves[0],
            time: 0,
            bits: 0x207f_ffff,
            nonce: corvid_primitives::header::Nonce::Legacy(0),
        };
        assert_eq!(
            verify_tx_in_block(&leaves[0], &proof, &header),
            Err(MerkleError::BranchTooLong(MAX_MERKLE_BRANCH_LEN + 1))
        );
    }

    #[test]
    fn empty_branch_means_single_tx_block() {
        let txid = leaf(9);
        let header = Header {
            version: 4,
            prev_block: [0u8; 32],
            merkle_root: txid,
            time: 0,
            bits: 0x207f_ffff,
            nonce: corvid_primitives::header::Nonce::Legacy(0),
        };
        let proof = MerkleProof {
            block_height: 1,
            pos: 0,
            branch: vec![],
        };
        assert!(verify_tx_in_block(&txid, &proof, &header).is_ok());
    }
}
