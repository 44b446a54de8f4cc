//! Hash chaining and Merkle tree math.
//!
//! Pure functions over byte strings and canonical JSON values, with no
//! notion of tenants, ledgers, or storage. Mirrors the "mathematically
//! closed, semantically blind" posture the rest of this workspace inherits
//! from its cryptography layer: every function here is deterministic and
//! side-effect free.

#![deny(unsafe_code)]

use ledgercore_atom::canonicalize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from hash/Merkle operations.
#[derive(Error, Debug)]
pub enum HashError {
    /// The payload could not be canonicalized for hashing.
    #[error("failed to canonicalize payload: {0}")]
    Canonicalize(#[from] ledgercore_atom::AtomError),

    /// A Merkle proof index was out of range for the given leaf set.
    #[error("leaf index {index} out of range for {len} leaves")]
    IndexOutOfRange {
        /// requested index
        index: usize,
        /// number of leaves available
        len: usize,
    },
}

/// Result type for hash operations.
pub type Result<T> = std::result::Result<T, HashError>;

/// Sentinel used as `previousHash` for the first event in a tenant's ledger,
/// and as `prevRootHash` for the first Merkle anchor.
pub const GENESIS_SENTINEL: &str = "GENESIS";

/// The root of an empty Merkle tree (no events anchored yet).
pub const GENESIS_ROOT: [u8; 32] = [0u8; 32];

/// `H(bytes) = SHA-256(bytes)`.
pub fn h(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// `H` rendered as 64 lowercase hex characters.
pub fn h_hex(bytes: &[u8]) -> String {
    hex::encode(h(bytes))
}

/// Compute `currentHash` for a ledger event: canonical JSON of `payload`,
/// concatenated with `previousHash` (or [`GENESIS_SENTINEL`]) and the
/// decimal rendering of `seq`, then hashed with [`h`].
pub fn h_event(payload: &Value, previous_hash: &str, seq: u64) -> Result<String> {
    let mut bytes = canonicalize(payload)?;
    bytes.extend_from_slice(previous_hash.as_bytes());
    bytes.extend_from_slice(seq.to_string().as_bytes());
    Ok(h_hex(&bytes))
}

/// Build a Merkle root over ordered leaf hashes.
///
/// Pairwise concatenation in original order, hashed pairwise; an odd leaf
/// at any level is carried up unchanged rather than duplicated. An empty
/// input returns [`GENESIS_ROOT`].
pub fn build_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return GENESIS_ROOT;
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                let mut bytes = Vec::with_capacity(64);
                bytes.extend_from_slice(&pair[0]);
                bytes.extend_from_slice(&pair[1]);
                next.push(h(&bytes));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}

/// One step of a Merkle inclusion proof: the sibling hash at this level,
/// and whether that sibling sits to the left of the node being proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofStep {
    /// Sibling hash at this level.
    pub sibling: [u8; 32],
    /// `true` if the sibling is the left-hand node of the pair.
    pub sibling_is_left: bool,
}

/// Generate an inclusion proof for `leaves[index]`.
pub fn generate_proof(leaves: &[[u8; 32]], index: usize) -> Result<Vec<ProofStep>> {
    if index >= leaves.len() {
        return Err(HashError::IndexOutOfRange {
            index,
            len: leaves.len(),
        });
    }

    let mut proof = Vec::new();
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    let mut pos = index;

    while level.len() > 1 {
        let pair_start = pos - (pos % 2);
        let has_sibling = pair_start + 1 < level.len();

        if has_sibling {
            if pos % 2 == 0 {
                proof.push(ProofStep {
                    sibling: level[pair_start + 1],
                    sibling_is_left: false,
                });
            } else {
                proof.push(ProofStep {
                    sibling: level[pair_start],
                    sibling_is_left: true,
                });
            }
        }
        // odd leaf carried up unchanged: no proof step, position maps through

        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut i = 0;
        while i < level.len() {
            if i + 1 < level.len() {
                let mut bytes = Vec::with_capacity(64);
                bytes.extend_from_slice(&level[i]);
                bytes.extend_from_slice(&level[i + 1]);
                next.push(h(&bytes));
            } else {
                next.push(level[i]);
            }
            i += 2;
        }

        pos /= 2;
        level = next;
    }

    Ok(proof)
}

/// Replay a Merkle inclusion proof and compare against the expected root.
pub fn verify_proof(leaf_hash: [u8; 32], proof: &[ProofStep], expected_root: [u8; 32]) -> bool {
    let mut acc = leaf_hash;
    for step in proof {
        let mut bytes = Vec::with_capacity(64);
        if step.sibling_is_left {
            bytes.extend_from_slice(&step.sibling);
            bytes.extend_from_slice(&acc);
        } else {
            bytes.extend_from_slice(&acc);
            bytes.extend_from_slice(&step.sibling);
        }
        acc = h(&bytes);
    }
    acc == expected_root
}

/// `⌈log2(max(1, n))⌉`, the `treeDepth` convention preserved from the
/// source system (an open question in the spec: `n=1` yields `0`).
pub fn tree_depth(leaf_count: usize) -> u32 {
    let n = leaf_count.max(1);
    if n == 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as u32
    }
}
