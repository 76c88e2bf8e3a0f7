//! Hash primitives, including the per-era proof-of-work digests.

use blake2b_simd::Params as Blake2bParams;
use corvid_consensus::Hash256;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Second-era header digest.
pub fn keccak256d(data: &[u8]) -> Hash256 {
    let first = Keccak256::digest(data);
    let second = Keccak256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Third-era header digest. The miner commits to the truncated header
/// through a seed hash, then folds in the mix hash and the 64-bit nonce.
/// Seed and mix are absorbed big-endian-first, matching the display
/// order of block hashes.
pub fn mix_digest(seed: &Hash256, mix_hash: &Hash256, nonce64: u64) -> Hash256 {
    let mut seed_be = *seed;
    seed_be.reverse();
    let mut mix_be = *mix_hash;
    mix_be.reverse();

    let digest = Blake2bParams::new()
        .hash_length(32)
        .to_state()
        .update(&seed_be)
        .update(&mix_be)
        .update(&nonce64.to_le_bytes())
        .finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_known_vector() {
        // double-sha256 of the empty string
        let digest = sha256d(b"");
        assert_eq!(
            hex::encode(digest),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn mix_digest_depends_on_every_input() {
        let seed = [0x11u8; 32];
        let mix = [0x22u8; 32];
        let base = mix_digest(&seed, &mix, 7);
        assert_ne!(base, mix_digest(&seed, &mix, 8));
        assert_ne!(base, mix_digest(&[0x12u8; 32], &mix, 7));
        assert_ne!(base, mix_digest(&seed, &[0x23u8; 32], 7));
    }
}
