use corvid_consensus::ChainParams;
use corvid_primitives::header::Header;
use primitive_types::U256;

use crate::difficulty::{hash_meets_target, u256_to_compact, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    BadBits { expected: u32, got: u32 },
    HashAboveTarget,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::BadBits { expected, got } => {
                write!(f, "bits mismatch: expected {expected:#010x}, got {got:#010x}")
            }
            PowError::HashAboveTarget => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Check that a header claims exactly the expected target and that its
/// era digest actually meets it. Skipped wholesale on testnet, where
/// targets are not enforced.
pub fn validate_header_pow(
    header: &Header,
    expected_target: U256,
    params: &ChainParams,
) -> Result<(), PowError> {
    if params.is_testnet() {
        return Ok(());
    }

    let expected_bits = u256_to_compact(expected_target);
    if header.bits != expected_bits {
        return Err(PowError::BadBits {
            expected: expected_bits,
            got: header.bits,
        });
    }

    let hash = header.hash(params);
    if !hash_meets_target(&hash, &expected_target) {
        return Err(PowError::HashAboveTarget);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_consensus::{chain_params, Network};
    use corvid_primitives::header::Nonce;

    fn mine(mut header: Header, target: U256, params: &ChainParams) -> Header {
        loop {
            if hash_meets_target(&header.hash(params), &target) {
                return header;
            }
            match &mut header.nonce {
                Nonce::Legacy(nonce) => *nonce += 1,
                Nonce::Extended { nonce64, .. } => *nonce64 += 1,
            }
        }
    }

    #[test]
    fn mined_regtest_header_validates() {
        let params = chain_params(Network::Regtest);
        let target = params.max_target;
        let header = mine(
            Header {
                version: 4,
                prev_block: [0x11; 32],
                merkle_root: [0x22; 32],
                time: 1_000,
                bits: u256_to_compact(target),
                nonce: Nonce::Legacy(0),
            },
            target,
            &params,
        );
        assert_eq!(validate_header_pow(&header, target, &params), Ok(()));
    }

    #[test]
    fn wrong_bits_rejected() {
        let params = chain_params(Network::Regtest);
        let target = params.max_target;
        let header = Header {
            version: 4,
            prev_block: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1_000,
            bits: 0x1d00_ffff,
            nonce: Nonce::Legacy(0),
        };
        assert!(matches!(
            validate_header_pow(&header, target, &params),
            Err(PowError::BadBits { .. })
        ));
    }

    #[test]
    fn weak_hash_rejected() {
        let params = chain_params(Network::Regtest);
        // impossibly hard target: only an all-zero digest could meet it
        let target = U256::zero();
        let header = Header {
            version: 4,
            prev_block: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1_000,
            bits: u256_to_compact(target),
            nonce: Nonce::Legacy(0),
        };
        assert_eq!(
            validate_header_pow(&header, target, &params),
            Err(PowError::HashAboveTarget)
        );
    }

    #[test]
    fn testnet_skips_enforcement() {
        let params = chain_params(Network::Testnet);
        let header = Header {
            version: 4,
            prev_block: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1_000,
            bits: 0,
            nonce: Nonce::Legacy(0),
        };
        assert_eq!(validate_header_pow(&header, U256::zero(), &params), Ok(()));
    }
}
