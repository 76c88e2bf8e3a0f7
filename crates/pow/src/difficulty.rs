//! Compact target encoding and cumulative chainwork arithmetic.

use corvid_consensus::Hash256;
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

/// Decode a compact `bits` field into a full 256-bit target. Rejects
/// the sign bit and mantissa/exponent combinations that would not fit
/// in 256 bits.
pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

/// Work contributed by one block at the given target:
/// `floor(2^256 / (target + 1))`, computed without 512-bit arithmetic
/// as `(!target / (target + 1)) + 1`.
pub fn target_to_work(target: U256) -> U256 {
    if target.is_zero() {
        return U256::zero();
    }
    let one = U256::from(1u64);
    (!target / (target + one)) + one
}

pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    Ok(target_to_work(compact_to_u256(bits)?))
}

/// Hash digests are stored little-endian; compare them against a
/// target numerically.
pub fn hash_meets_target(hash: &Hash256, target: &U256) -> bool {
    U256::from_little_endian(hash) <= *target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        for bits in [0x1d00_ffffu32, 0x1b04_86e7, 0x207f_ffff, 0x1e0f_ffff] {
            let target = compact_to_u256(bits).expect("target");
            assert_eq!(u256_to_compact(target), bits);
        }
    }

    #[test]
    fn sign_bit_rejected() {
        assert_eq!(compact_to_u256(0x1d80_0001), Err(CompactError::Negative));
    }

    #[test]
    fn overflow_rejected() {
        assert_eq!(compact_to_u256(0x2300_ffff), Err(CompactError::Overflow));
        // size 34 with a two-byte mantissa shifts past bit 255
        assert_eq!(compact_to_u256(0x2200_ffff), Err(CompactError::Overflow));
        // but a one-byte mantissa at size 34 still fits
        assert!(compact_to_u256(0x2200_00ff).is_ok());
    }

    #[test]
    fn zero_mantissa_is_zero_target() {
        assert_eq!(compact_to_u256(0x1d00_0000), Ok(U256::zero()));
        assert_eq!(u256_to_compact(U256::zero()), 0);
    }

    #[test]
    fn harder_target_means_more_work() {
        let easy = block_proof(0x207f_ffff).unwrap();
        let hard = block_proof(0x1d00_ffff).unwrap();
        assert!(hard > easy);
        assert!(easy >= U256::one());
    }

    #[test]
    fn hash_target_comparison_is_numeric() {
        let target = compact_to_u256(0x1d00_ffff).unwrap();
        let below = target.to_little_endian();
        assert!(hash_meets_target(&below, &target));
        assert!(!hash_meets_target(&[0xff; 32], &target));
    }
}
