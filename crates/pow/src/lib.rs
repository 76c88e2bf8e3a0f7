//! Proof-of-work rules: compact targets, Dark Gravity Wave retargeting
//! and per-era header validation.

pub mod dgw;
pub mod difficulty;
pub mod validation;

pub use dgw::{dgw_next_target, DifficultyError, HeaderInfo};
pub use difficulty::{
    block_proof, compact_to_u256, hash_meets_target, target_to_work, u256_to_compact, CompactError,
};
pub use validation::{validate_header_pow, PowError};
