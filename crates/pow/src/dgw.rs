//! Dark Gravity Wave v3 retargeting.
//!
//! Every block retargets from the trailing 180-block window: the
//! window's running average target is scaled by the ratio of observed
//! to intended timespan, with the observed span clamped to one third
//! and three times the intended one.

use corvid_consensus::constants::{DGW_PAST_BLOCKS, TARGET_SPACING_SECS};
use corvid_consensus::ChainParams;
use primitive_types::U256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub bits: u32,
    pub time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    MissingHeader(u32),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::MissingHeader(height) => {
                write!(f, "missing header at height {height} in retarget window")
            }
        }
    }
}

impl std::error::Error for DifficultyError {}

/// Target for the block at `height`, derived from the headers below it.
/// `read` must return the stored `(bits, time)` of a header by height.
pub fn dgw_next_target<F>(
    height: u32,
    read: F,
    params: &ChainParams,
) -> Result<U256, DifficultyError>
where
    F: Fn(u32) -> Option<HeaderInfo>,
{
    if height <= DGW_PAST_BLOCKS {
        return Ok(params.max_target);
    }

    let mut average = U256::zero();
    let mut actual_timespan: i64 = 0;
    let mut last_time: Option<u32> = None;

    // walk backwards from the parent through the whole window, keeping
    // a running average of the decoded targets
    for count in 1..=DGW_PAST_BLOCKS {
        let reading_height = height - count;
        let info = read(reading_height).ok_or(DifficultyError::MissingHeader(reading_height))?;

        let target = legacy_compact(info.bits);
        average = if count == 1 {
            target
        } else {
            (average * U256::from(count) + target) / U256::from(count + 1)
        };

        if let Some(last) = last_time {
            actual_timespan += i64::from(last) - i64::from(info.time);
        }
        last_time = Some(info.time);
    }

    let target_timespan = i64::from(DGW_PAST_BLOCKS) * TARGET_SPACING_SECS as i64;
    actual_timespan = actual_timespan.clamp(target_timespan / 3, target_timespan * 3);

    let mut next = average * U256::from(actual_timespan as u64) / U256::from(target_timespan as u64);
    if next > params.max_target {
        next = params.max_target;
    }
    Ok(next)
}

/// Historic compact decode used by the retarget math. Unlike the strict
/// decoder it keeps the high mantissa byte and normalizes mantissas
/// below 0x8000 by one byte, matching the node's original arithmetic.
fn legacy_compact(bits: u32) -> U256 {
    let size = bits >> 24;
    let mut word = u64::from(bits & 0x00ff_ffff);
    if word < 0x8000 {
        word <<= 8;
    }
    if size >= 3 {
        U256::from(word) << (8 * (size - 3))
    } else {
        U256::from(word) >> (8 * (3 - size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_consensus::{chain_params, Network};

    const BITS: u32 = 0x1e0f_ffff;

    fn window(spacing: u32) -> impl Fn(u32) -> Option<HeaderInfo> {
        move |height| {
            Some(HeaderInfo {
                bits: BITS,
                time: 1_000_000 + height * spacing,
            })
        }
    }

    #[test]
    fn short_history_uses_max_target() {
        let params = chain_params(Network::Mainnet);
        let target = dgw_next_target(DGW_PAST_BLOCKS, |_| None, &params).unwrap();
        assert_eq!(target, params.max_target);
    }

    #[test]
    fn missing_window_header_is_an_error() {
        let params = chain_params(Network::Mainnet);
        let result = dgw_next_target(1_000, |height| {
            if height == 990 {
                None
            } else {
                window(60)(height)
            }
        }, &params);
        assert_eq!(result, Err(DifficultyError::MissingHeader(990)));
    }

    #[test]
    fn perfect_spacing_scales_by_the_observed_intervals() {
        let params = chain_params(Network::Mainnet);
        let target = dgw_next_target(1_000, window(60), &params).unwrap();
        // the window spans 179 inter-header intervals against a
        // 180-block nominal timespan
        let expected = legacy_compact(BITS) * U256::from(DGW_PAST_BLOCKS - 1)
            / U256::from(DGW_PAST_BLOCKS);
        assert_eq!(target, expected);
    }

    #[test]
    fn slow_blocks_raise_the_target() {
        let params = chain_params(Network::Mainnet);
        let stable = dgw_next_target(1_000, window(60), &params).unwrap();
        let slow = dgw_next_target(1_000, window(120), &params).unwrap();
        assert!(slow > stable);
    }

    #[test]
    fn fast_blocks_lower_the_target() {
        let params = chain_params(Network::Mainnet);
        let stable = dgw_next_target(1_000, window(60), &params).unwrap();
        let fast = dgw_next_target(1_000, window(30), &params).unwrap();
        assert!(fast < stable);
    }

    #[test]
    fn timespan_clamp_bounds_the_swing() {
        let params = chain_params(Network::Mainnet);
        let average = legacy_compact(BITS);
        // far beyond 3x spacing clamps to exactly 3x the window average
        let crawl = dgw_next_target(1_000, window(6_000), &params).unwrap();
        assert_eq!(crawl, average * 3u32);
        // near-zero spacing clamps to exactly 1/3
        let burst = dgw_next_target(1_000, window(0), &params).unwrap();
        assert_eq!(burst, average / 3u32);
    }

    #[test]
    fn result_never_exceeds_max_target() {
        let mut params = chain_params(Network::Mainnet);
        params.max_target = legacy_compact(BITS);
        let slow = dgw_next_target(1_000, window(6_000), &params).unwrap();
        assert_eq!(slow, params.max_target);
    }
}
