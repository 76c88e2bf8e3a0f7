//! Per-network chain parameters.

use primitive_types::U256;

use crate::constants::{DGW_PAST_BLOCKS, RETARGET_WINDOW};
use crate::{hash_from_hex, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// Everything the consensus-following core needs to know about one
/// network. The two checkpoint tables are immutable once constructed:
/// `checkpoints` covers the fixed-difficulty early history (one entry
/// per retarget window), `dgw_checkpoints` brackets each later window
/// with its first and last `(hash, target)` pair.
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub genesis_hash: Hash256,
    /// Headers timestamped at or after this use the second hashing era.
    pub keccak_activation_time: u32,
    /// Headers timestamped at or after this use the mix-hash era and the
    /// extended 120-byte layout.
    pub mix_activation_time: u32,
    /// First height at which extended headers appear on the wire.
    pub mix_activation_height: u32,
    /// First height retargeted by Dark Gravity Wave instead of the
    /// legacy fixed windows.
    pub dgw_activation_height: u32,
    pub max_target: U256,
    /// Difficulty was reset for one DGW window when the mix era went
    /// live; targets inside that band are fixed to this value.
    pub mix_reset_target: U256,
    /// Maturity margin for the metadata anti-downgrade guard.
    pub mature_depth: u32,
    pub checkpoints: Vec<(Hash256, U256)>,
    pub dgw_checkpoints: Vec<[(Hash256, U256); 2]>,
    pub dgw_checkpoints_start: u32,
    pub dgw_checkpoint_spacing: u32,
}

impl ChainParams {
    /// Targets are neither computed nor enforced on testnet.
    pub fn is_testnet(&self) -> bool {
        self.network == Network::Testnet
    }

    /// Highest height covered by the DGW checkpoint table, or zero when
    /// the table is empty.
    pub fn max_dgw_checkpoint(&self) -> u32 {
        if self.dgw_checkpoints.is_empty() {
            return 0;
        }
        self.dgw_checkpoints_start
            + self.dgw_checkpoints.len() as u32 * self.dgw_checkpoint_spacing
            - 1
    }

    /// No chain may fork at or below this height (consensus-safety
    /// floor: one full retarget window above the last trusted
    /// checkpoint).
    pub fn fork_floor(&self) -> u32 {
        if self.dgw_checkpoints.is_empty() {
            return 0;
        }
        self.max_dgw_checkpoint() + self.dgw_checkpoint_spacing
    }

    /// If `height` is the first (0) or last (1) header of a DGW
    /// checkpoint window, return which.
    pub fn dgw_checkpoint_position(&self, height: u32) -> Option<usize> {
        if self.dgw_checkpoints.is_empty() {
            return None;
        }
        if height < self.dgw_checkpoints_start {
            return None;
        }
        if height > self.max_dgw_checkpoint() + self.dgw_checkpoint_spacing {
            return None;
        }
        match height % self.dgw_checkpoint_spacing {
            0 => Some(0),
            m if m == self.dgw_checkpoint_spacing - 1 => Some(1),
            _ => None,
        }
    }

    /// Table index for a height inside the DGW checkpoint region.
    pub fn dgw_checkpoint_index(&self, height: u32) -> usize {
        (height / self.dgw_checkpoint_spacing
            - self.dgw_checkpoints_start / self.dgw_checkpoint_spacing) as usize
    }

    /// The mix-era difficulty-reset band.
    pub fn in_mix_reset_band(&self, height: u32) -> bool {
        self.mix_activation_height != u32::MAX
            && height >= self.mix_activation_height
            && height < self.mix_activation_height + DGW_PAST_BLOCKS
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            genesis_hash: genesis(
                "00000044d33c0c0ba019be5c0249730424a69cb4c222153322f68c6104484806",
            ),
            keccak_activation_time: 1_569_945_600,
            mix_activation_time: 1_588_788_000,
            mix_activation_height: 1_219_736,
            dgw_activation_height: 338_778,
            max_target: U256::MAX >> 20,
            mix_reset_target: U256::MAX >> 40,
            mature_depth: 100,
            // Checkpoint tables are distributed with the wallet data
            // files and loaded at startup; they are not baked in here.
            checkpoints: Vec::new(),
            dgw_checkpoints: Vec::new(),
            dgw_checkpoints_start: 168 * RETARGET_WINDOW,
            dgw_checkpoint_spacing: RETARGET_WINDOW,
        },
        Network::Testnet => ChainParams {
            network,
            genesis_hash: genesis(
                "000000ecfc5e6324a079542221d00e10362bdc894d56500c414060eea8a3ad5a",
            ),
            keccak_activation_time: 1_567_533_600,
            mix_activation_time: 1_585_159_200,
            mix_activation_height: 231_544,
            dgw_activation_height: 1,
            max_target: U256::MAX >> 20,
            mix_reset_target: U256::MAX >> 40,
            mature_depth: 100,
            checkpoints: Vec::new(),
            dgw_checkpoints: Vec::new(),
            dgw_checkpoints_start: 0,
            dgw_checkpoint_spacing: RETARGET_WINDOW,
        },
        Network::Regtest => ChainParams {
            network,
            genesis_hash: genesis(
                "3e343a6ce4f49b4c6f9a67cda32b54f441c2a5edc2e539f3b298b3b89cbf0c14",
            ),
            // everything stays in the first era on regtest
            keccak_activation_time: u32::MAX,
            mix_activation_time: u32::MAX,
            mix_activation_height: u32::MAX,
            dgw_activation_height: 0,
            max_target: U256::from(0x007f_ffff) << 232,
            mix_reset_target: U256::from(0x007f_ffff) << 232,
            mature_depth: 10,
            checkpoints: Vec::new(),
            dgw_checkpoints: Vec::new(),
            dgw_checkpoints_start: 0,
            dgw_checkpoint_spacing: RETARGET_WINDOW,
        },
    }
}

fn genesis(hex: &str) -> Hash256 {
    match hash_from_hex(hex) {
        Ok(hash) => hash,
        Err(_) => unreachable!("genesis constants are valid hex"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZERO_HASH;

    fn params_with_dgw_table(entries: usize) -> ChainParams {
        let mut params = chain_params(Network::Regtest);
        params.dgw_checkpoints_start = 2016;
        params.dgw_checkpoints =
            vec![[(ZERO_HASH, U256::one()), (ZERO_HASH, U256::one())]; entries];
        params
    }

    #[test]
    fn empty_tables_have_no_floor() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(params.max_dgw_checkpoint(), 0);
        assert_eq!(params.fork_floor(), 0);
        assert_eq!(params.dgw_checkpoint_position(5000), None);
    }

    #[test]
    fn dgw_table_bounds() {
        let params = params_with_dgw_table(2);
        assert_eq!(params.max_dgw_checkpoint(), 2016 + 2 * 2016 - 1);
        assert_eq!(params.fork_floor(), 2016 + 3 * 2016 - 1);
    }

    #[test]
    fn dgw_checkpoint_positions() {
        let params = params_with_dgw_table(2);
        assert_eq!(params.dgw_checkpoint_position(2016), Some(0));
        assert_eq!(params.dgw_checkpoint_position(2016 + 2015), Some(1));
        assert_eq!(params.dgw_checkpoint_position(2016 + 1000), None);
        assert_eq!(params.dgw_checkpoint_position(100), None);
        assert_eq!(params.dgw_checkpoint_index(2016), 0);
        assert_eq!(params.dgw_checkpoint_index(2016 * 2), 1);
    }

    #[test]
    fn mix_reset_band() {
        let mut params = chain_params(Network::Mainnet);
        params.mix_activation_height = 1000;
        assert!(params.in_mix_reset_band(1000));
        assert!(params.in_mix_reset_band(1179));
        assert!(!params.in_mix_reset_band(1180));
        assert!(!params.in_mix_reset_band(999));
    }
}
