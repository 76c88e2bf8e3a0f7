//! Chain registry entries and fork file naming.

use std::path::{Path, PathBuf};

use corvid_consensus::{hash_from_hex, hash_to_hex, Hash256};

pub const MAIN_FILE_NAME: &str = "blockchain_headers";
pub const FORKS_DIR_NAME: &str = "forks";
const FORK_PREFIX: &str = "fork2_";

/// One chain in the registry. Chains are keyed by their forkpoint hash;
/// the root chain (the best chain) is keyed by the genesis hash and has
/// neither parent nor prev hash.
#[derive(Clone, Debug)]
pub struct ChainEntry {
    /// Height of the first header in this chain's file.
    pub forkpoint: u32,
    /// Hash of the header at the forkpoint; doubles as registry key.
    pub forkpoint_hash: Hash256,
    /// Hash of the block immediately before the forkpoint.
    pub prev_hash: Option<Hash256>,
    /// Registry key of the parent chain.
    pub parent: Option<Hash256>,
    /// Number of records in this chain's file.
    pub size: u32,
}

impl ChainEntry {
    /// Height of this chain's tip. `-1` for an empty root chain.
    pub fn height(&self) -> i64 {
        i64::from(self.forkpoint) + i64::from(self.size) - 1
    }

    /// The header at `height` belongs to this chain's own file (as
    /// opposed to an ancestor's).
    pub fn contains_own(&self, height: u32) -> bool {
        height >= self.forkpoint && i64::from(height) <= self.height()
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        match (&self.prev_hash, &self.parent) {
            (Some(prev), Some(_)) => dir
                .join(FORKS_DIR_NAME)
                .join(fork_file_name(self.forkpoint, prev, &self.forkpoint_hash)),
            _ => dir.join(MAIN_FILE_NAME),
        }
    }
}

pub fn fork_file_name(forkpoint: u32, prev_hash: &Hash256, first_hash: &Hash256) -> String {
    let prev = stripped_hex(prev_hash);
    let first = stripped_hex(first_hash);
    format!("{FORK_PREFIX}{forkpoint}_{prev}_{first}")
}

fn stripped_hex(hash: &Hash256) -> String {
    let hex = hash_to_hex(hash);
    let stripped = hex.trim_start_matches('0');
    if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

/// Parse a fork file name back into `(forkpoint, prev_hash,
/// first_hash)`. Returns `None` for files that are not fork files.
pub fn parse_fork_file_name(name: &str) -> Option<(u32, Hash256, Hash256)> {
    if !name.starts_with(FORK_PREFIX) || name.contains('.') {
        return None;
    }
    let mut parts = name.split('_');
    parts.next()?; // prefix
    let forkpoint: u32 = parts.next()?.parse().ok()?;
    let prev = padded_hash(parts.next()?)?;
    let first = padded_hash(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((forkpoint, prev, first))
}

fn padded_hash(stripped: &str) -> Option<Hash256> {
    if stripped.len() > 64 {
        return None;
    }
    let padded = format!("{stripped:0>64}");
    hash_from_hex(&padded).ok()
}
