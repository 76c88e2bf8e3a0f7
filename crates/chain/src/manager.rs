//! The chain registry: one best chain plus any number of fork chains,
//! each backed by a flat header file.
//!
//! Chains form a tree. The root chain is keyed by the genesis hash and
//! always holds the most-work branch: whenever a fork accumulates more
//! work than its parent, the two trade places on disk, so readers of
//! the root chain always see the consensus branch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use corvid_consensus::constants::{LEGACY_HEADER_SIZE, RETARGET_WINDOW, STALE_TIP_SECS};
use corvid_consensus::{hash_to_hex, ChainParams, Hash256, ZERO_HASH};
use corvid_log::{log_debug, log_info};
use corvid_pow::{
    compact_to_u256, dgw_next_target, target_to_work, validate_header_pow, CompactError,
    DifficultyError, HeaderInfo, PowError,
};
use corvid_primitives::header::{Header, HeaderDecodeError};
use primitive_types::U256;

use crate::chain::{parse_fork_file_name, ChainEntry, FORKS_DIR_NAME};
use crate::headerfile::{HeaderFile, RECORD_SIZE};

#[derive(Debug)]
pub enum ChainError {
    Io(std::io::Error),
    Header(HeaderDecodeError),
    Pow(PowError),
    Compact(CompactError),
    MissingHeader(u32),
    MissingCheckpoint(u32),
    UnknownChain,
    ForkBelowFloor { forkpoint: u32, floor: u32 },
    ForkDoesNotConnect,
    PrevHashMismatch,
    HashMismatch,
    NotAppend { expected: u32, got: u32 },
    BadChunk(&'static str),
    SwapLoop,
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Io(err) => write!(f, "{err}"),
            ChainError::Header(err) => write!(f, "{err}"),
            ChainError::Pow(err) => write!(f, "{err}"),
            ChainError::Compact(err) => write!(f, "{err}"),
            ChainError::MissingHeader(height) => write!(f, "missing header at height {height}"),
            ChainError::MissingCheckpoint(height) => {
                write!(f, "no checkpoint covers height {height}")
            }
            ChainError::UnknownChain => write!(f, "unknown chain id"),
            ChainError::ForkBelowFloor { forkpoint, floor } => {
                write!(f, "cannot fork at {forkpoint}: at or below floor {floor}")
            }
            ChainError::ForkDoesNotConnect => write!(f, "forking header does not connect to parent"),
            ChainError::PrevHashMismatch => write!(f, "prev hash mismatch"),
            ChainError::HashMismatch => write!(f, "header hash mismatches expected hash"),
            ChainError::NotAppend { expected, got } => {
                write!(f, "headers append only: expected height {expected}, got {got}")
            }
            ChainError::BadChunk(reason) => write!(f, "bad chunk: {reason}"),
            ChainError::SwapLoop => write!(f, "chain swap did not converge"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Io(err)
    }
}

impl From<HeaderDecodeError> for ChainError {
    fn from(err: HeaderDecodeError) -> Self {
        ChainError::Header(err)
    }
}

impl From<PowError> for ChainError {
    fn from(err: PowError) -> Self {
        ChainError::Pow(err)
    }
}

impl From<CompactError> for ChainError {
    fn from(err: CompactError) -> Self {
        ChainError::Compact(err)
    }
}

impl From<DifficultyError> for ChainError {
    fn from(err: DifficultyError) -> Self {
        let DifficultyError::MissingHeader(height) = err;
        ChainError::MissingHeader(height)
    }
}

struct ChainState {
    chains: HashMap<Hash256, ChainEntry>,
}

pub struct ChainManager {
    params: ChainParams,
    dir: PathBuf,
    state: Mutex<ChainState>,
    /// Cumulative work up to and including a block, keyed by its hash.
    /// Seeded with the virtual block before genesis.
    work_cache: Mutex<HashMap<Hash256, U256>>,
}

impl ChainManager {
    pub fn open(dir: impl Into<PathBuf>, params: ChainParams) -> Result<Self, ChainError> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(FORKS_DIR_NAME))?;
        let mut work_cache = HashMap::new();
        work_cache.insert(ZERO_HASH, U256::zero());
        let manager = Self {
            params,
            dir,
            state: Mutex::new(ChainState {
                chains: HashMap::new(),
            }),
            work_cache: Mutex::new(work_cache),
        };
        manager.load()?;
        Ok(manager)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Registry key of the best chain. Constant: swaps keep the
    /// most-work branch under the genesis key.
    pub fn best_chain(&self) -> Hash256 {
        self.params.genesis_hash
    }

    pub fn chain_ids(&self) -> Vec<Hash256> {
        self.lock().chains.keys().copied().collect()
    }

    pub fn chain_count(&self) -> usize {
        self.lock().chains.len()
    }

    pub fn height(&self, id: &Hash256) -> Result<i64, ChainError> {
        let state = self.lock();
        Ok(entry(&state, id)?.height())
    }

    pub fn forkpoint(&self, id: &Hash256) -> Result<u32, ChainError> {
        let state = self.lock();
        Ok(entry(&state, id)?.forkpoint)
    }

    pub fn read_header(&self, id: &Hash256, height: u32) -> Result<Option<Header>, ChainError> {
        let state = self.lock();
        self.read_header_in(&state, id, height)
    }

    pub fn header_at_tip(&self, id: &Hash256) -> Result<Option<Header>, ChainError> {
        let state = self.lock();
        let tip = entry(&state, id)?.height();
        if tip < 0 {
            return Ok(None);
        }
        self.read_header_in(&state, id, tip as u32)
    }

    pub fn get_hash(&self, id: &Hash256, height: u32) -> Result<Hash256, ChainError> {
        let state = self.lock();
        self.get_hash_in(&state, id, i64::from(height))
    }

    pub fn check_hash(&self, id: &Hash256, height: u32, hash: &Hash256) -> bool {
        let state = self.lock();
        self.check_hash_in(&state, id, i64::from(height), hash)
    }

    pub fn get_target(&self, id: &Hash256, height: u32) -> Result<U256, ChainError> {
        let state = self.lock();
        self.get_target_in(&state, id, height, &HashMap::new())
    }

    pub fn can_connect(&self, id: &Hash256, header: &Header, height: u32, check_height: bool) -> bool {
        let state = self.lock();
        self.can_connect_in(&state, id, header, height, check_height)
    }

    /// The chain whose tip directly links up with this header, if any.
    pub fn find_connectable(&self, header: &Header, height: u32) -> Option<Hash256> {
        let state = self.lock();
        state
            .chains
            .keys()
            .find(|id| self.can_connect_in(&state, id, header, height, true))
            .copied()
    }

    /// Chains that contain the given block, best first.
    pub fn chains_containing(&self, height: u32, hash: &Hash256) -> Vec<Hash256> {
        let state = self.lock();
        let mut matching: Vec<(U256, Hash256)> = state
            .chains
            .iter()
            .filter(|(id, _)| self.check_hash_in(&state, id, i64::from(height), hash))
            .map(|(id, chain)| {
                let work = self
                    .get_chainwork_in(&state, id, chain.height())
                    .unwrap_or_else(|_| U256::zero());
                (work, *id)
            })
            .collect();
        matching.sort_by(|a, b| b.0.cmp(&a.0));
        matching.into_iter().map(|(_, id)| id).collect()
    }

    /// Append a header at the chain tip, then promote the chain over
    /// its ancestors while it has more work. Returns the id the chain
    /// ends up registered under.
    pub fn connect_header(
        &self,
        id: &Hash256,
        header: &Header,
        height: u32,
    ) -> Result<Hash256, ChainError> {
        let mut state = self.lock();
        self.save_header_in(&mut state, *id, header, height)
    }

    /// Start a new fork chain off `parent` with this header as its
    /// first block.
    pub fn fork(
        &self,
        parent: &Hash256,
        header: &Header,
        height: u32,
    ) -> Result<Hash256, ChainError> {
        let mut state = self.lock();
        self.fork_in(&mut state, *parent, header, height)
    }

    /// Verify and store a chunk of consecutive headers. Returns whether
    /// the chunk connected; failures are logged, not surfaced.
    pub fn connect_chunk(&self, id: &Hash256, start_height: u32, data: &[u8]) -> bool {
        let mut state = self.lock();
        let result = self
            .verify_chunk_in(&state, id, start_height, data)
            .and_then(|()| self.save_chunk_in(&mut state, *id, start_height, data));
        match result {
            Ok(_) => true,
            Err(err) => {
                log_info!("verify_chunk from height {start_height} failed: {err}");
                false
            }
        }
    }

    /// Cumulative work of the chain at its tip.
    pub fn get_chainwork(&self, id: &Hash256) -> Result<U256, ChainError> {
        let state = self.lock();
        let tip = entry(&state, id)?.height();
        self.get_chainwork_in(&state, id, tip)
    }

    /// Height of the last block two chains share.
    pub fn last_common_height(&self, a: &Hash256, b: &Hash256) -> Result<i64, ChainError> {
        let state = self.lock();
        let ours = self.parent_heights_in(&state, a)?;
        let theirs = self.parent_heights_in(&state, b)?;
        let mut best = 0i64;
        for (chain, our_height) in &ours {
            if let Some(their_height) = theirs.get(chain) {
                best = best.max((*our_height).min(*their_height));
            }
        }
        Ok(best)
    }

    /// A tip is stale when the newest header is older than the stale
    /// delay relative to `now` (unix seconds).
    pub fn is_tip_stale(&self, now: u64) -> Result<bool, ChainError> {
        let best = self.best_chain();
        match self.header_at_tip(&best)? {
            None => Ok(true),
            Some(header) => Ok(u64::from(header.time) + STALE_TIP_SECS < now),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().expect("chain registry lock")
    }

    fn file_for(&self, chain: &ChainEntry) -> HeaderFile {
        HeaderFile::new(chain.path(&self.dir))
    }

    fn load(&self) -> Result<(), ChainError> {
        let mut state = self.lock();
        let mut root = ChainEntry {
            forkpoint: 0,
            forkpoint_hash: self.params.genesis_hash,
            prev_hash: None,
            parent: None,
            size: 0,
        };
        let root_file = self.file_for(&root);
        // keep the checkpointed region sparsely allocated up front so
        // chunk writes inside it never fragment the file
        if !self.params.dgw_checkpoints.is_empty() {
            root_file.preallocate(self.params.max_dgw_checkpoint() + 1)?;
        }
        root.size = root_file.record_count()?;
        let root_id = root.forkpoint_hash;
        state.chains.insert(root_id, root);

        // the stored chain must still connect across the last trusted
        // checkpoint, otherwise start over
        let max_dgw = self.params.max_dgw_checkpoint();
        if !self.params.dgw_checkpoints.is_empty()
            && entry(&state, &root_id)?.height() > i64::from(max_dgw)
        {
            let connects = match self.read_header_in(&state, &root_id, max_dgw + 1) {
                Ok(Some(header)) => {
                    self.can_connect_in(&state, &root_id, &header, max_dgw + 1, false)
                }
                _ => false,
            };
            if !connects {
                log_info!("deleting best chain: cannot connect header after last checkpoint");
                root_file.delete()?;
                state.chains.get_mut(&root_id).expect("root chain").size = 0;
            }
        }

        let forks_dir = self.dir.join(FORKS_DIR_NAME);
        let mut forks = Vec::new();
        for dir_entry in std::fs::read_dir(&forks_dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if let Some((forkpoint, prev, first)) = parse_fork_file_name(&name) {
                forks.push((forkpoint, prev, first, name));
            }
        }
        forks.sort_by_key(|fork| fork.0);

        for (forkpoint, prev, first, name) in forks {
            let path = forks_dir.join(&name);
            let delete = |reason: &str| {
                log_info!("deleting chain {name}: {reason}");
                std::fs::remove_file(&path)
            };

            let floor = self.params.fork_floor();
            if forkpoint == 0 || forkpoint <= floor {
                delete("fork at or below checkpoint floor")?;
                continue;
            }
            // sorting by forkpoint guarantees parents come first
            let parent = state
                .chains
                .keys()
                .copied()
                .collect::<Vec<_>>()
                .into_iter()
                .find(|id| self.check_hash_in(&state, id, i64::from(forkpoint) - 1, &prev));
            let Some(parent_id) = parent else {
                delete("cannot find parent for chain")?;
                continue;
            };
            let chain = ChainEntry {
                forkpoint,
                forkpoint_hash: first,
                prev_hash: Some(prev),
                parent: Some(parent_id),
                size: HeaderFile::new(&path).record_count()?,
            };
            state.chains.insert(first, chain);
            let valid = match self.read_header_in(&state, &first, forkpoint) {
                Ok(Some(header)) => {
                    header.hash(&self.params) == first
                        && self.can_connect_in(&state, &parent_id, &header, forkpoint, false)
                }
                _ => false,
            };
            if !valid {
                state.chains.remove(&first);
                delete("cannot connect chain to parent")?;
            }
        }
        Ok(())
    }

    fn read_header_in(
        &self,
        state: &ChainState,
        id: &Hash256,
        height: u32,
    ) -> Result<Option<Header>, ChainError> {
        let chain = entry(state, id)?;
        if height < chain.forkpoint {
            return match chain.parent {
                Some(parent) => self.read_header_in(state, &parent, height),
                None => Ok(None),
            };
        }
        if i64::from(height) > chain.height() {
            return Ok(None);
        }
        let record = self.file_for(chain).read_record(height - chain.forkpoint)?;
        match record {
            None => Ok(None),
            Some(record) => Ok(Some(Header::consensus_decode(&record, &self.params)?)),
        }
    }

    fn get_hash_in(&self, state: &ChainState, id: &Hash256, height: i64) -> Result<Hash256, ChainError> {
        if height == -1 {
            return Ok(ZERO_HASH);
        }
        let height = u32::try_from(height).map_err(|_| ChainError::MissingHeader(0))?;
        if height == 0 {
            return Ok(self.params.genesis_hash);
        }
        // last header of a legacy retarget window, covered by the table
        if height <= self.params.dgw_activation_height && (height + 1) % RETARGET_WINDOW == 0 {
            if let Some((hash, _)) = self.params.checkpoints.get((height / RETARGET_WINDOW) as usize)
            {
                return Ok(*hash);
            }
        }
        if let Some(position) = self.params.dgw_checkpoint_position(height) {
            let index = self.params.dgw_checkpoint_index(height);
            if let Some(pair) = self.params.dgw_checkpoints.get(index) {
                return Ok(pair[position].0);
            }
        }
        match self.read_header_in(state, id, height)? {
            Some(header) => Ok(header.hash(&self.params)),
            None => Err(ChainError::MissingHeader(height)),
        }
    }

    fn check_hash_in(&self, state: &ChainState, id: &Hash256, height: i64, hash: &Hash256) -> bool {
        matches!(self.get_hash_in(state, id, height), Ok(found) if found == *hash)
    }

    /// Expected target for a header at `height`, looking up pending
    /// (not yet stored) headers from `pending` first.
    fn get_target_in(
        &self,
        state: &ChainState,
        id: &Hash256,
        height: u32,
        pending: &HashMap<u32, Header>,
    ) -> Result<U256, ChainError> {
        let params = &self.params;
        if params.is_testnet() {
            return Ok(U256::zero());
        }
        if height < params.dgw_activation_height {
            return match params.checkpoints.get((height / RETARGET_WINDOW) as usize) {
                Some((_, target)) => Ok(*target),
                None => Err(ChainError::MissingCheckpoint(height)),
            };
        }
        if let Some(position) = params.dgw_checkpoint_position(height) {
            let index = params.dgw_checkpoint_index(height);
            if let Some(pair) = params.dgw_checkpoints.get(index) {
                return Ok(pair[position].1);
            }
        }
        if params.in_mix_reset_band(height) {
            return Ok(params.mix_reset_target);
        }
        let chain = entry(state, id)?;
        if i64::from(height) <= chain.height() {
            let header = self
                .read_header_in(state, id, height)?
                .ok_or(ChainError::MissingHeader(height))?;
            return Ok(compact_to_u256(header.bits)?);
        }
        let read = |h: u32| -> Option<HeaderInfo> {
            if let Some(header) = pending.get(&h) {
                return Some(HeaderInfo {
                    bits: header.bits,
                    time: header.time,
                });
            }
            match self.read_header_in(state, id, h) {
                Ok(Some(header)) => Some(HeaderInfo {
                    bits: header.bits,
                    time: header.time,
                }),
                _ => None,
            }
        };
        Ok(dgw_next_target(height, read, params)?)
    }

    fn verify_header(
        &self,
        header: &Header,
        prev_hash: &Hash256,
        target: U256,
        expected_hash: Option<&Hash256>,
    ) -> Result<(), ChainError> {
        let hash = header.hash(&self.params);
        if let Some(expected) = expected_hash {
            if *expected != hash {
                return Err(ChainError::HashMismatch);
            }
        }
        if *prev_hash != header.prev_block {
            return Err(ChainError::PrevHashMismatch);
        }
        validate_header_pow(header, target, &self.params)?;
        Ok(())
    }

    fn can_connect_in(
        &self,
        state: &ChainState,
        id: &Hash256,
        header: &Header,
        height: u32,
        check_height: bool,
    ) -> bool {
        let Ok(chain) = entry(state, id) else {
            return false;
        };
        if check_height && chain.height() != i64::from(height) - 1 {
            return false;
        }
        if height == 0 {
            return header.hash(&self.params) == self.params.genesis_hash;
        }
        let Ok(prev_hash) = self.get_hash_in(state, id, i64::from(height) - 1) else {
            return false;
        };
        if prev_hash != header.prev_block {
            return false;
        }
        let mut pending = HashMap::new();
        pending.insert(height, header.clone());
        let Ok(target) = self.get_target_in(state, id, height, &pending) else {
            return false;
        };
        self.verify_header(header, &prev_hash, target, None).is_ok()
    }

    fn verify_chunk_in(
        &self,
        state: &ChainState,
        id: &Hash256,
        start_height: u32,
        data: &[u8],
    ) -> Result<(), ChainError> {
        let params = &self.params;
        let in_dgw_table = |height: u32| {
            !params.dgw_checkpoints.is_empty()
                && height >= params.dgw_checkpoints_start
                && height <= params.max_dgw_checkpoint() + params.dgw_checkpoint_spacing
        };

        let mut pending: HashMap<u32, Header> = HashMap::new();
        let mut cursor = 0usize;
        let mut height = start_height;
        let mut prev_hash = self.get_hash_in(state, id, i64::from(start_height) - 1)?;

        while cursor < data.len() {
            let size = if height < params.mix_activation_height {
                LEGACY_HEADER_SIZE
            } else {
                RECORD_SIZE
            };
            if cursor + size > data.len() {
                return Err(ChainError::BadChunk("truncated header"));
            }
            let header = Header::consensus_decode(&data[cursor..cursor + size], params)?;
            cursor += size;

            let expected_hash = self.get_hash_in(state, id, i64::from(height)).ok();
            // inside a checkpointed window only the bracketing headers
            // have pinned targets; the rest are taken at their word and
            // anchored by the bracket
            let target = if in_dgw_table(height) {
                match params.dgw_checkpoint_position(height) {
                    Some(_) => self.get_target_in(state, id, height, &pending)?,
                    None => compact_to_u256(header.bits)?,
                }
            } else {
                self.get_target_in(state, id, height, &pending)?
            };
            self.verify_header(&header, &prev_hash, target, expected_hash.as_ref())?;
            prev_hash = header.hash(params);
            pending.insert(height, header);
            height += 1;
        }

        // checkpointed windows must arrive whole, or the brackets
        // cannot anchor them
        if !params.dgw_checkpoints.is_empty()
            && start_height >= params.dgw_checkpoints_start
            && start_height <= params.max_dgw_checkpoint()
        {
            if start_height % params.dgw_checkpoint_spacing != 0 {
                return Err(ChainError::BadChunk("checkpointed chunk not window-aligned"));
            }
            if height - start_height != params.dgw_checkpoint_spacing {
                return Err(ChainError::BadChunk("checkpointed chunk not a whole window"));
            }
        }
        Ok(())
    }

    /// Convert a wire chunk into storage records, padding legacy
    /// headers to the record size.
    fn pad_chunk(&self, start_height: u32, data: &[u8]) -> Result<Vec<u8>, ChainError> {
        let mut records = Vec::with_capacity(data.len());
        let mut cursor = 0usize;
        let mut height = start_height;
        while cursor < data.len() {
            let size = if height < self.params.mix_activation_height {
                LEGACY_HEADER_SIZE
            } else {
                RECORD_SIZE
            };
            if cursor + size > data.len() {
                return Err(ChainError::BadChunk("truncated header"));
            }
            records.extend_from_slice(&data[cursor..cursor + size]);
            records.resize(records.len() + (RECORD_SIZE - size), 0);
            cursor += size;
            height += 1;
        }
        Ok(records)
    }

    fn save_chunk_in(
        &self,
        state: &mut ChainState,
        id: Hash256,
        start_height: u32,
        data: &[u8],
    ) -> Result<Hash256, ChainError> {
        let params = &self.params;
        let within_cp_region = !params.dgw_checkpoints.is_empty()
            && start_height < params.max_dgw_checkpoint() + params.dgw_checkpoint_spacing;
        // chunks in the checkpoint region always land on the best chain
        let id = if within_cp_region && entry(state, &id)?.parent.is_some() {
            self.best_chain()
        } else {
            id
        };

        let records = self.pad_chunk(start_height, data)?;
        let chain = entry(state, &id)?;
        let delta = i64::from(start_height) - i64::from(chain.forkpoint);
        let (offset, slice) = if delta < 0 {
            // the part below our forkpoint belongs to the parent
            let skip = (-delta) as usize * RECORD_SIZE;
            if skip >= records.len() {
                return Ok(id);
            }
            (0u32, &records[skip..])
        } else {
            (delta as u32, &records[..])
        };
        let file = self.file_for(chain);
        file.write_records(offset, slice, !within_cp_region)?;
        let size = file.record_count()?;
        state.chains.get_mut(&id).expect("entry checked").size = size;
        self.swap_with_parent_in(state, id)
    }

    fn save_header_in(
        &self,
        state: &mut ChainState,
        id: Hash256,
        header: &Header,
        height: u32,
    ) -> Result<Hash256, ChainError> {
        let chain = entry(state, &id)?;
        let expected = chain.forkpoint + chain.size;
        if height != expected {
            return Err(ChainError::NotAppend {
                expected,
                got: height,
            });
        }
        let record = header.encode_record();
        self.file_for(chain).write_records(height - chain.forkpoint, &record, true)?;
        state.chains.get_mut(&id).expect("entry checked").size += 1;
        self.swap_with_parent_in(state, id)
    }

    fn fork_in(
        &self,
        state: &mut ChainState,
        parent_id: Hash256,
        header: &Header,
        height: u32,
    ) -> Result<Hash256, ChainError> {
        let floor = self.params.fork_floor();
        if height == 0 || height <= floor {
            return Err(ChainError::ForkBelowFloor {
                forkpoint: height,
                floor,
            });
        }
        if !self.can_connect_in(state, &parent_id, header, height, false) {
            return Err(ChainError::ForkDoesNotConnect);
        }
        let prev_hash = self.get_hash_in(state, &parent_id, i64::from(height) - 1)?;
        let forkpoint_hash = header.hash(&self.params);
        let chain = ChainEntry {
            forkpoint: height,
            forkpoint_hash,
            prev_hash: Some(prev_hash),
            parent: Some(parent_id),
            size: 0,
        };
        self.file_for(&chain).create()?;
        state.chains.insert(forkpoint_hash, chain);
        self.save_header_in(state, forkpoint_hash, header, height)
    }

    /// Promote `id` over its ancestors while it carries more work.
    /// Returns the registry key the chain's headers end up under.
    fn swap_with_parent_in(
        &self,
        state: &mut ChainState,
        id: Hash256,
    ) -> Result<Hash256, ChainError> {
        let mut id = id;
        let mut count = 0usize;
        loop {
            match self.try_swap(state, id)? {
                None => break,
                Some(promoted_id) => {
                    count += 1;
                    if count > state.chains.len() {
                        return Err(ChainError::SwapLoop);
                    }
                    id = promoted_id;
                }
            }
        }
        Ok(id)
    }

    fn try_swap(&self, state: &mut ChainState, child_id: Hash256) -> Result<Option<Hash256>, ChainError> {
        let child = entry(state, &child_id)?.clone();
        let Some(parent_id) = child.parent else {
            return Ok(None);
        };
        let parent = entry(state, &parent_id)?.clone();

        let child_work = self.get_chainwork_in(state, &child_id, child.height())?;
        let parent_work = self.get_chainwork_in(state, &parent_id, parent.height())?;
        if parent_work >= child_work {
            return Ok(None);
        }
        let parent_branch_size = parent.height() - i64::from(child.forkpoint) + 1;
        if parent_branch_size <= 0 {
            log_debug!("not swapping: parent has no headers above forkpoint {}", child.forkpoint);
            return Ok(None);
        }
        log_info!(
            "swapping chain at {} with parent at {}",
            child.forkpoint,
            parent.forkpoint
        );

        let child_file = self.file_for(&child);
        let parent_file = self.file_for(&parent);
        let child_data = child_file.read_all()?;
        let parent_data =
            parent_file.read_records(child.forkpoint - parent.forkpoint, parent_branch_size as u32)?;

        let first = Header::consensus_decode(&parent_data[..RECORD_SIZE], &self.params)?;
        let demoted_id = first.hash(&self.params);

        // the demoted tail moves into the child's old file, the child's
        // headers take its place in the parent's file
        child_file.write_records(0, &parent_data, true)?;
        parent_file.write_records(child.forkpoint - parent.forkpoint, &child_data, true)?;

        let promoted = ChainEntry {
            forkpoint: parent.forkpoint,
            forkpoint_hash: parent.forkpoint_hash,
            prev_hash: parent.prev_hash,
            parent: parent.parent,
            size: child.forkpoint - parent.forkpoint + child.size,
        };
        let demoted = ChainEntry {
            forkpoint: child.forkpoint,
            forkpoint_hash: demoted_id,
            prev_hash: child.prev_hash,
            parent: Some(parent_id),
            size: parent_branch_size as u32,
        };
        std::fs::rename(child.path(&self.dir), demoted.path(&self.dir))?;

        state.chains.remove(&child_id);
        state.chains.remove(&parent_id);
        state.chains.insert(parent_id, promoted);
        state.chains.insert(demoted_id, demoted);

        // re-point the rest of the tree: former children of the child
        // now hang off the promoted chain; former siblings keep the
        // promoted chain as parent only if their branch point is still
        // on it, otherwise they follow the demoted tail
        let others: Vec<Hash256> = state
            .chains
            .keys()
            .filter(|key| **key != parent_id && **key != demoted_id)
            .copied()
            .collect();
        for key in others {
            let chain_parent = entry(state, &key)?.parent;
            if chain_parent == Some(child_id) {
                state.chains.get_mut(&key).expect("entry checked").parent = Some(parent_id);
            } else if chain_parent == Some(parent_id) {
                let (forkpoint, prev_hash) = {
                    let chain = entry(state, &key)?;
                    (chain.forkpoint, chain.prev_hash)
                };
                if let Some(prev_hash) = prev_hash {
                    let on_promoted =
                        self.check_hash_in(state, &parent_id, i64::from(forkpoint) - 1, &prev_hash);
                    if !on_promoted {
                        state.chains.get_mut(&key).expect("entry checked").parent = Some(demoted_id);
                    }
                }
            }
        }
        Ok(Some(parent_id))
    }

    fn parent_heights_in(
        &self,
        state: &ChainState,
        id: &Hash256,
    ) -> Result<HashMap<Hash256, i64>, ChainError> {
        let mut result = HashMap::new();
        let mut current = *id;
        result.insert(current, entry(state, &current)?.height());
        loop {
            let chain = entry(state, &current)?;
            let Some(parent) = chain.parent else {
                break;
            };
            result.insert(parent, i64::from(chain.forkpoint) - 1);
            current = parent;
        }
        Ok(result)
    }

    fn work_of_header(
        &self,
        state: &ChainState,
        id: &Hash256,
        height: u32,
    ) -> Result<U256, ChainError> {
        let target = self.get_target_in(state, id, height, &HashMap::new())?;
        Ok(target_to_work(target))
    }

    fn get_chainwork_in(
        &self,
        state: &ChainState,
        id: &Hash256,
        height: i64,
    ) -> Result<U256, ChainError> {
        let height = height.max(0);
        if self.params.is_testnet() {
            // difficulty is not enforced there; block count is as good
            // a proxy as any
            return Ok(U256::from(height as u64));
        }
        let floor = self.params.fork_floor();
        // forks below the floor are impossible, so work below it never
        // decides anything
        if floor > 0 && height < i64::from(floor) {
            return Ok(U256::zero());
        }

        let window = i64::from(RETARGET_WINDOW);
        let last_retarget = height / window * window - 1;
        let mut cached_height = last_retarget;
        let mut running_total;
        loop {
            let hash = self.get_hash_in(state, id, cached_height)?;
            let cached = self
                .work_cache
                .lock()
                .expect("work cache lock")
                .get(&hash)
                .copied();
            if let Some(work) = cached {
                running_total = work;
                break;
            }
            if cached_height <= -1 {
                running_total = U256::zero();
                break;
            }
            cached_height -= window;
        }

        while cached_height < last_retarget {
            let mut chunk_work = U256::zero();
            for _ in 0..window {
                cached_height += 1;
                chunk_work = chunk_work + self.work_of_header(state, id, cached_height as u32)?;
            }
            running_total = running_total + chunk_work;
            let hash = self.get_hash_in(state, id, cached_height)?;
            self.work_cache
                .lock()
                .expect("work cache lock")
                .insert(hash, running_total);
        }

        let mut partial = U256::zero();
        while cached_height < height {
            cached_height += 1;
            partial = partial + self.work_of_header(state, id, cached_height as u32)?;
        }
        Ok(running_total + partial)
    }
}

fn entry<'a>(state: &'a ChainState, id: &Hash256) -> Result<&'a ChainEntry, ChainError> {
    state.chains.get(id).ok_or(ChainError::UnknownChain)
}

impl std::fmt::Debug for ChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        let mut dbg = f.debug_struct("ChainManager");
        dbg.field("dir", &self.dir);
        for (id, chain) in &state.chains {
            dbg.field(&hash_to_hex(id)[..10].to_string(), &(chain.forkpoint, chain.size));
        }
        dbg.finish()
    }
}
