//! The server session surface the SPV components consume.
//!
//! The transport is abstracted away behind [`SpvSession`]; components
//! only care that each call is fallible and that remote protocol
//! errors stay distinct from local verification errors.

use async_trait::async_trait;
use corvid_consensus::Hash256;
use corvid_primitives::OutPoint;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The server does not know the requested item. Retryable in some
    /// contexts (mempool races), terminal in others.
    NotFound,
    /// The server answered with something structurally wrong.
    Protocol(String),
    /// The connection itself failed.
    Transport(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotFound => write!(f, "server: not found"),
            SessionError::Protocol(msg) => write!(f, "server protocol error: {msg}"),
            SessionError::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One entry of an address history as the server reports it. Heights
/// at or below zero mean unconfirmed (negative: unconfirmed parents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub txid: Hash256,
    pub height: i32,
    pub fee: Option<i64>,
}

/// A merkle inclusion proof for a transaction. The height is the one
/// the server returned with the proof, which is authoritative over
/// whatever height was announced earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub block_height: u32,
    pub pos: u32,
    pub branch: Vec<Hash256>,
}

/// A chunk of consecutive raw headers starting at `start_height`.
#[derive(Debug, Clone)]
pub struct HeaderChunk {
    pub start_height: u32,
    pub data: Vec<u8>,
}

/// Asset metadata as reported by a server, including the provenance
/// outpoints that let us re-derive every mutable sub-field from chain
/// data. Untrusted until the verifier has walked the provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub name: String,
    pub circulation: i64,
    pub is_owner: bool,
    pub reissuable: bool,
    pub divisions: u8,
    pub has_ipfs: bool,
    pub ipfs: Option<Vec<u8>>,
    /// Height of the transaction that last set the base fields.
    pub height: u32,
    pub divisions_height: Option<u32>,
    pub ipfs_height: Option<u32>,
    pub source: OutPoint,
    pub divisions_source: Option<OutPoint>,
    pub ipfs_source: Option<OutPoint>,
}

/// A pushed subscription notification. `None` status means the server
/// considers the history/metadata empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Address { address: String, status: Option<String> },
    Asset { asset: String, status: Option<String> },
}

/// Async request surface of one server connection.
#[async_trait]
pub trait SpvSession: Send + Sync + 'static {
    /// Subscribe to an address; returns its current status digest.
    async fn subscribe_address(&self, address: &str) -> Result<Option<String>, SessionError>;

    /// Subscribe to an asset; returns its current metadata digest.
    async fn subscribe_asset(&self, asset: &str) -> Result<Option<String>, SessionError>;

    /// Next pushed status change on any active subscription.
    async fn next_status_update(&self) -> Result<StatusUpdate, SessionError>;

    async fn get_history(&self, address: &str) -> Result<Vec<HistoryItem>, SessionError>;

    async fn get_transaction(&self, txid: &Hash256) -> Result<Vec<u8>, SessionError>;

    async fn get_merkle(&self, txid: &Hash256, height: u32)
        -> Result<MerkleProof, SessionError>;

    /// Fetch the header chunk covering `height`.
    async fn get_header_chunk(&self, height: u32) -> Result<HeaderChunk, SessionError>;

    async fn get_asset_metadata(
        &self,
        asset: &str,
    ) -> Result<Option<AssetMetadata>, SessionError>;
}
