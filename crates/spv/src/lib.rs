//! SPV client core: proof verification and wallet synchronization on
//! top of the header chain.

pub mod merkle;
pub mod session;
pub mod synchronizer;
pub mod task;
pub mod verifier;
pub mod wallet;

pub use merkle::{hash_merkle_root, verify_tx_in_block, MerkleError};
pub use session::{
    AssetMetadata, HeaderChunk, HistoryItem, MerkleProof, SessionError, SpvSession, StatusUpdate,
};
pub use synchronizer::{asset_status, history_status, SyncError, Synchronizer};
pub use task::{CancelToken, TaskGroup};
pub use verifier::{Verifier, VerifierError};
pub use wallet::{TxMinedInfo, WalletState};
