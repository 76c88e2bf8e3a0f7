//! Header, transaction and asset-script types with consensus
//! serialization.

pub mod assetscript;
pub mod encoding;
pub mod hash;
pub mod header;
pub mod outpoint;
pub mod transaction;

pub use assetscript::{
    parse_asset_script, AssetIssuance, AssetReissue, AssetScript, AssetScriptError,
};
pub use hash::{keccak256d, mix_digest, sha256, sha256d};
pub use header::{Header, HeaderDecodeError, Nonce, PowEra};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
