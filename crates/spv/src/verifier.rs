//! Proof verification against the local header chain.
//!
//! A periodic scan walks the wallet's unverified transactions and
//! asset records. Merkle proofs are fetched and checked against local
//! headers; asset metadata is re-derived from the scripts of its
//! provenance transactions. Consensus-level mismatches are treated as
//! a hostile server and surface as errors that cancel the task group.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use corvid_chain::{ChainError, ChainManager};
use corvid_consensus::{hash_to_hex, Hash256};
use corvid_log::{log_debug, log_info};
use corvid_primitives::assetscript::DIVISIONS_UNCHANGED;
use corvid_primitives::{parse_asset_script, AssetScript, Transaction};
use tokio::sync::Semaphore;

use crate::merkle::{verify_tx_in_block, MerkleError};
use crate::session::{AssetMetadata, MerkleProof, SessionError, SpvSession};
use crate::task::TaskGroup;
use crate::wallet::{TxMinedInfo, WalletState};

const SCAN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum VerifierError {
    Session(SessionError),
    Chain(ChainError),
    Merkle(MerkleError),
    TxidMismatch { expected: Hash256, got: Hash256 },
    MissingOutput { txid: Hash256, index: u32 },
    NotAMetadataScript,
    WrongAsset { expected: String, got: String },
    MetadataMismatch(&'static str),
    MetadataDowngrade {
        field: &'static str,
        trusted_height: u32,
        offered_height: u32,
    },
    ReissueExceedsCirculation { claimed: i64, reissued: i64 },
}

impl std::fmt::Display for VerifierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifierError::Session(err) => write!(f, "{err}"),
            VerifierError::Chain(err) => write!(f, "{err}"),
            VerifierError::Merkle(err) => write!(f, "{err}"),
            VerifierError::TxidMismatch { expected, got } => write!(
                f,
                "received tx does not match expected txid ({} != {})",
                hash_to_hex(expected),
                hash_to_hex(got)
            ),
            VerifierError::MissingOutput { txid, index } => write!(
                f,
                "tx {} has no output {index}",
                hash_to_hex(txid)
            ),
            VerifierError::NotAMetadataScript => {
                write!(f, "cited output does not carry asset metadata")
            }
            VerifierError::WrongAsset { expected, got } => {
                write!(f, "metadata source names asset {got}, expected {expected}")
            }
            VerifierError::MetadataMismatch(field) => {
                write!(f, "metadata field {field} mismatches its source script")
            }
            VerifierError::MetadataDowngrade {
                field,
                trusted_height,
                offered_height,
            } => write!(
                f,
                "server offered stale {field} source (trusted height {trusted_height}, offered {offered_height})"
            ),
            VerifierError::ReissueExceedsCirculation { claimed, reissued } => write!(
                f,
                "reissue amount {reissued} exceeds claimed circulation {claimed}"
            ),
        }
    }
}

impl std::error::Error for VerifierError {}

impl From<SessionError> for VerifierError {
    fn from(err: SessionError) -> Self {
        VerifierError::Session(err)
    }
}

impl From<ChainError> for VerifierError {
    fn from(err: ChainError) -> Self {
        VerifierError::Chain(err)
    }
}

impl From<MerkleError> for VerifierError {
    fn from(err: MerkleError) -> Self {
        VerifierError::Merkle(err)
    }
}

/// Field values a provenance source transaction must reproduce.
#[derive(Default)]
struct ExpectedFields {
    circulation: Option<i64>,
    divisions: Option<u8>,
    reissuable: Option<bool>,
    has_ipfs: Option<bool>,
    ipfs: Option<Option<Vec<u8>>>,
}

#[derive(Default)]
struct VerifierInner {
    /// txid -> merkle root, once verified.
    merkle_roots: HashMap<Hash256, Hash256>,
    requested_merkle: HashSet<Hash256>,
    requested_assets: HashSet<String>,
    requested_chunks: HashSet<u32>,
    /// Best-chain tip as of the last reorg check.
    last_tip: Option<(u32, Hash256)>,
}

pub struct Verifier<S> {
    session: Arc<S>,
    chain: Arc<ChainManager>,
    wallet: Arc<WalletState>,
    requests: Arc<Semaphore>,
    inner: Mutex<VerifierInner>,
}

impl<S: SpvSession> Verifier<S> {
    pub fn new(
        session: Arc<S>,
        chain: Arc<ChainManager>,
        wallet: Arc<WalletState>,
        requests: Arc<Semaphore>,
    ) -> Self {
        Self {
            session,
            chain,
            wallet,
            requests,
            inner: Mutex::new(VerifierInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VerifierInner> {
        self.inner.lock().expect("verifier lock")
    }

    /// No proof requests in flight and nothing left unverified.
    pub fn is_up_to_date(&self) -> bool {
        let inner = self.lock();
        inner.requested_merkle.is_empty()
            && inner.requested_assets.is_empty()
            && !self.wallet.has_unverified()
    }

    pub fn start(self: &Arc<Self>, group: &TaskGroup) {
        let verifier = Arc::clone(self);
        let scan_group = group.clone();
        group.spawn("verifier-scan", async move {
            verifier.scan_loop(scan_group).await
        });
    }

    async fn scan_loop(self: Arc<Self>, group: TaskGroup) -> Result<(), VerifierError> {
        loop {
            self.maybe_undo_verifications()?;
            self.scan_unverified_txs(&group)?;
            self.scan_unverified_assets(&group)?;
            tokio::time::sleep(SCAN_INTERVAL).await;
        }
    }

    /// Invalidate proofs that no longer sit on the best chain. Cheap
    /// when the tip has not moved.
    fn maybe_undo_verifications(&self) -> Result<(), VerifierError> {
        let best = self.chain.best_chain();
        let tip_height = self.chain.height(&best)?;
        let tip = if tip_height < 0 {
            None
        } else {
            Some((tip_height as u32, self.chain.get_hash(&best, tip_height as u32)?))
        };
        {
            let mut inner = self.lock();
            if inner.last_tip == tip {
                return Ok(());
            }
            inner.last_tip = tip;
        }

        let chain = &self.chain;
        let stale = self
            .wallet
            .undo_verifications(|height, header_hash| chain.check_hash(&best, height, header_hash));
        if !stale.is_empty() {
            log_info!("chain moved: undoing {} verifications", stale.len());
            let mut inner = self.lock();
            for txid in &stale {
                inner.merkle_roots.remove(txid);
                inner.requested_merkle.remove(txid);
            }
        }
        let stale_assets = self
            .wallet
            .undo_asset_verifications(|height, hash| chain.check_hash(&best, height, hash));
        if !stale_assets.is_empty() {
            let mut inner = self.lock();
            for asset in &stale_assets {
                inner.requested_assets.remove(asset);
            }
        }
        Ok(())
    }

    /// True when the header is locally available; otherwise schedules a
    /// chunk request if the gap is inside the checkpointed region.
    fn ensure_header(
        self: &Arc<Self>,
        group: &TaskGroup,
        best: &Hash256,
        height: u32,
    ) -> Result<bool, VerifierError> {
        if self.chain.read_header(best, height)?.is_some() {
            return Ok(true);
        }
        if height < self.chain.params().max_dgw_checkpoint()
            && self.lock().requested_chunks.insert(height)
        {
            let verifier = Arc::clone(self);
            group.spawn("verifier-chunk", async move {
                verifier.request_chunk(height).await
            });
        }
        Ok(false)
    }

    fn scan_unverified_txs(self: &Arc<Self>, group: &TaskGroup) -> Result<(), VerifierError> {
        let best = self.chain.best_chain();
        let local_height = self.chain.height(&best)?;
        for (txid, height) in self.wallet.unverified_txs() {
            {
                let inner = self.lock();
                if inner.requested_merkle.contains(&txid)
                    || inner.merkle_roots.contains_key(&txid)
                {
                    continue;
                }
            }
            if height == 0 || i64::from(height) > local_height {
                continue;
            }
            if !self.ensure_header(group, &best, height)? {
                continue;
            }
            log_info!("requesting merkle proof for {}", hash_to_hex(&txid));
            self.lock().requested_merkle.insert(txid);
            let verifier = Arc::clone(self);
            group.spawn("verifier-proof", async move {
                verifier.verify_tx_proof(txid, height).await
            });
        }
        Ok(())
    }

    async fn request_chunk(self: Arc<Self>, height: u32) -> Result<(), VerifierError> {
        let chunk = {
            let _permit = self.requests.acquire().await.expect("semaphore open");
            self.session.get_header_chunk(height).await?
        };
        let best = self.chain.best_chain();
        self.chain.connect_chunk(&best, chunk.start_height, &chunk.data);
        self.lock().requested_chunks.remove(&height);
        Ok(())
    }

    /// Fetch a merkle proof and verify it against the local header at
    /// the height the proof itself claims.
    async fn verify_tx_proof(
        self: Arc<Self>,
        txid: Hash256,
        announced_height: u32,
    ) -> Result<(), VerifierError> {
        let proof = match self.fetch_merkle(&txid, announced_height).await {
            Ok(proof) => proof,
            Err(SessionError::NotFound) => {
                // server revoked its claim; drop the candidate
                log_info!("tx {} not at height {announced_height}", hash_to_hex(&txid));
                self.wallet.remove_unverified_tx(&txid);
                self.lock().requested_merkle.remove(&txid);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if proof.block_height != announced_height {
            log_info!(
                "announced height {announced_height} differs from proof height {} for {}",
                proof.block_height,
                hash_to_hex(&txid)
            );
        }
        let height = proof.block_height;
        let best = self.chain.best_chain();
        let header = self
            .chain
            .read_header(&best, height)?
            .ok_or(MerkleError::MissingHeader(height))?;
        verify_tx_in_block(&txid, &proof, &header)?;

        log_debug!("verified {}", hash_to_hex(&txid));
        {
            let mut inner = self.lock();
            inner.merkle_roots.insert(txid, header.merkle_root);
            inner.requested_merkle.remove(&txid);
        }
        self.wallet.add_verified_tx(
            txid,
            TxMinedInfo {
                height,
                timestamp: header.time,
                txpos: proof.pos,
                header_hash: header.hash(self.chain.params()),
            },
        );
        Ok(())
    }

    async fn fetch_merkle(
        &self,
        txid: &Hash256,
        height: u32,
    ) -> Result<MerkleProof, SessionError> {
        let _permit = self.requests.acquire().await.expect("semaphore open");
        self.session.get_merkle(txid, height).await
    }

    fn scan_unverified_assets(self: &Arc<Self>, group: &TaskGroup) -> Result<(), VerifierError> {
        let best = self.chain.best_chain();
        let local_height = self.chain.height(&best)?;
        'assets: for (asset, meta) in self.wallet.unverified_asset_metas() {
            if self.lock().requested_assets.contains(&asset) {
                continue;
            }
            if meta.height == 0 || i64::from(meta.height) > local_height {
                continue;
            }
            // every cited source height needs a local header first
            let mut heights = vec![meta.height];
            heights.extend(meta.divisions_height);
            heights.extend(meta.ipfs_height);
            for height in heights {
                if !self.ensure_header(group, &best, height)? {
                    continue 'assets;
                }
            }
            log_info!("verifying asset metadata for {asset}");
            self.lock().requested_assets.insert(asset.clone());
            let verifier = Arc::clone(self);
            group.spawn("verifier-asset", async move {
                let result = verifier.verify_asset_meta(&asset, &meta).await;
                if result.is_err() {
                    verifier.lock().requested_assets.remove(&asset);
                }
                result
            });
        }
        Ok(())
    }

    /// Walk the provenance chain of a metadata record bottom-up: each
    /// independently-sourced sub-field is re-derived from the script of
    /// its cited transaction and must match exactly.
    async fn verify_asset_meta(
        self: &Arc<Self>,
        asset: &str,
        meta: &AssetMetadata,
    ) -> Result<(), VerifierError> {
        let mature = self.chain.params().mature_depth;
        let trusted = self.wallet.get_asset_meta(asset);

        if let Some(trusted) = &trusted {
            if trusted.height.saturating_sub(mature) > meta.height {
                return Err(VerifierError::MetadataDowngrade {
                    field: "base",
                    trusted_height: trusted.height,
                    offered_height: meta.height,
                });
            }
        }

        if let (Some(source), Some(height)) = (&meta.divisions_source, meta.divisions_height) {
            if let Some(trusted_height) = trusted.as_ref().and_then(|t| t.divisions_height) {
                if trusted_height.saturating_sub(mature) > height {
                    return Err(VerifierError::MetadataDowngrade {
                        field: "divisions",
                        trusted_height,
                        offered_height: height,
                    });
                }
            }
            let expect = ExpectedFields {
                divisions: Some(meta.divisions),
                ..Default::default()
            };
            self.verify_source(asset, height, source.txid, source.index, &expect)
                .await?;
        }

        if let (Some(source), Some(height)) = (&meta.ipfs_source, meta.ipfs_height) {
            if let Some(trusted_height) = trusted.as_ref().and_then(|t| t.ipfs_height) {
                if trusted_height.saturating_sub(mature) > height {
                    return Err(VerifierError::MetadataDowngrade {
                        field: "ipfs",
                        trusted_height,
                        offered_height: height,
                    });
                }
            }
            let expect = ExpectedFields {
                ipfs: Some(meta.ipfs.clone()),
                ..Default::default()
            };
            self.verify_source(asset, height, source.txid, source.index, &expect)
                .await?;
        }

        // base source carries whatever was not superseded by a
        // dedicated sub-field source
        let base_has_ipfs = meta.has_ipfs && meta.ipfs_source.is_none() && meta.ipfs_height.is_none();
        let expect = ExpectedFields {
            circulation: Some(meta.circulation),
            reissuable: Some(meta.reissuable),
            has_ipfs: Some(base_has_ipfs),
            ipfs: if base_has_ipfs {
                Some(meta.ipfs.clone())
            } else {
                None
            },
            // with a dedicated divisions source the base script must
            // carry the "unchanged" sentinel, not a competing value
            divisions: if meta.divisions_source.is_none() && meta.divisions_height.is_none() {
                Some(meta.divisions)
            } else {
                Some(DIVISIONS_UNCHANGED)
            },
        };
        self.verify_source(asset, meta.height, meta.source.txid, meta.source.index, &expect)
            .await?;

        // pin every provenance height to the header the proofs were
        // checked against, so a reorg can invalidate the record
        let best = self.chain.best_chain();
        let mut anchors = Vec::new();
        let mut heights = vec![meta.height];
        heights.extend(meta.divisions_height);
        heights.extend(meta.ipfs_height);
        for height in heights {
            let header = self
                .chain
                .read_header(&best, height)?
                .ok_or(MerkleError::MissingHeader(height))?;
            anchors.push((height, header.hash(self.chain.params())));
        }

        self.lock().requested_assets.remove(asset);
        self.wallet.add_verified_asset_meta(asset, meta.clone(), anchors);
        log_info!("verified asset metadata for {asset}");
        Ok(())
    }

    /// Fetch one provenance transaction, prove its inclusion, and check
    /// the metadata its script encodes against the expected values.
    async fn verify_source(
        self: &Arc<Self>,
        asset: &str,
        height: u32,
        txid: Hash256,
        index: u32,
        expect: &ExpectedFields,
    ) -> Result<(), VerifierError> {
        let raw = {
            let _permit = self.requests.acquire().await.expect("semaphore open");
            self.session.get_transaction(&txid).await?
        };
        let tx = Transaction::parse(&raw)
            .map_err(|_| VerifierError::Session(SessionError::Protocol("undecodable tx".into())))?;
        let got = tx.txid();
        if got != txid {
            return Err(VerifierError::TxidMismatch {
                expected: txid,
                got,
            });
        }

        // inclusion proof for the cited transaction itself
        let proof = self.fetch_merkle(&txid, height).await?;
        let best = self.chain.best_chain();
        let header = self
            .chain
            .read_header(&best, proof.block_height)?
            .ok_or(MerkleError::MissingHeader(proof.block_height))?;
        verify_tx_in_block(&txid, &proof, &header)?;

        let output = tx
            .outputs
            .get(index as usize)
            .ok_or(VerifierError::MissingOutput { txid, index })?;
        let script = parse_asset_script(&output.script_pubkey)
            .map_err(|_| VerifierError::NotAMetadataScript)?
            .ok_or(VerifierError::NotAMetadataScript)?;

        let (name, amount, divisions, reissuable, content, is_reissue) = match &script {
            AssetScript::Issue(issue) => (
                &issue.name,
                issue.amount as i64,
                issue.divisions,
                issue.reissuable,
                issue.content.as_ref(),
                false,
            ),
            AssetScript::Reissue(reissue) => (
                &reissue.name,
                reissue.amount as i64,
                reissue.divisions,
                reissue.reissuable,
                reissue.content.as_ref(),
                true,
            ),
            _ => return Err(VerifierError::NotAMetadataScript),
        };
        if name != asset {
            return Err(VerifierError::WrongAsset {
                expected: asset.to_string(),
                got: name.clone(),
            });
        }

        if let Some(claimed) = expect.circulation {
            // a reissue only adds supply, so its amount bounds the
            // total from below rather than equalling it
            if is_reissue {
                if amount > claimed {
                    return Err(VerifierError::ReissueExceedsCirculation {
                        claimed,
                        reissued: amount,
                    });
                }
            } else if amount != claimed {
                return Err(VerifierError::MetadataMismatch("circulation"));
            }
        }
        if let Some(expected) = expect.divisions {
            if divisions != expected {
                return Err(VerifierError::MetadataMismatch("divisions"));
            }
        }
        if let Some(expected) = expect.reissuable {
            if reissuable != expected {
                return Err(VerifierError::MetadataMismatch("reissuable"));
            }
        }
        if let Some(expected) = expect.has_ipfs {
            if content.is_some() != expected {
                return Err(VerifierError::MetadataMismatch("has_ipfs"));
            }
        }
        if let Some(expected) = &expect.ipfs {
            let got = content.map(|c| c.to_vec());
            if got != *expected {
                return Err(VerifierError::MetadataMismatch("ipfs"));
            }
        }
        Ok(())
    }
}
