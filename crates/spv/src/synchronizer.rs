//! Keeps the wallet in step with the server's view of its addresses
//! and assets.
//!
//! Status digests make divergence detection cheap: the server pushes a
//! digest per address/asset, and only a mismatch against the locally
//! recomputed digest triggers a full history or metadata fetch. A
//! fetched result must reproduce the announced digest exactly; a
//! mismatch gets one bounded grace window (the server is expected to
//! push a corrected status) before the connection is declared broken.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use corvid_consensus::{hash_to_hex, Hash256};
use corvid_log::{log_debug, log_info};
use corvid_primitives::Transaction;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};

use crate::session::{AssetMetadata, HistoryItem, SessionError, SpvSession, StatusUpdate};
use crate::task::TaskGroup;
use crate::verifier::Verifier;
use crate::wallet::WalletState;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long a status/fetch mismatch may stay unresolved before the
/// server is treated as broken.
pub const STALE_GRACE: Duration = Duration::from_secs(30);

/// Digest over an ordered history, matching what servers announce:
/// sha256 of the concatenated `txid:height:` entries.
pub fn history_status(history: &[(Hash256, i32)]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let mut preimage = String::new();
    for (txid, height) in history {
        preimage.push_str(&hash_to_hex(txid));
        preimage.push(':');
        preimage.push_str(&height.to_string());
        preimage.push(':');
    }
    Some(hex::encode(Sha256::digest(preimage.as_bytes())))
}

/// Digest over the externally visible metadata fields.
pub fn asset_status(meta: &AssetMetadata) -> String {
    let mut preimage = format!(
        "{}{}{}{}",
        meta.circulation, meta.divisions, meta.reissuable, meta.has_ipfs
    );
    if meta.has_ipfs {
        if let Some(ipfs) = &meta.ipfs {
            preimage.push_str(&hex::encode(ipfs));
        }
    }
    hex::encode(Sha256::digest(preimage.as_bytes()))
}

#[derive(Debug)]
pub enum SyncError {
    Session(SessionError),
    TxidMismatch { expected: Hash256, got: Hash256 },
    StaleHistory(String),
    StaleMetadata(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Session(err) => write!(f, "{err}"),
            SyncError::TxidMismatch { expected, got } => write!(
                f,
                "received tx does not match expected txid ({} != {})",
                hash_to_hex(expected),
                hash_to_hex(got)
            ),
            SyncError::StaleHistory(addr) => {
                write!(f, "history for {addr} still stale after grace period")
            }
            SyncError::StaleMetadata(asset) => {
                write!(f, "metadata for {asset} still stale after grace period")
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl From<SessionError> for SyncError {
    fn from(err: SessionError) -> Self {
        SyncError::Session(err)
    }
}

#[derive(Default)]
struct SyncInner {
    requested_addrs: HashSet<String>,
    requested_assets: HashSet<String>,
    requested_histories: HashSet<(String, Option<String>)>,
    requested_metas: HashSet<(String, Option<String>)>,
    requested_txs: HashMap<Hash256, i32>,
    stale_histories: HashMap<String, Instant>,
    stale_metas: HashMap<String, Instant>,
    processed_notifications: bool,
}

impl SyncInner {
    fn idle(&self) -> bool {
        self.requested_addrs.is_empty()
            && self.requested_assets.is_empty()
            && self.requested_histories.is_empty()
            && self.requested_metas.is_empty()
            && self.requested_txs.is_empty()
            && self.stale_histories.is_empty()
            && self.stale_metas.is_empty()
    }
}

pub struct Synchronizer<S: SpvSession> {
    session: Arc<S>,
    wallet: Arc<WalletState>,
    verifier: Arc<Verifier<S>>,
    requests: Arc<Semaphore>,
    inner: Mutex<SyncInner>,
    addr_tx: mpsc::UnboundedSender<String>,
    asset_tx: mpsc::UnboundedSender<String>,
    queues: Mutex<Option<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedReceiver<String>)>>,
}

impl<S: SpvSession> Synchronizer<S> {
    pub fn new(
        session: Arc<S>,
        wallet: Arc<WalletState>,
        verifier: Arc<Verifier<S>>,
        requests: Arc<Semaphore>,
    ) -> Self {
        let (addr_tx, addr_rx) = mpsc::unbounded_channel();
        let (asset_tx, asset_rx) = mpsc::unbounded_channel();
        Self {
            session,
            wallet,
            verifier,
            requests,
            inner: Mutex::new(SyncInner::default()),
            addr_tx,
            asset_tx,
            queues: Mutex::new(Some((addr_rx, asset_rx))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncInner> {
        self.inner.lock().expect("synchronizer lock")
    }

    /// Queue an address for subscription. Idempotent.
    pub fn add_address(&self, address: &str) {
        self.wallet.watch_address(address);
        if self.lock().requested_addrs.insert(address.to_string()) {
            let _ = self.addr_tx.send(address.to_string());
        }
    }

    /// Queue an asset for subscription. Idempotent.
    pub fn add_asset(&self, asset: &str) {
        self.wallet.watch_asset(asset);
        if self.lock().requested_assets.insert(asset.to_string()) {
            let _ = self.asset_tx.send(asset.to_string());
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        self.lock().idle() && self.verifier.is_up_to_date()
    }

    /// Spawn the subscription, notification, and bookkeeping loops.
    pub fn start(self: &Arc<Self>, group: &TaskGroup) {
        let (addr_rx, asset_rx) = self
            .queues
            .lock()
            .expect("synchronizer queues")
            .take()
            .expect("synchronizer started twice");

        for address in self.wallet.watched_addresses() {
            self.add_address(&address);
        }
        for asset in self.wallet.watched_assets() {
            self.add_asset(&asset);
        }

        let sync = Arc::clone(self);
        group.spawn("sync-subscribe-addrs", async move {
            sync.subscribe_address_loop(addr_rx).await
        });
        let sync = Arc::clone(self);
        group.spawn("sync-subscribe-assets", async move {
            sync.subscribe_asset_loop(asset_rx).await
        });
        let sync = Arc::clone(self);
        let status_group = group.clone();
        group.spawn("sync-status", async move {
            sync.status_loop(status_group).await
        });
        let sync = Arc::clone(self);
        group.spawn("sync-tick", async move { sync.tick_loop().await });
    }

    async fn subscribe_address_loop(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), SyncError> {
        while let Some(address) = queue.recv().await {
            let status = {
                let _permit = self.requests.acquire().await.expect("semaphore open");
                self.session.subscribe_address(&address).await?
            };
            self.lock().requested_addrs.remove(&address);
            self.on_address_status(&address, status).await?;
        }
        Ok(())
    }

    async fn subscribe_asset_loop(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), SyncError> {
        while let Some(asset) = queue.recv().await {
            let status = {
                let _permit = self.requests.acquire().await.expect("semaphore open");
                self.session.subscribe_asset(&asset).await?
            };
            self.lock().requested_assets.remove(&asset);
            self.on_asset_status(&asset, status).await?;
        }
        Ok(())
    }

    async fn status_loop(self: Arc<Self>, group: TaskGroup) -> Result<(), SyncError> {
        loop {
            let update = self.session.next_status_update().await?;
            self.lock().processed_notifications = true;
            let sync = Arc::clone(&self);
            match update {
                StatusUpdate::Address { address, status } => {
                    group.spawn("sync-addr-status", async move {
                        sync.on_address_status(&address, status).await
                    });
                }
                StatusUpdate::Asset { asset, status } => {
                    group.spawn("sync-asset-status", async move {
                        sync.on_asset_status(&asset, status).await
                    });
                }
            }
        }
    }

    async fn on_address_status(
        &self,
        address: &str,
        status: Option<String>,
    ) -> Result<(), SyncError> {
        let local = self.wallet.get_address_history(address);
        if history_status(&local) == status {
            self.lock().stale_histories.remove(address);
            return Ok(());
        }
        let key = (address.to_string(), status.clone());
        {
            let mut inner = self.lock();
            // one fetch per announced status is enough
            if !inner.requested_histories.insert(key.clone()) {
                return Ok(());
            }
            inner.stale_histories.remove(address);
        }

        let result = {
            let _permit = self.requests.acquire().await.expect("semaphore open");
            self.session.get_history(address).await
        };
        let items = match result {
            Ok(items) => items,
            Err(err) => {
                self.lock().requested_histories.remove(&key);
                return Err(err.into());
            }
        };
        log_info!("receiving history {address} ({} entries)", items.len());
        let history: Vec<(Hash256, i32)> =
            items.iter().map(|item| (item.txid, item.height)).collect();

        if history_status(&history) != status {
            // a status push racing our fetch produces this naturally;
            // the corrected status should arrive within the grace
            log_info!("status mismatch for {address}, waiting for a corrected status");
            self.lock()
                .stale_histories
                .insert(address.to_string(), Instant::now());
        } else {
            self.lock().stale_histories.remove(address);
            self.wallet.receive_history(address, history);
            self.request_missing_txs(&items, false).await?;
        }
        self.lock().requested_histories.remove(&key);
        Ok(())
    }

    async fn on_asset_status(&self, asset: &str, status: Option<String>) -> Result<(), SyncError> {
        let local = self.wallet.get_asset_meta(asset);
        if local.as_ref().map(asset_status) == status {
            self.lock().stale_metas.remove(asset);
            return Ok(());
        }
        let key = (asset.to_string(), status.clone());
        {
            let mut inner = self.lock();
            if !inner.requested_metas.insert(key.clone()) {
                return Ok(());
            }
            inner.stale_metas.remove(asset);
        }

        let result = {
            let _permit = self.requests.acquire().await.expect("semaphore open");
            self.session.get_asset_metadata(asset).await
        };
        let meta = match result {
            Ok(meta) => meta,
            Err(err) => {
                self.lock().requested_metas.remove(&key);
                return Err(err.into());
            }
        };
        log_debug!("receiving asset metadata {asset}");

        match meta {
            Some(meta) if Some(asset_status(&meta)) == status => {
                self.lock().stale_metas.remove(asset);
                // digest equality is necessary but not sufficient; the
                // verifier re-derives the fields from chain data
                self.wallet.add_unverified_asset_meta(asset, meta);
            }
            _ => {
                log_info!("status mismatch for asset {asset}, waiting for a corrected status");
                self.lock()
                    .stale_metas
                    .insert(asset.to_string(), Instant::now());
            }
        }
        self.lock().requested_metas.remove(&key);
        Ok(())
    }

    /// Fetch transaction bodies the wallet does not hold yet.
    async fn request_missing_txs(
        &self,
        items: &[HistoryItem],
        allow_not_found: bool,
    ) -> Result<(), SyncError> {
        let mut wanted = Vec::new();
        {
            let mut inner = self.lock();
            for item in items {
                if inner.requested_txs.contains_key(&item.txid) {
                    continue;
                }
                if self.wallet.get_transaction(&item.txid).is_some() {
                    continue;
                }
                inner.requested_txs.insert(item.txid, item.height);
                wanted.push(item.txid);
            }
        }
        for txid in wanted {
            self.fetch_transaction(txid, allow_not_found).await?;
        }
        Ok(())
    }

    async fn fetch_transaction(&self, txid: Hash256, allow_not_found: bool) -> Result<(), SyncError> {
        let result = {
            let _permit = self.requests.acquire().await.expect("semaphore open");
            self.session.get_transaction(&txid).await
        };
        let raw = match result {
            Ok(raw) => raw,
            Err(SessionError::NotFound) if allow_not_found => {
                self.lock().requested_txs.remove(&txid);
                return Ok(());
            }
            Err(err) => {
                self.lock().requested_txs.remove(&txid);
                return Err(err.into());
            }
        };
        let tx = Transaction::parse(&raw)
            .map_err(|_| SyncError::Session(SessionError::Protocol("undecodable tx".into())))?;
        let got = tx.txid();
        if got != txid {
            return Err(SyncError::TxidMismatch {
                expected: txid,
                got,
            });
        }
        self.lock().requested_txs.remove(&txid);
        log_debug!("received tx {} ({} bytes)", hash_to_hex(&txid), raw.len());
        self.wallet.add_transaction(txid, tx);
        Ok(())
    }

    /// Periodic bookkeeping: escalate expired grace windows and push
    /// up-to-date transitions to the wallet.
    async fn tick_loop(self: Arc<Self>) -> Result<(), SyncError> {
        loop {
            tokio::time::sleep(TICK_INTERVAL).await;
            {
                let inner = self.lock();
                let now = Instant::now();
                for (address, since) in &inner.stale_histories {
                    if now.duration_since(*since) > STALE_GRACE {
                        return Err(SyncError::StaleHistory(address.clone()));
                    }
                }
                for (asset, since) in &inner.stale_metas {
                    if now.duration_since(*since) > STALE_GRACE {
                        return Err(SyncError::StaleMetadata(asset.clone()));
                    }
                }
            }
            let up_to_date = self.is_up_to_date();
            let processed = {
                let mut inner = self.lock();
                std::mem::take(&mut inner.processed_notifications)
            };
            if up_to_date != self.wallet.is_up_to_date() || (up_to_date && processed) {
                self.wallet.set_up_to_date(up_to_date);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_primitives::OutPoint;

    fn txid(tag: u8) -> Hash256 {
        let mut out = [0u8; 32];
        out[31] = tag;
        out
    }

    #[test]
    fn empty_history_has_no_status() {
        assert_eq!(history_status(&[]), None);
    }

    #[test]
    fn history_status_is_order_sensitive() {
        let a = vec![(txid(1), 10), (txid(2), 11)];
        let b = vec![(txid(2), 11), (txid(1), 10)];
        assert_ne!(history_status(&a), history_status(&b));
        assert_eq!(history_status(&a), history_status(&a.clone()));
    }

    #[test]
    fn history_status_depends_on_heights() {
        let a = vec![(txid(1), 10)];
        let b = vec![(txid(1), 11)];
        assert_ne!(history_status(&a), history_status(&b));
    }

    #[test]
    fn asset_status_covers_every_field() {
        let base = AssetMetadata {
            name: "COIN".into(),
            circulation: 1_000,
            is_owner: false,
            reissuable: true,
            divisions: 2,
            has_ipfs: false,
            ipfs: None,
            height: 5,
            divisions_height: None,
            ipfs_height: None,
            source: OutPoint::null(),
            divisions_source: None,
            ipfs_source: None,
        };
        let status = asset_status(&base);

        let mut changed = base.clone();
        changed.circulation += 1;
        assert_ne!(asset_status(&changed), status);

        let mut changed = base.clone();
        changed.divisions = 3;
        assert_ne!(asset_status(&changed), status);

        let mut changed = base.clone();
        changed.reissuable = false;
        assert_ne!(asset_status(&changed), status);

        let mut changed = base.clone();
        changed.has_ipfs = true;
        changed.ipfs = Some(vec![0xab; 34]);
        assert_ne!(asset_status(&changed), status);

        // provenance bookkeeping must not leak into the digest
        let mut changed = base.clone();
        changed.height = 99;
        changed.divisions_height = Some(4);
        assert_eq!(asset_status(&changed), status);
    }
}
