//! Wallet-side bookkeeping shared by the synchronizer and verifier.
//!
//! Tracks watched addresses and assets, their histories, transaction
//! bodies, and the verified/unverified split that drives proof
//! verification. Purely in-memory; persistence belongs to the caller.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use corvid_consensus::Hash256;
use corvid_primitives::Transaction;
use serde::{Deserialize, Serialize};

use crate::session::AssetMetadata;

/// Where and when a verified transaction was mined. The header hash
/// pins the proof to a concrete chain so reorgs can invalidate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMinedInfo {
    pub height: u32,
    pub timestamp: u32,
    pub txpos: u32,
    pub header_hash: Hash256,
}

/// A verified asset record together with the header hash seen at every
/// provenance height when its proofs were checked. Any anchor failing
/// to match the current chain sends the record back to unverified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedAssetMeta {
    pub meta: AssetMetadata,
    pub anchors: Vec<(u32, Hash256)>,
}

#[derive(Default)]
struct WalletInner {
    watched_addresses: Vec<String>,
    watched_assets: Vec<String>,
    address_history: HashMap<String, Vec<(Hash256, i32)>>,
    transactions: HashMap<Hash256, Transaction>,
    unverified_txs: HashMap<Hash256, u32>,
    verified_txs: HashMap<Hash256, TxMinedInfo>,
    unverified_assets: HashMap<String, AssetMetadata>,
    verified_assets: HashMap<String, VerifiedAssetMeta>,
    up_to_date: bool,
}

#[derive(Default)]
pub struct WalletState {
    inner: Mutex<WalletInner>,
}

impl WalletState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WalletInner> {
        self.inner.lock().expect("wallet lock")
    }

    pub fn watch_address(&self, address: &str) {
        let mut inner = self.lock();
        if !inner.watched_addresses.iter().any(|a| a == address) {
            inner.watched_addresses.push(address.to_string());
        }
    }

    pub fn watch_asset(&self, asset: &str) {
        let mut inner = self.lock();
        if !inner.watched_assets.iter().any(|a| a == asset) {
            inner.watched_assets.push(asset.to_string());
        }
    }

    pub fn watched_addresses(&self) -> Vec<String> {
        self.lock().watched_addresses.clone()
    }

    pub fn watched_assets(&self) -> Vec<String> {
        self.lock().watched_assets.clone()
    }

    pub fn get_address_history(&self, address: &str) -> Vec<(Hash256, i32)> {
        self.lock()
            .address_history
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Reconcile a freshly fetched history. Confirmed entries become
    /// verification candidates; entries that vanished from the server's
    /// view stay known locally but drop back to unverified.
    pub fn receive_history(&self, address: &str, history: Vec<(Hash256, i32)>) {
        let mut inner = self.lock();
        let old = inner
            .address_history
            .insert(address.to_string(), history.clone())
            .unwrap_or_default();
        for (txid, height) in &history {
            if *height > 0 {
                let height = *height as u32;
                let verified = inner.verified_txs.get(txid);
                if verified.map(|info| info.height) != Some(height) {
                    inner.verified_txs.remove(txid);
                    inner.unverified_txs.insert(*txid, height);
                }
            }
        }
        for (txid, _) in old {
            if !history.iter().any(|(t, _)| *t == txid) {
                inner.verified_txs.remove(&txid);
                inner.unverified_txs.remove(&txid);
            }
        }
    }

    pub fn get_transaction(&self, txid: &Hash256) -> Option<Transaction> {
        self.lock().transactions.get(txid).cloned()
    }

    pub fn add_transaction(&self, txid: Hash256, tx: Transaction) {
        self.lock().transactions.insert(txid, tx);
    }

    pub fn unverified_txs(&self) -> HashMap<Hash256, u32> {
        self.lock().unverified_txs.clone()
    }

    pub fn add_unverified_tx(&self, txid: Hash256, height: u32) {
        self.lock().unverified_txs.insert(txid, height);
    }

    /// The server revoked its height claim; forget the candidate.
    pub fn remove_unverified_tx(&self, txid: &Hash256) {
        self.lock().unverified_txs.remove(txid);
    }

    pub fn add_verified_tx(&self, txid: Hash256, info: TxMinedInfo) {
        let mut inner = self.lock();
        inner.unverified_txs.remove(&txid);
        inner.verified_txs.insert(txid, info);
    }

    pub fn get_verified_tx(&self, txid: &Hash256) -> Option<TxMinedInfo> {
        self.lock().verified_txs.get(txid).copied()
    }

    /// Re-check every verified transaction against the current chain;
    /// any whose pinned header no longer holds goes back to unverified.
    /// Returns the invalidated txids.
    pub fn undo_verifications(
        &self,
        still_valid: impl Fn(u32, &Hash256) -> bool,
    ) -> Vec<Hash256> {
        let mut inner = self.lock();
        let stale: Vec<Hash256> = inner
            .verified_txs
            .iter()
            .filter(|(_, info)| !still_valid(info.height, &info.header_hash))
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &stale {
            if let Some(info) = inner.verified_txs.remove(txid) {
                inner.unverified_txs.insert(*txid, info.height);
            }
        }
        stale
    }

    pub fn unverified_asset_metas(&self) -> HashMap<String, AssetMetadata> {
        self.lock().unverified_assets.clone()
    }

    pub fn add_unverified_asset_meta(&self, asset: &str, meta: AssetMetadata) {
        self.lock()
            .unverified_assets
            .insert(asset.to_string(), meta);
    }

    pub fn remove_unverified_asset_meta(&self, asset: &str) {
        self.lock().unverified_assets.remove(asset);
    }

    pub fn get_asset_meta(&self, asset: &str) -> Option<AssetMetadata> {
        self.lock()
            .verified_assets
            .get(asset)
            .map(|record| record.meta.clone())
    }

    pub fn add_verified_asset_meta(
        &self,
        asset: &str,
        meta: AssetMetadata,
        anchors: Vec<(u32, Hash256)>,
    ) {
        let mut inner = self.lock();
        inner.unverified_assets.remove(asset);
        inner
            .verified_assets
            .insert(asset.to_string(), VerifiedAssetMeta { meta, anchors });
    }

    /// Reorg handling for asset records, mirroring `undo_verifications`:
    /// every anchored provenance header must still sit on the chain, or
    /// the whole record drops back to unverified for a fresh walk.
    pub fn undo_asset_verifications(
        &self,
        still_valid: impl Fn(u32, &Hash256) -> bool,
    ) -> Vec<String> {
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .verified_assets
            .iter()
            .filter(|(_, record)| {
                record
                    .anchors
                    .iter()
                    .any(|(height, hash)| !still_valid(*height, hash))
            })
            .map(|(asset, _)| asset.clone())
            .collect();
        for asset in &stale {
            if let Some(record) = inner.verified_assets.remove(asset) {
                inner.unverified_assets.insert(asset.clone(), record.meta);
            }
        }
        stale
    }

    pub fn has_unverified(&self) -> bool {
        let inner = self.lock();
        !inner.unverified_txs.is_empty() || !inner.unverified_assets.is_empty()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.lock().up_to_date
    }

    pub fn set_up_to_date(&self, value: bool) -> bool {
        let mut inner = self.lock();
        let changed = inner.up_to_date != value;
        inner.up_to_date = value;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_primitives::OutPoint;

    fn txid(tag: u8) -> Hash256 {
        let mut out = [0u8; 32];
        out[0] = tag;
        out
    }

    fn meta(name: &str, height: u32) -> AssetMetadata {
        AssetMetadata {
            name: name.to_string(),
            circulation: 1_000,
            is_owner: false,
            reissuable: true,
            divisions: 0,
            has_ipfs: false,
            ipfs: None,
            height,
            divisions_height: None,
            ipfs_height: None,
            source: OutPoint::null(),
            divisions_source: None,
            ipfs_source: None,
        }
    }

    #[test]
    fn history_entries_become_verification_candidates() {
        let wallet = WalletState::new();
        wallet.receive_history("addr1", vec![(txid(1), 100), (txid(2), 0)]);
        let unverified = wallet.unverified_txs();
        assert_eq!(unverified.get(&txid(1)), Some(&100));
        assert!(!unverified.contains_key(&txid(2)), "mempool txs wait");
    }

    #[test]
    fn vanished_history_entries_drop_verification() {
        let wallet = WalletState::new();
        wallet.receive_history("addr1", vec![(txid(1), 100)]);
        wallet.add_verified_tx(
            txid(1),
            TxMinedInfo {
                height: 100,
                timestamp: 0,
                txpos: 0,
                header_hash: [9u8; 32],
            },
        );
        wallet.receive_history("addr1", vec![]);
        assert!(wallet.get_verified_tx(&txid(1)).is_none());
        assert!(wallet.unverified_txs().is_empty());
    }

    #[test]
    fn reverified_height_change_goes_back_to_unverified() {
        let wallet = WalletState::new();
        wallet.add_verified_tx(
            txid(1),
            TxMinedInfo {
                height: 100,
                timestamp: 0,
                txpos: 0,
                header_hash: [9u8; 32],
            },
        );
        // server now claims the tx at a different height
        wallet.receive_history("addr1", vec![(txid(1), 101)]);
        assert!(wallet.get_verified_tx(&txid(1)).is_none());
        assert_eq!(wallet.unverified_txs().get(&txid(1)), Some(&101));
    }

    #[test]
    fn undo_verifications_returns_invalidated_txids() {
        let wallet = WalletState::new();
        for (tag, height) in [(1u8, 10u32), (2, 20)] {
            wallet.add_verified_tx(
                txid(tag),
                TxMinedInfo {
                    height,
                    timestamp: 0,
                    txpos: 0,
                    header_hash: [tag; 32],
                },
            );
        }
        let stale = wallet.undo_verifications(|height, _| height <= 10);
        assert_eq!(stale, vec![txid(2)]);
        assert_eq!(wallet.unverified_txs().get(&txid(2)), Some(&20));
        assert!(wallet.get_verified_tx(&txid(1)).is_some());
    }

    #[test]
    fn asset_verification_moves_between_sets() {
        let wallet = WalletState::new();
        wallet.add_unverified_asset_meta("COIN", meta("COIN", 50));
        assert!(wallet.has_unverified());
        wallet.add_verified_asset_meta("COIN", meta("COIN", 50), vec![(50, [7u8; 32])]);
        assert!(!wallet.has_unverified());
        assert_eq!(wallet.get_asset_meta("COIN").unwrap().height, 50);

        let stale = wallet.undo_asset_verifications(|_, _| false);
        assert_eq!(stale, vec!["COIN".to_string()]);
        assert!(wallet.get_asset_meta("COIN").is_none());
        assert!(wallet.has_unverified());
    }

    #[test]
    fn asset_records_are_invalidated_by_anchor_hash_not_height() {
        let wallet = WalletState::new();
        // two records at the same heights; only KEEP's anchors still
        // match the chain, as after a reorg that replaced the blocks
        wallet.add_verified_asset_meta("KEEP", meta("KEEP", 50), vec![(50, [1u8; 32])]);
        wallet.add_verified_asset_meta(
            "DROP",
            meta("DROP", 50),
            vec![(50, [2u8; 32]), (60, [3u8; 32])],
        );

        let on_chain = |height: u32, hash: &Hash256| match height {
            50 => *hash == [1u8; 32],
            _ => false,
        };
        let stale = wallet.undo_asset_verifications(on_chain);
        assert_eq!(stale, vec!["DROP".to_string()]);
        assert!(wallet.get_asset_meta("KEEP").is_some());
        assert!(wallet.get_asset_meta("DROP").is_none());
        assert!(wallet.unverified_asset_metas().contains_key("DROP"));
    }

    #[test]
    fn up_to_date_reports_transitions() {
        let wallet = WalletState::new();
        assert!(!wallet.is_up_to_date());
        assert!(wallet.set_up_to_date(true));
        assert!(!wallet.set_up_to_date(true));
        assert!(wallet.is_up_to_date());
    }
}
