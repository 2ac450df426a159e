//! Single source of truth for which on-chain addresses the streams watch.
//!
//! Every mutation rebuilds the declarative subscribe request and publishes it
//! on a watch channel; live connections re-send it on the open stream, so an
//! address added mid-run starts producing pushes within one round trip
//! instead of on the next reconnect.

use crate::events::VaultSide;
use solana_sdk::{pubkey, pubkey::Pubkey};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use yellowstone_grpc_proto::geyser::{
    SubscribeRequestFilterAccounts, SubscribeRequestFilterTransactions,
};
use yellowstone_grpc_proto::prelude::{CommitmentLevel, SubscribeRequest};

pub const PUMP_FUN_PROGRAM: Pubkey = pubkey!("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P");

/// Bonding-curve PDA for a mint. Lets a buy observed on the transaction
/// stream start a curve watch without knowing the curve address up front.
pub fn curve_address(mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[b"bonding-curve", mint.as_ref()], &PUMP_FUN_PROGRAM).0
}

/// What a watched address means when an update for it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Curve,
    Vault(VaultSide),
    WalletAccount,
}

/// Resolution of an inbound account address back to the mint it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedWatch {
    pub mint: Pubkey,
    pub kind: WatchKind,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default)]
struct MintWatch {
    curve: Option<Pubkey>,
    vaults: Option<(Pubkey, Pubkey)>,
    wallet_account: Option<Pubkey>,
    decimals: u8,
}

#[derive(Default)]
struct Inner {
    watches: HashMap<Pubkey, MintWatch>,
    /// address -> (mint, kind). Kept in lockstep with `watches` so resolution
    /// is always unambiguous.
    reverse: HashMap<Pubkey, (Pubkey, WatchKind)>,
    wallet_set: Vec<Pubkey>,
}

pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
    request_tx: watch::Sender<SubscribeRequest>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let inner = Inner::default();
        let (request_tx, _) = watch::channel(build_request(&inner));
        Self {
            inner: Mutex::new(inner),
            request_tx,
        }
    }

    /// Receiver handed to each stream connection. Connections observe
    /// changes and re-send the request on the open stream.
    pub fn request_rx(&self) -> watch::Receiver<SubscribeRequest> {
        self.request_tx.subscribe()
    }

    /// Current declarative snapshot, used as the first outbound message on a
    /// fresh connection.
    pub fn current_request(&self) -> SubscribeRequest {
        self.request_tx.borrow().clone()
    }

    pub fn add_curve_watch(&self, mint: Pubkey, curve: Pubkey, decimals: u8) {
        self.mutate(|inner| {
            let watch = inner.watches.entry(mint).or_default();
            if let Some(old) = watch.curve.replace(curve) {
                inner.reverse.remove(&old);
            }
            watch.decimals = decimals;
            inner.reverse.insert(curve, (mint, WatchKind::Curve));
        });
    }

    pub fn remove_curve_watch(&self, mint: &Pubkey) {
        self.mutate(|inner| {
            if let Some(watch) = inner.watches.get_mut(mint) {
                if let Some(curve) = watch.curve.take() {
                    inner.reverse.remove(&curve);
                }
            }
            prune(inner, mint);
        });
    }

    pub fn add_vault_watch(&self, mint: Pubkey, base_vault: Pubkey, quote_vault: Pubkey, decimals: u8) {
        self.mutate(|inner| {
            let watch = inner.watches.entry(mint).or_default();
            if let Some((old_base, old_quote)) = watch.vaults.replace((base_vault, quote_vault)) {
                inner.reverse.remove(&old_base);
                inner.reverse.remove(&old_quote);
            }
            watch.decimals = decimals;
            inner
                .reverse
                .insert(base_vault, (mint, WatchKind::Vault(VaultSide::Base)));
            inner
                .reverse
                .insert(quote_vault, (mint, WatchKind::Vault(VaultSide::Quote)));
        });
    }

    pub fn remove_vault_watch(&self, mint: &Pubkey) {
        self.mutate(|inner| {
            if let Some(watch) = inner.watches.get_mut(mint) {
                if let Some((base, quote)) = watch.vaults.take() {
                    inner.reverse.remove(&base);
                    inner.reverse.remove(&quote);
                }
            }
            prune(inner, mint);
        });
    }

    pub fn add_wallet_watch(&self, mint: Pubkey, token_account: Pubkey, decimals: u8) {
        self.mutate(|inner| {
            let watch = inner.watches.entry(mint).or_default();
            if let Some(old) = watch.wallet_account.replace(token_account) {
                inner.reverse.remove(&old);
            }
            watch.decimals = decimals;
            inner
                .reverse
                .insert(token_account, (mint, WatchKind::WalletAccount));
        });
    }

    pub fn remove_wallet_watch(&self, mint: &Pubkey) {
        self.mutate(|inner| {
            if let Some(watch) = inner.watches.get_mut(mint) {
                if let Some(account) = watch.wallet_account.take() {
                    inner.reverse.remove(&account);
                }
            }
            prune(inner, mint);
        });
    }

    /// Tracked-actor wallets, watched for every mint. Replaces the whole set.
    pub fn set_wallet_set(&self, wallets: Vec<Pubkey>) {
        self.mutate(|inner| inner.wallet_set = wallets);
    }

    /// Resolve an inbound account address back to a single mint.
    pub fn resolve(&self, address: &Pubkey) -> Option<ResolvedWatch> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let (mint, kind) = *inner.reverse.get(address)?;
        let decimals = inner.watches.get(&mint).map(|w| w.decimals).unwrap_or(6);
        Some(ResolvedWatch {
            mint,
            kind,
            decimals,
        })
    }

    pub fn watched_account_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").reverse.len()
    }

    /// Mutate-rebuild-publish as one atomic step with respect to other
    /// subscribe calls; concurrent additions cannot lose each other's
    /// addresses.
    fn mutate<F: FnOnce(&mut Inner)>(&self, f: F) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        f(&mut inner);
        let request = build_request(&inner);
        drop(inner);
        // send_replace delivers even with zero live connections.
        self.request_tx.send_replace(request);
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(inner: &mut Inner, mint: &Pubkey) {
    if let Some(watch) = inner.watches.get(mint) {
        if watch.curve.is_none() && watch.vaults.is_none() && watch.wallet_account.is_none() {
            inner.watches.remove(mint);
        }
    }
}

fn build_request(inner: &Inner) -> SubscribeRequest {
    let mut accounts = HashMap::new();
    let watched: Vec<String> = inner.reverse.keys().map(|k| k.to_string()).collect();
    if !watched.is_empty() {
        accounts.insert(
            "watches".to_owned(),
            SubscribeRequestFilterAccounts {
                account: watched,
                owner: vec![],
                filters: vec![],
                nonempty_txn_signature: None,
            },
        );
    }

    let mut transactions = HashMap::new();
    if !inner.wallet_set.is_empty() {
        transactions.insert(
            "tracked-wallets".to_owned(),
            SubscribeRequestFilterTransactions {
                vote: Some(false),
                failed: Some(false),
                account_include: inner.wallet_set.iter().map(|w| w.to_string()).collect(),
                account_exclude: vec![],
                account_required: vec![],
                signature: None,
            },
        );
    }

    SubscribeRequest {
        accounts,
        slots: HashMap::default(),
        transactions,
        transactions_status: HashMap::default(),
        blocks: HashMap::default(),
        blocks_meta: HashMap::default(),
        entry: HashMap::default(),
        // Least-finalized commitment: latency beats finality for exits.
        commitment: Some(CommitmentLevel::Processed as i32),
        accounts_data_slice: Vec::default(),
        ping: None,
        from_slot: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(byte: u8) -> Pubkey {
        Pubkey::from([byte; 32])
    }

    #[test]
    fn resolve_round_trip() {
        let registry = SubscriptionRegistry::new();
        registry.add_curve_watch(pk(1), pk(2), 6);
        registry.add_vault_watch(pk(1), pk(3), pk(4), 6);

        let resolved = registry.resolve(&pk(2)).unwrap();
        assert_eq!(resolved.mint, pk(1));
        assert_eq!(resolved.kind, WatchKind::Curve);

        let resolved = registry.resolve(&pk(3)).unwrap();
        assert_eq!(resolved.kind, WatchKind::Vault(VaultSide::Base));
        let resolved = registry.resolve(&pk(4)).unwrap();
        assert_eq!(resolved.kind, WatchKind::Vault(VaultSide::Quote));

        assert!(registry.resolve(&pk(9)).is_none());
    }

    #[test]
    fn replacing_curve_watch_drops_old_mapping() {
        let registry = SubscriptionRegistry::new();
        registry.add_curve_watch(pk(1), pk(2), 6);
        registry.add_curve_watch(pk(1), pk(5), 6);

        assert!(registry.resolve(&pk(2)).is_none());
        assert_eq!(registry.resolve(&pk(5)).unwrap().mint, pk(1));
        assert_eq!(registry.watched_account_count(), 1);
    }

    #[test]
    fn removal_unsubscribes_addresses() {
        let registry = SubscriptionRegistry::new();
        registry.add_curve_watch(pk(1), pk(2), 6);
        registry.add_wallet_watch(pk(1), pk(6), 6);
        registry.remove_curve_watch(&pk(1));

        assert!(registry.resolve(&pk(2)).is_none());
        // Wallet watch for the same mint survives.
        assert!(registry.resolve(&pk(6)).is_some());

        registry.remove_wallet_watch(&pk(1));
        assert_eq!(registry.watched_account_count(), 0);
    }

    #[test]
    fn mutations_publish_fresh_request() {
        let registry = SubscriptionRegistry::new();
        let rx = registry.request_rx();

        registry.add_curve_watch(pk(1), pk(2), 6);
        let request = rx.borrow().clone();
        let filter = request.accounts.get("watches").unwrap();
        assert_eq!(filter.account, vec![pk(2).to_string()]);

        registry.set_wallet_set(vec![pk(7), pk(8)]);
        let request = rx.borrow().clone();
        let txs = request.transactions.get("tracked-wallets").unwrap();
        assert_eq!(txs.account_include.len(), 2);
        assert_eq!(txs.vote, Some(false));
    }

    #[test]
    fn curve_address_is_deterministic_per_mint() {
        let mint_a = Pubkey::new_unique();
        let mint_b = Pubkey::new_unique();
        assert_eq!(curve_address(&mint_a), curve_address(&mint_a));
        assert_ne!(curve_address(&mint_a), curve_address(&mint_b));

        // A buy signal mint resolves back through the registry once watched.
        let registry = SubscriptionRegistry::new();
        registry.add_curve_watch(mint_a, curve_address(&mint_a), 6);
        let resolved = registry.resolve(&curve_address(&mint_a)).unwrap();
        assert_eq!(resolved.mint, mint_a);
        assert_eq!(resolved.kind, WatchKind::Curve);
    }

    #[test]
    fn empty_registry_builds_empty_filters() {
        let registry = SubscriptionRegistry::new();
        let request = registry.current_request();
        assert!(request.accounts.is_empty());
        assert!(request.transactions.is_empty());
        assert_eq!(request.commitment, Some(CommitmentLevel::Processed as i32));
    }
}
