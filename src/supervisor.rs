//! Fan-in of all stream connections into one router.
//!
//! The supervisor owns one `StreamConnection` per configured endpoint, a
//! bounded fan-in channel, and the router task that deduplicates and
//! dispatches events: prices into the cache and risk engine, transactions
//! into the whale detector, wallet balances into arrival detection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::EndpointConfig;
use crate::decoder;
use crate::events::{BuySignal, PriceSource, PriceTick, StreamEvent, TransactionEvent};
use crate::info_async;
use crate::price_cache::{PriceCache, UpdateOutcome};
use crate::registry::SubscriptionRegistry;
use crate::risk::ReactiveRiskEngine;
use crate::stream::{ConnectionSnapshot, ConnectionStats, StreamConnection};
use crate::whale::WhaleSignalDetector;

const EVENT_QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Hard cap on remembered signatures.
    pub capacity: usize,
    /// Where a trim leaves the window. Trimming in batches keeps eviction off
    /// the per-event path.
    pub trim_to: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            trim_to: 5_000,
        }
    }
}

/// Cross-endpoint transaction dedup. Both endpoints deliver most
/// transactions; the first copy wins, the rest are counted and dropped.
pub struct DedupWindow {
    config: DedupConfig,
    seen: HashSet<Vec<u8>>,
    order: VecDeque<Vec<u8>>,
}

impl DedupWindow {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            seen: HashSet::with_capacity(config.capacity),
            order: VecDeque::with_capacity(config.capacity),
        }
    }

    /// True when the signature is new. This is the sole gate; callers never
    /// inspect the window directly.
    pub fn check_and_insert(&mut self, signature: &[u8]) -> bool {
        if self.seen.contains(signature) {
            return false;
        }
        self.seen.insert(signature.to_vec());
        self.order.push_back(signature.to_vec());
        if self.order.len() > self.config.capacity {
            while self.order.len() > self.config.trim_to {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Health view across every connection plus router-level counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub connections: Vec<ConnectionSnapshot>,
    pub duplicates_dropped: u64,
    pub events_routed: u64,
}

#[derive(Default)]
struct VaultPair {
    base: Option<u64>,
    quote: Option<u64>,
    decimals: u8,
}

pub struct StreamSupervisor {
    stats: Vec<Arc<ConnectionStats>>,
    duplicates: Arc<AtomicU64>,
    events_routed: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamSupervisor {
    /// Spawn one connection per endpoint plus the router. Returns a handle
    /// used for stats and shutdown.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        endpoints: Vec<EndpointConfig>,
        ping_interval: Duration,
        dedup: DedupConfig,
        registry: Arc<SubscriptionRegistry>,
        cache: Arc<PriceCache>,
        risk: Arc<ReactiveRiskEngine>,
        detector: WhaleSignalDetector,
        signal_tx: mpsc::Sender<BuySignal>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut stats = Vec::with_capacity(endpoints.len());
        let mut tasks = Vec::with_capacity(endpoints.len() + 1);

        for endpoint in endpoints {
            let connection_stats = Arc::new(ConnectionStats::new(Arc::clone(&endpoint.name)));
            stats.push(Arc::clone(&connection_stats));
            let connection = StreamConnection::new(
                endpoint,
                Arc::clone(&registry),
                event_tx.clone(),
                connection_stats,
                shutdown_rx.clone(),
                ping_interval,
            );
            tasks.push(tokio::spawn(connection.run()));
        }
        // Router's recv() returns None once every connection has stopped.
        drop(event_tx);

        let duplicates = Arc::new(AtomicU64::new(0));
        let events_routed = Arc::new(AtomicU64::new(0));
        let router = EventRouter {
            cache,
            risk,
            detector,
            dedup: DedupWindow::new(dedup),
            vault_pairs: HashMap::new(),
            wallet_balances: HashMap::new(),
            signal_tx,
            duplicates: Arc::clone(&duplicates),
            events_routed: Arc::clone(&events_routed),
        };
        tasks.push(tokio::spawn(router.run(event_rx, shutdown_rx)));

        Self {
            stats,
            duplicates,
            events_routed,
            shutdown_tx,
            tasks,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.stats.iter().map(|s| s.snapshot()).collect(),
            duplicates_dropped: self.duplicates.load(Ordering::Relaxed),
            events_routed: self.events_routed.load(Ordering::Relaxed),
        }
    }

    /// Signal every task and wait for all of them to finish.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("supervised task panicked: {err}");
                }
            }
        }
        info!("stream supervisor stopped");
    }
}

struct EventRouter {
    cache: Arc<PriceCache>,
    risk: Arc<ReactiveRiskEngine>,
    detector: WhaleSignalDetector,
    dedup: DedupWindow,
    /// Last seen balance per vault side, keyed by mint. A price needs both
    /// sides; until then the update is held.
    vault_pairs: HashMap<Pubkey, VaultPair>,
    /// Last known operator token balance per mint, for arrival detection.
    wallet_balances: HashMap<Pubkey, u64>,
    signal_tx: mpsc::Sender<BuySignal>,
    duplicates: Arc<AtomicU64>,
    events_routed: Arc<AtomicU64>,
}

impl EventRouter {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<StreamEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = event_rx.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
            }
        }
        debug!("event router stopped");
    }

    fn route(&mut self, event: StreamEvent) {
        self.events_routed.fetch_add(1, Ordering::Relaxed);
        match event {
            StreamEvent::Price(tick) => self.on_price(tick),
            StreamEvent::VaultBalance {
                mint,
                side,
                amount,
                decimals,
                slot,
                endpoint,
            } => {
                let pair = self.vault_pairs.entry(mint).or_default();
                pair.decimals = decimals;
                match side {
                    crate::events::VaultSide::Base => pair.base = Some(amount),
                    crate::events::VaultSide::Quote => pair.quote = Some(amount),
                }
                if let (Some(base), Some(quote)) = (pair.base, pair.quote) {
                    if let Some(price) = decoder::vault_pair_price(base, quote, decimals) {
                        self.on_price(PriceTick {
                            mint,
                            price,
                            source: PriceSource::Vault,
                            complete: false,
                            slot,
                            endpoint,
                        });
                    }
                }
            }
            StreamEvent::WalletBalance { mint, amount, .. } => {
                let previous = self.wallet_balances.insert(mint, amount).unwrap_or(0);
                if previous == 0 && amount > 0 {
                    // First tokens landed: the buy filled.
                    info_async!("tokens arrived | mint={mint} | amount={amount}");
                }
            }
            StreamEvent::Transaction(tx) => self.on_transaction(tx),
        }
    }

    fn on_price(&mut self, tick: PriceTick) {
        if self.cache.update(tick.mint, tick.price, tick.source) == UpdateOutcome::Stored {
            // Rejected anomalies never reach the risk engine.
            self.risk.on_price_tick(tick.mint, tick.price);
        }
    }

    fn on_transaction(&mut self, tx: TransactionEvent) {
        if !self.dedup.check_and_insert(&tx.signature) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(signal) = self.detector.observe(&tx) {
            info_async!(
                "whale buy | wallet={} | mint={} | size={:.3} SOL | sig={} | total_signals={}",
                signal.wallet,
                signal.mint,
                signal.size_sol,
                signal.signature,
                self.detector.signals_emitted()
            );
            // A full consumer means signals are going unread; dropping the
            // newest is the only option that keeps the router hot path free.
            if self.signal_tx.try_send(signal).is_err() {
                warn!("buy signal consumer lagging, signal dropped");
            }
        }
    }
}
