//! One bidirectional Geyser subscription to one endpoint.
//!
//! Connect, authenticate, send the current subscription request, run a
//! keepalive ping loop, consume inbound frames, reconnect with classified
//! backoff on failure. Decode and transport errors are handled here and
//! never reach the risk engine - downstream only ever sees valid events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{sink::SinkExt, stream::StreamExt, Sink};
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tonic::transport::channel::ClientTlsConfig;
use yellowstone_grpc_client::{GeyserGrpcClient, Interceptor};
use yellowstone_grpc_proto::prelude::{
    subscribe_update::UpdateOneof, SubscribeRequest, SubscribeRequestPing, SubscribeUpdate,
    SubscribeUpdateAccount, SubscribeUpdateTransaction,
};

use crate::config::EndpointConfig;
use crate::decoder::{self, DecodeError};
use crate::events::{PriceSource, PriceTick, StreamEvent, TokenBalanceDelta, TransactionEvent};
use crate::registry::{SubscriptionRegistry, WatchKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DECODING_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// Keepalive queue depth. A full queue drops the ping instead of blocking
/// the stream loop.
const OUTBOUND_QUEUE_DEPTH: usize = 32;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("stream closed by remote")]
    Closed,
    #[error("downstream receiver dropped")]
    Shutdown,
}

/// How the reconnect loop should wait after a given failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Doubling ladder, capped.
    Exponential,
    /// "Stream reset by peer" is frequent and transient: fast fixed retry
    /// that leaves the exponential counter untouched.
    FastReset,
    /// Retrying a rejected credential immediately cannot succeed.
    AuthCooldown,
}

pub fn classify(err: &StreamError) -> RetryClass {
    match err {
        StreamError::Auth(_) => RetryClass::AuthCooldown,
        StreamError::Transport(msg) | StreamError::Connect(msg)
            if msg.to_ascii_lowercase().contains("reset") =>
        {
            RetryClass::FastReset
        }
        _ => RetryClass::Exponential,
    }
}

/// Reconnect backoff state for one connection.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
    reset_delay: Duration,
    auth_delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            reset_delay: Duration::from_millis(500),
            auth_delay: Duration::from_secs(30),
        }
    }

    pub fn delay_for(&mut self, class: RetryClass) -> Duration {
        match class {
            RetryClass::Exponential => {
                let delay = self
                    .base
                    .saturating_mul(1u32 << self.attempt.min(5))
                    .min(self.cap);
                self.attempt = self.attempt.saturating_add(1);
                delay
            }
            RetryClass::FastReset => self.reset_delay,
            RetryClass::AuthCooldown => self.auth_delay,
        }
    }

    /// Called once a subscription is established again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Authenticating,
    Subscribed,
    Streaming,
    Error,
}

/// Per-connection counters, read by the stats snapshot.
pub struct ConnectionStats {
    name: Arc<str>,
    messages: AtomicU64,
    reconnects: AtomicU64,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    last_pong_epoch_ms: AtomicU64,
}

impl ConnectionStats {
    pub fn new(name: Arc<str>) -> Self {
        Self {
            name,
            messages: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
            last_pong_epoch_ms: AtomicU64::new(0),
        }
    }

    fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_pong(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_pong_epoch_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let last_pong_ms = self.last_pong_epoch_ms.load(Ordering::Relaxed);
        let last_pong_age = if last_pong_ms == 0 {
            None
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|now| now.as_millis().saturating_sub(last_pong_ms as u128) as u64)
                .map(Duration::from_millis)
        };
        ConnectionSnapshot {
            name: Arc::clone(&self.name),
            messages: self.messages.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pongs_received: self.pongs_received.load(Ordering::Relaxed),
            last_pong_age,
        }
    }
}

/// Point-in-time view of one connection's health. Pong age is a liveness
/// signal for an external watchdog, not a reconnect trigger.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub name: Arc<str>,
    pub messages: u64,
    pub reconnects: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub last_pong_age: Option<Duration>,
}

enum OutboundFrame {
    Ping(i32),
    /// Sentinel so the queue consumer observes shutdown instead of blocking.
    Shutdown,
}

pub struct StreamConnection {
    endpoint: EndpointConfig,
    registry: Arc<SubscriptionRegistry>,
    request_rx: watch::Receiver<SubscribeRequest>,
    event_tx: mpsc::Sender<StreamEvent>,
    stats: Arc<ConnectionStats>,
    shutdown_rx: watch::Receiver<bool>,
    ping_interval: Duration,
    state: ConnState,
}

impl StreamConnection {
    pub fn new(
        endpoint: EndpointConfig,
        registry: Arc<SubscriptionRegistry>,
        event_tx: mpsc::Sender<StreamEvent>,
        stats: Arc<ConnectionStats>,
        shutdown_rx: watch::Receiver<bool>,
        ping_interval: Duration,
    ) -> Self {
        let request_rx = registry.request_rx();
        Self {
            endpoint,
            registry,
            request_rx,
            event_tx,
            stats,
            shutdown_rx,
            ping_interval,
            state: ConnState::Connecting,
        }
    }

    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn set_state(&mut self, next: ConnState) {
        if self.state != next {
            debug!("[{}] {:?} -> {:?}", self.name(), self.state, next);
            self.state = next;
        }
    }

    /// Connect/stream/reconnect loop. Runs until shutdown is signalled.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match self.run_once(&mut backoff).await {
                Ok(()) => break,
                Err(StreamError::Shutdown) => break,
                Err(err) => {
                    self.set_state(ConnState::Error);
                    let delay = backoff.delay_for(classify(&err));
                    self.stats.record_reconnect();
                    warn!(
                        "[{}] stream failed: {err}; reconnecting in {:.1}s",
                        self.name(),
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown_rx.changed() => break,
                    }
                }
            }
        }
        info!("[{}] connection stopped", self.name());
    }

    async fn run_once(&mut self, backoff: &mut Backoff) -> StreamResult<()> {
        self.set_state(ConnState::Connecting);
        let mut client = self.connect().await?;

        self.set_state(ConnState::Subscribed);
        // Snapshot the declarative request; later registry mutations arrive
        // through the watch channel without a reconnect.
        let request = self.request_rx.borrow_and_update().clone();
        let (mut sink, mut stream) = client
            .subscribe_with_request(Some(request))
            .await
            .map_err(|e| map_client_error(e.to_string()))?;
        backoff.reset();

        info!(
            "[{}] streaming | watched_accounts={}",
            self.name(),
            self.registry.watched_account_count()
        );
        self.set_state(ConnState::Streaming);

        let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let ping_task = spawn_ping_loop(out_tx.clone(), self.ping_interval);

        let result = self.stream_loop(&mut sink, &mut stream, &mut out_rx).await;

        // The ping task must die before the transport: a leaked timer would
        // write into a closed channel on the next tick.
        ping_task.abort();
        let _ = ping_task.await;
        let _ = out_tx.try_send(OutboundFrame::Shutdown);

        result
    }

    async fn stream_loop<S, St>(
        &mut self,
        sink: &mut S,
        stream: &mut St,
        out_rx: &mut mpsc::Receiver<OutboundFrame>,
    ) -> StreamResult<()>
    where
        S: Sink<SubscribeRequest> + Unpin,
        S::Error: std::fmt::Display,
        St: futures::Stream<Item = Result<SubscribeUpdate, tonic::Status>> + Unpin,
    {
        let mut request_rx = self.request_rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                changed = request_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let request = request_rx.borrow_and_update().clone();
                    sink.send(request)
                        .await
                        .map_err(|e| StreamError::Transport(e.to_string()))?;
                    debug!("[{}] re-subscribed with updated watch set", self.name());
                }
                Some(frame) = out_rx.recv() => match frame {
                    OutboundFrame::Ping(id) => {
                        sink.send(ping_request(id))
                            .await
                            .map_err(|e| StreamError::Transport(e.to_string()))?;
                        self.stats.record_ping();
                    }
                    OutboundFrame::Shutdown => return Ok(()),
                },
                message = stream.next() => match message {
                    Some(Ok(update)) => self.handle_update(update, sink).await?,
                    Some(Err(status)) => return Err(map_status(status)),
                    None => return Err(StreamError::Closed),
                },
            }
        }
    }

    async fn handle_update<S>(&self, update: SubscribeUpdate, sink: &mut S) -> StreamResult<()>
    where
        S: Sink<SubscribeRequest> + Unpin,
        S::Error: std::fmt::Display,
    {
        self.stats.record_message();
        match update.update_oneof {
            Some(UpdateOneof::Account(account)) => self.handle_account(account).await,
            Some(UpdateOneof::Transaction(tx)) => self.handle_transaction(tx).await,
            Some(UpdateOneof::Ping(_)) => {
                // Remote ping: pong back on the same outbound half in the
                // same tick, no separate round trip.
                sink.send(ping_request(1))
                    .await
                    .map_err(|e| StreamError::Transport(e.to_string()))?;
                Ok(())
            }
            Some(UpdateOneof::Pong(_)) => {
                // Best-effort keepalive: the id is not correlated.
                self.stats.record_pong();
                Ok(())
            }
            None => {
                error!("[{}] update missing payload", self.name());
                Err(StreamError::Transport("empty update".to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn handle_account(&self, update: SubscribeUpdateAccount) -> StreamResult<()> {
        let slot = update.slot;
        let Some(info) = update.account else {
            return Ok(());
        };
        let Ok(address) = Pubkey::try_from(info.pubkey.as_slice()) else {
            warn!("[{}] account update with malformed pubkey", self.name());
            return Ok(());
        };
        // Unknown address: a watch removed while updates were in flight.
        let Some(resolved) = self.registry.resolve(&address) else {
            return Ok(());
        };

        let endpoint: Arc<str> = Arc::clone(&self.endpoint.name);
        let event = match resolved.kind {
            WatchKind::Curve => match decoder::decode_curve(&info.data) {
                Ok(state) => match state.price(resolved.decimals) {
                    Some(price) => StreamEvent::Price(PriceTick {
                        mint: resolved.mint,
                        price,
                        source: PriceSource::Curve,
                        complete: state.complete,
                        slot,
                        endpoint,
                    }),
                    None => {
                        debug!(
                            "[{}] curve for {} has zero reserves, no price",
                            self.name(),
                            resolved.mint
                        );
                        return Ok(());
                    }
                },
                // Malformed account: drop this single update and keep going.
                Err(DecodeError::MalformedAccount { expected, actual }) => {
                    warn!(
                        "[{}] malformed curve account for {} ({actual} < {expected} bytes)",
                        self.name(),
                        resolved.mint
                    );
                    return Ok(());
                }
            },
            WatchKind::Vault(side) => match decoder::decode_token_account_amount(&info.data) {
                Ok(amount) => StreamEvent::VaultBalance {
                    mint: resolved.mint,
                    side,
                    amount,
                    decimals: resolved.decimals,
                    slot,
                    endpoint,
                },
                Err(err) => {
                    warn!(
                        "[{}] malformed vault account for {}: {err}",
                        self.name(),
                        resolved.mint
                    );
                    return Ok(());
                }
            },
            WatchKind::WalletAccount => match decoder::decode_token_account_amount(&info.data) {
                Ok(amount) => StreamEvent::WalletBalance {
                    mint: resolved.mint,
                    amount,
                    slot,
                    endpoint,
                },
                Err(err) => {
                    warn!(
                        "[{}] malformed wallet token account for {}: {err}",
                        self.name(),
                        resolved.mint
                    );
                    return Ok(());
                }
            },
        };

        self.event_tx
            .send(event)
            .await
            .map_err(|_| StreamError::Shutdown)
    }

    async fn handle_transaction(&self, update: SubscribeUpdateTransaction) -> StreamResult<()> {
        let Some(event) = summarize_transaction(&update, Arc::clone(&self.endpoint.name)) else {
            return Ok(());
        };
        self.event_tx
            .send(StreamEvent::Transaction(event))
            .await
            .map_err(|_| StreamError::Shutdown)
    }

    async fn connect(&mut self) -> StreamResult<GeyserGrpcClient<impl Interceptor>> {
        let mut builder = GeyserGrpcClient::build_from_shared(self.endpoint.endpoint.clone())
            .map_err(|e| StreamError::Connect(e.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| StreamError::Connect(e.to_string()))?
            .max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE)
            .tcp_nodelay(true);

        // Credential rides on every request, so rotation never needs a
        // reconnect.
        if let Some(token) = self.endpoint.x_token.clone() {
            self.set_state(ConnState::Authenticating);
            builder = builder
                .x_token(Some(token))
                .map_err(|e| StreamError::Auth(e.to_string()))?;
        }

        builder
            .connect()
            .await
            .map_err(|e| map_client_error(e.to_string()))
    }
}

fn ping_request(id: i32) -> SubscribeRequest {
    SubscribeRequest {
        ping: Some(SubscribeRequestPing { id }),
        ..Default::default()
    }
}

fn map_status(status: tonic::Status) -> StreamError {
    match status.code() {
        tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
            StreamError::Auth(status.message().to_owned())
        }
        _ => StreamError::Transport(status.message().to_owned()),
    }
}

fn map_client_error(message: String) -> StreamError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("unauthenticated")
        || lowered.contains("permission denied")
        || lowered.contains("401")
    {
        StreamError::Auth(message)
    } else {
        StreamError::Connect(message)
    }
}

/// Keepalive timer, independent of remote activity. Pings with a
/// monotonically increasing id; drops the ping if the queue is full.
fn spawn_ping_loop(out_tx: mpsc::Sender<OutboundFrame>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so pings start one interval in.
        ticker.tick().await;
        let mut id: i32 = 0;
        loop {
            ticker.tick().await;
            id = id.wrapping_add(1);
            match out_tx.try_send(OutboundFrame::Ping(id)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Stream loop is saturated; skipping one keepalive is
                    // harmless.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    })
}

/// Reduce a transaction update to the summary the whale detector needs,
/// merging pre/post token balances into per-owner deltas.
pub fn summarize_transaction(
    update: &SubscribeUpdateTransaction,
    endpoint: Arc<str>,
) -> Option<TransactionEvent> {
    let tx_info = update.transaction.as_ref()?;
    if tx_info.signature.is_empty() {
        return None;
    }

    let meta = tx_info.meta.as_ref();
    let failed = meta.map(|m| m.err.is_some()).unwrap_or(false);

    let fee_payer = tx_info
        .transaction
        .as_ref()
        .and_then(|t| t.message.as_ref())
        .and_then(|m| m.account_keys.first())
        .and_then(|k| Pubkey::try_from(k.as_slice()).ok());

    let lamports_spent = meta
        .map(|m| {
            let pre = m.pre_balances.first().copied().unwrap_or(0);
            let post = m.post_balances.first().copied().unwrap_or(0);
            pre as i64 - post as i64
        })
        .unwrap_or(0);

    let mut merged: HashMap<(Pubkey, Pubkey), TokenBalanceDelta> = HashMap::new();
    if let Some(meta) = meta {
        for pre in &meta.pre_token_balances {
            let Some((owner, mint, amount, decimals)) = parse_token_balance(pre) else {
                continue;
            };
            let entry = merged
                .entry((owner, mint))
                .or_insert_with(|| TokenBalanceDelta {
                    owner,
                    mint,
                    pre_amount: 0,
                    post_amount: 0,
                    decimals,
                });
            entry.pre_amount = amount;
            entry.decimals = decimals;
        }
        for post in &meta.post_token_balances {
            let Some((owner, mint, amount, decimals)) = parse_token_balance(post) else {
                continue;
            };
            let entry = merged
                .entry((owner, mint))
                .or_insert_with(|| TokenBalanceDelta {
                    owner,
                    mint,
                    pre_amount: 0,
                    post_amount: 0,
                    decimals,
                });
            entry.post_amount = amount;
            entry.decimals = decimals;
        }
    }

    let balance_deltas: SmallVec<[TokenBalanceDelta; 4]> = merged.into_values().collect();

    Some(TransactionEvent {
        signature: tx_info.signature.clone(),
        fee_payer,
        lamports_spent,
        balance_deltas,
        failed,
        slot: update.slot,
        endpoint,
    })
}

fn parse_token_balance(
    balance: &yellowstone_grpc_proto::prelude::TokenBalance,
) -> Option<(Pubkey, Pubkey, u64, u8)> {
    let owner = balance.owner.parse::<Pubkey>().ok()?;
    let mint = balance.mint.parse::<Pubkey>().ok()?;
    let ui = balance.ui_token_amount.as_ref()?;
    let amount = ui.amount.parse::<u64>().ok()?;
    let decimals = ui.decimals.min(u32::from(u8::MAX)) as u8;
    Some((owner, mint, amount, decimals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use yellowstone_grpc_proto::prelude::{
        Message, SubscribeUpdatePing, SubscribeUpdateTransactionInfo, TokenBalance, Transaction,
        TransactionStatusMeta, UiTokenAmount,
    };

    /// Outbound half that records every request instead of sending it.
    #[derive(Default)]
    struct CapturingSink {
        sent: Vec<SubscribeRequest>,
    }

    impl Sink<SubscribeRequest> for CapturingSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: SubscribeRequest) -> Result<(), Self::Error> {
            self.get_mut().sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn connection(
        registry: Arc<SubscriptionRegistry>,
    ) -> (
        StreamConnection,
        watch::Sender<bool>,
        mpsc::Receiver<StreamEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(ConnectionStats::new(Arc::from("test")));
        let conn = StreamConnection::new(
            EndpointConfig {
                name: Arc::from("test"),
                endpoint: "https://localhost:10000".to_owned(),
                x_token: None,
            },
            registry,
            event_tx,
            stats,
            shutdown_rx,
            Duration::from_secs(30),
        );
        (conn, shutdown_tx, event_rx)
    }

    #[tokio::test]
    async fn remote_ping_is_answered_on_the_same_sink() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (mut conn, _shutdown_tx, _event_rx) = connection(registry);

        let updates: Vec<Result<SubscribeUpdate, tonic::Status>> = vec![Ok(SubscribeUpdate {
            update_oneof: Some(UpdateOneof::Ping(SubscribeUpdatePing {})),
            ..Default::default()
        })];
        let mut sink = CapturingSink::default();
        let mut stream = futures::stream::iter(updates);
        let (_out_tx, mut out_rx) = mpsc::channel(4);

        // The scripted stream ends after the ping, which reads as a remote
        // close.
        let result = conn.stream_loop(&mut sink, &mut stream, &mut out_rx).await;
        assert!(matches!(result, Err(StreamError::Closed)));

        // The pong went out on the same sink, within the same iteration.
        assert_eq!(sink.sent.len(), 1);
        assert_eq!(sink.sent[0].ping, Some(SubscribeRequestPing { id: 1 }));
    }

    #[tokio::test]
    async fn watch_change_and_keepalive_go_out_on_the_open_stream() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (mut conn, shutdown_tx, _event_rx) = connection(Arc::clone(&registry));

        let (out_tx, mut out_rx) = mpsc::channel(4);
        out_tx.try_send(OutboundFrame::Ping(3)).unwrap();

        let task = tokio::spawn(async move {
            let mut sink = CapturingSink::default();
            let mut stream = futures::stream::pending::<Result<SubscribeUpdate, tonic::Status>>();
            let result = conn.stream_loop(&mut sink, &mut stream, &mut out_rx).await;
            (result, sink.sent)
        });

        // A registry mutation while the stream is live must be re-sent
        // inline, without a reconnect.
        registry.add_curve_watch(Pubkey::new_unique(), Pubkey::new_unique(), 6);
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send_replace(true);

        let (result, sent) = task.await.unwrap();
        assert!(result.is_ok());
        assert!(sent
            .iter()
            .any(|r| r.ping == Some(SubscribeRequestPing { id: 3 })));
        assert!(sent.iter().any(|r| r.accounts.contains_key("watches")));
    }

    #[test]
    fn backoff_ladder_is_monotonic_and_capped() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.delay_for(RetryClass::Exponential).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn fast_reset_does_not_disturb_the_ladder() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.delay_for(RetryClass::Exponential).as_secs(), 1);
        assert_eq!(backoff.delay_for(RetryClass::Exponential).as_secs(), 2);
        assert_eq!(
            backoff.delay_for(RetryClass::FastReset),
            Duration::from_millis(500)
        );
        // Ladder resumes where it left off.
        assert_eq!(backoff.delay_for(RetryClass::Exponential).as_secs(), 4);
    }

    #[test]
    fn auth_cooldown_is_long_and_fixed() {
        let mut backoff = Backoff::new();
        assert_eq!(
            backoff.delay_for(RetryClass::AuthCooldown),
            Duration::from_secs(30)
        );
        assert_eq!(
            backoff.delay_for(RetryClass::AuthCooldown),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn reset_restarts_the_ladder() {
        let mut backoff = Backoff::new();
        backoff.delay_for(RetryClass::Exponential);
        backoff.delay_for(RetryClass::Exponential);
        backoff.reset();
        assert_eq!(backoff.delay_for(RetryClass::Exponential).as_secs(), 1);
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            classify(&StreamError::Transport("stream reset by peer".into())),
            RetryClass::FastReset
        );
        assert_eq!(
            classify(&StreamError::Transport("h2 protocol error".into())),
            RetryClass::Exponential
        );
        assert_eq!(
            classify(&StreamError::Auth("bad token".into())),
            RetryClass::AuthCooldown
        );
        assert_eq!(classify(&StreamError::Closed), RetryClass::Exponential);
    }

    #[test]
    fn status_mapping_detects_auth() {
        let err = map_status(tonic::Status::unauthenticated("nope"));
        assert!(matches!(err, StreamError::Auth(_)));
        let err = map_status(tonic::Status::unavailable("gone"));
        assert!(matches!(err, StreamError::Transport(_)));
    }

    fn token_balance(owner: &Pubkey, mint: &Pubkey, amount: u64) -> TokenBalance {
        TokenBalance {
            account_index: 1,
            mint: mint.to_string(),
            ui_token_amount: Some(UiTokenAmount {
                ui_amount: amount as f64 / 1e6,
                decimals: 6,
                amount: amount.to_string(),
                ui_amount_string: String::new(),
            }),
            owner: owner.to_string(),
            program_id: String::new(),
        }
    }

    #[test]
    fn transaction_summary_merges_balance_deltas() {
        let payer = Pubkey::from([1u8; 32]);
        let mint = Pubkey::from([2u8; 32]);

        let update = SubscribeUpdateTransaction {
            transaction: Some(SubscribeUpdateTransactionInfo {
                signature: vec![9u8; 64],
                is_vote: false,
                transaction: Some(Transaction {
                    signatures: vec![vec![9u8; 64]],
                    message: Some(Message {
                        header: None,
                        account_keys: vec![payer.to_bytes().to_vec()],
                        recent_blockhash: vec![],
                        instructions: vec![],
                        versioned: false,
                        address_table_lookups: vec![],
                    }),
                }),
                meta: Some(TransactionStatusMeta {
                    err: None,
                    fee: 5_000,
                    pre_balances: vec![10_000_000_000],
                    post_balances: vec![7_000_000_000],
                    pre_token_balances: vec![token_balance(&payer, &mint, 0)],
                    post_token_balances: vec![token_balance(&payer, &mint, 1_000_000)],
                    ..Default::default()
                }),
                index: 0,
            }),
            slot: 42,
        };

        let event = summarize_transaction(&update, Arc::from("test")).unwrap();
        assert_eq!(event.fee_payer, Some(payer));
        assert_eq!(event.lamports_spent, 3_000_000_000);
        assert!(!event.failed);
        assert_eq!(event.slot, 42);
        assert_eq!(event.balance_deltas.len(), 1);
        assert_eq!(event.balance_deltas[0].change(), 1_000_000);
    }

    #[test]
    fn transaction_without_signature_is_dropped() {
        let update = SubscribeUpdateTransaction {
            transaction: Some(SubscribeUpdateTransactionInfo {
                signature: vec![],
                is_vote: false,
                transaction: None,
                meta: None,
                index: 0,
            }),
            slot: 1,
        };
        assert!(summarize_transaction(&update, Arc::from("test")).is_none());
    }
}
