mod async_log;
mod config;
mod decoder;
mod events;
mod price_cache;
mod registry;
mod risk;
mod stream;
mod supervisor;
mod whale;

use std::{env, sync::Arc, time::Duration};

use log::{info, warn};
use tokio::sync::mpsc;

use crate::{
    config::Config,
    price_cache::PriceCache,
    registry::SubscriptionRegistry,
    risk::ReactiveRiskEngine,
    supervisor::{StatsSnapshot, StreamSupervisor},
    whale::WhaleSignalDetector,
};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env::set_var(
        env_logger::DEFAULT_FILTER_ENV,
        env::var_os(env_logger::DEFAULT_FILTER_ENV).unwrap_or_else(|| "info".into()),
    );
    env_logger::init();
    let _async_logger = async_log::init_async_logger();

    let config = Arc::new(Config::load()?);
    log_startup_summary(&config);

    let registry = Arc::new(SubscriptionRegistry::new());
    registry.set_wallet_set(config.tracked_wallets.clone());
    for seed in &config.watch_seeds {
        if let Some(curve) = seed.curve {
            registry.add_curve_watch(seed.mint, curve, seed.decimals);
        }
        if let Some((base, quote)) = seed.vaults {
            registry.add_vault_watch(seed.mint, base, quote, seed.decimals);
        }
    }
    let initial_request = registry.current_request();
    info!(
        "Watching {} account(s) across {} seed mint(s) | account_filters={} | tx_filters={}",
        registry.watched_account_count(),
        config.watch_seeds.len(),
        initial_request.accounts.len(),
        initial_request.transactions.len(),
    );

    let cache = Arc::new(PriceCache::new(config.anomaly_config()));
    let (exit_tx, mut exit_rx) = mpsc::channel(256);
    let risk = Arc::new(ReactiveRiskEngine::new(config.risk_settings(), exit_tx));
    let detector = WhaleSignalDetector::new(config.whale_config());
    let (signal_tx, mut signal_rx) = mpsc::channel(256);

    let supervisor = StreamSupervisor::start(
        config.endpoints.clone(),
        config.ping_interval,
        config.dedup_config(),
        Arc::clone(&registry),
        Arc::clone(&cache),
        Arc::clone(&risk),
        detector,
        signal_tx,
    );

    // Exit commands land here; the execution layer hangs off this channel.
    tokio::spawn(async move {
        while let Some(command) = exit_rx.recv().await {
            info!(
                "EXIT | mint={} | reason={} | price={:.10} | pnl={:+.2}%",
                command.mint,
                command.reason,
                command.price,
                command.pnl * 100.0
            );
        }
    });

    // Whale buys start reactive monitoring. The bought mint gets a curve
    // watch immediately, so live connections re-subscribe on the open stream
    // and the position receives pushes within one round trip.
    {
        let config = Arc::clone(&config);
        let cache = Arc::clone(&cache);
        let risk = Arc::clone(&risk);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                info!(
                    "WHALE BUY | wallet={} | mint={} | size={:.3} SOL | sig={}",
                    signal.wallet, signal.mint, signal.size_sol, signal.signature
                );
                registry.add_curve_watch(
                    signal.mint,
                    registry::curve_address(&signal.mint),
                    signal.decimals,
                );

                // Entry from the whale's own fill; fall back to the cache
                // when the trade carried no usable size.
                let Some(entry_price) =
                    signal.price_paid().or_else(|| cache.get_current(&signal.mint))
                else {
                    warn!("no usable price for {}, watching but not monitoring", signal.mint);
                    continue;
                };
                let result = risk.register(
                    signal.mint,
                    entry_price,
                    signal.tokens,
                    config.stop_loss_price(entry_price),
                    config.take_profit_price(entry_price),
                    config.dynamic_stop_schedule.clone(),
                );
                match result {
                    Ok(()) => info!(
                        "monitoring {} | entry={:.10} | price_source={} | positions={}",
                        signal.mint,
                        entry_price,
                        cache
                            .source(&signal.mint)
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "trade".to_owned()),
                        risk.monitored_count()
                    ),
                    Err(err) => warn!("could not monitor {}: {err}", signal.mint),
                }
            }
        });
    }

    let mut stats_interval = tokio::time::interval(STATS_INTERVAL);
    stats_interval.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats_interval.tick() => log_stats(&supervisor.stats()),
        }
    }

    info!("Shutting down...");
    supervisor.shutdown().await;
    Ok(())
}

fn log_startup_summary(config: &Config) {
    for (idx, endpoint) in config.endpoints.iter().enumerate() {
        info!(
            "Endpoint {:02} | name={} | url={} | auth={}",
            idx + 1,
            endpoint.name,
            endpoint.endpoint,
            if endpoint.x_token.is_some() { "token" } else { "none" }
        );
    }

    if config.tracked_wallets.is_empty() {
        info!("Tracked wallets | none configured");
    } else {
        for (idx, wallet) in config.tracked_wallets.iter().enumerate() {
            info!("Tracked wallet {:02} | {}", idx + 1, wallet);
        }
    }

    info!(
        "Risk | tp={:?}% | sl={:?}% | schedule_tiers={} | trailing={} | stagnation={}",
        config.take_profit_pct,
        config.stop_loss_pct,
        config.dynamic_stop_schedule.len(),
        config.trailing.is_some(),
        config.stagnation.is_some(),
    );
    info!(
        "Whale filter | min_buy={:.2} SOL | excluded_mints={}",
        config.min_whale_buy_sol,
        config.excluded_mints.len()
    );
}

fn log_stats(stats: &StatsSnapshot) {
    for conn in &stats.connections {
        info!(
            "Stats | {} | messages={} | reconnects={} | pings={} | pongs={} | last_pong_age={}",
            conn.name,
            conn.messages,
            conn.reconnects,
            conn.pings_sent,
            conn.pongs_received,
            conn.last_pong_age
                .map(|age| format!("{:.0}s", age.as_secs_f64()))
                .unwrap_or_else(|| "never".to_owned()),
        );
    }
    info!(
        "Stats | router | events={} | duplicates_dropped={}",
        stats.events_routed, stats.duplicates_dropped
    );
}
