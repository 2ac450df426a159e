//! Reactive risk engine: one record per open position, evaluated
//! synchronously against every price tick for its mint.
//!
//! The `Triggered` state is the single arbiter of emission. Every path that
//! could produce an exit command - curve ticks, vault ticks, out-of-band
//! re-checks - goes through the same record under the same lock, so a
//! position can never sell twice no matter how many ticks satisfy its
//! trigger or which decoder delivered them.

use crate::events::{ExitCommand, ExitReason};
use log::warn;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// One window of the dynamic stop-loss schedule: while the position is
/// younger than `max_age`, tolerate drawdowns down to `threshold_pct`
/// (negative, e.g. -45.0) before stopping out.
#[derive(Debug, Clone, Copy)]
pub struct DynamicStopTier {
    pub max_age: Duration,
    pub threshold_pct: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TrailingConfig {
    /// Profit (percent over entry) required before the trail arms.
    pub activation_pct: f64,
    /// Give-back from the high-water mark that triggers the exit.
    pub trail_pct: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct StagnationConfig {
    pub window: Duration,
    /// Absolute percent move below which a window counts as stagnant.
    pub threshold_pct: f64,
}

#[derive(Debug, Clone)]
pub struct RiskSettings {
    /// Grace period after registration before take-profit may fire. An entry
    /// price correction right after registration can make the position look
    /// instantly above target; without this the first noisy tick exits.
    pub take_profit_cooldown: Duration,
    pub trailing: Option<TrailingConfig>,
    pub stagnation: Option<StagnationConfig>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            take_profit_cooldown: Duration::from_secs(2),
            trailing: None,
            stagnation: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("entry price must be positive and finite")]
    InvalidEntry,
    #[error("stop-loss price must be non-negative")]
    InvalidStopLoss,
    #[error("take-profit price must exceed the entry price")]
    InvalidTakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    /// Created, no tick evaluated yet.
    Registered,
    /// At least one valid tick evaluated.
    Armed,
    /// Exit emitted. Sticky until wholesale re-registration.
    Triggered,
}

#[derive(Debug)]
struct RiskRecord {
    entry_price: f64,
    stop_loss_price: Option<f64>,
    take_profit_price: Option<f64>,
    schedule: Vec<DynamicStopTier>,
    state: RecordState,
    registered_at: Instant,
    /// Running high for the trailing stop, set once activation is reached.
    high_water: Option<f64>,
    /// (price, at) baseline for the stagnation window.
    drift_baseline: Option<(f64, Instant)>,
    /// Raw token size, used only to blend the entry on top-up buys.
    tokens: u64,
}

impl RiskRecord {
    fn pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) / self.entry_price
    }

    /// Effective stop threshold for the record's current age: the dynamic
    /// schedule while inside its windows, the static stop afterwards.
    fn effective_stop(&self, age: Duration) -> Option<f64> {
        for tier in &self.schedule {
            if age < tier.max_age {
                return Some(self.entry_price * (1.0 + tier.threshold_pct / 100.0));
            }
        }
        self.stop_loss_price
    }

    fn evaluate_at(&mut self, price: f64, now: Instant, settings: &RiskSettings) -> Option<(ExitReason, f64)> {
        if self.state == RecordState::Triggered {
            return None;
        }
        if self.state == RecordState::Registered {
            self.state = RecordState::Armed;
        }

        let age = now.saturating_duration_since(self.registered_at);
        let pnl = self.pnl(price);

        // Stop-loss first: protecting capital dominates locking in profit
        // when both conditions hold on the same tick.
        if let Some(stop) = self.effective_stop(age) {
            if price <= stop {
                self.state = RecordState::Triggered;
                return Some((ExitReason::StopLoss, pnl));
            }
        }

        if let Some(tp) = self.take_profit_price {
            if price >= tp && age >= settings.take_profit_cooldown {
                self.state = RecordState::Triggered;
                return Some((ExitReason::TakeProfit, pnl));
            }
        }

        if let Some(trailing) = settings.trailing {
            if pnl * 100.0 >= trailing.activation_pct {
                let hw = self.high_water.get_or_insert(price);
                if price > *hw {
                    *hw = price;
                }
            }
            if let Some(hw) = self.high_water {
                let trigger = hw * (1.0 - trailing.trail_pct / 100.0);
                if price <= trigger {
                    self.state = RecordState::Triggered;
                    return Some((ExitReason::TrailingStop, pnl));
                }
            }
        }

        if let Some(stagnation) = settings.stagnation {
            if self.window_is_stagnant(price, now, stagnation) {
                self.state = RecordState::Triggered;
                return Some((ExitReason::Stagnation, pnl));
            }
        }

        None
    }

    /// Rolling drift check: once per window, compare against the baseline
    /// captured at the start of the window and re-baseline.
    fn window_is_stagnant(&mut self, price: f64, now: Instant, cfg: StagnationConfig) -> bool {
        match self.drift_baseline {
            Some((base, at)) if now.saturating_duration_since(at) >= cfg.window => {
                self.drift_baseline = Some((price, now));
                if base.abs() <= f64::EPSILON {
                    return true;
                }
                let pct_change = ((price - base) / base) * 100.0;
                pct_change.abs() <= cfg.threshold_pct
            }
            None => {
                self.drift_baseline = Some((price, now));
                false
            }
            _ => false,
        }
    }

    /// Blend the entry price when the position is topped up.
    fn record_additional_buy(&mut self, new_tokens: u64, new_price: f64) {
        if new_tokens == 0 {
            return;
        }
        if self.tokens == 0 || self.entry_price <= 0.0 {
            self.entry_price = new_price;
            self.tokens = new_tokens;
            return;
        }
        let total = self.tokens.saturating_add(new_tokens);
        self.entry_price = ((self.entry_price * self.tokens as f64)
            + (new_price * new_tokens as f64))
            / total as f64;
        self.tokens = total;
    }
}

pub struct ReactiveRiskEngine {
    settings: RiskSettings,
    records: Mutex<HashMap<Pubkey, RiskRecord>>,
    command_tx: mpsc::Sender<ExitCommand>,
}

impl ReactiveRiskEngine {
    pub fn new(settings: RiskSettings, command_tx: mpsc::Sender<ExitCommand>) -> Self {
        Self {
            settings,
            records: Mutex::new(HashMap::new()),
            command_tx,
        }
    }

    /// Register a position for reactive monitoring. Replaces any existing
    /// record for the mint wholesale, clearing a previous `Triggered` flag -
    /// this is how a partial exit's residual position re-arms.
    pub fn register(
        &self,
        mint: Pubkey,
        entry_price: f64,
        tokens: u64,
        stop_loss_price: Option<f64>,
        take_profit_price: Option<f64>,
        schedule: Vec<DynamicStopTier>,
    ) -> Result<(), RegisterError> {
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(RegisterError::InvalidEntry);
        }
        if let Some(stop) = stop_loss_price {
            if !(stop.is_finite() && stop >= 0.0) {
                return Err(RegisterError::InvalidStopLoss);
            }
        }
        if let Some(tp) = take_profit_price {
            if !(tp.is_finite() && tp > entry_price) {
                return Err(RegisterError::InvalidTakeProfit);
            }
        }

        let record = RiskRecord {
            entry_price,
            stop_loss_price,
            take_profit_price,
            schedule,
            state: RecordState::Registered,
            registered_at: Instant::now(),
            high_water: None,
            drift_baseline: None,
            tokens,
        };
        self.records
            .lock()
            .expect("risk records lock poisoned")
            .insert(mint, record);
        Ok(())
    }

    pub fn unregister(&self, mint: &Pubkey) {
        self.records
            .lock()
            .expect("risk records lock poisoned")
            .remove(mint);
    }

    /// Blend the recorded entry when the same position is bought into again.
    pub fn record_additional_buy(&self, mint: &Pubkey, new_tokens: u64, new_price: f64) {
        let mut records = self.records.lock().expect("risk records lock poisoned");
        if let Some(record) = records.get_mut(mint) {
            record.record_additional_buy(new_tokens, new_price);
        }
    }

    /// Evaluate one tick. At most one command is ever emitted per record
    /// between registration and trigger; the command is also returned for
    /// callers that want the synchronous result.
    pub fn on_price_tick(&self, mint: Pubkey, price: f64) -> Option<ExitCommand> {
        if !(price.is_finite() && price > 0.0) {
            return None;
        }
        let fired = {
            let mut records = self.records.lock().expect("risk records lock poisoned");
            let record = records.get_mut(&mint)?;
            record.evaluate_at(price, Instant::now(), &self.settings)
        };

        let (reason, pnl) = fired?;
        let command = ExitCommand {
            mint,
            reason,
            price,
            pnl,
        };
        crate::info_async!(
            "exit trigger | mint={mint} | reason={reason} | price={price:.10} | pnl={:.2}%",
            pnl * 100.0
        );
        // Fire and forget: retry/backoff belongs to the execution layer.
        if let Err(err) = self.command_tx.try_send(command.clone()) {
            warn!("failed to enqueue exit command for {mint}: {err}");
        }
        Some(command)
    }

    pub fn is_monitored(&self, mint: &Pubkey) -> bool {
        self.records
            .lock()
            .expect("risk records lock poisoned")
            .contains_key(mint)
    }

    pub fn monitored_count(&self) -> usize {
        self.records.lock().expect("risk records lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mint() -> Pubkey {
        Pubkey::from([9u8; 32])
    }

    fn settings() -> RiskSettings {
        RiskSettings::default()
    }

    fn record(entry: f64, stop: Option<f64>, tp: Option<f64>, schedule: Vec<DynamicStopTier>) -> RiskRecord {
        RiskRecord {
            entry_price: entry,
            stop_loss_price: stop,
            take_profit_price: tp,
            schedule,
            state: RecordState::Registered,
            registered_at: Instant::now(),
            high_water: None,
            drift_baseline: None,
            tokens: 1_000_000,
        }
    }

    #[test]
    fn stop_loss_fires_exactly_once() {
        let (tx, mut rx) = mpsc::channel(16);
        let engine = ReactiveRiskEngine::new(settings(), tx);
        engine
            .register(mint(), 1.0, 1_000_000, Some(0.8), None, vec![])
            .unwrap();

        // Every one of these ticks individually satisfies the stop.
        let first = engine.on_price_tick(mint(), 0.75);
        assert_eq!(first.as_ref().map(|c| c.reason), Some(ExitReason::StopLoss));
        for _ in 0..5 {
            assert!(engine.on_price_tick(mint(), 0.10).is_none());
        }

        assert_eq!(rx.try_recv().unwrap().reason, ExitReason::StopLoss);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_loss_priority_over_take_profit() {
        // Degenerate record where both conditions hold on one tick: stop at
        // 2.0, take-profit at 1.5, tick at 1.8.
        let mut rec = record(1.0, Some(2.0), Some(1.5), vec![]);
        let now = rec.registered_at + Duration::from_secs(10);
        let (reason, _) = rec.evaluate_at(1.8, now, &settings()).unwrap();
        assert_eq!(reason, ExitReason::StopLoss);
    }

    #[test]
    fn dynamic_schedule_widens_early_window() {
        let schedule = vec![
            DynamicStopTier {
                max_age: Duration::from_secs(15),
                threshold_pct: -45.0,
            },
            DynamicStopTier {
                max_age: Duration::from_secs(600),
                threshold_pct: -25.0,
            },
        ];

        // -40% at age 5s: inside the -45% window, no trigger.
        let mut rec = record(1.0, Some(0.9), None, schedule.clone());
        let at_5s = rec.registered_at + Duration::from_secs(5);
        assert!(rec.evaluate_at(0.60, at_5s, &settings()).is_none());

        // Same price at age 20s: the schedule now says -25%, trigger.
        let at_20s = rec.registered_at + Duration::from_secs(20);
        let (reason, pnl) = rec.evaluate_at(0.60, at_20s, &settings()).unwrap();
        assert_eq!(reason, ExitReason::StopLoss);
        assert!((pnl + 0.40).abs() < 1e-9);
    }

    #[test]
    fn take_profit_respects_cooldown() {
        let mut rec = record(1.0, None, Some(1.2), vec![]);
        // Above target immediately after registration: held back.
        let at_1s = rec.registered_at + Duration::from_secs(1);
        assert!(rec.evaluate_at(1.3, at_1s, &settings()).is_none());
        // Same price after the cooldown: fires.
        let at_3s = rec.registered_at + Duration::from_secs(3);
        let (reason, _) = rec.evaluate_at(1.3, at_3s, &settings()).unwrap();
        assert_eq!(reason, ExitReason::TakeProfit);
    }

    #[test]
    fn trailing_stop_tracks_high_water() {
        let mut cfg = settings();
        cfg.trailing = Some(TrailingConfig {
            activation_pct: 20.0,
            trail_pct: 10.0,
        });
        let mut rec = record(1.0, None, None, vec![]);
        let t0 = rec.registered_at;

        // Climb through activation; high-water follows.
        assert!(rec.evaluate_at(1.25, t0 + Duration::from_secs(3), &cfg).is_none());
        assert!(rec.evaluate_at(1.50, t0 + Duration::from_secs(4), &cfg).is_none());
        // 1.34 is below 1.50 * 0.9 = 1.35: trail fires.
        let (reason, _) = rec
            .evaluate_at(1.34, t0 + Duration::from_secs(5), &cfg)
            .unwrap();
        assert_eq!(reason, ExitReason::TrailingStop);
    }

    #[test]
    fn stagnant_window_forces_exit() {
        let mut cfg = settings();
        cfg.stagnation = Some(StagnationConfig {
            window: Duration::from_secs(60),
            threshold_pct: 2.0,
        });
        let mut rec = record(1.0, None, None, vec![]);
        let t0 = rec.registered_at;

        // First tick seeds the baseline.
        assert!(rec.evaluate_at(1.01, t0 + Duration::from_secs(1), &cfg).is_none());
        // Window elapses with the price within 2% of the baseline.
        let (reason, _) = rec
            .evaluate_at(1.015, t0 + Duration::from_secs(62), &cfg)
            .unwrap();
        assert_eq!(reason, ExitReason::Stagnation);
    }

    #[test]
    fn moving_price_is_not_stagnant() {
        let mut cfg = settings();
        cfg.stagnation = Some(StagnationConfig {
            window: Duration::from_secs(60),
            threshold_pct: 2.0,
        });
        let mut rec = record(1.0, None, None, vec![]);
        let t0 = rec.registered_at;

        assert!(rec.evaluate_at(1.0, t0 + Duration::from_secs(1), &cfg).is_none());
        assert!(rec.evaluate_at(1.5, t0 + Duration::from_secs(62), &cfg).is_none());
    }

    #[test]
    fn re_registration_clears_triggered() {
        let (tx, _rx) = mpsc::channel(16);
        let engine = ReactiveRiskEngine::new(settings(), tx);
        engine
            .register(mint(), 1.0, 1_000_000, Some(0.8), None, vec![])
            .unwrap();
        assert!(engine.on_price_tick(mint(), 0.5).is_some());
        assert!(engine.on_price_tick(mint(), 0.5).is_none());

        // Residual position after a partial exit gets a fresh record.
        engine
            .register(mint(), 0.5, 500_000, Some(0.4), None, vec![])
            .unwrap();
        assert!(engine.on_price_tick(mint(), 0.3).is_some());
    }

    #[test]
    fn additional_buy_blends_entry() {
        let mut rec = record(1.0, None, None, vec![]);
        rec.tokens = 100;
        rec.record_additional_buy(100, 2.0);
        assert!((rec.entry_price - 1.5).abs() < 1e-9);
        assert_eq!(rec.tokens, 200);
    }

    #[test]
    fn register_validates_inputs() {
        let (tx, _rx) = mpsc::channel(16);
        let engine = ReactiveRiskEngine::new(settings(), tx);
        assert_eq!(
            engine.register(mint(), 0.0, 0, None, None, vec![]),
            Err(RegisterError::InvalidEntry)
        );
        assert_eq!(
            engine.register(mint(), 1.0, 0, None, Some(0.9), vec![]),
            Err(RegisterError::InvalidTakeProfit)
        );
        assert_eq!(
            engine.register(mint(), 1.0, 0, Some(-0.1), None, vec![]),
            Err(RegisterError::InvalidStopLoss)
        );
    }

    #[test]
    fn end_to_end_stop_loss_scenario() {
        let (tx, mut rx) = mpsc::channel(16);
        let engine = ReactiveRiskEngine::new(settings(), tx);
        engine
            .register(mint(), 1.0, 1_000_000, Some(0.8), Some(1.2), vec![])
            .unwrap();

        assert!(engine.on_price_tick(mint(), 1.05).is_none());
        assert!(engine.on_price_tick(mint(), 0.95).is_none());

        let command = engine.on_price_tick(mint(), 0.79).unwrap();
        assert_eq!(command.reason, ExitReason::StopLoss);
        assert!((command.price - 0.79).abs() < 1e-12);

        // Record is now triggered: a crash tick produces nothing further.
        assert!(engine.on_price_tick(mint(), 0.10).is_none());

        assert_eq!(rx.try_recv().unwrap().reason, ExitReason::StopLoss);
        assert!(rx.try_recv().is_err());
    }
}
