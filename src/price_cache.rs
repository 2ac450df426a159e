//! Last-known price per mint with staleness and anomaly gating.

use crate::events::PriceSource;
use log::debug;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Anomaly-filter tuning. These encode domain judgment, not structure, so
/// they live in configuration rather than constants.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyConfig {
    /// New price below `min_ratio * previous` is provisionally rejected.
    pub min_ratio: f64,
    /// New price above `max_ratio * previous` is provisionally rejected.
    pub max_ratio: f64,
    /// This many consecutive proposals of the same rejected value make it
    /// real - a legitimate large move repeats, a glitch does not.
    pub accept_after: u32,
    /// Observations older than this are not served as current.
    pub max_age: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_ratio: 0.1,
            max_ratio: 10.0,
            accept_after: 3,
            max_age: Duration::from_secs(120),
        }
    }
}

/// Outcome of a cache update, for metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Stored,
    /// The anomaly guard kept the previous value.
    Rejected,
}

struct Entry {
    price: f64,
    source: PriceSource,
    updated_at: Instant,
    /// Rejected value currently accumulating repetitions.
    candidate: Option<(f64, u32)>,
}

pub struct PriceCache {
    config: AnomalyConfig,
    entries: Mutex<HashMap<Pubkey, Entry>>,
}

impl PriceCache {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store `(price, now)` for the mint unless the anomaly guard holds it
    /// back. Observations are replaced wholesale, never partially updated.
    pub fn update(&self, mint: Pubkey, price: f64, source: PriceSource) -> UpdateOutcome {
        if !(price.is_finite() && price > 0.0) {
            return UpdateOutcome::Rejected;
        }

        let mut entries = self.entries.lock().expect("price cache lock poisoned");
        let now = Instant::now();

        match entries.get_mut(&mint) {
            None => {
                entries.insert(
                    mint,
                    Entry {
                        price,
                        source,
                        updated_at: now,
                        candidate: None,
                    },
                );
                UpdateOutcome::Stored
            }
            Some(entry) => {
                let ratio = price / entry.price;
                let anomalous = ratio < self.config.min_ratio || ratio > self.config.max_ratio;
                if !anomalous {
                    entry.price = price;
                    entry.source = source;
                    entry.updated_at = now;
                    entry.candidate = None;
                    return UpdateOutcome::Stored;
                }

                // Same anomalous value proposed again? Values within 10% of
                // the pending candidate count as the same proposal.
                let run = match entry.candidate {
                    Some((pending, count)) if (price - pending).abs() <= pending.abs() * 0.1 => {
                        count + 1
                    }
                    _ => 1,
                };

                if run >= self.config.accept_after {
                    debug!(
                        "accepting anomalous price for {mint}: {:.10} -> {:.10} after {run} repeats",
                        entry.price, price
                    );
                    entry.price = price;
                    entry.source = source;
                    entry.updated_at = now;
                    entry.candidate = None;
                    UpdateOutcome::Stored
                } else {
                    debug!(
                        "rejecting anomalous price for {mint}: kept {:.10}, proposed {:.10} (run {run})",
                        entry.price, price
                    );
                    entry.candidate = Some((price, run));
                    UpdateOutcome::Rejected
                }
            }
        }
    }

    /// Cached price if fresher than `max_age`; None forces the caller out of
    /// band. The system never fabricates a price.
    pub fn get(&self, mint: &Pubkey, max_age: Duration) -> Option<f64> {
        let entries = self.entries.lock().expect("price cache lock poisoned");
        let entry = entries.get(mint)?;
        if entry.updated_at.elapsed() > max_age {
            return None;
        }
        Some(entry.price)
    }

    /// Freshness gate with the configured default age.
    pub fn get_current(&self, mint: &Pubkey) -> Option<f64> {
        self.get(mint, self.config.max_age)
    }

    pub fn source(&self, mint: &Pubkey) -> Option<PriceSource> {
        let entries = self.entries.lock().expect("price cache lock poisoned");
        entries.get(mint).map(|e| e.source)
    }

    pub fn remove(&self, mint: &Pubkey) {
        self.entries
            .lock()
            .expect("price cache lock poisoned")
            .remove(mint);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("price cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mint() -> Pubkey {
        Pubkey::from([7u8; 32])
    }

    fn cache() -> PriceCache {
        PriceCache::new(AnomalyConfig::default())
    }

    #[test]
    fn single_glitch_is_rejected() {
        let cache = cache();
        let m = mint();
        assert_eq!(cache.update(m, 1.0, PriceSource::Curve), UpdateOutcome::Stored);
        assert_eq!(cache.update(m, 0.001, PriceSource::Curve), UpdateOutcome::Rejected);
        assert_eq!(cache.update(m, 0.001, PriceSource::Curve), UpdateOutcome::Rejected);
        // Price recovers: cache kept 1.0 all along.
        assert_eq!(cache.update(m, 1.0, PriceSource::Curve), UpdateOutcome::Stored);
        assert_eq!(cache.get_current(&m), Some(1.0));
    }

    #[test]
    fn persistent_move_is_accepted_on_third_repeat() {
        let cache = cache();
        let m = mint();
        cache.update(m, 1.0, PriceSource::Curve);
        assert_eq!(cache.update(m, 0.001, PriceSource::Curve), UpdateOutcome::Rejected);
        assert_eq!(cache.update(m, 0.001, PriceSource::Curve), UpdateOutcome::Rejected);
        assert_eq!(cache.update(m, 0.001, PriceSource::Curve), UpdateOutcome::Stored);
        assert_eq!(cache.get_current(&m), Some(0.001));
    }

    #[test]
    fn different_anomalous_values_restart_the_run() {
        let cache = cache();
        let m = mint();
        cache.update(m, 1.0, PriceSource::Curve);
        assert_eq!(cache.update(m, 0.001, PriceSource::Curve), UpdateOutcome::Rejected);
        assert_eq!(cache.update(m, 100.0, PriceSource::Curve), UpdateOutcome::Rejected);
        assert_eq!(cache.update(m, 100.0, PriceSource::Curve), UpdateOutcome::Rejected);
        // Third consecutive proposal of 100.0 wins.
        assert_eq!(cache.update(m, 100.0, PriceSource::Curve), UpdateOutcome::Stored);
    }

    #[test]
    fn stale_entries_are_not_served() {
        let cache = cache();
        let m = mint();
        cache.update(m, 1.0, PriceSource::Vault);
        assert_eq!(cache.get(&m, Duration::from_secs(120)), Some(1.0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&m, Duration::from_millis(1)), None);
    }

    #[test]
    fn non_finite_and_non_positive_prices_are_dropped() {
        let cache = cache();
        let m = mint();
        assert_eq!(cache.update(m, 0.0, PriceSource::Curve), UpdateOutcome::Rejected);
        assert_eq!(cache.update(m, f64::NAN, PriceSource::Curve), UpdateOutcome::Rejected);
        assert!(cache.get_current(&m).is_none());
    }
}
