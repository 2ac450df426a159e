use std::{env, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use dotenvy::Error as DotenvError;
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::price_cache::AnomalyConfig;
use crate::risk::{DynamicStopTier, RiskSettings, StagnationConfig, TrailingConfig};
use crate::supervisor::DedupConfig;
use crate::whale::WhaleConfig;

/// One Geyser endpoint to stream from. The name tags every log line and
/// stats counter for that connection.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub name: Arc<str>,
    pub endpoint: String,
    pub x_token: Option<String>,
}

/// A mint to start watching at boot, before any dynamic additions.
#[derive(Clone, Debug)]
pub struct WatchSeed {
    pub mint: Pubkey,
    pub curve: Option<Pubkey>,
    pub vaults: Option<(Pubkey, Pubkey)>,
    pub decimals: u8,
}

#[derive(Clone)]
pub struct Config {
    pub env_path: PathBuf,
    pub endpoints: Vec<EndpointConfig>,
    pub ping_interval: Duration,
    pub tracked_wallets: Vec<Pubkey>,
    pub min_whale_buy_sol: f64,
    pub excluded_mints: Vec<Pubkey>,
    /// Percent above entry, e.g. 50 exits at 1.5x.
    pub take_profit_pct: Option<f64>,
    /// Percent below entry, e.g. 30 exits at 0.7x.
    pub stop_loss_pct: Option<f64>,
    pub dynamic_stop_schedule: Vec<DynamicStopTier>,
    pub take_profit_cooldown: Duration,
    pub trailing: Option<TrailingConfig>,
    pub stagnation: Option<StagnationConfig>,
    pub price_max_age: Duration,
    pub anomaly_min_ratio: f64,
    pub anomaly_max_ratio: f64,
    pub anomaly_accept_after: u32,
    pub dedup_capacity: usize,
    pub dedup_trim_to: usize,
    pub watch_seeds: Vec<WatchSeed>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let env_path = env::current_dir()
            .map_err(|e| ConfigError::Io("current_dir".into(), e))?
            .join(".env");

        match dotenvy::from_path(&env_path) {
            Ok(_) => {}
            Err(DotenvError::LineParse(_, _)) | Err(DotenvError::Io(_)) if env_path.exists() => {
                return Err(ConfigError::Dotenv)
            }
            Err(_) => {
                return Err(ConfigError::MissingEnv(env_path));
            }
        }

        let raw = RawConfig::gather()?;

        let endpoints = load_endpoints()?;
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let tracked_wallets = load_indexed_pubkeys("TRACKED_WALLET")?;
        let watch_seeds = load_watch_seeds()?;

        let dynamic_stop_schedule = match &raw.dynamic_stop_schedule {
            Some(value) => parse_schedule(value)?,
            None => Vec::new(),
        };

        let excluded_mints = match &raw.excluded_mints {
            Some(list) => parse_pubkey_list(list)?,
            None => Vec::new(),
        };

        let trailing = match (raw.trailing_activation_pct, raw.trailing_stop_pct) {
            (Some(activation_pct), Some(trail_pct)) => Some(TrailingConfig {
                activation_pct,
                trail_pct,
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTrailing),
        };

        let stagnation = match (raw.stagnation_window_secs, raw.stagnation_threshold_pct) {
            (Some(window), Some(threshold_pct)) => Some(StagnationConfig {
                window: Duration::from_secs_f64(window),
                threshold_pct,
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialStagnation),
        };

        Ok(Self {
            env_path,
            endpoints,
            ping_interval: Duration::from_secs_f64(raw.ping_interval_secs.unwrap_or(10.0)),
            tracked_wallets,
            min_whale_buy_sol: raw.min_whale_buy_sol.unwrap_or(1.0),
            excluded_mints,
            take_profit_pct: raw.take_profit_pct,
            stop_loss_pct: raw.stop_loss_pct,
            dynamic_stop_schedule,
            take_profit_cooldown: Duration::from_millis(
                raw.take_profit_cooldown_ms.unwrap_or(2_000.0) as u64,
            ),
            trailing,
            stagnation,
            price_max_age: Duration::from_secs_f64(raw.price_max_age_secs.unwrap_or(120.0)),
            anomaly_min_ratio: raw.anomaly_min_ratio.unwrap_or(0.1),
            anomaly_max_ratio: raw.anomaly_max_ratio.unwrap_or(10.0),
            anomaly_accept_after: raw.anomaly_accept_after.unwrap_or(3.0) as u32,
            dedup_capacity: raw.dedup_capacity.unwrap_or(10_000.0) as usize,
            dedup_trim_to: raw.dedup_trim_to.unwrap_or(5_000.0) as usize,
            watch_seeds,
        })
    }

    pub fn risk_settings(&self) -> RiskSettings {
        RiskSettings {
            take_profit_cooldown: self.take_profit_cooldown,
            trailing: self.trailing,
            stagnation: self.stagnation,
        }
    }

    pub fn anomaly_config(&self) -> AnomalyConfig {
        AnomalyConfig {
            min_ratio: self.anomaly_min_ratio,
            max_ratio: self.anomaly_max_ratio,
            accept_after: self.anomaly_accept_after,
            max_age: self.price_max_age,
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            capacity: self.dedup_capacity,
            trim_to: self.dedup_trim_to.min(self.dedup_capacity),
        }
    }

    pub fn whale_config(&self) -> WhaleConfig {
        WhaleConfig {
            tracked_wallets: self.tracked_wallets.iter().copied().collect(),
            min_buy_sol: self.min_whale_buy_sol,
            excluded_mints: self.excluded_mints.iter().copied().collect(),
        }
    }

    /// Stop-loss price for a given entry, from the static percentage.
    pub fn stop_loss_price(&self, entry_price: f64) -> Option<f64> {
        self.stop_loss_pct
            .map(|pct| entry_price * (1.0 - pct / 100.0))
    }

    /// Take-profit price for a given entry, from the static percentage.
    pub fn take_profit_price(&self, entry_price: f64) -> Option<f64> {
        self.take_profit_pct
            .map(|pct| entry_price * (1.0 + pct / 100.0))
    }
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "PING_INTERVAL_SECS", default, deserialize_with = "de_optional_f64")]
    ping_interval_secs: Option<f64>,
    #[serde(rename = "MIN_WHALE_BUY_SOL", default, deserialize_with = "de_optional_f64")]
    min_whale_buy_sol: Option<f64>,
    #[serde(rename = "EXCLUDED_MINTS", default, deserialize_with = "de_optional_string")]
    excluded_mints: Option<String>,
    #[serde(rename = "TAKE_PROFIT_PCT", default, deserialize_with = "de_optional_f64")]
    take_profit_pct: Option<f64>,
    #[serde(rename = "STOP_LOSS_PCT", default, deserialize_with = "de_optional_f64")]
    stop_loss_pct: Option<f64>,
    #[serde(
        rename = "DYNAMIC_STOP_SCHEDULE",
        default,
        deserialize_with = "de_optional_string"
    )]
    dynamic_stop_schedule: Option<String>,
    #[serde(
        rename = "TAKE_PROFIT_COOLDOWN_MS",
        default,
        deserialize_with = "de_optional_f64"
    )]
    take_profit_cooldown_ms: Option<f64>,
    #[serde(
        rename = "TRAILING_ACTIVATION_PCT",
        default,
        deserialize_with = "de_optional_f64"
    )]
    trailing_activation_pct: Option<f64>,
    #[serde(rename = "TRAILING_STOP_PCT", default, deserialize_with = "de_optional_f64")]
    trailing_stop_pct: Option<f64>,
    #[serde(
        rename = "STAGNATION_WINDOW_SECS",
        default,
        deserialize_with = "de_optional_f64"
    )]
    stagnation_window_secs: Option<f64>,
    #[serde(
        rename = "STAGNATION_THRESHOLD_PCT",
        default,
        deserialize_with = "de_optional_f64"
    )]
    stagnation_threshold_pct: Option<f64>,
    #[serde(rename = "PRICE_MAX_AGE_SECS", default, deserialize_with = "de_optional_f64")]
    price_max_age_secs: Option<f64>,
    #[serde(rename = "ANOMALY_MIN_RATIO", default, deserialize_with = "de_optional_f64")]
    anomaly_min_ratio: Option<f64>,
    #[serde(rename = "ANOMALY_MAX_RATIO", default, deserialize_with = "de_optional_f64")]
    anomaly_max_ratio: Option<f64>,
    #[serde(
        rename = "ANOMALY_ACCEPT_AFTER",
        default,
        deserialize_with = "de_optional_f64"
    )]
    anomaly_accept_after: Option<f64>,
    #[serde(rename = "DEDUP_CAPACITY", default, deserialize_with = "de_optional_f64")]
    dedup_capacity: Option<f64>,
    #[serde(rename = "DEDUP_TRIM_TO", default, deserialize_with = "de_optional_f64")]
    dedup_trim_to: Option<f64>,
}

impl RawConfig {
    fn gather() -> Result<Self, ConfigError> {
        let mut data = std::collections::BTreeMap::new();
        for (key, value) in env::vars() {
            data.insert(key, value);
        }
        let json = serde_json::to_value(&data).map_err(|e| ConfigError::Serde(e.to_string()))?;
        serde_json::from_value(json).map_err(|e| ConfigError::Serde(e.to_string()))
    }
}

fn load_endpoints() -> Result<Vec<EndpointConfig>, ConfigError> {
    let mut endpoints = Vec::new();
    let mut index = 1;

    loop {
        let endpoint_key = format!("GRPC_ENDPOINT_{index}");
        let endpoint = match env::var(&endpoint_key) {
            Ok(value) => value.trim().to_owned(),
            Err(env::VarError::NotPresent) => break,
            Err(err) => return Err(ConfigError::EnvVar(endpoint_key, err)),
        };

        let x_token = match env::var(format!("GRPC_X_TOKEN_{index}")) {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_owned()),
            _ => None,
        };

        let name: Arc<str> = match env::var(format!("GRPC_NAME_{index}")) {
            Ok(value) if !value.trim().is_empty() => Arc::from(value.trim()),
            _ => Arc::from(format!("grpc{index}").as_str()),
        };

        endpoints.push(EndpointConfig {
            name,
            endpoint,
            x_token,
        });
        index += 1;
    }

    Ok(endpoints)
}

fn load_indexed_pubkeys(prefix: &str) -> Result<Vec<Pubkey>, ConfigError> {
    let mut keys = Vec::new();
    let mut index = 1;

    loop {
        let key = format!("{prefix}{index}");
        let value = match env::var(&key) {
            Ok(value) => value,
            Err(env::VarError::NotPresent) => break,
            Err(err) => return Err(ConfigError::EnvVar(key, err)),
        };
        keys.push(
            Pubkey::from_str(value.trim()).map_err(|e| ConfigError::Pubkey(value.clone(), e))?,
        );
        index += 1;
    }

    Ok(keys)
}

fn load_watch_seeds() -> Result<Vec<WatchSeed>, ConfigError> {
    let mut seeds = Vec::new();
    let mut index = 1;

    loop {
        let mint_key = format!("WATCH_MINT{index}");
        let mint_value = match env::var(&mint_key) {
            Ok(value) => value,
            Err(env::VarError::NotPresent) => break,
            Err(err) => return Err(ConfigError::EnvVar(mint_key, err)),
        };
        let mint = Pubkey::from_str(mint_value.trim())
            .map_err(|e| ConfigError::Pubkey(mint_value.clone(), e))?;

        let curve = optional_pubkey(&format!("WATCH_MINT{index}_CURVE"))?;
        let base = optional_pubkey(&format!("WATCH_MINT{index}_BASE_VAULT"))?;
        let quote = optional_pubkey(&format!("WATCH_MINT{index}_QUOTE_VAULT"))?;
        let vaults = match (base, quote) {
            (Some(base), Some(quote)) => Some((base, quote)),
            (None, None) => None,
            _ => return Err(ConfigError::PartialVaultPair(index)),
        };

        let decimals = match env::var(format!("WATCH_MINT{index}_DECIMALS")) {
            Ok(value) => value
                .trim()
                .parse::<u8>()
                .map_err(|_| ConfigError::InvalidNumber {
                    key: format!("WATCH_MINT{index}_DECIMALS"),
                    value,
                })?,
            Err(_) => 6,
        };

        seeds.push(WatchSeed {
            mint,
            curve,
            vaults,
            decimals,
        });
        index += 1;
    }

    Ok(seeds)
}

fn optional_pubkey(key: &str) -> Result<Option<Pubkey>, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Pubkey::from_str(value.trim())
            .map(Some)
            .map_err(|e| ConfigError::Pubkey(value.clone(), e)),
        _ => Ok(None),
    }
}

/// Parse "15:-45,60:-35,120:-30" into age-ordered stop tiers: until 15s the
/// position tolerates -45%, until 60s -35%, until 120s -30%.
fn parse_schedule(raw: &str) -> Result<Vec<DynamicStopTier>, ConfigError> {
    let mut tiers = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (age, pct) = part
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidSchedule(raw.to_owned()))?;
        let max_age = age
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|a| *a > 0.0)
            .ok_or_else(|| ConfigError::InvalidSchedule(raw.to_owned()))?;
        let threshold_pct = pct
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|p| *p < 0.0)
            .ok_or_else(|| ConfigError::InvalidSchedule(raw.to_owned()))?;
        tiers.push(DynamicStopTier {
            max_age: Duration::from_secs_f64(max_age),
            threshold_pct,
        });
    }
    tiers.sort_by(|a, b| a.max_age.cmp(&b.max_age));
    Ok(tiers)
}

fn parse_pubkey_list(list: &str) -> Result<Vec<Pubkey>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Pubkey::from_str(s).map_err(|e| ConfigError::Pubkey(s.to_owned(), e)))
        .collect()
}

fn de_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    }))
}

fn de_optional_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    opt.map(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(serde::de::Error::custom("expected number"));
        }
        trimmed
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom("expected number"))
    })
    .transpose()
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine working directory for {0}")]
    Io(String, #[source] std::io::Error),
    #[error("missing .env at {0}")]
    MissingEnv(PathBuf),
    #[error("failed to parse .env file")]
    Dotenv,
    #[error("no GRPC_ENDPOINT_1 configured")]
    NoEndpoints,
    #[error("pubkey parse error for {0}")]
    Pubkey(String, #[source] solana_sdk::pubkey::ParsePubkeyError),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("env var {0} error")]
    EnvVar(String, env::VarError),
    #[error("invalid dynamic stop schedule: {0}")]
    InvalidSchedule(String),
    #[error("invalid number {value} for {key}")]
    InvalidNumber { key: String, value: String },
    #[error("trailing stop needs both TRAILING_ACTIVATION_PCT and TRAILING_STOP_PCT")]
    PartialTrailing,
    #[error("stagnation exit needs both STAGNATION_WINDOW_SECS and STAGNATION_THRESHOLD_PCT")]
    PartialStagnation,
    #[error("WATCH_MINT{0} sets only one vault side")]
    PartialVaultPair(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parses_and_sorts_by_age() {
        let tiers = parse_schedule("60:-35, 15:-45,120:-30").unwrap();
        assert_eq!(tiers.len(), 3);
        assert_eq!(tiers[0].max_age, Duration::from_secs(15));
        assert_eq!(tiers[0].threshold_pct, -45.0);
        assert_eq!(tiers[2].max_age, Duration::from_secs(120));
        assert_eq!(tiers[2].threshold_pct, -30.0);
    }

    #[test]
    fn schedule_rejects_malformed_tiers() {
        assert!(parse_schedule("15").is_err());
        assert!(parse_schedule("abc:-30").is_err());
        // Positive thresholds make no sense for a stop.
        assert!(parse_schedule("15:30").is_err());
        assert!(parse_schedule("0:-30").is_err());
    }

    #[test]
    fn pubkey_list_skips_blanks() {
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();
        let list = format!("{a}, ,{b},");
        let parsed = parse_pubkey_list(&list).unwrap();
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn pubkey_list_rejects_garbage() {
        assert!(parse_pubkey_list("not-a-pubkey").is_err());
    }

    fn sample_config() -> Config {
        Config {
            env_path: PathBuf::new(),
            endpoints: vec![EndpointConfig {
                name: Arc::from("main"),
                endpoint: "https://example.com".to_owned(),
                x_token: None,
            }],
            ping_interval: Duration::from_secs(10),
            tracked_wallets: vec![Pubkey::new_unique()],
            min_whale_buy_sol: 1.0,
            excluded_mints: vec![],
            take_profit_pct: Some(50.0),
            stop_loss_pct: Some(30.0),
            dynamic_stop_schedule: vec![],
            take_profit_cooldown: Duration::from_secs(2),
            trailing: None,
            stagnation: None,
            price_max_age: Duration::from_secs(120),
            anomaly_min_ratio: 0.1,
            anomaly_max_ratio: 10.0,
            anomaly_accept_after: 3,
            dedup_capacity: 10_000,
            dedup_trim_to: 5_000,
            watch_seeds: vec![],
        }
    }

    #[test]
    fn exit_prices_derive_from_percentages() {
        let config = sample_config();
        let stop = config.stop_loss_price(2.0).unwrap();
        assert!((stop - 1.4).abs() < 1e-12);
        let tp = config.take_profit_price(2.0).unwrap();
        assert!((tp - 3.0).abs() < 1e-12);
    }

    #[test]
    fn dedup_trim_never_exceeds_capacity() {
        let mut config = sample_config();
        config.dedup_capacity = 100;
        config.dedup_trim_to = 5_000;
        let dedup = config.dedup_config();
        assert_eq!(dedup.trim_to, 100);
    }
}
