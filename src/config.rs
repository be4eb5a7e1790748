// =============================================================================
// Feed Configuration — exchanges, thresholds, pollers, fan-out
// =============================================================================
//
// Central configuration hub for the Borealis pipeline. Every field carries a
// serde default so that older JSON files missing new fields still
// deserialise. Persistence uses the atomic tmp + rename pattern.
//
// The config file path comes from the BOREALIS_CONFIG environment variable,
// falling back to `feed_config.json`. A missing file falls back to defaults
// with a warning; a present-but-invalid file is a fatal startup error.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::FeedError;
use crate::symbols;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["btcusdt".into(), "ethusdt".into(), "solusdt".into()]
}

fn default_broadcast_port() -> u16 {
    8899
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_orderbook_publish_ms() -> u64 {
    200
}

fn default_book_ticker_interval_ms() -> u64 {
    200
}

fn default_candle_publish_min_ms() -> u64 {
    1_000
}

fn default_snapshot_publish_secs() -> u64 {
    30
}

fn default_gap_small_threshold() -> u64 {
    10
}

fn default_gap_critical_threshold() -> u64 {
    100
}

fn default_stale_after_secs() -> u64 {
    30
}

fn default_wall_threshold() -> f64 {
    500.0
}

fn default_whale_threshold() -> f64 {
    100_000.0
}

fn default_funding_interval_secs() -> u64 {
    30
}

fn default_mark_price_interval_secs() -> u64 {
    10
}

fn default_open_interest_interval_secs() -> u64 {
    15
}

fn default_liquidation_interval_secs() -> u64 {
    60
}

fn default_insurance_interval_secs() -> u64 {
    300
}

// =============================================================================
// Sections
// =============================================================================

/// One exchange feed: which venue, whether it runs, and for which symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// WebSocket endpoint override; `None` uses the venue's public default.
    #[serde(default)]
    pub ws_endpoint: Option<String>,

    /// REST endpoint override for snapshots and pollers.
    #[serde(default)]
    pub rest_endpoint: Option<String>,

    /// Canonical (lowercase, hyphen-stripped) symbols.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

/// Per-symbol detection thresholds, in base units (wall) and quote units
/// (whale).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolThresholds {
    #[serde(default = "default_wall_threshold")]
    pub wall_detection_threshold: f64,

    #[serde(default = "default_whale_threshold")]
    pub whale_threshold: f64,
}

impl Default for SymbolThresholds {
    fn default() -> Self {
        Self {
            wall_detection_threshold: default_wall_threshold(),
            whale_threshold: default_whale_threshold(),
        }
    }
}

/// Enable flags and intervals for the periodic REST pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_true")]
    pub funding_enabled: bool,
    #[serde(default = "default_funding_interval_secs")]
    pub funding_interval_secs: u64,

    #[serde(default = "default_true")]
    pub mark_price_enabled: bool,
    #[serde(default = "default_mark_price_interval_secs")]
    pub mark_price_interval_secs: u64,

    #[serde(default = "default_true")]
    pub open_interest_enabled: bool,
    #[serde(default = "default_open_interest_interval_secs")]
    pub open_interest_interval_secs: u64,

    #[serde(default = "default_true")]
    pub liquidation_enabled: bool,
    #[serde(default = "default_liquidation_interval_secs")]
    pub liquidation_interval_secs: u64,

    #[serde(default = "default_true")]
    pub insurance_enabled: bool,
    #[serde(default = "default_insurance_interval_secs")]
    pub insurance_interval_secs: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            funding_enabled: true,
            funding_interval_secs: default_funding_interval_secs(),
            mark_price_enabled: true,
            mark_price_interval_secs: default_mark_price_interval_secs(),
            open_interest_enabled: true,
            open_interest_interval_secs: default_open_interest_interval_secs(),
            liquidation_enabled: true,
            liquidation_interval_secs: default_liquidation_interval_secs(),
            insurance_enabled: true,
            insurance_interval_secs: default_insurance_interval_secs(),
        }
    }
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Top-level configuration for the Borealis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Exchange feeds to run.
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<ExchangeConfig>,

    /// Per-symbol thresholds, keyed by canonical symbol. Symbols not listed
    /// use `SymbolThresholds::default()`.
    #[serde(default)]
    pub thresholds: HashMap<String, SymbolThresholds>,

    #[serde(default)]
    pub pollers: PollerSettings,

    /// Port for the broadcast WebSocket + health endpoint.
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,

    /// Subject prefixes forwarded to external subscribers. Empty = all.
    #[serde(default)]
    pub broadcast_subjects: Vec<String>,

    /// Per-subscriber bus queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    /// Minimum interval between order-book snapshot publishes per symbol.
    #[serde(default = "default_orderbook_publish_ms")]
    pub orderbook_publish_interval_ms: u64,

    /// Book-ticker publish timer cadence.
    #[serde(default = "default_book_ticker_interval_ms")]
    pub book_ticker_interval_ms: u64,

    /// Minimum spacing between candle publishes per (symbol, timeframe).
    #[serde(default = "default_candle_publish_min_ms")]
    pub candle_publish_min_interval_ms: u64,

    /// Cadence of the periodic book-snapshot publisher.
    #[serde(default = "default_snapshot_publish_secs")]
    pub snapshot_publish_interval_secs: u64,

    /// Sequence gaps up to this size are logged but tolerated.
    #[serde(default = "default_gap_small_threshold")]
    pub gap_small_threshold: u64,

    /// Sequence gaps at or above this size request a high-priority snapshot.
    #[serde(default = "default_gap_critical_threshold")]
    pub gap_critical_threshold: u64,

    /// A tracker silent for this long requests a low-priority snapshot.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_exchanges() -> Vec<ExchangeConfig> {
    ["binance", "bybit", "okx", "hyperliquid"]
        .iter()
        .map(|name| ExchangeConfig {
            name: (*name).to_string(),
            enabled: true,
            ws_endpoint: None,
            rest_endpoint: None,
            symbols: default_symbols(),
        })
        .collect()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            exchanges: default_exchanges(),
            thresholds: HashMap::new(),
            pollers: PollerSettings::default(),
            broadcast_port: default_broadcast_port(),
            broadcast_subjects: Vec::new(),
            subscriber_queue_capacity: default_queue_capacity(),
            orderbook_publish_interval_ms: default_orderbook_publish_ms(),
            book_ticker_interval_ms: default_book_ticker_interval_ms(),
            candle_publish_min_interval_ms: default_candle_publish_min_ms(),
            snapshot_publish_interval_secs: default_snapshot_publish_secs(),
            gap_small_threshold: default_gap_small_threshold(),
            gap_critical_threshold: default_gap_critical_threshold(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl FeedConfig {
    /// Resolve the config path from BOREALIS_CONFIG, falling back to
    /// `feed_config.json` in the working directory.
    pub fn path_from_env() -> String {
        std::env::var("BOREALIS_CONFIG").unwrap_or_else(|_| "feed_config.json".into())
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        config.normalize_symbols();
        config.validate()?;

        info!(
            path = %path.display(),
            exchanges = config.exchanges.len(),
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    /// Force every configured symbol into canonical form.
    fn normalize_symbols(&mut self) {
        for exchange in &mut self.exchanges {
            exchange.name = exchange.name.to_lowercase();
            for symbol in &mut exchange.symbols {
                *symbol = symbols::normalize(symbol);
            }
        }
        let thresholds = std::mem::take(&mut self.thresholds);
        self.thresholds = thresholds
            .into_iter()
            .map(|(k, v)| (symbols::normalize(&k), v))
            .collect();
    }

    /// Reject configs the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_port == 0 {
            return Err(FeedError::Config("broadcast_port must be non-zero".into()).into());
        }
        if self.subscriber_queue_capacity == 0 {
            return Err(
                FeedError::Config("subscriber_queue_capacity must be non-zero".into()).into(),
            );
        }
        if self.gap_critical_threshold <= self.gap_small_threshold {
            return Err(FeedError::Config(
                "gap_critical_threshold must exceed gap_small_threshold".into(),
            )
            .into());
        }
        for exchange in &self.exchanges {
            if exchange.name.is_empty() {
                return Err(FeedError::Config("exchange with empty name".into()).into());
            }
            if exchange.enabled && exchange.symbols.is_empty() {
                return Err(FeedError::Config(format!(
                    "exchange {} enabled with no symbols",
                    exchange.name
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Thresholds for `symbol`, falling back to defaults.
    pub fn thresholds_for(&self, symbol: &str) -> SymbolThresholds {
        self.thresholds.get(symbol).cloned().unwrap_or_default()
    }

    /// Enabled exchanges only.
    pub fn enabled_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
        self.exchanges.iter().filter(|e| e.enabled)
    }

    /// Every enabled (exchange, symbol) pair.
    pub fn feed_pairs(&self) -> Vec<(String, String)> {
        self.enabled_exchanges()
            .flat_map(|e| {
                e.symbols
                    .iter()
                    .map(move |s| (e.name.clone(), s.clone()))
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = FeedConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.broadcast_port, 8899);
        assert_eq!(cfg.exchanges.len(), 4);
        assert_eq!(cfg.gap_small_threshold, 10);
        assert_eq!(cfg.gap_critical_threshold, 100);
        assert_eq!(cfg.orderbook_publish_interval_ms, 200);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: FeedConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.subscriber_queue_capacity, 1_024);
        assert!(cfg.pollers.funding_enabled);
        assert_eq!(cfg.pollers.funding_interval_secs, 30);
        assert_eq!(cfg.pollers.insurance_interval_secs, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "broadcast_port": 9100,
            "exchanges": [
                { "name": "Binance", "symbols": ["SOL-USDT", "BTCUSDT"] }
            ]
        }"#;
        let mut cfg: FeedConfig = serde_json::from_str(json).unwrap();
        cfg.normalize_symbols();
        assert_eq!(cfg.broadcast_port, 9100);
        assert_eq!(cfg.exchanges.len(), 1);
        assert_eq!(cfg.exchanges[0].name, "binance");
        assert_eq!(cfg.exchanges[0].symbols, vec!["solusdt", "btcusdt"]);
        assert!(cfg.exchanges[0].enabled);
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let mut cfg = FeedConfig::default();
        cfg.broadcast_port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = FeedConfig::default();
        cfg.gap_critical_threshold = cfg.gap_small_threshold;
        assert!(cfg.validate().is_err());

        let mut cfg = FeedConfig::default();
        cfg.exchanges[0].symbols.clear();
        assert!(cfg.validate().is_err());

        // A disabled exchange may be empty.
        let mut cfg = FeedConfig::default();
        cfg.exchanges[0].symbols.clear();
        cfg.exchanges[0].enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn thresholds_fall_back_to_defaults() {
        let mut cfg = FeedConfig::default();
        cfg.thresholds.insert(
            "solusdt".into(),
            SymbolThresholds {
                wall_detection_threshold: 2_000.0,
                whale_threshold: 50_000.0,
            },
        );
        assert_eq!(cfg.thresholds_for("solusdt").wall_detection_threshold, 2_000.0);
        assert_eq!(
            cfg.thresholds_for("btcusdt").wall_detection_threshold,
            default_wall_threshold()
        );
    }

    #[test]
    fn feed_pairs_cover_enabled_exchanges() {
        let mut cfg = FeedConfig::default();
        cfg.exchanges.truncate(2);
        cfg.exchanges[1].enabled = false;
        let pairs = cfg.feed_pairs();
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|(e, _)| e == "binance"));
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = FeedConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: FeedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.broadcast_port, cfg2.broadcast_port);
        assert_eq!(cfg.exchanges.len(), cfg2.exchanges.len());
        assert_eq!(
            cfg.pollers.open_interest_interval_secs,
            cfg2.pollers.open_interest_interval_secs
        );
    }
}
