// =============================================================================
// Open Interest Poller
// =============================================================================
//
// Outstanding contract counts from Binance, Bybit and OKX, published on
// `meta:oi:<exchange>:<symbol>`. OI swings combined with price direction
// are interpreted downstream; this poller only normalizes units.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::app_state::PipelineMetrics;
use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::normalizer::{field_f64, field_ms};
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::{now_ms, MarketEvent, OpenInterest};

use super::{http_client, rest_overrides, run_interval, targets_for};

const SUPPORTED: &[&str] = &["binance", "bybit", "okx"];

pub struct OpenInterestPoller {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    client: reqwest::Client,
    targets: Vec<(String, String)>,
    rest: HashMap<String, String>,
    interval: Duration,
}

impl OpenInterestPoller {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        Self {
            bus,
            metrics,
            client: http_client(),
            targets: targets_for(config, SUPPORTED),
            rest: rest_overrides(config),
            interval: Duration::from_secs(config.pollers.open_interest_interval_secs.max(1)),
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let poller = self.clone();
        run_interval("open_interest", self.interval, ctx, move || {
            let poller = poller.clone();
            async move {
                poller.poll_all().await;
                Ok(())
            }
        })
        .await
    }

    async fn poll_all(&self) {
        for (exchange, symbol) in &self.targets {
            match self.fetch(exchange, symbol).await {
                Ok(state) => {
                    self.bus.publish(
                        symbols::open_interest_subject(exchange, symbol),
                        MarketEvent::OpenInterest(state),
                    );
                }
                Err(e) => {
                    debug!(exchange = %exchange, symbol = %symbol, error = %e, "open interest fetch failed");
                    self.metrics
                        .poll_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }

    fn base(&self, exchange: &str, fallback: &str) -> String {
        self.rest
            .get(exchange)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    async fn fetch(&self, exchange: &str, symbol: &str) -> Result<OpenInterest> {
        let body: serde_json::Value = match exchange {
            "binance" => {
                let base = self.base("binance", "https://fapi.binance.com");
                let native = symbols::instrument_for("binance", symbol);
                let url = format!("{base}/fapi/v1/openInterest?symbol={native}");
                self.client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("GET openInterest for {symbol}"))?
                    .json()
                    .await
                    .context("failed to parse openInterest body")?
            }
            "bybit" => {
                let base = self.base("bybit", "https://api.bybit.com");
                let native = symbols::instrument_for("bybit", symbol);
                let url = format!(
                    "{base}/v5/market/open-interest?category=linear&symbol={native}&intervalTime=5min&limit=1"
                );
                self.client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("GET open-interest for {symbol}"))?
                    .json()
                    .await
                    .context("failed to parse open-interest body")?
            }
            "okx" => {
                let base = self.base("okx", "https://www.okx.com");
                let inst_id = symbols::instrument_for("okx", symbol);
                let url =
                    format!("{base}/api/v5/public/open-interest?instType=SWAP&instId={inst_id}");
                self.client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("GET open-interest for {symbol}"))?
                    .json()
                    .await
                    .context("failed to parse open-interest body")?
            }
            other => anyhow::bail!("open interest unsupported on {other}"),
        };
        parse(exchange, symbol, &body)
    }
}

fn parse(exchange: &str, symbol: &str, body: &serde_json::Value) -> Result<OpenInterest> {
    match exchange {
        // `{"openInterest":"123456.7","symbol":"SOLUSDT","time":...}`
        "binance" => Ok(OpenInterest {
            exchange: "binance".into(),
            symbol: symbol.to_string(),
            open_interest: field_f64(&body["openInterest"], "openInterest")?,
            event_time: body["time"].as_i64().unwrap_or_else(now_ms),
        }),
        // `{"retCode":0,"result":{"list":[{"openInterest":"...","timestamp":"..."}]}}`
        "bybit" => {
            if body["retCode"].as_i64().unwrap_or(0) != 0 {
                anyhow::bail!("bybit error: {}", body["retMsg"]);
            }
            let entry = body["result"]["list"]
                .as_array()
                .and_then(|a| a.first())
                .context("empty open-interest list")?;
            Ok(OpenInterest {
                exchange: "bybit".into(),
                symbol: symbol.to_string(),
                open_interest: field_f64(&entry["openInterest"], "openInterest")?,
                event_time: field_ms(&entry["timestamp"], "timestamp")
                    .unwrap_or_else(|_| now_ms()),
            })
        }
        // `{"code":"0","data":[{"oi":"...","ts":"..."}]}`
        "okx" => {
            if body["code"].as_str().unwrap_or("0") != "0" {
                anyhow::bail!("okx error: {}", body["msg"]);
            }
            let entry = body["data"]
                .as_array()
                .and_then(|a| a.first())
                .context("empty open-interest data")?;
            Ok(OpenInterest {
                exchange: "okx".into(),
                symbol: symbol.to_string(),
                open_interest: field_f64(&entry["oi"], "oi")?,
                event_time: field_ms(&entry["ts"], "ts").unwrap_or_else(|_| now_ms()),
            })
        }
        other => anyhow::bail!("open interest unsupported on {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_three_envelopes_parse() {
        let binance: serde_json::Value = serde_json::json!({
            "openInterest": "123456.7", "symbol": "SOLUSDT", "time": 1700000000000i64
        });
        assert_eq!(
            parse("binance", "solusdt", &binance).unwrap().open_interest,
            123_456.7
        );

        let bybit: serde_json::Value = serde_json::json!({
            "retCode": 0,
            "result": {"list": [{"openInterest": "98765.4", "timestamp": "1700000000000"}]}
        });
        assert_eq!(
            parse("bybit", "solusdt", &bybit).unwrap().open_interest,
            98_765.4
        );

        let okx: serde_json::Value = serde_json::json!({
            "code": "0",
            "data": [{"oi": "55555.5", "ts": "1700000000000"}]
        });
        assert_eq!(
            parse("okx", "solusdt", &okx).unwrap().open_interest,
            55_555.5
        );
    }

    #[test]
    fn exchange_errors_are_skipped() {
        let bybit: serde_json::Value = serde_json::json!({"retCode": 10001, "retMsg": "bad"});
        assert!(parse("bybit", "solusdt", &bybit).is_err());
    }
}
