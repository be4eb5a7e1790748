// =============================================================================
// Funding Rate Poller — perpetual funding across venues
// =============================================================================
//
// Funding rates are the periodic payments anchoring perpetual prices to
// spot. Polled from Binance (premiumIndex, which also carries the mark
// price), Bybit (tickers) and OKX (funding-rate); published on
// `funding:<exchange>:<symbol>` in canonical decimal units.
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
use crate::types::{now_ms, FundingRate, MarketEvent};

use super::{http_client, rest_overrides, run_interval, targets_for};

const SUPPORTED: &[&str] = &["binance", "bybit", "okx"];

pub struct FundingPoller {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    client: reqwest::Client,
    targets: Vec<(String, String)>,
    rest: HashMap<String, String>,
    interval: Duration,
}

impl FundingPoller {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        Self {
            bus,
            metrics,
            client: http_client(),
            targets: targets_for(config, SUPPORTED),
            rest: rest_overrides(config),
            interval: Duration::from_secs(config.pollers.funding_interval_secs.max(1)),
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let poller = self.clone();
        run_interval("funding", self.interval, ctx, move || {
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
                    debug!(
                        exchange = %exchange,
                        symbol = %symbol,
                        rate = state.funding_rate,
                        "funding rate fetched"
                    );
                    self.bus.publish(
                        symbols::funding_subject(exchange, symbol),
                        MarketEvent::Funding(state),
                    );
                }
                Err(e) => {
                    debug!(exchange = %exchange, symbol = %symbol, error = %e, "funding fetch failed");
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

    async fn fetch(&self, exchange: &str, symbol: &str) -> Result<FundingRate> {
        match exchange {
            "binance" => self.fetch_binance(symbol).await,
            "bybit" => self.fetch_bybit(symbol).await,
            "okx" => self.fetch_okx(symbol).await,
            other => anyhow::bail!("funding unsupported on {other}"),
        }
    }

    /// `GET /fapi/v1/premiumIndex?symbol=` ->
    /// `{"markPrice":"...","lastFundingRate":"...","nextFundingTime":...}`
    async fn fetch_binance(&self, symbol: &str) -> Result<FundingRate> {
        let base = self.base("binance", "https://fapi.binance.com");
        let native = symbols::instrument_for("binance", symbol);
        let url = format!("{base}/fapi/v1/premiumIndex?symbol={native}");

        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET premiumIndex for {symbol}"))?
            .json()
            .await
            .context("failed to parse premiumIndex body")?;

        parse_binance(symbol, &body)
    }

    /// `GET /v5/market/tickers?category=linear&symbol=` ->
    /// `{"retCode":0,"result":{"list":[{"fundingRate":"...","markPrice":"...",
    ///   "nextFundingTime":"..."}]}}`
    async fn fetch_bybit(&self, symbol: &str) -> Result<FundingRate> {
        let base = self.base("bybit", "https://api.bybit.com");
        let native = symbols::instrument_for("bybit", symbol);
        let url = format!("{base}/v5/market/tickers?category=linear&symbol={native}");

        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET tickers for {symbol}"))?
            .json()
            .await
            .context("failed to parse tickers body")?;

        parse_bybit(symbol, &body)
    }

    /// `GET /api/v5/public/funding-rate?instId=` ->
    /// `{"code":"0","data":[{"fundingRate":"...","nextFundingTime":"..."}]}`
    async fn fetch_okx(&self, symbol: &str) -> Result<FundingRate> {
        let base = self.base("okx", "https://www.okx.com");
        let inst_id = symbols::instrument_for("okx", symbol);
        let url = format!("{base}/api/v5/public/funding-rate?instId={inst_id}");

        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET funding-rate for {symbol}"))?
            .json()
            .await
            .context("failed to parse funding-rate body")?;

        parse_okx(symbol, &body)
    }
}

fn parse_binance(symbol: &str, body: &serde_json::Value) -> Result<FundingRate> {
    let funding_rate = field_f64(&body["lastFundingRate"], "lastFundingRate")?;
    let next_funding_time = body["nextFundingTime"].as_i64().unwrap_or(0);
    let mark_price = field_f64(&body["markPrice"], "markPrice").ok();

    Ok(FundingRate {
        exchange: "binance".into(),
        symbol: symbol.to_string(),
        funding_rate,
        next_funding_time,
        mark_price,
        event_time: body["time"].as_i64().unwrap_or_else(now_ms),
    })
}

fn parse_bybit(symbol: &str, body: &serde_json::Value) -> Result<FundingRate> {
    if body["retCode"].as_i64().unwrap_or(0) != 0 {
        anyhow::bail!("bybit error: {}", body["retMsg"]);
    }
    let entry = body["result"]["list"]
        .as_array()
        .and_then(|a| a.first())
        .context("empty tickers list")?;

    Ok(FundingRate {
        exchange: "bybit".into(),
        symbol: symbol.to_string(),
        funding_rate: field_f64(&entry["fundingRate"], "fundingRate")?,
        next_funding_time: field_ms(&entry["nextFundingTime"], "nextFundingTime").unwrap_or(0),
        mark_price: field_f64(&entry["markPrice"], "markPrice").ok(),
        event_time: now_ms(),
    })
}

fn parse_okx(symbol: &str, body: &serde_json::Value) -> Result<FundingRate> {
    if body["code"].as_str().unwrap_or("0") != "0" {
        anyhow::bail!("okx error: {}", body["msg"]);
    }
    let entry = body["data"]
        .as_array()
        .and_then(|a| a.first())
        .context("empty funding-rate data")?;

    Ok(FundingRate {
        exchange: "okx".into(),
        symbol: symbol.to_string(),
        funding_rate: field_f64(&entry["fundingRate"], "fundingRate")?,
        next_funding_time: field_ms(&entry["nextFundingTime"], "nextFundingTime").unwrap_or(0),
        mark_price: None,
        event_time: field_ms(&entry["fundingTime"], "fundingTime").unwrap_or_else(|_| now_ms()),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_premium_index_parses() {
        let body: serde_json::Value = serde_json::json!({
            "symbol": "SOLUSDT",
            "markPrice": "42.15",
            "lastFundingRate": "0.00010000",
            "nextFundingTime": 1700028800000i64,
            "time": 1700000000000i64
        });
        let state = parse_binance("solusdt", &body).unwrap();
        assert!((state.funding_rate - 0.0001).abs() < 1e-12);
        assert_eq!(state.next_funding_time, 1_700_028_800_000);
        assert_eq!(state.mark_price, Some(42.15));
        assert_eq!(state.event_time, 1_700_000_000_000);
    }

    #[test]
    fn bybit_tickers_parse_and_reject_errors() {
        let body: serde_json::Value = serde_json::json!({
            "retCode": 0,
            "result": { "list": [{
                "fundingRate": "-0.00025",
                "markPrice": "42.10",
                "nextFundingTime": "1700028800000"
            }]}
        });
        let state = parse_bybit("solusdt", &body).unwrap();
        assert!((state.funding_rate + 0.00025).abs() < 1e-12);
        assert_eq!(state.mark_price, Some(42.10));

        let err_body: serde_json::Value =
            serde_json::json!({"retCode": 10001, "retMsg": "params error"});
        assert!(parse_bybit("solusdt", &err_body).is_err());
    }

    #[test]
    fn okx_funding_rate_parses() {
        let body: serde_json::Value = serde_json::json!({
            "code": "0",
            "data": [{
                "fundingRate": "0.0000375",
                "fundingTime": "1700028800000",
                "nextFundingTime": "1700057600000"
            }]
        });
        let state = parse_okx("solusdt", &body).unwrap();
        assert!((state.funding_rate - 0.0000375).abs() < 1e-12);
        assert_eq!(state.next_funding_time, 1_700_057_600_000);
        assert_eq!(state.event_time, 1_700_028_800_000);
    }
}
