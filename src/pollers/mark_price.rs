// =============================================================================
// Mark Price Poller
// =============================================================================
//
// Derivatives mark prices from Binance (premiumIndex) and OKX (mark-price),
// published on `meta:mark_price:<exchange>:<symbol>`.
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
use crate::types::{now_ms, MarkPrice, MarketEvent};

use super::{http_client, rest_overrides, run_interval, targets_for};

const SUPPORTED: &[&str] = &["binance", "okx"];

pub struct MarkPricePoller {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    client: reqwest::Client,
    targets: Vec<(String, String)>,
    rest: HashMap<String, String>,
    interval: Duration,
}

impl MarkPricePoller {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        Self {
            bus,
            metrics,
            client: http_client(),
            targets: targets_for(config, SUPPORTED),
            rest: rest_overrides(config),
            interval: Duration::from_secs(config.pollers.mark_price_interval_secs.max(1)),
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let poller = self.clone();
        run_interval("mark_price", self.interval, ctx, move || {
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
                        symbols::mark_price_subject(exchange, symbol),
                        MarketEvent::MarkPrice(state),
                    );
                }
                Err(e) => {
                    debug!(exchange = %exchange, symbol = %symbol, error = %e, "mark price fetch failed");
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

    async fn fetch(&self, exchange: &str, symbol: &str) -> Result<MarkPrice> {
        match exchange {
            "binance" => {
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
            "okx" => {
                let base = self.base("okx", "https://www.okx.com");
                let inst_id = symbols::instrument_for("okx", symbol);
                let url =
                    format!("{base}/api/v5/public/mark-price?instType=SWAP&instId={inst_id}");
                let body: serde_json::Value = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("GET mark-price for {symbol}"))?
                    .json()
                    .await
                    .context("failed to parse mark-price body")?;
                parse_okx(symbol, &body)
            }
            other => anyhow::bail!("mark price unsupported on {other}"),
        }
    }
}

fn parse_binance(symbol: &str, body: &serde_json::Value) -> Result<MarkPrice> {
    Ok(MarkPrice {
        exchange: "binance".into(),
        symbol: symbol.to_string(),
        mark_price: field_f64(&body["markPrice"], "markPrice")?,
        event_time: body["time"].as_i64().unwrap_or_else(now_ms),
    })
}

fn parse_okx(symbol: &str, body: &serde_json::Value) -> Result<MarkPrice> {
    if body["code"].as_str().unwrap_or("0") != "0" {
        anyhow::bail!("okx error: {}", body["msg"]);
    }
    let entry = body["data"]
        .as_array()
        .and_then(|a| a.first())
        .context("empty mark-price data")?;
    Ok(MarkPrice {
        exchange: "okx".into(),
        symbol: symbol.to_string(),
        mark_price: field_f64(&entry["markPx"], "markPx")?,
        event_time: field_ms(&entry["ts"], "ts").unwrap_or_else(|_| now_ms()),
    })
}
