// =============================================================================
// Liquidation History Poller
// =============================================================================
//
// Binance, Bybit and Hyperliquid stream liquidations over their WebSocket
// feeds; OKX only exposes recent liquidation orders over REST. This poller
// covers the OKX side, deduplicating on the order timestamp so each fill is
// published once on `liquidation:okx:<symbol>`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::app_state::PipelineMetrics;
use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::normalizer::{field_f64, field_ms};
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::{Liquidation, MarketEvent, Side};

use super::{http_client, rest_overrides, run_interval, targets_for};

const SUPPORTED: &[&str] = &["okx"];

pub struct LiquidationPoller {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    client: reqwest::Client,
    targets: Vec<(String, String)>,
    rest: HashMap<String, String>,
    interval: Duration,
    /// Newest liquidation timestamp seen per symbol.
    watermark: Mutex<HashMap<String, i64>>,
}

impl LiquidationPoller {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        Self {
            bus,
            metrics,
            client: http_client(),
            targets: targets_for(config, SUPPORTED),
            rest: rest_overrides(config),
            interval: Duration::from_secs(config.pollers.liquidation_interval_secs.max(1)),
            watermark: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let poller = self.clone();
        run_interval("liquidation", self.interval, ctx, move || {
            let poller = poller.clone();
            async move {
                poller.poll_all().await;
                Ok(())
            }
        })
        .await
    }

    async fn poll_all(&self) {
        for (_, symbol) in &self.targets {
            match self.fetch_okx(symbol).await {
                Ok(fills) => {
                    let fresh = self.fresh_only(symbol, fills);
                    for liq in fresh {
                        self.bus.publish(
                            symbols::liquidation_subject("okx", symbol),
                            MarketEvent::Liquidation(liq),
                        );
                    }
                }
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "liquidation fetch failed");
                    self.metrics
                        .poll_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }

    /// Drop fills at or below the per-symbol watermark, then advance it.
    fn fresh_only(&self, symbol: &str, mut fills: Vec<Liquidation>) -> Vec<Liquidation> {
        let mut watermarks = self.watermark.lock();
        let watermark = watermarks.entry(symbol.to_string()).or_insert(0);
        fills.retain(|l| l.event_time > *watermark);
        if let Some(newest) = fills.iter().map(|l| l.event_time).max() {
            *watermark = newest;
        }
        fills.sort_by_key(|l| l.event_time);
        fills
    }

    /// `GET /api/v5/public/liquidation-orders?instType=SWAP&state=filled&uly=SOL-USDT`
    async fn fetch_okx(&self, symbol: &str) -> Result<Vec<Liquidation>> {
        let base = self
            .rest
            .get("okx")
            .cloned()
            .unwrap_or_else(|| "https://www.okx.com".to_string());
        let (base_asset, quote) = symbols::split_base_quote(symbol);
        let uly = format!("{}-{}", base_asset.to_uppercase(), quote.to_uppercase());
        let url = format!(
            "{base}/api/v5/public/liquidation-orders?instType=SWAP&state=filled&uly={uly}"
        );

        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET liquidation-orders for {symbol}"))?
            .json()
            .await
            .context("failed to parse liquidation-orders body")?;

        parse_okx(symbol, &body)
    }
}

/// `{"code":"0","data":[{"details":[{"side":"sell","bkPx":"41.75","sz":"120","ts":"..."}]}]}`
fn parse_okx(symbol: &str, body: &serde_json::Value) -> Result<Vec<Liquidation>> {
    if body["code"].as_str().unwrap_or("0") != "0" {
        anyhow::bail!("okx error: {}", body["msg"]);
    }
    let mut fills = Vec::new();
    let data = body["data"].as_array().context("missing data array")?;
    for entry in data {
        let Some(details) = entry["details"].as_array() else {
            continue;
        };
        for detail in details {
            let side = match detail["side"].as_str() {
                Some("buy") => Side::Buy,
                Some("sell") => Side::Sell,
                _ => Side::Unknown,
            };
            let price = field_f64(&detail["bkPx"], "bkPx")?;
            let quantity = field_f64(&detail["sz"], "sz")?;
            let event_time = field_ms(&detail["ts"], "ts")?;
            fills.push(Liquidation {
                exchange: "okx".into(),
                symbol: symbol.to_string(),
                side,
                price,
                quantity,
                value: price * quantity,
                event_time,
                received_at: crate::types::now_ms(),
            });
        }
    }
    Ok(fills)
}
