// =============================================================================
// Insurance Fund Poller
// =============================================================================
//
// Exchange insurance-fund balances, polled slowly (default 5 min) from OKX
// and published on `meta:insurance:okx`. A shrinking fund during cascades
// is a market-stress signal for downstream consumers.
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
use crate::types::{now_ms, InsuranceFund, MarketEvent};

use super::{http_client, rest_overrides, run_interval};

pub struct InsurancePoller {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    client: reqwest::Client,
    rest: HashMap<String, String>,
    interval: Duration,
    enabled: bool,
}

impl InsurancePoller {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        let okx_enabled = config
            .enabled_exchanges()
            .any(|e| e.name == "okx");
        Self {
            bus,
            metrics,
            client: http_client(),
            rest: rest_overrides(config),
            interval: Duration::from_secs(config.pollers.insurance_interval_secs.max(1)),
            enabled: okx_enabled,
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        if !self.enabled {
            // Nothing to poll; park until shutdown.
            let mut shutdown = ctx.shutdown.clone();
            let _ = shutdown.changed().await;
            return Ok(());
        }

        let poller = self.clone();
        run_interval("insurance", self.interval, ctx, move || {
            let poller = poller.clone();
            async move {
                poller.poll_once().await;
                Ok(())
            }
        })
        .await
    }

    async fn poll_once(&self) {
        match self.fetch_okx().await {
            Ok(funds) => {
                for fund in funds {
                    self.bus.publish(
                        symbols::insurance_subject("okx"),
                        MarketEvent::InsuranceFund(fund),
                    );
                }
            }
            Err(e) => {
                debug!(error = %e, "insurance fund fetch failed");
                self.metrics
                    .poll_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    /// `GET /api/v5/public/insurance-fund?instType=SWAP`
    async fn fetch_okx(&self) -> Result<Vec<InsuranceFund>> {
        let base = self
            .rest
            .get("okx")
            .cloned()
            .unwrap_or_else(|| "https://www.okx.com".to_string());
        let url = format!("{base}/api/v5/public/insurance-fund?instType=SWAP");

        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET insurance-fund")?
            .json()
            .await
            .context("failed to parse insurance-fund body")?;

        parse_okx(&body)
    }
}

/// `{"code":"0","data":[{"total":"...","details":[{"balance":"...","ccy":"USDT","ts":"..."}]}]}`
fn parse_okx(body: &serde_json::Value) -> Result<Vec<InsuranceFund>> {
    if body["code"].as_str().unwrap_or("0") != "0" {
        anyhow::bail!("okx error: {}", body["msg"]);
    }
    let entry = body["data"]
        .as_array()
        .and_then(|a| a.first())
        .context("empty insurance-fund data")?;

    let mut funds = Vec::new();
    if let Some(details) = entry["details"].as_array() {
        for detail in details {
            let asset = detail["ccy"].as_str().unwrap_or("unknown").to_lowercase();
            let balance = field_f64(&detail["balance"], "balance")?;
            let event_time = field_ms(&detail["ts"], "ts").unwrap_or_else(|_| now_ms());
            funds.push(InsuranceFund {
                exchange: "okx".into(),
                asset,
                balance,
                event_time,
            });
        }
    }
    anyhow::ensure!(!funds.is_empty(), "insurance-fund response had no details");
    Ok(funds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn okx_details_parse_per_asset() {
        let body: serde_json::Value = serde_json::json!({
            "code": "0",
            "data": [{
                "total": "700000000",
                "details": [
                    {"balance": "500000000", "ccy": "USDT", "ts": "1700000000000"},
                    {"balance": "4000",      "ccy": "BTC",  "ts": "1700000000000"}
                ]
            }]
        });
        let funds = parse_okx(&body).unwrap();
        assert_eq!(funds.len(), 2);
        assert_eq!(funds[0].asset, "usdt");
        assert_eq!(funds[0].balance, 500_000_000.0);
        assert_eq!(funds[1].asset, "btc");
    }

    #[test]
    fn empty_details_is_an_error() {
        let body: serde_json::Value =
            serde_json::json!({"code": "0", "data": [{"total": "1", "details": []}]});
        assert!(parse_okx(&body).is_err());
    }
}
