// =============================================================================
// Periodic REST Pollers — funding / mark price / open interest / liquidations
// / insurance fund
// =============================================================================
//
// Each poller runs on its own interval, issues one HTTP GET per supported
// (exchange, symbol) tuple, converts the exchange envelope to canonical
// units, and publishes on its typed subject. HTTP errors and non-zero
// exchange error codes are logged and skipped; the next tick retries.
// =============================================================================

pub mod funding;
pub mod insurance;
pub mod liquidation;
pub mod mark_price;
pub mod open_interest;

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::FeedConfig;
use crate::supervisor::WorkerContext;

pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the shared HTTP client used by every poller.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .expect("failed to build reqwest client for pollers")
}

/// REST endpoint overrides by exchange name.
pub(crate) fn rest_overrides(config: &FeedConfig) -> HashMap<String, String> {
    config
        .exchanges
        .iter()
        .filter_map(|e| {
            e.rest_endpoint
                .as_ref()
                .map(|rest| (e.name.clone(), rest.clone()))
        })
        .collect()
}

/// (exchange, symbol) pairs restricted to venues a poller supports.
pub(crate) fn targets_for(config: &FeedConfig, supported: &[&str]) -> Vec<(String, String)> {
    config
        .feed_pairs()
        .into_iter()
        .filter(|(exchange, _)| supported.contains(&exchange.as_str()))
        .collect()
}

/// Drive `poll` every `interval` until shutdown. Failures inside one tick
/// are the poller's to log; this loop only reports them.
pub(crate) async fn run_interval<F, Fut>(
    name: &'static str,
    interval: Duration,
    ctx: WorkerContext,
    mut poll: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let mut shutdown = ctx.shutdown.clone();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(poller = name, interval_secs = interval.as_secs(), "poller started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = poll().await {
                    warn!(poller = name, error = %e, "poll tick failed");
                }
                ctx.frame_emitted();
            }
            _ = shutdown.changed() => {
                info!(poller = name, "poller stopping");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_filter_by_supported_exchanges() {
        let config = FeedConfig::default();
        let targets = targets_for(&config, &["binance", "okx"]);
        assert!(!targets.is_empty());
        assert!(targets
            .iter()
            .all(|(e, _)| e == "binance" || e == "okx"));
        // Default config has 3 symbols on each of the two venues.
        assert_eq!(targets.len(), 6);
    }
}
