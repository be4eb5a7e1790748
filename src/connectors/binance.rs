// =============================================================================
// Binance connector — combined futures stream per symbol
// =============================================================================
//
// Subscribes via the combined-stream URL (no subscribe frames needed):
// aggTrade + depth@100ms + kline_1m + forceOrder. Binance pings at the
// WebSocket protocol level; the connector answers with pongs and treats a
// silent session as dead after the stall window.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::errors::FeedError;
use crate::normalizer;
use crate::symbols;
use crate::types::now_ms;

use super::{connect_ws, publish_events, ConnectorContext};

const DEFAULT_ENDPOINT: &str = "wss://fstream.binance.com";

/// No inbound traffic for this long means the session is dead.
const STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Streams subscribed for each symbol.
fn stream_names(symbol: &str) -> Vec<String> {
    let native = symbols::instrument_for("binance", symbol).to_lowercase();
    vec![
        format!("{native}@aggTrade"),
        format!("{native}@depth@100ms"),
        format!("{native}@kline_1m"),
        format!("{native}@forceOrder"),
    ]
}

pub fn stream_url(endpoint: Option<&str>, symbol: &str) -> String {
    let base = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
    format!("{base}/stream?streams={}", stream_names(symbol).join("/"))
}

/// Run one session until error, disconnect, or shutdown.
pub async fn run(symbol: String, endpoint: Option<String>, ctx: ConnectorContext) -> Result<()> {
    let url = stream_url(endpoint.as_deref(), &symbol);
    info!(symbol = %symbol, url = %url, "connecting binance stream");

    let ws = connect_ws(&url).await?;
    ctx.metrics
        .reconnects
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let (mut write, mut read) = ws.split();
    let mut shutdown = ctx.worker.shutdown.clone();
    let mut stall_check = tokio::time::interval(Duration::from_secs(30));
    stall_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        let events = normalizer::normalize("binance", &symbol, &text, now_ms());
                        publish_events(&ctx, events);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_activity = Instant::now();
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            return Err(FeedError::TransientNetwork(format!(
                                "pong send failed: {e}"
                            ))
                            .into());
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(symbol = %symbol, ?frame, "binance sent close frame");
                        return Err(FeedError::TransientNetwork("server closed session".into()).into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(FeedError::TransientNetwork(format!("read error: {e}")).into());
                    }
                    None => {
                        warn!(symbol = %symbol, "binance stream ended");
                        return Err(FeedError::TransientNetwork("stream ended".into()).into());
                    }
                }
            }
            _ = stall_check.tick() => {
                if last_activity.elapsed() > STALL_TIMEOUT {
                    return Err(FeedError::TransientNetwork(format!(
                        "no frames for {}s", STALL_TIMEOUT.as_secs()
                    ))
                    .into());
                }
            }
            _ = shutdown.changed() => {
                info!(symbol = %symbol, "binance connector shutting down");
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_stream_url_contains_all_streams() {
        let url = stream_url(None, "solusdt");
        assert!(url.starts_with("wss://fstream.binance.com/stream?streams="));
        assert!(url.contains("solusdt@aggTrade"));
        assert!(url.contains("solusdt@depth@100ms"));
        assert!(url.contains("solusdt@kline_1m"));
        assert!(url.contains("solusdt@forceOrder"));
    }

    #[test]
    fn endpoint_override_is_respected() {
        let url = stream_url(Some("wss://testnet.binancefuture.com/"), "btcusdt");
        assert!(url.starts_with("wss://testnet.binancefuture.com/stream?streams=btcusdt@"));
    }
}
