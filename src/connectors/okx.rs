// =============================================================================
// OKX connector — v5 public stream per symbol
// =============================================================================
//
// Subscribes to trades + books + candle1m for the symbol's SWAP instrument.
// OKX expects a literal `ping` text frame every <30 s of silence and
// answers with a literal `pong`; both are handled here and never surface.
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

const DEFAULT_ENDPOINT: &str = "wss://ws.okx.com:8443";

const PING_INTERVAL: Duration = Duration::from_secs(25);
const STALL_TIMEOUT: Duration = Duration::from_secs(75);

fn subscribe_frame(symbol: &str) -> String {
    let inst_id = symbols::instrument_for("okx", symbol);
    serde_json::json!({
        "op": "subscribe",
        "args": [
            { "channel": "trades",   "instId": inst_id },
            { "channel": "books",    "instId": inst_id },
            { "channel": "candle1m", "instId": inst_id },
        ]
    })
    .to_string()
}

pub fn stream_url(endpoint: Option<&str>) -> String {
    let base = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
    format!("{base}/ws/v5/public")
}

pub async fn run(symbol: String, endpoint: Option<String>, ctx: ConnectorContext) -> Result<()> {
    let url = stream_url(endpoint.as_deref());
    info!(symbol = %symbol, url = %url, "connecting okx stream");

    let ws = connect_ws(&url).await?;
    ctx.metrics
        .reconnects
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let (mut write, mut read) = ws.split();
    write
        .send(Message::Text(subscribe_frame(&symbol)))
        .await
        .map_err(|e| FeedError::TransientNetwork(format!("subscribe send failed: {e}")))?;

    let mut shutdown = ctx.worker.shutdown.clone();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        // Literal keepalive reply, not JSON.
                        if text == "pong" {
                            continue;
                        }
                        let events = normalizer::normalize("okx", &symbol, &text, now_ms());
                        publish_events(&ctx, events);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_activity = Instant::now();
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(symbol = %symbol, ?frame, "okx sent close frame");
                        return Err(FeedError::TransientNetwork("server closed session".into()).into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(FeedError::TransientNetwork(format!("read error: {e}")).into());
                    }
                    None => {
                        return Err(FeedError::TransientNetwork("stream ended".into()).into());
                    }
                }
            }
            _ = ping.tick() => {
                if last_activity.elapsed() > STALL_TIMEOUT {
                    return Err(FeedError::TransientNetwork(format!(
                        "no pong or data for {}s", STALL_TIMEOUT.as_secs()
                    ))
                    .into());
                }
                if let Err(e) = write.send(Message::Text("ping".to_string())).await {
                    return Err(FeedError::TransientNetwork(format!("ping send failed: {e}")).into());
                }
            }
            _ = shutdown.changed() => {
                info!(symbol = %symbol, "okx connector shutting down");
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
    fn subscribe_frame_uses_swap_instrument() {
        let frame = subscribe_frame("solusdt");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let args = value["args"].as_array().unwrap();
        assert_eq!(args.len(), 3);
        for arg in args {
            assert_eq!(arg["instId"], "SOL-USDT-SWAP");
        }
        assert_eq!(args[0]["channel"], "trades");
        assert_eq!(args[1]["channel"], "books");
        assert_eq!(args[2]["channel"], "candle1m");
    }

    #[test]
    fn url_appends_public_path() {
        assert_eq!(stream_url(None), "wss://ws.okx.com:8443/ws/v5/public");
    }
}
