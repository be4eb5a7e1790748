// =============================================================================
// Hyperliquid connector — trades + l2Book per coin
// =============================================================================
//
// Subscriptions are JSON method frames, one per feed. The venue expects
// `{"method":"ping"}` periodically and answers on the `pong` channel
// (filtered by the normalizer as a control frame).
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

const DEFAULT_ENDPOINT: &str = "wss://api.hyperliquid.xyz";

const PING_INTERVAL: Duration = Duration::from_secs(50);
const STALL_TIMEOUT: Duration = Duration::from_secs(150);

fn subscribe_frames(symbol: &str) -> Vec<String> {
    let coin = symbols::instrument_for("hyperliquid", symbol);
    vec![
        serde_json::json!({
            "method": "subscribe",
            "subscription": { "type": "trades", "coin": coin }
        })
        .to_string(),
        serde_json::json!({
            "method": "subscribe",
            "subscription": { "type": "l2Book", "coin": coin }
        })
        .to_string(),
    ]
}

pub fn stream_url(endpoint: Option<&str>) -> String {
    let base = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
    format!("{base}/ws")
}

pub async fn run(symbol: String, endpoint: Option<String>, ctx: ConnectorContext) -> Result<()> {
    let url = stream_url(endpoint.as_deref());
    info!(symbol = %symbol, url = %url, "connecting hyperliquid stream");

    let ws = connect_ws(&url).await?;
    ctx.metrics
        .reconnects
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let (mut write, mut read) = ws.split();
    for frame in subscribe_frames(&symbol) {
        write
            .send(Message::Text(frame))
            .await
            .map_err(|e| FeedError::TransientNetwork(format!("subscribe send failed: {e}")))?;
    }

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
                        let events = normalizer::normalize("hyperliquid", &symbol, &text, now_ms());
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
                        warn!(symbol = %symbol, ?frame, "hyperliquid sent close frame");
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
                let frame = serde_json::json!({"method": "ping"}).to_string();
                if let Err(e) = write.send(Message::Text(frame)).await {
                    return Err(FeedError::TransientNetwork(format!("ping send failed: {e}")).into());
                }
            }
            _ = shutdown.changed() => {
                info!(symbol = %symbol, "hyperliquid connector shutting down");
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
    fn subscribe_frames_cover_trades_and_book() {
        let frames = subscribe_frames("solusdt");
        assert_eq!(frames.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["subscription"]["type"], "trades");
        assert_eq!(first["subscription"]["coin"], "SOL");
        let second: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(second["subscription"]["type"], "l2Book");
    }

    #[test]
    fn url_appends_ws_path() {
        assert_eq!(stream_url(None), "wss://api.hyperliquid.xyz/ws");
    }
}
