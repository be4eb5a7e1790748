// =============================================================================
// Bybit connector — v5 public linear stream per symbol
// =============================================================================
//
// Sends a subscribe frame for publicTrade + orderbook.50 + kline.1 +
// liquidation, then keeps the session alive with `{"op":"ping"}` every
// 20 s. Bybit drops long-lived connections, so the connector reconnects
// proactively before that boundary by returning a normal exit (the
// supervisor restarts it without backoff).
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

const DEFAULT_ENDPOINT: &str = "wss://stream.bybit.com";

/// Application-level ping cadence required by the venue.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Missed-pong window: no inbound traffic for this long closes the session.
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Bybit force-disconnects sessions around the 24 h mark; leave early.
const SESSION_LIMIT: Duration = Duration::from_secs(23 * 60 * 60);

fn subscribe_frame(symbol: &str) -> String {
    let native = symbols::instrument_for("bybit", symbol);
    serde_json::json!({
        "op": "subscribe",
        "args": [
            format!("publicTrade.{native}"),
            format!("orderbook.50.{native}"),
            format!("kline.1.{native}"),
            format!("liquidation.{native}"),
        ]
    })
    .to_string()
}

pub fn stream_url(endpoint: Option<&str>) -> String {
    let base = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
    format!("{base}/v5/public/linear")
}

pub async fn run(symbol: String, endpoint: Option<String>, ctx: ConnectorContext) -> Result<()> {
    let url = stream_url(endpoint.as_deref());
    info!(symbol = %symbol, url = %url, "connecting bybit stream");

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
    let session_deadline = Instant::now() + SESSION_LIMIT;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        let events = normalizer::normalize("bybit", &symbol, &text, now_ms());
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
                        warn!(symbol = %symbol, ?frame, "bybit sent close frame");
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
                if Instant::now() >= session_deadline {
                    info!(symbol = %symbol, "bybit session limit reached -- proactive reconnect");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                if last_activity.elapsed() > STALL_TIMEOUT {
                    return Err(FeedError::TransientNetwork(format!(
                        "no pong or data for {}s", STALL_TIMEOUT.as_secs()
                    ))
                    .into());
                }
                let frame = serde_json::json!({"op": "ping"}).to_string();
                if let Err(e) = write.send(Message::Text(frame)).await {
                    return Err(FeedError::TransientNetwork(format!("ping send failed: {e}")).into());
                }
            }
            _ = shutdown.changed() => {
                info!(symbol = %symbol, "bybit connector shutting down");
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}
