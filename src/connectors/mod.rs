// =============================================================================
// Exchange Connectors — one streaming session per (exchange, symbol)
// =============================================================================
//
// Each connector owns a single WebSocket session subscribed to the minimal
// subject set for its symbol (trades + incremental depth + native klines +
// liquidations where the venue streams them). Control frames (pings, pongs,
// subscription acks) are handled inside the connector and never surface as
// events.
//
// Connectors do not reconnect themselves: on any failure they return a
// transient error and the supervisor applies backoff. Venues with
// application-level pings run them on a dedicated timer; a session that
// goes silent past its stall window is closed with a transient error.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod hyperliquid;
pub mod okx;
pub mod snapshot_fetcher;

pub use snapshot_fetcher::SnapshotFetcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

use crate::app_state::PipelineMetrics;
use crate::bus::Bus;
use crate::errors::classify_connect_error;
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::MarketEvent;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect deadline for every venue.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dependencies handed to every connector worker.
#[derive(Clone)]
pub struct ConnectorContext {
    pub bus: Arc<Bus>,
    pub metrics: Arc<PipelineMetrics>,
    pub worker: WorkerContext,
}

/// Establish a WebSocket session with a connect timeout. Failures are
/// classified transient vs. fatal for the supervisor.
pub async fn connect_ws(url: &str) -> Result<WsStream> {
    let attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url)).await;
    match attempt {
        Ok(Ok((stream, _response))) => {
            info!(url = %url, "websocket connected");
            Ok(stream)
        }
        Ok(Err(err)) => {
            let err = anyhow::Error::from(err).context(format!("connect to {url}"));
            Err(classify_connect_error(&err).into())
        }
        Err(_) => {
            let err = anyhow::anyhow!("connect to {url} timed out");
            Err(classify_connect_error(&err).into())
        }
    }
}

/// Route canonical events from one frame onto their bus subjects.
pub fn publish_events(ctx: &ConnectorContext, events: Vec<MarketEvent>) {
    for event in events {
        let subject = match &event {
            MarketEvent::Trade(t) => symbols::trade_subject(&t.exchange, &t.symbol),
            MarketEvent::Depth(d) => symbols::depth_subject(&d.exchange, &d.symbol),
            MarketEvent::Candle(c) => symbols::candle_subject(&c.symbol, &c.timeframe),
            MarketEvent::Liquidation(l) => {
                symbols::liquidation_subject(&l.exchange, &l.symbol)
            }
            MarketEvent::Raw(r) => {
                ctx.metrics
                    .raw_events
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                symbols::raw_subject(&r.exchange, &r.symbol)
            }
            other => {
                // Connectors only produce the ingest event family.
                tracing::debug!(event = ?other, "connector produced unexpected event type");
                continue;
            }
        };
        ctx.bus.publish(subject, event);
        ctx.worker.frame_emitted();
        ctx.metrics
            .frames
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================
