// =============================================================================
// Client Broadcaster — external fan-out over a single multiplexed socket
// =============================================================================
//
// Serves `/ws` on the broadcast port: every connected client receives every
// broadcast JSON object as a text frame. Inbound client messages are read
// only to detect disconnect; clients cannot influence the stream. `/health`
// and `/stats` ride on the same router.
//
// Each client sits behind a bounded queue. A client that cannot keep up is
// given a short grace, then the new frame is dropped and counted; the
// fan-out task never blocks indefinitely on one client.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::app_state::{AppState, PipelineMetrics};
use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::supervisor::WorkerContext;

/// Per-client outbound queue depth.
const CLIENT_QUEUE_CAPACITY: usize = 1_024;

/// How long the fan-out waits on a full client queue before dropping the
/// frame for that client.
const SEND_GRACE: Duration = Duration::from_millis(100);

pub struct Broadcaster {
    metrics: Arc<PipelineMetrics>,
    clients: RwLock<HashMap<u64, mpsc::Sender<String>>>,
    next_client_id: AtomicU64,
    /// Subject prefixes forwarded externally; empty forwards everything.
    prefixes: Vec<String>,
}

impl Broadcaster {
    pub fn new(metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        Self {
            metrics,
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            prefixes: config.broadcast_subjects.clone(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn forwards(&self, subject: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| subject.starts_with(p.as_str()))
    }

    fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().insert(id, tx);
        info!(client_id = id, clients = self.client_count(), "broadcast client registered");
        (id, rx)
    }

    fn deregister(&self, id: u64) {
        self.clients.write().remove(&id);
        info!(client_id = id, clients = self.client_count(), "broadcast client deregistered");
    }

    /// Fan the bus out to every connected client until shutdown.
    pub async fn run(self: Arc<Self>, bus: Arc<Bus>, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut sub = bus.subscribe_all();
        let mut shutdown = ctx.shutdown.clone();
        info!(prefixes = ?self.prefixes, "broadcaster fan-out started");

        loop {
            tokio::select! {
                msg = sub.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    if !self.forwards(&msg.subject) {
                        continue;
                    }
                    let json = match serde_json::to_string(msg.event.as_ref()) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(subject = %msg.subject, error = %e, "event serialization failed");
                            continue;
                        }
                    };
                    self.fan_out(json).await;
                    ctx.frame_emitted();
                }
                _ = shutdown.changed() => {
                    info!("broadcaster stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn fan_out(&self, json: String) {
        let targets: Vec<(u64, mpsc::Sender<String>)> = self
            .clients
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.send_timeout(json.clone(), SEND_GRACE).await {
                Ok(()) => {
                    self.metrics.broadcast_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    // Slow client: drop the new frame, keep the connection.
                    self.metrics
                        .broadcast_dropped
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    closed.push(id);
                }
            }
        }
        for id in closed {
            self.deregister(id);
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Build the broadcast router: `/ws`, `/health`, `/stats`.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// One connection: forward queued broadcast frames out; read inbound only
/// to notice pings and disconnects.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let broadcaster = state.broadcaster.clone();
    let (id, mut rx) = broadcaster.register();

    let (mut sender, mut receiver) = socket.split();
    use futures_util::{SinkExt, StreamExt};

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(json) => {
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(client_id = id, error = %e, "send failed -- disconnecting");
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client_id = id, "client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Inbound payloads are ignored by design.
                    }
                    Some(Err(e)) => {
                        debug!(client_id = id, error = %e, "receive error -- disconnecting");
                        break;
                    }
                }
            }
        }
    }

    broadcaster.deregister(id);
}

// =============================================================================
// Tests
// =============================================================================
