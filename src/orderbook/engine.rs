// =============================================================================
// Order-Book Engine — owns per-symbol book state, publishes derived snapshots
// =============================================================================
//
// The engine task exclusively owns every BookState; other components read
// book data only through the `orderbook:<symbol>` snapshots it publishes.
// Snapshot publication is throttled per symbol (default 200 ms) and stale
// snapshots never regress: update ids are nondecreasing per symbol.
//
// Gap handling: a non-contiguous delta is refused by the book (which marks
// itself stale); the depth-gap watcher raises the snapshot request. An
// invariant violation resets the book and the engine itself requests a
// high-priority snapshot.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::app_state::PipelineMetrics;
use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::{now_ms, DepthDelta, MarketEvent, Priority, SnapshotRequest};

use super::book::{ApplyOutcome, BookState};

pub struct OrderBookEngine {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    books: HashMap<String, BookState>,
    wall_thresholds: HashMap<String, f64>,
    default_wall_threshold: f64,
    publish_interval: Duration,
    last_publish: HashMap<String, Instant>,
    last_published_update_id: HashMap<String, u64>,
}

impl OrderBookEngine {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        let mut wall_thresholds = HashMap::new();
        for (symbol, thresholds) in &config.thresholds {
            wall_thresholds.insert(symbol.clone(), thresholds.wall_detection_threshold);
        }
        Self {
            bus,
            metrics,
            books: HashMap::new(),
            wall_thresholds,
            default_wall_threshold: crate::config::SymbolThresholds::default()
                .wall_detection_threshold,
            publish_interval: Duration::from_millis(config.orderbook_publish_interval_ms),
            last_publish: HashMap::new(),
            last_published_update_id: HashMap::new(),
        }
    }

    /// Subscribe to every depth subject and run until shutdown.
    pub async fn run(mut self, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut sub = self.bus.subscribe_prefix("depth:");
        let mut shutdown = ctx.shutdown.clone();
        info!("order-book engine started");

        loop {
            tokio::select! {
                msg = sub.recv() => {
                    match msg {
                        Some(msg) => {
                            if let MarketEvent::Depth(delta) = msg.event.as_ref() {
                                self.on_depth(delta);
                                ctx.frame_emitted();
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = shutdown.changed() => {
                    info!("order-book engine stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Apply one delta and publish the derived snapshot if due.
    pub fn on_depth(&mut self, delta: &DepthDelta) {
        let key = book_key(&delta.exchange, &delta.symbol);
        let book = self
            .books
            .entry(key.clone())
            .or_insert_with(|| BookState::new(delta.exchange.clone(), delta.symbol.clone()));

        match book.apply(delta) {
            ApplyOutcome::Applied | ApplyOutcome::Reset => {
                self.publish_snapshot(&key, delta);
            }
            ApplyOutcome::Duplicate => {}
            ApplyOutcome::Gap { expected, received } => {
                // The gap watcher owns classification and the snapshot
                // request; here the book is simply held stale.
                warn!(
                    exchange = %delta.exchange,
                    symbol = %delta.symbol,
                    expected,
                    received,
                    "depth delta refused -- book stale pending snapshot"
                );
            }
            ApplyOutcome::InvariantViolation { detail } => {
                error!(
                    exchange = %delta.exchange,
                    symbol = %delta.symbol,
                    detail = %detail,
                    "book invariant violated -- reset and requesting snapshot"
                );
                self.metrics.invariant_violations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.bus.publish(
                    symbols::SNAPSHOT_REQUESTS,
                    MarketEvent::SnapshotRequest(SnapshotRequest {
                        exchange: delta.exchange.clone(),
                        symbol: delta.symbol.clone(),
                        priority: Priority::High,
                        reason: format!("invariant violation: {detail}"),
                        event_time: now_ms(),
                    }),
                );
            }
        }
    }

    fn publish_snapshot(&mut self, key: &str, delta: &DepthDelta) {
        let now = Instant::now();
        if let Some(last) = self.last_publish.get(key) {
            if now.duration_since(*last) < self.publish_interval {
                return;
            }
        }

        let book = match self.books.get(key) {
            Some(b) => b,
            None => return,
        };
        let threshold = self
            .wall_thresholds
            .get(&delta.symbol)
            .copied()
            .unwrap_or(self.default_wall_threshold);

        let snapshot = match book.snapshot(threshold, delta.event_time) {
            Some(s) => s,
            None => return,
        };

        // Never publish a snapshot older than one already sent.
        if let (Some(id), Some(last_id)) =
            (snapshot.update_id, self.last_published_update_id.get(key))
        {
            if id < *last_id {
                return;
            }
        }

        if let Some(id) = snapshot.update_id {
            self.last_published_update_id.insert(key.to_string(), id);
        }
        self.last_publish.insert(key.to_string(), now);
        self.bus.publish(
            symbols::orderbook_subject(&delta.symbol),
            MarketEvent::OrderBook(snapshot),
        );
    }

    #[cfg(test)]
    fn book(&self, exchange: &str, symbol: &str) -> Option<&BookState> {
        self.books.get(&book_key(exchange, symbol))
    }
}

fn book_key(exchange: &str, symbol: &str) -> String {
    format!("{exchange}:{symbol}")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceLevel;

    fn engine() -> OrderBookEngine {
        let mut config = FeedConfig::default();
        // No throttle in tests.
        config.orderbook_publish_interval_ms = 0;
        OrderBookEngine::new(
            Arc::new(Bus::new(64)),
            Arc::new(PipelineMetrics::default()),
            &config,
        )
    }

    fn depth(
        bids: &[(f64, f64)],
        asks: &[(f64, f64)],
        update_id: u64,
        is_snapshot: bool,
    ) -> DepthDelta {
        DepthDelta {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            bids: bids.iter().map(|&(p, s)| PriceLevel(p, s)).collect(),
            asks: asks.iter().map(|&(p, s)| PriceLevel(p, s)).collect(),
            event_time: update_id as i64,
            received_at: update_id as i64,
            update_id: Some(update_id),
            first_update_id: Some(update_id),
            is_snapshot,
            checksum: None,
        }
    }

    #[tokio::test]
    async fn snapshot_published_on_apply() {
        let eng = engine();
        let mut sub = eng.bus.subscribe("orderbook:solusdt");
        let mut eng = eng;

        eng.on_depth(&depth(&[(100.0, 1.0)], &[(101.0, 2.0)], 1, true));

        let msg = sub.try_recv().expect("snapshot expected");
        match msg.event.as_ref() {
            MarketEvent::OrderBook(snap) => {
                assert_eq!(snap.best_bid, 100.0);
                assert_eq!(snap.best_ask, 101.0);
                assert!(!snap.is_stale);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn gap_holds_book_and_snapshot_resumes() {
        let mut eng = engine();
        eng.on_depth(&depth(&[(100.0, 1.0)], &[(101.0, 2.0)], 1_000, true));
        // Contiguous deltas advance the book.
        eng.on_depth(&depth(&[(99.0, 1.0)], &[], 1_001, false));
        eng.on_depth(&depth(&[(98.0, 1.0)], &[], 1_002, false));
        assert_eq!(
            eng.book("binance", "solusdt").unwrap().last_applied_update_id,
            Some(1_002)
        );

        // A jump to 1150 is refused and the book goes stale.
        eng.on_depth(&depth(&[(97.0, 5.0)], &[], 1_150, false));
        let book = eng.book("binance", "solusdt").unwrap();
        assert!(book.is_stale);
        assert_eq!(book.last_applied_update_id, Some(1_002));

        // Fresh snapshot restores service.
        eng.on_depth(&depth(&[(100.0, 2.0)], &[(101.0, 1.0)], 1_200, true));
        let book = eng.book("binance", "solusdt").unwrap();
        assert!(!book.is_stale);
        assert_eq!(book.last_applied_update_id, Some(1_200));
    }

    #[tokio::test]
    async fn invariant_violation_requests_snapshot() {
        let eng = engine();
        let mut requests = eng.bus.subscribe(symbols::SNAPSHOT_REQUESTS);
        let mut eng = eng;

        eng.on_depth(&depth(&[(100.0, 1.0)], &[(101.0, 2.0)], 1, true));
        eng.on_depth(&depth(&[(100.0, -3.0)], &[], 2, false));

        let msg = requests.try_recv().expect("snapshot request expected");
        match msg.event.as_ref() {
            MarketEvent::SnapshotRequest(req) => {
                assert_eq!(req.priority, Priority::High);
                assert_eq!(req.symbol, "solusdt");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttle_suppresses_rapid_publishes() {
        let mut config = FeedConfig::default();
        config.orderbook_publish_interval_ms = 10_000;
        let bus = Arc::new(Bus::new(64));
        let mut eng = OrderBookEngine::new(
            bus.clone(),
            Arc::new(PipelineMetrics::default()),
            &config,
        );
        let mut sub = bus.subscribe("orderbook:solusdt");

        eng.on_depth(&depth(&[(100.0, 1.0)], &[(101.0, 2.0)], 1, true));
        eng.on_depth(&depth(&[(99.0, 1.0)], &[], 2, false));
        eng.on_depth(&depth(&[(98.0, 1.0)], &[], 3, false));

        // Only the first apply publishes inside the throttle window.
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }
}
