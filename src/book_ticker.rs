// =============================================================================
// Book-Ticker Aggregator — throttled best-bid/ask summaries
// =============================================================================
//
// Tracks top-of-book per (exchange, symbol) by applying only the best level
// of each depth delta, then publishes derived tickers (spread, mid,
// imbalance) on a fixed timer (default 200 ms) for every entry with both
// sides present.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::{BookTicker, DepthDelta, MarketEvent};

#[derive(Debug, Clone, Default)]
struct TopOfBook {
    best_bid: f64,
    best_bid_size: f64,
    best_ask: f64,
    best_ask_size: f64,
    event_time: i64,
}

pub struct BookTickerAggregator {
    bus: Arc<Bus>,
    tops: RwLock<HashMap<String, TopOfBook>>,
    interval: Duration,
}

impl BookTickerAggregator {
    pub fn new(bus: Arc<Bus>, config: &FeedConfig) -> Self {
        Self {
            bus,
            tops: RwLock::new(HashMap::new()),
            interval: Duration::from_millis(config.book_ticker_interval_ms.max(1)),
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut sub = self.bus.subscribe_prefix("depth:");
        let mut shutdown = ctx.shutdown.clone();
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "book-ticker aggregator started");

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
                _ = tick.tick() => self.publish_tickers(),
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Apply the top-of-book element of one delta.
    pub fn on_depth(&self, delta: &DepthDelta) {
        // Highest-priced live bid / lowest-priced live ask in this delta.
        let top_bid = delta
            .bids
            .iter()
            .filter(|l| l.size() > 0.0)
            .max_by(|a, b| a.price().total_cmp(&b.price()));
        let top_ask = delta
            .asks
            .iter()
            .filter(|l| l.size() > 0.0)
            .min_by(|a, b| a.price().total_cmp(&b.price()));

        let mut tops = self.tops.write();
        let entry = tops
            .entry(format!("{}:{}", delta.exchange, delta.symbol))
            .or_default();

        if let Some(bid) = top_bid {
            if delta.is_snapshot || bid.price() >= entry.best_bid || entry.best_bid == 0.0 {
                entry.best_bid = bid.price();
                entry.best_bid_size = bid.size();
            }
        }
        // A deletion at the current best bid invalidates it until the next
        // better level shows up.
        if delta
            .bids
            .iter()
            .any(|l| l.size() == 0.0 && l.price() == entry.best_bid)
        {
            entry.best_bid = 0.0;
            entry.best_bid_size = 0.0;
        }

        if let Some(ask) = top_ask {
            if delta.is_snapshot
                || entry.best_ask == 0.0
                || ask.price() <= entry.best_ask
            {
                entry.best_ask = ask.price();
                entry.best_ask_size = ask.size();
            }
        }
        if delta
            .asks
            .iter()
            .any(|l| l.size() == 0.0 && l.price() == entry.best_ask)
        {
            entry.best_ask = 0.0;
            entry.best_ask_size = 0.0;
        }

        entry.event_time = delta.event_time;
    }

    /// Publish a ticker for every entry with both sides present.
    pub fn publish_tickers(&self) {
        let snapshot: Vec<(String, TopOfBook)> = self
            .tops
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, top) in snapshot {
            if top.best_bid <= 0.0 || top.best_ask <= 0.0 {
                continue;
            }
            let Some((exchange, symbol)) = key.split_once(':') else {
                continue;
            };

            let mid = (top.best_bid + top.best_ask) / 2.0;
            let spread = top.best_ask - top.best_bid;
            let spread_percent = if mid > 0.0 { (spread / mid) * 100.0 } else { 0.0 };
            let size_total = top.best_bid_size + top.best_ask_size;
            let imbalance = if size_total > 0.0 {
                top.best_bid_size / size_total
            } else {
                0.0
            };

            self.bus.publish(
                symbols::book_ticker_subject(exchange, symbol),
                MarketEvent::Ticker(BookTicker {
                    exchange: exchange.to_string(),
                    symbol: symbol.to_string(),
                    best_bid: top.best_bid,
                    best_bid_size: top.best_bid_size,
                    best_ask: top.best_ask,
                    best_ask_size: top.best_ask_size,
                    mid,
                    spread,
                    spread_percent,
                    imbalance,
                    event_time: top.event_time,
                }),
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
