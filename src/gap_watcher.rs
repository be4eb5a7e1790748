// =============================================================================
// Depth-Gap Watcher — sequence continuity tracking per (exchange, symbol)
// =============================================================================
//
// Follows every depth subject and keeps a SequenceTracker per feed. A gap
// in the exchange sequence numbers is classified by size:
//
//   gap <= small threshold (10)        -> warning log only
//   small < gap < critical (100)       -> SnapshotRequest { medium }
//   gap >= critical threshold          -> SnapshotRequest { high }
//
// A tracker that has seen data but then goes silent past the staleness
// window (30 s) raises a low-priority request. Gap events are published on
// `gap_detection`, requests on `snapshot_requests`; the snapshot fetcher
// consumes the latter and re-seeds the book.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app_state::PipelineMetrics;
use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::{now_ms, DepthDelta, GapEvent, MarketEvent, Priority, SnapshotRequest};

/// Cadence of the staleness scan.
const STALE_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Per-feed sequence statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceTracker {
    pub last_sequence: u64,
    #[serde(skip)]
    pub last_update: Option<Instant>,
    pub gap_count: u64,
    pub total_updates: u64,
    pub largest_gap: u64,
    /// Set when a stale-feed request has been raised and no data has
    /// arrived since, so the watcher does not re-request every scan.
    #[serde(skip)]
    stale_flagged: bool,
}

impl SequenceTracker {
    fn new() -> Self {
        Self {
            last_sequence: 0,
            last_update: None,
            gap_count: 0,
            total_updates: 0,
            largest_gap: 0,
            stale_flagged: false,
        }
    }
}

/// What one observation produced.
#[derive(Debug, PartialEq, Eq)]
pub enum GapCheck {
    /// First sequence seen, or contiguous advance.
    Ok,
    /// Sequence below the tracker; logged and ignored.
    OutOfOrder,
    /// Discontinuity of the given size.
    Gap { size: u64, priority: Option<Priority> },
    /// Delta carried no sequence; not tracked.
    Untracked,
}

pub struct DepthGapWatcher {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    trackers: HashMap<String, SequenceTracker>,
    small_threshold: u64,
    critical_threshold: u64,
    stale_after: Duration,
}

impl DepthGapWatcher {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        Self {
            bus,
            metrics,
            trackers: HashMap::new(),
            small_threshold: config.gap_small_threshold,
            critical_threshold: config.gap_critical_threshold,
            stale_after: Duration::from_secs(config.stale_after_secs),
        }
    }

    pub async fn run(mut self, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut sub = self.bus.subscribe_prefix("depth:");
        let mut shutdown = ctx.shutdown.clone();
        let mut scan = tokio::time::interval(STALE_SCAN_INTERVAL);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            small = self.small_threshold,
            critical = self.critical_threshold,
            "depth-gap watcher started"
        );

        loop {
            tokio::select! {
                msg = sub.recv() => {
                    match msg {
                        Some(msg) => {
                            if let MarketEvent::Depth(delta) = msg.event.as_ref() {
                                self.observe(delta);
                                ctx.frame_emitted();
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = scan.tick() => self.scan_stale(),
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Feed one delta through the tracker for its (exchange, symbol).
    pub fn observe(&mut self, delta: &DepthDelta) -> GapCheck {
        let sequence = match delta.update_id {
            Some(seq) => seq,
            None => return GapCheck::Untracked,
        };

        let key = format!("{}:{}", delta.exchange, delta.symbol);
        let tracker = self
            .trackers
            .entry(key)
            .or_insert_with(SequenceTracker::new);

        tracker.total_updates += 1;
        let now = Instant::now();
        tracker.stale_flagged = false;

        // First observation, or a snapshot re-seed: adopt the sequence.
        if tracker.last_update.is_none() || delta.is_snapshot {
            tracker.last_sequence = sequence;
            tracker.last_update = Some(now);
            return GapCheck::Ok;
        }

        let expected = tracker.last_sequence + 1;
        tracker.last_update = Some(now);

        if sequence < expected {
            debug!(
                exchange = %delta.exchange,
                symbol = %delta.symbol,
                sequence,
                last = tracker.last_sequence,
                "out-of-order depth delta ignored"
            );
            return GapCheck::OutOfOrder;
        }

        if sequence == expected {
            tracker.last_sequence = sequence;
            return GapCheck::Ok;
        }

        // Discontinuity.
        let size = sequence - expected;
        tracker.gap_count += 1;
        tracker.largest_gap = tracker.largest_gap.max(size);
        tracker.last_sequence = sequence;
        self.metrics
            .gaps
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let priority = if size >= self.critical_threshold {
            Some(Priority::High)
        } else if size > self.small_threshold {
            Some(Priority::Medium)
        } else {
            None
        };

        let event_time = now_ms();
        self.bus.publish(
            symbols::GAP_DETECTION,
            MarketEvent::Gap(GapEvent {
                exchange: delta.exchange.clone(),
                symbol: delta.symbol.clone(),
                expected,
                received: sequence,
                size,
                event_time,
            }),
        );

        match priority {
            Some(priority) => {
                warn!(
                    exchange = %delta.exchange,
                    symbol = %delta.symbol,
                    size,
                    %priority,
                    "sequence gap -- requesting snapshot"
                );
                self.request_snapshot(
                    &delta.exchange,
                    &delta.symbol,
                    priority,
                    format!("sequence gap of {size}"),
                );
            }
            None => {
                warn!(
                    exchange = %delta.exchange,
                    symbol = %delta.symbol,
                    size,
                    "small sequence gap tolerated"
                );
            }
        }

        GapCheck::Gap { size, priority }
    }

    /// Raise a low-priority request for feeds that went silent.
    fn scan_stale(&mut self) {
        let now = Instant::now();
        let mut stale: Vec<(String, String)> = Vec::new();

        for (key, tracker) in self.trackers.iter_mut() {
            let Some(last) = tracker.last_update else {
                continue;
            };
            if tracker.stale_flagged || now.duration_since(last) <= self.stale_after {
                continue;
            }
            tracker.stale_flagged = true;
            if let Some((exchange, symbol)) = key.split_once(':') {
                stale.push((exchange.to_string(), symbol.to_string()));
            }
        }

        for (exchange, symbol) in stale {
            warn!(exchange = %exchange, symbol = %symbol, "depth feed stale -- requesting snapshot");
            self.request_snapshot(
                &exchange,
                &symbol,
                Priority::Low,
                "no depth updates past staleness window".to_string(),
            );
        }
    }

    fn request_snapshot(&self, exchange: &str, symbol: &str, priority: Priority, reason: String) {
        self.metrics
            .snapshot_requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bus.publish(
            symbols::SNAPSHOT_REQUESTS,
            MarketEvent::SnapshotRequest(SnapshotRequest {
                exchange: exchange.to_string(),
                symbol: symbol.to_string(),
                priority,
                reason,
                event_time: now_ms(),
            }),
        );
    }

    /// Tracker statistics for `/stats`.
    pub fn tracker(&self, exchange: &str, symbol: &str) -> Option<&SequenceTracker> {
        self.trackers.get(&format!("{exchange}:{symbol}"))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceLevel;

    fn watcher(bus: Arc<Bus>) -> DepthGapWatcher {
        DepthGapWatcher::new(bus, Arc::new(PipelineMetrics::default()), &FeedConfig::default())
    }

    fn depth(update_id: u64) -> DepthDelta {
        DepthDelta {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            bids: vec![PriceLevel(100.0, 1.0)],
            asks: vec![PriceLevel(101.0, 1.0)],
            event_time: update_id as i64,
            received_at: update_id as i64,
            update_id: Some(update_id),
            first_update_id: Some(update_id),
            is_snapshot: false,
            checksum: None,
        }
    }

    /// Tracker at 1000; deltas 1001, 1002 advance it; 1150 is a gap of 148
    /// producing exactly one high-priority snapshot request.
    #[tokio::test]
    async fn critical_gap_raises_one_high_priority_request() {
        let bus = Arc::new(Bus::new(64));
        let mut requests = bus.subscribe(symbols::SNAPSHOT_REQUESTS);
        let mut gaps = bus.subscribe(symbols::GAP_DETECTION);
        let mut watcher = watcher(bus);

        assert_eq!(watcher.observe(&depth(1_000)), GapCheck::Ok);
        assert_eq!(watcher.observe(&depth(1_001)), GapCheck::Ok);
        assert_eq!(watcher.observe(&depth(1_002)), GapCheck::Ok);
        assert_eq!(
            watcher.tracker("binance", "solusdt").unwrap().last_sequence,
            1_002
        );

        let check = watcher.observe(&depth(1_150));
        assert_eq!(
            check,
            GapCheck::Gap {
                size: 147,
                priority: Some(Priority::High)
            }
        );

        let msg = requests.try_recv().expect("one request expected");
        match msg.event.as_ref() {
            MarketEvent::SnapshotRequest(req) => {
                assert_eq!(req.priority, Priority::High);
                assert_eq!(req.exchange, "binance");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(requests.try_recv().is_none(), "exactly one request");

        match gaps.try_recv().expect("gap event").event.as_ref() {
            MarketEvent::Gap(gap) => {
                assert_eq!(gap.expected, 1_003);
                assert_eq!(gap.received, 1_150);
                assert_eq!(gap.size, 147);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let tracker = watcher.tracker("binance", "solusdt").unwrap();
        assert_eq!(tracker.gap_count, 1);
        assert_eq!(tracker.largest_gap, 147);
        assert_eq!(tracker.last_sequence, 1_150);
    }

    #[tokio::test]
    async fn small_gap_logs_without_request() {
        let bus = Arc::new(Bus::new(64));
        let mut requests = bus.subscribe(symbols::SNAPSHOT_REQUESTS);
        let mut watcher = watcher(bus);

        watcher.observe(&depth(100));
        let check = watcher.observe(&depth(105));
        assert_eq!(
            check,
            GapCheck::Gap {
                size: 4,
                priority: None
            }
        );
        assert!(requests.try_recv().is_none());
    }

    #[tokio::test]
    async fn medium_gap_requests_medium_priority() {
        let bus = Arc::new(Bus::new(64));
        let mut requests = bus.subscribe(symbols::SNAPSHOT_REQUESTS);
        let mut watcher = watcher(bus);

        watcher.observe(&depth(100));
        let check = watcher.observe(&depth(151));
        assert_eq!(
            check,
            GapCheck::Gap {
                size: 50,
                priority: Some(Priority::Medium)
            }
        );
        let msg = requests.try_recv().expect("request expected");
        match msg.event.as_ref() {
            MarketEvent::SnapshotRequest(req) => assert_eq!(req.priority, Priority::Medium),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn out_of_order_is_ignored() {
        let bus = Arc::new(Bus::new(64));
        let mut watcher = watcher(bus);

        watcher.observe(&depth(500));
        watcher.observe(&depth(501));
        assert_eq!(watcher.observe(&depth(400)), GapCheck::OutOfOrder);
        assert_eq!(
            watcher.tracker("binance", "solusdt").unwrap().last_sequence,
            501
        );
    }

    #[tokio::test]
    async fn untracked_deltas_skip_tracking() {
        let bus = Arc::new(Bus::new(64));
        let mut watcher = watcher(bus);

        let mut delta = depth(1);
        delta.update_id = None;
        assert_eq!(watcher.observe(&delta), GapCheck::Untracked);
        assert!(watcher.tracker("binance", "solusdt").is_none());
    }

    #[tokio::test]
    async fn snapshot_reseeds_sequence_without_gap() {
        let bus = Arc::new(Bus::new(64));
        let mut requests = bus.subscribe(symbols::SNAPSHOT_REQUESTS);
        let mut watcher = watcher(bus);

        watcher.observe(&depth(100));
        let mut snap = depth(5_000);
        snap.is_snapshot = true;
        assert_eq!(watcher.observe(&snap), GapCheck::Ok);
        assert!(requests.try_recv().is_none());
        assert_eq!(watcher.observe(&depth(5_001)), GapCheck::Ok);
    }
}
