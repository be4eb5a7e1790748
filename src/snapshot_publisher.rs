// =============================================================================
// Periodic Snapshot Publisher — fixed-interval book snapshots
// =============================================================================
//
// Follows the `orderbook:` subjects, keeps the latest snapshot per
// (exchange, symbol), and forwards each one on
// `snapshots:<exchange>:<symbol>` at a fixed interval through the publish
// confirmer. Consumers that missed live updates (recovery, caching) read
// these instead of touching engine internals.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::confirmer::PublishConfirmer;
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::{MarketEvent, OrderBookSnapshot, Priority};

pub struct SnapshotPublisher {
    bus: Arc<Bus>,
    confirmer: Arc<PublishConfirmer>,
    latest: Mutex<HashMap<String, Arc<MarketEvent>>>,
    interval: Duration,
}

impl SnapshotPublisher {
    pub fn new(bus: Arc<Bus>, confirmer: Arc<PublishConfirmer>, config: &FeedConfig) -> Self {
        Self {
            bus,
            confirmer,
            latest: Mutex::new(HashMap::new()),
            interval: Duration::from_secs(config.snapshot_publish_interval_secs.max(1)),
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut sub = self.bus.subscribe_prefix("orderbook:");
        let mut shutdown = ctx.shutdown.clone();
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "snapshot publisher started");

        loop {
            tokio::select! {
                msg = sub.recv() => {
                    match msg {
                        Some(msg) => {
                            if let MarketEvent::OrderBook(snap) = msg.event.as_ref() {
                                self.remember(snap, msg.event.clone());
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = tick.tick() => {
                    self.publish_all();
                    ctx.frame_emitted();
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn remember(&self, snap: &OrderBookSnapshot, event: Arc<MarketEvent>) {
        // Stale snapshots are not worth caching for recovery.
        if snap.is_stale {
            return;
        }
        let key = format!("{}:{}", snap.exchange, snap.symbol);
        self.latest.lock().insert(key, event);
    }

    fn publish_all(&self) {
        let entries: Vec<(String, Arc<MarketEvent>)> = self
            .latest
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, event) in entries {
            let Some((exchange, symbol)) = key.split_once(':') else {
                continue;
            };
            let subject = symbols::snapshots_subject(exchange, symbol);
            if let Err(e) = self.confirmer.enqueue(subject, event, Priority::Low) {
                debug!(key = %key, error = %e, "snapshot enqueue dropped");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
