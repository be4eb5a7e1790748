// =============================================================================
// Internal Bus — process-local pub/sub over named subjects
// =============================================================================
//
// Publishers enqueue typed `MarketEvent`s under colon-delimited subjects;
// subscribers receive them in publish order per subject. Slow subscribers
// never block publishers: each subscription sits on a bounded broadcast
// queue and, on overflow, the oldest messages are dropped and counted.
//
// Three subscription shapes:
//   - `subscribe(subject)`  — exactly one subject.
//   - `subscribe_prefix(p)` — every subject starting with `p` (engines use
//     this to follow e.g. all `depth:` subjects).
//   - `subscribe_all()`     — the firehose (the broadcaster uses this).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::MarketEvent;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

/// A published message: subject plus shared event payload.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: Arc<str>,
    pub event: Arc<MarketEvent>,
}

/// Named-subject pub/sub bus.
pub struct Bus {
    subjects: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    firehose: broadcast::Sender<BusMessage>,
    queue_capacity: usize,
    published: AtomicU64,
}

impl Bus {
    pub fn new(queue_capacity: usize) -> Self {
        let capacity = queue_capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            subjects: RwLock::new(HashMap::new()),
            firehose,
            queue_capacity: capacity,
            published: AtomicU64::new(0),
        }
    }

    /// Publish an event under `subject`. Never blocks; returns the number
    /// of per-subject subscribers that will see it.
    pub fn publish(&self, subject: impl Into<String>, event: MarketEvent) -> usize {
        self.publish_arc(subject, Arc::new(event))
    }

    /// Publish an already-shared event without cloning the payload.
    pub fn publish_arc(&self, subject: impl Into<String>, event: Arc<MarketEvent>) -> usize {
        let subject: String = subject.into();
        let msg = BusMessage {
            subject: Arc::from(subject.as_str()),
            event,
        };

        self.published.fetch_add(1, Ordering::Relaxed);

        // Firehose first; send only fails when nobody is listening.
        let _ = self.firehose.send(msg.clone());

        // Fast path: subject channel already exists.
        if let Some(tx) = self.subjects.read().get(&subject) {
            return tx.send(msg).unwrap_or(0);
        }

        // No channel yet -- only create one if a subscriber shows up later;
        // publishing into the void is normal during startup.
        debug!(subject = %subject, "publish with no per-subject channel");
        0
    }

    /// Subscribe to exactly one subject.
    pub fn subscribe(&self, subject: &str) -> Subscription {
        let rx = {
            let mut map = self.subjects.write();
            map.entry(subject.to_string())
                .or_insert_with(|| broadcast::channel(self.queue_capacity).0)
                .subscribe()
        };
        Subscription {
            rx,
            prefix: None,
            dropped: 0,
        }
    }

    /// Subscribe to every subject starting with `prefix`.
    pub fn subscribe_prefix(&self, prefix: &str) -> Subscription {
        Subscription {
            rx: self.firehose.subscribe(),
            prefix: Some(prefix.to_string()),
            dropped: 0,
        }
    }

    /// Subscribe to everything published on the bus.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.firehose.subscribe(),
            prefix: None,
            dropped: 0,
        }
    }

    /// Total messages published since startup.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of distinct subjects with at least one subscriber channel.
    pub fn subject_count(&self) -> usize {
        self.subjects.read().len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// A bounded subscription. Overflow drops the oldest messages and counts
/// them; the subscriber keeps receiving from the oldest retained message.
pub struct Subscription {
    rx: broadcast::Receiver<BusMessage>,
    prefix: Option<String>,
    dropped: u64,
}

impl Subscription {
    /// Receive the next matching message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if self.matches(&msg) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when no matching message is queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if self.matches(&msg) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// Messages dropped on this subscription due to queue overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn matches(&self, msg: &BusMessage) -> bool {
        match &self.prefix {
            Some(prefix) => msg.subject.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RawFrame, SnapshotRequest};

    fn raw_event(n: u64) -> MarketEvent {
        MarketEvent::Raw(RawFrame {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            payload: n.to_string(),
            received_at: n as i64,
        })
    }

    fn payload_of(msg: &BusMessage) -> u64 {
        match msg.event.as_ref() {
            MarketEvent::Raw(raw) => raw.payload.parse().unwrap(),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_subject_delivery_in_publish_order() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe("trade:binance:solusdt");

        for n in 0..5 {
            bus.publish("trade:binance:solusdt", raw_event(n));
        }
        bus.publish("trade:binance:btcusdt", raw_event(99));

        for n in 0..5 {
            let msg = sub.recv().await.unwrap();
            assert_eq!(payload_of(&msg), n);
        }
        // The other subject's message never lands on this subscription.
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn prefix_subscription_filters_firehose() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe_prefix("depth:");

        bus.publish("trade:binance:solusdt", raw_event(1));
        bus.publish("depth:binance:solusdt", raw_event(2));
        bus.publish("depth:okx:btcusdt", raw_event(3));

        assert_eq!(payload_of(&sub.recv().await.unwrap()), 2);
        assert_eq!(payload_of(&sub.recv().await.unwrap()), 3);
        assert!(sub.try_recv().is_none());
    }

    /// Slow-subscriber overflow: capacity 1024, 2000 messages published
    /// before the subscriber reads any. It receives the most recent 1024
    /// and the drop counter records the 976 lost; the publisher never
    /// blocked.
    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = Bus::new(1_024);
        let mut sub = bus.subscribe("orderbook:solusdt");

        for n in 0..2_000 {
            bus.publish("orderbook:solusdt", raw_event(n));
        }

        let mut received = Vec::new();
        while let Some(msg) = sub.try_recv() {
            received.push(payload_of(&msg));
        }

        assert_eq!(received.len(), 1_024);
        assert_eq!(received[0], 976);
        assert_eq!(*received.last().unwrap(), 1_999);
        assert_eq!(sub.dropped(), 976);
    }

    #[tokio::test]
    async fn firehose_sees_everything() {
        let bus = Bus::new(16);
        let mut all = bus.subscribe_all();

        bus.publish(
            crate::symbols::SNAPSHOT_REQUESTS,
            MarketEvent::SnapshotRequest(SnapshotRequest {
                exchange: "bybit".into(),
                symbol: "ethusdt".into(),
                priority: crate::types::Priority::Low,
                reason: "stale".into(),
                event_time: 0,
            }),
        );
        bus.publish("candles:ethusdt:1m", raw_event(7));

        let first = all.recv().await.unwrap();
        assert_eq!(first.subject.as_ref(), "snapshot_requests");
        let second = all.recv().await.unwrap();
        assert_eq!(second.subject.as_ref(), "candles:ethusdt:1m");
        assert_eq!(bus.published(), 2);
    }
}
