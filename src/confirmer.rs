// =============================================================================
// Publish Confirmer — reliable publish with priority queues and retry
// =============================================================================
//
// Wraps a publish sink behind four bounded priority queues (critical, high,
// medium, low; 1000 entries each). The worker drains higher priorities
// first. A failed publish is re-queued after `retry_base * attempts`
// (default 500 ms base) up to `max_retries` (default 3). Outcomes are
// retained by message id for inspection.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::errors::FeedError;
use crate::supervisor::WorkerContext;
use crate::types::{MarketEvent, Priority};
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 1_000;
const RETRY_BASE: Duration = Duration::from_millis(500);
const MAX_RETRIES: u32 = 3;
/// Completed results retained for inspection.
const RESULT_RETENTION: usize = 1_024;

/// Destination of confirmed publishes. The bus implementation never fails;
/// external sinks (persistence) may.
pub trait PublishSink: Send + Sync {
    fn publish(&self, subject: &str, event: Arc<MarketEvent>) -> anyhow::Result<()>;
}

impl PublishSink for Bus {
    fn publish(&self, subject: &str, event: Arc<MarketEvent>) -> anyhow::Result<()> {
        self.publish_arc(subject.to_string(), event);
        Ok(())
    }
}

/// Outcome of one confirmed publish.
#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub success: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

struct PendingPublish {
    id: Uuid,
    subject: String,
    event: Arc<MarketEvent>,
    priority: Priority,
    attempts: u32,
    enqueued: Instant,
}

struct ResultStore {
    by_id: HashMap<Uuid, PublishResult>,
    order: VecDeque<Uuid>,
}

impl ResultStore {
    fn record(&mut self, id: Uuid, result: PublishResult) {
        self.by_id.insert(id, result);
        self.order.push_back(id);
        while self.order.len() > RESULT_RETENTION {
            if let Some(old) = self.order.pop_front() {
                self.by_id.remove(&old);
            }
        }
    }
}

pub struct PublishConfirmer {
    sink: Arc<dyn PublishSink>,
    queues: Mutex<[VecDeque<PendingPublish>; 4]>,
    results: Mutex<ResultStore>,
    notify: Notify,
    retry_base: Duration,
    max_retries: u32,
}

impl PublishConfirmer {
    pub fn new(sink: Arc<dyn PublishSink>) -> Self {
        Self {
            sink,
            queues: Mutex::new([
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ]),
            results: Mutex::new(ResultStore {
                by_id: HashMap::new(),
                order: VecDeque::new(),
            }),
            notify: Notify::new(),
            retry_base: RETRY_BASE,
            max_retries: MAX_RETRIES,
        }
    }

    /// Queue an event for confirmed publishing. Fails when the priority's
    /// queue is full.
    pub fn enqueue(
        &self,
        subject: impl Into<String>,
        event: Arc<MarketEvent>,
        priority: Priority,
    ) -> Result<Uuid, FeedError> {
        let id = Uuid::new_v4();
        {
            let mut queues = self.queues.lock();
            let queue = &mut queues[priority.index()];
            if queue.len() >= QUEUE_CAPACITY {
                return Err(FeedError::ResourceExhausted(format!(
                    "{priority} publish queue full"
                )));
            }
            queue.push_back(PendingPublish {
                id,
                subject: subject.into(),
                event,
                priority,
                attempts: 0,
                enqueued: Instant::now(),
            });
        }
        self.notify.notify_one();
        Ok(id)
    }

    /// Result for a message id, once it has completed (or finally failed).
    pub fn result(&self, id: &Uuid) -> Option<PublishResult> {
        self.results.lock().by_id.get(id).cloned()
    }

    /// Messages currently waiting, across all priorities.
    pub fn backlog(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }

    fn pop_next(&self) -> Option<PendingPublish> {
        let mut queues = self.queues.lock();
        for queue in queues.iter_mut() {
            if let Some(pending) = queue.pop_front() {
                return Some(pending);
            }
        }
        None
    }

    fn requeue_later(self: &Arc<Self>, pending: PendingPublish) {
        let delay = self.retry_base * pending.attempts;
        let confirmer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut queues = confirmer.queues.lock();
            let queue = &mut queues[pending.priority.index()];
            if queue.len() >= QUEUE_CAPACITY {
                // Dropping the retry is the bounded-queue policy; record
                // the terminal failure instead of blocking.
                let result = PublishResult {
                    success: false,
                    attempts: pending.attempts,
                    error: Some("retry queue full".into()),
                    duration_ms: pending.enqueued.elapsed().as_millis() as u64,
                };
                drop(queues);
                confirmer.results.lock().record(pending.id, result);
                return;
            }
            queue.push_back(pending);
            drop(queues);
            confirmer.notify.notify_one();
        });
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut shutdown = ctx.shutdown.clone();
        info!("publish confirmer started");

        loop {
            let Some(mut pending) = self.pop_next() else {
                tokio::select! {
                    _ = self.notify.notified() => continue,
                    _ = shutdown.changed() => return Ok(()),
                }
            };

            pending.attempts += 1;
            match self.sink.publish(&pending.subject, pending.event.clone()) {
                Ok(()) => {
                    let result = PublishResult {
                        success: true,
                        attempts: pending.attempts,
                        error: None,
                        duration_ms: pending.enqueued.elapsed().as_millis() as u64,
                    };
                    debug!(subject = %pending.subject, attempts = pending.attempts, "publish confirmed");
                    self.results.lock().record(pending.id, result);
                    ctx.frame_emitted();
                }
                Err(err) => {
                    if pending.attempts <= self.max_retries {
                        warn!(
                            subject = %pending.subject,
                            attempts = pending.attempts,
                            error = %err,
                            "publish failed -- scheduling retry"
                        );
                        self.requeue_later(pending);
                    } else {
                        let result = PublishResult {
                            success: false,
                            attempts: pending.attempts,
                            error: Some(format!("{err:#}")),
                            duration_ms: pending.enqueued.elapsed().as_millis() as u64,
                        };
                        warn!(
                            subject = %pending.subject,
                            attempts = pending.attempts,
                            "publish failed permanently"
                        );
                        self.results.lock().record(pending.id, result);
                    }
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawFrame;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use tokio::sync::watch;

    fn event(n: u64) -> Arc<MarketEvent> {
        Arc::new(MarketEvent::Raw(RawFrame {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            payload: n.to_string(),
            received_at: n as i64,
        }))
    }

    fn worker_ctx() -> (watch::Sender<bool>, WorkerContext) {
        let (tx, rx) = watch::channel(false);
        (
            tx,
            WorkerContext {
                shutdown: rx,
                progress: Arc::new(AtomicU64::new(0)),
            },
        )
    }

    /// Sink that fails the first `failures` attempts.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
    }

    impl PublishSink for FlakySink {
        fn publish(&self, _subject: &str, _event: Arc<MarketEvent>) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("sink unavailable (attempt {n})")
            }
            Ok(())
        }
    }

    #[test]
    fn drain_order_is_priority_first() {
        let confirmer = PublishConfirmer::new(Arc::new(Bus::new(16)));
        confirmer.enqueue("a", event(1), Priority::Low).unwrap();
        confirmer.enqueue("b", event(2), Priority::Medium).unwrap();
        confirmer.enqueue("c", event(3), Priority::Critical).unwrap();
        confirmer.enqueue("d", event(4), Priority::High).unwrap();

        let order: Vec<Priority> = std::iter::from_fn(|| confirmer.pop_next())
            .map(|p| p.priority)
            .collect();
        assert_eq!(
            order,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Medium,
                Priority::Low
            ]
        );
    }

    #[test]
    fn full_queue_rejects_with_resource_exhausted() {
        let confirmer = PublishConfirmer::new(Arc::new(Bus::new(16)));
        for n in 0..QUEUE_CAPACITY {
            confirmer
                .enqueue("s", event(n as u64), Priority::Low)
                .unwrap();
        }
        let err = confirmer
            .enqueue("s", event(9_999), Priority::Low)
            .unwrap_err();
        assert!(matches!(err, FeedError::ResourceExhausted(_)));
        // Other priorities are unaffected.
        assert!(confirmer.enqueue("s", event(1), Priority::High).is_ok());
    }

    #[tokio::test]
    async fn successful_publish_lands_on_bus_and_records_result() {
        let bus = Arc::new(Bus::new(16));
        let mut sub = bus.subscribe("snapshots:binance:solusdt");
        let confirmer = Arc::new(PublishConfirmer::new(bus.clone() as Arc<dyn PublishSink>));

        let id = confirmer
            .enqueue("snapshots:binance:solusdt", event(7), Priority::Medium)
            .unwrap();

        let (tx, ctx) = worker_ctx();
        let runner = tokio::spawn(confirmer.clone().run(ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
        let _ = runner.await;

        assert!(sub.try_recv().is_some());
        let result = confirmer.result(&id).expect("result recorded");
        assert!(result.success);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn flaky_sink_retries_until_success() {
        let sink = Arc::new(FlakySink {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let mut confirmer = PublishConfirmer::new(sink.clone() as Arc<dyn PublishSink>);
        // Short retry base keeps the test fast.
        confirmer.retry_base = Duration::from_millis(5);
        let confirmer = Arc::new(confirmer);

        let id = confirmer
            .enqueue("subject", event(1), Priority::High)
            .unwrap();

        let (tx, ctx) = worker_ctx();
        let runner = tokio::spawn(confirmer.clone().run(ctx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(true);
        let _ = runner.await;

        let result = confirmer.result(&id).expect("result recorded");
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_record_failure() {
        let sink = Arc::new(FlakySink {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let mut confirmer = PublishConfirmer::new(sink as Arc<dyn PublishSink>);
        confirmer.retry_base = Duration::from_millis(2);
        let confirmer = Arc::new(confirmer);

        let id = confirmer
            .enqueue("subject", event(1), Priority::Critical)
            .unwrap();

        let (tx, ctx) = worker_ctx();
        let runner = tokio::spawn(confirmer.clone().run(ctx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(true);
        let _ = runner.await;

        let result = confirmer.result(&id).expect("result recorded");
        assert!(!result.success);
        assert_eq!(result.attempts, MAX_RETRIES + 1);
        assert!(result.error.is_some());
    }
}
