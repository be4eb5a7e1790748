// =============================================================================
// Supervisor — named workers with bounded exponential backoff
// =============================================================================
//
// Runs a fixed set of named workers (connectors, engines, pollers). Each
// worker is an async factory invoked per attempt; the supervisor owns the
// restart loop, so workers simply return `Err` on transient failure and
// `Ok(())` on normal exit.
//
// State machine per worker:
//
//   stopped -> starting -> running -> (normal exit) -> stopped
//                                  -> (error) -> retrying -> starting
//                                  -> (cancel) -> stopping -> stopped
//   retrying -> failed when retries >= max_retries (max_retries > 0)
//
// Worker panics are caught via the task's JoinError and treated as
// transient errors. A health loop every 30 s flags workers that sit in
// `running` for over five minutes without progress (progress = frames
// emitted since the last sample, reported through `WorkerContext`).
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::errors::FeedError;

/// Health-loop cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
/// A running worker with no progress for this long is flagged as stuck.
const STUCK_AFTER: Duration = Duration::from_secs(300);
/// An attempt that survives this long resets the retry counter.
const RETRY_RESET_AFTER: Duration = Duration::from_secs(60);

// =============================================================================
// Policy and status
// =============================================================================

/// Backoff policy: `delay = min(max, initial * factor^(retries - 1))`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// 0 means retry forever.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            factor: 2.0,
            max_retries: 0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `retries + 1`, with `retries >= 1` failures seen.
    pub fn delay(&self, retries: u32) -> Duration {
        if retries == 0 {
            return Duration::ZERO;
        }
        let exp = self.factor.powi(retries.saturating_sub(1) as i32);
        let raw = self.initial.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.max.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    Retrying,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time report for one worker, for `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub name: String,
    pub status: WorkerStatus,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub frames: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

// =============================================================================
// Worker plumbing
// =============================================================================

/// Handed to every worker attempt: shutdown signal plus a progress counter
/// the worker bumps once per emitted frame.
#[derive(Clone)]
pub struct WorkerContext {
    pub shutdown: watch::Receiver<bool>,
    pub progress: Arc<AtomicU64>,
}

impl WorkerContext {
    pub fn frame_emitted(&self) {
        self.progress.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

type WorkerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type WorkerFactory = Box<dyn Fn(WorkerContext) -> WorkerFuture + Send + Sync>;

struct WorkerState {
    status: WorkerStatus,
    retries: u32,
    last_error: Option<String>,
    start_time: Option<Instant>,
    last_progress_sample: u64,
}

struct Worker {
    name: String,
    policy: BackoffPolicy,
    factory: WorkerFactory,
    state: Mutex<WorkerState>,
    progress: Arc<AtomicU64>,
}

impl Worker {
    fn set_status(&self, status: WorkerStatus) {
        self.state.lock().status = status;
    }
}

// =============================================================================
// Supervisor
// =============================================================================

pub struct Supervisor {
    workers: RwLock<Vec<Arc<Worker>>>,
    shutdown_tx: watch::Sender<bool>,
    /// Set when the supervisor's own machinery breaks (a restart-loop task
    /// panicking). The process treats this as fatal and exits non-zero.
    fatal_tx: watch::Sender<bool>,
    handles: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(false);
        Self {
            workers: RwLock::new(Vec::new()),
            shutdown_tx,
            fatal_tx,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register a named worker. The factory is invoked once per attempt.
    pub fn register<F>(&self, name: impl Into<String>, policy: BackoffPolicy, factory: F)
    where
        F: Fn(WorkerContext) -> WorkerFuture + Send + Sync + 'static,
    {
        let worker = Arc::new(Worker {
            name: name.into(),
            policy,
            factory: Box::new(factory),
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Stopped,
                retries: 0,
                last_error: None,
                start_time: None,
                last_progress_sample: 0,
            }),
            progress: Arc::new(AtomicU64::new(0)),
        });
        self.workers.write().push(worker);
    }

    /// Spawn every registered worker plus the health loop.
    pub fn spawn_all(self: &Arc<Self>) {
        let workers: Vec<Arc<Worker>> = self.workers.read().clone();
        for worker in workers {
            let sup = self.clone();
            let name = worker.name.clone();
            let fatal_tx = self.fatal_tx.clone();
            let handle = tokio::spawn(async move {
                // The restart loop itself must not die; if it does, that is
                // a supervisor failure and the process must notice.
                let inner = tokio::spawn(sup.run_worker(worker));
                if let Err(join_err) = inner.await {
                    if join_err.is_panic() {
                        error!(error = %join_err, "supervisor restart loop panicked");
                        let _ = fatal_tx.send(true);
                    }
                }
            });
            self.handles.lock().insert(name, handle);
        }

        let sup = self.clone();
        tokio::spawn(async move {
            sup.health_loop().await;
        });
        info!(count = self.workers.read().len(), "supervisor launched workers");
    }

    async fn run_worker(self: Arc<Self>, worker: Arc<Worker>) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                worker.set_status(WorkerStatus::Stopped);
                return;
            }

            worker.set_status(WorkerStatus::Starting);
            let ctx = WorkerContext {
                shutdown: shutdown.clone(),
                progress: worker.progress.clone(),
            };

            let attempt_started = Instant::now();
            {
                let mut state = worker.state.lock();
                state.status = WorkerStatus::Running;
                state.start_time = Some(attempt_started);
            }

            // Run the attempt on its own task so a panic is contained and
            // surfaces as a JoinError instead of taking down the loop.
            let fut = (worker.factory)(ctx);
            let attempt = tokio::spawn(fut);

            let outcome: anyhow::Result<()> = match attempt.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    Err(anyhow::anyhow!("worker panicked: {join_err}"))
                }
                Err(join_err) => Err(anyhow::anyhow!("worker task aborted: {join_err}")),
            };

            match outcome {
                Ok(()) => {
                    if *shutdown.borrow() {
                        worker.set_status(WorkerStatus::Stopped);
                        info!(worker = %worker.name, "worker stopped");
                    } else {
                        // Normal exit (e.g. proactive session reconnect):
                        // restart without burning a retry. Guard against a
                        // worker that returns immediately in a tight loop.
                        let mut state = worker.state.lock();
                        state.retries = 0;
                        state.status = WorkerStatus::Retrying;
                        drop(state);
                        if attempt_started.elapsed() < Duration::from_secs(1) {
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                _ = shutdown.changed() => {
                                    worker.set_status(WorkerStatus::Stopped);
                                    return;
                                }
                            }
                        }
                        continue;
                    }
                    return;
                }
                Err(err) => {
                    let fatal = err
                        .downcast_ref::<FeedError>()
                        .map(FeedError::is_fatal)
                        .unwrap_or(false);

                    let mut state = worker.state.lock();
                    // A long-lived attempt means the worker had recovered;
                    // start the backoff ladder over.
                    if attempt_started.elapsed() >= RETRY_RESET_AFTER {
                        state.retries = 0;
                    }
                    state.retries += 1;
                    state.last_error = Some(format!("{err:#}"));

                    let exhausted = worker.policy.max_retries > 0
                        && state.retries >= worker.policy.max_retries;

                    if fatal || exhausted {
                        state.status = WorkerStatus::Failed;
                        drop(state);
                        error!(
                            worker = %worker.name,
                            error = %err,
                            fatal,
                            "worker failed permanently"
                        );
                        return;
                    }

                    state.status = WorkerStatus::Retrying;
                    let retries = state.retries;
                    drop(state);

                    let delay = worker.policy.delay(retries);
                    warn!(
                        worker = %worker.name,
                        error = %err,
                        retries,
                        delay_secs = delay.as_secs_f64(),
                        "worker errored -- backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            worker.set_status(WorkerStatus::Stopped);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Flag workers stuck in `running` with no frame progress.
    async fn health_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            for worker in self.workers.read().iter() {
                let frames = worker.progress.load(Ordering::Relaxed);
                let mut state = worker.state.lock();
                if state.status == WorkerStatus::Running {
                    let stalled = state.last_progress_sample == frames;
                    let old_enough = state
                        .start_time
                        .map(|t| t.elapsed() > STUCK_AFTER)
                        .unwrap_or(false);
                    if stalled && old_enough {
                        warn!(
                            worker = %worker.name,
                            frames,
                            "worker running but not making progress"
                        );
                    }
                }
                state.last_progress_sample = frames;
            }
        }
    }

    /// Signal shutdown and wait up to `grace` for workers to drain.
    /// Tasks still running at the deadline are abandoned.
    pub async fn stop(&self, grace: Duration) {
        info!("supervisor stopping -- signalling workers");
        for worker in self.workers.read().iter() {
            let mut state = worker.state.lock();
            if matches!(state.status, WorkerStatus::Running | WorkerStatus::Starting) {
                state.status = WorkerStatus::Stopping;
            }
        }
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<(String, tokio::task::JoinHandle<()>)> =
            self.handles.lock().drain().collect();

        let deadline = Instant::now() + grace;
        for (name, handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(_) => {}
                Err(_) => warn!(worker = %name, "worker did not drain in time -- abandoning"),
            }
        }
        info!("supervisor stopped");
    }

    /// A receiver on the root shutdown signal, for tasks outside the
    /// supervisor's worker set (e.g. the HTTP server).
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Resolves only if the supervisor's own machinery breaks.
    pub async fn wait_fatal(&self) {
        let mut rx = self.fatal_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone; park forever rather than report a false fatal.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn reports(&self) -> Vec<WorkerReport> {
        self.workers
            .read()
            .iter()
            .map(|w| {
                let state = w.state.lock();
                WorkerReport {
                    name: w.name.clone(),
                    status: state.status,
                    retries: state.retries,
                    last_error: state.last_error.clone(),
                    frames: w.progress.load(Ordering::Relaxed),
                    uptime_secs: match state.status {
                        WorkerStatus::Running => {
                            state.start_time.map(|t| t.elapsed().as_secs())
                        }
                        _ => None,
                    },
                }
            })
            .collect()
    }

    /// True when any worker has permanently failed.
    pub fn has_failed_worker(&self) -> bool {
        self.workers
            .read()
            .iter()
            .any(|w| w.state.lock().status == WorkerStatus::Failed)
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn backoff_ladder_matches_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(4), Duration::from_secs(40));
        // 5 * 2^4 = 80 capped at 60.
        assert_eq!(policy.delay(5), Duration::from_secs(60));
        assert_eq!(policy.delay(12), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn transient_errors_retry_then_succeed() {
        let sup = Arc::new(Supervisor::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let policy = BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
            factor: 2.0,
            max_retries: 0,
        };

        sup.register("flaky", policy, move |ctx| {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    anyhow::bail!("transient failure {n}");
                }
                // Succeed and hold until shutdown.
                let mut shutdown = ctx.shutdown;
                let _ = shutdown.changed().await;
                Ok(())
            })
        });

        sup.spawn_all();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(attempts.load(Ordering::SeqCst) >= 4);
        let reports = sup.reports();
        let report = &reports[0];
        assert_eq!(report.status, WorkerStatus::Running);

        sup.stop(Duration::from_millis(200)).await;
        let reports = sup.reports();
        let report = &reports[0];
        assert_eq!(report.status, WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn fatal_error_fails_without_retry() {
        let sup = Arc::new(Supervisor::new());
        sup.register("doomed", BackoffPolicy::default(), |_ctx| {
            Box::pin(async {
                Err(FeedError::FatalNetwork("no such host".into()).into())
            })
        });
        sup.spawn_all();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reports = sup.reports();
        let report = &reports[0];
        assert_eq!(report.status, WorkerStatus::Failed);
        assert_eq!(report.retries, 1);
        assert!(sup.has_failed_worker());
    }

    #[tokio::test]
    async fn retries_bounded_by_max_retries() {
        let sup = Arc::new(Supervisor::new());
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            factor: 2.0,
            max_retries: 3,
        };
        sup.register("always-bad", policy, |_ctx| {
            Box::pin(async { anyhow::bail!("still broken") })
        });
        sup.spawn_all();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reports = sup.reports();
        let report = &reports[0];
        assert_eq!(report.status, WorkerStatus::Failed);
        assert_eq!(report.retries, 3);
    }

    #[tokio::test]
    async fn panics_are_treated_as_transient() {
        let sup = Arc::new(Supervisor::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let policy = BackoffPolicy {
            initial: Duration::from_millis(2),
            max: Duration::from_millis(8),
            factor: 2.0,
            max_retries: 0,
        };
        sup.register("panicky", policy, move |ctx| {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                let mut shutdown = ctx.shutdown;
                let _ = shutdown.changed().await;
                Ok(())
            })
        });
        sup.spawn_all();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(sup.reports()[0].status, WorkerStatus::Running);
        sup.stop(Duration::from_millis(100)).await;
    }
}
