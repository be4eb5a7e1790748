// =============================================================================
// Central Application State — Borealis Market Nexus
// =============================================================================
//
// Ties the shared pieces together for the HTTP surface: the bus, the
// supervisor, the broadcaster and the pipeline-wide counters. Engines own
// their own state; nothing here reaches into them.
//
// Thread safety: lock-free atomic counters, with Arc wrappers around
// subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::broadcaster::Broadcaster;
use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::supervisor::{Supervisor, WorkerReport};

// =============================================================================
// Metrics
// =============================================================================

/// Pipeline-wide counters. Everything here is monotonically increasing and
/// read without locks by the `/stats` endpoint.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Canonical events published by connectors.
    pub frames: AtomicU64,
    /// Frames preserved as `Raw` because they classified to no known shape.
    pub raw_events: AtomicU64,
    /// Sequence discontinuities observed by the gap watcher.
    pub gaps: AtomicU64,
    /// Snapshot requests raised (gap, staleness, invariant).
    pub snapshot_requests: AtomicU64,
    /// Book resets due to invariant violations.
    pub invariant_violations: AtomicU64,
    /// Finalized candles discarded for bad OHLC values.
    pub invalid_candles: AtomicU64,
    /// REST poll ticks that errored and were skipped.
    pub poll_failures: AtomicU64,
    /// Trades at or above the per-symbol whale threshold.
    pub whale_trades: AtomicU64,
    /// WebSocket sessions established (first connects included).
    pub reconnects: AtomicU64,
    /// Frames fanned out to broadcast clients.
    pub broadcast_sent: AtomicU64,
    /// Frames dropped because a broadcast client's queue was full.
    pub broadcast_dropped: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`] for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub frames: u64,
    pub raw_events: u64,
    pub gaps: u64,
    pub snapshot_requests: u64,
    pub invariant_violations: u64,
    pub invalid_candles: u64,
    pub poll_failures: u64,
    pub whale_trades: u64,
    pub reconnects: u64,
    pub broadcast_sent: u64,
    pub broadcast_dropped: u64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            raw_events: self.raw_events.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            snapshot_requests: self.snapshot_requests.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            invalid_candles: self.invalid_candles.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            whale_trades: self.whale_trades.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            broadcast_sent: self.broadcast_sent.load(Ordering::Relaxed),
            broadcast_dropped: self.broadcast_dropped.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared state behind the HTTP surface, wrapped in `Arc` at startup.
pub struct AppState {
    pub config: FeedConfig,
    pub bus: Arc<Bus>,
    pub metrics: Arc<PipelineMetrics>,
    pub supervisor: Arc<Supervisor>,
    pub broadcaster: Arc<Broadcaster>,
    pub start_time: std::time::Instant,
}

/// `/health` response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime: u64,
}

/// `/stats` response body.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub metrics: MetricsSnapshot,
    pub workers: Vec<WorkerReport>,
    pub bus_published: u64,
    pub bus_subjects: usize,
    pub broadcast_clients: usize,
}

impl AppState {
    pub fn new(
        config: FeedConfig,
        bus: Arc<Bus>,
        metrics: Arc<PipelineMetrics>,
        supervisor: Arc<Supervisor>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            config,
            bus,
            metrics,
            supervisor,
            broadcaster,
            start_time: std::time::Instant::now(),
        }
    }

    /// Liveness: the service is healthy as long as the process runs; a
    /// failed connector only silences its own subjects.
    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy",
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            uptime: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn stats(&self) -> StatsResponse {
        StatsResponse {
            metrics: self.metrics.snapshot(),
            workers: self.supervisor.reports(),
            bus_published: self.bus.published(),
            bus_subjects: self.bus.subject_count(),
            broadcast_clients: self.broadcaster.client_count(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        let config = FeedConfig::default();
        let bus = Arc::new(Bus::new(16));
        let metrics = Arc::new(PipelineMetrics::default());
        let broadcaster = Arc::new(Broadcaster::new(metrics.clone(), &config));
        AppState::new(
            config,
            bus,
            metrics,
            Arc::new(Supervisor::new()),
            broadcaster,
        )
    }

    #[test]
    fn health_reports_service_identity() {
        let state = state();
        let health = state.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.service, "borealis-feed");
        assert!(!health.version.is_empty());
    }

    #[test]
    fn metrics_snapshot_reflects_counters() {
        let state = state();
        state.metrics.frames.fetch_add(5, Ordering::Relaxed);
        state.metrics.gaps.fetch_add(2, Ordering::Relaxed);

        let stats = state.stats();
        assert_eq!(stats.metrics.frames, 5);
        assert_eq!(stats.metrics.gaps, 2);
        assert_eq!(stats.broadcast_clients, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["metrics"]["frames"], 5);
    }
}
