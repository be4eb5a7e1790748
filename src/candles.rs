// =============================================================================
// Candle Engine — multi-timeframe OHLCV + VWAP builders from trade events
// =============================================================================
//
// One in-progress candle per (exchange, symbol, timeframe), across a fixed
// timeframe set spanning 1s to 1d. Buckets align to UTC:
// `open_time = floor(event_time / duration) * duration`. A 1 s tick
// finalizes buckets whose close_time has passed and flushes throttled
// publishes; finalized candles land on `candles:<symbol>:<timeframe>` and
// in a per-series retention ring.
//
// Candles with any non-positive OHLC value are discarded, not published.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::app_state::PipelineMetrics;
use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::{now_ms, Candle, MarketEvent, Side, Trade};

/// The timeframe set every symbol is aggregated across.
pub const TIMEFRAMES: &[(&str, i64)] = &[
    ("1s", 1_000),
    ("5s", 5_000),
    ("15s", 15_000),
    ("30s", 30_000),
    ("1m", 60_000),
    ("3m", 180_000),
    ("5m", 300_000),
    ("15m", 900_000),
    ("30m", 1_800_000),
    ("1h", 3_600_000),
    ("2h", 7_200_000),
    ("4h", 14_400_000),
    ("6h", 21_600_000),
    ("12h", 43_200_000),
    ("1d", 86_400_000),
];

/// Bucket open for an event time: floored to the timeframe boundary (UTC).
pub fn bucket_open(event_time: i64, duration_ms: i64) -> i64 {
    event_time - event_time.rem_euclid(duration_ms)
}

/// Identifies one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SeriesKey {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.exchange, self.symbol, self.timeframe)
    }
}

/// Accumulator for one in-progress bucket.
#[derive(Debug, Clone)]
struct CandleBuilder {
    open_time: i64,
    close_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: f64,
    trade_count: u64,
    taker_buy_volume: f64,
    taker_buy_quote_volume: f64,
    vwap_num: f64,
}

impl CandleBuilder {
    fn start(open_time: i64, duration_ms: i64, trade: &Trade) -> Self {
        let value = trade.value();
        let taker_buy = trade.side == Side::Buy;
        Self {
            open_time,
            close_time: open_time + duration_ms - 1,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.quantity,
            quote_volume: value,
            trade_count: 1,
            taker_buy_volume: if taker_buy { trade.quantity } else { 0.0 },
            taker_buy_quote_volume: if taker_buy { value } else { 0.0 },
            vwap_num: value,
        }
    }

    fn update(&mut self, trade: &Trade) {
        let value = trade.value();
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.quantity;
        self.quote_volume += value;
        self.trade_count += 1;
        if trade.side == Side::Buy {
            self.taker_buy_volume += trade.quantity;
            self.taker_buy_quote_volume += value;
        }
        self.vwap_num += value;
    }

    fn finalize(&self, key: &SeriesKey) -> Candle {
        let vwap = if self.volume > 0.0 {
            self.vwap_num / self.volume
        } else {
            0.0
        };
        Candle {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
            open_time: self.open_time,
            close_time: self.close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
            trade_count: self.trade_count,
            taker_buy_volume: self.taker_buy_volume,
            taker_buy_quote_volume: self.taker_buy_quote_volume,
            vwap,
            is_complete: true,
            received_at: now_ms(),
        }
    }
}

/// Interior state, serialized by one mutex held only for the duration of an
/// update; publishing happens outside the lock on cloned values.
struct CandleEngineInner {
    in_progress: HashMap<SeriesKey, CandleBuilder>,
    history: HashMap<SeriesKey, VecDeque<Candle>>,
    last_publish: HashMap<SeriesKey, Instant>,
    /// Finalized candles held back by the publish throttle.
    pending: HashMap<SeriesKey, Vec<Candle>>,
}

pub struct CandleEngine {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    inner: Mutex<CandleEngineInner>,
    publish_min_interval: Duration,
}

impl CandleEngine {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        Self {
            bus,
            metrics,
            inner: Mutex::new(CandleEngineInner {
                in_progress: HashMap::new(),
                history: HashMap::new(),
                last_publish: HashMap::new(),
                pending: HashMap::new(),
            }),
            publish_min_interval: Duration::from_millis(config.candle_publish_min_interval_ms),
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut sub = self.bus.subscribe_prefix("trade:");
        let mut shutdown = ctx.shutdown.clone();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(timeframes = TIMEFRAMES.len(), "candle engine started");

        loop {
            tokio::select! {
                msg = sub.recv() => {
                    match msg {
                        Some(msg) => {
                            if let MarketEvent::Trade(trade) = msg.event.as_ref() {
                                self.on_trade(trade);
                                ctx.frame_emitted();
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = tick.tick() => self.on_tick(now_ms()),
                _ = shutdown.changed() => {
                    info!("candle engine stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Fold one trade into every timeframe's in-progress bucket.
    pub fn on_trade(&self, trade: &Trade) {
        if trade.price <= 0.0 || trade.quantity <= 0.0 {
            debug!(
                exchange = %trade.exchange,
                symbol = %trade.symbol,
                price = trade.price,
                quantity = trade.quantity,
                "discarding invalid trade"
            );
            return;
        }

        let mut closed: Vec<(SeriesKey, Candle)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            for &(timeframe, duration_ms) in TIMEFRAMES {
                let key = SeriesKey {
                    exchange: trade.exchange.clone(),
                    symbol: trade.symbol.clone(),
                    timeframe: timeframe.to_string(),
                };
                let bucket = bucket_open(trade.event_time, duration_ms);

                match inner.in_progress.entry(key.clone()) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        let builder = entry.get_mut();
                        if builder.open_time == bucket {
                            builder.update(trade);
                        } else if builder.open_time < bucket {
                            // Bucket rolled over: close the prior one.
                            let candle = builder.finalize(&key);
                            *builder = CandleBuilder::start(bucket, duration_ms, trade);
                            closed.push((key, candle));
                        } else {
                            // Trade for an already-closed bucket; late data
                            // is folded nowhere rather than corrupting a
                            // newer bucket.
                            debug!(key = %key, "late trade ignored for closed bucket");
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(CandleBuilder::start(bucket, duration_ms, trade));
                    }
                }
            }
        }

        for (key, candle) in closed {
            self.emit(&key, candle);
        }
    }

    /// Periodic finalization: close any bucket whose close_time has passed,
    /// then flush throttled publishes.
    pub fn on_tick(&self, now: i64) {
        let mut closed: Vec<(SeriesKey, Candle)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            let expired: Vec<SeriesKey> = inner
                .in_progress
                .iter()
                .filter(|(_, b)| b.close_time < now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(builder) = inner.in_progress.remove(&key) {
                    closed.push((key.clone(), builder.finalize(&key)));
                }
            }
        }

        for (key, candle) in closed {
            self.emit(&key, candle);
        }

        self.flush_pending();
    }

    /// Seed a series with historical candles. Idempotent: bars whose
    /// open_time is already present or misaligned are skipped.
    pub fn prime(&self, key: &SeriesKey, candles: Vec<Candle>) {
        let duration = match TIMEFRAMES.iter().find(|(tf, _)| *tf == key.timeframe) {
            Some((_, d)) => *d,
            None => {
                warn!(timeframe = %key.timeframe, "prime with unknown timeframe ignored");
                return;
            }
        };
        let cap = symbols::retention_for(&key.timeframe);

        let mut inner = self.inner.lock();
        let ring = inner.history.entry(key.clone()).or_default();
        for candle in candles {
            if candle.open_time % duration != 0 || !candle.is_valid() {
                continue;
            }
            if ring.iter().any(|c| c.open_time == candle.open_time) {
                continue;
            }
            ring.push_back(candle);
        }
        ring.make_contiguous()
            .sort_by_key(|c| c.open_time);
        while ring.len() > cap {
            ring.pop_front();
        }
    }

    /// Most recent `count` finalized candles, oldest first.
    pub fn recent(&self, key: &SeriesKey, count: usize) -> Vec<Candle> {
        let inner = self.inner.lock();
        match inner.history.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Retain, throttle-check, and publish one finalized candle.
    fn emit(&self, key: &SeriesKey, candle: Candle) {
        if !candle.is_valid() {
            warn!(key = %key, "discarding invalid candle");
            self.metrics
                .invalid_candles
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }

        let to_publish: Vec<Candle> = {
            let mut inner = self.inner.lock();

            let cap = symbols::retention_for(&key.timeframe);
            let ring = inner.history.entry(key.clone()).or_default();
            ring.push_back(candle.clone());
            while ring.len() > cap {
                ring.pop_front();
            }

            let due = inner
                .last_publish
                .get(key)
                .map(|t| t.elapsed() >= self.publish_min_interval)
                .unwrap_or(true);

            if due {
                // Any throttled backlog goes first so open_time stays
                // nondecreasing on the subject.
                let mut batch = inner.pending.remove(key).unwrap_or_default();
                batch.push(candle);
                inner.last_publish.insert(key.clone(), Instant::now());
                batch
            } else {
                inner.pending.entry(key.clone()).or_default().push(candle);
                Vec::new()
            }
        };

        for candle in to_publish {
            self.publish(key, candle);
        }
    }

    fn flush_pending(&self) {
        let ready: Vec<(SeriesKey, Vec<Candle>)> = {
            let mut inner = self.inner.lock();
            let due: Vec<SeriesKey> = inner
                .pending
                .keys()
                .filter(|key| {
                    inner
                        .last_publish
                        .get(*key)
                        .map(|t| t.elapsed() >= self.publish_min_interval)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            due.into_iter()
                .filter_map(|key| {
                    inner.pending.remove(&key).map(|batch| {
                        inner.last_publish.insert(key.clone(), Instant::now());
                        (key, batch)
                    })
                })
                .collect()
        };

        for (key, batch) in ready {
            for candle in batch {
                self.publish(&key, candle);
            }
        }
    }

    fn publish(&self, key: &SeriesKey, candle: Candle) {
        self.bus.publish(
            symbols::candle_subject(&key.symbol, &key.timeframe),
            MarketEvent::Candle(candle),
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<CandleEngine> {
        let mut config = FeedConfig::default();
        config.candle_publish_min_interval_ms = 0;
        Arc::new(CandleEngine::new(
            Arc::new(Bus::new(4_096)),
            Arc::new(PipelineMetrics::default()),
            &config,
        ))
    }

    fn trade(price: f64, quantity: f64, event_time: i64, side: Side) -> Trade {
        Trade {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            price,
            quantity,
            side,
            event_time,
            received_at: event_time,
            trade_id: None,
            is_buyer_maker: Some(side == Side::Sell),
        }
    }

    fn key(timeframe: &str) -> SeriesKey {
        SeriesKey {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            timeframe: timeframe.into(),
        }
    }

    #[test]
    fn bucket_alignment_is_utc_floored() {
        assert_eq!(bucket_open(1_700_000_040_123, 60_000), 1_700_000_040_000);
        assert_eq!(bucket_open(1_700_000_099_999, 60_000), 1_700_000_040_000);
        // Daily buckets land on UTC midnight.
        let day = 86_400_000;
        let open = bucket_open(1_700_000_040_123, day);
        assert_eq!(open % day, 0);
        // Every timeframe's bucket open is a multiple of its duration.
        for &(_, duration) in TIMEFRAMES {
            assert_eq!(bucket_open(1_699_999_999_123, duration) % duration, 0);
        }
    }

    /// Four trades inside the 1-minute bucket at 1700000040000:
    /// open 42.0, high 42.5, low 41.9, close 42.3, volume 5, vwap 42.24.
    #[tokio::test]
    async fn finalization_produces_expected_candle() {
        let eng = engine();
        let mut sub = eng.bus.subscribe("candles:solusdt:1m");

        let t0 = 1_700_000_040_000;
        eng.on_trade(&trade(42.0, 1.0, t0 + 1_000, Side::Buy));
        eng.on_trade(&trade(42.5, 2.0, t0 + 10_000, Side::Buy));
        eng.on_trade(&trade(41.9, 1.0, t0 + 30_000, Side::Sell));
        eng.on_trade(&trade(42.3, 1.0, t0 + 50_000, Side::Buy));

        // Tick past the bucket close.
        eng.on_tick(t0 + 61_000);

        let msg = sub.try_recv().expect("finalized candle expected");
        let candle = match msg.event.as_ref() {
            MarketEvent::Candle(c) => c.clone(),
            other => panic!("unexpected event: {other:?}"),
        };

        assert_eq!(candle.open_time, t0);
        assert_eq!(candle.close_time, t0 + 59_999);
        assert_eq!(candle.open, 42.0);
        assert_eq!(candle.high, 42.5);
        assert_eq!(candle.low, 41.9);
        assert_eq!(candle.close, 42.3);
        assert_eq!(candle.volume, 5.0);
        assert_eq!(candle.trade_count, 4);
        let expected_vwap = (42.0 + 85.0 + 41.9 + 42.3) / 5.0;
        assert!((candle.vwap - expected_vwap).abs() < 1e-9);
        assert!((candle.vwap - 42.24).abs() < 1e-9);
        assert!(candle.is_complete);
        // Taker-buy volume counts only buy-aggressor trades.
        assert_eq!(candle.taker_buy_volume, 4.0);
    }

    /// Volume conservation: candle volumes over a window equal the sum of
    /// contained trade quantities.
    #[tokio::test]
    async fn volume_is_conserved_across_buckets() {
        let eng = engine();
        let mut sub = eng.bus.subscribe("candles:solusdt:1m");

        let t0 = 1_700_000_040_000;
        let mut total = 0.0;
        // Trades spread over three 1m buckets.
        for i in 0..30 {
            let qty = 0.5 + (i as f64) * 0.1;
            total += qty;
            eng.on_trade(&trade(42.0 + i as f64 * 0.01, qty, t0 + i * 6_000, Side::Buy));
        }
        eng.on_tick(t0 + 240_000);

        let mut candle_total = 0.0;
        while let Some(msg) = sub.try_recv() {
            if let MarketEvent::Candle(c) = msg.event.as_ref() {
                candle_total += c.volume;
            }
        }
        assert!((candle_total - total).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rollover_closes_prior_bucket_on_next_trade() {
        let eng = engine();
        let mut sub = eng.bus.subscribe("candles:solusdt:1s");

        eng.on_trade(&trade(10.0, 1.0, 1_000, Side::Buy));
        // Next trade two buckets later closes the first bucket.
        eng.on_trade(&trade(11.0, 1.0, 3_500, Side::Buy));

        let msg = sub.try_recv().expect("rolled-over candle expected");
        match msg.event.as_ref() {
            MarketEvent::Candle(c) => {
                assert_eq!(c.open_time, 1_000);
                assert_eq!(c.close, 10.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_trades_are_discarded() {
        let eng = engine();
        eng.on_trade(&trade(0.0, 1.0, 1_000, Side::Buy));
        eng.on_trade(&trade(42.0, -1.0, 1_000, Side::Buy));
        assert!(eng.inner.lock().in_progress.is_empty());
    }

    #[tokio::test]
    async fn history_ring_respects_retention() {
        let eng = engine();
        let k = key("1s");
        for i in 0..10 {
            eng.on_trade(&trade(10.0 + i as f64, 1.0, i * 1_000, Side::Buy));
        }
        eng.on_tick(60_000);

        let recent = eng.recent(&k, 5);
        assert_eq!(recent.len(), 5);
        // Oldest-first ordering with increasing open_time.
        for pair in recent.windows(2) {
            assert!(pair[0].open_time < pair[1].open_time);
        }
    }

    #[tokio::test]
    async fn prime_is_idempotent_and_aligned() {
        let eng = engine();
        let k = key("1m");
        let mk = |open_time: i64| Candle {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            timeframe: "1m".into(),
            open_time,
            close_time: open_time + 59_999,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            quote_volume: 15.0,
            trade_count: 3,
            taker_buy_volume: 5.0,
            taker_buy_quote_volume: 7.5,
            vwap: 1.5,
            is_complete: true,
            received_at: 0,
        };

        eng.prime(&k, vec![mk(0), mk(60_000), mk(60_000), mk(61_000)]);
        // Duplicate and misaligned bars are dropped.
        assert_eq!(eng.recent(&k, 10).len(), 2);

        eng.prime(&k, vec![mk(120_000), mk(0)]);
        assert_eq!(eng.recent(&k, 10).len(), 3);
    }
}
