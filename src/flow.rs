// =============================================================================
// Flow Aggregators — CVD windows, order-flow enrichment, whale detection
// =============================================================================
//
// Two jobs off the trade stream:
//
//   1. CVD: per (exchange, symbol), a capped ring of recent trades feeds
//      sliding-window sums of signed quote value (buy aggressor +, sell -).
//      Recomputed on a 1 s tick, published only when a window changed.
//   2. Order-flow enrichment: per trade, price impact against the ring's
//      short history, net aggressor pressure over the recent window, a
//      whale flag against the per-symbol notional threshold, and a
//      volume-clock toxicity reading.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::app_state::PipelineMetrics;
use crate::bus::Bus;
use crate::config::FeedConfig;
use crate::supervisor::WorkerContext;
use crate::symbols;
use crate::types::{now_ms, CvdUpdate, MarketEvent, OrderFlow, Side, Trade};

/// Ring capacity per (exchange, symbol).
const TRADE_RING_CAPACITY: usize = 10_000;

/// CVD sliding windows: label and width in milliseconds.
const CVD_WINDOWS: &[(&str, i64)] = &[("1m", 60_000), ("5m", 300_000), ("15m", 900_000)];

/// Trades considered for price impact and pressure.
const SHORT_HISTORY: usize = 50;
const PRESSURE_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy)]
struct RingTrade {
    event_time: i64,
    price: f64,
    signed_value: f64,
    value: f64,
}

// =============================================================================
// Flow toxicity (decaying volume clock)
// =============================================================================

/// Flow-imbalance gauge on a volume clock: time advances with traded quote
/// value, not wall time. Each trade first decays the running signed and
/// gross totals by `exp(-value / horizon)`, then adds its own value, so a
/// trade's weight halves after roughly `0.69 * horizon` of further volume.
///
/// Reading is `|signed| / gross` in [0, 1]; sustained one-sided flow pins
/// it at 1, balanced two-way flow washes out toward 0.
pub struct ToxicityGauge {
    /// Quote volume over which past flow loses ~63% of its weight.
    horizon: f64,
    signed: f64,
    gross: f64,
}

impl ToxicityGauge {
    pub fn new(horizon: f64) -> Self {
        Self {
            horizon: horizon.max(1.0),
            signed: 0.0,
            gross: 0.0,
        }
    }

    /// Feed one trade's quote value into the gauge.
    pub fn add(&mut self, value: f64, is_buy: bool) {
        if value <= 0.0 {
            return;
        }
        let decay = (-value / self.horizon).exp();
        self.signed *= decay;
        self.gross *= decay;
        self.signed += if is_buy { value } else { -value };
        self.gross += value;
    }

    /// Current toxicity reading.
    pub fn reading(&self) -> f64 {
        if self.gross <= f64::EPSILON {
            return 0.0;
        }
        (self.signed.abs() / self.gross).min(1.0)
    }
}

impl Default for ToxicityGauge {
    fn default() -> Self {
        Self::new(1_000_000.0)
    }
}

// =============================================================================
// Flow engine
// =============================================================================

struct SymbolFlow {
    ring: VecDeque<RingTrade>,
    toxicity: ToxicityGauge,
    last_cvd: BTreeMap<String, f64>,
}

impl SymbolFlow {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(TRADE_RING_CAPACITY),
            toxicity: ToxicityGauge::default(),
            last_cvd: BTreeMap::new(),
        }
    }

    fn push(&mut self, trade: &RingTrade) {
        self.ring.push_back(*trade);
        while self.ring.len() > TRADE_RING_CAPACITY {
            self.ring.pop_front();
        }
    }

    /// Signed quote value over `(now - window, now]`.
    fn window_sum(&self, now: i64, window_ms: i64) -> f64 {
        self.ring
            .iter()
            .rev()
            .take_while(|t| t.event_time > now - window_ms)
            .map(|t| t.signed_value)
            .sum()
    }

    /// Percent move of `price` vs. the mean of the recent short history.
    fn price_impact(&self, price: f64) -> f64 {
        let recent: Vec<f64> = self
            .ring
            .iter()
            .rev()
            .take(SHORT_HISTORY)
            .map(|t| t.price)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        if mean > 0.0 {
            (price - mean) / mean * 100.0
        } else {
            0.0
        }
    }

    /// Net aggressor pressure over the last few trades, in [-1, +1].
    fn pressure(&self) -> f64 {
        let mut net = 0.0;
        let mut gross = 0.0;
        for t in self.ring.iter().rev().take(PRESSURE_WINDOW) {
            net += t.signed_value;
            gross += t.value;
        }
        if gross > 0.0 {
            net / gross
        } else {
            0.0
        }
    }
}

pub struct FlowEngine {
    bus: Arc<Bus>,
    metrics: Arc<PipelineMetrics>,
    flows: Mutex<HashMap<String, SymbolFlow>>,
    whale_thresholds: HashMap<String, f64>,
    default_whale_threshold: f64,
}

impl FlowEngine {
    pub fn new(bus: Arc<Bus>, metrics: Arc<PipelineMetrics>, config: &FeedConfig) -> Self {
        let mut whale_thresholds = HashMap::new();
        for (symbol, thresholds) in &config.thresholds {
            whale_thresholds.insert(symbol.clone(), thresholds.whale_threshold);
        }
        Self {
            bus,
            metrics,
            flows: Mutex::new(HashMap::new()),
            whale_thresholds,
            default_whale_threshold: crate::config::SymbolThresholds::default().whale_threshold,
        }
    }

    pub async fn run(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut sub = self.bus.subscribe_prefix("trade:");
        let mut shutdown = ctx.shutdown.clone();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("flow engine started");

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
                _ = tick.tick() => self.publish_cvd(now_ms()),
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Enrich one trade and fold it into the ring.
    pub fn on_trade(&self, trade: &Trade) {
        if trade.price <= 0.0 || trade.quantity <= 0.0 {
            return;
        }

        let key = format!("{}:{}", trade.exchange, trade.symbol);
        let value = trade.value();
        let whale_threshold = self
            .whale_thresholds
            .get(&trade.symbol)
            .copied()
            .unwrap_or(self.default_whale_threshold);
        let is_whale = value >= whale_threshold;

        let (price_impact, pressure, toxicity) = {
            let mut flows = self.flows.lock();
            let flow = flows.entry(key).or_insert_with(SymbolFlow::new);

            // Impact is measured against history *before* this trade.
            let price_impact = flow.price_impact(trade.price);
            flow.push(&RingTrade {
                event_time: trade.event_time,
                price: trade.price,
                signed_value: trade.signed_value(),
                value,
            });
            if trade.side != Side::Unknown {
                flow.toxicity.add(value, trade.side == Side::Buy);
            }
            (price_impact, flow.pressure(), flow.toxicity.reading())
        };

        if is_whale {
            self.metrics
                .whale_trades
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        self.bus.publish(
            symbols::orderflow_subject(&trade.symbol),
            MarketEvent::OrderFlow(OrderFlow {
                exchange: trade.exchange.clone(),
                symbol: trade.symbol.clone(),
                price: trade.price,
                quantity: trade.quantity,
                side: trade.side,
                value,
                price_impact,
                pressure,
                is_whale,
                toxicity,
                event_time: trade.event_time,
            }),
        );
    }

    /// Recompute every window and publish feeds whose values moved.
    pub fn publish_cvd(&self, now: i64) {
        let updates: Vec<(String, String, BTreeMap<String, f64>)> = {
            let mut flows = self.flows.lock();
            let mut out = Vec::new();
            for (key, flow) in flows.iter_mut() {
                let mut windows = BTreeMap::new();
                for &(label, width) in CVD_WINDOWS {
                    windows.insert(label.to_string(), flow.window_sum(now, width));
                }
                if windows != flow.last_cvd {
                    flow.last_cvd = windows.clone();
                    if let Some((exchange, symbol)) = key.split_once(':') {
                        out.push((exchange.to_string(), symbol.to_string(), windows));
                    }
                }
            }
            out
        };

        for (exchange, symbol, windows) in updates {
            self.bus.publish(
                symbols::cvd_subject(&exchange, &symbol),
                MarketEvent::Cvd(CvdUpdate {
                    exchange,
                    symbol,
                    windows,
                    event_time: now,
                }),
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<FlowEngine> {
        let mut config = FeedConfig::default();
        config.thresholds.insert(
            "solusdt".into(),
            crate::config::SymbolThresholds {
                wall_detection_threshold: 500.0,
                whale_threshold: 1_000.0,
            },
        );
        Arc::new(FlowEngine::new(
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
            is_buyer_maker: None,
        }
    }

    /// CVD(w) at time t equals the signed value sum over (t - w, t].
    #[tokio::test]
    async fn cvd_windows_sum_signed_value() {
        let eng = engine();
        let mut sub = eng.bus.subscribe("cvd:binance:solusdt");

        let now = 1_000_000;
        // Inside 5m but outside 1m: +100*2 = +200.
        eng.on_trade(&trade(100.0, 2.0, now - 120_000, Side::Buy));
        // Inside 1m window: +100*1 (buy) -100*0.5 (sell) = +50.
        eng.on_trade(&trade(100.0, 1.0, now - 30_000, Side::Buy));
        eng.on_trade(&trade(100.0, 0.5, now - 10_000, Side::Sell));

        eng.publish_cvd(now);

        let msg = sub.try_recv().expect("cvd update expected");
        match msg.event.as_ref() {
            MarketEvent::Cvd(cvd) => {
                assert!((cvd.windows["1m"] - 50.0).abs() < 1e-9);
                assert!((cvd.windows["5m"] - 250.0).abs() < 1e-9);
                assert!((cvd.windows["15m"] - 250.0).abs() < 1e-9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cvd_publishes_only_on_change() {
        let eng = engine();
        let mut sub = eng.bus.subscribe("cvd:binance:solusdt");

        let now = 1_000_000;
        eng.on_trade(&trade(100.0, 1.0, now - 1_000, Side::Buy));
        eng.publish_cvd(now);
        assert!(sub.try_recv().is_some());

        // No new trades, same windows: nothing published.
        eng.publish_cvd(now + 100);
        assert!(sub.try_recv().is_none());

        // Window decay changes the value once the trade ages out.
        eng.publish_cvd(now + 16 * 60_000);
        assert!(sub.try_recv().is_some());
    }

    #[tokio::test]
    async fn whale_flag_uses_per_symbol_threshold() {
        let eng = engine();
        let mut sub = eng.bus.subscribe("orderflow:solusdt");

        // 100 * 5 = 500 below the 1000 threshold.
        eng.on_trade(&trade(100.0, 5.0, 1_000, Side::Buy));
        // 100 * 50 = 5000 above it.
        eng.on_trade(&trade(100.0, 50.0, 2_000, Side::Buy));

        let first = sub.try_recv().unwrap();
        let second = sub.try_recv().unwrap();
        match (first.event.as_ref(), second.event.as_ref()) {
            (MarketEvent::OrderFlow(a), MarketEvent::OrderFlow(b)) => {
                assert!(!a.is_whale);
                assert!(b.is_whale);
                assert_eq!(b.value, 5_000.0);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pressure_and_impact_reflect_recent_flow() {
        let eng = engine();
        let mut sub = eng.bus.subscribe("orderflow:solusdt");

        for i in 0..10 {
            eng.on_trade(&trade(100.0, 1.0, 1_000 + i, Side::Buy));
        }
        // A trade 1% above the recent mean.
        eng.on_trade(&trade(101.0, 1.0, 2_000, Side::Buy));

        let mut last = None;
        while let Some(msg) = sub.try_recv() {
            if let MarketEvent::OrderFlow(of) = msg.event.as_ref() {
                last = Some(of.clone());
            }
        }
        let of = last.unwrap();
        assert!((of.price_impact - 1.0).abs() < 1e-9);
        // All-buy flow pins pressure at +1.
        assert!((of.pressure - 1.0).abs() < 1e-9);
    }

    #[test]
    fn toxicity_gauge_reads_one_sided_flow_as_toxic() {
        // All-buy flow: signed equals gross no matter the decay.
        let mut gauge = ToxicityGauge::new(100.0);
        for _ in 0..10 {
            gauge.add(100.0, true);
        }
        assert!((gauge.reading() - 1.0).abs() < 1e-9);

        // Balanced two-way flow washes out.
        let mut balanced = ToxicityGauge::new(2_000.0);
        for i in 0..20 {
            balanced.add(50.0, i % 2 == 0);
        }
        assert!(balanced.reading() < 0.2);

        // An empty gauge reads zero, as does one fed junk values.
        let mut empty = ToxicityGauge::new(100.0);
        assert_eq!(empty.reading(), 0.0);
        empty.add(-5.0, true);
        assert_eq!(empty.reading(), 0.0);
    }

    #[test]
    fn toxicity_decays_on_the_volume_clock() {
        // A burst of sells followed by heavier buy volume flips the gauge:
        // old flow loses weight as volume passes, so the reading tracks the
        // recent regime instead of the all-time imbalance.
        let mut gauge = ToxicityGauge::new(1_000.0);
        for _ in 0..5 {
            gauge.add(200.0, false);
        }
        let sell_heavy = gauge.reading();
        assert!((sell_heavy - 1.0).abs() < 1e-9);

        for _ in 0..20 {
            gauge.add(500.0, true);
        }
        // Ten horizons of buy volume later the sell burst is noise.
        assert!(gauge.reading() > 0.9);
    }

    #[test]
    fn trade_ring_is_capped() {
        let mut flow = SymbolFlow::new();
        for i in 0..(TRADE_RING_CAPACITY + 500) {
            flow.push(&RingTrade {
                event_time: i as i64,
                price: 100.0,
                signed_value: 1.0,
                value: 1.0,
            });
        }
        assert_eq!(flow.ring.len(), TRADE_RING_CAPACITY);
        assert_eq!(flow.ring.front().unwrap().event_time, 500);
    }
}
