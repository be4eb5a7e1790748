// =============================================================================
// Canonical event model shared across the Borealis pipeline
// =============================================================================
//
// Every exchange frame is projected into one of these types by the normalizer.
// All timestamps are milliseconds since the UNIX epoch; `event_time` is the
// source-provided timestamp and `received_at` is stamped at ingest. Symbols
// are lowercase with hyphens/underscores stripped (see `symbols::normalize`).
//
// The `MarketEvent` envelope serialises with a `type` tag matching the
// broadcast wire schema, so the same struct goes onto the internal bus and
// out over the client WebSocket.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Aggressor side of a trade.
///
/// `Unknown` is only produced for exchanges that do not carry aggressor
/// information; downstream consumers apply the tick rule in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

impl Default for Side {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single price level as `[price, size]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel(pub f64, pub f64);

impl PriceLevel {
    pub fn price(&self) -> f64 {
        self.0
    }

    pub fn size(&self) -> f64 {
        self.1
    }
}

// =============================================================================
// Ingest events
// =============================================================================

/// A normalized trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    /// Source-provided timestamp (ms). Equal to `received_at` when absent.
    #[serde(rename = "timestamp")]
    pub event_time: i64,
    pub received_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_buyer_maker: Option<bool>,
}

impl Trade {
    /// Notional value in quote units.
    pub fn value(&self) -> f64 {
        self.price * self.quantity
    }

    /// Signed notional: positive for buy aggressor, negative for sell.
    /// Unknown-side trades contribute zero.
    pub fn signed_value(&self) -> f64 {
        match self.side {
            Side::Buy => self.value(),
            Side::Sell => -self.value(),
            Side::Unknown => 0.0,
        }
    }
}

/// An incremental depth update. A `size == 0` entry deletes that level.
///
/// Snapshots (`is_snapshot == true`) carry a complete level set and serve as
/// the reset point for incremental book state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthDelta {
    pub exchange: String,
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
    pub received_at: i64,
    /// Exchange sequence number of the last update covered by this delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
    /// First sequence number covered (exchanges that report ranges).
    #[serde(default, skip_serializing)]
    pub first_update_id: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_snapshot: bool,
    #[serde(default, skip_serializing)]
    pub checksum: Option<String>,
}

/// An OHLCV candle, either in progress or finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub symbol: String,
    #[serde(rename = "interval")]
    pub timeframe: String,
    /// Bucket open, aligned to the timeframe boundary in UTC (ms).
    #[serde(rename = "timestamp")]
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub vwap: f64,
    #[serde(rename = "confirmed")]
    pub is_complete: bool,
    pub received_at: i64,
}

impl Candle {
    /// OHLC sanity: all four prices positive and low/high bracket open/close.
    pub fn is_valid(&self) -> bool {
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
    }
}

// =============================================================================
// Derived events
// =============================================================================

/// Throttled best-bid/ask summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookTicker {
    pub exchange: String,
    pub symbol: String,
    pub best_bid: f64,
    pub best_bid_size: f64,
    pub best_ask: f64,
    pub best_ask_size: f64,
    pub mid: f64,
    pub spread: f64,
    pub spread_percent: f64,
    /// `best_bid_size / (best_bid_size + best_ask_size)`.
    pub imbalance: f64,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

/// Wall significance, as a multiple of the per-symbol threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WallSignificance {
    Minor,
    Moderate,
    Major,
    Massive,
}

impl WallSignificance {
    /// Classify a level size against the per-symbol wall threshold.
    /// Returns `None` below 1x.
    pub fn classify(size: f64, threshold: f64) -> Option<Self> {
        if threshold <= 0.0 || size < threshold {
            return None;
        }
        let ratio = size / threshold;
        Some(if ratio >= 10.0 {
            Self::Massive
        } else if ratio >= 5.0 {
            Self::Major
        } else if ratio >= 2.0 {
            Self::Moderate
        } else {
            Self::Minor
        })
    }
}

/// An order-book level whose size exceeds the per-symbol wall threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wall {
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub significance: WallSignificance,
}

/// Derived order-book snapshot published by the order-book engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub exchange: String,
    pub symbol: String,
    /// Top levels, bids descending / asks ascending by price.
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid: f64,
    pub spread: f64,
    /// Cumulative base-unit depth at the top 5 / 10 / 20 levels.
    pub bid_depth: BTreeMap<String, f64>,
    pub ask_depth: BTreeMap<String, f64>,
    pub imbalance: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub walls: Vec<Wall>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

/// Per-trade order-flow enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFlow {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub value: f64,
    /// Percent move vs. the recent-trade mean price.
    pub price_impact: f64,
    /// Net aggressor pressure over the recent window, in [-1, +1].
    pub pressure: f64,
    pub is_whale: bool,
    /// VPIN-style flow toxicity in [0, 1].
    pub toxicity: f64,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

/// Cumulative volume delta over the configured sliding windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvdUpdate {
    pub exchange: String,
    pub symbol: String,
    /// Window label (`"1m"`, `"5m"`, ...) -> signed quote value.
    pub windows: BTreeMap<String, f64>,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

// =============================================================================
// Poller events
// =============================================================================

/// Perpetual funding rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub exchange: String,
    pub symbol: String,
    /// Raw rate as a decimal (0.0001 = 0.01%).
    pub funding_rate: f64,
    pub next_funding_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

/// Derivatives mark price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPrice {
    pub exchange: String,
    pub symbol: String,
    pub mark_price: f64,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

/// Outstanding open interest in contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenInterest {
    pub exchange: String,
    pub symbol: String,
    pub open_interest: f64,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

/// A forced liquidation, streamed or polled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
    pub exchange: String,
    pub symbol: String,
    /// Side of the liquidated position's closing order.
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub value: f64,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
    pub received_at: i64,
}

/// Exchange insurance-fund balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceFund {
    pub exchange: String,
    pub asset: String,
    pub balance: f64,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

// =============================================================================
// Control events
// =============================================================================

/// Priority shared by snapshot requests and the publish confirmer queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Queue index, highest priority first.
    pub fn index(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// A detected discontinuity in exchange sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapEvent {
    pub exchange: String,
    pub symbol: String,
    pub expected: u64,
    pub received: u64,
    pub size: u64,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

/// Request for a fresh REST depth snapshot to re-seed book state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub exchange: String,
    pub symbol: String,
    pub priority: Priority,
    pub reason: String,
    #[serde(rename = "timestamp")]
    pub event_time: i64,
}

/// A frame that classified to no known shape. Preserved, not dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFrame {
    pub exchange: String,
    pub symbol: String,
    pub payload: String,
    pub received_at: i64,
}

// =============================================================================
// Event envelope
// =============================================================================

/// The typed envelope carried on the internal bus and broadcast as JSON.
///
/// Serialises with an adjacent `type` tag matching the wire schema, e.g.
/// `{"type":"trade","exchange":"binance",...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MarketEvent {
    #[serde(rename = "trade")]
    Trade(Trade),
    #[serde(rename = "depth")]
    Depth(DepthDelta),
    #[serde(rename = "candle")]
    Candle(Candle),
    #[serde(rename = "ticker")]
    Ticker(BookTicker),
    #[serde(rename = "orderbook")]
    OrderBook(OrderBookSnapshot),
    #[serde(rename = "orderflow")]
    OrderFlow(OrderFlow),
    #[serde(rename = "cvd")]
    Cvd(CvdUpdate),
    #[serde(rename = "funding")]
    Funding(FundingRate),
    #[serde(rename = "mark_price")]
    MarkPrice(MarkPrice),
    #[serde(rename = "open_interest")]
    OpenInterest(OpenInterest),
    #[serde(rename = "liquidation")]
    Liquidation(Liquidation),
    #[serde(rename = "insurance_fund")]
    InsuranceFund(InsuranceFund),
    #[serde(rename = "gap")]
    Gap(GapEvent),
    #[serde(rename = "snapshot_request")]
    SnapshotRequest(SnapshotRequest),
    #[serde(rename = "raw")]
    Raw(RawFrame),
}

impl MarketEvent {
    /// The exchange that produced this event, where one applies.
    pub fn exchange(&self) -> Option<&str> {
        match self {
            Self::Trade(e) => Some(&e.exchange),
            Self::Depth(e) => Some(&e.exchange),
            Self::Candle(e) => Some(&e.exchange),
            Self::Ticker(e) => Some(&e.exchange),
            Self::OrderBook(e) => Some(&e.exchange),
            Self::OrderFlow(e) => Some(&e.exchange),
            Self::Cvd(e) => Some(&e.exchange),
            Self::Funding(e) => Some(&e.exchange),
            Self::MarkPrice(e) => Some(&e.exchange),
            Self::OpenInterest(e) => Some(&e.exchange),
            Self::Liquidation(e) => Some(&e.exchange),
            Self::InsuranceFund(e) => Some(&e.exchange),
            Self::Gap(e) => Some(&e.exchange),
            Self::SnapshotRequest(e) => Some(&e.exchange),
            Self::Raw(e) => Some(&e.exchange),
        }
    }

    /// The canonical symbol this event pertains to, where one applies.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Trade(e) => Some(&e.symbol),
            Self::Depth(e) => Some(&e.symbol),
            Self::Candle(e) => Some(&e.symbol),
            Self::Ticker(e) => Some(&e.symbol),
            Self::OrderBook(e) => Some(&e.symbol),
            Self::OrderFlow(e) => Some(&e.symbol),
            Self::Cvd(e) => Some(&e.symbol),
            Self::Funding(e) => Some(&e.symbol),
            Self::MarkPrice(e) => Some(&e.symbol),
            Self::OpenInterest(e) => Some(&e.symbol),
            Self::Liquidation(e) => Some(&e.symbol),
            Self::InsuranceFund(_) => None,
            Self::Gap(e) => Some(&e.symbol),
            Self::SnapshotRequest(e) => Some(&e.symbol),
            Self::Raw(e) => Some(&e.symbol),
        }
    }
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_serialises_with_type_tag_and_timestamp() {
        let trade = Trade {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            price: 42.10,
            quantity: 3.0,
            side: Side::Buy,
            event_time: 1_700_000_000_499,
            received_at: 1_700_000_000_500,
            trade_id: Some("123".into()),
            is_buyer_maker: Some(false),
        };
        let json = serde_json::to_value(MarketEvent::Trade(trade)).unwrap();
        assert_eq!(json["type"], "trade");
        assert_eq!(json["exchange"], "binance");
        assert_eq!(json["symbol"], "solusdt");
        assert_eq!(json["side"], "buy");
        assert_eq!(json["timestamp"], 1_700_000_000_499_i64);
        assert_eq!(json["trade_id"], "123");
    }

    #[test]
    fn depth_levels_serialise_as_pairs() {
        let delta = DepthDelta {
            exchange: "bybit".into(),
            symbol: "btcusdt".into(),
            bids: vec![PriceLevel(100.0, 2.0), PriceLevel(99.0, 1.0)],
            asks: vec![PriceLevel(101.0, 3.0)],
            event_time: 1,
            received_at: 2,
            update_id: Some(42),
            first_update_id: Some(40),
            is_snapshot: false,
            checksum: None,
        };
        let json = serde_json::to_value(MarketEvent::Depth(delta)).unwrap();
        assert_eq!(json["type"], "depth");
        assert_eq!(json["bids"][0][0], 100.0);
        assert_eq!(json["bids"][0][1], 2.0);
        assert_eq!(json["update_id"], 42);
        // Internal-only fields do not leak onto the wire.
        assert!(json.get("first_update_id").is_none());
        assert!(json.get("is_snapshot").is_none());
    }

    #[test]
    fn wall_significance_ladder() {
        assert_eq!(WallSignificance::classify(50.0, 100.0), None);
        assert_eq!(
            WallSignificance::classify(100.0, 100.0),
            Some(WallSignificance::Minor)
        );
        assert_eq!(
            WallSignificance::classify(250.0, 100.0),
            Some(WallSignificance::Moderate)
        );
        assert_eq!(
            WallSignificance::classify(500.0, 100.0),
            Some(WallSignificance::Major)
        );
        assert_eq!(
            WallSignificance::classify(1_500.0, 100.0),
            Some(WallSignificance::Massive)
        );
        assert_eq!(WallSignificance::classify(100.0, 0.0), None);
    }

    #[test]
    fn signed_value_sign_follows_aggressor() {
        let mut trade = Trade {
            exchange: "okx".into(),
            symbol: "ethusdt".into(),
            price: 10.0,
            quantity: 2.0,
            side: Side::Buy,
            event_time: 0,
            received_at: 0,
            trade_id: None,
            is_buyer_maker: None,
        };
        assert!((trade.signed_value() - 20.0).abs() < f64::EPSILON);
        trade.side = Side::Sell;
        assert!((trade.signed_value() + 20.0).abs() < f64::EPSILON);
        trade.side = Side::Unknown;
        assert_eq!(trade.signed_value(), 0.0);
    }

    #[test]
    fn candle_validity() {
        let mut candle = Candle {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            timeframe: "1m".into(),
            open_time: 0,
            close_time: 59_999,
            open: 42.0,
            high: 42.5,
            low: 41.9,
            close: 42.3,
            volume: 5.0,
            quote_volume: 211.2,
            trade_count: 4,
            taker_buy_volume: 3.0,
            taker_buy_quote_volume: 126.0,
            vwap: 42.24,
            is_complete: true,
            received_at: 0,
        };
        assert!(candle.is_valid());
        candle.low = 0.0;
        assert!(!candle.is_valid());
    }

    #[test]
    fn priority_ordering_and_queue_index() {
        assert!(Priority::Critical < Priority::High);
        assert_eq!(Priority::Critical.index(), 0);
        assert_eq!(Priority::Low.index(), 3);
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "\"high\"");
    }

    #[test]
    fn event_envelope_roundtrip() {
        let ev = MarketEvent::SnapshotRequest(SnapshotRequest {
            exchange: "binance".into(),
            symbol: "solusdt".into(),
            priority: Priority::High,
            reason: "gap of 148".into(),
            event_time: 5,
        });
        let json = serde_json::to_string(&ev).unwrap();
        let back: MarketEvent = serde_json::from_str(&json).unwrap();
        match back {
            MarketEvent::SnapshotRequest(req) => {
                assert_eq!(req.priority, Priority::High);
                assert_eq!(req.symbol, "solusdt");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
