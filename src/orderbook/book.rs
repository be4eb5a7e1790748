// =============================================================================
// Book State — per (exchange, symbol) price ladders built from deltas
// =============================================================================
//
// Bids and asks live in BTreeMaps keyed by an integer price key so that
// iteration order is the ladder order. Delta application is a single
// transition: the outcome reports what happened (applied, duplicate, gap,
// reset, invariant violation) and the caller decides on publication and
// resync. No partial mutation: a delta that is refused leaves the maps
// untouched.
// =============================================================================

use std::collections::BTreeMap;

use crate::types::{
    DepthDelta, OrderBookSnapshot, PriceLevel, Side, Wall, WallSignificance,
};

/// Depth level counts reported in derived snapshots.
pub const DEPTH_LEVELS: [usize; 3] = [5, 10, 20];

/// Price resolution for map keys: 1e-8 of a quote unit.
const PRICE_SCALE: f64 = 1e8;

fn price_key(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

#[derive(Debug, Clone, Copy)]
struct Level {
    price: f64,
    size: f64,
}

/// What applying one delta did to the book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Levels merged; book advanced to the delta's update id.
    Applied,
    /// Snapshot replaced the whole ladder.
    Reset,
    /// Update id at or below the last applied one; nothing changed.
    Duplicate,
    /// Delta is not contiguous with the applied sequence; nothing changed.
    /// The book is stale until a snapshot arrives.
    Gap { expected: u64, received: u64 },
    /// A negative size slipped through; the book has been cleared and must
    /// be re-seeded from a snapshot.
    InvariantViolation { detail: String },
}

/// In-memory order book for one (exchange, symbol).
pub struct BookState {
    pub exchange: String,
    pub symbol: String,
    bids: BTreeMap<i64, Level>,
    asks: BTreeMap<i64, Level>,
    pub last_applied_update_id: Option<u64>,
    pub last_applied_event_time: i64,
    pub is_stale: bool,
    /// Consecutive deltas that left best_bid >= best_ask. One is tolerated;
    /// two in a row marks the book stale.
    crossed_streak: u32,
}

impl BookState {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_applied_update_id: None,
            last_applied_event_time: 0,
            is_stale: false,
            crossed_streak: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.values().next_back().map(|l| (l.price, l.size))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.values().next().map(|l| (l.price, l.size))
    }

    /// Apply one delta. Snapshots always reset; increments are refused when
    /// stale, duplicate, or non-contiguous.
    pub fn apply(&mut self, delta: &DepthDelta) -> ApplyOutcome {
        if delta.is_snapshot {
            return self.reset_from(delta);
        }

        // Duplicate delivery is idempotent.
        if let (Some(last), Some(incoming)) = (self.last_applied_update_id, delta.update_id) {
            if incoming <= last {
                return ApplyOutcome::Duplicate;
            }
            // Contiguity: the delta must pick up exactly where the book
            // left off. Exchanges that report ranges carry first_update_id;
            // single-sequence feeds use the update id itself.
            let first = delta.first_update_id.unwrap_or(incoming);
            let expected = last + 1;
            if first > expected {
                self.is_stale = true;
                return ApplyOutcome::Gap {
                    expected,
                    received: first,
                };
            }
        }

        // A stale book only leaves staleness through a snapshot.
        if self.is_stale {
            return ApplyOutcome::Gap {
                expected: self.last_applied_update_id.map(|u| u + 1).unwrap_or(0),
                received: delta.update_id.unwrap_or(0),
            };
        }

        if let Some(detail) = validate_sizes(delta) {
            self.bids.clear();
            self.asks.clear();
            self.last_applied_update_id = None;
            self.is_stale = true;
            return ApplyOutcome::InvariantViolation { detail };
        }

        for level in &delta.bids {
            upsert(&mut self.bids, level);
        }
        for level in &delta.asks {
            upsert(&mut self.asks, level);
        }

        if let Some(id) = delta.update_id {
            self.last_applied_update_id = Some(id);
        }
        self.last_applied_event_time = delta.event_time;
        self.track_cross();
        ApplyOutcome::Applied
    }

    fn reset_from(&mut self, snapshot: &DepthDelta) -> ApplyOutcome {
        if let Some(detail) = validate_sizes(snapshot) {
            return ApplyOutcome::InvariantViolation { detail };
        }

        self.bids.clear();
        self.asks.clear();
        for level in &snapshot.bids {
            upsert(&mut self.bids, level);
        }
        for level in &snapshot.asks {
            upsert(&mut self.asks, level);
        }
        self.last_applied_update_id = snapshot.update_id;
        self.last_applied_event_time = snapshot.event_time;
        self.is_stale = false;
        self.crossed_streak = 0;
        ApplyOutcome::Reset
    }

    fn track_cross(&mut self) {
        let crossed = match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        };
        if crossed {
            self.crossed_streak += 1;
            if self.crossed_streak >= 2 {
                self.is_stale = true;
            }
        } else {
            self.crossed_streak = 0;
        }
    }

    /// Whether the book has been crossed for two deltas and needs resync.
    pub fn needs_resync(&self) -> bool {
        self.is_stale
    }

    /// Derive a publishable snapshot: sorted top levels, spread, cumulative
    /// depth at the standard level counts, top-of-book imbalance, and walls.
    pub fn snapshot(&self, wall_threshold: f64, event_time: i64) -> Option<OrderBookSnapshot> {
        let (best_bid, best_bid_size) = self.best_bid()?;
        let (best_ask, best_ask_size) = self.best_ask()?;

        let max_levels = *DEPTH_LEVELS.iter().max().unwrap_or(&20);
        let bids: Vec<PriceLevel> = self
            .bids
            .values()
            .rev()
            .take(max_levels)
            .map(|l| PriceLevel(l.price, l.size))
            .collect();
        let asks: Vec<PriceLevel> = self
            .asks
            .values()
            .take(max_levels)
            .map(|l| PriceLevel(l.price, l.size))
            .collect();

        let mut bid_depth = std::collections::BTreeMap::new();
        let mut ask_depth = std::collections::BTreeMap::new();
        for n in DEPTH_LEVELS {
            bid_depth.insert(
                format!("top_{n}"),
                bids.iter().take(n).map(PriceLevel::size).sum(),
            );
            ask_depth.insert(
                format!("top_{n}"),
                asks.iter().take(n).map(PriceLevel::size).sum(),
            );
        }

        let spread = best_ask - best_bid;
        let mid = (best_ask + best_bid) / 2.0;
        let tob_total = best_bid_size + best_ask_size;
        let imbalance = if tob_total > 0.0 {
            best_bid_size / tob_total
        } else {
            0.0
        };

        let mut walls = Vec::new();
        for level in &bids {
            if let Some(significance) = WallSignificance::classify(level.size(), wall_threshold) {
                walls.push(Wall {
                    side: Side::Buy,
                    price: level.price(),
                    size: level.size(),
                    significance,
                });
            }
        }
        for level in &asks {
            if let Some(significance) = WallSignificance::classify(level.size(), wall_threshold) {
                walls.push(Wall {
                    side: Side::Sell,
                    price: level.price(),
                    size: level.size(),
                    significance,
                });
            }
        }

        Some(OrderBookSnapshot {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            bids,
            asks,
            best_bid,
            best_ask,
            mid,
            spread,
            bid_depth,
            ask_depth,
            imbalance,
            walls,
            is_stale: self.is_stale,
            update_id: self.last_applied_update_id,
            event_time,
        })
    }

    /// Full ladder as (price, size) pairs, bids descending / asks ascending.
    /// Used by tests to compare against naive recomputation.
    pub fn levels(&self) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let bids = self
            .bids
            .values()
            .rev()
            .map(|l| (l.price, l.size))
            .collect();
        let asks = self.asks.values().map(|l| (l.price, l.size)).collect();
        (bids, asks)
    }
}

fn upsert(side: &mut BTreeMap<i64, Level>, level: &PriceLevel) {
    let key = price_key(level.price());
    if level.size() == 0.0 {
        side.remove(&key);
    } else {
        side.insert(
            key,
            Level {
                price: level.price(),
                size: level.size(),
            },
        );
    }
}

fn validate_sizes(delta: &DepthDelta) -> Option<String> {
    for level in delta.bids.iter().chain(delta.asks.iter()) {
        if level.size() < 0.0 || !level.size().is_finite() || !level.price().is_finite() {
            return Some(format!(
                "bad level [{}, {}]",
                level.price(),
                level.size()
            ));
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
