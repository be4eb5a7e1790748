// =============================================================================
// Symbol normalization, instrument naming, and bus subject builders
// =============================================================================
//
// Every exchange spells instruments differently (SOLUSDT, SOL-USDT-SWAP,
// bare SOL on Hyperliquid). The canonical form used throughout the pipeline
// is lowercase with hyphens, underscores and slashes stripped and perp
// suffixes removed: all of the above normalize to `solusdt`.
//
// Bus subjects are colon-delimited lowercase strings; every producer builds
// them through the helpers here so that naming stays centralized.
// =============================================================================

/// Quote assets recognized when splitting a canonical symbol.
const QUOTE_ASSETS: &[&str] = &["usdt", "usdc", "busd", "usd", "btc", "eth"];

/// Perp suffixes stripped during normalization.
const PERP_SUFFIXES: &[&str] = &["swap", "perp"];

/// Normalize an exchange-native instrument name to the canonical form:
/// lowercase, separator-stripped, perp suffix removed.
///
/// `SOL-USDT-SWAP` -> `solusdt`, `SOLUSDT` -> `solusdt`, `sol_usdt` -> `solusdt`.
pub fn normalize(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let parts: Vec<&str> = lower
        .split(['-', '_', '/'])
        .filter(|p| !p.is_empty() && !PERP_SUFFIXES.contains(p))
        .collect();
    parts.join("")
}

/// Split a canonical symbol into (base, quote) by recognized quote suffix.
/// `solusdt` -> (`sol`, `usdt`). Falls back to treating the whole symbol
/// as the base with an empty quote.
pub fn split_base_quote(symbol: &str) -> (String, String) {
    for quote in QUOTE_ASSETS {
        if symbol.len() > quote.len() && symbol.ends_with(quote) {
            let base = &symbol[..symbol.len() - quote.len()];
            return (base.to_string(), (*quote).to_string());
        }
    }
    (symbol.to_string(), String::new())
}

/// Render a canonical symbol in the given exchange's native form.
///
/// `solusdt` -> Binance/Bybit `SOLUSDT`, OKX `SOL-USDT-SWAP`, Hyperliquid `SOL`.
pub fn instrument_for(exchange: &str, symbol: &str) -> String {
    match exchange {
        "okx" => {
            let (base, quote) = split_base_quote(symbol);
            if quote.is_empty() {
                base.to_uppercase()
            } else {
                format!("{}-{}-SWAP", base.to_uppercase(), quote.to_uppercase())
            }
        }
        "hyperliquid" => {
            let (base, _) = split_base_quote(symbol);
            base.to_uppercase()
        }
        // Binance and Bybit use the concatenated uppercase form.
        _ => symbol.to_uppercase(),
    }
}

// =============================================================================
// Bus subjects
// =============================================================================

pub const GAP_DETECTION: &str = "gap_detection";
pub const SNAPSHOT_REQUESTS: &str = "snapshot_requests";

pub fn trade_subject(exchange: &str, symbol: &str) -> String {
    format!("trade:{exchange}:{symbol}")
}

pub fn depth_subject(exchange: &str, symbol: &str) -> String {
    format!("depth:{exchange}:{symbol}")
}

pub fn orderbook_subject(symbol: &str) -> String {
    format!("orderbook:{symbol}")
}

pub fn orderflow_subject(symbol: &str) -> String {
    format!("orderflow:{symbol}")
}

pub fn book_ticker_subject(exchange: &str, symbol: &str) -> String {
    format!("book_ticker:{exchange}:{symbol}")
}

pub fn candle_subject(symbol: &str, timeframe: &str) -> String {
    format!("candles:{symbol}:{timeframe}")
}

pub fn cvd_subject(exchange: &str, symbol: &str) -> String {
    format!("cvd:{exchange}:{symbol}")
}

pub fn snapshots_subject(exchange: &str, symbol: &str) -> String {
    format!("snapshots:{exchange}:{symbol}")
}

pub fn funding_subject(exchange: &str, symbol: &str) -> String {
    format!("funding:{exchange}:{symbol}")
}

pub fn mark_price_subject(exchange: &str, symbol: &str) -> String {
    format!("meta:mark_price:{exchange}:{symbol}")
}

pub fn open_interest_subject(exchange: &str, symbol: &str) -> String {
    format!("meta:oi:{exchange}:{symbol}")
}

pub fn liquidation_subject(exchange: &str, symbol: &str) -> String {
    format!("liquidation:{exchange}:{symbol}")
}

pub fn insurance_subject(exchange: &str) -> String {
    format!("meta:insurance:{exchange}")
}

pub fn raw_subject(exchange: &str, symbol: &str) -> String {
    format!("raw:{exchange}:{symbol}")
}

// =============================================================================
// Candle retention ladder
// =============================================================================

/// In-memory retention cap for finalized candles of a given timeframe.
/// Shorter timeframes keep more bars; the ladder covers roughly one to two
/// days of sub-minute data and a year of dailies.
pub fn retention_for(timeframe: &str) -> usize {
    match timeframe {
        "1s" | "5s" => 3_600,
        "15s" | "30s" => 2_400,
        "1m" => 1_440,
        "3m" | "5m" => 960,
        "15m" | "30m" => 672,
        "1h" | "2h" => 720,
        "4h" | "6h" | "12h" => 360,
        "1d" => 365,
        _ => 500,
    }
}

// =============================================================================
// Tests
// =============================================================================
