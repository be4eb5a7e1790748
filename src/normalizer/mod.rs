// =============================================================================
// Normalizer — per-exchange wire frames to canonical events
// =============================================================================
//
// Pure per (exchange, message) projection. Dispatch selects the parser by
// exchange name; each parser classifies the frame by its topic/channel/
// event-type field and extracts the typed payload.
//
// Failure policy:
//   - A frame that cannot be classified is preserved as a `Raw` event with
//     a warning; it is not dropped.
//   - A frame that classifies but fails to parse its required numeric
//     fields is dropped with a warning.
//
// Some intermediate hops deliver JSON payloads double-encoded as a JSON
// string; those are transparently unquoted once before parsing.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod hyperliquid;
pub mod okx;

use anyhow::{Context, Result};
use tracing::warn;

use crate::types::{MarketEvent, RawFrame};

/// Why a parser rejected a frame.
#[derive(Debug)]
pub enum NormalizeError {
    /// The frame matches no known shape for this exchange.
    Unclassified,
    /// The frame classified but a required field failed to parse.
    Invalid(anyhow::Error),
}

/// Project one wire frame into canonical events.
///
/// `symbol_hint` is the canonical symbol the connector session serves; it
/// resolves payloads that do not carry their own symbol (Binance partial
/// depth, Hyperliquid coins).
pub fn normalize(
    exchange: &str,
    symbol_hint: &str,
    raw: &str,
    received_at: i64,
) -> Vec<MarketEvent> {
    let result = match exchange {
        "binance" => binance::parse(symbol_hint, raw, received_at),
        "bybit" => bybit::parse(symbol_hint, raw, received_at),
        "okx" => okx::parse(symbol_hint, raw, received_at),
        "hyperliquid" => hyperliquid::parse(symbol_hint, raw, received_at),
        _ => Err(NormalizeError::Unclassified),
    };

    match result {
        Ok(events) => events,
        Err(NormalizeError::Unclassified) => {
            warn!(exchange, symbol = symbol_hint, "unclassified frame kept as raw");
            vec![MarketEvent::Raw(RawFrame {
                exchange: exchange.to_string(),
                symbol: symbol_hint.to_string(),
                payload: raw.to_string(),
                received_at,
            })]
        }
        Err(NormalizeError::Invalid(err)) => {
            warn!(exchange, symbol = symbol_hint, error = %err, "dropping unparsable frame");
            Vec::new()
        }
    }
}

/// Decode a frame, unquoting a double-encoded JSON payload once.
pub(crate) fn parse_json_frame(text: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(text).context("frame is not valid JSON")?;
    if let serde_json::Value::String(inner) = &value {
        // Double-quoted payload from an intermediate hop.
        return serde_json::from_str(inner).context("double-quoted frame is not valid JSON");
    }
    Ok(value)
}

/// Numeric fields arrive as JSON strings on most venues; accept both.
pub(crate) fn field_f64(value: &serde_json::Value, name: &str) -> Result<f64> {
    match value {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Millisecond timestamps arrive as integers or decimal strings.
pub(crate) fn field_ms(value: &serde_json::Value, name: &str) -> Result<i64> {
    match value {
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("failed to parse {name} as ms: {s}")),
        serde_json::Value::Number(n) => n
            .as_i64()
            .with_context(|| format!("field {name} is not a valid ms timestamp")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse a `[["price","size"], ...]` ladder.
pub(crate) fn parse_levels(
    value: &serde_json::Value,
    name: &str,
) -> Result<Vec<crate::types::PriceLevel>> {
    let array = value
        .as_array()
        .with_context(|| format!("field {name} is not an array"))?;
    let mut levels = Vec::with_capacity(array.len());
    for entry in array {
        let pair = entry
            .as_array()
            .with_context(|| format!("{name} entry is not an array"))?;
        if pair.len() < 2 {
            anyhow::bail!("{name} entry has fewer than two elements");
        }
        let price = field_f64(&pair[0], name)?;
        let size = field_f64(&pair[1], name)?;
        levels.push(crate::types::PriceLevel(price, size));
    }
    Ok(levels)
}

// =============================================================================
// Tests
// =============================================================================
