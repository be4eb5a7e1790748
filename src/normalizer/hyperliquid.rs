// =============================================================================
// Hyperliquid frame parser
// =============================================================================
//
// Frames are `{"channel":...,"data":...}`. Trades carry coin names and
// single-letter sides (`B` = buy aggressor, `A` = sell aggressor); l2Book
// pushes a complete two-sided level listing on every update, so each frame
// is a snapshot. Coins carry no quote asset; the session's symbol hint
// supplies the canonical name.
// =============================================================================

use anyhow::{Context, Result};

use crate::types::{DepthDelta, MarketEvent, PriceLevel, Side, Trade};

use super::{field_f64, field_ms, parse_json_frame, NormalizeError};

pub fn parse(
    symbol_hint: &str,
    raw: &str,
    received_at: i64,
) -> Result<Vec<MarketEvent>, NormalizeError> {
    let root = parse_json_frame(raw).map_err(|_| NormalizeError::Unclassified)?;

    let channel = match root["channel"].as_str() {
        Some(c) => c,
        None => return Err(NormalizeError::Unclassified),
    };

    match channel {
        "trades" => parse_trades(symbol_hint, &root, received_at)
            .map_err(NormalizeError::Invalid),
        "l2Book" => parse_l2_book(symbol_hint, &root, received_at)
            .map_err(NormalizeError::Invalid),
        // Connection-level acknowledgements.
        "subscriptionResponse" | "pong" => Ok(Vec::new()),
        _ => Err(NormalizeError::Unclassified),
    }
}

/// `{"channel":"trades","data":[{"coin":"SOL","side":"B","px":"42.10",
///   "sz":"3.0","time":1700000000499,"tid":123}]}`
fn parse_trades(
    symbol_hint: &str,
    root: &serde_json::Value,
    received_at: i64,
) -> Result<Vec<MarketEvent>> {
    let data = root["data"].as_array().context("missing data array")?;
    let mut events = Vec::with_capacity(data.len());

    for entry in data {
        let side = match entry["side"].as_str().context("missing side")? {
            "B" => Side::Buy,
            "A" => Side::Sell,
            other => anyhow::bail!("unexpected trade side {other}"),
        };
        let price = field_f64(&entry["px"], "px")?;
        let quantity = field_f64(&entry["sz"], "sz")?;
        let event_time = field_ms(&entry["time"], "time").unwrap_or(received_at);
        let trade_id = match &entry["tid"] {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) => Some(s.clone()),
            _ => None,
        };

        events.push(MarketEvent::Trade(Trade {
            exchange: "hyperliquid".into(),
            symbol: symbol_hint.to_string(),
            price,
            quantity,
            side,
            event_time,
            received_at,
            trade_id,
            is_buyer_maker: Some(side == Side::Sell),
        }));
    }
    Ok(events)
}

/// `{"channel":"l2Book","data":{"coin":"SOL","time":...,
///   "levels":[[{"px":"42.0","sz":"5","n":4}],[{"px":"42.1","sz":"3","n":2}]]}}`
fn parse_l2_book(
    symbol_hint: &str,
    root: &serde_json::Value,
    received_at: i64,
) -> Result<Vec<MarketEvent>> {
    let data = &root["data"];
    let levels = data["levels"].as_array().context("missing levels")?;
    if levels.len() < 2 {
        anyhow::bail!("levels array has fewer than two sides");
    }

    let bids = parse_side(&levels[0], "bids")?;
    let asks = parse_side(&levels[1], "asks")?;
    let event_time = field_ms(&data["time"], "time").unwrap_or(received_at);

    Ok(vec![MarketEvent::Depth(DepthDelta {
        exchange: "hyperliquid".into(),
        symbol: symbol_hint.to_string(),
        bids,
        asks,
        event_time,
        received_at,
        // No sequence numbers on this venue; every frame is a full reset.
        update_id: None,
        first_update_id: None,
        is_snapshot: true,
        checksum: None,
    })])
}

fn parse_side(value: &serde_json::Value, name: &str) -> Result<Vec<PriceLevel>> {
    let array = value
        .as_array()
        .with_context(|| format!("{name} side is not an array"))?;
    let mut levels = Vec::with_capacity(array.len());
    for entry in array {
        levels.push(PriceLevel(
            field_f64(&entry["px"], "px")?,
            field_f64(&entry["sz"], "sz")?,
        ));
    }
    Ok(levels)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trades_use_hint_symbol_and_letter_sides() {
        let frame = r#"{"channel":"trades","data":[
            {"coin":"SOL","side":"B","px":"42.10","sz":"3.0","time":1700000000499,"tid":123},
            {"coin":"SOL","side":"A","px":"42.09","sz":"1.0","time":1700000000500,"tid":124}]}"#;
        let events = parse("solusdt", frame, 1_700_000_000_501).unwrap();
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (MarketEvent::Trade(buy), MarketEvent::Trade(sell)) => {
                assert_eq!(buy.symbol, "solusdt");
                assert_eq!(buy.side, Side::Buy);
                assert_eq!(buy.trade_id.as_deref(), Some("123"));
                assert_eq!(sell.side, Side::Sell);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn l2_book_is_always_a_snapshot() {
        let frame = r#"{"channel":"l2Book","data":{"coin":"SOL","time":1700000000000,
            "levels":[[{"px":"42.0","sz":"5","n":4},{"px":"41.9","sz":"2","n":1}],
                      [{"px":"42.1","sz":"3","n":2}]]}}"#;
        let events = parse("solusdt", frame, 1).unwrap();
        match &events[0] {
            MarketEvent::Depth(d) => {
                assert!(d.is_snapshot);
                assert_eq!(d.update_id, None);
                assert_eq!(d.bids.len(), 2);
                assert_eq!(d.asks.len(), 1);
                assert_eq!(d.bids[0].price(), 42.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn pong_is_control() {
        assert!(parse("solusdt", r#"{"channel":"pong"}"#, 1)
            .unwrap()
            .is_empty());
        assert!(parse(
            "solusdt",
            r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#,
            1
        )
        .unwrap()
        .is_empty());
    }

    #[test]
    fn unknown_channel_is_unclassified() {
        assert!(matches!(
            parse("solusdt", r#"{"channel":"userEvents","data":{}}"#, 1),
            Err(NormalizeError::Unclassified)
        ));
    }
}
