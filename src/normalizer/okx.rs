// =============================================================================
// OKX v5 frame parser
// =============================================================================
//
// Data frames carry `{"arg":{"channel":...,"instId":...},"data":[...]}` with
// an optional `action` (snapshot/update) on book channels. Event frames
// (`{"event":"subscribe",...}`) are control traffic. Timestamps are
// millisecond strings. Book rows are `[price, size, liqOrders, numOrders]`;
// candle rows are positional arrays.
// =============================================================================

use anyhow::{Context, Result};

use crate::symbols;
use crate::types::{Candle, DepthDelta, MarketEvent, PriceLevel, Side, Trade};

use super::{field_f64, field_ms, parse_json_frame, NormalizeError};

pub fn parse(
    _symbol_hint: &str,
    raw: &str,
    received_at: i64,
) -> Result<Vec<MarketEvent>, NormalizeError> {
    let root = parse_json_frame(raw).map_err(|_| NormalizeError::Unclassified)?;

    // Subscribe acks and error notices.
    if root.get("event").is_some() {
        return Ok(Vec::new());
    }

    let channel = match root["arg"]["channel"].as_str() {
        Some(c) => c,
        None => return Err(NormalizeError::Unclassified),
    };
    let inst_id = root["arg"]["instId"].as_str().unwrap_or_default();
    let symbol = symbols::normalize(inst_id);

    match channel {
        "trades" => parse_trades(&root, received_at).map_err(NormalizeError::Invalid),
        "books" | "books5" | "books50-l2-tbt" | "books-l2-tbt" => {
            parse_books(&root, &symbol, received_at).map_err(NormalizeError::Invalid)
        }
        c if c.starts_with("candle") => {
            let timeframe = c["candle".len()..].to_lowercase();
            parse_candles(&root, &symbol, &timeframe, received_at)
                .map_err(NormalizeError::Invalid)
        }
        _ => Err(NormalizeError::Unclassified),
    }
}

/// `{"arg":{"channel":"trades","instId":"SOL-USDT-SWAP"},"data":[
///   {"instId":...,"tradeId":"123","px":"42.10","sz":"3.0","side":"buy","ts":"1700000000499"}]}`
fn parse_trades(root: &serde_json::Value, received_at: i64) -> Result<Vec<MarketEvent>> {
    let data = root["data"].as_array().context("missing data array")?;
    let mut events = Vec::with_capacity(data.len());

    for entry in data {
        let symbol = symbols::normalize(entry["instId"].as_str().context("missing instId")?);
        let side = match entry["side"].as_str().context("missing side")? {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => anyhow::bail!("unexpected trade side {other}"),
        };
        let price = field_f64(&entry["px"], "px")?;
        let quantity = field_f64(&entry["sz"], "sz")?;
        let event_time = field_ms(&entry["ts"], "ts").unwrap_or(received_at);
        let trade_id = entry["tradeId"].as_str().map(str::to_string);

        events.push(MarketEvent::Trade(Trade {
            exchange: "okx".into(),
            symbol,
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

/// Book rows carry two extra elements beyond price/size.
fn parse_book_rows(value: &serde_json::Value, name: &str) -> Result<Vec<PriceLevel>> {
    let array = value
        .as_array()
        .with_context(|| format!("field {name} is not an array"))?;
    let mut levels = Vec::with_capacity(array.len());
    for row in array {
        let cells = row
            .as_array()
            .with_context(|| format!("{name} row is not an array"))?;
        if cells.len() < 2 {
            anyhow::bail!("{name} row has fewer than two cells");
        }
        levels.push(PriceLevel(
            field_f64(&cells[0], name)?,
            field_f64(&cells[1], name)?,
        ));
    }
    Ok(levels)
}

/// `{"arg":{"channel":"books","instId":...},"action":"snapshot"|"update",
///   "data":[{"asks":[[...]],"bids":[[...]],"ts":"...","seqId":123,"checksum":-855196043}]}`
fn parse_books(
    root: &serde_json::Value,
    symbol: &str,
    received_at: i64,
) -> Result<Vec<MarketEvent>> {
    let data = root["data"].as_array().context("missing data array")?;
    let is_snapshot = root.get("action").and_then(|v| v.as_str()) == Some("snapshot")
        // books5 pushes full five-level views without an action field.
        || root["arg"]["channel"].as_str() == Some("books5");

    let mut events = Vec::with_capacity(data.len());
    for entry in data {
        let bids = parse_book_rows(&entry["bids"], "bids")?;
        let asks = parse_book_rows(&entry["asks"], "asks")?;
        let event_time = field_ms(&entry["ts"], "ts").unwrap_or(received_at);
        let update_id = entry["seqId"].as_u64();
        let checksum = entry["checksum"]
            .as_i64()
            .map(|c| c.to_string());

        events.push(MarketEvent::Depth(DepthDelta {
            exchange: "okx".into(),
            symbol: symbol.to_string(),
            bids,
            asks,
            event_time,
            received_at,
            update_id,
            first_update_id: None,
            is_snapshot,
            checksum,
        }));
    }
    Ok(events)
}

/// Candle rows: `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`.
fn parse_candles(
    root: &serde_json::Value,
    symbol: &str,
    timeframe: &str,
    received_at: i64,
) -> Result<Vec<MarketEvent>> {
    let data = root["data"].as_array().context("missing data array")?;
    let duration_ms = crate::candles::TIMEFRAMES
        .iter()
        .find(|(tf, _)| *tf == timeframe)
        .map(|(_, d)| *d)
        .unwrap_or(60_000);

    let mut events = Vec::with_capacity(data.len());
    for row in data {
        let cells = row.as_array().context("candle row is not an array")?;
        if cells.len() < 6 {
            anyhow::bail!("candle row has fewer than six cells");
        }
        let open_time = field_ms(&cells[0], "ts")?;
        let open = field_f64(&cells[1], "o")?;
        let high = field_f64(&cells[2], "h")?;
        let low = field_f64(&cells[3], "l")?;
        let close = field_f64(&cells[4], "c")?;
        let volume = field_f64(&cells[5], "vol")?;
        let quote_volume = cells
            .get(7)
            .map(|c| field_f64(c, "volCcyQuote"))
            .transpose()?
            .unwrap_or(0.0);
        let is_complete = cells
            .get(8)
            .and_then(|c| c.as_str())
            .map(|c| c == "1")
            .unwrap_or(false);

        let vwap = if volume > 0.0 { quote_volume / volume } else { 0.0 };

        events.push(MarketEvent::Candle(Candle {
            exchange: "okx".into(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            open_time,
            close_time: open_time + duration_ms - 1,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
            trade_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            vwap,
            is_complete,
            received_at,
        }));
    }
    Ok(events)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trades_channel_with_string_timestamps() {
        let frame = r#"{"arg":{"channel":"trades","instId":"SOL-USDT-SWAP"},"data":[
            {"instId":"SOL-USDT-SWAP","tradeId":"9001","px":"42.10","sz":"3.0","side":"buy","ts":"1700000000499"}]}"#;
        let events = parse("solusdt", frame, 1_700_000_000_500).unwrap();
        match &events[0] {
            MarketEvent::Trade(t) => {
                assert_eq!(t.exchange, "okx");
                assert_eq!(t.symbol, "solusdt");
                assert_eq!(t.event_time, 1_700_000_000_499);
                assert_eq!(t.side, Side::Buy);
                assert_eq!(t.trade_id.as_deref(), Some("9001"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn books_snapshot_then_update() {
        let snap = r#"{"arg":{"channel":"books","instId":"SOL-USDT-SWAP"},"action":"snapshot",
            "data":[{"asks":[["42.1","3","0","2"]],"bids":[["42.0","5","0","4"]],
                     "ts":"1700000000000","seqId":100,"checksum":-855196043}]}"#;
        let events = parse("solusdt", snap, 1).unwrap();
        match &events[0] {
            MarketEvent::Depth(d) => {
                assert!(d.is_snapshot);
                assert_eq!(d.update_id, Some(100));
                assert_eq!(d.checksum.as_deref(), Some("-855196043"));
                assert_eq!(d.bids[0].price(), 42.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let update = r#"{"arg":{"channel":"books","instId":"SOL-USDT-SWAP"},"action":"update",
            "data":[{"asks":[],"bids":[["42.0","0","0","0"]],"ts":"1700000000100","seqId":101}]}"#;
        let events = parse("solusdt", update, 2).unwrap();
        match &events[0] {
            MarketEvent::Depth(d) => {
                assert!(!d.is_snapshot);
                assert_eq!(d.update_id, Some(101));
                assert_eq!(d.bids[0].size(), 0.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn candle_channel_maps_timeframe() {
        let frame = r#"{"arg":{"channel":"candle1m","instId":"SOL-USDT-SWAP"},"data":[
            ["1700000040000","42.0","42.5","41.9","42.3","5","210","211.2","1"]]}"#;
        let events = parse("solusdt", frame, 3).unwrap();
        match &events[0] {
            MarketEvent::Candle(c) => {
                assert_eq!(c.timeframe, "1m");
                assert_eq!(c.open_time, 1_700_000_040_000);
                assert_eq!(c.close_time, 1_700_000_099_999);
                assert!(c.is_complete);
                assert!((c.vwap - 211.2 / 5.0).abs() < 1e-9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn subscribe_ack_is_control() {
        let ack = r#"{"event":"subscribe","arg":{"channel":"trades","instId":"SOL-USDT-SWAP"},"connId":"abc"}"#;
        assert!(parse("solusdt", ack, 1).unwrap().is_empty());
    }

    #[test]
    fn unknown_channel_is_unclassified() {
        let frame = r#"{"arg":{"channel":"open-interest","instId":"SOL-USDT-SWAP"},"data":[]}"#;
        assert!(matches!(
            parse("solusdt", frame, 1),
            Err(NormalizeError::Unclassified)
        ));
    }
}
