// =============================================================================
// Bybit v5 frame parser
// =============================================================================
//
// Data frames carry a dot-delimited `topic` (`publicTrade.SOLUSDT`,
// `orderbook.50.SOLUSDT`, `kline.1.SOLUSDT`, `liquidation.SOLUSDT`) and a
// `ts` envelope timestamp. Orderbook frames are explicit about snapshot vs
// delta via the `type` field. Subscription acks and pongs carry `op` /
// `success` and are treated as control frames.
// =============================================================================

use anyhow::{Context, Result};

use crate::symbols;
use crate::types::{Candle, DepthDelta, Liquidation, MarketEvent, Side, Trade};

use super::{field_f64, field_ms, parse_json_frame, parse_levels, NormalizeError};

pub fn parse(
    _symbol_hint: &str,
    raw: &str,
    received_at: i64,
) -> Result<Vec<MarketEvent>, NormalizeError> {
    let root = parse_json_frame(raw).map_err(|_| NormalizeError::Unclassified)?;

    // Control frames (subscribe acks, pong responses) produce no events.
    if root.get("op").is_some() || root.get("success").is_some() {
        return Ok(Vec::new());
    }

    let topic = match root.get("topic").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => return Err(NormalizeError::Unclassified),
    };
    let envelope_ts = field_ms(&root["ts"], "ts").unwrap_or(received_at);

    let mut parts = topic.split('.');
    match parts.next() {
        Some("publicTrade") => parse_trades(&root, envelope_ts, received_at)
            .map_err(NormalizeError::Invalid),
        Some("orderbook") => parse_orderbook(&root, envelope_ts, received_at)
            .map_err(NormalizeError::Invalid),
        Some("kline") => {
            let symbol = parts.nth(1).unwrap_or_default();
            parse_klines(&root, symbol, received_at).map_err(NormalizeError::Invalid)
        }
        Some("liquidation") => {
            parse_liquidation(&root, envelope_ts, received_at).map_err(NormalizeError::Invalid)
        }
        _ => Err(NormalizeError::Unclassified),
    }
}

/// `{"topic":"publicTrade.SOLUSDT","ts":...,"data":[{"T":...,"s":"SOLUSDT",
///   "S":"Buy","v":"3.0","p":"42.10","i":"..."}]}`
fn parse_trades(
    root: &serde_json::Value,
    envelope_ts: i64,
    received_at: i64,
) -> Result<Vec<MarketEvent>> {
    let data = root["data"].as_array().context("missing data array")?;
    let mut events = Vec::with_capacity(data.len());

    for entry in data {
        let symbol = symbols::normalize(entry["s"].as_str().context("missing field s")?);
        let side = match entry["S"].as_str().context("missing field S")? {
            "Buy" => Side::Buy,
            "Sell" => Side::Sell,
            other => anyhow::bail!("unexpected trade side {other}"),
        };
        let price = field_f64(&entry["p"], "p")?;
        let quantity = field_f64(&entry["v"], "v")?;
        let event_time = field_ms(&entry["T"], "T").unwrap_or(envelope_ts);
        let trade_id = entry["i"].as_str().map(str::to_string);

        events.push(MarketEvent::Trade(Trade {
            exchange: "bybit".into(),
            symbol,
            price,
            quantity,
            side,
            event_time,
            received_at,
            trade_id,
            // Aggressor side is explicit; the maker flag follows from it.
            is_buyer_maker: Some(side == Side::Sell),
        }));
    }
    Ok(events)
}

/// `{"topic":"orderbook.50.SOLUSDT","type":"snapshot"|"delta","ts":...,
///   "data":{"s":"SOLUSDT","b":[[p,s]],"a":[[p,s]],"u":...,"seq":...}}`
fn parse_orderbook(
    root: &serde_json::Value,
    envelope_ts: i64,
    received_at: i64,
) -> Result<Vec<MarketEvent>> {
    let data = &root["data"];
    let symbol = symbols::normalize(data["s"].as_str().context("missing field data.s")?);
    let update_id = data["u"].as_u64().context("missing field data.u")?;
    let bids = parse_levels(&data["b"], "data.b")?;
    let asks = parse_levels(&data["a"], "data.a")?;

    // Bybit restarts the sequence with u == 1 on service recovery; that
    // frame is a snapshot regardless of the type field.
    let is_snapshot =
        root.get("type").and_then(|v| v.as_str()) == Some("snapshot") || update_id == 1;

    Ok(vec![MarketEvent::Depth(DepthDelta {
        exchange: "bybit".into(),
        symbol,
        bids,
        asks,
        event_time: envelope_ts,
        received_at,
        update_id: Some(update_id),
        first_update_id: None,
        is_snapshot,
        checksum: None,
    })])
}

/// Map Bybit kline interval codes (minutes or D/W) to canonical timeframes.
fn map_interval(code: &str) -> String {
    match code {
        "1" => "1m".into(),
        "3" => "3m".into(),
        "5" => "5m".into(),
        "15" => "15m".into(),
        "30" => "30m".into(),
        "60" => "1h".into(),
        "120" => "2h".into(),
        "240" => "4h".into(),
        "360" => "6h".into(),
        "720" => "12h".into(),
        "D" => "1d".into(),
        other => other.to_lowercase(),
    }
}

/// `{"topic":"kline.1.SOLUSDT","data":[{"start":...,"end":...,"interval":"1",
///   "open":"...","high":"...","low":"...","close":"...","volume":"...",
///   "turnover":"...","confirm":false,"timestamp":...}]}`
fn parse_klines(
    root: &serde_json::Value,
    native_symbol: &str,
    received_at: i64,
) -> Result<Vec<MarketEvent>> {
    let data = root["data"].as_array().context("missing data array")?;
    let symbol = symbols::normalize(native_symbol);
    let mut events = Vec::with_capacity(data.len());

    for entry in data {
        let timeframe = map_interval(entry["interval"].as_str().context("missing interval")?);
        let open_time = entry["start"].as_i64().context("missing start")?;
        // Bybit's `end` is the next bucket's open.
        let close_time = entry["end"].as_i64().context("missing end")? - 1;
        let open = field_f64(&entry["open"], "open")?;
        let high = field_f64(&entry["high"], "high")?;
        let low = field_f64(&entry["low"], "low")?;
        let close = field_f64(&entry["close"], "close")?;
        let volume = field_f64(&entry["volume"], "volume")?;
        let quote_volume = field_f64(&entry["turnover"], "turnover")?;
        let is_complete = entry["confirm"].as_bool().unwrap_or(false);

        let vwap = if volume > 0.0 { quote_volume / volume } else { 0.0 };

        events.push(MarketEvent::Candle(Candle {
            exchange: "bybit".into(),
            symbol: symbol.clone(),
            timeframe,
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
            // Bybit klines do not break out trade counts or taker flow.
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

/// `{"topic":"liquidation.SOLUSDT","data":{"updatedTime":...,"symbol":...,
///   "side":"Buy","size":"120","price":"41.75"}}`
///
/// Bybit reports the side of the liquidation *order*; a Buy order closes a
/// short position.
fn parse_liquidation(
    root: &serde_json::Value,
    envelope_ts: i64,
    received_at: i64,
) -> Result<Vec<MarketEvent>> {
    let data = &root["data"];
    let symbol = symbols::normalize(data["symbol"].as_str().context("missing symbol")?);
    let side = match data["side"].as_str().context("missing side")? {
        "Buy" => Side::Buy,
        "Sell" => Side::Sell,
        _ => Side::Unknown,
    };
    let price = field_f64(&data["price"], "price")?;
    let quantity = field_f64(&data["size"], "size")?;
    let event_time = field_ms(&data["updatedTime"], "updatedTime").unwrap_or(envelope_ts);

    Ok(vec![MarketEvent::Liquidation(Liquidation {
        exchange: "bybit".into(),
        symbol,
        side,
        price,
        quantity,
        value: price * quantity,
        event_time,
        received_at,
    })])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_trade_lowercases_side() {
        let frame = r#"{"topic":"publicTrade.SOLUSDT","ts":1700000000500,"data":[
            {"T":1700000000499,"s":"SOLUSDT","S":"Buy","v":"3.0","p":"42.10","i":"abc-1"},
            {"T":1700000000500,"s":"SOLUSDT","S":"Sell","v":"1.0","p":"42.09","i":"abc-2"}
        ]}"#;
        let events = parse("solusdt", frame, 1_700_000_000_501).unwrap();
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (MarketEvent::Trade(buy), MarketEvent::Trade(sell)) => {
                assert_eq!(buy.side, Side::Buy);
                assert_eq!(buy.symbol, "solusdt");
                assert_eq!(buy.trade_id.as_deref(), Some("abc-1"));
                assert_eq!(sell.side, Side::Sell);
                assert_eq!(sell.is_buyer_maker, Some(true));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn orderbook_snapshot_and_delta() {
        let snap = r#"{"topic":"orderbook.50.SOLUSDT","type":"snapshot","ts":10,
            "data":{"s":"SOLUSDT","b":[["42.0","5"]],"a":[["42.1","3"]],"u":1,"seq":100}}"#;
        let events = parse("solusdt", snap, 11).unwrap();
        match &events[0] {
            MarketEvent::Depth(d) => {
                assert!(d.is_snapshot);
                assert_eq!(d.update_id, Some(1));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let delta = r#"{"topic":"orderbook.50.SOLUSDT","type":"delta","ts":12,
            "data":{"s":"SOLUSDT","b":[["42.0","0"]],"a":[],"u":2,"seq":101}}"#;
        let events = parse("solusdt", delta, 13).unwrap();
        match &events[0] {
            MarketEvent::Depth(d) => {
                assert!(!d.is_snapshot);
                assert_eq!(d.update_id, Some(2));
                assert_eq!(d.bids[0].size(), 0.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn kline_interval_mapping() {
        assert_eq!(map_interval("1"), "1m");
        assert_eq!(map_interval("60"), "1h");
        assert_eq!(map_interval("720"), "12h");
        assert_eq!(map_interval("D"), "1d");

        let frame = r#"{"topic":"kline.1.SOLUSDT","ts":5,"data":[{
            "start":1700000040000,"end":1700000100000,"interval":"1",
            "open":"42.0","high":"42.5","low":"41.9","close":"42.3",
            "volume":"5","turnover":"211.2","confirm":true,"timestamp":1700000099000}]}"#;
        let events = parse("solusdt", frame, 6).unwrap();
        match &events[0] {
            MarketEvent::Candle(c) => {
                assert_eq!(c.timeframe, "1m");
                assert_eq!(c.open_time, 1_700_000_040_000);
                assert_eq!(c.close_time, 1_700_000_099_999);
                assert!(c.is_complete);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn liquidation_topic_parses() {
        let frame = r#"{"topic":"liquidation.SOLUSDT","ts":7,"data":{
            "updatedTime":1700000000000,"symbol":"SOLUSDT","side":"Buy","size":"120","price":"41.75"}}"#;
        let events = parse("solusdt", frame, 8).unwrap();
        match &events[0] {
            MarketEvent::Liquidation(l) => {
                assert_eq!(l.side, Side::Buy);
                assert!((l.value - 41.75 * 120.0).abs() < 1e-6);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn control_frames_produce_no_events() {
        let ack = r#"{"success":true,"ret_msg":"","op":"subscribe","conn_id":"x"}"#;
        assert!(parse("solusdt", ack, 1).unwrap().is_empty());

        let pong = r#"{"op":"pong","args":["1700000000000"]}"#;
        assert!(parse("solusdt", pong, 1).unwrap().is_empty());
    }

    #[test]
    fn unknown_topic_is_unclassified() {
        let frame = r#"{"topic":"tickers.SOLUSDT","ts":1,"data":{}}"#;
        assert!(matches!(
            parse("solusdt", frame, 1),
            Err(NormalizeError::Unclassified)
        ));
    }
}
