// =============================================================================
// Binance frame parser
// =============================================================================
//
// Accepts both combined-stream envelopes (`{"stream":..., "data":...}`) and
// raw single-stream payloads. Classified by the `e` event-type field:
// aggTrade/trade, depthUpdate, kline, forceOrder. Partial-depth payloads
// carry no event type and are recognized by their `lastUpdateId` shape;
// they act as snapshots and take the session's symbol hint.
// =============================================================================

use anyhow::{Context, Result};

use crate::symbols;
use crate::types::{Candle, DepthDelta, Liquidation, MarketEvent, Side, Trade};

use super::{field_f64, field_ms, parse_json_frame, parse_levels, NormalizeError};

pub fn parse(
    symbol_hint: &str,
    raw: &str,
    received_at: i64,
) -> Result<Vec<MarketEvent>, NormalizeError> {
    let root = parse_json_frame(raw).map_err(|_| NormalizeError::Unclassified)?;

    // Combined-stream envelope or direct payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    match data.get("e").and_then(|v| v.as_str()) {
        Some("aggTrade") | Some("trade") => parse_trade(data, received_at)
            .map(|t| vec![MarketEvent::Trade(t)])
            .map_err(NormalizeError::Invalid),
        Some("depthUpdate") => parse_depth_update(data, received_at)
            .map(|d| vec![MarketEvent::Depth(d)])
            .map_err(NormalizeError::Invalid),
        Some("kline") => parse_kline(data, received_at)
            .map(|c| vec![MarketEvent::Candle(c)])
            .map_err(NormalizeError::Invalid),
        Some("forceOrder") => parse_force_order(data, received_at)
            .map(|l| vec![MarketEvent::Liquidation(l)])
            .map_err(NormalizeError::Invalid),
        Some(_) => Err(NormalizeError::Unclassified),
        None => {
            // Partial-depth snapshots have no event type.
            if data.get("lastUpdateId").is_some()
                && data.get("bids").is_some()
                && data.get("asks").is_some()
            {
                parse_partial_depth(symbol_hint, data, received_at)
                    .map(|d| vec![MarketEvent::Depth(d)])
                    .map_err(NormalizeError::Invalid)
            } else {
                Err(NormalizeError::Unclassified)
            }
        }
    }
}

/// `{"e":"aggTrade","s":"SOLUSDT","p":"42.10","q":"3.0","m":false,"T":...,"t":123}`
///
/// `m == true` means the buyer was the maker, so the aggressor sold.
fn parse_trade(data: &serde_json::Value, received_at: i64) -> Result<Trade> {
    let symbol = symbols::normalize(data["s"].as_str().context("missing field s")?);
    let price = field_f64(&data["p"], "p")?;
    let quantity = field_f64(&data["q"], "q")?;
    let is_buyer_maker = data["m"].as_bool().context("missing field m")?;

    // Trade time T preferred; event time E as fallback.
    let event_time = field_ms(&data["T"], "T")
        .or_else(|_| field_ms(&data["E"], "E"))
        .unwrap_or(received_at);

    let trade_id = match &data["t"] {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => match &data["a"] {
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        },
    };

    Ok(Trade {
        exchange: "binance".into(),
        symbol,
        price,
        quantity,
        side: if is_buyer_maker { Side::Sell } else { Side::Buy },
        event_time,
        received_at,
        trade_id,
        is_buyer_maker: Some(is_buyer_maker),
    })
}

/// `{"e":"depthUpdate","s":...,"U":first,"u":last,"b":[[p,q]],"a":[[p,q]]}`
fn parse_depth_update(data: &serde_json::Value, received_at: i64) -> Result<DepthDelta> {
    let symbol = symbols::normalize(data["s"].as_str().context("missing field s")?);
    let first_update_id = data["U"].as_u64();
    let update_id = data["u"].as_u64().context("missing field u")?;
    let bids = parse_levels(&data["b"], "b")?;
    let asks = parse_levels(&data["a"], "a")?;
    let event_time = field_ms(&data["E"], "E").unwrap_or(received_at);

    Ok(DepthDelta {
        exchange: "binance".into(),
        symbol,
        bids,
        asks,
        event_time,
        received_at,
        update_id: Some(update_id),
        first_update_id,
        is_snapshot: false,
        checksum: None,
    })
}

/// REST-style partial depth: `{"lastUpdateId":..., "bids":[...], "asks":[...]}`.
/// No symbol in the payload; the session's hint applies.
fn parse_partial_depth(
    symbol_hint: &str,
    data: &serde_json::Value,
    received_at: i64,
) -> Result<DepthDelta> {
    let update_id = data["lastUpdateId"]
        .as_u64()
        .context("missing field lastUpdateId")?;
    let bids = parse_levels(&data["bids"], "bids")?;
    let asks = parse_levels(&data["asks"], "asks")?;

    Ok(DepthDelta {
        exchange: "binance".into(),
        symbol: symbol_hint.to_string(),
        bids,
        asks,
        event_time: received_at,
        received_at,
        update_id: Some(update_id),
        first_update_id: None,
        is_snapshot: true,
        checksum: None,
    })
}

/// `{"e":"kline","s":...,"k":{...}}`
fn parse_kline(data: &serde_json::Value, received_at: i64) -> Result<Candle> {
    let symbol = symbols::normalize(data["s"].as_str().context("missing field s")?);
    let k = &data["k"];

    let timeframe = k["i"].as_str().context("missing field k.i")?.to_string();
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;

    let open = field_f64(&k["o"], "k.o")?;
    let high = field_f64(&k["h"], "k.h")?;
    let low = field_f64(&k["l"], "k.l")?;
    let close = field_f64(&k["c"], "k.c")?;
    let volume = field_f64(&k["v"], "k.v")?;
    let quote_volume = field_f64(&k["q"], "k.q")?;
    let taker_buy_volume = field_f64(&k["V"], "k.V")?;
    let taker_buy_quote_volume = field_f64(&k["Q"], "k.Q")?;
    let trade_count = k["n"].as_u64().context("missing field k.n")?;
    let is_complete = k["x"].as_bool().context("missing field k.x")?;

    let vwap = if volume > 0.0 { quote_volume / volume } else { 0.0 };

    Ok(Candle {
        exchange: "binance".into(),
        symbol,
        timeframe,
        open_time,
        close_time,
        open,
        high,
        low,
        close,
        volume,
        quote_volume,
        trade_count,
        taker_buy_volume,
        taker_buy_quote_volume,
        vwap,
        is_complete,
        received_at,
    })
}

/// `{"e":"forceOrder","o":{"s":...,"S":"SELL","p":...,"q":...,"T":...}}`
fn parse_force_order(data: &serde_json::Value, received_at: i64) -> Result<Liquidation> {
    let order = &data["o"];
    let symbol = symbols::normalize(order["s"].as_str().context("missing field o.s")?);
    let side = match order["S"].as_str().context("missing field o.S")? {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => Side::Unknown,
    };
    // Average fill price preferred over the order's limit price.
    let price = field_f64(&order["ap"], "o.ap").or_else(|_| field_f64(&order["p"], "o.p"))?;
    let quantity = field_f64(&order["q"], "o.q")?;
    let event_time = field_ms(&order["T"], "o.T").unwrap_or(received_at);

    Ok(Liquidation {
        exchange: "binance".into(),
        symbol,
        side,
        price,
        quantity,
        value: price * quantity,
        event_time,
        received_at: received_at.max(event_time),
    })
}

// =============================================================================
// Tests
// =============================================================================
