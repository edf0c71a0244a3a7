// =============================================================================
// Normalized broker events
// =============================================================================
//
// The gateway delivers loosely-typed JSON frames. Everything the daemon
// consumes is normalized here into explicit per-kind payloads; unknown fields
// are logged at debug level and dropped, unknown event types are skipped.
// The broker's delivery order is authoritative: events are never reordered by
// timestamp.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::contract::display_symbol;

// ---------------------------------------------------------------------------
// Sides and position direction
// ---------------------------------------------------------------------------

/// Order side as sent by the gateway: 0 = buy, 1 = sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_wire(raw: i64) -> Result<Self> {
        match raw {
            0 => Ok(Self::Buy),
            1 => Ok(Self::Sell),
            other => bail!("unknown order side {other}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Direction of an open lot: 1 = long, 2 = short on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionType {
    Long,
    Short,
}

impl PositionType {
    pub fn from_wire(raw: i64) -> Result<Self> {
        match raw {
            1 => Ok(Self::Long),
            2 => Ok(Self::Short),
            other => bail!("unknown position type {other}"),
        }
    }

    /// Direction a fill on `side` opens.
    pub fn from_side(side: Side) -> Self {
        match side {
            Side::Buy => Self::Long,
            Side::Sell => Self::Short,
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrderFill {
    pub contract_id: String,
    /// Instrument id such as `F.US.MNQ`; may be empty on some frames.
    pub symbol_id: String,
    pub side: Side,
    pub size: u32,
    pub filled_price: f64,
}

impl OrderFill {
    /// Display symbol, preferring the instrument id over the contract id.
    pub fn symbol(&self) -> &str {
        match self.symbol_id.rsplit('.').next() {
            Some(s) if !s.is_empty() => s,
            _ => display_symbol(&self.contract_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub contract_id: String,
    /// Signed net size; 0 indicates the position is gone.
    pub size: i64,
    pub average_price: f64,
    pub position_type: PositionType,
    pub pnl: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub contract_id: String,
    /// Realized P&L as reported by the gateway; 0.0 when omitted.
    pub pnl: f64,
    /// Close price when the gateway includes one.
    pub close_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PnlUpdate {
    pub contract_id: Option<String>,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    OrderFilled(OrderFill),
    PositionUpdated(PositionUpdate),
    PositionClosed(ClosedPosition),
    PositionPnlUpdate(PnlUpdate),
    /// Ingested for liveness only; filtered out before audit and rules.
    QuoteUpdate,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn now(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn at(timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self { timestamp, payload }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::OrderFilled(_) => "order_filled",
            EventPayload::PositionUpdated(_) => "position_updated",
            EventPayload::PositionClosed(_) => "position_closed",
            EventPayload::PositionPnlUpdate(_) => "position_pnl_update",
            EventPayload::QuoteUpdate => "quote_update",
        }
    }
}

// ---------------------------------------------------------------------------
// Wire parsing
// ---------------------------------------------------------------------------

/// Parse one gateway frame payload into a normalized event.
///
/// Returns `Ok(None)` for event types the daemon does not consume. Missing
/// required fields are an error; the transport logs and skips the frame.
pub fn parse_wire(event_type: &str, data: &Value, timestamp: DateTime<Utc>) -> Result<Option<Event>> {
    let payload = match event_type {
        "order_filled" => {
            let order = data
                .get("order")
                .filter(|v| v.is_object())
                .context("order_filled frame missing 'order'")?;
            note_unknown_fields(
                event_type,
                order,
                &["contractId", "symbolId", "side", "size", "filledPrice"],
            );
            EventPayload::OrderFilled(OrderFill {
                contract_id: required_str(order, "contractId")?,
                symbol_id: order
                    .get("symbolId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                side: Side::from_wire(order.get("side").and_then(Value::as_i64).unwrap_or(0))?,
                size: order.get("size").and_then(Value::as_u64).unwrap_or(0) as u32,
                filled_price: order
                    .get("filledPrice")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
            })
        }
        "position_updated" => {
            note_unknown_fields(
                event_type,
                data,
                &["contractId", "size", "averagePrice", "type", "pnl", "timestamp"],
            );
            EventPayload::PositionUpdated(PositionUpdate {
                contract_id: required_str(data, "contractId")?,
                size: data.get("size").and_then(Value::as_i64).unwrap_or(0),
                average_price: data
                    .get("averagePrice")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                position_type: PositionType::from_wire(
                    data.get("type").and_then(Value::as_i64).unwrap_or(1),
                )?,
                pnl: data.get("pnl").and_then(Value::as_f64),
            })
        }
        "position_closed" => {
            note_unknown_fields(
                event_type,
                data,
                &["contractId", "pnl", "averagePrice", "timestamp"],
            );
            EventPayload::PositionClosed(ClosedPosition {
                contract_id: required_str(data, "contractId")?,
                pnl: data.get("pnl").and_then(Value::as_f64).unwrap_or(0.0),
                close_price: data
                    .get("averagePrice")
                    .and_then(Value::as_f64)
                    .filter(|p| *p > 0.0),
            })
        }
        "position_pnl_update" => {
            note_unknown_fields(event_type, data, &["contractId", "realized_pnl", "timestamp"]);
            EventPayload::PositionPnlUpdate(PnlUpdate {
                contract_id: data
                    .get("contractId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                realized_pnl: data
                    .get("realized_pnl")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
            })
        }
        "quote_update" => EventPayload::QuoteUpdate,
        other => {
            debug!(event_type = other, "skipping unhandled event type");
            return Ok(None);
        }
    };

    Ok(Some(Event::at(timestamp, payload)))
}

fn required_str(data: &Value, key: &str) -> Result<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("frame missing '{key}'"))
}

fn note_unknown_fields(event_type: &str, data: &Value, known: &[&str]) {
    if let Some(map) = data.as_object() {
        for key in map.keys() {
            if !known.contains(&key.as_str()) {
                debug!(event_type, field = %key, "ignoring unknown event field");
            }
        }
    }
}
