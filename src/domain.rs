// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RequestId = u32;
pub type OrderId = i64;

/// Canonical local symbol: trimmed + ASCII uppercase, normalized once at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: &str) -> Self { Self(raw.trim().to_ascii_uppercase()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for Symbol { fn from(s: &str) -> Self { Symbol::new(s) } }
impl From<String> for Symbol { fn from(s: String) -> Self { Symbol::new(&s) } }
impl From<Symbol> for String { fn from(s: Symbol) -> Self { s.0 } }
impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> i64 { match self { Side::Buy => 1, Side::Sell => -1 } }
    pub fn action(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }

    /// Side + unsigned size needed to move a position by `delta`; `None` when flat.
    pub fn for_delta(delta: i64) -> Option<(Side, u64)> {
        match delta.signum() {
            1 => Some((Side::Buy, delta.unsigned_abs())),
            -1 => Some((Side::Sell, delta.unsigned_abs())),
            _ => None,
        }
    }
}

/// What the gateway needs to address an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub local_symbol: Symbol,
    pub sec_type: String,
    pub currency: String,
    pub exchange: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlSnapshot { pub daily: f64, pub unrealized: f64, pub realized: f64 }
impl PnlSnapshot {
    pub fn current_profit(&self) -> f64 { self.unrealized + self.realized }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState { PendingSubmit, Submitted, Filled, Cancelled, Inactive, Other(String) }
impl OrderState {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "PendingSubmit" | "PreSubmitted" => OrderState::PendingSubmit,
            "Submitted" => OrderState::Submitted,
            "Filled" => OrderState::Filled,
            "Cancelled" | "ApiCancelled" => OrderState::Cancelled,
            "Inactive" => OrderState::Inactive,
            other => OrderState::Other(other.to_string()),
        }
    }
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled | OrderState::Inactive)
    }
    /// Metric label. Statuses we don't model share `other` to keep cardinality fixed.
    pub fn label(&self) -> &'static str {
        match self {
            OrderState::PendingSubmit => "pending_submit",
            OrderState::Submitted => "submitted",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Inactive => "inactive",
            OrderState::Other(_) => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    pub status: OrderState,
    pub filled: f64,
    pub remaining: f64,
    pub avg_fill_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick { pub req_id: RequestId, pub time: DateTime<Utc>, pub price: f64, pub size: i64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteTick {
    pub req_id: RequestId,
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: i64,
    pub ask_size: i64,
}

/// Everything the gateway can tell the session. Notifications the core has no
/// use for simply have no variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GatewayEvent {
    Ready { next_order_id: OrderId },
    Error { id: i64, code: i32, message: String },
    OrderStatus(OrderUpdate),
    Position { account: String, local_symbol: String, position: f64, avg_cost: f64 },
    PositionEnd,
    Pnl(PnlSnapshot),
    Trade(TradeTick),
    Quote(QuoteTick),
    ConnectionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    AwaitingConnection,
    RequestTradeData,
    RequestOrderData,
    RequestPnl,
    RequestPositions,
    CheckPositions,
    CheckPnl,
    Closeout,
    Unsubscribe,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::AwaitingConnection => "awaiting_connection",
            SessionState::RequestTradeData => "request_trade_data",
            SessionState::RequestOrderData => "request_order_data",
            SessionState::RequestPnl => "request_pnl",
            SessionState::RequestPositions => "request_positions",
            SessionState::CheckPositions => "check_positions",
            SessionState::CheckPnl => "check_pnl",
            SessionState::Closeout => "closeout",
            SessionState::Unsubscribe => "unsubscribe",
        }
    }
    // gauge value
    pub fn ordinal(&self) -> i64 { *self as i64 }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: u64,
}

// Journal entries (recorder)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Gateway(GatewayEvent),
    Order(OrderRecord),
    Transition { from: SessionState, to: SessionState },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped { pub ts: DateTime<Utc>, pub event: Event }
