//! Exchange-reported order types.

use std::fmt;

use chrono::{DateTime, Utc};
use model::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Order submitted, awaiting acknowledgment.
    New,
    /// Order resting on the book.
    Open,
    /// Order completely filled.
    Filled,
    /// Order canceled.
    Canceled,
    /// Order rejected by the exchange.
    Rejected,
    /// Order expired.
    Expired,
}

impl OrderStatus {
    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Open => "OPEN",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// An order as tracked against the exchange.
///
/// `filled_size` is monotonically non-decreasing for a single order and
/// `done = true` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-assigned order ID.
    pub order_id: OrderId,
    /// Caller-generated idempotency key.
    pub client_order_id: String,
    /// Buy or sell.
    pub side: Side,
    /// Current status.
    pub status: OrderStatus,
    /// Exchange-reported creation time (unknown until acknowledged).
    pub create_time: Option<DateTime<Utc>>,
    /// Exchange-reported completion time.
    pub finish_time: Option<DateTime<Utc>>,
    /// Cumulative filled size.
    pub filled_size: Decimal,
    /// Volume-weighted fill price.
    pub filled_price: Decimal,
    /// Cumulative fee charged.
    pub fee: Decimal,
    /// Whether the order reached a terminal state.
    pub done: bool,
    /// Reason reported for the terminal state (e.g. "FILLED", "CANCELED").
    pub done_reason: String,
}

impl Order {
    /// A just-submitted order for which only the identifiers are known yet.
    pub fn submitted(order_id: OrderId, client_order_id: impl Into<String>, side: Side) -> Self {
        Self {
            order_id,
            client_order_id: client_order_id.into(),
            side,
            status: OrderStatus::New,
            create_time: None,
            finish_time: None,
            filled_size: Decimal::ZERO,
            filled_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            done: false,
            done_reason: String::new(),
        }
    }
}
