//! Ticker events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The latest traded price for a product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker {
    /// Last traded price.
    pub price: Decimal,
    /// Exchange-reported time of the trade.
    pub time: DateTime<Utc>,
}

impl Ticker {
    pub fn new(price: Decimal, time: DateTime<Utc>) -> Self {
        Self { price, time }
    }
}
