//! Shared market-data types for the trading engine.
//!
//! - **Point**: an immutable limit-order intent (size, limit price, cancel
//!   threshold) whose side is derived from the price/cancel ordering
//! - **Side**: buy or sell
//! - **Ticker**: the latest traded price for a product, delivered as a stream

mod point;
mod ticker;

pub use point::{Point, PointError, Side};
pub use ticker::Ticker;
