//! Product and exchange traits consumed by the trading engine.

use std::sync::Arc;

use async_trait::async_trait;
use model::Ticker;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::order::{Order, OrderId};

/// Errors from exchange operations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No order with the given ID.
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    /// No product with the given ID.
    #[error("product {0:?} not found")]
    ProductNotFound(String),

    /// The exchange refused the order.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Transport-level failure; the operation may be retried.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ExchangeError {
    /// Returns true for the missing-order/product cases.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::OrderNotFound(_) | Self::ProductNotFound(_))
    }
}

/// A tradable product on an exchange.
///
/// Ticker and order-update streams are broadcast channels; every subscriber
/// receives its own receiver and sees events in source order.
#[async_trait]
pub trait Product: Send + Sync {
    /// Product identifier (e.g. "BCH-USD").
    fn product_id(&self) -> &str;

    /// Minimum order size in base units.
    fn base_min_size(&self) -> Decimal;

    /// Subscribe to ticker events.
    fn tickers(&self) -> broadcast::Receiver<Ticker>;

    /// Subscribe to order status updates.
    fn order_updates(&self) -> broadcast::Receiver<Order>;

    /// Place a limit buy. `client_order_id` is the idempotency key.
    async fn limit_buy(
        &self,
        client_order_id: &str,
        size: Decimal,
        price: Decimal,
    ) -> Result<OrderId, ExchangeError>;

    /// Place a limit sell. `client_order_id` is the idempotency key.
    async fn limit_sell(
        &self,
        client_order_id: &str,
        size: Decimal,
        price: Decimal,
    ) -> Result<OrderId, ExchangeError>;

    /// Cancel a live order.
    async fn cancel(&self, order_id: &OrderId) -> Result<(), ExchangeError>;

    /// Fetch the authoritative state of an order.
    async fn get(&self, order_id: &OrderId) -> Result<Order, ExchangeError>;
}

impl std::fmt::Debug for dyn Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Product")
            .field("product_id", &self.product_id())
            .finish()
    }
}

/// A spot exchange hosting products.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Exchange name (lowercase, e.g. "sim").
    fn name(&self) -> &str;

    /// Fetch an order by exchange order ID.
    async fn get_order(&self, order_id: &OrderId) -> Result<Order, ExchangeError>;

    /// Open a handle to a product.
    async fn get_product(&self, product_id: &str) -> Result<Arc<dyn Product>, ExchangeError>;
}
