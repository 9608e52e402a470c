//! Paper-trading exchange.
//!
//! `SimExchange` implements the [`Exchange`]/[`Product`] traits against an
//! in-process book: limit orders rest until a published ticker crosses their
//! price, then fill completely at the limit price. Used by the runner binary
//! and by tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use model::{Side, Ticker};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::debug;

use crate::order::{Order, OrderId, OrderStatus};
use crate::product::{Exchange, ExchangeError, Product};

const CHANNEL_CAPACITY: usize = 1024;

struct SimOrder {
    order: Order,
    price: Decimal,
    size: Decimal,
}

#[derive(Default)]
struct SimBook {
    orders: HashMap<OrderId, SimOrder>,
    by_client_id: HashMap<String, OrderId>,
    next_seq: u64,
}

/// A simulated product with an order book of resting limit orders.
pub struct SimProduct {
    product_id: String,
    base_min_size: Decimal,
    // Fee charged on fills, as a fraction of notional.
    fee_rate: Decimal,
    ticker_tx: broadcast::Sender<Ticker>,
    update_tx: broadcast::Sender<Order>,
    book: Mutex<SimBook>,
}

impl SimProduct {
    pub fn new(product_id: impl Into<String>, base_min_size: Decimal, fee_rate: Decimal) -> Self {
        let (ticker_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (update_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            product_id: product_id.into(),
            base_min_size,
            fee_rate,
            ticker_tx,
            update_tx,
            book: Mutex::new(SimBook::default()),
        }
    }

    /// Publish a ticker and fill any orders it crosses.
    ///
    /// A buy fills when the price trades at or below its limit; a sell fills
    /// when the price trades at or above it. Fills are complete and at the
    /// limit price. Order updates are published before the ticker so
    /// subscribers observe fills no later than the price that caused them.
    pub fn publish_ticker(&self, ticker: Ticker) {
        let mut filled = Vec::new();
        {
            let mut book = self.book.lock();
            for sim in book.orders.values_mut() {
                if sim.order.done {
                    continue;
                }
                let crossed = match sim.order.side {
                    Side::Buy => ticker.price <= sim.price,
                    Side::Sell => ticker.price >= sim.price,
                };
                if !crossed {
                    continue;
                }
                sim.order.filled_size = sim.size;
                sim.order.filled_price = sim.price;
                sim.order.fee = sim.size * sim.price * self.fee_rate;
                sim.order.status = OrderStatus::Filled;
                sim.order.done = true;
                sim.order.done_reason = "FILLED".to_string();
                sim.order.finish_time = Some(ticker.time);
                filled.push(sim.order.clone());
            }
        }
        for order in filled {
            debug!(product_id = %self.product_id, order_id = %order.order_id, "sim fill");
            let _ = self.update_tx.send(order);
        }
        let _ = self.ticker_tx.send(ticker);
    }

    fn place(
        &self,
        side: Side,
        client_order_id: &str,
        size: Decimal,
        price: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        if size < self.base_min_size {
            return Err(ExchangeError::Rejected(format!(
                "size {} below product minimum {}",
                size, self.base_min_size
            )));
        }

        let mut book = self.book.lock();
        // Client order ids are idempotency keys: a resubmission returns the
        // original order id instead of creating a second order.
        if let Some(id) = book.by_client_id.get(client_order_id) {
            return Ok(id.clone());
        }

        book.next_seq += 1;
        let order_id = OrderId::new(format!("{}-{:08}", self.product_id, book.next_seq));
        let mut order = Order::submitted(order_id.clone(), client_order_id, side);
        order.status = OrderStatus::Open;
        order.create_time = Some(Utc::now());

        book.by_client_id
            .insert(client_order_id.to_string(), order_id.clone());
        book.orders.insert(
            order_id.clone(),
            SimOrder {
                order,
                price,
                size,
            },
        );
        Ok(order_id)
    }

    fn lookup(&self, order_id: &OrderId) -> Result<Order, ExchangeError> {
        let book = self.book.lock();
        book.orders
            .get(order_id)
            .map(|sim| sim.order.clone())
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.clone()))
    }
}

#[async_trait]
impl Product for SimProduct {
    fn product_id(&self) -> &str {
        &self.product_id
    }

    fn base_min_size(&self) -> Decimal {
        self.base_min_size
    }

    fn tickers(&self) -> broadcast::Receiver<Ticker> {
        self.ticker_tx.subscribe()
    }

    fn order_updates(&self) -> broadcast::Receiver<Order> {
        self.update_tx.subscribe()
    }

    async fn limit_buy(
        &self,
        client_order_id: &str,
        size: Decimal,
        price: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.place(Side::Buy, client_order_id, size, price)
    }

    async fn limit_sell(
        &self,
        client_order_id: &str,
        size: Decimal,
        price: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.place(Side::Sell, client_order_id, size, price)
    }

    async fn cancel(&self, order_id: &OrderId) -> Result<(), ExchangeError> {
        let update = {
            let mut book = self.book.lock();
            let sim = book
                .orders
                .get_mut(order_id)
                .ok_or_else(|| ExchangeError::OrderNotFound(order_id.clone()))?;
            if sim.order.done {
                // Canceling a finished order is a no-op.
                None
            } else {
                sim.order.status = OrderStatus::Canceled;
                sim.order.done = true;
                sim.order.done_reason = "CANCELED".to_string();
                sim.order.finish_time = Some(Utc::now());
                Some(sim.order.clone())
            }
        };
        if let Some(order) = update {
            let _ = self.update_tx.send(order);
        }
        Ok(())
    }

    async fn get(&self, order_id: &OrderId) -> Result<Order, ExchangeError> {
        self.lookup(order_id)
    }
}

/// A simulated exchange hosting [`SimProduct`]s.
pub struct SimExchange {
    name: String,
    products: RwLock<HashMap<String, Arc<SimProduct>>>,
}

impl SimExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            products: RwLock::new(HashMap::new()),
        }
    }

    /// Register a product with this exchange.
    pub fn add_product(&self, product: Arc<SimProduct>) {
        self.products
            .write()
            .insert(product.product_id().to_string(), product);
    }

    /// Fetch a registered product handle.
    pub fn product(&self, product_id: &str) -> Option<Arc<SimProduct>> {
        self.products.read().get(product_id).cloned()
    }
}

#[async_trait]
impl Exchange for SimExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_order(&self, order_id: &OrderId) -> Result<Order, ExchangeError> {
        let products: Vec<Arc<SimProduct>> = self.products.read().values().cloned().collect();
        for product in products {
            match product.lookup(order_id) {
                Ok(order) => return Ok(order),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ExchangeError::OrderNotFound(order_id.clone()))
    }

    async fn get_product(&self, product_id: &str) -> Result<Arc<dyn Product>, ExchangeError> {
        self.product(product_id)
            .map(|p| p as Arc<dyn Product>)
            .ok_or_else(|| ExchangeError::ProductNotFound(product_id.to_string()))
    }
}
