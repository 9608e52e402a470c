//! Scripted mock product for engine tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use exchange_core::{ExchangeError, Order, OrderId, OrderStatus, Product};
use model::{Side, Ticker};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

/// Exchange calls observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    LimitBuy { size: Decimal, price: Decimal },
    LimitSell { size: Decimal, price: Decimal },
    Cancel(OrderId),
    Get(OrderId),
}

#[derive(Default)]
struct MockState {
    orders: HashMap<OrderId, Order>,
    next_seq: u64,
    fail_creates: u32,
    calls: Vec<MockCall>,
}

/// A product whose fills are driven explicitly by the test.
pub struct MockProduct {
    product_id: String,
    base_min_size: Decimal,
    ticker_tx: broadcast::Sender<Ticker>,
    update_tx: broadcast::Sender<Order>,
    state: Mutex<MockState>,
}

impl MockProduct {
    pub fn new(product_id: &str, base_min_size: Decimal) -> Arc<Self> {
        let (ticker_tx, _) = broadcast::channel(256);
        let (update_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            product_id: product_id.to_string(),
            base_min_size,
            ticker_tx,
            update_tx,
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn send_ticker(&self, price: Decimal) {
        let _ = self.ticker_tx.send(Ticker::new(price, Utc::now()));
    }

    /// Apply a (cumulative) fill to an order and broadcast the update.
    pub fn fill(&self, order_id: &OrderId, filled_size: Decimal, filled_price: Decimal, done: bool) {
        let update = {
            let mut state = self.state.lock();
            let order = state.orders.get_mut(order_id).expect("unknown mock order");
            order.filled_size = filled_size;
            order.filled_price = filled_price;
            if done {
                order.status = OrderStatus::Filled;
                order.done = true;
                order.done_reason = "FILLED".to_string();
                order.finish_time = Some(Utc::now());
            }
            order.clone()
        };
        let _ = self.update_tx.send(update);
    }

    /// Make the next limit_buy/limit_sell fail with a transport error.
    pub fn fail_next_create(&self) {
        self.state.lock().fail_creates += 1;
    }

    /// Seed an order without going through limit_buy/limit_sell.
    pub fn insert_order(&self, order: Order) {
        self.state.lock().orders.insert(order.order_id.clone(), order);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn order(&self, order_id: &OrderId) -> Option<Order> {
        self.state.lock().orders.get(order_id).cloned()
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().orders.values().filter(|o| !o.done).count()
    }

    /// The single order's id; panics unless exactly one order exists.
    pub fn only_order_id(&self) -> OrderId {
        let state = self.state.lock();
        assert_eq!(state.orders.len(), 1, "expected exactly one order");
        state.orders.keys().next().expect("one order").clone()
    }

    /// Ids of orders that are not done yet.
    pub fn open_order_ids(&self) -> Vec<OrderId> {
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| !o.done)
            .map(|o| o.order_id.clone())
            .collect()
    }

    pub fn ticker_subscribers(&self) -> usize {
        self.ticker_tx.receiver_count()
    }

    fn place(&self, side: Side, client_order_id: &str, call: MockCall) -> Result<OrderId, ExchangeError> {
        let mut state = self.state.lock();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(ExchangeError::Transport("injected create failure".into()));
        }
        state.calls.push(call);
        state.next_seq += 1;
        let order_id = OrderId::new(format!("mock-{:04}", state.next_seq));
        let mut order = Order::submitted(order_id.clone(), client_order_id, side);
        order.status = OrderStatus::Open;
        order.create_time = Some(Utc::now());
        state.orders.insert(order_id.clone(), order);
        Ok(order_id)
    }
}

#[async_trait]
impl Product for MockProduct {
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
        self.place(Side::Buy, client_order_id, MockCall::LimitBuy { size, price })
    }

    async fn limit_sell(
        &self,
        client_order_id: &str,
        size: Decimal,
        price: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.place(Side::Sell, client_order_id, MockCall::LimitSell { size, price })
    }

    async fn cancel(&self, order_id: &OrderId) -> Result<(), ExchangeError> {
        let update = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Cancel(order_id.clone()));
            let order = state
                .orders
                .get_mut(order_id)
                .ok_or_else(|| ExchangeError::OrderNotFound(order_id.clone()))?;
            if !order.done {
                order.status = OrderStatus::Canceled;
                order.done = true;
                order.done_reason = "CANCELED".to_string();
                order.finish_time = Some(Utc::now());
            }
            order.clone()
        };
        let _ = self.update_tx.send(update);
        Ok(())
    }

    async fn get(&self, order_id: &OrderId) -> Result<Order, ExchangeError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Get(order_id.clone()));
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.clone()))
    }
}

/// Poll until `condition` holds, panicking after a couple of seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
