//! Single-price limit-order state machine.
//!
//! A `Limiter` keeps exactly one live order on the exchange near its point
//! price whenever the ticker is on the ready side of the cancel threshold,
//! withdraws it when the market moves away, and reconciles local state with
//! the exchange on every start. Progress is checkpointed to the database on
//! a dirty timer, on order updates and on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use exchange_core::{Order, OrderId, Product};
use kv_core::{KvError, ReadWriter, Reader};
use model::{Point, Side};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::TraderError;
use crate::idgen::IdGen;
use crate::runtime::Runtime;
use crate::state::{limiter_key, times_key, JobTimesRecord, LimiterState, LimiterStateV2, OrderRecord};
use crate::summary::TimeRange;

/// Dirty state is flushed to the database at this cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Live-tunable limiter options, shared with the control layer.
#[derive(Debug, Clone, Default)]
pub struct LimiterOptions {
    hold: Arc<AtomicBool>,
    size_limit: Arc<RwLock<Option<Decimal>>>,
}

impl LimiterOptions {
    /// When held, the limiter cancels its active order and stops creating
    /// new ones until released.
    pub fn hold(&self) -> bool {
        self.hold.load(Ordering::Relaxed)
    }

    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::Relaxed);
    }

    /// Maximum size for a single exchange order, if set.
    pub fn size_limit(&self) -> Option<Decimal> {
        *self.size_limit.read()
    }

    pub fn set_size_limit(&self, limit: Option<Decimal>) {
        *self.size_limit.write() = limit;
    }
}

/// Read-only view of a limiter.
#[derive(Debug, Clone)]
pub struct LimiterStatus {
    pub uid: String,
    pub product_id: String,
    pub side: Side,
    pub point: Point,
    pub pending: Decimal,
}

/// A buy or sell limit job at one price point.
#[derive(Debug)]
pub struct Limiter {
    uid: String,
    product_id: String,
    exchange_name: String,
    point: Point,
    idgen: IdGen,
    // client-order-id to exchange-order-id; kept as a durable paper trail
    // for crash recovery and verification.
    client_server_map: HashMap<String, OrderId>,
    order_map: HashMap<OrderId, Order>,
    options: LimiterOptions,
}

impl Limiter {
    /// Create a new buy or sell limit job at the given price point. The
    /// exchange-side order is canceled and recreated automatically as the
    /// ticker crosses the cancel threshold and comes back toward the limit
    /// price.
    pub fn new(
        uid: &str,
        exchange_name: &str,
        product_id: &str,
        point: Point,
    ) -> Result<Self, TraderError> {
        let v = Self {
            uid: uid.to_string(),
            product_id: product_id.to_string(),
            exchange_name: exchange_name.to_string(),
            point,
            idgen: IdGen::new(uid, 0),
            client_server_map: HashMap::new(),
            order_map: HashMap::new(),
            options: LimiterOptions::default(),
        };
        v.check()?;
        Ok(v)
    }

    fn check(&self) -> Result<(), TraderError> {
        if self.uid.is_empty() {
            return Err(TraderError::InvalidUid(self.uid.clone()));
        }
        self.point.check()?;
        Ok(())
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn side(&self) -> Side {
        self.point.side()
    }

    pub fn point(&self) -> Point {
        self.point
    }

    /// Handle for adjusting the hold/size-limit options while running.
    pub fn options(&self) -> LimiterOptions {
        self.options.clone()
    }

    pub fn status(&self) -> LimiterStatus {
        LimiterStatus {
            uid: self.uid.clone(),
            product_id: self.product_id.clone(),
            side: self.point.side(),
            point: self.point,
            pending: self.pending(),
        }
    }

    /// Size still to be filled: the point size minus everything filled so
    /// far across all orders. Never negative while invariants hold.
    pub fn pending(&self) -> Decimal {
        let filled: Decimal = self.order_map.values().map(|o| o.filled_size).sum();
        self.point.size - filled
    }

    /// Cumulative filled size across all orders.
    pub fn filled_size(&self) -> Decimal {
        self.order_map.values().map(|o| o.filled_size).sum()
    }

    /// Cumulative filled value (size times fill price) across all orders.
    pub fn filled_value(&self) -> Decimal {
        self.order_map
            .values()
            .map(|o| o.filled_size * o.filled_price)
            .sum()
    }

    /// Cumulative fees across all orders.
    pub fn filled_fees(&self) -> Decimal {
        self.order_map.values().map(|o| o.fee).sum()
    }

    /// Span from the earliest order creation to the latest completion.
    pub fn time_range(&self) -> TimeRange {
        let begin = self.order_map.values().filter_map(|o| o.create_time).min();
        let end = self.order_map.values().filter_map(|o| o.finish_time).max();
        TimeRange { begin, end }
    }

    fn compact_order_map(&mut self) {
        self.order_map.retain(|_, order| !(order.done && order.filled_size.is_zero()));
    }

    fn update_order_map(&mut self, order: Order) {
        // Updates for orders we never created (or already compacted away)
        // are ignored.
        if self.order_map.contains_key(&order.order_id) {
            self.order_map.insert(order.order_id.clone(), order);
        }
    }

    /// Persist the limiter under its key, compacting fully-canceled orders
    /// first. Always writes the current schema version.
    pub fn save(&mut self, rw: &mut dyn ReadWriter) -> Result<(), KvError> {
        self.compact_order_map();
        let mut client_server_id_map = std::collections::BTreeMap::new();
        for (client, server) in &self.client_server_map {
            client_server_id_map.insert(client.clone(), server.to_string());
        }
        let mut server_id_order_map = std::collections::BTreeMap::new();
        for (id, order) in &self.order_map {
            server_id_order_map.insert(id.to_string(), OrderRecord::from(order));
        }
        let state = LimiterState {
            v1: None,
            v2: Some(LimiterStateV2 {
                product_id: self.product_id.clone(),
                exchange_name: self.exchange_name.clone(),
                client_id_seed: self.idgen.seed().to_string(),
                client_id_offset: self.idgen.offset(),
                trade_point: self.point,
                client_server_id_map,
                server_id_order_map,
            }),
        };
        kv_core::set_typed(rw, &limiter_key(&self.uid), &state)
    }

    /// Rehydrate a limiter from the database.
    ///
    /// Legacy keys are rewritten into the limiter keyspace with a fallback
    /// to the raw uid, and V1 payloads are upgraded in memory.
    pub fn load(uid: &str, r: &dyn Reader) -> Result<Self, TraderError> {
        let key = limiter_key(uid);
        let mut state: LimiterState = match kv_core::get_typed(r, &key) {
            Ok(state) => state,
            Err(err) if err.is_not_found() && key != uid => kv_core::get_typed(r, uid)?,
            Err(err) => return Err(err.into()),
        };
        state.upgrade(uid);
        let v2 = state
            .v2
            .ok_or_else(|| TraderError::UnknownVersion(uid.to_string()))?;

        let seed = if v2.client_id_seed.is_empty() {
            uid
        } else {
            &v2.client_id_seed
        };
        let mut client_server_map = HashMap::new();
        for (client, server) in &v2.client_server_id_map {
            client_server_map.insert(client.clone(), OrderId::new(server.clone()));
        }
        let mut order_map = HashMap::new();
        for (id, record) in &v2.server_id_order_map {
            order_map.insert(OrderId::new(id.clone()), record.to_order());
        }
        let v = Self {
            uid: uid.to_string(),
            product_id: v2.product_id,
            exchange_name: v2.exchange_name,
            point: v2.trade_point,
            idgen: IdGen::new(seed, v2.client_id_offset),
            client_server_map,
            order_map,
            options: LimiterOptions::default(),
        };
        v.check()?;
        Ok(v)
    }

    /// Run the limit job until the point is completely filled or shutdown is
    /// requested.
    ///
    /// Exchange errors surface to the caller, which is expected to retry.
    /// Finding more than one live order is fatal and needs external repair.
    pub async fn run(
        &mut self,
        rt: &Runtime,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TraderError> {
        info!(uid = %self.uid, point = %self.point, "started limit job");
        if rt.product.product_id() != self.product_id {
            return Err(TraderError::ProductMismatch {
                expected: self.product_id.clone(),
                actual: rt.product.product_id().to_string(),
            });
        }

        let nupdated = self.fetch_order_map(rt.product.as_ref()).await?;

        if self.pending().is_zero() {
            if nupdated != 0 {
                if let Err(err) = self.save_to(rt) {
                    warn!(uid = %self.uid, error = %err, "state save failed (will retry on restart)");
                }
            }
            self.spawn_finish_time_update(rt);
            info!(uid = %self.uid, point = %self.point, "limit job is complete: pending size is zero");
            return Ok(());
        }

        let live: Vec<OrderId> = self
            .order_map
            .values()
            .filter(|o| !o.done)
            .map(|o| o.order_id.clone())
            .collect();
        if live.len() > 1 {
            error!(uid = %self.uid, nlive = live.len(), "conflicting live orders in the order map");
            return Err(TraderError::LiveOrders(live.len()));
        }
        let mut active_order_id: Option<OrderId> = live.into_iter().next();
        if let Some(id) = &active_order_id {
            info!(uid = %self.uid, order_id = %id, "reusing existing order as the active order");
        }

        let mut dirty: u32 = 0;
        let mut flush = tokio::time::interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);

        let mut tickers = rt.product.tickers();
        let mut updates = rt.product.order_updates();

        let mut last_size_limit = self.options.size_limit();

        while !self.pending().is_zero() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if let Some(id) = active_order_id.take() {
                            info!(uid = %self.uid, order_id = %id, "canceling active limit order on shutdown");
                            // The cancel RPC still runs after shutdown is
                            // signalled; otherwise the order leaks on the
                            // exchange.
                            self.cancel_order(rt.product.as_ref(), &id).await?;
                        }
                        if let Err(err) = self.save_to(rt) {
                            warn!(uid = %self.uid, error = %err, "state save failed on shutdown (will retry on restart)");
                        }
                        self.spawn_finish_time_update(rt);
                        return Err(TraderError::Shutdown);
                    }
                }

                _ = flush.tick() => {
                    if dirty > 0 {
                        match self.save_to(rt) {
                            Ok(()) => dirty = 0,
                            Err(err) => {
                                warn!(uid = %self.uid, error = %err, "state save failed (will retry next tick)");
                            }
                        }
                    }
                }

                update = updates.recv() => {
                    match update {
                        Ok(order) => {
                            dirty += 1;
                            let was_active = Some(&order.order_id) == active_order_id.as_ref();
                            let finished = order.done;
                            let status = order.status;
                            let reason = order.done_reason.clone();
                            let order_id = order.order_id.clone();
                            self.update_order_map(order);
                            if finished && was_active {
                                info!(
                                    uid = %self.uid,
                                    order_id = %order_id,
                                    status = %status,
                                    done_reason = %reason,
                                    "active limit order is complete"
                                );
                                active_order_id = None;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(uid = %self.uid, missed, "order update stream lagged; reconciling");
                            self.fetch_order_map(rt.product.as_ref()).await?;
                            dirty += 1;
                            if let Some(id) = &active_order_id {
                                if self.order_map.get(id).map(|o| o.done).unwrap_or(true) {
                                    active_order_id = None;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(TraderError::StreamClosed("order update"));
                        }
                    }
                }

                ticker = tickers.recv() => {
                    let ticker = match ticker {
                        Ok(t) => t,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Only the most recent ticker matters.
                            warn!(uid = %self.uid, missed, "ticker stream lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(TraderError::StreamClosed("ticker"));
                        }
                    };

                    // A held job withdraws its order and goes quiet.
                    if self.options.hold() {
                        if let Some(id) = active_order_id.take() {
                            info!(uid = %self.uid, order_id = %id, "canceling existing order cause option hold=true is set");
                            self.cancel_order(rt.product.as_ref(), &id).await?;
                            dirty += 1;
                        }
                        continue;
                    }

                    // A size-limit change invalidates the active order; it is
                    // recreated with the new clamp.
                    let size_limit = self.options.size_limit();
                    if active_order_id.is_some() && size_limit != last_size_limit {
                        if let Some(id) = active_order_id.take() {
                            info!(
                                uid = %self.uid,
                                order_id = %id,
                                ?last_size_limit,
                                ?size_limit,
                                "canceling existing order cause size-limit has changed"
                            );
                            self.cancel_order(rt.product.as_ref(), &id).await?;
                            dirty += 1;
                        }
                        last_size_limit = size_limit;
                    }

                    // Do not create orders until the ticker is on the ready
                    // side of the cancel threshold.
                    if active_order_id.is_none() && !self.is_ticker_side_ready(ticker.price) {
                        continue;
                    }

                    match self.point.side() {
                        Side::Sell => {
                            if ticker.price <= self.point.cancel {
                                if let Some(id) = active_order_id.take() {
                                    self.cancel_order(rt.product.as_ref(), &id).await?;
                                    dirty += 1;
                                }
                            }
                            if ticker.price > self.point.cancel && active_order_id.is_none() {
                                let id = self.create_order(rt.product.as_ref()).await?;
                                dirty += 1;
                                active_order_id = Some(id);
                            }
                        }
                        Side::Buy => {
                            if ticker.price >= self.point.cancel {
                                if let Some(id) = active_order_id.take() {
                                    self.cancel_order(rt.product.as_ref(), &id).await?;
                                    dirty += 1;
                                }
                            }
                            if ticker.price < self.point.cancel && active_order_id.is_none() {
                                let id = self.create_order(rt.product.as_ref()).await?;
                                dirty += 1;
                                active_order_id = Some(id);
                            }
                        }
                    }
                }
            }
        }

        self.fetch_order_map(rt.product.as_ref()).await?;
        self.save_to(rt)?;
        self.spawn_finish_time_update(rt);
        info!(uid = %self.uid, point = %self.point, "limit job is complete");
        Ok(())
    }

    /// Reconcile local order state under the runtime lock.
    pub async fn refresh(&mut self, rt: &Runtime) -> Result<(), TraderError> {
        self.fetch_order_map(rt.product.as_ref()).await?;
        Ok(())
    }

    /// Reserved repair hook; runs under the same locking discipline as
    /// `run` and `refresh`.
    pub async fn fix(&mut self, _rt: &Runtime) -> Result<(), TraderError> {
        Ok(())
    }

    /// Ticker is approaching the limit price from the correct direction.
    fn is_ticker_side_ready(&self, price: Decimal) -> bool {
        match self.point.side() {
            Side::Sell => price > self.point.cancel,
            Side::Buy => price < self.point.cancel,
        }
    }

    async fn create_order(&mut self, product: &dyn Product) -> Result<OrderId, TraderError> {
        let offset = self.idgen.offset();
        let client_order_id = self.idgen.next_id().to_string();

        let mut size = self.pending();
        if let Some(limit) = self.options.size_limit() {
            if size > limit {
                size = limit;
            }
        }
        if size < product.base_min_size() {
            size = product.base_min_size();
        }

        let side = self.point.side();
        let started = std::time::Instant::now();
        let result = match side {
            Side::Sell => product.limit_sell(&client_order_id, size, self.point.price).await,
            Side::Buy => product.limit_buy(&client_order_id, size, self.point.price).await,
        };
        let latency = started.elapsed();

        let order_id = match result {
            Ok(id) => id,
            Err(err) => {
                // Take the offset back so no client order id is orphaned.
                self.idgen.revert_id();
                error!(
                    uid = %self.uid,
                    client_order_id = %client_order_id,
                    offset,
                    ?latency,
                    error = %err,
                    "create limit order failed"
                );
                return Err(err.into());
            }
        };

        self.client_server_map
            .insert(client_order_id.clone(), order_id.clone());
        self.order_map.insert(
            order_id.clone(),
            Order::submitted(order_id.clone(), client_order_id.clone(), side),
        );
        info!(
            uid = %self.uid,
            order_id = %order_id,
            client_order_id = %client_order_id,
            offset,
            %size,
            ?latency,
            "created a new limit order"
        );
        Ok(order_id)
    }

    async fn cancel_order(
        &mut self,
        product: &dyn Product,
        order_id: &OrderId,
    ) -> Result<(), TraderError> {
        if let Err(err) = product.cancel(order_id).await {
            error!(uid = %self.uid, order_id = %order_id, error = %err, "cancel limit order failed");
            return Err(err.into());
        }
        Ok(())
    }

    /// Fetch authoritative state for every non-done order.
    async fn fetch_order_map(&mut self, product: &dyn Product) -> Result<usize, TraderError> {
        let ids: Vec<OrderId> = self
            .order_map
            .values()
            .filter(|o| !o.done)
            .map(|o| o.order_id.clone())
            .collect();
        let mut nupdated = 0;
        for id in ids {
            let order = match product.get(&id).await {
                Ok(order) => order,
                Err(err) => {
                    error!(uid = %self.uid, order_id = %id, error = %err, "could not fetch order");
                    return Err(err.into());
                }
            };
            self.order_map.insert(id, order);
            nupdated += 1;
        }
        Ok(nupdated)
    }

    fn save_to(&mut self, rt: &Runtime) -> Result<(), KvError> {
        kv_core::with_read_writer(rt.database.as_ref(), |rw| self.save(rw))
    }

    /// Record the completion timestamp without blocking the run loop.
    fn spawn_finish_time_update(&self, rt: &Runtime) {
        let finish_time = self
            .order_map
            .values()
            .filter_map(|o| o.finish_time)
            .max()
            .unwrap_or_else(Utc::now);
        let uid = self.uid.clone();
        let database = rt.database.clone();
        tokio::spawn(async move {
            let record = JobTimesRecord { finish_time };
            let result: Result<(), KvError> =
                kv_core::with_read_writer(database.as_ref(), |rw| {
                    kv_core::set_typed(rw, &times_key(&uid), &record)
                });
            if let Err(err) = result {
                warn!(uid = %uid, error = %err, "could not update job finish time");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{wait_for, MockCall, MockProduct};
    use kv_core::{Database, MemoryDatabase};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn runtime(mock: &Arc<MockProduct>) -> (Runtime, Arc<MemoryDatabase>) {
        let db = Arc::new(MemoryDatabase::new());
        let rt = Runtime::new(
            mock.clone() as Arc<dyn Product>,
            db.clone() as Arc<dyn Database>,
        );
        (rt, db)
    }

    #[test]
    fn test_new_rejects_bad_input() {
        let point = Point::new(dec!(1), dec!(100), dec!(95)).unwrap();
        assert!(matches!(
            Limiter::new("", "sim", "TEST-USD", point),
            Err(TraderError::InvalidUid(_))
        ));

        let bad = Point {
            size: dec!(0),
            price: dec!(100),
            cancel: dec!(95),
        };
        assert!(matches!(
            Limiter::new("/limiters/x", "sim", "TEST-USD", bad),
            Err(TraderError::Point(_))
        ));
    }

    #[tokio::test]
    async fn test_sell_fills_in_one_shot() {
        let mock = MockProduct::new("TEST-USD", dec!(0.01));
        let (rt, _db) = runtime(&mock);
        let point = Point::new(dec!(1.0), dec!(100), dec!(95)).unwrap();
        let mut limiter = Limiter::new("/limiters/s1", "sim", "TEST-USD", point).unwrap();

        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = limiter.run(&rt, shutdown_rx).await;
            (limiter, result)
        });

        wait_for(|| mock.ticker_subscribers() > 0).await;
        mock.send_ticker(dec!(96));
        wait_for(|| mock.order_count() == 1).await;

        assert_eq!(
            mock.calls()[0],
            MockCall::LimitSell {
                size: dec!(1.0),
                price: dec!(100)
            }
        );

        let id = mock.only_order_id();
        mock.fill(&id, dec!(1.0), dec!(100), true);

        let (limiter, result) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(limiter.pending(), dec!(0));
    }

    #[tokio::test]
    async fn test_cancel_on_crossing_threshold() {
        let mock = MockProduct::new("TEST-USD", dec!(0.01));
        let (rt, _db) = runtime(&mock);
        let point = Point::new(dec!(1.0), dec!(100), dec!(95)).unwrap();
        let mut limiter = Limiter::new("/limiters/s2", "sim", "TEST-USD", point).unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = limiter.run(&rt, shutdown_rx).await;
            (limiter, result)
        });

        wait_for(|| mock.ticker_subscribers() > 0).await;
        mock.send_ticker(dec!(96));
        wait_for(|| mock.order_count() == 1).await;

        mock.send_ticker(dec!(94));
        wait_for(|| mock.open_order_count() == 0).await;

        // Still running: pending is untouched and no live order remains.
        shutdown_tx.send(true).unwrap();
        let (limiter, result) = handle.await.unwrap();
        assert!(result.unwrap_err().is_shutdown());
        assert_eq!(limiter.pending(), dec!(1.0));
    }

    #[tokio::test]
    async fn test_partial_fill_then_resume() {
        let mock = MockProduct::new("TEST-USD", dec!(0.01));
        let (rt, db) = runtime(&mock);
        let point = Point::new(dec!(2.0), dec!(50), dec!(55)).unwrap();
        let mut limiter = Limiter::new("/limiters/s3", "sim", "TEST-USD", point).unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = limiter.run(&rt, shutdown_rx).await;
            (limiter, result)
        });

        wait_for(|| mock.ticker_subscribers() > 0).await;
        mock.send_ticker(dec!(52));
        wait_for(|| mock.order_count() == 1).await;

        let id = mock.only_order_id();
        mock.fill(&id, dec!(0.7), dec!(50), false);
        // Let the run loop observe the partial fill before shutting down.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        let (limiter, result) = handle.await.unwrap();
        assert!(result.unwrap_err().is_shutdown());
        assert_eq!(limiter.pending(), dec!(1.3));

        // The active order was canceled on the way out.
        let order = mock.order(&id).unwrap();
        assert!(order.done);
        assert_eq!(order.done_reason, "CANCELED");

        // Reload from the saved state.
        let reloaded: Limiter = kv_core::with_reader(db.as_ref(), |r| {
            Limiter::load("/limiters/s3", r)
        })
        .unwrap();
        assert_eq!(reloaded.pending(), dec!(1.3));
    }

    #[tokio::test]
    async fn test_create_failure_reverts_idgen() {
        let mock = MockProduct::new("TEST-USD", dec!(0.01));
        let (rt, _db) = runtime(&mock);
        let point = Point::new(dec!(1.0), dec!(50), dec!(55)).unwrap();
        let mut limiter = Limiter::new("/limiters/s4", "sim", "TEST-USD", point).unwrap();

        mock.fail_next_create();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = limiter.run(&rt, shutdown_rx).await;
            (limiter, result)
        });

        wait_for(|| mock.ticker_subscribers() > 0).await;
        mock.send_ticker(dec!(52));

        let (limiter, result) = handle.await.unwrap();
        assert!(matches!(result.unwrap_err(), TraderError::Exchange(_)));
        assert_eq!(limiter.idgen.offset(), 0);
        assert!(limiter.order_map.is_empty());
        assert_eq!(mock.order_count(), 0);
    }

    #[tokio::test]
    async fn test_double_live_order_detection() {
        let mock = MockProduct::new("TEST-USD", dec!(0.01));
        let (rt, db) = runtime(&mock);
        let point = Point::new(dec!(2.0), dec!(100), dec!(95)).unwrap();
        let mut limiter = Limiter::new("/limiters/s6", "sim", "TEST-USD", point).unwrap();

        // Two conflicting live orders in the persisted map.
        for n in 0..2 {
            let order = Order::submitted(
                OrderId::new(format!("srv-{n}")),
                format!("client-{n}"),
                Side::Sell,
            );
            mock.insert_order(order.clone());
            limiter
                .client_server_map
                .insert(order.client_order_id.clone(), order.order_id.clone());
            limiter.order_map.insert(order.order_id.clone(), order);
        }
        kv_core::with_read_writer::<_, KvError, _>(db.as_ref(), |rw| limiter.save(rw)).unwrap();

        let mut reloaded: Limiter =
            kv_core::with_reader(db.as_ref(), |r| Limiter::load("/limiters/s6", r)).unwrap();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let err = reloaded.run(&rt, shutdown_rx).await.unwrap_err();
        assert_eq!(err.to_string(), "found 2 live orders (want 0 or 1)");

        // Only the reconcile fetches hit the exchange.
        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| matches!(c, MockCall::Get(_))));
    }

    #[tokio::test]
    async fn test_hold_option_cancels_and_pauses() {
        let mock = MockProduct::new("TEST-USD", dec!(0.01));
        let (rt, _db) = runtime(&mock);
        let point = Point::new(dec!(1.0), dec!(100), dec!(95)).unwrap();
        let mut limiter = Limiter::new("/limiters/hold", "sim", "TEST-USD", point).unwrap();
        let options = limiter.options();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = limiter.run(&rt, shutdown_rx).await;
            (limiter, result)
        });

        wait_for(|| mock.ticker_subscribers() > 0).await;
        mock.send_ticker(dec!(96));
        wait_for(|| mock.order_count() == 1).await;

        options.set_hold(true);
        mock.send_ticker(dec!(97));
        wait_for(|| mock.open_order_count() == 0).await;

        // Held: a ready ticker creates nothing new.
        mock.send_ticker(dec!(98));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(mock.order_count(), 1);

        shutdown_tx.send(true).unwrap();
        let (_limiter, result) = handle.await.unwrap();
        assert!(result.unwrap_err().is_shutdown());
    }

    #[tokio::test]
    async fn test_size_limit_clamps_order_size() {
        let mock = MockProduct::new("TEST-USD", dec!(0.01));
        let (rt, _db) = runtime(&mock);
        let point = Point::new(dec!(5.0), dec!(100), dec!(95)).unwrap();
        let mut limiter = Limiter::new("/limiters/clamp", "sim", "TEST-USD", point).unwrap();
        limiter.options().set_size_limit(Some(dec!(2.0)));

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = limiter.run(&rt, shutdown_rx).await;
            (limiter, result)
        });

        wait_for(|| mock.ticker_subscribers() > 0).await;
        mock.send_ticker(dec!(96));
        wait_for(|| mock.order_count() == 1).await;

        assert_eq!(
            mock.calls()[0],
            MockCall::LimitSell {
                size: dec!(2.0),
                price: dec!(100)
            }
        );

        shutdown_tx.send(true).unwrap();
        let _ = handle.await.unwrap();
    }

    #[test]
    fn test_save_load_roundtrip_after_compaction() {
        let db = MemoryDatabase::new();
        let point = Point::new(dec!(3), dec!(100), dec!(95)).unwrap();
        let mut limiter = Limiter::new("/limiters/rt", "sim", "TEST-USD", point).unwrap();

        // A filled order survives compaction; a canceled zero-fill one does
        // not.
        let mut filled = Order::submitted(OrderId::from("srv-1"), "client-1", Side::Sell);
        filled.filled_size = dec!(1);
        filled.filled_price = dec!(100);
        filled.fee = dec!(0.2);
        filled.done = true;
        filled.done_reason = "FILLED".to_string();
        let mut canceled = Order::submitted(OrderId::from("srv-2"), "client-2", Side::Sell);
        canceled.done = true;
        canceled.done_reason = "CANCELED".to_string();
        for order in [filled, canceled] {
            limiter
                .client_server_map
                .insert(order.client_order_id.clone(), order.order_id.clone());
            limiter.order_map.insert(order.order_id.clone(), order);
        }
        limiter.idgen.next_id();
        limiter.idgen.next_id();

        kv_core::with_read_writer::<_, KvError, _>(&db, |rw| limiter.save(rw)).unwrap();

        let loaded: Limiter =
            kv_core::with_reader(&db, |r| Limiter::load("/limiters/rt", r)).unwrap();
        assert_eq!(loaded.pending(), dec!(2));
        assert_eq!(loaded.order_map.len(), 1);
        assert_eq!(loaded.idgen.offset(), 2);
        assert_eq!(loaded.idgen.seed(), "/limiters/rt");
        assert_eq!(loaded.point, limiter.point);

        // The resumed generator continues the same sequence.
        let mut a = IdGen::new("/limiters/rt", 2);
        let mut b = loaded.idgen.clone();
        assert_eq!(a.next_id(), b.next_id());
    }

    #[test]
    fn test_load_missing_key() {
        let db = MemoryDatabase::new();
        let err = kv_core::with_reader::<Limiter, TraderError, _>(&db, |r| {
            Limiter::load("/limiters/none", r)
        })
        .unwrap_err();
        assert!(matches!(err, TraderError::Kv(KvError::NotFound(_))));
    }
}
