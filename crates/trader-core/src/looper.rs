//! Buy-low/sell-high loop.
//!
//! A `Looper` alternates buy and sell limiters: it places a buy limiter at
//! the buy point, waits for it to fill, places a sell limiter at the sell
//! point, waits for that to fill, then starts the next cycle. It runs until
//! shutdown and retries failed steps after a short delay.

use std::time::Duration;

use kv_core::{KvError, ReadWriter, Reader};
use model::{Point, Side};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::error::TraderError;
use crate::limiter::Limiter;
use crate::runtime::Runtime;
use crate::state::LooperState;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Read-only view of a looper.
#[derive(Debug, Clone)]
pub struct LooperStatus {
    pub uid: String,
    pub product_id: String,
    pub buy_point: Point,
    pub sell_point: Point,
    pub num_buys: usize,
    pub num_sells: usize,
}

/// An alternating buy/sell sequence of limiters over one price pair.
pub struct Looper {
    key: String,
    product_id: String,
    exchange_name: String,
    buy_point: Point,
    sell_point: Point,
    buys: Vec<Limiter>,
    sells: Vec<Limiter>,
}

impl Looper {
    pub fn new(
        key: &str,
        exchange_name: &str,
        product_id: &str,
        buy_point: Point,
        sell_point: Point,
    ) -> Result<Self, TraderError> {
        let v = Self {
            key: key.to_string(),
            product_id: product_id.to_string(),
            exchange_name: exchange_name.to_string(),
            buy_point,
            sell_point,
            buys: Vec::new(),
            sells: Vec::new(),
        };
        v.check()?;
        Ok(v)
    }

    fn check(&self) -> Result<(), TraderError> {
        if self.key.is_empty() || !self.key.starts_with('/') {
            return Err(TraderError::InvalidUid(self.key.clone()));
        }
        self.buy_point.check()?;
        if self.buy_point.side() != Side::Buy {
            return Err(TraderError::WrongSide {
                point: self.buy_point,
                want: Side::Buy,
            });
        }
        self.sell_point.check()?;
        if self.sell_point.side() != Side::Sell {
            return Err(TraderError::WrongSide {
                point: self.sell_point,
                want: Side::Sell,
            });
        }
        Ok(())
    }

    pub fn uid(&self) -> &str {
        &self.key
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn buy_point(&self) -> Point {
        self.buy_point
    }

    pub fn sell_point(&self) -> Point {
        self.sell_point
    }

    pub fn buys(&self) -> &[Limiter] {
        &self.buys
    }

    pub fn sells(&self) -> &[Limiter] {
        &self.sells
    }

    pub fn status(&self) -> LooperStatus {
        LooperStatus {
            uid: self.key.clone(),
            product_id: self.product_id.clone(),
            buy_point: self.buy_point,
            sell_point: self.sell_point,
            num_buys: self.buys.len(),
            num_sells: self.sells.len(),
        }
    }

    /// Run the loop until shutdown. Step failures are logged and retried.
    pub async fn run(
        &mut self,
        rt: &Runtime,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TraderError> {
        info!(key = %self.key, buy = %self.buy_point, sell = %self.sell_point, "started loop job");
        loop {
            if *shutdown.borrow() {
                return Err(TraderError::Shutdown);
            }
            match self.step(rt, &mut shutdown).await {
                Ok(()) => {}
                Err(err) if err.is_shutdown() => return Err(TraderError::Shutdown),
                Err(err) => {
                    if *shutdown.borrow() {
                        return Err(TraderError::Shutdown);
                    }
                    warn!(key = %self.key, error = %err, "loop step failed (retrying)");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// One scheduling decision: start or resume whichever limiter the
    /// buy/sell alternation calls for next.
    async fn step(
        &mut self,
        rt: &Runtime,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TraderError> {
        if self.buys.is_empty() {
            return self.add_new_buy(rt, shutdown).await;
        }
        if let Some(last) = self.buys.last_mut() {
            if !last.pending().is_zero() {
                return last.run(rt, shutdown.clone()).await;
            }
        }
        if self.sells.len() < self.buys.len() {
            return self.add_new_sell(rt).await;
        }
        if let Some(last) = self.sells.last_mut() {
            if !last.pending().is_zero() {
                return last.run(rt, shutdown.clone()).await;
            }
        }
        self.add_new_buy(rt, shutdown).await
    }

    /// Append a new buy limiter, after the ticker has traded above the buy
    /// price at least once. The gate avoids immediate re-entry into a
    /// falling market at the start of a cycle.
    async fn add_new_buy(
        &mut self,
        rt: &Runtime,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TraderError> {
        let mut tickers = rt.product.tickers();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(TraderError::Shutdown);
                    }
                }
                ticker = tickers.recv() => match ticker {
                    Ok(t) if t.price > self.buy_point.price => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TraderError::StreamClosed("ticker"));
                    }
                },
            }
        }

        let uid = format!("{}/buy-{:06}", self.key, self.buys.len());
        let limiter = Limiter::new(&uid, &self.exchange_name, &self.product_id, self.buy_point)?;
        self.buys.push(limiter);
        if let Err(err) = kv_core::with_read_writer::<_, KvError, _>(rt.database.as_ref(), |rw| {
            self.save(rw)
        }) {
            self.buys.pop();
            return Err(err.into());
        }
        info!(key = %self.key, nbuys = self.buys.len(), "added a new limit-buy");
        Ok(())
    }

    /// Append a new sell limiter. Sells start immediately, without a price
    /// gate: an unsold position is capital lock-up.
    async fn add_new_sell(&mut self, rt: &Runtime) -> Result<(), TraderError> {
        let uid = format!("{}/sell-{:06}", self.key, self.sells.len());
        let limiter = Limiter::new(&uid, &self.exchange_name, &self.product_id, self.sell_point)?;
        self.sells.push(limiter);
        if let Err(err) = kv_core::with_read_writer::<_, KvError, _>(rt.database.as_ref(), |rw| {
            self.save(rw)
        }) {
            self.sells.pop();
            return Err(err.into());
        }
        info!(key = %self.key, nsells = self.sells.len(), "added a new limit-sell");
        Ok(())
    }

    /// Persist the looper and all of its limiters.
    pub fn save(&mut self, rw: &mut dyn ReadWriter) -> Result<(), KvError> {
        let mut limiters = Vec::with_capacity(self.buys.len() + self.sells.len());
        for buy in &mut self.buys {
            buy.save(rw)?;
            limiters.push(buy.uid().to_string());
        }
        for sell in &mut self.sells {
            sell.save(rw)?;
            limiters.push(sell.uid().to_string());
        }
        let state = LooperState {
            product_id: self.product_id.clone(),
            exchange_name: self.exchange_name.clone(),
            buy_point: self.buy_point,
            sell_point: self.sell_point,
            limiters,
        };
        kv_core::set_typed(rw, &self.key, &state)
    }

    /// Rehydrate a looper and its limiters from the database.
    pub fn load(uid: &str, r: &dyn Reader) -> Result<Self, TraderError> {
        let state: LooperState = kv_core::get_typed(r, uid)?;
        let mut buys = Vec::new();
        let mut sells = Vec::new();
        for id in &state.limiters {
            let limiter = Limiter::load(id, r)?;
            match limiter.side() {
                Side::Buy => buys.push(limiter),
                Side::Sell => sells.push(limiter),
            }
        }
        let v = Self {
            key: uid.to_string(),
            product_id: state.product_id,
            exchange_name: state.exchange_name,
            buy_point: state.buy_point,
            sell_point: state.sell_point,
            buys,
            sells,
        };
        v.check()?;
        Ok(v)
    }
}
