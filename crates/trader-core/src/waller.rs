//! Wall of loopers over a price grid.
//!
//! A `Waller` runs one looper per buy/sell pair, each on its own task, and
//! aggregates their status. `WallPlan` answers offline planning questions
//! about a wall (budget, fees, margins, break-even sells per year) without
//! touching an exchange.

use kv_core::{KvError, ReadWriter, Reader};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::info;

use crate::error::TraderError;
use crate::looper::{Looper, LooperStatus};
use crate::runtime::Runtime;
use crate::state::{PairRecord, WallerState};

/// Read-only view of a waller.
#[derive(Debug, Clone)]
pub struct WallerStatus {
    pub uid: String,
    pub product_id: String,
    pub pairs: Vec<PairRecord>,
    pub loopers: Vec<LooperStatus>,
}

/// A parallel set of loopers spanning a grid of price pairs.
pub struct Waller {
    key: String,
    product_id: String,
    exchange_name: String,
    pairs: Vec<PairRecord>,
    loopers: Vec<Looper>,
}

/// Validate a price grid: every pair buys below where it sells and pair
/// price ranges do not overlap.
fn check_pairs(pairs: &[PairRecord]) -> Result<(), TraderError> {
    for pair in pairs {
        pair.buy.check()?;
        pair.sell.check()?;
        if pair.buy.price >= pair.sell.price {
            return Err(TraderError::InvertedPair(pair.buy.price, pair.sell.price));
        }
    }
    let mut sorted: Vec<&PairRecord> = pairs.iter().collect();
    sorted.sort_by(|a, b| a.buy.price.cmp(&b.buy.price));
    for pair in sorted.windows(2) {
        if pair[1].buy.price < pair[0].sell.price {
            return Err(TraderError::OverlappingPairs(pair[0].buy, pair[1].buy));
        }
    }
    Ok(())
}

impl Waller {
    pub fn new(
        key: &str,
        exchange_name: &str,
        product_id: &str,
        pairs: &[PairRecord],
    ) -> Result<Self, TraderError> {
        if key.is_empty() || !key.starts_with('/') {
            return Err(TraderError::InvalidUid(key.to_string()));
        }
        check_pairs(pairs)?;
        let mut loopers = Vec::with_capacity(pairs.len());
        for (i, pair) in pairs.iter().enumerate() {
            let uid = format!("{}/loop-{:06}", key, i);
            loopers.push(Looper::new(
                &uid,
                exchange_name,
                product_id,
                pair.buy,
                pair.sell,
            )?);
        }
        Ok(Self {
            key: key.to_string(),
            product_id: product_id.to_string(),
            exchange_name: exchange_name.to_string(),
            pairs: pairs.to_vec(),
            loopers,
        })
    }

    pub fn uid(&self) -> &str {
        &self.key
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn pairs(&self) -> &[PairRecord] {
        &self.pairs
    }

    pub fn loopers(&self) -> &[Looper] {
        &self.loopers
    }

    pub fn status(&self) -> WallerStatus {
        WallerStatus {
            uid: self.key.clone(),
            product_id: self.product_id.clone(),
            pairs: self.pairs.clone(),
            loopers: self.loopers.iter().map(|l| l.status()).collect(),
        }
    }

    /// Offline planning view of this wall at the given fee percentage.
    pub fn plan(&self, fee_pct: Decimal) -> Result<WallPlan, TraderError> {
        WallPlan::new(&self.pairs, fee_pct)
    }

    /// Run every looper on its own task until shutdown; returns once all of
    /// them have returned.
    pub async fn run(
        &mut self,
        rt: &Runtime,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TraderError> {
        info!(key = %self.key, nloops = self.loopers.len(), "started wall job");
        let loopers = std::mem::take(&mut self.loopers);
        let mut handles = Vec::with_capacity(loopers.len());
        for mut looper in loopers {
            let rt = rt.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let result = looper.run(&rt, shutdown).await;
                (looper, result)
            }));
        }

        let mut cause: Option<TraderError> = None;
        for handle in handles {
            match handle.await {
                Ok((looper, result)) => {
                    self.loopers.push(looper);
                    if let Err(err) = result {
                        if !err.is_shutdown() && cause.is_none() {
                            cause = Some(err);
                        }
                    }
                }
                Err(err) => {
                    if cause.is_none() {
                        cause = Some(TraderError::Internal(format!("loop task failed: {err}")));
                    }
                }
            }
        }
        match cause {
            Some(err) => Err(err),
            None => Err(TraderError::Shutdown),
        }
    }

    /// Persist the waller and all of its loopers.
    pub fn save(&mut self, rw: &mut dyn ReadWriter) -> Result<(), KvError> {
        let mut loopers = Vec::with_capacity(self.loopers.len());
        for looper in &mut self.loopers {
            looper.save(rw)?;
            loopers.push(looper.uid().to_string());
        }
        let state = WallerState {
            product_id: self.product_id.clone(),
            exchange_name: self.exchange_name.clone(),
            pairs: self.pairs.clone(),
            loopers,
        };
        kv_core::set_typed(rw, &self.key, &state)
    }

    /// Rehydrate a waller and its loopers from the database.
    pub fn load(uid: &str, r: &dyn Reader) -> Result<Self, TraderError> {
        let state: WallerState = kv_core::get_typed(r, uid)?;
        check_pairs(&state.pairs)?;
        let mut loopers = Vec::with_capacity(state.loopers.len());
        for id in &state.loopers {
            loopers.push(Looper::load(id, r)?);
        }
        Ok(Self {
            key: uid.to_string(),
            product_id: state.product_id,
            exchange_name: state.exchange_name,
            pairs: state.pairs,
            loopers,
        })
    }
}

/// Offline planning math over a price grid.
pub struct WallPlan {
    pairs: Vec<PairRecord>,
    fee_pct: Decimal,
}

impl WallPlan {
    pub fn new(pairs: &[PairRecord], fee_pct: Decimal) -> Result<Self, TraderError> {
        if fee_pct < Decimal::ZERO {
            return Err(TraderError::NegativeFee(fee_pct));
        }
        check_pairs(pairs)?;
        Ok(Self {
            pairs: pairs.to_vec(),
            fee_pct,
        })
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    /// Capital required to hold a buy at every level at once.
    pub fn budget(&self) -> Decimal {
        self.pairs.iter().map(|p| p.buy.value()).sum()
    }

    fn loop_fee(&self, pair: &PairRecord) -> Decimal {
        (pair.buy.value() + pair.sell.value()) * self.fee_pct / Decimal::ONE_HUNDRED
    }

    fn price_margin(pair: &PairRecord) -> Decimal {
        pair.sell.value() - pair.buy.value()
    }

    fn profit_margin(&self, pair: &PairRecord) -> Decimal {
        Self::price_margin(pair) - self.loop_fee(pair)
    }

    pub fn min_loop_fee(&self) -> Decimal {
        self.pairs.iter().map(|p| self.loop_fee(p)).min().unwrap_or_default()
    }

    pub fn max_loop_fee(&self) -> Decimal {
        self.pairs.iter().map(|p| self.loop_fee(p)).max().unwrap_or_default()
    }

    pub fn min_price_margin(&self) -> Decimal {
        self.pairs.iter().map(Self::price_margin).min().unwrap_or_default()
    }

    pub fn max_price_margin(&self) -> Decimal {
        self.pairs.iter().map(Self::price_margin).max().unwrap_or_default()
    }

    pub fn min_profit_margin(&self) -> Decimal {
        self.pairs.iter().map(|p| self.profit_margin(p)).min().unwrap_or_default()
    }

    pub fn max_profit_margin(&self) -> Decimal {
        self.pairs.iter().map(|p| self.profit_margin(p)).max().unwrap_or_default()
    }

    pub fn avg_profit_margin(&self) -> Decimal {
        if self.pairs.is_empty() {
            return Decimal::ZERO;
        }
        let total: Decimal = self.pairs.iter().map(|p| self.profit_margin(p)).sum();
        total / Decimal::from(self.pairs.len() as u64)
    }

    /// Median capital locked into a single level.
    pub fn median_lockin_amount(&self) -> Decimal {
        if self.pairs.is_empty() {
            return Decimal::ZERO;
        }
        let mut values: Vec<Decimal> = self.pairs.iter().map(|p| p.buy.value()).collect();
        values.sort();
        let mid = values.len() / 2;
        if values.len() % 2 == 1 {
            values[mid]
        } else {
            (values[mid - 1] + values[mid]) / Decimal::TWO
        }
    }

    /// Completed sells per year needed to hit the target annual return
    /// percentage on the full budget.
    pub fn num_sells_per_year(&self, apr: Decimal) -> Decimal {
        let avg = self.avg_profit_margin();
        if avg.is_zero() {
            return Decimal::ZERO;
        }
        self.budget() * apr / Decimal::ONE_HUNDRED / avg
    }
}
