//! Read-only aggregation of completed trades into profit metrics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::looper::Looper;
use crate::waller::Waller;

/// Span between the first and last observed order activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn is_zero(&self) -> bool {
        self.begin.is_none() || self.end.is_none()
    }

    pub fn duration(&self) -> chrono::Duration {
        match (self.begin, self.end) {
            (Some(begin), Some(end)) if end > begin => end - begin,
            _ => chrono::Duration::zero(),
        }
    }

    /// Smallest range covering both inputs.
    pub fn union(a: &TimeRange, b: &TimeRange) -> TimeRange {
        let begin = match (a.begin, b.begin) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (x, y) => x.or(y),
        };
        let end = match (a.end, b.end) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        };
        TimeRange { begin, end }
    }
}

/// Per-job trade totals, the input to [`summarize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub uid: String,
    pub product_id: String,
    pub time_period: TimeRange,

    pub num_buys: usize,
    pub num_sells: usize,
    pub budget: Decimal,

    pub sold_fees: Decimal,
    pub sold_size: Decimal,
    pub sold_value: Decimal,

    pub bought_fees: Decimal,
    pub bought_size: Decimal,
    pub bought_value: Decimal,

    pub unsold_fees: Decimal,
    pub unsold_size: Decimal,
    pub unsold_value: Decimal,

    pub oversold_fees: Decimal,
    pub oversold_size: Decimal,
    pub oversold_value: Decimal,
}

impl Status {
    /// Totals for one looper: buys become bought figures, sells sold
    /// figures. The bought-but-not-yet-sold remainder is carried as unsold,
    /// valued proportionally at its buy cost; an excess of sells over buys
    /// is carried as oversold, valued proportionally at its sell price.
    /// Completed limiters are the ones counted.
    pub fn from_looper(looper: &Looper) -> Status {
        let mut status = Status {
            uid: looper.uid().to_string(),
            product_id: looper.product_id().to_string(),
            budget: looper.buy_point().value(),
            ..Status::default()
        };

        for buy in looper.buys() {
            status.bought_fees += buy.filled_fees();
            status.bought_size += buy.filled_size();
            status.bought_value += buy.filled_value();
            if buy.pending().is_zero() {
                status.num_buys += 1;
            }
            status.time_period = TimeRange::union(&status.time_period, &buy.time_range());
        }
        for sell in looper.sells() {
            status.sold_fees += sell.filled_fees();
            status.sold_size += sell.filled_size();
            status.sold_value += sell.filled_value();
            if sell.pending().is_zero() {
                status.num_sells += 1;
            }
            status.time_period = TimeRange::union(&status.time_period, &sell.time_range());
        }

        if status.bought_size > status.sold_size && !status.bought_size.is_zero() {
            let unsold = status.bought_size - status.sold_size;
            let ratio = unsold / status.bought_size;
            status.unsold_size = unsold;
            status.unsold_fees = status.bought_fees * ratio;
            status.unsold_value = status.bought_value * ratio;
        }
        if status.sold_size > status.bought_size && !status.sold_size.is_zero() {
            let oversold = status.sold_size - status.bought_size;
            let ratio = oversold / status.sold_size;
            status.oversold_size = oversold;
            status.oversold_fees = status.sold_fees * ratio;
            status.oversold_value = status.sold_value * ratio;
        }
        status
    }

    /// Per-looper totals for every loop in a wall.
    pub fn from_waller(waller: &Waller) -> Vec<Status> {
        waller.loopers().iter().map(Status::from_looper).collect()
    }
}

/// Aggregated totals with derived profit metrics. All divisions return zero
/// on a zero divisor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub time_period: TimeRange,

    pub num_buys: usize,
    pub num_sells: usize,
    pub budget: Decimal,

    pub sold_fees: Decimal,
    pub sold_size: Decimal,
    pub sold_value: Decimal,

    pub bought_fees: Decimal,
    pub bought_size: Decimal,
    pub bought_value: Decimal,

    pub unsold_fees: Decimal,
    pub unsold_size: Decimal,
    pub unsold_value: Decimal,

    pub oversold_fees: Decimal,
    pub oversold_size: Decimal,
    pub oversold_value: Decimal,
}

impl Summary {
    /// Fees as a percentage of total traded value.
    pub fn fee_pct(&self) -> Decimal {
        let divisor = self.sold_value + self.bought_value;
        if divisor.is_zero() {
            return Decimal::ZERO;
        }
        (self.sold_fees + self.bought_fees) * Decimal::ONE_HUNDRED / divisor
    }

    /// Sell-side value of completed loops.
    pub fn sold(&self) -> Decimal {
        self.sold_value - self.oversold_value
    }

    /// Buy-side value of completed loops.
    pub fn bought(&self) -> Decimal {
        self.bought_value - self.unsold_value
    }

    /// Fees attributable to completed loops.
    pub fn fees(&self) -> Decimal {
        let sfees = self.sold_fees - self.oversold_fees;
        let bfees = self.bought_fees - self.unsold_fees;
        sfees + bfees
    }

    /// Realized profit on completed loops, net of fees.
    pub fn profit(&self) -> Decimal {
        self.sold() - self.bought() - self.fees()
    }

    pub fn num_days(&self) -> Decimal {
        if self.time_period.is_zero() {
            return Decimal::ZERO;
        }
        Decimal::from(self.time_period.duration().num_seconds()) / Decimal::from(86_400u32)
    }

    pub fn profit_per_day(&self) -> Decimal {
        let ndays = self.num_days();
        if ndays.is_zero() {
            return self.profit();
        }
        self.profit() / ndays
    }

    /// Profit as a percentage of budget.
    pub fn return_rate(&self) -> Decimal {
        if self.budget.is_zero() {
            return Decimal::ZERO;
        }
        self.profit() * Decimal::ONE_HUNDRED / self.budget
    }

    /// Extrapolated annual return as a percentage of budget.
    pub fn annual_return_rate(&self) -> Decimal {
        if self.budget.is_zero() {
            return Decimal::ZERO;
        }
        let per_year = self.profit_per_day() * Decimal::from(365u32);
        per_year * Decimal::ONE_HUNDRED / self.budget
    }
}

/// Sum a set of per-job status records. Commutative and associative in the
/// inputs.
pub fn summarize(statuses: &[Status]) -> Summary {
    let mut sum = Summary::default();
    for status in statuses {
        sum.time_period = TimeRange::union(&sum.time_period, &status.time_period);

        sum.num_buys += status.num_buys;
        sum.num_sells += status.num_sells;
        sum.budget += status.budget;

        sum.sold_fees += status.sold_fees;
        sum.sold_size += status.sold_size;
        sum.sold_value += status.sold_value;

        sum.bought_fees += status.bought_fees;
        sum.bought_size += status.bought_size;
        sum.bought_value += status.bought_value;

        sum.unsold_fees += status.unsold_fees;
        sum.unsold_size += status.unsold_size;
        sum.unsold_value += status.unsold_value;

        sum.oversold_fees += status.oversold_fees;
        sum.oversold_size += status.oversold_size;
        sum.oversold_value += status.oversold_value;
    }
    sum
}
