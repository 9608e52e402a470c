//! Trading engine core.
//!
//! The engine executes a preconfigured geometric buy/sell plan against a
//! spot exchange:
//!
//! - **Limiter**: keeps one live limit order near a price point, canceling
//!   and recreating it as the ticker crosses the cancel threshold, with
//!   durable checkpoints and restart reconciliation
//! - **Looper**: alternates buy and sell limiters to realize one
//!   buy-low/sell-high loop
//! - **Waller**: runs a parallel wall of loopers over a price grid and
//!   answers offline planning questions
//! - **Summary**: aggregates per-job trade totals into profit metrics
//!
//! Jobs are addressed by uid, persist their state through the `kv-core`
//! traits, and react to the ticker/order-update streams of an
//! `exchange-core` product handle.

mod error;
mod idgen;
mod limiter;
mod looper;
mod registry;
mod runtime;
mod state;
mod summary;
mod waller;

#[cfg(test)]
mod testutil;

pub use error::TraderError;
pub use idgen::IdGen;
pub use limiter::{Limiter, LimiterOptions, LimiterStatus};
pub use looper::{Looper, LooperStatus};
pub use registry::{ExchangeMap, JobSet};
pub use runtime::Runtime;
pub use state::{
    limiter_key, times_key, JobTimesRecord, LimiterState, LimiterStateV1, LimiterStateV2,
    LooperState, OrderRecord, PairRecord, WallerState, LIMITERS_KEYSPACE, LOOPERS_KEYSPACE,
    TIMES_KEYSPACE, WALLERS_KEYSPACE,
};
pub use summary::{summarize, Status, Summary, TimeRange};
pub use waller::{WallPlan, Waller, WallerStatus};
