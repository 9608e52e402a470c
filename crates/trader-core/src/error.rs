//! Engine error types.

use exchange_core::ExchangeError;
use kv_core::KvError;
use model::{Point, PointError, Side};
use thiserror::Error;

/// Errors from trading jobs.
#[derive(Debug, Error)]
pub enum TraderError {
    /// A point failed validation.
    #[error("invalid point: {0}")]
    Point(#[from] PointError),

    /// A point has the wrong derived side for its role.
    #[error("point {point} must be a {want} point")]
    WrongSide { point: Point, want: Side },

    /// Job uid is empty or not an absolute key path.
    #[error("job uid {0:?} is invalid")]
    InvalidUid(String),

    /// Price pairs in a wall must not overlap.
    #[error("price pairs {0} and {1} overlap")]
    OverlappingPairs(Point, Point),

    /// A pair must buy strictly below where it sells.
    #[error("pair buy price {0} is not below sell price {1}")]
    InvertedPair(rust_decimal::Decimal, rust_decimal::Decimal),

    /// Fee percentage must not be negative.
    #[error("fee percentage {0} is negative")]
    NegativeFee(rust_decimal::Decimal),

    /// The runtime was built for a different product.
    #[error("runtime product {actual:?} does not match job product {expected:?}")]
    ProductMismatch { expected: String, actual: String },

    /// A persisted record carries no usable schema version.
    #[error("state record for {0:?} has an unknown version")]
    UnknownVersion(String),

    /// Reconciliation found conflicting live orders; external repair needed.
    #[error("found {0} live orders (want 0 or 1)")]
    LiveOrders(usize),

    /// An event stream ended while the job was still running.
    #[error("{0} stream closed")]
    StreamClosed(&'static str),

    /// No exchange registered under this name.
    #[error("no exchange with name {0:?}")]
    UnknownExchange(String),

    /// No running job with this uid.
    #[error("no running job with uid {0:?}")]
    UnknownJob(String),

    /// A job with this uid is already running.
    #[error("job {0:?} is already running")]
    JobRunning(String),

    /// Exchange operation failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Storage operation failed.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// A job task failed outside its own control flow.
    #[error("internal error: {0}")]
    Internal(String),

    /// Shutdown requested; returned as the cancellation cause after cleanup.
    #[error("shutdown requested")]
    Shutdown,
}

impl TraderError {
    /// Returns true when the error is the cooperative-cancellation cause.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
