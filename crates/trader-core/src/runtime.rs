//! Per-job execution context.

use std::sync::Arc;

use exchange_core::Product;
use kv_core::Database;

/// Everything a running job needs: a product handle for market data and
/// order commands, and the database for durable state.
#[derive(Clone)]
pub struct Runtime {
    pub product: Arc<dyn Product>,
    pub database: Arc<dyn Database>,
}

impl Runtime {
    pub fn new(product: Arc<dyn Product>, database: Arc<dyn Database>) -> Self {
        Self { product, database }
    }
}
