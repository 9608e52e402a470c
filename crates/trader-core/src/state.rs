//! Durable state schema.
//!
//! Jobs persist serde_json records under keyed paths: `/limiters/<uid>`,
//! `/loopers/<uid>` and `/wallers/<uid>`. Limiter records are versioned;
//! loading upgrades V1 payloads in memory and saving always writes V2.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use exchange_core::{Order, OrderId, OrderStatus};
use model::{Point, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const LIMITERS_KEYSPACE: &str = "/limiters/";
pub const LOOPERS_KEYSPACE: &str = "/loopers/";
pub const WALLERS_KEYSPACE: &str = "/wallers/";
pub const TIMES_KEYSPACE: &str = "/times/";

/// Storage key for a limiter uid.
///
/// Legacy uids created under `/wallers` are rewritten into the limiter
/// keyspace; callers fall back to the raw uid when the rewritten key is
/// absent.
pub fn limiter_key(uid: &str) -> String {
    if uid.starts_with(LIMITERS_KEYSPACE) {
        return uid.to_string();
    }
    let suffix = uid.strip_prefix("/wallers").unwrap_or(uid);
    format!("{}{}", LIMITERS_KEYSPACE, suffix.trim_start_matches('/'))
}

/// Storage key for a job's finish-time record.
pub fn times_key(uid: &str) -> String {
    format!("{}{}", TIMES_KEYSPACE, uid.trim_start_matches('/'))
}

/// A persisted order entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub server_order_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub status: OrderStatus,
    pub create_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub filled_fee: Decimal,
    pub filled_size: Decimal,
    pub filled_price: Decimal,
    pub done: bool,
    pub done_reason: String,
}

impl From<&Order> for OrderRecord {
    fn from(order: &Order) -> Self {
        Self {
            server_order_id: order.order_id.to_string(),
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            status: order.status,
            create_time: order.create_time,
            finish_time: order.finish_time,
            filled_fee: order.fee,
            filled_size: order.filled_size,
            filled_price: order.filled_price,
            done: order.done,
            done_reason: order.done_reason.clone(),
        }
    }
}

impl OrderRecord {
    pub fn to_order(&self) -> Order {
        Order {
            order_id: OrderId::new(self.server_order_id.clone()),
            client_order_id: self.client_order_id.clone(),
            side: self.side,
            status: self.status,
            create_time: self.create_time,
            finish_time: self.finish_time,
            filled_size: self.filled_size,
            filled_price: self.filled_price,
            fee: self.filled_fee,
            done: self.done,
            done_reason: self.done_reason.clone(),
        }
    }
}

/// First-generation limiter payload. Client order ids were formatted as
/// `<uid>/<counter>`; there was no explicit id-generator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterStateV1 {
    pub product_id: String,
    pub exchange_name: String,
    pub trade_point: Point,
    pub client_server_id_map: BTreeMap<String, String>,
    pub server_id_order_map: BTreeMap<String, OrderRecord>,
}

/// Current limiter payload, carrying the id-generator seed and offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterStateV2 {
    pub product_id: String,
    pub exchange_name: String,
    pub client_id_seed: String,
    pub client_id_offset: u64,
    pub trade_point: Point,
    pub client_server_id_map: BTreeMap<String, String>,
    pub server_id_order_map: BTreeMap<String, OrderRecord>,
}

/// Versioned limiter record as stored in the database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v1: Option<LimiterStateV1>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v2: Option<LimiterStateV2>,
}

impl LimiterState {
    /// Synthesize a V2 section from a V1 payload.
    ///
    /// The id-generator seed becomes the job uid and the offset is one past
    /// the largest counter found in the V1 client order ids, so resumed
    /// generators never reuse an id. Idempotent: a record that already has a
    /// V2 section is left untouched.
    pub fn upgrade(&mut self, uid: &str) {
        if self.v2.is_some() {
            return;
        }
        let Some(v1) = self.v1.take() else {
            return;
        };
        let offset = v1
            .client_server_id_map
            .keys()
            .filter_map(|id| id.rsplit('/').next()?.parse::<u64>().ok())
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);
        self.v2 = Some(LimiterStateV2 {
            product_id: v1.product_id,
            exchange_name: v1.exchange_name,
            client_id_seed: uid.to_string(),
            client_id_offset: offset,
            trade_point: v1.trade_point,
            client_server_id_map: v1.client_server_id_map,
            server_id_order_map: v1.server_id_order_map,
        });
    }
}

/// Persisted looper record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LooperState {
    pub product_id: String,
    pub exchange_name: String,
    pub buy_point: Point,
    pub sell_point: Point,
    pub limiters: Vec<String>,
}

/// One buy/sell pair in a wall.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    pub buy: Point,
    pub sell: Point,
}

/// Persisted waller record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallerState {
    pub product_id: String,
    pub exchange_name: String,
    pub pairs: Vec<PairRecord>,
    pub loopers: Vec<String>,
}

/// Completion timestamp written asynchronously when a job finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTimesRecord {
    pub finish_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn point() -> Point {
        Point::new(dec!(1), dec!(100), dec!(95)).unwrap()
    }

    fn v1_state() -> LimiterStateV1 {
        let mut client_server = BTreeMap::new();
        client_server.insert("/limiters/job-1/3".to_string(), "srv-3".to_string());
        client_server.insert("/limiters/job-1/7".to_string(), "srv-7".to_string());
        LimiterStateV1 {
            product_id: "TEST-USD".to_string(),
            exchange_name: "sim".to_string(),
            trade_point: point(),
            client_server_id_map: client_server,
            server_id_order_map: BTreeMap::new(),
        }
    }

    #[test]
    fn test_limiter_key_rewriting() {
        assert_eq!(limiter_key("/limiters/abc"), "/limiters/abc");
        assert_eq!(limiter_key("/wallers/abc/buy-000001"), "/limiters/abc/buy-000001");
        assert_eq!(limiter_key("abc"), "/limiters/abc");
    }

    #[test]
    fn test_upgrade_seeds_generator_state() {
        let mut state = LimiterState {
            v1: Some(v1_state()),
            v2: None,
        };
        state.upgrade("/limiters/job-1");

        let v2 = state.v2.as_ref().unwrap();
        assert_eq!(v2.client_id_seed, "/limiters/job-1");
        assert_eq!(v2.client_id_offset, 8);
        assert_eq!(v2.product_id, "TEST-USD");
        assert_eq!(v2.exchange_name, "sim");
        assert_eq!(v2.client_server_id_map.len(), 2);
        assert!(state.v1.is_none());
    }

    #[test]
    fn test_upgrade_without_parseable_offsets() {
        let mut v1 = v1_state();
        v1.client_server_id_map.clear();
        v1.client_server_id_map
            .insert("opaque-client-id".to_string(), "srv-1".to_string());

        let mut state = LimiterState {
            v1: Some(v1),
            v2: None,
        };
        state.upgrade("/limiters/job-1");
        assert_eq!(state.v2.unwrap().client_id_offset, 0);
    }

    #[test]
    fn test_upgrade_is_idempotent() {
        let mut once = LimiterState {
            v1: Some(v1_state()),
            v2: None,
        };
        once.upgrade("/limiters/job-1");

        let mut twice = once.clone();
        twice.upgrade("/limiters/job-1");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_order_record_roundtrip() {
        let order = Order::submitted(OrderId::from("srv-1"), "client-1", Side::Sell);
        let record = OrderRecord::from(&order);
        let back = record.to_order();
        assert_eq!(back.order_id, order.order_id);
        assert_eq!(back.client_order_id, order.client_order_id);
        assert_eq!(back.side, order.side);
        assert_eq!(back.done, order.done);
    }
}
