//! Price points and order sides.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from point validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PointError {
    /// Size must be a positive decimal.
    #[error("point size {0} is not positive")]
    InvalidSize(Decimal),

    /// Price must be a positive decimal.
    #[error("point price {0} is not positive")]
    InvalidPrice(Decimal),

    /// Cancel threshold must be a positive decimal.
    #[error("point cancel price {0} is not positive")]
    InvalidCancel(Decimal),

    /// Price and cancel threshold must differ (they determine the side).
    #[error("point price and cancel price are both {0}")]
    NoSide(Decimal),
}

/// An immutable limit-order intent.
///
/// A point describes one limit order the engine should keep alive near
/// `price` for `size` units. The order is withdrawn whenever the ticker
/// crosses `cancel` and recreated when it comes back. The side is derived:
/// a buy approaches its price from above (`cancel > price`), a sell from
/// below (`cancel < price`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub size: Decimal,
    pub price: Decimal,
    pub cancel: Decimal,
}

impl Point {
    /// Create a validated point.
    pub fn new(size: Decimal, price: Decimal, cancel: Decimal) -> Result<Self, PointError> {
        let p = Self {
            size,
            price,
            cancel,
        };
        p.check()?;
        Ok(p)
    }

    /// Validate the point fields.
    pub fn check(&self) -> Result<(), PointError> {
        if self.size <= Decimal::ZERO {
            return Err(PointError::InvalidSize(self.size));
        }
        if self.price <= Decimal::ZERO {
            return Err(PointError::InvalidPrice(self.price));
        }
        if self.cancel <= Decimal::ZERO {
            return Err(PointError::InvalidCancel(self.cancel));
        }
        if self.price == self.cancel {
            return Err(PointError::NoSide(self.price));
        }
        Ok(())
    }

    /// Side derived from the price/cancel ordering.
    pub fn side(&self) -> Side {
        if self.cancel > self.price {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn is_buy(&self) -> bool {
        self.side() == Side::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.side() == Side::Sell
    }

    /// Quote value of the full point (`size * price`).
    pub fn value(&self) -> Decimal {
        self.size * self.price
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}/{}]", self.size, self.price, self.cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_buy_side() {
        let p = Point::new(dec!(1), dec!(100), dec!(105)).unwrap();
        assert_eq!(p.side(), Side::Buy);
        assert!(p.is_buy());
        assert!(!p.is_sell());
    }

    #[test]
    fn test_sell_side() {
        let p = Point::new(dec!(1), dec!(100), dec!(95)).unwrap();
        assert_eq!(p.side(), Side::Sell);
        assert!(p.is_sell());
    }

    #[test]
    fn test_rejects_non_positive_fields() {
        assert_eq!(
            Point::new(dec!(0), dec!(100), dec!(95)),
            Err(PointError::InvalidSize(dec!(0)))
        );
        assert_eq!(
            Point::new(dec!(1), dec!(-100), dec!(95)),
            Err(PointError::InvalidPrice(dec!(-100)))
        );
        assert_eq!(
            Point::new(dec!(1), dec!(100), dec!(0)),
            Err(PointError::InvalidCancel(dec!(0)))
        );
    }

    #[test]
    fn test_rejects_equal_price_and_cancel() {
        assert_eq!(
            Point::new(dec!(1), dec!(100), dec!(100)),
            Err(PointError::NoSide(dec!(100)))
        );
    }

    #[test]
    fn test_value() {
        let p = Point::new(dec!(2), dec!(50), dec!(55)).unwrap();
        assert_eq!(p.value(), dec!(100));
    }

    #[test]
    fn test_display() {
        let p = Point::new(dec!(1.5), dec!(100), dec!(95)).unwrap();
        assert_eq!(p.to_string(), "[1.5@100/95]");
    }

    #[test]
    fn test_side_roundtrip() {
        assert_eq!(Side::from_str_opt("BUY"), Some(Side::Buy));
        assert_eq!(Side::from_str_opt("SELL"), Some(Side::Sell));
        assert_eq!(Side::from_str_opt("HOLD"), None);
        assert_eq!(Side::Buy.as_str(), "BUY");
    }

    #[test]
    fn test_serde_roundtrip() {
        let p = Point::new(dec!(1), dec!(100), dec!(95)).unwrap();
        let encoded = serde_json::to_string(&p).unwrap();
        let decoded: Point = serde_json::from_str(&encoded).unwrap();
        assert_eq!(p, decoded);
    }
}
