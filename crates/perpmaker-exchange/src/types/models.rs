/*
[INPUT]:  Venue snapshot schemas (account, orders, depth, ticker) and serde requirements
[OUTPUT]: Typed Rust structs with serialization support
[POS]:    Data layer - feed snapshot and open-order models
[UPDATE]: When snapshot schemas change or new fields are added
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{OrderStatus, OrderType, Side};

/// Positions smaller than this are treated as flat.
pub const POSITION_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 5);

/// Net position for one symbol as reported by the account feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    /// Signed quantity. Long > 0, short < 0.
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub mark_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub unrealized_profit: Decimal,
}

impl PositionSnapshot {
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            position_amt: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            mark_price: None,
            unrealized_profit: Decimal::ZERO,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.position_amt.abs() < POSITION_EPSILON
    }

    /// Side that reduces this position. Meaningless when flat.
    pub fn close_side(&self) -> Side {
        if self.position_amt > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    #[serde(with = "rust_decimal::serde::str")]
    pub total_unrealized_profit: Decimal,
    pub positions: Vec<PositionSnapshot>,
}

impl AccountSnapshot {
    pub fn position_for(&self, symbol: &str) -> Option<&PositionSnapshot> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }
}

/// A resting order as reported by the orders feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub stop_price: Decimal,
    pub reduce_only: bool,
    pub close_position: bool,
    pub update_time: i64,
    pub time: i64,
}

impl OpenOrder {
    /// Stop-like iff the trigger is set or the type is STOP-family.
    pub fn is_stop_like(&self) -> bool {
        self.stop_price > Decimal::ZERO || self.order_type.is_stop_family()
    }

    /// Quantity still resting on the book.
    pub fn remaining_qty(&self) -> Decimal {
        if self.executed_qty >= self.orig_qty {
            Decimal::ZERO
        } else {
            self.orig_qty - self.executed_qty
        }
    }
}

/// One price level: (price, quantity).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel(
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
);

/// Order-book snapshot. Top-of-book is guaranteed valid by the port: bids
/// descending, asks ascending, both non-empty when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|level| level.0)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|level| level.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
}
