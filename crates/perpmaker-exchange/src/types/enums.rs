/*
[INPUT]:  Venue order schema and serde requirements
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - type definitions shared across port implementations
[UPDATE]: When the venue order schema changes or new types are added
*/

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    StopLimit,
    TrailingStopMarket,
}

impl OrderType {
    /// STOP-family types. Orders of these types are stop-like regardless of
    /// their trigger price.
    pub fn is_stop_family(self) -> bool {
        matches!(
            self,
            OrderType::StopMarket | OrderType::StopLimit | OrderType::TrailingStopMarket
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    #[serde(rename = "GTX")]
    PostOnly,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OrderType::Limit, "\"LIMIT\"")]
    #[case(OrderType::Market, "\"MARKET\"")]
    #[case(OrderType::StopMarket, "\"STOP_MARKET\"")]
    #[case(OrderType::StopLimit, "\"STOP_LIMIT\"")]
    #[case(OrderType::TrailingStopMarket, "\"TRAILING_STOP_MARKET\"")]
    fn order_type_wire_names(#[case] order_type: OrderType, #[case] wire: &str) {
        assert_eq!(serde_json::to_string(&order_type).unwrap(), wire);
        assert_eq!(serde_json::from_str::<OrderType>(wire).unwrap(), order_type);
    }

    #[test]
    fn side_opposite_flips() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn stop_family_covers_all_stop_types() {
        assert!(OrderType::StopMarket.is_stop_family());
        assert!(OrderType::StopLimit.is_stop_family());
        assert!(OrderType::TrailingStopMarket.is_stop_family());
        assert!(!OrderType::Limit.is_stop_family());
        assert!(!OrderType::Market.is_stop_family());
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
