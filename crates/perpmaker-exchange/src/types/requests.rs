/*
[INPUT]:  Order parameters produced by the engine
[OUTPUT]: Typed request structs sent through the exchange port
[POS]:    Data layer - outbound request definitions
[UPDATE]: When new order parameters are supported
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{OrderType, Side, TimeInForce};

/// Parameters for `ExchangePort::create_order`.
///
/// Prices are strings, already rounded to the instrument tick by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// A resting limit order at `price`.
    pub fn limit(symbol: &str, side: Side, price: String, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity: Some(quantity),
            price: Some(price),
            stop_price: None,
            reduce_only: false,
            close_position: false,
            time_in_force: None,
            client_order_id: None,
        }
    }

    /// A market order for `quantity`.
    pub fn market(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity: Some(quantity),
            price: None,
            stop_price: None,
            reduce_only: false,
            close_position: false,
            time_in_force: None,
            client_order_id: None,
        }
    }

    pub fn with_reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = Some(tif);
        self
    }

    pub fn with_client_order_id(mut self, id: String) -> Self {
        self.client_order_id = Some(id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    pub symbol: String,
    pub order_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn limit_request_serializes_wire_names() {
        let request = OrderRequest::limit(
            "BTCUSDT",
            Side::Buy,
            "99.8".to_string(),
            Decimal::from_str("0.01").unwrap(),
        )
        .with_reduce_only(true)
        .with_time_in_force(TimeInForce::Ioc);

        let value = serde_json::to_value(&request).expect("serialize request");
        assert_eq!(value["type"], "LIMIT");
        assert_eq!(value["side"], "BUY");
        assert_eq!(value["price"], "99.8");
        assert_eq!(value["reduce_only"], true);
        assert_eq!(value["time_in_force"], "IOC");
        // Unset optional fields stay off the wire.
        assert!(value.get("stop_price").is_none());
    }

    #[test]
    fn market_request_omits_price() {
        let request =
            OrderRequest::market("BTCUSDT", Side::Sell, Decimal::from_str("0.5").unwrap());
        let value = serde_json::to_value(&request).expect("serialize request");
        assert_eq!(value["type"], "MARKET");
        assert!(value.get("price").is_none());
    }
}
