/*
[INPUT]:  Failure modes of port operations and engine-side guards
[OUTPUT]: Closed error taxonomy with classifier helpers
[POS]:    Error handling layer - unified error type for port and engine
[UPDATE]: When adding new failure modes or classifiers
*/

use rust_decimal::Decimal;
use thiserror::Error;

/// Closed error taxonomy shared by the exchange port and the engine core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    /// The venue does not know the order (already gone or never existed).
    #[error("unknown order: {order_id}")]
    UnknownOrder { order_id: i64 },

    /// Margin or balance too low to accept the order.
    #[error("insufficient balance: {message}")]
    InsufficientBalance { message: String },

    /// The venue rate-limited the request.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    /// A close price drifted too far from mark and was refused locally.
    #[error("price {price} beyond slippage guard against mark {mark_price}")]
    PriceGuard { price: Decimal, mark_price: Decimal },

    /// Network-level failure; the remote state of the request is unknown.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The venue rejected the order outright.
    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    /// A local invariant was violated.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ExchangeError {
    pub fn is_unknown_order(&self) -> bool {
        matches!(self, ExchangeError::UnknownOrder { .. })
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ExchangeError::RateLimit { .. })
    }

    pub fn is_insufficient_balance(&self) -> bool {
        matches!(self, ExchangeError::InsufficientBalance { .. })
    }

    pub fn is_price_guard(&self) -> bool {
        matches!(self, ExchangeError::PriceGuard { .. })
    }

    /// Errors worth retrying on a later cycle without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimit { .. }
                | ExchangeError::Transport(_)
                | ExchangeError::InsufficientBalance { .. }
        )
    }
}

/// Result type alias for port operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;
