/*
[INPUT]:  Public API exports for perpmaker-exchange crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod error;
pub mod port;
pub mod sim;
pub mod types;

// Re-export main types for convenience
pub use error::{ExchangeError, Result};
pub use port::ExchangePort;
pub use sim::PaperExchange;
pub use types::{
    AccountSnapshot, CancelOrderRequest, DepthLevel, DepthSnapshot, OpenOrder, OrderRequest,
    OrderStatus, OrderType, PositionSnapshot, Side, TickerSnapshot, TimeInForce,
    POSITION_EPSILON,
};
