/*
[INPUT]:  Submodule definitions
[OUTPUT]: Public type exports
[POS]:    Data layer - module organization
[UPDATE]: When adding new type modules
*/

pub mod enums;
pub mod models;
pub mod requests;

pub use enums::{OrderStatus, OrderType, Side, TimeInForce};
pub use models::{
    AccountSnapshot, DepthLevel, DepthSnapshot, OpenOrder, PositionSnapshot, TickerSnapshot,
    POSITION_EPSILON,
};
pub use requests::{CancelOrderRequest, OrderRequest};
