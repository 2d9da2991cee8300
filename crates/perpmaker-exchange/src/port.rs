/*
[INPUT]:  Feed subscriptions and order operations required by the engine
[OUTPUT]: ExchangePort capability trait
[POS]:    Port layer - boundary between the engine core and venue adapters
[UPDATE]: When the engine needs new venue capabilities
*/

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::types::{
    AccountSnapshot, CancelOrderRequest, DepthSnapshot, OpenOrder, OrderRequest, TickerSnapshot,
};

/// Capability interface a venue adapter must provide.
///
/// Feeds are latest-value `watch` channels created once per port instance;
/// `None` means the feed has not delivered yet. The orders feed always carries
/// the full open-order list for the port's symbol, never a delta. A port is
/// scoped to a single symbol.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    fn watch_account(&self) -> watch::Receiver<Option<AccountSnapshot>>;

    fn watch_orders(&self) -> watch::Receiver<Option<Vec<OpenOrder>>>;

    fn watch_depth(&self) -> watch::Receiver<Option<DepthSnapshot>>;

    fn watch_ticker(&self) -> watch::Receiver<Option<TickerSnapshot>>;

    async fn create_order(&self, request: OrderRequest) -> Result<OpenOrder>;

    async fn cancel_order(&self, request: CancelOrderRequest) -> Result<()>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    /// Whether the venue accepts TRAILING_STOP_MARKET orders. Venues without
    /// them get plain stop orders instead.
    fn supports_trailing_stops(&self) -> bool {
        false
    }
}
