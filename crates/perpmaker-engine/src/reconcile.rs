/*
[INPUT]:  Position snapshot, open orders, top-of-book/last prices
[OUTPUT]: A reduce-only close placed when a position sits unprotected
[POS]:    Reconciliation layer - orphaned-position protection
[UPDATE]: When the protection criteria or close-price selection change
*/

use perpmaker_exchange::{
    ExchangePort, OpenOrder, OrderRequest, PositionSnapshot, Side, TimeInForce,
};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::plan::price_ticks;

/// Price references for choosing the close price.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriceRefs {
    pub top_bid: Option<Decimal>,
    pub top_ask: Option<Decimal>,
    pub last_price: Option<Decimal>,
}

/// Options controlling the orphan close.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrphanCloseOpts {
    pub price_tick: Decimal,
    pub qty_step: Decimal,
    /// Force IOC on the close regardless of the per-call flag.
    pub strict_limit_only: bool,
}

/// Ensure an open position has a protective order on its closing side.
///
/// No action when the position is flat or a reduce-only/stop-like order is
/// already resting on the closing side. Otherwise a reduce-only limit is
/// placed at top-of-book (falling back to last price). Returns whether an
/// order was sent; a failed placement is logged and reported as no action so
/// the next cycle can retry.
pub async fn reconcile_orphaned_position(
    port: &dyn ExchangePort,
    symbol: &str,
    position: &PositionSnapshot,
    open_orders: &[OpenOrder],
    prices: &PriceRefs,
    opts: &OrphanCloseOpts,
    ioc: bool,
) -> bool {
    if position.is_flat() {
        return false;
    }

    let close_side = position.close_side();
    let protected = open_orders.iter().any(|order| {
        order.side == close_side
            && !order.status.is_terminal()
            && (order.reduce_only || order.is_stop_like())
    });
    if protected {
        return false;
    }

    let raw_price = match close_side {
        Side::Sell => prices.top_ask.or(prices.last_price),
        Side::Buy => prices.top_bid.or(prices.last_price),
    };
    let Some(raw_price) = raw_price else {
        warn!(symbol, "position unprotected but no price reference available");
        return false;
    };

    let price = round_close_price(close_side, raw_price, opts.price_tick);
    let qty = round_qty(position.position_amt.abs(), opts.qty_step);
    if price <= Decimal::ZERO || qty <= Decimal::ZERO {
        return false;
    }

    let mut request = OrderRequest::limit(symbol, close_side, price.normalize().to_string(), qty)
        .with_reduce_only(true);
    if ioc || opts.strict_limit_only {
        request = request.with_time_in_force(TimeInForce::Ioc);
    }

    match port.create_order(request).await {
        Ok(order) => {
            info!(
                symbol,
                side = close_side.as_str(),
                price = %price,
                qty = %qty,
                order_id = order.order_id,
                "placed protective close for orphaned position"
            );
            true
        }
        Err(err) => {
            warn!(symbol, error = %err, "protective close for orphaned position failed");
            false
        }
    }
}

fn round_close_price(side: Side, price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    // A close is the reducing side: keep the BUY-down/SELL-up convention so
    // the rounded price stays a valid tick multiple on the passive side.
    let ticks = price / tick;
    let rounded = match side {
        Side::Buy => ticks.floor(),
        Side::Sell => ticks.ceil(),
    };
    rounded * tick
}

fn round_qty(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    (qty / step).floor() * step
}

/// Quick predicate used by tests and callers to assert tick alignment.
pub fn is_tick_aligned(price: Decimal, tick: Decimal) -> bool {
    match price_ticks(price, tick) {
        Some(ticks) => {
            let reconstructed = Decimal::from(ticks) * tick;
            (reconstructed - price).abs() < tick / Decimal::from(1_000)
        }
        None => false,
    }
}
