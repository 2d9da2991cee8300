/*
[INPUT]:  Order requests from the engine + test-driven feed pushes
[OUTPUT]: Deterministic in-process venue implementing ExchangePort
[POS]:    Simulation layer - paper venue for tests and the paper-trading mode
[UPDATE]: When port semantics change or new failure injections are needed
*/

use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ExchangeError, Result};
use crate::port::ExchangePort;
use crate::types::{
    AccountSnapshot, CancelOrderRequest, DepthLevel, DepthSnapshot, OpenOrder, OrderRequest,
    OrderStatus, OrderType, PositionSnapshot, Side, TickerSnapshot,
};

#[derive(Debug, Default)]
struct Inner {
    open_orders: Vec<OpenOrder>,
    position_amt: Decimal,
    entry_price: Decimal,
    mark_price: Option<Decimal>,
    next_order_id: i64,
    clock_ms: i64,
    fail_next_place: Option<ExchangeError>,
    fail_next_cancel: Option<ExchangeError>,
    placed: Vec<OrderRequest>,
    canceled: Vec<i64>,
    cancel_all_calls: u32,
}

/// Deterministic paper venue.
///
/// Market orders fill immediately against the position; limit and stop orders
/// rest until `fill_order` or a cancel. Feeds are pushed explicitly, which
/// keeps ordering under test control.
#[derive(Debug)]
pub struct PaperExchange {
    symbol: String,
    inner: Mutex<Inner>,
    account_tx: watch::Sender<Option<AccountSnapshot>>,
    orders_tx: watch::Sender<Option<Vec<OpenOrder>>>,
    depth_tx: watch::Sender<Option<DepthSnapshot>>,
    ticker_tx: watch::Sender<Option<TickerSnapshot>>,
}

impl PaperExchange {
    pub fn new(symbol: &str) -> Self {
        let (account_tx, _) = watch::channel(None);
        let (orders_tx, _) = watch::channel(None);
        let (depth_tx, _) = watch::channel(None);
        let (ticker_tx, _) = watch::channel(None);

        Self {
            symbol: symbol.to_string(),
            inner: Mutex::new(Inner { next_order_id: 1, ..Inner::default() }),
            account_tx,
            orders_tx,
            depth_tx,
            ticker_tx,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Push a depth snapshot. Levels are (price, qty), best first.
    pub fn push_depth(&self, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) {
        let snapshot = DepthSnapshot {
            symbol: self.symbol.clone(),
            bids: bids.into_iter().map(|(p, q)| DepthLevel(p, q)).collect(),
            asks: asks.into_iter().map(|(p, q)| DepthLevel(p, q)).collect(),
        };
        let _ = self.depth_tx.send(Some(snapshot));
    }

    pub fn push_ticker(&self, last_price: Decimal) {
        let _ = self.ticker_tx.send(Some(TickerSnapshot {
            symbol: self.symbol.clone(),
            last_price,
        }));
    }

    /// Set the net position and broadcast the account snapshot it implies.
    pub fn set_position(&self, position_amt: Decimal, entry_price: Decimal, mark_price: Option<Decimal>) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("paper exchange lock");
            inner.position_amt = position_amt;
            inner.entry_price = entry_price;
            inner.mark_price = mark_price;
            account_snapshot(&self.symbol, &inner)
        };
        let _ = self.account_tx.send(Some(snapshot));
    }

    /// Broadcast the account snapshot implied by the current sim state.
    pub fn publish_account(&self) {
        let snapshot = {
            let inner = self.inner.lock().expect("paper exchange lock");
            account_snapshot(&self.symbol, &inner)
        };
        let _ = self.account_tx.send(Some(snapshot));
    }

    /// Broadcast the current open-order list without mutating it.
    pub fn publish_open_orders(&self) {
        let orders = self.inner.lock().expect("paper exchange lock").open_orders.clone();
        let _ = self.orders_tx.send(Some(orders));
    }

    /// Seed a resting order as if it predated the session.
    pub fn seed_open_order(&self, order: OpenOrder) {
        let orders = {
            let mut inner = self.inner.lock().expect("paper exchange lock");
            inner.next_order_id = inner.next_order_id.max(order.order_id + 1);
            inner.open_orders.push(order);
            inner.open_orders.clone()
        };
        let _ = self.orders_tx.send(Some(orders));
    }

    /// Fill a resting order (fully when `qty` covers the remainder).
    pub fn fill_order(&self, order_id: i64, qty: Decimal) {
        let (orders, account) = {
            let mut inner = self.inner.lock().expect("paper exchange lock");
            inner.clock_ms += 1;
            let now = inner.clock_ms;

            let Some(order) = inner.open_orders.iter_mut().find(|o| o.order_id == order_id) else {
                return;
            };

            order.executed_qty = (order.executed_qty + qty).min(order.orig_qty);
            order.update_time = now;
            order.status = if order.executed_qty >= order.orig_qty {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };

            let signed = match order.side {
                Side::Buy => qty,
                Side::Sell => -qty,
            };
            let fill_price = order.price;
            apply_fill(&mut inner, signed, fill_price);

            inner.open_orders.retain(|o| !o.status.is_terminal());
            (inner.open_orders.clone(), account_snapshot(&self.symbol, &inner))
        };
        let _ = self.orders_tx.send(Some(orders));
        let _ = self.account_tx.send(Some(account));
    }

    pub fn fail_next_place(&self, error: ExchangeError) {
        self.inner.lock().expect("paper exchange lock").fail_next_place = Some(error);
    }

    pub fn fail_next_cancel(&self, error: ExchangeError) {
        self.inner.lock().expect("paper exchange lock").fail_next_cancel = Some(error);
    }

    pub fn placed_requests(&self) -> Vec<OrderRequest> {
        self.inner.lock().expect("paper exchange lock").placed.clone()
    }

    pub fn canceled_ids(&self) -> Vec<i64> {
        self.inner.lock().expect("paper exchange lock").canceled.clone()
    }

    pub fn cancel_all_calls(&self) -> u32 {
        self.inner.lock().expect("paper exchange lock").cancel_all_calls
    }

    pub fn open_orders(&self) -> Vec<OpenOrder> {
        self.inner.lock().expect("paper exchange lock").open_orders.clone()
    }

    pub fn position_amt(&self) -> Decimal {
        self.inner.lock().expect("paper exchange lock").position_amt
    }
}

#[async_trait]
impl ExchangePort for PaperExchange {
    fn watch_account(&self) -> watch::Receiver<Option<AccountSnapshot>> {
        self.account_tx.subscribe()
    }

    fn watch_orders(&self) -> watch::Receiver<Option<Vec<OpenOrder>>> {
        self.orders_tx.subscribe()
    }

    fn watch_depth(&self) -> watch::Receiver<Option<DepthSnapshot>> {
        self.depth_tx.subscribe()
    }

    fn watch_ticker(&self) -> watch::Receiver<Option<TickerSnapshot>> {
        self.ticker_tx.subscribe()
    }

    async fn create_order(&self, request: OrderRequest) -> Result<OpenOrder> {
        let (order, orders, account) = {
            let mut inner = self.inner.lock().expect("paper exchange lock");

            if let Some(error) = inner.fail_next_place.take() {
                return Err(error);
            }

            // Only immediate executions enforce reduce-only here; resting
            // reduce-only orders are accepted and clamped by the venue later.
            if request.order_type == OrderType::Market
                && request.reduce_only
                && !reduces_position(inner.position_amt, request.side)
            {
                return Err(ExchangeError::Rejected {
                    reason: "reduce-only order would not reduce position".to_string(),
                });
            }

            let qty = request.quantity.unwrap_or(Decimal::ZERO);
            if qty <= Decimal::ZERO {
                return Err(ExchangeError::Rejected { reason: "quantity must be positive".to_string() });
            }

            let price = parse_price(request.price.as_deref())?;
            let stop_price = parse_price(request.stop_price.as_deref())?;

            inner.clock_ms += 1;
            let now = inner.clock_ms;
            let order_id = inner.next_order_id;
            inner.next_order_id += 1;
            inner.placed.push(request.clone());

            let mut order = OpenOrder {
                order_id,
                client_order_id: request
                    .client_order_id
                    .clone()
                    .unwrap_or_else(|| format!("paper-{}", Uuid::new_v4())),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                status: OrderStatus::New,
                price,
                orig_qty: qty,
                executed_qty: Decimal::ZERO,
                stop_price,
                reduce_only: request.reduce_only,
                close_position: request.close_position,
                update_time: now,
                time: now,
            };

            let mut account = None;
            if request.order_type == OrderType::Market {
                let mark = inner.mark_price.unwrap_or(inner.entry_price);
                let fill_qty = if request.reduce_only {
                    qty.min(inner.position_amt.abs())
                } else {
                    qty
                };
                let signed = match request.side {
                    Side::Buy => fill_qty,
                    Side::Sell => -fill_qty,
                };
                apply_fill(&mut inner, signed, mark);
                order.executed_qty = fill_qty;
                order.status = OrderStatus::Filled;
                account = Some(account_snapshot(&self.symbol, &inner));
            } else {
                inner.open_orders.push(order.clone());
            }

            debug!(
                symbol = %self.symbol,
                order_id,
                side = %request.side.as_str(),
                order_type = ?request.order_type,
                "paper order accepted"
            );

            (order, inner.open_orders.clone(), account)
        };

        let _ = self.orders_tx.send(Some(orders));
        if let Some(snapshot) = account {
            let _ = self.account_tx.send(Some(snapshot));
        }
        Ok(order)
    }

    async fn cancel_order(&self, request: CancelOrderRequest) -> Result<()> {
        let orders = {
            let mut inner = self.inner.lock().expect("paper exchange lock");

            if let Some(error) = inner.fail_next_cancel.take() {
                return Err(error);
            }

            let before = inner.open_orders.len();
            inner.open_orders.retain(|o| o.order_id != request.order_id);
            if inner.open_orders.len() == before {
                return Err(ExchangeError::UnknownOrder { order_id: request.order_id });
            }
            inner.canceled.push(request.order_id);
            inner.open_orders.clone()
        };
        let _ = self.orders_tx.send(Some(orders));
        Ok(())
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> Result<()> {
        let orders = {
            let mut inner = self.inner.lock().expect("paper exchange lock");
            inner.cancel_all_calls += 1;
            inner.open_orders.clear();
            inner.open_orders.clone()
        };
        let _ = self.orders_tx.send(Some(orders));
        Ok(())
    }
}

fn reduces_position(position_amt: Decimal, side: Side) -> bool {
    match side {
        Side::Sell => position_amt > Decimal::ZERO,
        Side::Buy => position_amt < Decimal::ZERO,
    }
}

fn parse_price(raw: Option<&str>) -> Result<Decimal> {
    match raw {
        None => Ok(Decimal::ZERO),
        Some(s) => s
            .parse::<Decimal>()
            .map_err(|_| ExchangeError::Rejected { reason: format!("invalid price: {s}") }),
    }
}

fn apply_fill(inner: &mut Inner, signed_qty: Decimal, price: Decimal) {
    let prev = inner.position_amt;
    let next = prev + signed_qty;

    // Entry price tracks the volume-weighted open side; a flip restarts it.
    if prev.is_zero() || prev.signum() == signed_qty.signum() {
        let prev_abs = prev.abs();
        let add_abs = signed_qty.abs();
        let total = prev_abs + add_abs;
        if !total.is_zero() {
            inner.entry_price = (inner.entry_price * prev_abs + price * add_abs) / total;
        }
    } else if next.signum() != prev.signum() && !next.is_zero() {
        inner.entry_price = price;
    }

    inner.position_amt = next;
    if inner.position_amt.is_zero() {
        inner.entry_price = Decimal::ZERO;
    }
}

fn account_snapshot(symbol: &str, inner: &Inner) -> AccountSnapshot {
    let unrealized = match inner.mark_price {
        Some(mark) if !inner.position_amt.is_zero() => {
            (mark - inner.entry_price) * inner.position_amt
        }
        _ => Decimal::ZERO,
    };

    AccountSnapshot {
        total_unrealized_profit: unrealized,
        positions: vec![PositionSnapshot {
            symbol: symbol.to_string(),
            position_amt: inner.position_amt,
            entry_price: inner.entry_price,
            mark_price: inner.mark_price,
            unrealized_profit: unrealized,
        }],
    }
}
