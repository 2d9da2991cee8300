/*
[INPUT]:  Place/cancel intents from the engine, fresh orders snapshots
[OUTPUT]: Guarded port calls with at-most-one in-flight operation per slot
[POS]:    Execution layer - order lifecycle coordination
[UPDATE]: When slot semantics, guards, or precision rules change
*/

use std::time::{Duration, Instant};

use perpmaker_exchange::{
    CancelOrderRequest, ExchangeError, ExchangePort, OpenOrder, OrderRequest, OrderType, Result,
    Side, TimeInForce,
};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::stops::is_valid_stop;

/// Logical operation slots. Entries, reduce-only closes, and protective stops
/// never share an in-flight window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSlot {
    Entry,
    Close,
    Stop,
}

impl OrderSlot {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            OrderSlot::Entry => 0,
            OrderSlot::Close => 1,
            OrderSlot::Stop => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSlot::Entry => "entry",
            OrderSlot::Close => "close",
            OrderSlot::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    locked: bool,
    deadline: Option<Instant>,
    pending_order_id: Option<i64>,
}

/// Serializes order operations per slot and wraps every placement with the
/// slippage and precision guards.
///
/// A slot stays locked from the moment a place request is sent until the
/// resulting order id shows up in a fresh orders snapshot, or until the
/// deadline expires (lost response). Cancels and market orders complete with
/// their response and release the slot immediately.
#[derive(Debug)]
pub struct OrderCoordinator {
    symbol: String,
    price_tick: Decimal,
    qty_step: Decimal,
    max_close_slippage_pct: Decimal,
    lock_timeout: Duration,
    slots: [SlotState; OrderSlot::COUNT],
}

impl OrderCoordinator {
    pub fn new(
        symbol: &str,
        price_tick: Decimal,
        qty_step: Decimal,
        max_close_slippage_pct: Decimal,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            price_tick,
            qty_step,
            max_close_slippage_pct,
            lock_timeout,
            slots: [SlotState::default(); OrderSlot::COUNT],
        }
    }

    pub fn is_locked(&self, slot: OrderSlot) -> bool {
        self.slots[slot.index()].locked
    }

    /// Manual lock release for callers that know the operation is settled.
    pub fn unlock_operating(&mut self, slot: OrderSlot) {
        self.slots[slot.index()] = SlotState::default();
    }

    /// Reconcile slot state against a fresh orders snapshot. A pending order
    /// that is visible (or already gone) has completed its round trip; an
    /// expired deadline clears a lock whose response was lost.
    pub fn observe_open_orders(&mut self, now: Instant, open_orders: &[OpenOrder]) {
        for slot in [OrderSlot::Entry, OrderSlot::Close, OrderSlot::Stop] {
            let state = &mut self.slots[slot.index()];
            if !state.locked {
                continue;
            }

            if let Some(pending) = state.pending_order_id {
                // Present in the snapshot means acknowledged; absent means it
                // already went terminal and was dropped. Either way the
                // placement round trip is settled.
                let still_live = open_orders
                    .iter()
                    .any(|o| o.order_id == pending && !o.status.is_terminal());
                if still_live {
                    debug!(symbol = %self.symbol, slot = slot.as_str(), pending, "pending order acknowledged");
                }
                *state = SlotState::default();
                continue;
            }

            if let Some(deadline) = state.deadline
                && now >= deadline
            {
                warn!(symbol = %self.symbol, slot = slot.as_str(), "slot lock expired without observation");
                *state = SlotState::default();
            }
        }
    }

    /// Round a price to tick toward the book-favourable side.
    pub fn round_price(&self, side: Side, price: Decimal) -> Decimal {
        let ticks = price / self.price_tick;
        let rounded = match side {
            Side::Buy => ticks.floor(),
            Side::Sell => ticks.ceil(),
        };
        rounded * self.price_tick
    }

    /// Round a quantity down to step.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        if qty <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (qty / self.qty_step).floor() * self.qty_step
    }

    pub fn format_price(&self, price: Decimal) -> String {
        price.normalize().to_string()
    }

    /// Place a resting limit order. Returns Ok(None) when the slot is busy or
    /// the rounded quantity vanishes.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &mut self,
        port: &dyn ExchangePort,
        side: Side,
        price: Decimal,
        qty: Decimal,
        reduce_only: bool,
        time_in_force: Option<TimeInForce>,
        mark_price: Option<Decimal>,
        top_of_book: Option<(Decimal, Decimal)>,
        now: Instant,
    ) -> Result<Option<OpenOrder>> {
        let price = self.round_price(side, price);
        let qty = self.round_qty(qty);
        if qty <= Decimal::ZERO {
            debug!(symbol = %self.symbol, "quantity rounds to zero; skipping place");
            return Ok(None);
        }

        if reduce_only {
            self.guard_close_price(price, mark_price)?;
        } else {
            self.guard_entry_price(side, price, top_of_book)?;
        }

        let slot = if reduce_only { OrderSlot::Close } else { OrderSlot::Entry };
        if !self.try_lock(slot, now) {
            debug!(symbol = %self.symbol, slot = slot.as_str(), "slot busy; skipping place");
            return Ok(None);
        }

        let mut request = OrderRequest::limit(&self.symbol, side, self.format_price(price), qty)
            .with_reduce_only(reduce_only)
            .with_client_order_id(self.client_order_id(slot));
        if let Some(tif) = time_in_force {
            request = request.with_time_in_force(tif);
        }

        self.send_place(port, slot, request).await
    }

    /// Place the protective stop for an open position. The trigger must sit a
    /// tick beyond last price or the request is skipped.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_stop_loss(
        &mut self,
        port: &dyn ExchangePort,
        close_side: Side,
        stop_price: Decimal,
        qty: Decimal,
        last_price: Decimal,
        exact_limit_at_stop: bool,
        now: Instant,
    ) -> Result<Option<OpenOrder>> {
        let stop_price = self.round_price(close_side, stop_price);
        let qty = self.round_qty(qty);
        if qty <= Decimal::ZERO {
            return Ok(None);
        }

        if !is_valid_stop(close_side, stop_price, last_price, self.price_tick) {
            warn!(
                symbol = %self.symbol,
                stop = %stop_price,
                last = %last_price,
                "stop trigger on wrong side of last price; skipping"
            );
            return Ok(None);
        }

        if !self.try_lock(OrderSlot::Stop, now) {
            debug!(symbol = %self.symbol, slot = "stop", "slot busy; skipping stop place");
            return Ok(None);
        }

        let order_type = if port.supports_trailing_stops() {
            OrderType::TrailingStopMarket
        } else if exact_limit_at_stop {
            OrderType::StopLimit
        } else {
            OrderType::StopMarket
        };

        let stop_str = self.format_price(stop_price);
        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: close_side,
            order_type,
            quantity: Some(qty),
            price: (order_type == OrderType::StopLimit).then(|| stop_str.clone()),
            stop_price: Some(stop_str),
            reduce_only: true,
            close_position: false,
            time_in_force: None,
            client_order_id: Some(self.client_order_id(OrderSlot::Stop)),
        };

        self.send_place(port, OrderSlot::Stop, request).await
    }

    /// Stop-limit pinned to the opposite top of book, placed right after a
    /// top-of-book entry so a fill is never left unprotected.
    pub async fn place_preemptive_stop_limit(
        &mut self,
        port: &dyn ExchangePort,
        close_side: Side,
        trigger_price: Decimal,
        qty: Decimal,
        now: Instant,
    ) -> Result<Option<OpenOrder>> {
        let trigger = self.round_price(close_side, trigger_price);
        let qty = self.round_qty(qty);
        if qty <= Decimal::ZERO || trigger <= Decimal::ZERO {
            return Ok(None);
        }

        if !self.try_lock(OrderSlot::Stop, now) {
            return Ok(None);
        }

        let trigger_str = self.format_price(trigger);
        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: close_side,
            order_type: OrderType::StopLimit,
            quantity: Some(qty),
            price: Some(trigger_str.clone()),
            stop_price: Some(trigger_str),
            reduce_only: true,
            close_position: false,
            time_in_force: None,
            client_order_id: Some(self.client_order_id(OrderSlot::Stop)),
        };

        self.send_place(port, OrderSlot::Stop, request).await
    }

    /// Immediate reduce-only market close, guarded against closing into a
    /// dislocated print.
    pub async fn market_close(
        &mut self,
        port: &dyn ExchangePort,
        side: Side,
        qty: Decimal,
        last_price: Option<Decimal>,
        mark_price: Option<Decimal>,
        now: Instant,
    ) -> Result<Option<OpenOrder>> {
        let qty = self.round_qty(qty);
        if qty <= Decimal::ZERO {
            return Ok(None);
        }

        if let (Some(last), Some(mark)) = (last_price, mark_price) {
            self.guard_close_price(last, Some(mark))?;
        }

        if !self.try_lock(OrderSlot::Close, now) {
            debug!(symbol = %self.symbol, slot = "close", "slot busy; skipping market close");
            return Ok(None);
        }

        let request = OrderRequest::market(&self.symbol, side, qty)
            .with_reduce_only(true)
            .with_client_order_id(self.client_order_id(OrderSlot::Close));

        let result = port.create_order(request).await;
        // Market orders settle with the response; no pending id to track.
        self.unlock_operating(OrderSlot::Close);
        result.map(Some)
    }

    /// Cancel one order. Unknown-order is idempotent success. Returns
    /// Ok(false) when the slot is busy and the cancel was not attempted.
    pub async fn cancel_order(
        &mut self,
        port: &dyn ExchangePort,
        slot: OrderSlot,
        order_id: i64,
        now: Instant,
    ) -> Result<bool> {
        if !self.try_lock(slot, now) {
            debug!(symbol = %self.symbol, slot = slot.as_str(), order_id, "slot busy; skipping cancel");
            return Ok(false);
        }

        let result = port
            .cancel_order(CancelOrderRequest { symbol: self.symbol.clone(), order_id })
            .await;
        self.unlock_operating(slot);

        match result {
            Ok(()) => Ok(true),
            Err(err) if err.is_unknown_order() => {
                debug!(symbol = %self.symbol, order_id, "cancel for unknown order; treated as done");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel everything resting on the symbol and reset all slots.
    pub async fn cancel_all(&mut self, port: &dyn ExchangePort) -> Result<()> {
        let result = port.cancel_all_orders(&self.symbol).await;
        for slot in [OrderSlot::Entry, OrderSlot::Close, OrderSlot::Stop] {
            self.unlock_operating(slot);
        }
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_unknown_order() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn try_lock(&mut self, slot: OrderSlot, now: Instant) -> bool {
        let state = &mut self.slots[slot.index()];
        if state.locked {
            // A stale deadline means the response was lost; reclaim the slot.
            match state.deadline {
                Some(deadline) if now >= deadline => {}
                _ => return false,
            }
        }
        *state = SlotState {
            locked: true,
            deadline: Some(now + self.lock_timeout),
            pending_order_id: None,
        };
        true
    }

    async fn send_place(
        &mut self,
        port: &dyn ExchangePort,
        slot: OrderSlot,
        request: OrderRequest,
    ) -> Result<Option<OpenOrder>> {
        match port.create_order(request).await {
            Ok(order) => {
                self.slots[slot.index()].pending_order_id = Some(order.order_id);
                Ok(Some(order))
            }
            Err(err) => {
                self.unlock_operating(slot);
                Err(err)
            }
        }
    }

    fn guard_close_price(&self, price: Decimal, mark_price: Option<Decimal>) -> Result<()> {
        let Some(mark) = mark_price else {
            // Without a mark there is nothing to compare against.
            return Ok(());
        };
        if mark <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(ExchangeError::PriceGuard { price, mark_price: mark });
        }
        let slippage = (price - mark).abs() / mark;
        if slippage > self.max_close_slippage_pct {
            return Err(ExchangeError::PriceGuard { price, mark_price: mark });
        }
        Ok(())
    }

    fn guard_entry_price(
        &self,
        side: Side,
        price: Decimal,
        top_of_book: Option<(Decimal, Decimal)>,
    ) -> Result<()> {
        if price <= Decimal::ZERO {
            return Err(ExchangeError::PriceGuard { price, mark_price: Decimal::ZERO });
        }
        if let Some((bid, ask)) = top_of_book {
            // An entry crossing the far side of the book is a mis-derived quote.
            let crossed = match side {
                Side::Buy => price > ask,
                Side::Sell => price < bid,
            };
            if crossed {
                let reference = match side {
                    Side::Buy => ask,
                    Side::Sell => bid,
                };
                return Err(ExchangeError::PriceGuard { price, mark_price: reference });
            }
        }
        Ok(())
    }

    fn client_order_id(&self, slot: OrderSlot) -> String {
        format!("pm:{}:{}:{}", self.symbol, slot.as_str(), Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpmaker_exchange::{OrderStatus, PaperExchange};
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn coordinator() -> OrderCoordinator {
        OrderCoordinator::new(
            "BTCUSDT",
            dec("0.1"),
            dec("0.001"),
            dec("0.05"),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn price_rounds_toward_book_favourable_side() {
        let coord = coordinator();
        assert_eq!(coord.round_price(Side::Buy, dec("99.97")), dec("99.9"));
        assert_eq!(coord.round_price(Side::Sell, dec("100.01")), dec("100.1"));
        assert_eq!(coord.round_price(Side::Buy, dec("99.9")), dec("99.9"));
    }

    #[test]
    fn qty_rounds_down_to_step() {
        let coord = coordinator();
        assert_eq!(coord.round_qty(dec("0.0129")), dec("0.012"));
        assert_eq!(coord.round_qty(dec("0.0005")), dec("0.000"));
    }

    #[tokio::test]
    async fn place_locks_slot_until_observed() {
        let venue = PaperExchange::new("BTCUSDT");
        let mut coord = coordinator();
        let now = Instant::now();

        let placed = coord
            .place_order(&venue, Side::Buy, dec("99.9"), dec("0.01"), false, None, None, None, now)
            .await
            .unwrap()
            .expect("order placed");
        assert!(coord.is_locked(OrderSlot::Entry));

        // Second entry while in flight is skipped.
        let second = coord
            .place_order(&venue, Side::Sell, dec("100.1"), dec("0.01"), false, None, None, None, now)
            .await
            .unwrap();
        assert!(second.is_none());

        // Observation of the pending id releases the slot.
        coord.observe_open_orders(now, &venue.open_orders());
        assert!(!coord.is_locked(OrderSlot::Entry));
        assert_eq!(venue.open_orders()[0].order_id, placed.order_id);
    }

    #[tokio::test]
    async fn lock_expires_on_deadline() {
        let venue = PaperExchange::new("BTCUSDT");
        let mut coord = coordinator();
        let now = Instant::now();

        coord
            .place_order(&venue, Side::Buy, dec("99.9"), dec("0.01"), false, None, None, None, now)
            .await
            .unwrap();
        assert!(coord.is_locked(OrderSlot::Entry));

        // No snapshot ever observed; the deadline reclaims the slot.
        let later = now + Duration::from_secs(3);
        coord.observe_open_orders(later, &[]);
        assert!(!coord.is_locked(OrderSlot::Entry));
    }

    #[tokio::test]
    async fn failed_place_releases_lock() {
        let venue = PaperExchange::new("BTCUSDT");
        venue.fail_next_place(ExchangeError::Transport("reset".to_string()));
        let mut coord = coordinator();

        let err = coord
            .place_order(
                &venue,
                Side::Buy,
                dec("99.9"),
                dec("0.01"),
                false,
                None,
                None,
                None,
                Instant::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));
        assert!(!coord.is_locked(OrderSlot::Entry));
    }

    #[tokio::test]
    async fn close_slippage_guard_rejects_dislocated_price() {
        let venue = PaperExchange::new("BTCUSDT");
        let mut coord = coordinator();

        let err = coord
            .place_order(
                &venue,
                Side::Sell,
                dec("110"),
                dec("0.01"),
                true,
                None,
                Some(dec("100")),
                None,
                Instant::now(),
            )
            .await
            .unwrap_err();
        assert!(err.is_price_guard());
        assert!(!coord.is_locked(OrderSlot::Close));

        // Within the guard the close goes through.
        coord
            .place_order(
                &venue,
                Side::Sell,
                dec("101"),
                dec("0.01"),
                true,
                None,
                Some(dec("100")),
                None,
                Instant::now(),
            )
            .await
            .unwrap()
            .expect("close placed");
    }

    #[tokio::test]
    async fn entry_guard_rejects_crossed_price() {
        let venue = PaperExchange::new("BTCUSDT");
        let mut coord = coordinator();

        let err = coord
            .place_order(
                &venue,
                Side::Buy,
                dec("100.5"),
                dec("0.01"),
                false,
                None,
                None,
                Some((dec("99.9"), dec("100.1"))),
                Instant::now(),
            )
            .await
            .unwrap_err();
        assert!(err.is_price_guard());
    }

    #[tokio::test]
    async fn stop_loss_skips_invalid_trigger() {
        let venue = PaperExchange::new("BTCUSDT");
        let mut coord = coordinator();

        // SELL stop above last price would fire instantly.
        let result = coord
            .place_stop_loss(
                &venue,
                Side::Sell,
                dec("100.5"),
                dec("0.01"),
                dec("100"),
                true,
                Instant::now(),
            )
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(venue.open_orders().is_empty());
    }

    #[tokio::test]
    async fn stop_limit_pins_limit_to_trigger() {
        let venue = PaperExchange::new("BTCUSDT");
        let mut coord = coordinator();

        let order = coord
            .place_stop_loss(
                &venue,
                Side::Sell,
                dec("95"),
                dec("0.01"),
                dec("100"),
                true,
                Instant::now(),
            )
            .await
            .unwrap()
            .expect("stop placed");

        assert_eq!(order.order_type, OrderType::StopLimit);
        assert_eq!(order.stop_price, dec("95"));
        assert_eq!(order.price, dec("95"));
        assert!(order.reduce_only);
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_idempotent() {
        let venue = PaperExchange::new("BTCUSDT");
        let mut coord = coordinator();

        let done = coord
            .cancel_order(&venue, OrderSlot::Entry, 404, Instant::now())
            .await
            .unwrap();
        assert!(done);
        assert!(!coord.is_locked(OrderSlot::Entry));
    }

    #[tokio::test]
    async fn market_close_fills_and_releases_slot() {
        let venue = PaperExchange::new("BTCUSDT");
        venue.set_position(dec("0.3"), dec("100"), Some(dec("100")));
        let mut coord = coordinator();

        let order = coord
            .market_close(
                &venue,
                Side::Sell,
                dec("0.3"),
                Some(dec("100")),
                Some(dec("100")),
                Instant::now(),
            )
            .await
            .unwrap()
            .expect("market close");

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(venue.position_amt(), Decimal::ZERO);
        assert!(!coord.is_locked(OrderSlot::Close));
    }

    #[tokio::test]
    async fn market_close_guard_blocks_dislocated_last_price() {
        let venue = PaperExchange::new("BTCUSDT");
        venue.set_position(dec("0.3"), dec("100"), Some(dec("100")));
        let mut coord = coordinator();

        let err = coord
            .market_close(
                &venue,
                Side::Sell,
                dec("0.3"),
                Some(dec("80")),
                Some(dec("100")),
                Instant::now(),
            )
            .await
            .unwrap_err();
        assert!(err.is_price_guard());
    }
}
