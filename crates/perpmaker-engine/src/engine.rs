/*
[INPUT]:  Feed receivers from the exchange port, engine configuration
[OUTPUT]: Reconciled quotes, protective stops, risk actions, engine snapshots
[POS]:    Strategy layer - the order lifecycle control loop
[UPDATE]: When tick ordering, readiness gating, or risk policy changes
*/

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use perpmaker_exchange::{
    AccountSnapshot, DepthSnapshot, ExchangeError, ExchangePort, OpenOrder, PositionSnapshot,
    Side, TickerSnapshot, TimeInForce, POSITION_EPSILON,
};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, QuoteMode};
use crate::coordinator::{OrderCoordinator, OrderSlot};
use crate::imbalance::{self, DepthImbalance};
use crate::plan::{make_order_plan, DesiredOrder};
use crate::rate_limit::{CycleDecision, RateLimitController};
use crate::reconcile::{reconcile_orphaned_position, OrphanCloseOpts, PriceRefs};
use crate::snapshot::{EngineSnapshot, FeedStatus};
use crate::stops;
use crate::trade_log::{LogLevel, TradeLog};

const INSUFFICIENT_BALANCE_COOLDOWN: Duration = Duration::from_secs(15);
const POST_CLOSE_COOLDOWN: Duration = Duration::from_secs(10);

/// The Maker / Offset-Maker control loop.
///
/// All state is owned by this struct and mutated on its task only. Feed
/// handlers update mirrors and publish snapshots; the exchange is mutated
/// exclusively inside `tick`.
pub struct MakerEngine {
    config: EngineConfig,
    port: Arc<dyn ExchangePort>,
    coordinator: OrderCoordinator,
    limiter: RateLimitController,
    trade_log: TradeLog,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    shutdown: CancellationToken,

    account_rx: watch::Receiver<Option<AccountSnapshot>>,
    orders_rx: watch::Receiver<Option<Vec<OpenOrder>>>,
    depth_rx: watch::Receiver<Option<DepthSnapshot>>,
    ticker_rx: watch::Receiver<Option<TickerSnapshot>>,

    account: Option<AccountSnapshot>,
    open_orders: Vec<OpenOrder>,
    depth: Option<DepthSnapshot>,
    ticker: Option<TickerSnapshot>,
    feeds: FeedStatus,
    missing_feed_logged: FeedStatus,

    initial_reset_done: bool,
    orphan_check_done: bool,
    insufficient_balance_until: Option<Instant>,
    post_close_until: Option<Instant>,
    last_abs_position: Decimal,
    last_entry_placed: [Option<Instant>; 2],
    pending_cancels: HashSet<i64>,
    session_volume: Decimal,
    last_desired: Vec<DesiredOrder>,
    last_imbalance: Option<DepthImbalance>,
}

impl MakerEngine {
    /// Create the engine and subscribe to all four feeds. Feeds live until
    /// `stop` cancels the loop.
    pub fn new(config: EngineConfig, port: Arc<dyn ExchangePort>) -> Self {
        let coordinator = OrderCoordinator::new(
            &config.symbol,
            config.price_tick,
            config.qty_step,
            config.max_close_slippage_pct,
            config.lock_timeout(),
        );
        let limiter = RateLimitController::new(config.refresh_interval());
        let trade_log = TradeLog::new(config.max_log_entries);
        let (snapshot_tx, _) = watch::channel(EngineSnapshot::default());

        let account_rx = port.watch_account();
        let orders_rx = port.watch_orders();
        let depth_rx = port.watch_depth();
        let ticker_rx = port.watch_ticker();

        Self {
            config,
            port,
            coordinator,
            limiter,
            trade_log,
            snapshot_tx,
            shutdown: CancellationToken::new(),
            account_rx,
            orders_rx,
            depth_rx,
            ticker_rx,
            account: None,
            open_orders: Vec::new(),
            depth: None,
            ticker: None,
            feeds: FeedStatus::default(),
            missing_feed_logged: FeedStatus::default(),
            initial_reset_done: false,
            orphan_check_done: false,
            insufficient_balance_until: None,
            post_close_until: None,
            last_abs_position: Decimal::ZERO,
            last_entry_placed: [None, None],
            pending_cancels: HashSet::new(),
            session_volume: Decimal::ZERO,
            last_desired: Vec::new(),
            last_imbalance: None,
        }
    }

    /// Latest-value snapshot stream for observers.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Drive the control loop until `stop`.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut refresh = tokio::time::interval(self.config.refresh_interval());
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(symbol = %self.config.symbol, mode = ?self.config.mode, "engine starting");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(symbol = %self.config.symbol, "engine stopping");
                    let port = Arc::clone(&self.port);
                    if let Err(err) = self.coordinator.cancel_all(port.as_ref()).await {
                        warn!(symbol = %self.config.symbol, error = %err, "cancel-all on shutdown failed");
                    }
                    return Ok(());
                }
                _ = refresh.tick() => {
                    self.tick(Instant::now()).await;
                }
                res = self.account_rx.changed() => {
                    if res.is_err() { continue; }
                    let value = self.account_rx.borrow_and_update().clone();
                    if let Some(snapshot) = value {
                        self.apply_account(snapshot, Instant::now());
                    }
                    self.emit_snapshot();
                }
                res = self.orders_rx.changed() => {
                    if res.is_err() { continue; }
                    let value = self.orders_rx.borrow_and_update().clone();
                    if let Some(orders) = value {
                        self.apply_orders(orders, Instant::now());
                    }
                    self.emit_snapshot();
                }
                res = self.depth_rx.changed() => {
                    if res.is_err() { continue; }
                    let value = self.depth_rx.borrow_and_update().clone();
                    if let Some(snapshot) = value {
                        self.apply_depth(snapshot);
                    }
                    self.emit_snapshot();
                }
                res = self.ticker_rx.changed() => {
                    if res.is_err() { continue; }
                    let value = self.ticker_rx.borrow_and_update().clone();
                    if let Some(snapshot) = value {
                        self.apply_ticker(snapshot);
                    }
                    self.emit_snapshot();
                }
            }
        }
    }

    /// One control cycle. Reads a feed snapshot at entry; orders issued here
    /// become visible through the next orders-feed delivery.
    async fn tick(&mut self, now: Instant) {
        self.drain_feeds(now);

        if !self.feeds.all_ready() {
            self.log_missing_feeds();
            self.emit_snapshot();
            return;
        }

        match self.limiter.before_cycle(now) {
            CycleDecision::Paused => {
                debug!(symbol = %self.config.symbol, "rate-limit pause; cycle skipped");
                self.emit_snapshot();
                return;
            }
            CycleDecision::Skip => {
                debug!(symbol = %self.config.symbol, "cooling off after rate-limited cycle");
                self.emit_snapshot();
                return;
            }
            CycleDecision::Run => {}
        }

        if !self.initial_reset_done {
            if self.open_orders.is_empty() {
                // Nothing resting: the reset is a no-op and the cycle proceeds.
                self.initial_reset_done = true;
            } else {
                self.startup_reset(now).await;
                self.emit_snapshot();
                return;
            }
        }

        if !self.orphan_check_done {
            let acted = self.orphan_check().await;
            self.orphan_check_done = true;
            if acted {
                // Pick up the protective close so this cycle's plan matches it
                // instead of quoting a second one.
                self.drain_feeds(now);
            }
        }

        let mut had_rate_limit = false;
        if let Err(err) = self.run_cycle(now).await {
            if err.is_rate_limit() {
                had_rate_limit = true;
                self.limiter.register_rate_limit("cycle", now);
                self.log(LogLevel::Warn, format!("rate limited: {err}"));
                self.enforce_rate_limit_stop(now).await;
            } else if let ExchangeError::InvalidState(msg) = &err {
                self.log(LogLevel::Error, format!("invariant violation, cycle aborted: {msg}"));
            } else {
                self.log(LogLevel::Error, format!("cycle aborted: {err}"));
            }
        }

        self.limiter.on_cycle_complete(had_rate_limit, now);
        self.emit_snapshot();
    }

    async fn startup_reset(&mut self, now: Instant) {
        let port = Arc::clone(&self.port);
        match self.coordinator.cancel_all(port.as_ref()).await {
            Ok(()) => {
                self.log(
                    LogLevel::Info,
                    format!("startup reset: cancelled {} resting orders", self.open_orders.len()),
                );
                self.pending_cancels.extend(self.open_orders.iter().map(|o| o.order_id));
                self.initial_reset_done = true;
            }
            Err(err) if err.is_rate_limit() => {
                self.limiter.register_rate_limit("startup-reset", now);
                self.log(LogLevel::Warn, format!("startup reset rate limited: {err}"));
            }
            Err(err) => {
                self.log(LogLevel::Error, format!("startup reset failed: {err}"));
            }
        }
    }

    /// One-shot boot check: a position carried over from a previous session
    /// must not sit without a close-side order.
    async fn orphan_check(&mut self) -> bool {
        let Some(position) = self.current_position() else { return false };
        let prices = PriceRefs {
            top_bid: self.depth.as_ref().and_then(|d| d.best_bid()),
            top_ask: self.depth.as_ref().and_then(|d| d.best_ask()),
            last_price: self.ticker.as_ref().map(|t| t.last_price),
        };
        let opts = OrphanCloseOpts {
            price_tick: self.config.price_tick,
            qty_step: self.config.qty_step,
            strict_limit_only: self.config.strict_limit_only,
        };

        let port = Arc::clone(&self.port);
        let took_action = reconcile_orphaned_position(
            port.as_ref(),
            &self.config.symbol,
            &position,
            &self.open_orders,
            &prices,
            &opts,
            false,
        )
        .await;
        if took_action {
            self.log(LogLevel::Warn, "orphaned position found at boot; protective close placed");
        }
        took_action
    }

    async fn run_cycle(&mut self, now: Instant) -> Result<(), ExchangeError> {
        let Some(depth) = self.depth.clone() else {
            return Err(ExchangeError::InvalidState("depth missing after readiness".to_string()));
        };
        let (Some(bid), Some(ask)) = (depth.best_bid(), depth.best_ask()) else {
            warn!(symbol = %self.config.symbol, "depth snapshot without top-of-book; cycle skipped");
            return Ok(());
        };
        let Some(last_price) = self.ticker.as_ref().map(|t| t.last_price) else {
            return Err(ExchangeError::InvalidState("ticker missing after readiness".to_string()));
        };

        let position = self.current_position().unwrap_or_else(|| {
            PositionSnapshot::flat(&self.config.symbol)
        });
        let mark_price = position.mark_price.or(Some(last_price));

        let imbalance = (self.config.mode == QuoteMode::OffsetMaker)
            .then(|| imbalance::measure(&depth));
        self.last_imbalance = imbalance;

        if let Some(imb) = &imbalance
            && !position.is_flat()
            && imb.extreme_against(position.position_amt)
        {
            self.log(
                LogLevel::Warn,
                format!("extreme {} book against position; forcing close", imb.label.as_str()),
            );
            self.force_close(&position, bid, ask, last_price, mark_price, now).await?;
            return Ok(());
        }

        let desired = self.derive_desired(&position, bid, ask, imbalance.as_ref(), now);
        let desired = self.apply_reprice_suppression(desired, now);
        self.last_desired = desired.clone();

        let working: Vec<OpenOrder> = self
            .open_orders
            .iter()
            .filter(|o| {
                !o.status.is_terminal()
                    && !o.is_stop_like()
                    && !self.pending_cancels.contains(&o.order_id)
            })
            .cloned()
            .collect();

        let plan = make_order_plan(&working, &desired, self.config.price_tick, self.config.qty_step);

        self.execute_cancels(&plan.to_cancel, now).await?;
        self.execute_places(&plan.to_place, bid, ask, mark_price, now).await?;

        if !position.is_flat() {
            self.ensure_protective_stop(&position, last_price, now).await?;
        }

        if stops::should_stop_loss(&position, bid, ask, self.config.loss_limit) {
            self.log(
                LogLevel::Warn,
                format!("loss limit {} breached; flushing and closing", self.config.loss_limit),
            );
            self.flush_working_orders().await?;
            self.close_position_risk(&position, bid, ask, last_price, mark_price, now).await?;
        }

        Ok(())
    }

    fn derive_desired(
        &self,
        position: &PositionSnapshot,
        bid: Decimal,
        ask: Decimal,
        imbalance: Option<&DepthImbalance>,
        now: Instant,
    ) -> Vec<DesiredOrder> {
        let mut desired = Vec::new();

        if position.is_flat() {
            if self.entries_blocked(now) {
                return desired;
            }

            let amount = self.config.trade_amount * self.config.volume_boost;
            let skip_buy = imbalance.is_some_and(|i| i.skip_buy_side());
            let skip_sell = imbalance.is_some_and(|i| i.skip_sell_side());

            if !skip_buy {
                let price = self.coordinator.round_price(Side::Buy, bid - self.config.bid_offset);
                desired.push(DesiredOrder {
                    side: Side::Buy,
                    price: self.coordinator.format_price(price),
                    amount,
                    reduce_only: false,
                });
            }
            if !skip_sell {
                let price = self.coordinator.round_price(Side::Sell, ask + self.config.ask_offset);
                desired.push(DesiredOrder {
                    side: Side::Sell,
                    price: self.coordinator.format_price(price),
                    amount,
                    reduce_only: false,
                });
            }
        } else {
            let close_side = position.close_side();
            let raw = match close_side {
                Side::Sell => ask,
                Side::Buy => bid,
            };
            let price = self.coordinator.round_price(close_side, raw);
            let amount = self.coordinator.round_qty(position.position_amt.abs());
            if amount > Decimal::ZERO {
                desired.push(DesiredOrder {
                    side: close_side,
                    price: self.coordinator.format_price(price),
                    amount,
                    reduce_only: true,
                });
            }
        }

        desired
    }

    /// Pin an entry back to its resting price when the move is below the
    /// reprice threshold or inside the dwell window. Closes are exempt.
    fn apply_reprice_suppression(
        &self,
        mut desired: Vec<DesiredOrder>,
        now: Instant,
    ) -> Vec<DesiredOrder> {
        for want in desired.iter_mut().filter(|w| !w.reduce_only) {
            let existing = self
                .open_orders
                .iter()
                .filter(|o| {
                    o.side == want.side
                        && !o.reduce_only
                        && !o.is_stop_like()
                        && !o.status.is_terminal()
                        && !self.pending_cancels.contains(&o.order_id)
                })
                .max_by_key(|o| o.update_time);
            let Some(open) = existing else { continue };

            let Some(want_price) = want.price_decimal() else { continue };
            let delta_ticks = crate::plan::price_ticks(
                (want_price - open.price).abs(),
                self.config.price_tick,
            )
            .unwrap_or(i64::MAX);

            let in_dwell = self.last_entry_placed[side_index(want.side)]
                .is_some_and(|placed| now.saturating_duration_since(placed) < self.config.reprice_dwell());

            if delta_ticks < i64::from(self.config.min_reprice_ticks) || in_dwell {
                debug!(
                    symbol = %self.config.symbol,
                    side = want.side.as_str(),
                    resting = %open.price,
                    wanted = %want_price,
                    "reprice suppressed; pinning to resting order"
                );
                want.price = self.coordinator.format_price(open.price);
            }
        }
        desired
    }

    async fn execute_cancels(
        &mut self,
        to_cancel: &[OpenOrder],
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let port = Arc::clone(&self.port);
        for order in to_cancel {
            let slot = if order.reduce_only { OrderSlot::Close } else { OrderSlot::Entry };
            match self.coordinator.cancel_order(port.as_ref(), slot, order.order_id, now).await {
                Ok(true) => {
                    self.pending_cancels.insert(order.order_id);
                }
                Ok(false) => {}
                Err(err) if err.is_rate_limit() => return Err(err),
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        format!("cancel of order {} failed: {err}", order.order_id),
                    );
                    // Drop the local mirror; the next snapshot settles it.
                    self.open_orders.retain(|o| o.order_id != order.order_id);
                }
            }
        }
        Ok(())
    }

    async fn execute_places(
        &mut self,
        to_place: &[DesiredOrder],
        bid: Decimal,
        ask: Decimal,
        mark_price: Option<Decimal>,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let port = Arc::clone(&self.port);
        let entries_blocked = self.entries_blocked(now);
        let mut preemptive: Option<(Side, Decimal, Decimal)> = None;

        for want in to_place {
            if !want.reduce_only && entries_blocked {
                debug!(symbol = %self.config.symbol, side = want.side.as_str(), "entries blocked; quote withheld");
                continue;
            }
            let Some(price) = want.price_decimal() else { continue };
            let tif = (want.reduce_only && self.config.strict_limit_only)
                .then_some(TimeInForce::Ioc);

            match self
                .coordinator
                .place_order(
                    port.as_ref(),
                    want.side,
                    price,
                    want.amount,
                    want.reduce_only,
                    tif,
                    mark_price,
                    Some((bid, ask)),
                    now,
                )
                .await
            {
                Ok(Some(order)) => {
                    if !want.reduce_only {
                        self.last_entry_placed[side_index(want.side)] = Some(now);
                        self.session_volume += price * order.orig_qty;

                        // Top-of-book quoting leaves no room between entry and
                        // fill; pre-arm the protective side.
                        if self.config.bid_offset.is_zero() && self.config.ask_offset.is_zero() {
                            let trigger = match want.side {
                                Side::Buy => ask,
                                Side::Sell => bid,
                            };
                            preemptive = Some((want.side.opposite(), trigger, order.orig_qty));
                        }
                    }
                }
                Ok(None) => {}
                Err(err) if err.is_rate_limit() => return Err(err),
                Err(err) if err.is_insufficient_balance() => {
                    self.arm_insufficient_balance_cooldown(now);
                    break;
                }
                Err(err) if err.is_price_guard() => {
                    self.log(LogLevel::Warn, format!("price guard rejected quote: {err}"));
                }
                Err(err) => {
                    self.log(LogLevel::Error, format!("place failed: {err}"));
                }
            }
        }

        if let Some((close_side, trigger, qty)) = preemptive {
            match self
                .coordinator
                .place_preemptive_stop_limit(port.as_ref(), close_side, trigger, qty, now)
                .await
            {
                Ok(_) => {}
                Err(err) if err.is_rate_limit() => return Err(err),
                Err(err) => {
                    self.log(LogLevel::Warn, format!("pre-emptive stop failed: {err}"));
                }
            }
        }

        Ok(())
    }

    async fn ensure_protective_stop(
        &mut self,
        position: &PositionSnapshot,
        last_price: Decimal,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let close_side = position.close_side();
        let qty = position.position_amt.abs();
        let Some(desired_stop) = stops::calc_stop_loss_price(
            position.entry_price,
            qty,
            close_side,
            self.config.loss_limit,
        ) else {
            return Ok(());
        };
        let desired_stop = self.coordinator.round_price(close_side, desired_stop);
        let exact = self.config.mode == QuoteMode::OffsetMaker;
        let port = Arc::clone(&self.port);

        let current = self
            .open_orders
            .iter()
            .filter(|o| {
                o.side == close_side
                    && o.is_stop_like()
                    && !o.status.is_terminal()
                    && !self.pending_cancels.contains(&o.order_id)
            })
            .max_by_key(|o| o.update_time)
            .cloned();

        let Some(current) = current else {
            match self
                .coordinator
                .place_stop_loss(port.as_ref(), close_side, desired_stop, qty, last_price, exact, now)
                .await
            {
                Ok(Some(order)) => {
                    self.log(
                        LogLevel::Info,
                        format!("protective stop placed at {} (order {})", order.stop_price, order.order_id),
                    );
                }
                Ok(None) => {}
                Err(err) if err.is_rate_limit() => return Err(err),
                Err(err) => self.log(LogLevel::Error, format!("stop place failed: {err}")),
            }
            return Ok(());
        };

        let current_trigger = if current.stop_price > Decimal::ZERO {
            current.stop_price
        } else {
            current.price
        };

        let invalid_placement =
            !stops::is_valid_stop(close_side, current_trigger, last_price, self.config.price_tick);
        let tighter = stops::is_tighter_stop(close_side, desired_stop, current_trigger);
        // Offset-Maker keeps the trigger exact: any whole-tick drift that is
        // still on the valid side forces a refresh.
        let exact_refresh = exact
            && (desired_stop - current_trigger).abs() >= self.config.price_tick
            && stops::is_valid_stop(close_side, desired_stop, last_price, self.config.price_tick);

        if !(invalid_placement || tighter || exact_refresh) {
            return Ok(());
        }

        let cancelled = match self
            .coordinator
            .cancel_order(port.as_ref(), OrderSlot::Stop, current.order_id, now)
            .await
        {
            Ok(done) => done,
            Err(err) if err.is_rate_limit() => return Err(err),
            Err(err) => {
                self.log(LogLevel::Error, format!("stop replace cancel failed: {err}"));
                false
            }
        };
        if !cancelled {
            return Ok(());
        }
        self.pending_cancels.insert(current.order_id);

        let placed = match self
            .coordinator
            .place_stop_loss(port.as_ref(), close_side, desired_stop, qty, last_price, exact, now)
            .await
        {
            Ok(result) => result.is_some(),
            Err(err) if err.is_rate_limit() => return Err(err),
            Err(err) => {
                self.log(LogLevel::Error, format!("stop replace place failed: {err}"));
                false
            }
        };

        if !placed {
            // Try to restore the previous trigger so the position is not left
            // naked on a failed replacement.
            if stops::is_valid_stop(close_side, current_trigger, last_price, self.config.price_tick) {
                match self
                    .coordinator
                    .place_stop_loss(
                        port.as_ref(),
                        close_side,
                        current_trigger,
                        qty,
                        last_price,
                        exact,
                        now,
                    )
                    .await
                {
                    Ok(Some(_)) => {
                        self.log(LogLevel::Warn, "stop replacement failed; previous stop restored");
                    }
                    Ok(None) => {}
                    Err(err) if err.is_rate_limit() => return Err(err),
                    Err(err) => {
                        self.log(LogLevel::Error, format!("stop restore failed: {err}"));
                    }
                }
            }
        }

        Ok(())
    }

    async fn force_close(
        &mut self,
        position: &PositionSnapshot,
        bid: Decimal,
        ask: Decimal,
        last_price: Decimal,
        mark_price: Option<Decimal>,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        if !self.close_with_market(position, last_price, mark_price, now).await? {
            self.close_with_limit_ioc(position, bid, ask, mark_price, now).await?;
        }
        Ok(())
    }

    async fn close_position_risk(
        &mut self,
        position: &PositionSnapshot,
        bid: Decimal,
        ask: Decimal,
        last_price: Decimal,
        mark_price: Option<Decimal>,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        if self.config.strict_limit_only {
            if !self.close_with_limit_ioc(position, bid, ask, mark_price, now).await? {
                self.close_with_market(position, last_price, mark_price, now).await?;
            }
        } else if !self.close_with_market(position, last_price, mark_price, now).await? {
            self.close_with_limit_ioc(position, bid, ask, mark_price, now).await?;
        }
        Ok(())
    }

    async fn close_with_market(
        &mut self,
        position: &PositionSnapshot,
        last_price: Decimal,
        mark_price: Option<Decimal>,
        now: Instant,
    ) -> Result<bool, ExchangeError> {
        let port = Arc::clone(&self.port);
        match self
            .coordinator
            .market_close(
                port.as_ref(),
                position.close_side(),
                position.position_amt.abs(),
                Some(last_price),
                mark_price,
                now,
            )
            .await
        {
            Ok(Some(_)) => {
                self.log(LogLevel::Info, "position closed at market");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) if err.is_rate_limit() => Err(err),
            Err(err) if err.is_price_guard() => {
                self.log(LogLevel::Warn, format!("market close blocked by guard: {err}"));
                Ok(false)
            }
            Err(err) => {
                self.log(LogLevel::Error, format!("market close failed: {err}"));
                Ok(false)
            }
        }
    }

    async fn close_with_limit_ioc(
        &mut self,
        position: &PositionSnapshot,
        bid: Decimal,
        ask: Decimal,
        mark_price: Option<Decimal>,
        now: Instant,
    ) -> Result<bool, ExchangeError> {
        let close_side = position.close_side();
        // Cross the book for an immediate reduce: long sells into the bid,
        // short buys from the ask.
        let price = match close_side {
            Side::Sell => bid,
            Side::Buy => ask,
        };

        let port = Arc::clone(&self.port);
        match self
            .coordinator
            .place_order(
                port.as_ref(),
                close_side,
                price,
                position.position_amt.abs(),
                true,
                Some(TimeInForce::Ioc),
                mark_price,
                Some((bid, ask)),
                now,
            )
            .await
        {
            Ok(Some(_)) => {
                self.log(LogLevel::Info, "position close sent as IOC limit");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) if err.is_rate_limit() => Err(err),
            Err(err) if err.is_price_guard() => {
                self.log(LogLevel::Warn, format!("limit close blocked by guard: {err}"));
                Ok(false)
            }
            Err(err) => {
                self.log(LogLevel::Error, format!("limit close failed: {err}"));
                Ok(false)
            }
        }
    }

    async fn flush_working_orders(&mut self) -> Result<(), ExchangeError> {
        let port = Arc::clone(&self.port);
        match self.coordinator.cancel_all(port.as_ref()).await {
            Ok(()) => {
                self.pending_cancels.extend(self.open_orders.iter().map(|o| o.order_id));
                Ok(())
            }
            Err(err) if err.is_rate_limit() => Err(err),
            Err(err) => {
                self.log(LogLevel::Error, format!("flush failed: {err}"));
                Ok(())
            }
        }
    }

    /// Rate-limit emergency: stop quoting and get out of the position before
    /// backing off.
    async fn enforce_rate_limit_stop(&mut self, now: Instant) {
        let Some(position) = self.current_position() else { return };
        if position.is_flat() {
            return;
        }

        let bid = self.depth.as_ref().and_then(|d| d.best_bid());
        let ask = self.depth.as_ref().and_then(|d| d.best_ask());
        let last = self.ticker.as_ref().map(|t| t.last_price);
        let mark = position.mark_price.or(last);

        let closed = match (last, bid, ask) {
            (Some(last), Some(bid), Some(ask)) => {
                match self.close_with_market(&position, last, mark, now).await {
                    Ok(true) => true,
                    Ok(false) => matches!(
                        self.close_with_limit_ioc(&position, bid, ask, mark, now).await,
                        Ok(true)
                    ),
                    Err(_) => false,
                }
            }
            _ => false,
        };

        if !closed {
            self.log(LogLevel::Error, "rate-limit stop could not close position this cycle");
        }
    }

    fn entries_blocked(&self, now: Instant) -> bool {
        let balance_cooldown = self
            .insufficient_balance_until
            .is_some_and(|until| now < until);
        let post_close_cooldown = self.post_close_until.is_some_and(|until| now < until);
        balance_cooldown || post_close_cooldown || self.limiter.should_block_entries()
    }

    fn arm_insufficient_balance_cooldown(&mut self, now: Instant) {
        let already_active = self
            .insufficient_balance_until
            .is_some_and(|until| now < until);
        self.insufficient_balance_until = Some(now + INSUFFICIENT_BALANCE_COOLDOWN);
        if !already_active {
            self.log(
                LogLevel::Warn,
                format!("insufficient balance; entries paused for {}s", INSUFFICIENT_BALANCE_COOLDOWN.as_secs()),
            );
        }
    }

    fn drain_feeds(&mut self, now: Instant) {
        let account = self.account_rx.borrow_and_update().clone();
        if let Some(snapshot) = account {
            self.apply_account(snapshot, now);
        }
        let orders = self.orders_rx.borrow_and_update().clone();
        if let Some(orders) = orders {
            self.apply_orders(orders, now);
        }
        let depth = self.depth_rx.borrow_and_update().clone();
        if let Some(snapshot) = depth {
            self.apply_depth(snapshot);
        }
        let ticker = self.ticker_rx.borrow_and_update().clone();
        if let Some(snapshot) = ticker {
            self.apply_ticker(snapshot);
        }
    }

    fn apply_account(&mut self, snapshot: AccountSnapshot, now: Instant) {
        self.feeds.account = true;
        let abs = snapshot
            .position_for(&self.config.symbol)
            .map(|p| p.position_amt.abs())
            .unwrap_or(Decimal::ZERO);

        // Falling edge to flat arms the post-close cooldown.
        if self.last_abs_position >= POSITION_EPSILON && abs < POSITION_EPSILON {
            self.post_close_until = Some(now + POST_CLOSE_COOLDOWN);
            self.log(
                LogLevel::Info,
                format!("position flat; entries paused for {}s", POST_CLOSE_COOLDOWN.as_secs()),
            );
        }
        self.last_abs_position = abs;
        self.account = Some(snapshot);
    }

    fn apply_orders(&mut self, orders: Vec<OpenOrder>, now: Instant) {
        self.feeds.orders = true;
        // Keep masking only orders the venue still shows live.
        self.pending_cancels
            .retain(|id| orders.iter().any(|o| o.order_id == *id && !o.status.is_terminal()));
        self.open_orders = orders;
        self.coordinator.observe_open_orders(now, &self.open_orders);
    }

    fn apply_depth(&mut self, snapshot: DepthSnapshot) {
        self.feeds.depth = true;
        self.depth = Some(snapshot);
    }

    fn apply_ticker(&mut self, snapshot: TickerSnapshot) {
        self.feeds.ticker = true;
        self.ticker = Some(snapshot);
    }

    fn current_position(&self) -> Option<PositionSnapshot> {
        self.account
            .as_ref()
            .and_then(|a| a.position_for(&self.config.symbol))
            .cloned()
    }

    fn log_missing_feeds(&mut self) {
        let pairs = [
            (self.feeds.account, &mut self.missing_feed_logged.account, "account"),
            (self.feeds.orders, &mut self.missing_feed_logged.orders, "orders"),
            (self.feeds.depth, &mut self.missing_feed_logged.depth, "depth"),
            (self.feeds.ticker, &mut self.missing_feed_logged.ticker, "ticker"),
        ];
        for (ready, logged, name) in pairs {
            if !ready && !*logged {
                info!(symbol = %self.config.symbol, feed = name, "waiting for first delivery");
                *logged = true;
            }
        }
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(symbol = %self.config.symbol, "{message}"),
            LogLevel::Warn => warn!(symbol = %self.config.symbol, "{message}"),
            LogLevel::Error => error!(symbol = %self.config.symbol, "{message}"),
        }
        self.trade_log.push(level, message);
    }

    fn emit_snapshot(&self) {
        let bid = self.depth.as_ref().and_then(|d| d.best_bid());
        let ask = self.depth.as_ref().and_then(|d| d.best_ask());
        let spread = match (bid, ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        };
        let position = self.current_position();
        let pnl = match (&position, bid, ask) {
            (Some(p), Some(b), Some(a)) => stops::position_pnl(p, b, a),
            _ => Decimal::ZERO,
        };

        let snapshot = EngineSnapshot {
            ready: self.feeds.all_ready() && self.initial_reset_done,
            top_bid: bid,
            top_ask: ask,
            spread,
            position,
            pnl,
            account_unrealized: self
                .account
                .as_ref()
                .map(|a| a.total_unrealized_profit)
                .unwrap_or(Decimal::ZERO),
            session_volume: self.session_volume,
            open_orders: self.open_orders.clone(),
            desired_orders: self.last_desired.clone(),
            trade_log: self.trade_log.snapshot(),
            feeds: self.feeds,
            imbalance: self.last_imbalance,
            skip_buy_side: self.last_imbalance.is_some_and(|i| i.skip_buy_side()),
            skip_sell_side: self.last_imbalance.is_some_and(|i| i.skip_sell_side()),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

fn side_index(side: Side) -> usize {
    match side {
        Side::Buy => 0,
        Side::Sell => 1,
    }
}
