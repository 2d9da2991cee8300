/*
[INPUT]:  Current open entry orders + desired quotes from the engine
[OUTPUT]: Diff of orders to cancel and orders to place
[POS]:    Reconciliation layer - desired-vs-live order matching
[UPDATE]: When the matching key or tolerance rules change
*/

use perpmaker_exchange::{OpenOrder, Side};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// A quote the engine wants resting on the book. The price is a string,
/// already rounded to the instrument tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredOrder {
    pub side: Side,
    pub price: String,
    pub amount: Decimal,
    pub reduce_only: bool,
}

impl DesiredOrder {
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.parse().ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderPlan {
    pub to_cancel: Vec<OpenOrder>,
    pub to_place: Vec<DesiredOrder>,
}

impl OrderPlan {
    pub fn is_empty(&self) -> bool {
        self.to_cancel.is_empty() && self.to_place.is_empty()
    }
}

/// Diff `desired` against `current_open`.
///
/// Orders match on `(side, price in ticks, reduce_only)` with the resting
/// quantity equal within one `qty_step`; each open order is consumed at most
/// once. Callers pre-filter `current_open` down to live non-stop orders.
/// Cancels come out oldest first, places in the caller's order.
pub fn make_order_plan(
    current_open: &[OpenOrder],
    desired: &[DesiredOrder],
    price_tick: Decimal,
    qty_step: Decimal,
) -> OrderPlan {
    let mut consumed = vec![false; current_open.len()];
    let mut to_place = Vec::new();

    for want in desired {
        let want_ticks = want.price_decimal().and_then(|p| price_ticks(p, price_tick));

        let matched = current_open.iter().enumerate().position(|(i, open)| {
            !consumed[i]
                && open.side == want.side
                && open.reduce_only == want.reduce_only
                && price_ticks(open.price, price_tick) == want_ticks
                && want_ticks.is_some()
                && (open.remaining_qty() - want.amount).abs() <= qty_step
        });

        match matched {
            Some(index) => consumed[index] = true,
            None => to_place.push(want.clone()),
        }
    }

    let mut to_cancel: Vec<OpenOrder> = current_open
        .iter()
        .enumerate()
        .filter(|(i, _)| !consumed[*i])
        .map(|(_, open)| open.clone())
        .collect();
    to_cancel.sort_by_key(|open| open.update_time);

    OrderPlan { to_cancel, to_place }
}

/// Integer tick count for a price; sidesteps decimal representation noise.
pub fn price_ticks(price: Decimal, price_tick: Decimal) -> Option<i64> {
    if price_tick <= Decimal::ZERO {
        return None;
    }
    (price / price_tick).round().to_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpmaker_exchange::{OrderStatus, OrderType};
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn open(id: i64, side: Side, price: &str, qty: &str, reduce_only: bool, update_time: i64) -> OpenOrder {
        OpenOrder {
            order_id: id,
            client_order_id: format!("c-{id}"),
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Limit,
            status: OrderStatus::New,
            price: dec(price),
            orig_qty: dec(qty),
            executed_qty: Decimal::ZERO,
            stop_price: Decimal::ZERO,
            reduce_only,
            close_position: false,
            update_time,
            time: update_time,
        }
    }

    fn want(side: Side, price: &str, amount: &str, reduce_only: bool) -> DesiredOrder {
        DesiredOrder {
            side,
            price: price.to_string(),
            amount: dec(amount),
            reduce_only,
        }
    }

    #[test]
    fn matching_order_produces_empty_plan() {
        let current = vec![open(1, Side::Buy, "99.9", "0.01", false, 10)];
        let desired = vec![want(Side::Buy, "99.9", "0.01", false)];

        let plan = make_order_plan(&current, &desired, dec("0.1"), dec("0.001"));
        assert!(plan.is_empty());
    }

    #[test]
    fn qty_within_step_tolerance_still_matches() {
        let current = vec![open(1, Side::Buy, "99.9", "0.010", false, 10)];
        let desired = vec![want(Side::Buy, "99.9", "0.011", false)];

        let plan = make_order_plan(&current, &desired, dec("0.1"), dec("0.001"));
        assert!(plan.is_empty());

        let desired = vec![want(Side::Buy, "99.9", "0.013", false)];
        let plan = make_order_plan(&current, &desired, dec("0.1"), dec("0.001"));
        assert_eq!(plan.to_cancel.len(), 1);
        assert_eq!(plan.to_place.len(), 1);
    }

    #[test]
    fn reduce_only_is_part_of_the_key() {
        let current = vec![open(1, Side::Sell, "100.1", "0.5", false, 10)];
        let desired = vec![want(Side::Sell, "100.1", "0.5", true)];

        let plan = make_order_plan(&current, &desired, dec("0.1"), dec("0.001"));
        assert_eq!(plan.to_cancel.len(), 1);
        assert_eq!(plan.to_place.len(), 1);
    }

    #[test]
    fn each_open_consumed_at_most_once() {
        let current = vec![open(1, Side::Buy, "99.9", "0.01", false, 10)];
        let desired = vec![
            want(Side::Buy, "99.9", "0.01", false),
            want(Side::Buy, "99.9", "0.01", false),
        ];

        let plan = make_order_plan(&current, &desired, dec("0.1"), dec("0.001"));
        assert!(plan.to_cancel.is_empty());
        assert_eq!(plan.to_place.len(), 1);
    }

    #[test]
    fn cancels_come_out_oldest_first() {
        let current = vec![
            open(2, Side::Sell, "100.3", "0.5", false, 30),
            open(1, Side::Buy, "99.5", "0.5", false, 10),
            open(3, Side::Buy, "99.4", "0.5", false, 20),
        ];

        let plan = make_order_plan(&current, &[], dec("0.1"), dec("0.001"));
        let ids: Vec<i64> = plan.to_cancel.iter().map(|o| o.order_id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn applying_the_diff_converges() {
        let current = vec![
            open(1, Side::Buy, "99.5", "0.01", false, 10),
            open(2, Side::Sell, "100.5", "0.01", false, 11),
        ];
        let desired = vec![
            want(Side::Buy, "99.9", "0.01", false),
            want(Side::Sell, "100.5", "0.01", false),
        ];

        let plan = make_order_plan(&current, &desired, dec("0.1"), dec("0.001"));
        assert_eq!(plan.to_cancel.len(), 1);
        assert_eq!(plan.to_place.len(), 1);

        // Apply the diff: drop cancels, append places as fresh opens.
        let mut next: Vec<OpenOrder> = current
            .into_iter()
            .filter(|o| plan.to_cancel.iter().all(|c| c.order_id != o.order_id))
            .collect();
        for (i, placed) in plan.to_place.iter().enumerate() {
            next.push(open(
                100 + i as i64,
                placed.side,
                &placed.price,
                &placed.amount.to_string(),
                placed.reduce_only,
                100 + i as i64,
            ));
        }

        let replan = make_order_plan(&next, &desired, dec("0.1"), dec("0.001"));
        assert!(replan.is_empty());
    }

    #[test]
    fn partially_filled_open_matches_on_remaining_qty() {
        let mut resting = open(1, Side::Buy, "99.9", "0.02", false, 10);
        resting.executed_qty = dec("0.01");
        resting.status = OrderStatus::PartiallyFilled;

        let desired = vec![want(Side::Buy, "99.9", "0.01", false)];
        let plan = make_order_plan(&[resting], &desired, dec("0.1"), dec("0.001"));
        assert!(plan.is_empty());
    }
}
