/*
[INPUT]:  Position snapshot, top-of-book prices, loss-limit configuration
[OUTPUT]: Stop trigger prices, stop validity checks, side-aware pnl
[POS]:    Risk layer - protective-stop arithmetic
[UPDATE]: When stop placement or loss accounting rules change
*/

use perpmaker_exchange::{PositionSnapshot, Side};
use rust_decimal::Decimal;

/// Trigger price at which the position has lost `loss_limit` (quote units).
///
/// Returns None for a flat position or non-positive inputs.
pub fn calc_stop_loss_price(
    entry_price: Decimal,
    qty_abs: Decimal,
    close_side: Side,
    loss_limit: Decimal,
) -> Option<Decimal> {
    if qty_abs <= Decimal::ZERO || entry_price <= Decimal::ZERO || loss_limit <= Decimal::ZERO {
        return None;
    }

    let per_unit = loss_limit / qty_abs;
    let stop = match close_side {
        // Long position closes with a SELL; the stop sits below entry.
        Side::Sell => entry_price - per_unit,
        // Short position closes with a BUY; the stop sits above entry.
        Side::Buy => entry_price + per_unit,
    };

    if stop <= Decimal::ZERO {
        return None;
    }
    Some(stop)
}

/// Unrealized pnl at the side-aware exit price (long exits into the bid,
/// short exits into the ask).
pub fn position_pnl(position: &PositionSnapshot, bid: Decimal, ask: Decimal) -> Decimal {
    if position.is_flat() {
        return Decimal::ZERO;
    }

    let exit = if position.position_amt > Decimal::ZERO { bid } else { ask };
    (exit - position.entry_price) * position.position_amt
}

/// Whether the loss limit is breached at current top-of-book.
pub fn should_stop_loss(
    position: &PositionSnapshot,
    bid: Decimal,
    ask: Decimal,
    loss_limit: Decimal,
) -> bool {
    if position.is_flat() {
        return false;
    }
    position_pnl(position, bid, ask) <= -loss_limit
}

/// A stop trigger must sit at least one tick on the far side of last price,
/// otherwise the venue fires (or rejects) it immediately.
pub fn is_valid_stop(close_side: Side, stop_price: Decimal, last_price: Decimal, tick: Decimal) -> bool {
    if stop_price <= Decimal::ZERO || last_price <= Decimal::ZERO {
        return false;
    }
    match close_side {
        Side::Sell => stop_price <= last_price - tick,
        Side::Buy => stop_price >= last_price + tick,
    }
}

/// Whether `candidate` protects more tightly than `current` on this side.
pub fn is_tighter_stop(close_side: Side, candidate: Decimal, current: Decimal) -> bool {
    match close_side {
        Side::Sell => candidate > current,
        Side::Buy => candidate < current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn position(amt: &str, entry: &str) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            position_amt: dec(amt),
            entry_price: dec(entry),
            mark_price: None,
            unrealized_profit: Decimal::ZERO,
        }
    }

    #[test]
    fn stop_price_sits_loss_limit_away() {
        // Long 0.1 @ 100 with a 5 USDT limit: stop at 100 - 5/0.1 = 50.
        let stop = calc_stop_loss_price(dec("100"), dec("0.1"), Side::Sell, dec("5")).unwrap();
        assert_eq!(stop, dec("50"));

        // Short side mirrors above entry.
        let stop = calc_stop_loss_price(dec("100"), dec("0.1"), Side::Buy, dec("5")).unwrap();
        assert_eq!(stop, dec("150"));
    }

    #[test]
    fn stop_price_rejects_degenerate_inputs() {
        assert!(calc_stop_loss_price(dec("100"), Decimal::ZERO, Side::Sell, dec("5")).is_none());
        assert!(calc_stop_loss_price(Decimal::ZERO, dec("1"), Side::Sell, dec("5")).is_none());
        // Stop would cross zero.
        assert!(calc_stop_loss_price(dec("1"), dec("0.1"), Side::Sell, dec("5")).is_none());
    }

    #[test]
    fn pnl_uses_side_aware_exit() {
        let long = position("0.5", "100");
        assert_eq!(position_pnl(&long, dec("99"), dec("101")), dec("-0.5"));

        let short = position("-0.5", "100");
        assert_eq!(position_pnl(&short, dec("99"), dec("101")), dec("-0.5"));

        // Zero spread: both sides collapse to the same price.
        assert_eq!(position_pnl(&long, dec("100"), dec("100")), Decimal::ZERO);
    }

    #[test]
    fn stop_loss_fires_at_limit() {
        let long = position("0.1", "100");
        assert!(!should_stop_loss(&long, dec("99"), dec("99.1"), dec("5")));
        assert!(should_stop_loss(&long, dec("50"), dec("50.1"), dec("5")));

        let flat = position("0.000001", "100");
        assert!(!should_stop_loss(&flat, dec("1"), dec("1"), dec("5")));
    }

    #[test]
    fn stop_validity_needs_one_tick_clearance() {
        let tick = dec("0.1");
        assert!(is_valid_stop(Side::Sell, dec("99.9"), dec("100"), tick));
        assert!(!is_valid_stop(Side::Sell, dec("100"), dec("100"), tick));
        assert!(is_valid_stop(Side::Buy, dec("100.1"), dec("100"), tick));
        assert!(!is_valid_stop(Side::Buy, dec("99.9"), dec("100"), tick));
    }

    #[test]
    fn tighter_stop_moves_toward_price() {
        assert!(is_tighter_stop(Side::Sell, dec("95"), dec("90")));
        assert!(!is_tighter_stop(Side::Sell, dec("90"), dec("95")));
        assert!(is_tighter_stop(Side::Buy, dec("105"), dec("110")));
        assert!(!is_tighter_stop(Side::Buy, dec("110"), dec("105")));
    }
}
