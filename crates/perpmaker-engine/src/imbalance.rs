/*
[INPUT]:  Depth snapshot (top levels), current position sign
[OUTPUT]: Aggregate bid/ask size, dominance label, forced-exit signal
[POS]:    Risk layer - order-book imbalance measurement
[UPDATE]: When dominance thresholds or level depth change
*/

use perpmaker_exchange::DepthSnapshot;
use rust_decimal::Decimal;

/// Levels aggregated per side.
pub const IMBALANCE_LEVELS: usize = 10;

/// One side dominates when it carries at least 3x the other.
pub const DOMINANCE_RATIO: Decimal = Decimal::from_parts(3, 0, 0, false, 0);

/// A position is force-closed when the book is at least 6x against it.
pub const EXTREME_RATIO: Decimal = Decimal::from_parts(6, 0, 0, false, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImbalanceLabel {
    Balanced,
    BuyDominant,
    SellDominant,
}

impl ImbalanceLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            ImbalanceLabel::Balanced => "balanced",
            ImbalanceLabel::BuyDominant => "buy_dominant",
            ImbalanceLabel::SellDominant => "sell_dominant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthImbalance {
    pub buy_sum: Decimal,
    pub sell_sum: Decimal,
    pub label: ImbalanceLabel,
}

impl DepthImbalance {
    /// Suppress fresh buys when sellers dominate the book.
    pub fn skip_buy_side(&self) -> bool {
        self.label == ImbalanceLabel::SellDominant
    }

    /// Suppress fresh sells when buyers dominate the book.
    pub fn skip_sell_side(&self) -> bool {
        self.label == ImbalanceLabel::BuyDominant
    }

    /// Extreme imbalance against an open position (>= 6x on the far side).
    pub fn extreme_against(&self, position_amt: Decimal) -> bool {
        if position_amt > Decimal::ZERO {
            dominates(self.sell_sum, self.buy_sum, EXTREME_RATIO)
        } else if position_amt < Decimal::ZERO {
            dominates(self.buy_sum, self.sell_sum, EXTREME_RATIO)
        } else {
            false
        }
    }
}

/// Aggregate the top levels of each side and label the book.
pub fn measure(depth: &DepthSnapshot) -> DepthImbalance {
    let buy_sum: Decimal = depth.bids.iter().take(IMBALANCE_LEVELS).map(|l| l.1).sum();
    let sell_sum: Decimal = depth.asks.iter().take(IMBALANCE_LEVELS).map(|l| l.1).sum();

    let label = if dominates(sell_sum, buy_sum, DOMINANCE_RATIO) {
        ImbalanceLabel::SellDominant
    } else if dominates(buy_sum, sell_sum, DOMINANCE_RATIO) {
        ImbalanceLabel::BuyDominant
    } else {
        ImbalanceLabel::Balanced
    };

    DepthImbalance { buy_sum, sell_sum, label }
}

fn dominates(side: Decimal, other: Decimal, ratio: Decimal) -> bool {
    if side <= Decimal::ZERO {
        return false;
    }
    // `other` empty with `side` populated counts as full dominance.
    if other <= Decimal::ZERO {
        return true;
    }
    side >= other * ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpmaker_exchange::DepthLevel;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn depth(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> DepthSnapshot {
        DepthSnapshot {
            symbol: "BTCUSDT".to_string(),
            bids: bids.iter().map(|(p, q)| DepthLevel(dec(p), dec(q))).collect(),
            asks: asks.iter().map(|(p, q)| DepthLevel(dec(p), dec(q))).collect(),
        }
    }

    #[test]
    fn balanced_book_has_no_dominance() {
        let snapshot = depth(&[("99.9", "1"), ("99.8", "1")], &[("100.1", "1.5"), ("100.2", "1")]);
        let result = measure(&snapshot);
        assert_eq!(result.label, ImbalanceLabel::Balanced);
        assert!(!result.skip_buy_side());
        assert!(!result.skip_sell_side());
    }

    #[test]
    fn triple_sell_size_suppresses_buys() {
        let snapshot = depth(&[("99.9", "0.2")], &[("100.1", "0.6")]);
        let result = measure(&snapshot);
        assert_eq!(result.label, ImbalanceLabel::SellDominant);
        assert!(result.skip_buy_side());
        assert!(!result.skip_sell_side());
    }

    #[test]
    fn sums_cap_at_ten_levels() {
        let bids: Vec<(String, String)> =
            (0..15).map(|i| (format!("{}", 100 - i), "1".to_string())).collect();
        let bids_ref: Vec<(&str, &str)> =
            bids.iter().map(|(p, q)| (p.as_str(), q.as_str())).collect();
        let snapshot = depth(&bids_ref, &[("101", "1")]);

        assert_eq!(measure(&snapshot).buy_sum, dec("10"));
    }

    #[test]
    fn extreme_imbalance_against_position() {
        // 7x sell-side dominance against a long.
        let snapshot = depth(&[("99.9", "0.1")], &[("100.1", "0.7")]);
        let result = measure(&snapshot);
        assert!(result.extreme_against(dec("0.3")));
        assert!(!result.extreme_against(dec("-0.3")));
        assert!(!result.extreme_against(Decimal::ZERO));
    }

    #[test]
    fn empty_far_side_counts_as_dominance() {
        let snapshot = depth(&[], &[("100.1", "0.4")]);
        let result = measure(&snapshot);
        assert_eq!(result.label, ImbalanceLabel::SellDominant);
        assert!(result.extreme_against(dec("1")));
    }

    #[test]
    fn empty_book_is_balanced() {
        let snapshot = depth(&[], &[]);
        assert_eq!(measure(&snapshot).label, ImbalanceLabel::Balanced);
    }
}
