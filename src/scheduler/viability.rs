use serde::Serialize;

use crate::config::ViabilityConfig;
use crate::types::ProductSummary;

/// Why a peeked candidate is not worth a detail call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No current used or new price.
    NoBuyPrice,
    /// No 90/365-day average to sell against.
    NoSellReference,
    BelowPriceFloor,
    ThinMargin,
    LowRoi,
    LowVelocity,
}

/// Peek outcome counters for one run, logged when the run ends.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PeekStats {
    pub peeked: usize,
    pub rejected_no_buy_price: usize,
    pub rejected_no_sell_reference: usize,
    pub rejected_price_floor: usize,
    pub rejected_thin_margin: usize,
    pub rejected_low_roi: usize,
    pub rejected_low_velocity: usize,
    /// Unseen ids the summary call returned nothing for.
    pub missing: usize,
    pub viable: usize,
}

impl PeekStats {
    pub fn record(&mut self, outcome: Result<(), Rejection>) {
        self.peeked += 1;
        match outcome {
            Ok(()) => self.viable += 1,
            Err(Rejection::NoBuyPrice) => self.rejected_no_buy_price += 1,
            Err(Rejection::NoSellReference) => self.rejected_no_sell_reference += 1,
            Err(Rejection::BelowPriceFloor) => self.rejected_price_floor += 1,
            Err(Rejection::ThinMargin) => self.rejected_thin_margin += 1,
            Err(Rejection::LowRoi) => self.rejected_low_roi += 1,
            Err(Rejection::LowVelocity) => self.rejected_low_velocity += 1,
        }
    }

    pub fn rejected(&self) -> usize {
        self.peeked - self.viable
    }
}

/// Optimistic pre-filter on summary statistics. Buys at the current used price
/// (new as fallback) and sells at the best 90/365-day average of any condition.
pub fn check(s: &ProductSummary, cfg: &ViabilityConfig) -> Result<(), Rejection> {
    let positive = |v: Option<i64>| v.filter(|p| *p > 0);

    let buy = positive(s.current.used)
        .or(positive(s.current.new))
        .ok_or(Rejection::NoBuyPrice)?;

    let sell = [&s.avg90, &s.avg365]
        .iter()
        .flat_map(|p| [p.amazon, p.new, p.used])
        .filter_map(positive)
        .max()
        .ok_or(Rejection::NoSellReference)?;

    if sell < cfg.min_sell_price_cents {
        return Err(Rejection::BelowPriceFloor);
    }
    if sell - buy < cfg.min_margin_cents {
        return Err(Rejection::ThinMargin);
    }
    if ((sell - buy) as f64 / buy as f64) < cfg.min_gross_roi {
        return Err(Rejection::LowRoi);
    }
    if s.rank_drops_90.unwrap_or(0) < cfg.min_rank_drops_90 {
        return Err(Rejection::LowVelocity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatPoint;

    fn summary(buy: Option<i64>, sell: Option<i64>, drops: Option<i64>) -> ProductSummary {
        ProductSummary {
            id: "B000000001".to_string(),
            current: StatPoint { used: buy, ..StatPoint::default() },
            avg365: StatPoint { used: sell, ..StatPoint::default() },
            rank_drops_90: drops,
            ..ProductSummary::default()
        }
    }

    #[test]
    fn healthy_item_passes() {
        assert_eq!(check(&summary(Some(1000), Some(3000), Some(4)), &ViabilityConfig::default()), Ok(()));
    }

    #[test]
    fn buy_falls_back_to_new_price() {
        let mut s = summary(None, Some(3000), Some(4));
        s.current.new = Some(1500);
        assert_eq!(check(&s, &ViabilityConfig::default()), Ok(()));
    }

    #[test]
    fn sell_reference_is_the_best_average() {
        let mut s = summary(Some(1000), Some(1100), Some(4));
        s.avg90.amazon = Some(2500);
        assert_eq!(check(&s, &ViabilityConfig::default()), Ok(()));
    }

    #[test]
    fn rejections() {
        let cfg = ViabilityConfig::default();
        assert_eq!(check(&summary(None, Some(3000), Some(4)), &cfg), Err(Rejection::NoBuyPrice));
        assert_eq!(check(&summary(Some(1000), None, Some(4)), &cfg), Err(Rejection::NoSellReference));
        assert_eq!(check(&summary(Some(300), Some(1100), Some(4)), &cfg), Err(Rejection::BelowPriceFloor));
        assert_eq!(check(&summary(Some(1500), Some(1800), Some(4)), &cfg), Err(Rejection::ThinMargin));
        assert_eq!(check(&summary(Some(4000), Some(4600), Some(4)), &cfg), Err(Rejection::LowRoi));
        assert_eq!(check(&summary(Some(1000), Some(3000), Some(0)), &cfg), Err(Rejection::LowVelocity));
        assert_eq!(check(&summary(Some(1000), Some(3000), None), &cfg), Err(Rejection::LowVelocity));
    }

    #[test]
    fn stats_count_outcomes() {
        let mut stats = PeekStats::default();
        stats.record(Ok(()));
        stats.record(Err(Rejection::LowRoi));
        stats.record(Err(Rejection::LowRoi));
        assert_eq!(stats.peeked, 3);
        assert_eq!(stats.viable, 1);
        assert_eq!(stats.rejected_low_roi, 2);
        assert_eq!(stats.rejected(), 2);
    }
}
