use crate::types::{ProductDetail, ProductSummary, Trend};

/// Number of trailing unique price points the trend looks at, by 365-day average rank.
/// Fast movers reprice often, so they get a longer sample.
fn trend_sample_size(avg_rank: Option<i64>) -> usize {
    match avg_rank {
        Some(r) if r > 0 && r < 100_000 => 10,
        Some(r) if r > 0 && r < 500_000 => 5,
        _ => 3,
    }
}

/// Price direction over the most recent unique used/new price points.
pub fn trend(detail: &ProductDetail) -> Trend {
    let h = &detail.history;
    let mut points: Vec<(i64, i64)> = h
        .new_price
        .chunks_exact(2)
        .chain(h.used_price.chunks_exact(2))
        .map(|p| (p[0], p[1]))
        .filter(|(_, v)| *v > 0)
        .collect();
    points.sort_unstable();

    let mut unique: Vec<i64> = points.into_iter().map(|(_, v)| v).collect();
    unique.dedup();

    let n = trend_sample_size(detail.summary.avg365.sales_rank);
    let window = &unique[unique.len().saturating_sub(n)..];
    match (window.first(), window.last()) {
        (Some(first), Some(last)) if window.len() >= 2 => match last.cmp(first) {
            std::cmp::Ordering::Greater => Trend::Up,
            std::cmp::Ordering::Less => Trend::Down,
            std::cmp::Ordering::Equal => Trend::Flat,
        },
        _ => Trend::Flat,
    }
}

/// Percent the current used price sits below its 365-day average (negative = above).
pub fn percent_down_365(s: &ProductSummary) -> Option<f64> {
    let current = s.current.used?;
    let avg = s.avg365.used.filter(|v| *v > 0)?;
    Some((avg - current) as f64 / avg as f64 * 100.0)
}

/// Percent change of the current sales rank versus its 30-day average.
pub fn sales_rank_trend_30(s: &ProductSummary) -> Option<f64> {
    let current = s.current.sales_rank?;
    let avg = s.avg30.sales_rank.filter(|v| *v > 0)?;
    Some((current - avg) as f64 / avg as f64 * 100.0)
}

/// Percent change of the current used-offer count versus its 30-day average.
pub fn offer_count_trend_30(s: &ProductSummary) -> Option<f64> {
    let current = s.current.used_offer_count?;
    let avg = s.avg30.used_offer_count.filter(|v| *v > 0)?;
    Some((current - avg) as f64 / avg as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatPoint;

    fn detail_with_prices(used: Vec<i64>, new: Vec<i64>, avg_rank: Option<i64>) -> ProductDetail {
        let mut d = ProductDetail::default();
        d.history.used_price = used;
        d.history.new_price = new;
        d.summary.avg365.sales_rank = avg_rank;
        d
    }

    #[test]
    fn trend_follows_recent_unique_prices() {
        // Slow mover: only the last 3 unique prices count (1800, 1500, 1600).
        let d = detail_with_prices(vec![1, 1000, 2, 1800, 3, 1800, 4, 1500, 5, 1600], vec![], Some(900_000));
        assert_eq!(trend(&d), Trend::Down);

        // Fast mover: the whole sample (1000 .. 1600).
        let d = detail_with_prices(vec![1, 1000, 2, 1800, 3, 1800, 4, 1500, 5, 1600], vec![], Some(50_000));
        assert_eq!(trend(&d), Trend::Up);
    }

    #[test]
    fn trend_merges_new_and_used_and_ignores_missing() {
        let d = detail_with_prices(vec![1, 1000, 3, -1], vec![2, 1200], None);
        assert_eq!(trend(&d), Trend::Up);

        let d = detail_with_prices(vec![1, 1000], vec![], None);
        assert_eq!(trend(&d), Trend::Flat);
    }

    #[test]
    fn percent_down_needs_positive_average() {
        let mut s = ProductSummary::default();
        s.current = StatPoint { used: Some(1500), ..StatPoint::default() };
        s.avg365 = StatPoint { used: Some(2000), ..StatPoint::default() };
        assert_eq!(percent_down_365(&s), Some(25.0));

        s.avg365.used = Some(0);
        assert_eq!(percent_down_365(&s), None);
    }

    #[test]
    fn rank_and_offer_trends() {
        let mut s = ProductSummary::default();
        s.current.sales_rank = Some(150_000);
        s.avg30.sales_rank = Some(100_000);
        s.current.used_offer_count = Some(8);
        s.avg30.used_offer_count = Some(10);
        assert_eq!(sales_rank_trend_30(&s), Some(50.0));
        assert_eq!(offer_count_trend_30(&s), Some(-20.0));
    }
}
