use std::collections::{BTreeMap, HashMap};

use chrono::Datelike;

use crate::config::WAREHOUSE_SELLER_ID;
use crate::inference::InferenceResult;
use crate::types::{catalog_minutes_to_datetime, ProductDetail, ProductSummary};

const MINUTES_PER_YEAR: i64 = 365 * 24 * 60;

/// Minimum inferred sales before seasonality and "list at" are attempted.
const MIN_SALES_FOR_SEASONALITY: usize = 3;

/// Expensive, history-derived figures. Only recomputed by full enrichment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Valuation {
    pub avg_sale_1yr_cents: Option<i64>,
    pub recent_sale_cents: Option<i64>,
    pub profit_confidence: Option<f64>,
    pub peak_month: Option<u32>,
    pub trough_month: Option<u32>,
    pub list_at_cents: Option<i64>,
}

pub fn value(inference: &InferenceResult, as_of: i64, summary: &ProductSummary) -> Valuation {
    let events = &inference.events;

    let since = as_of - MINUTES_PER_YEAR;
    let last_year: Vec<i64> = events.iter().filter(|e| e.at >= since).map(|e| e.price_cents).collect();
    let avg_sale_1yr_cents = if last_year.is_empty() {
        summary.avg365.used.filter(|v| *v > 0)
    } else {
        Some((last_year.iter().sum::<i64>() as f64 / last_year.len() as f64).round() as i64)
    };

    let profit_confidence =
        (inference.drop_candidates > 0).then(|| events.len() as f64 / inference.drop_candidates as f64);

    let mut v = Valuation {
        avg_sale_1yr_cents,
        recent_sale_cents: events.last().map(|e| e.price_cents),
        profit_confidence,
        ..Valuation::default()
    };

    if events.len() < MIN_SALES_FOR_SEASONALITY {
        return v;
    }

    let mut by_month: BTreeMap<u32, Vec<i64>> = BTreeMap::new();
    for e in events {
        by_month
            .entry(catalog_minutes_to_datetime(e.at).month())
            .or_default()
            .push(e.price_cents);
    }
    if by_month.len() < 2 {
        return v;
    }

    let medians: Vec<(u32, f64)> = by_month.iter().map(|(m, prices)| (*m, median(prices))).collect();
    // Ties resolve to the earliest month.
    let peak = medians.iter().fold(medians[0], |best, m| if m.1 > best.1 { *m } else { best });
    let trough = medians.iter().fold(medians[0], |best, m| if m.1 < best.1 { *m } else { best });

    v.peak_month = Some(peak.0);
    v.trough_month = Some(trough.0);
    v.list_at_cents = by_month
        .get(&peak.0)
        .map(|prices| mode(prices).unwrap_or_else(|| median(prices).round() as i64));
    v
}

fn median(values: &[i64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    }
}

/// Most frequent value, only when it occurs more than once. Ties resolve to the lowest value.
fn mode(values: &[i64]) -> Option<i64> {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for v in values {
        *counts.entry(*v).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, c)| *c > 1)
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(v, _)| v)
}

/// Cheapest way to buy the item used right now.
#[derive(Debug, Clone, PartialEq)]
pub struct BuyPrice {
    pub price_cents: i64,
    /// Known only when a live offer beat the aggregate statistics.
    pub seller_id: Option<String>,
}

/// Lowest live used offer (price + shipping, warehouse outlet excluded),
/// compared against the current-used and used-buy-box statistics.
pub fn best_used_offer(detail: &ProductDetail) -> Option<BuyPrice> {
    let live = detail
        .offers
        .iter()
        .filter(|o| !o.is_new && o.seller_id != WAREHOUSE_SELLER_ID)
        .map(|o| (o.price_cents + o.shipping_cents.unwrap_or(0), o))
        .filter(|(total, _)| *total > 0)
        .min_by_key(|(total, _)| *total);

    let stats = [detail.summary.current.used, detail.summary.buy_box_used_price]
        .into_iter()
        .flatten()
        .filter(|p| *p > 0)
        .min();

    match (live.filter(|(total, _)| stats.map_or(true, |s| *total <= s)), stats) {
        (Some((total, offer)), _) => Some(BuyPrice {
            price_cents: total,
            seller_id: Some(offer.seller_id.clone()),
        }),
        (None, Some(s)) => Some(BuyPrice { price_cents: s, seller_id: None }),
        (None, None) => None,
    }
}

/// Wilson score lower bound (95%) of a seller's positive-rating share. 0 for unrated sellers.
pub fn wilson_lower_bound(positive: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    let z = 1.96_f64;
    let p = positive / total;
    let z2 = z * z;
    let numerator = p + z2 / (2.0 * total) - z * ((p * (1.0 - p) / total) + z2 / (4.0 * total * total)).sqrt();
    (numerator / (1.0 + z2 / total)).max(0.0)
}

pub fn profit_and_margin(list_at: Option<i64>, buy: Option<i64>) -> (Option<i64>, Option<f64>) {
    match (list_at, buy) {
        (Some(list_at), Some(buy)) if list_at > 0 => {
            let profit = list_at - buy;
            (Some(profit), Some(profit as f64 / list_at as f64))
        }
        _ => (None, None),
    }
}
