//! Sale-event inference: turns raw rank / price / offer-count history into
//! discrete "sold for X at time T" events.
//!
//! A sale is inferred when an offer-count drop is followed, inside a forward
//! search window, by a strict sales-rank improvement. Prices come from the
//! price series entry nearest the drop. Inflated prices are then rejected
//! with an upper IQR fence.

pub mod outliers;

use tracing::debug;

use crate::config::{InferenceConfig, WindowBoundary};
use crate::types::{Confidence, HistorySeries, OfferKind, SaleEvent};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceResult {
    /// Surviving events, oldest first.
    pub events: Vec<SaleEvent>,
    /// Every offer-count drop inside the lookback window, matched or not.
    pub drop_candidates: usize,
}

type Points = Vec<(i64, i64)>;

/// Parses a flat `[t0, v0, t1, v1, ...]` series. `None` when odd-length or
/// not in chronological order.
fn parse_series(flat: &[i64]) -> Option<Points> {
    if flat.len() % 2 != 0 {
        return None;
    }
    let points: Points = flat.chunks_exact(2).map(|p| (p[0], p[1])).collect();
    if points.windows(2).any(|w| w[1].0 < w[0].0) {
        return None;
    }
    Some(points)
}

fn clip(points: Points, since: i64) -> Points {
    points.into_iter().filter(|(t, _)| *t >= since).collect()
}

/// Offer-count drops: every strictly negative first difference.
fn offer_drops(points: &[(i64, i64)], kind: OfferKind) -> Vec<(i64, OfferKind)> {
    points
        .windows(2)
        .filter(|w| w[1].1 < w[0].1)
        .map(|w| (w[1].0, kind))
        .collect()
}

/// Value of the point nearest `t`. Ties resolve to the earlier point.
fn nearest_value(points: &[(i64, i64)], t: i64) -> Option<i64> {
    points
        .iter()
        .min_by_key(|(pt, _)| ((pt - t).abs(), *pt))
        .map(|(_, v)| *v)
}

fn in_window(t: i64, start: i64, end: i64, boundary: WindowBoundary) -> bool {
    let after_start = match boundary {
        WindowBoundary::Inclusive => t >= start,
        WindowBoundary::Exclusive => t > start,
    };
    after_start && t <= end
}

/// First strict rank improvement (value lower than its predecessor) inside the window.
fn rank_improvement(rank: &[(i64, i64)], start: i64, end: i64, boundary: WindowBoundary) -> Option<(i64, i64)> {
    rank.windows(2)
        .find(|w| in_window(w[1].0, start, end, boundary) && w[1].1 < w[0].1)
        .map(|w| (w[0].1, w[1].1))
}

/// Whether buy-box ownership moves to a different seller inside the window.
fn buy_box_changed(sellers: &[(i64, String)], start: i64, end: i64, boundary: WindowBoundary) -> bool {
    let before = sellers
        .iter()
        .take_while(|(t, _)| *t < start)
        .last()
        .map(|(_, s)| s.as_str());

    sellers
        .iter()
        .filter(|(t, _)| in_window(*t, start, end, boundary))
        .any(|(_, s)| before.map_or(true, |b| b != s.as_str()))
}

/// Infers sale events from one item's history. Deterministic; malformed or
/// missing input yields an empty result, never an error.
pub fn infer(history: &HistorySeries, cfg: &InferenceConfig) -> InferenceResult {
    let parsed = (
        parse_series(&history.rank),
        parse_series(&history.used_offers),
        parse_series(&history.new_offers),
        parse_series(&history.used_price),
        parse_series(&history.new_price),
    );
    let (Some(rank), Some(used_offers), Some(new_offers), Some(used_price), Some(new_price)) = parsed else {
        debug!("[INFER] malformed history series, skipping");
        return InferenceResult::default();
    };
    if history.buy_box_sellers.windows(2).any(|w| w[1].0 < w[0].0) {
        debug!("[INFER] buy-box history out of order, skipping");
        return InferenceResult::default();
    }

    let since = history.as_of - cfg.lookback_minutes;
    let rank = clip(rank, since);
    let used_offers = clip(used_offers, since);
    let new_offers = clip(new_offers, since);
    let used_price = clip(used_price, since);
    let new_price = clip(new_price, since);

    if rank.len() < 2 || (used_offers.len() < 2 && new_offers.len() < 2) {
        return InferenceResult::default();
    }

    let mut drops = offer_drops(&used_offers, OfferKind::Used);
    drops.extend(offer_drops(&new_offers, OfferKind::New));
    drops.sort_by_key(|(t, kind)| (*t, *kind == OfferKind::New));
    let drop_candidates = drops.len();

    let mut matched = Vec::new();
    for (start, kind) in drops {
        let end = start + cfg.search_window_minutes;
        let Some((rank_before, rank_after)) = rank_improvement(&rank, start, end, cfg.window_boundary) else {
            continue;
        };

        let prices = match kind {
            OfferKind::New if !new_price.is_empty() => &new_price,
            _ => &used_price,
        };
        let Some(price_cents) = nearest_value(prices, start).filter(|p| *p > 0) else {
            continue;
        };

        let confidence = if buy_box_changed(&history.buy_box_sellers, start, end, cfg.window_boundary) {
            Confidence::High
        } else {
            Confidence::Medium
        };

        matched.push(SaleEvent {
            at: start,
            price_cents,
            rank_before,
            rank_after,
            confidence,
            offer_kind: kind,
        });
    }

    let prices: Vec<i64> = matched.iter().map(|e| e.price_cents).collect();
    let events = match outliers::upper_fence(&prices, cfg.iqr_multiplier) {
        Some(fence) => {
            let before = matched.len();
            let kept: Vec<SaleEvent> = matched.into_iter().filter(|e| e.price_cents as f64 <= fence).collect();
            if kept.len() < before {
                debug!(rejected = before - kept.len(), fence, "[INFER] rejected price outliers");
            }
            kept
        }
        None => matched,
    };

    InferenceResult { events, drop_candidates }
}
