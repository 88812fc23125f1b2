use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CATALOG_EPOCH_UNIX_SECS;

// ---------------------------------------------------------------------------
// Catalog time base
// ---------------------------------------------------------------------------

/// Catalog timestamps are integer minutes since 2011-01-01T00:00Z.
pub fn catalog_minutes_to_datetime(minutes: i64) -> DateTime<Utc> {
    let secs = CATALOG_EPOCH_UNIX_SECS + minutes * 60;
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Rounds down to the containing minute.
pub fn datetime_to_catalog_minutes(at: DateTime<Utc>) -> i64 {
    (at.timestamp() - CATALOG_EPOCH_UNIX_SECS).div_euclid(60)
}

/// Wall-clock source. Injected so recharge timeouts and watermark clamping are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// One entry of the "recently updated" feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    /// Catalog-reported update time, in catalog minutes.
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Not in storage. Must pass the peek before a commit is spent on it.
    Unseen,
    /// In storage with valid data. Gets a light commit and a volatile-field update.
    Existing,
    /// In storage but with invalid data. Skips the peek and is fully re-fetched.
    Zombie,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::Unseen => "unseen",
            Classification::Existing => "existing",
            Classification::Zombie => "zombie",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Catalog payloads
// ---------------------------------------------------------------------------

/// One column of catalog statistics. Prices are cents; `None` = no data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatPoint {
    pub amazon: Option<i64>,
    pub new: Option<i64>,
    pub used: Option<i64>,
    pub sales_rank: Option<i64>,
    pub new_offer_count: Option<i64>,
    pub used_offer_count: Option<i64>,
}

/// Cheap "peek" payload: summary statistics only, no history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub id: String,
    pub current: StatPoint,
    pub avg30: StatPoint,
    pub avg90: StatPoint,
    pub avg365: StatPoint,
    /// Number of sales-rank drops over the last 90 days (sales velocity proxy).
    pub rank_drops_90: Option<i64>,
    pub buy_box_used_price: Option<i64>,
}

/// Raw history as returned by a detail call. Each series is a flat
/// `[t0, v0, t1, v1, ...]` array in catalog minutes; the inference engine
/// validates and parses them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySeries {
    /// Reference "now" for the lookback window, in catalog minutes.
    pub as_of: i64,
    pub rank: Vec<i64>,
    pub used_price: Vec<i64>,
    pub new_price: Vec<i64>,
    pub used_offers: Vec<i64>,
    pub new_offers: Vec<i64>,
    /// `(catalog minute, seller id)` buy-box ownership changes.
    pub buy_box_sellers: Vec<(i64, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveOffer {
    pub seller_id: String,
    pub is_new: bool,
    pub price_cents: i64,
    pub shipping_cents: Option<i64>,
}

/// Expensive "commit" payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductDetail {
    pub id: String,
    pub title: Option<String>,
    pub summary: ProductSummary,
    pub history: HistorySeries,
    pub offers: Vec<LiveOffer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellerInfo {
    pub id: String,
    pub name: String,
    /// Positive rating percentage, 0–100.
    pub rating_pct: f64,
    pub rating_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub tokens_remaining: f64,
    pub refill_rate_per_minute: f64,
}

// ---------------------------------------------------------------------------
// Inferred sales
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Rank improved and the buy-box seller changed inside the window.
    High,
    /// Rank improved only.
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferKind {
    Used,
    New,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleEvent {
    /// Catalog minute of the offer-count drop that opened the window.
    pub at: i64,
    pub price_cents: i64,
    pub rank_before: i64,
    pub rank_after: i64,
    pub confidence: Confidence,
    pub offer_kind: OfferKind,
}

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Flat,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trend::Up => "up",
            Trend::Down => "down",
            Trend::Flat => "flat",
        };
        write!(f, "{s}")
    }
}

impl Trend {
    pub fn parse(s: &str) -> Self {
        match s {
            "up" => Trend::Up,
            "down" => Trend::Down,
            _ => Trend::Flat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowSource {
    /// Built by full enrichment.
    Full,
    /// Volatile fields refreshed by a lightweight update.
    Light,
}

impl std::fmt::Display for RowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowSource::Full => write!(f, "full"),
            RowSource::Light => write!(f, "light"),
        }
    }
}

/// One deal row, keyed by item id and superseded in place on every re-scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRow {
    pub id: String,
    pub title: Option<String>,

    // Volatile: refreshed on every scan.
    pub buy_price_cents: Option<i64>,
    pub sales_rank: Option<i64>,
    pub used_offer_count: Option<i64>,
    pub new_offer_count: Option<i64>,
    pub trend: Trend,

    // Expensive: only recomputed by full enrichment.
    pub list_at_cents: Option<i64>,
    pub avg_sale_1yr_cents: Option<i64>,
    pub recent_sale_cents: Option<i64>,
    pub profit_cents: Option<i64>,
    pub margin: Option<f64>,
    pub profit_confidence: Option<f64>,
    pub sale_events: i64,
    pub drop_candidates: i64,
    pub peak_month: Option<u32>,
    pub trough_month: Option<u32>,
    pub seller_id: Option<String>,
    pub seller_name: Option<String>,
    pub seller_quality: Option<f64>,
    pub derived: BTreeMap<String, f64>,

    /// Catalog update time of the scan that produced this row, in catalog minutes.
    pub catalog_updated_at: i64,
    pub last_seen: DateTime<Utc>,
    pub source: RowSource,
}

impl EnrichedRow {
    /// A stored row whose valuation is missing or nonsensical. Forces a full re-fetch.
    pub fn is_zombie(&self) -> bool {
        let missing = |v: Option<i64>| v.map_or(true, |c| c <= 0);
        missing(self.list_at_cents)
            || missing(self.avg_sale_1yr_cents)
            || self.profit_cents.is_some_and(|p| p <= 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_minutes_round_trip_through_datetime() {
        let at = catalog_minutes_to_datetime(7_000_000);
        assert_eq!(datetime_to_catalog_minutes(at), 7_000_000);
        assert_eq!(catalog_minutes_to_datetime(0).to_rfc3339(), "2011-01-01T00:00:00+00:00");
    }

    #[test]
    fn partial_minutes_round_down() {
        let at = catalog_minutes_to_datetime(10) + chrono::Duration::seconds(59);
        assert_eq!(datetime_to_catalog_minutes(at), 10);
    }

    #[test]
    fn zombie_detection_flags_missing_valuation() {
        let mut row = crate::testing::row("A1");
        assert!(!row.is_zombie());

        row.list_at_cents = None;
        assert!(row.is_zombie());

        let mut row = crate::testing::row("A2");
        row.avg_sale_1yr_cents = Some(0);
        assert!(row.is_zombie());

        let mut row = crate::testing::row("A3");
        row.profit_cents = Some(-100);
        assert!(row.is_zombie());

        let mut row = crate::testing::row("A4");
        row.profit_cents = None;
        assert!(!row.is_zombie(), "unknown profit alone is not a zombie");
    }
}
