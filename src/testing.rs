//! Shared fakes for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::client::{BudgetAuthority, CallClient, CallResponse};
use crate::db::PersistenceGateway;
use crate::error::{AppError, Result};
use crate::types::{
    datetime_to_catalog_minutes, BudgetStatus, Candidate, Clock, EnrichedRow, HistorySeries, LiveOffer, ProductDetail,
    ProductSummary, RowSource, SellerInfo, StatPoint, Trend,
};

/// A stored, fully valued (non-zombie) row.
pub fn row(id: &str) -> EnrichedRow {
    EnrichedRow {
        id: id.to_string(),
        title: Some(format!("Title {id}")),
        buy_price_cents: Some(1200),
        sales_rank: Some(80_000),
        used_offer_count: Some(7),
        new_offer_count: Some(2),
        trend: Trend::Flat,
        list_at_cents: Some(3200),
        avg_sale_1yr_cents: Some(2900),
        recent_sale_cents: Some(3100),
        profit_cents: Some(2000),
        margin: Some(0.625),
        profit_confidence: Some(0.5),
        sale_events: 4,
        drop_candidates: 8,
        peak_month: Some(9),
        trough_month: Some(3),
        seller_id: None,
        seller_name: None,
        seller_quality: None,
        derived: BTreeMap::new(),
        catalog_updated_at: 7_000_000,
        last_seen: Utc::now(),
        source: RowSource::Full,
    }
}

pub async fn memory_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Summary that passes the default viability filter.
pub fn viable_summary(id: &str) -> ProductSummary {
    ProductSummary {
        id: id.to_string(),
        current: StatPoint { used: Some(1000), sales_rank: Some(90_000), ..StatPoint::default() },
        avg365: StatPoint { used: Some(3000), ..StatPoint::default() },
        rank_drops_90: Some(5),
        ..ProductSummary::default()
    }
}

/// Detail with four clean sales at 30.00 spread over two months, and a live
/// used offer at 10.00 from seller `S1`. Enriches to a non-zombie row.
pub fn rich_detail(id: &str, now: DateTime<Utc>) -> ProductDetail {
    const DAY: i64 = 24 * 60;
    let as_of = datetime_to_catalog_minutes(now);
    let mut h = HistorySeries { as_of, ..HistorySeries::default() };

    let start = as_of - 70 * DAY;
    let mut offers = 10;
    let mut rank = 300_000;
    h.used_offers.extend([start, offers]);
    h.rank.extend([start, rank]);
    for days_ago in [60, 55, 20, 15] {
        let t = as_of - days_ago * DAY;
        offers -= 1;
        h.used_offers.extend([t, offers]);
        h.used_price.extend([t, 3000]);
        h.rank.extend([t - 100, rank + 50_000]);
        rank -= 10_000;
        h.rank.extend([t + 60, rank]);
    }

    let mut summary = viable_summary(id);
    summary.current.used = Some(1200);
    summary.current.used_offer_count = Some(offers);

    ProductDetail {
        id: id.to_string(),
        title: Some(format!("Title {id}")),
        summary,
        history: h,
        offers: vec![LiveOffer {
            seller_id: "S1".to_string(),
            is_new: false,
            price_cents: 1000,
            shipping_cents: None,
        }],
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Budget authority
// ---------------------------------------------------------------------------

pub struct FakeAuthority {
    status: Mutex<BudgetStatus>,
    calls: AtomicUsize,
}

impl FakeAuthority {
    pub fn new(tokens: f64, refill_rate: f64) -> Self {
        Self {
            status: Mutex::new(BudgetStatus { tokens_remaining: tokens, refill_rate_per_minute: refill_rate }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, tokens: f64, refill_rate: f64) {
        *self.status.lock().unwrap() = BudgetStatus { tokens_remaining: tokens, refill_rate_per_minute: refill_rate };
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BudgetAuthority for FakeAuthority {
    async fn fetch_budget_status(&self) -> Result<BudgetStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.status.lock().unwrap())
    }
}

// ---------------------------------------------------------------------------
// Call client
// ---------------------------------------------------------------------------

/// Catalog fake. Pages are served by index and never consumed; batch calls
/// return whatever has been registered for the requested ids. Never reports
/// a balance, so the budget only moves by granted costs.
#[derive(Default)]
pub struct ScriptedCallClient {
    pages: Mutex<Vec<Vec<Candidate>>>,
    summaries: DashMap<String, ProductSummary>,
    details: DashMap<String, ProductDetail>,
    sellers: DashMap<String, SellerInfo>,
    fail_details: AtomicBool,
    fail_pages_from: Mutex<Option<u32>>,
    page_calls: AtomicUsize,
    seller_calls: AtomicUsize,
    summary_requests: Mutex<Vec<Vec<String>>>,
    detail_requests: Mutex<Vec<(Vec<String>, u32)>>,
}

impl ScriptedCallClient {
    pub fn add_page(&self, page: Vec<Candidate>) {
        self.pages.lock().unwrap().push(page);
    }

    pub fn add_summary(&self, s: ProductSummary) {
        self.summaries.insert(s.id.clone(), s);
    }

    pub fn add_detail(&self, d: ProductDetail) {
        self.details.insert(d.id.clone(), d);
    }

    pub fn add_seller(&self, s: SellerInfo) {
        self.sellers.insert(s.id.clone(), s);
    }

    pub fn fail_details(&self, fail: bool) {
        self.fail_details.store(fail, Ordering::SeqCst);
    }

    /// Page `page` and every later page return an API error.
    pub fn fail_pages_from(&self, page: u32) {
        *self.fail_pages_from.lock().unwrap() = Some(page);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn seller_calls(&self) -> usize {
        self.seller_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_requests.lock().unwrap().len()
    }

    pub fn summary_requests(&self) -> Vec<Vec<String>> {
        self.summary_requests.lock().unwrap().clone()
    }

    pub fn detail_requests(&self) -> Vec<(Vec<String>, u32)> {
        self.detail_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BudgetAuthority for ScriptedCallClient {
    async fn fetch_budget_status(&self) -> Result<BudgetStatus> {
        Ok(BudgetStatus { tokens_remaining: 10_000.0, refill_rate_per_minute: 50.0 })
    }
}

#[async_trait]
impl CallClient for ScriptedCallClient {
    async fn fetch_candidate_page(&self, page: u32, _newest_first: bool) -> Result<CallResponse<Vec<Candidate>>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pages_from.lock().unwrap().is_some_and(|from| page >= from) {
            return Err(AppError::Api(format!("scripted page {page} failure")));
        }
        let pages = self.pages.lock().unwrap();
        Ok(CallResponse::new(pages.get(page as usize).cloned().unwrap_or_default(), None))
    }

    async fn fetch_summary_batch(&self, ids: &[String]) -> Result<CallResponse<Vec<ProductSummary>>> {
        self.summary_requests.lock().unwrap().push(ids.to_vec());
        let found = ids.iter().filter_map(|id| self.summaries.get(id).map(|s| s.clone())).collect();
        Ok(CallResponse::new(found, None))
    }

    async fn fetch_detail_batch(&self, ids: &[String], lookback_days: u32) -> Result<CallResponse<Vec<ProductDetail>>> {
        if self.fail_details.load(Ordering::SeqCst) {
            return Err(AppError::Api("scripted detail failure".to_string()));
        }
        self.detail_requests.lock().unwrap().push((ids.to_vec(), lookback_days));
        let found = ids.iter().filter_map(|id| self.details.get(id).map(|d| d.clone())).collect();
        Ok(CallResponse::new(found, None))
    }

    async fn fetch_seller_batch(&self, ids: &[String]) -> Result<CallResponse<Vec<SellerInfo>>> {
        self.seller_calls.fetch_add(1, Ordering::SeqCst);
        let found = ids.iter().filter_map(|id| self.sellers.get(id).map(|s| s.clone())).collect();
        Ok(CallResponse::new(found, None))
    }
}

// ---------------------------------------------------------------------------
// Persistence gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryGateway {
    rows: DashMap<String, EnrichedRow>,
    watermark: Mutex<Option<DateTime<Utc>>>,
    saved_watermarks: Mutex<Vec<DateTime<Utc>>>,
    fail_upserts: AtomicBool,
}

impl MemoryGateway {
    pub fn insert_row(&self, row: EnrichedRow) {
        self.rows.insert(row.id.clone(), row);
    }

    pub fn row(&self, id: &str) -> Option<EnrichedRow> {
        self.rows.get(id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn set_watermark(&self, at: DateTime<Utc>) {
        *self.watermark.lock().unwrap() = Some(at);
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.lock().unwrap()
    }

    pub fn saved_watermarks(&self) -> Vec<DateTime<Utc>> {
        self.saved_watermarks.lock().unwrap().clone()
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.watermark())
    }

    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        self.saved_watermarks.lock().unwrap().push(at);
        self.set_watermark(at);
        Ok(())
    }

    async fn load_existing_snapshot(&self, ids: &[String]) -> Result<HashMap<String, EnrichedRow>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.row(id).map(|r| (id.clone(), r)))
            .collect())
    }

    async fn upsert_rows(&self, rows: &[EnrichedRow]) -> Result<usize> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(AppError::Store("scripted upsert failure".to_string()));
        }
        for r in rows {
            self.insert_row(r.clone());
        }
        Ok(rows.len())
    }

    async fn delete_rows(&self, ids: &[String]) -> Result<u64> {
        Ok(ids.iter().filter(|id| self.rows.remove(id.as_str()).is_some()).count() as u64)
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.rows.len();
        self.rows.retain(|_, r| r.last_seen >= cutoff);
        Ok((before - self.rows.len()) as u64)
    }
}
