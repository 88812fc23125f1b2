use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::api::latency::LatencyStats;
use crate::client::{BudgetAuthority, CallClient, CallResponse};
use crate::error::{AppError, Result};
use crate::types::{
    datetime_to_catalog_minutes, BudgetStatus, Candidate, HistorySeries, LiveOffer, ProductDetail,
    ProductSummary, SellerInfo, StatPoint,
};

// Column indices shared by the `csv` history arrays and the `stats` arrays.
const IDX_AMAZON: usize = 0;
const IDX_NEW: usize = 1;
const IDX_USED: usize = 2;
const IDX_SALES_RANK: usize = 3;
const IDX_COUNT_NEW: usize = 11;
const IDX_COUNT_USED: usize = 12;

/// Offer condition code for "new" on live offers.
const CONDITION_NEW: i64 = 1;

/// Sort order of the deal feed that yields most-recently-updated first.
const SORT_LAST_UPDATE: u32 = 4;

/// HTTP client for the Keepa catalog API.
pub struct KeepaClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    latency: Arc<LatencyStats>,
}

impl KeepaClient {
    pub fn new(base_url: String, api_key: String, latency: Arc<LatencyStats>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { http, base_url, api_key, latency })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let started = Instant::now();

        let resp = self
            .http
            .get(&url)
            .query(&[("key", self.api_key.as_str())])
            .query(query)
            .send()
            .await;
        self.latency.record(started.elapsed());

        let resp = resp?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body_short: String = body.chars().take(200).collect();
            return Err(AppError::Api(format!("/{path} returned {status}: {body_short}")));
        }

        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl BudgetAuthority for KeepaClient {
    async fn fetch_budget_status(&self) -> Result<BudgetStatus> {
        let raw: TokenResponse = self.get("token", &[]).await?;
        Ok(BudgetStatus {
            tokens_remaining: raw.tokens_left,
            refill_rate_per_minute: raw.refill_rate,
        })
    }
}

#[async_trait]
impl CallClient for KeepaClient {
    async fn fetch_candidate_page(&self, page: u32, newest_first: bool) -> Result<CallResponse<Vec<Candidate>>> {
        let selection = serde_json::json!({
            "page": page,
            "domainId": 1,
            "sortType": if newest_first { SORT_LAST_UPDATE } else { 0 },
            "dateRange": 3,
            "isFilterEnabled": true,
        });
        let raw: DealResponse = self.get("deal", &[("selection", selection.to_string())]).await?;

        let candidates = raw
            .deals
            .dr
            .into_iter()
            .filter(|d| valid_id(&d.asin))
            .map(|d| Candidate { id: d.asin, updated_at: d.last_update })
            .collect::<Vec<_>>();
        debug!(page, count = candidates.len(), "[KEEPA] candidate page");

        Ok(CallResponse::new(candidates, raw.tokens_left))
    }

    async fn fetch_summary_batch(&self, ids: &[String]) -> Result<CallResponse<Vec<ProductSummary>>> {
        let raw: ProductResponse = self
            .get(
                "product",
                &[
                    ("domain", "1".to_string()),
                    ("asin", ids.join(",")),
                    ("stats", "365".to_string()),
                    ("history", "0".to_string()),
                ],
            )
            .await?;
        let summaries = raw.products.iter().map(parse_summary).collect();
        Ok(CallResponse::new(summaries, raw.tokens_left))
    }

    async fn fetch_detail_batch(&self, ids: &[String], lookback_days: u32) -> Result<CallResponse<Vec<ProductDetail>>> {
        let days = lookback_days.to_string();
        let raw: ProductResponse = self
            .get(
                "product",
                &[
                    ("domain", "1".to_string()),
                    ("asin", ids.join(",")),
                    ("stats", "365".to_string()),
                    ("days", days),
                    ("offers", "20".to_string()),
                    ("rating", "1".to_string()),
                    ("buybox", "1".to_string()),
                    ("only_live_offers", "1".to_string()),
                ],
            )
            .await?;
        let as_of = datetime_to_catalog_minutes(chrono::Utc::now());
        let details = raw.products.iter().map(|p| parse_detail(p, as_of)).collect();
        Ok(CallResponse::new(details, raw.tokens_left))
    }

    async fn fetch_seller_batch(&self, ids: &[String]) -> Result<CallResponse<Vec<SellerInfo>>> {
        let raw: SellerResponse = self
            .get("seller", &[("domain", "1".to_string()), ("seller", ids.join(","))])
            .await?;
        let sellers = raw
            .sellers
            .into_iter()
            .map(|(id, s)| SellerInfo {
                id,
                name: s.seller_name.unwrap_or_default(),
                rating_pct: s.current_rating.unwrap_or(0) as f64,
                rating_count: s.current_rating_count.unwrap_or(0),
            })
            .collect();
        Ok(CallResponse::new(sellers, raw.tokens_left))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    tokens_left: f64,
    #[serde(default)]
    refill_rate: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DealResponse {
    #[serde(default)]
    deals: DealPage,
    tokens_left: Option<f64>,
}

#[derive(Deserialize, Default)]
struct DealPage {
    #[serde(default)]
    dr: Vec<RawDeal>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeal {
    asin: String,
    last_update: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductResponse {
    #[serde(default)]
    products: Vec<RawProduct>,
    tokens_left: Option<f64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawProduct {
    asin: String,
    title: Option<String>,
    #[serde(default)]
    csv: Vec<Option<Vec<i64>>>,
    stats: Option<RawStats>,
    #[serde(default)]
    offers: Vec<RawOffer>,
    /// Flat `[time, sellerId, time, sellerId, ...]`, times as strings.
    #[serde(default)]
    buy_box_seller_id_history: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawStats {
    #[serde(default)]
    current: Vec<i64>,
    #[serde(default)]
    avg30: Vec<i64>,
    #[serde(default)]
    avg90: Vec<i64>,
    #[serde(default)]
    avg365: Vec<i64>,
    sales_rank_drops90: Option<i64>,
    buy_box_used_price: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOffer {
    seller_id: Option<String>,
    condition: Option<i64>,
    /// Flat `[time, price, shipping, ...]`; the last pair is the current price and shipping.
    #[serde(default, rename = "offerCSV")]
    offer_csv: Vec<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SellerResponse {
    #[serde(default)]
    sellers: HashMap<String, RawSeller>,
    tokens_left: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSeller {
    seller_name: Option<String>,
    current_rating: Option<i64>,
    current_rating_count: Option<i64>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn valid_id(id: &str) -> bool {
    id.len() == 10 && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// `-1` (and any negative) means "no data".
fn cell(values: &[i64], idx: usize) -> Option<i64> {
    values.get(idx).copied().filter(|v| *v >= 0)
}

fn stat_point(values: &[i64]) -> StatPoint {
    StatPoint {
        amazon: cell(values, IDX_AMAZON),
        new: cell(values, IDX_NEW),
        used: cell(values, IDX_USED),
        sales_rank: cell(values, IDX_SALES_RANK),
        new_offer_count: cell(values, IDX_COUNT_NEW),
        used_offer_count: cell(values, IDX_COUNT_USED),
    }
}

fn parse_summary(p: &RawProduct) -> ProductSummary {
    let stats = p.stats.as_ref();
    let point = |values: Option<&Vec<i64>>| values.map(|v| stat_point(v)).unwrap_or_default();

    ProductSummary {
        id: p.asin.clone(),
        current: point(stats.map(|s| &s.current)),
        avg30: point(stats.map(|s| &s.avg30)),
        avg90: point(stats.map(|s| &s.avg90)),
        avg365: point(stats.map(|s| &s.avg365)),
        rank_drops_90: stats.and_then(|s| s.sales_rank_drops90).filter(|v| *v >= 0),
        buy_box_used_price: stats.and_then(|s| s.buy_box_used_price).filter(|v| *v > 0),
    }
}

fn parse_detail(p: &RawProduct, as_of: i64) -> ProductDetail {
    let series = |idx: usize| p.csv.get(idx).cloned().flatten().unwrap_or_default();

    let buy_box_sellers = p
        .buy_box_seller_id_history
        .chunks_exact(2)
        .filter_map(|pair| Some((pair[0].parse::<i64>().ok()?, pair[1].clone())))
        .collect();

    let offers = p
        .offers
        .iter()
        .filter_map(|o| {
            let n = o.offer_csv.len();
            if n < 3 {
                return None;
            }
            Some(LiveOffer {
                seller_id: o.seller_id.clone()?,
                is_new: o.condition == Some(CONDITION_NEW),
                price_cents: o.offer_csv[n - 2],
                shipping_cents: Some(o.offer_csv[n - 1]).filter(|s| *s >= 0),
            })
        })
        .collect();

    ProductDetail {
        id: p.asin.clone(),
        title: p.title.clone(),
        summary: parse_summary(p),
        history: HistorySeries {
            as_of,
            rank: series(IDX_SALES_RANK),
            used_price: series(IDX_USED),
            new_price: series(IDX_NEW),
            used_offers: series(IDX_COUNT_USED),
            new_offers: series(IDX_COUNT_NEW),
            buy_box_sellers,
        },
        offers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_stats_cells_are_none() {
        let p = stat_point(&[-1, 2500, -1, 120_000]);
        assert_eq!(p.amazon, None);
        assert_eq!(p.new, Some(2500));
        assert_eq!(p.used, None);
        assert_eq!(p.sales_rank, Some(120_000));
        assert_eq!(p.used_offer_count, None);
    }

    #[test]
    fn parses_product_payload() {
        let json = r#"{
            "products": [{
                "asin": "0123456789",
                "title": "A Book",
                "csv": [null, [100, 3000], [100, 1500, 200, 1400], [100, 50000, 300, 20000],
                        null, null, null, null, null, null, null,
                        [100, 4], [100, 7, 200, 6]],
                "stats": {
                    "current": [-1, 3000, 1400, 20000, -1, -1, -1, -1, -1, -1, -1, 4, 6],
                    "avg90": [-1, 3100, 1600, 30000],
                    "avg365": [-1, 3200, 1800, 40000],
                    "salesRankDrops90": 12,
                    "buyBoxUsedPrice": -1
                },
                "offers": [
                    {"sellerId": "S1", "condition": 2, "offerCSV": [100, 1500, 399]},
                    {"sellerId": "S2", "condition": 1, "offerCSV": [100, 2500, -1]},
                    {"sellerId": "S3", "condition": 3, "offerCSV": [100]}
                ],
                "buyBoxSellerIdHistory": ["100", "S1", "200", "S2"]
            }],
            "tokensLeft": 412
        }"#;

        let raw: ProductResponse = serde_json::from_str(json).unwrap();
        assert_eq!(raw.tokens_left, Some(412.0));

        let d = parse_detail(&raw.products[0], 1000);
        assert_eq!(d.id, "0123456789");
        assert_eq!(d.history.used_price, vec![100, 1500, 200, 1400]);
        assert_eq!(d.history.used_offers, vec![100, 7, 200, 6]);
        assert_eq!(d.history.buy_box_sellers, vec![(100, "S1".to_string()), (200, "S2".to_string())]);
        assert_eq!(d.summary.current.used, Some(1400));
        assert_eq!(d.summary.current.used_offer_count, Some(6));
        assert_eq!(d.summary.rank_drops_90, Some(12));
        assert_eq!(d.summary.buy_box_used_price, None);

        assert_eq!(d.offers.len(), 2, "truncated offer history is skipped");
        assert_eq!(d.offers[0].shipping_cents, Some(399));
        assert!(d.offers[1].is_new);
        assert_eq!(d.offers[1].shipping_cents, None);
    }

    #[test]
    fn deal_page_filters_invalid_ids() {
        let json = r#"{"deals": {"dr": [
            {"asin": "B000000001", "lastUpdate": 7000000},
            {"asin": "bad", "lastUpdate": 7000001}
        ]}, "tokensLeft": 90}"#;
        let raw: DealResponse = serde_json::from_str(json).unwrap();
        let ids: Vec<_> = raw.deals.dr.iter().filter(|d| valid_id(&d.asin)).map(|d| d.asin.as_str()).collect();
        assert_eq!(ids, vec!["B000000001"]);
    }
}
