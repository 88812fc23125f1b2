//! Database row types matching `migrations/0001_init.sql`.
//! Used by sqlx for typed queries.

use std::collections::BTreeMap;

use crate::db::parse_ts;
use crate::error::Result;
use crate::types::{EnrichedRow, RowSource, Trend};

#[derive(Debug, sqlx::FromRow)]
pub struct DealRow {
    pub id: String,
    pub title: Option<String>,
    pub buy_price_cents: Option<i64>,
    pub sales_rank: Option<i64>,
    pub used_offer_count: Option<i64>,
    pub new_offer_count: Option<i64>,
    pub trend: String,
    pub list_at_cents: Option<i64>,
    pub avg_sale_1yr_cents: Option<i64>,
    pub recent_sale_cents: Option<i64>,
    pub profit_cents: Option<i64>,
    pub margin: Option<f64>,
    pub profit_confidence: Option<f64>,
    pub sale_events: i64,
    pub drop_candidates: i64,
    pub peak_month: Option<i64>,
    pub trough_month: Option<i64>,
    pub seller_id: Option<String>,
    pub seller_name: Option<String>,
    pub seller_quality: Option<f64>,
    pub derived: String,
    pub catalog_updated_at: i64,
    pub last_seen: String,
    pub source: String,
}

pub const DEAL_COLUMNS: &str = "id, title, buy_price_cents, sales_rank, used_offer_count, new_offer_count, \
    trend, list_at_cents, avg_sale_1yr_cents, recent_sale_cents, profit_cents, margin, \
    profit_confidence, sale_events, drop_candidates, peak_month, trough_month, seller_id, \
    seller_name, seller_quality, derived, catalog_updated_at, last_seen, source";

impl DealRow {
    pub fn into_enriched(self) -> Result<EnrichedRow> {
        let derived: BTreeMap<String, f64> = serde_json::from_str(&self.derived)?;
        let month = |m: Option<i64>| m.and_then(|v| u32::try_from(v).ok());

        Ok(EnrichedRow {
            id: self.id,
            title: self.title,
            buy_price_cents: self.buy_price_cents,
            sales_rank: self.sales_rank,
            used_offer_count: self.used_offer_count,
            new_offer_count: self.new_offer_count,
            trend: Trend::parse(&self.trend),
            list_at_cents: self.list_at_cents,
            avg_sale_1yr_cents: self.avg_sale_1yr_cents,
            recent_sale_cents: self.recent_sale_cents,
            profit_cents: self.profit_cents,
            margin: self.margin,
            profit_confidence: self.profit_confidence,
            sale_events: self.sale_events,
            drop_candidates: self.drop_candidates,
            peak_month: month(self.peak_month),
            trough_month: month(self.trough_month),
            seller_id: self.seller_id,
            seller_name: self.seller_name,
            seller_quality: self.seller_quality,
            derived,
            catalog_updated_at: self.catalog_updated_at,
            last_seen: parse_ts(&self.last_seen)?,
            source: if self.source == "light" { RowSource::Light } else { RowSource::Full },
        })
    }
}
