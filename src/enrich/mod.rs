//! Turns fetched detail payloads into persisted deal rows.
//!
//! Full enrichment (unseen and zombie items) runs sale inference, valuation
//! and a seller lookup. Light enrichment (existing items) refreshes only the
//! volatile fields and keeps the stored valuation.

pub mod analytics;
pub mod extractors;
pub mod seller_cache;
pub mod valuation;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::budget::{Admission, BudgetCoordinator};
use crate::client::CallClient;
use crate::config::{costs, InferenceConfig};
use crate::types::{Candidate, Clock, EnrichedRow, ProductDetail, RowSource, SellerInfo};

pub use extractors::{ExtractorRegistry, FieldExtractor};
pub use seller_cache::SellerCache;

pub struct Enricher {
    client: Arc<dyn CallClient>,
    budget: Arc<BudgetCoordinator>,
    sellers: Arc<SellerCache>,
    extractors: ExtractorRegistry,
    inference: InferenceConfig,
    clock: Arc<dyn Clock>,
}

impl Enricher {
    pub fn new(
        client: Arc<dyn CallClient>,
        budget: Arc<BudgetCoordinator>,
        sellers: Arc<SellerCache>,
        extractors: ExtractorRegistry,
        inference: InferenceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { client, budget, sellers, extractors, inference, clock }
    }

    /// Builds a row from scratch. The result may still be a zombie when the
    /// history is too thin to value the item; the caller decides what to keep.
    pub async fn full(&self, candidate: &Candidate, detail: &ProductDetail) -> EnrichedRow {
        let inferred = crate::inference::infer(&detail.history, &self.inference);
        let v = valuation::value(&inferred, detail.history.as_of, &detail.summary);
        let buy = valuation::best_used_offer(detail);
        let buy_price = buy.as_ref().map(|b| b.price_cents);
        let (profit_cents, margin) = valuation::profit_and_margin(v.list_at_cents, buy_price);

        let seller_id = buy.and_then(|b| b.seller_id);
        let seller = match &seller_id {
            Some(id) => self.resolve_seller(id).await,
            None => None,
        };

        debug!(
            id = %candidate.id,
            events = inferred.events.len(),
            drops = inferred.drop_candidates,
            list_at = ?v.list_at_cents,
            "[ENRICH] full enrichment"
        );

        EnrichedRow {
            id: candidate.id.clone(),
            title: detail.title.clone(),
            buy_price_cents: buy_price,
            sales_rank: detail.summary.current.sales_rank,
            used_offer_count: detail.summary.current.used_offer_count,
            new_offer_count: detail.summary.current.new_offer_count,
            trend: analytics::trend(detail),
            list_at_cents: v.list_at_cents,
            avg_sale_1yr_cents: v.avg_sale_1yr_cents,
            recent_sale_cents: v.recent_sale_cents,
            profit_cents,
            margin,
            profit_confidence: v.profit_confidence,
            sale_events: inferred.events.len() as i64,
            drop_candidates: inferred.drop_candidates as i64,
            peak_month: v.peak_month,
            trough_month: v.trough_month,
            seller_id,
            seller_name: seller.as_ref().map(|s| s.name.clone()),
            seller_quality: seller.as_ref().map(seller_quality),
            derived: self.extractors.extract_all(detail),
            catalog_updated_at: candidate.updated_at,
            last_seen: self.clock.now(),
            source: RowSource::Full,
        }
    }

    /// Refreshes price, rank, offer counts, trend and derived fields on top of
    /// `previous`. Seller fields are re-resolved only if the best seller changed.
    pub async fn light(&self, candidate: &Candidate, detail: &ProductDetail, previous: &EnrichedRow) -> EnrichedRow {
        let mut row = previous.clone();
        let buy = valuation::best_used_offer(detail);
        let buy_price = buy.as_ref().map(|b| b.price_cents);

        if detail.title.is_some() {
            row.title = detail.title.clone();
        }
        row.buy_price_cents = buy_price;
        row.sales_rank = detail.summary.current.sales_rank;
        row.used_offer_count = detail.summary.current.used_offer_count;
        row.new_offer_count = detail.summary.current.new_offer_count;
        row.trend = analytics::trend(detail);
        (row.profit_cents, row.margin) = valuation::profit_and_margin(row.list_at_cents, buy_price);

        let seller_id = buy.and_then(|b| b.seller_id);
        if seller_id != previous.seller_id {
            let seller = match &seller_id {
                Some(id) => self.resolve_seller(id).await,
                None => None,
            };
            debug!(id = %candidate.id, from = ?previous.seller_id, to = ?seller_id, "[ENRICH] best seller changed");
            row.seller_name = seller.as_ref().map(|s| s.name.clone());
            row.seller_quality = seller.as_ref().map(seller_quality);
            row.seller_id = seller_id;
        }

        row.derived = self.extractors.extract_all(detail);
        row.catalog_updated_at = candidate.updated_at;
        row.last_seen = self.clock.now();
        row.source = RowSource::Light;
        row
    }

    /// Cache first, then one metered lookup. Any failure leaves the seller unknown.
    async fn resolve_seller(&self, seller_id: &str) -> Option<SellerInfo> {
        if let Some(info) = self.sellers.get(seller_id) {
            return Some(info);
        }

        match self.budget.request_permission(costs::SELLER_PER_ITEM).await {
            Ok(Admission::Granted { .. }) => {}
            Ok(Admission::RechargeNeeded { wait }) => {
                warn!(seller_id, wait_secs = wait.as_secs(), "[ENRICH] skipping seller lookup, budget recharging");
                return None;
            }
            Err(e) => {
                warn!(seller_id, "[ENRICH] budget check failed for seller lookup: {e}");
                return None;
            }
        }

        let resp = match self.client.fetch_seller_batch(&[seller_id.to_string()]).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(seller_id, "[ENRICH] seller lookup failed: {e}");
                return None;
            }
        };
        if let Err(e) = self.budget.update_after_call(resp.tokens_left, resp.refill_rate).await {
            warn!("[ENRICH] budget update failed: {e}");
        }

        let info = resp.data.into_iter().find(|s| s.id == seller_id)?;
        self.sellers.insert(info.clone());
        Some(info)
    }
}

fn seller_quality(s: &SellerInfo) -> f64 {
    let total = s.rating_count.max(0) as f64;
    let positive = (s.rating_pct / 100.0 * total).round();
    valuation::wilson_lower_bound(positive, total)
}
