use std::collections::BTreeMap;
use std::sync::Arc;

use crate::enrich::analytics;
use crate::error::{AppError, Result};
use crate::types::ProductDetail;

/// A named, optional numeric field computed from a detail payload and stored
/// in the row's `derived` object.
pub trait FieldExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, detail: &ProductDetail) -> Option<f64>;
}

struct PercentDown365;

impl FieldExtractor for PercentDown365 {
    fn name(&self) -> &'static str {
        "percent_down_365"
    }

    fn extract(&self, detail: &ProductDetail) -> Option<f64> {
        analytics::percent_down_365(&detail.summary)
    }
}

struct SalesRankTrend30;

impl FieldExtractor for SalesRankTrend30 {
    fn name(&self) -> &'static str {
        "sales_rank_trend_30"
    }

    fn extract(&self, detail: &ProductDetail) -> Option<f64> {
        analytics::sales_rank_trend_30(&detail.summary)
    }
}

struct OfferCountTrend30;

impl FieldExtractor for OfferCountTrend30 {
    fn name(&self) -> &'static str {
        "offer_count_trend_30"
    }

    fn extract(&self, detail: &ProductDetail) -> Option<f64> {
        analytics::offer_count_trend_30(&detail.summary)
    }
}

struct RankDrops90;

impl FieldExtractor for RankDrops90 {
    fn name(&self) -> &'static str {
        "rank_drops_90"
    }

    fn extract(&self, detail: &ProductDetail) -> Option<f64> {
        detail.summary.rank_drops_90.map(|d| d as f64)
    }
}

fn builtins() -> Vec<Arc<dyn FieldExtractor>> {
    vec![
        Arc::new(PercentDown365),
        Arc::new(SalesRankTrend30),
        Arc::new(OfferCountTrend30),
        Arc::new(RankDrops90),
    ]
}

/// The extractors selected at startup. Cheap to clone.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    active: Vec<Arc<dyn FieldExtractor>>,
}

impl ExtractorRegistry {
    /// Resolves extractor names once. Unknown names are a configuration error.
    pub fn resolve(names: &[String]) -> Result<Self> {
        let available = builtins();
        let mut active: Vec<Arc<dyn FieldExtractor>> = Vec::with_capacity(names.len());
        for name in names {
            let Some(ext) = available.iter().find(|e| e.name() == name.as_str()) else {
                let known: Vec<&str> = available.iter().map(|e| e.name()).collect();
                return Err(AppError::Config(format!(
                    "unknown derived field '{name}' (known: {})",
                    known.join(", ")
                )));
            };
            if !active.iter().any(|a| a.name() == ext.name()) {
                active.push(ext.clone());
            }
        }
        Ok(Self { active })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.active.iter().map(|e| e.name()).collect()
    }

    /// Fields with no value for this item are omitted.
    pub fn extract_all(&self, detail: &ProductDetail) -> BTreeMap<String, f64> {
        self.active
            .iter()
            .filter_map(|e| e.extract(detail).map(|v| (e.name().to_string(), v)))
            .collect()
    }
}
