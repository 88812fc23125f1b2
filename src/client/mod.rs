pub mod keepa;
pub mod retry;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{BudgetStatus, Candidate, ProductDetail, ProductSummary, SellerInfo};

pub use keepa::KeepaClient;

/// Result of one cost-metered catalog call.
#[derive(Debug, Clone)]
pub struct CallResponse<T> {
    pub data: T,
    /// Authoritative balance reported by the catalog after this call, if any.
    pub tokens_left: Option<f64>,
    pub refill_rate: Option<f64>,
}

impl<T> CallResponse<T> {
    pub fn new(data: T, tokens_left: Option<f64>) -> Self {
        Self { data, tokens_left, refill_rate: None }
    }
}

/// Source of truth for the shared token balance.
#[async_trait]
pub trait BudgetAuthority: Send + Sync {
    async fn fetch_budget_status(&self) -> Result<BudgetStatus>;
}

/// Cost-metered catalog calls used by the crawl scheduler.
#[async_trait]
pub trait CallClient: BudgetAuthority {
    /// One page of the "recently updated" feed. `page` is zero-based.
    async fn fetch_candidate_page(&self, page: u32, newest_first: bool) -> Result<CallResponse<Vec<Candidate>>>;

    /// Summary statistics only. Cheap.
    async fn fetch_summary_batch(&self, ids: &[String]) -> Result<CallResponse<Vec<ProductSummary>>>;

    /// Summary, history and live offers over the last `lookback_days`. Expensive.
    async fn fetch_detail_batch(&self, ids: &[String], lookback_days: u32) -> Result<CallResponse<Vec<ProductDetail>>>;

    async fn fetch_seller_batch(&self, ids: &[String]) -> Result<CallResponse<Vec<SellerInfo>>>;
}
