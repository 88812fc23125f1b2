use std::time::Duration;

use crate::client::retry::RetryPolicy;
use crate::error::{AppError, Result};

pub const KEEPA_API_URL: &str = "https://api.keepa.com";

/// Catalog timestamps are minutes since this instant (2011-01-01T00:00:00Z), as Unix seconds.
pub const CATALOG_EPOCH_UNIX_SECS: i64 = 1_293_840_000;

/// How often the incremental crawl is triggered (seconds).
pub const RUN_INTERVAL_SECS: u64 = 300;

/// Janitor sweep interval (seconds).
pub const JANITOR_INTERVAL_SECS: u64 = 3600;

/// Rows not seen for this many hours are deleted by the janitor.
pub const JANITOR_GRACE_HOURS: i64 = 72;

/// Seller cache entries expire after this many seconds.
pub const SELLER_CACHE_TTL_SECS: u64 = 24 * 3600;

/// Upper bound on cached sellers before oldest-first eviction.
pub const SELLER_CACHE_CAPACITY: usize = 5_000;

/// Seller id of the marketplace's own warehouse outlet. Never treated as a resale competitor.
pub const WAREHOUSE_SELLER_ID: &str = "A2L77EE7U53NWQ";

/// Per-call token costs charged by the catalog API.
pub mod costs {
    pub const CANDIDATE_PAGE: f64 = 5.0;
    pub const SUMMARY_PER_ITEM: f64 = 2.0;
    pub const DETAIL_PER_ITEM: f64 = 20.0;
    pub const LIGHT_DETAIL_PER_ITEM: f64 = 6.0;
    pub const SELLER_PER_ITEM: f64 = 1.0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStoreKind {
    /// Token budget shared through the sqlite database, shared across processes.
    Sqlite,
    /// Token budget held in this process only.
    Memory,
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Starting balance at or above which any request is admitted (subject to `max_deficit`).
    pub min_threshold: f64,
    /// Balance that must be reached before recharge mode is exited.
    pub burst_threshold: f64,
    /// Hard floor: a grant may never leave the counter below `-max_deficit`.
    pub max_deficit: f64,
    /// Requests costing at most this much may use the priority pass.
    pub priority_pass_max_cost: f64,
    /// Refill rate (tokens/min) at or above which the priority pass is available
    /// and recharge mode is not entered.
    pub healthy_refill_rate: f64,
    /// Waits longer than this abort the caller's unit of work instead of sleeping.
    pub abort_wait_cutoff: Duration,
    /// Recharge sessions older than this are force-terminated.
    pub recharge_timeout: Duration,
    /// Maximum single sleep while waiting for tokens.
    pub wait_chunk: Duration,
    /// Minimum interval between authoritative status checks.
    pub sync_interval: Duration,
    /// Wait assumed when the refill rate is zero or unknown.
    pub zero_rate_wait: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            min_threshold: 20.0,
            burst_threshold: 80.0,
            max_deficit: 200.0,
            priority_pass_max_cost: 10.0,
            healthy_refill_rate: 10.0,
            abort_wait_cutoff: Duration::from_secs(60),
            recharge_timeout: Duration::from_secs(60 * 60),
            wait_chunk: Duration::from_secs(30),
            sync_interval: Duration::from_secs(60),
            zero_rate_wait: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name of the run-scoped mutex; one per schedule.
    pub lock_name: String,
    /// Absolute expiry of the run mutex (dead-process safety net).
    pub lock_ttl: Duration,
    pub max_pages_per_run: u32,
    pub max_candidates_per_run: usize,
    /// Candidate ceiling used instead of `max_candidates_per_run` when the refill rate is low.
    pub low_rate_max_candidates: usize,
    /// Refill rate (tokens/min) below which chunk sizes and ceilings shrink.
    pub low_refill_rate: f64,
    pub peek_chunk_size: usize,
    pub low_rate_peek_chunk_size: usize,
    pub commit_sub_chunk_size: usize,
    pub low_rate_commit_sub_chunk_size: usize,
    /// History requested for unseen and zombie items.
    pub full_lookback_days: u32,
    /// History requested for existing items.
    pub light_lookback_days: u32,
    /// Watermark used on first run.
    pub default_watermark_age: chrono::Duration,
    /// Stored watermarks further ahead of now than this are reset to now.
    pub max_future_watermark: chrono::Duration,
    /// Saved watermarks are clamped to now plus this tolerance.
    pub watermark_tolerance: chrono::Duration,
    pub page_retry: RetryPolicy,
    pub batch_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_name: "incremental_crawl".to_string(),
            lock_ttl: Duration::from_secs(30 * 60),
            max_pages_per_run: 50,
            max_candidates_per_run: 200,
            low_rate_max_candidates: 20,
            low_refill_rate: 20.0,
            peek_chunk_size: 10,
            low_rate_peek_chunk_size: 2,
            commit_sub_chunk_size: 2,
            low_rate_commit_sub_chunk_size: 1,
            full_lookback_days: 1095,
            light_lookback_days: 180,
            default_watermark_age: chrono::Duration::hours(24),
            max_future_watermark: chrono::Duration::hours(24),
            watermark_tolerance: chrono::Duration::minutes(5),
            page_retry: RetryPolicy::new(3, Duration::from_secs(15)),
            batch_retry: RetryPolicy::new(2, Duration::from_secs(5)),
        }
    }
}

/// Peek-time heuristics. Prices are integer cents.
#[derive(Debug, Clone)]
pub struct ViabilityConfig {
    /// Sell references below this are eaten by fees.
    pub min_sell_price_cents: i64,
    pub min_margin_cents: i64,
    pub min_gross_roi: f64,
    /// Minimum sales-rank drops over the last 90 days.
    pub min_rank_drops_90: i64,
}

impl Default for ViabilityConfig {
    fn default() -> Self {
        Self {
            min_sell_price_cents: 1200,
            min_margin_cents: 500,
            min_gross_roi: 0.2,
            min_rank_drops_90: 1,
        }
    }
}

/// Whether a rank improvement at exactly the drop timestamp counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBoundary {
    /// `start <= t <= end`; synchronous offer/rank updates match.
    Inclusive,
    /// `start < t <= end`
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub lookback_minutes: i64,
    pub search_window_minutes: i64,
    pub window_boundary: WindowBoundary,
    pub iqr_multiplier: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 730 * 24 * 60,
            search_window_minutes: 72 * 60,
            window_boundary: WindowBoundary::Inclusive,
            iqr_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub keepa_api_key: String,
    pub keepa_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub budget_store: BudgetStoreKind,
    pub run_interval_secs: u64,
    pub janitor_grace_hours: i64,
    /// Derived row fields to compute (DERIVED_FIELDS, comma-separated extractor names).
    pub derived_fields: Vec<String>,
    pub budget: BudgetConfig,
    pub scheduler: SchedulerConfig,
    pub viability: ViabilityConfig,
    pub inference: InferenceConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let keepa_api_key = std::env::var("KEEPA_API_KEY")
            .map_err(|_| AppError::Config("KEEPA_API_KEY must be set".to_string()))?;

        let budget_store = match std::env::var("BUDGET_STORE")
            .unwrap_or_else(|_| "sqlite".to_string())
            .to_lowercase()
            .as_str()
        {
            "sqlite" => BudgetStoreKind::Sqlite,
            "memory" => BudgetStoreKind::Memory,
            other => {
                return Err(AppError::Config(format!(
                    "BUDGET_STORE must be 'sqlite' or 'memory', got '{other}'"
                )))
            }
        };

        let mut scheduler = SchedulerConfig::default();
        if let Ok(name) = std::env::var("SCHEDULE_NAME") {
            scheduler.lock_name = name;
        }
        scheduler.max_candidates_per_run = std::env::var("MAX_CANDIDATES_PER_RUN")
            .unwrap_or_else(|_| "200".to_string())
            .parse::<usize>()
            .unwrap_or(200);

        let mut budget = BudgetConfig::default();
        budget.min_threshold = std::env::var("BUDGET_MIN_THRESHOLD")
            .unwrap_or_else(|_| "20".to_string())
            .parse::<f64>()
            .unwrap_or(20.0);
        budget.burst_threshold = std::env::var("BUDGET_BURST_THRESHOLD")
            .unwrap_or_else(|_| "80".to_string())
            .parse::<f64>()
            .unwrap_or(80.0);

        Ok(Self {
            keepa_api_key,
            keepa_api_url: std::env::var("KEEPA_API_URL")
                .unwrap_or_else(|_| KEEPA_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "deals.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            budget_store,
            run_interval_secs: std::env::var("RUN_INTERVAL_SECS")
                .unwrap_or_else(|_| RUN_INTERVAL_SECS.to_string())
                .parse::<u64>()
                .unwrap_or(RUN_INTERVAL_SECS),
            janitor_grace_hours: std::env::var("JANITOR_GRACE_HOURS")
                .unwrap_or_else(|_| JANITOR_GRACE_HOURS.to_string())
                .parse::<i64>()
                .unwrap_or(JANITOR_GRACE_HOURS),
            derived_fields: std::env::var("DERIVED_FIELDS")
                .unwrap_or_else(|_| "percent_down_365,sales_rank_trend_30".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            budget,
            scheduler,
            viability: ViabilityConfig::default(),
            inference: InferenceConfig::default(),
        })
    }
}
