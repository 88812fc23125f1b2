use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::api::health::{HealthSnapshot, HealthState};
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::budget::{BudgetCoordinator, BudgetSnapshot};
use crate::error::AppError;
use crate::scheduler::{trigger, CrawlScheduler, RunOutcome, RunStats};
use crate::types::Clock;

#[derive(Clone)]
pub struct ApiState {
    pub budget: Arc<BudgetCoordinator>,
    pub scheduler: Arc<CrawlScheduler>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub clock: Arc<dyn Clock>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/budget", get(get_budget))
        .route("/stats/latency", get(get_stats_latency))
        .route("/run", post(post_run))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, PartialEq)]
pub struct RunResponse {
    pub outcome: &'static str,
    /// Suggested wait before the next attempt, when the budget is recharging.
    pub wait_secs: Option<u64>,
    pub stats: Option<RunStats>,
}

impl From<RunOutcome> for RunResponse {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Skipped => RunResponse { outcome: "skipped", wait_secs: None, stats: None },
            RunOutcome::Completed(stats) => RunResponse { outcome: "completed", wait_secs: None, stats: Some(stats) },
            RunOutcome::Aborted { wait, stats } => RunResponse {
                outcome: "aborted",
                wait_secs: Some(wait.as_secs()),
                stats: Some(stats),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthSnapshot> {
    Json(state.health.snapshot())
}

async fn get_budget(State(state): State<ApiState>) -> Result<Json<BudgetSnapshot>, AppError> {
    Ok(Json(state.budget.snapshot().await?))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySummary> {
    Json(state.latency.summary())
}

/// Scheduling trigger. Runs one crawl to completion; concurrent callers get `skipped`.
async fn post_run(State(state): State<ApiState>) -> Result<Json<RunResponse>, AppError> {
    let outcome = trigger::fire(&state.scheduler, &state.health, state.clock.as_ref()).await?;
    Ok(Json(outcome.into()))
}
