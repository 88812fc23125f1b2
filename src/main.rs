mod api;
mod budget;
mod client;
mod config;
mod db;
mod enrich;
mod error;
mod inference;
mod janitor;
mod scheduler;
mod types;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::budget::{BudgetCoordinator, BudgetStore, MemoryBudgetStore, SqliteBudgetStore};
use crate::client::{BudgetAuthority, KeepaClient};
use crate::config::{BudgetStoreKind, Config, SELLER_CACHE_CAPACITY, SELLER_CACHE_TTL_SECS};
use crate::db::{SqliteGateway, SqliteRunLock};
use crate::enrich::{Enricher, ExtractorRegistry, SellerCache};
use crate::error::Result;
use crate::janitor::Janitor;
use crate::scheduler::{CrawlScheduler, CrawlTrigger};
use crate::types::{Clock, SystemClock};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let latency = Arc::new(LatencyStats::new());
    let health = Arc::new(HealthState::new());

    // --- Catalog client + token budget ---
    let client = Arc::new(KeepaClient::new(
        cfg.keepa_api_url.clone(),
        cfg.keepa_api_key.clone(),
        Arc::clone(&latency),
    )?);

    let store: Arc<dyn BudgetStore> = match cfg.budget_store {
        BudgetStoreKind::Sqlite => Arc::new(SqliteBudgetStore::open(pool.clone()).await?),
        BudgetStoreKind::Memory => {
            let status = client.fetch_budget_status().await?;
            Arc::new(MemoryBudgetStore::new(status.tokens_remaining, status.refill_rate_per_minute))
        }
    };
    let budget = Arc::new(BudgetCoordinator::new(
        store,
        client.clone(),
        Arc::clone(&clock),
        cfg.budget.clone(),
    ));
    match budget.sync_with_authority().await {
        Ok(_) => {
            let snap = budget.snapshot().await?;
            info!(tokens = snap.tokens, refill_rate = snap.refill_rate, "[BUDGET] initial sync complete");
        }
        Err(e) => warn!("[BUDGET] initial sync failed, starting from stored balance: {e}"),
    }

    // --- Enrichment ---
    let extractors = ExtractorRegistry::resolve(&cfg.derived_fields)?;
    if !extractors.names().is_empty() {
        info!("Derived fields enabled: {}", extractors.names().join(", "));
    }
    let sellers = Arc::new(SellerCache::new(
        Duration::from_secs(SELLER_CACHE_TTL_SECS),
        SELLER_CACHE_CAPACITY,
    ));
    let enricher = Arc::new(Enricher::new(
        client.clone(),
        Arc::clone(&budget),
        sellers,
        extractors,
        cfg.inference.clone(),
        Arc::clone(&clock),
    ));

    // --- Scheduler ---
    let gateway = Arc::new(SqliteGateway::new(pool.clone(), cfg.scheduler.lock_name.clone()));
    let lock = Arc::new(SqliteRunLock::new(pool.clone(), Arc::clone(&clock)));
    let scheduler = Arc::new(CrawlScheduler::new(
        client.clone(),
        Arc::clone(&budget),
        gateway.clone(),
        lock,
        enricher,
        Arc::clone(&clock),
        cfg.scheduler.clone(),
        cfg.viability.clone(),
    ));

    // --- Spawn tasks ---

    // Incremental crawl trigger (background, every RUN_INTERVAL_SECS)
    let trigger = CrawlTrigger::new(
        Arc::clone(&scheduler),
        Arc::clone(&health),
        Arc::clone(&clock),
        cfg.run_interval_secs,
    );
    tokio::spawn(async move { trigger.run().await });

    // Stale-row janitor (background, hourly)
    let janitor = Janitor::new(gateway, Arc::clone(&clock), cfg.janitor_grace_hours);
    tokio::spawn(async move { janitor.run().await });

    // HTTP API server
    let api_state = ApiState { budget, scheduler, health, latency, clock };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
