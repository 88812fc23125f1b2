//! Incremental, watermark-based crawl of the "recently updated" feed.
//!
//! One run: acquire the schedule's run lock, page newest-first down to the
//! watermark, then walk the discovered candidates oldest-first in chunks.
//! Each chunk is classified against storage, unseen items are peeked and
//! filtered, survivors and known items get a detail call, rows are upserted,
//! and the watermark advances to the chunk's newest item whether or not
//! anything was saved.

pub mod trigger;
pub mod viability;
pub mod watermark;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::budget::{Admission, BudgetCoordinator};
use crate::client::retry::{with_retry, RetryPolicy};
use crate::client::{CallClient, CallResponse};
use crate::config::{costs, SchedulerConfig, ViabilityConfig};
use crate::db::{PersistenceGateway, RunLock};
use crate::enrich::Enricher;
use crate::error::{AppError, Result};
use crate::types::{
    catalog_minutes_to_datetime, datetime_to_catalog_minutes, Candidate, Classification, Clock, EnrichedRow,
    ProductDetail, ProductSummary,
};

pub use trigger::CrawlTrigger;
pub use viability::PeekStats;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub pages: usize,
    pub candidates: usize,
    pub unseen: usize,
    pub existing: usize,
    pub zombies: usize,
    pub peek: PeekStats,
    /// Items returned by detail calls.
    pub committed: usize,
    pub rows_written: usize,
    pub rows_deleted: u64,
    /// Unseen items whose full enrichment produced no usable valuation.
    pub discarded: usize,
    pub persist_failures: usize,
    pub chunks: usize,
    /// Last watermark saved by this run.
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another holder owns the run lock.
    Skipped,
    Completed(RunStats),
    /// The budget coordinator asked for a recharge. Progress made before the
    /// signal is kept; the next run resumes from the saved watermark.
    Aborted { wait: Duration, stats: RunStats },
}

/// Why a run stopped early.
enum Halt {
    Recharge(Duration),
    Failed(AppError),
}

impl From<AppError> for Halt {
    fn from(e: AppError) -> Self {
        Halt::Failed(e)
    }
}

/// Chunk sizes and ceilings, shrunk when the refill rate is low.
#[derive(Debug, Clone, Copy)]
struct Sizing {
    max_candidates: usize,
    peek_chunk: usize,
    commit_chunk: usize,
    low_rate: bool,
}

impl Sizing {
    fn for_rate(refill_rate: f64, cfg: &SchedulerConfig) -> Self {
        let low_rate = refill_rate < cfg.low_refill_rate;
        let (max_candidates, peek_chunk, commit_chunk) = if low_rate {
            (
                cfg.low_rate_max_candidates.min(cfg.max_candidates_per_run),
                cfg.low_rate_peek_chunk_size,
                cfg.low_rate_commit_sub_chunk_size,
            )
        } else {
            (cfg.max_candidates_per_run, cfg.peek_chunk_size, cfg.commit_sub_chunk_size)
        };
        Self {
            max_candidates,
            peek_chunk: peek_chunk.max(1),
            commit_chunk: commit_chunk.max(1),
            low_rate,
        }
    }
}

fn classify(candidate: &Candidate, stored: &HashMap<String, EnrichedRow>) -> Classification {
    match stored.get(&candidate.id) {
        None => Classification::Unseen,
        Some(row) if row.is_zombie() => Classification::Zombie,
        Some(_) => Classification::Existing,
    }
}

pub struct CrawlScheduler {
    client: Arc<dyn CallClient>,
    budget: Arc<BudgetCoordinator>,
    gateway: Arc<dyn PersistenceGateway>,
    lock: Arc<dyn RunLock>,
    enricher: Arc<Enricher>,
    clock: Arc<dyn Clock>,
    cfg: SchedulerConfig,
    viability: ViabilityConfig,
}

impl CrawlScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn CallClient>,
        budget: Arc<BudgetCoordinator>,
        gateway: Arc<dyn PersistenceGateway>,
        lock: Arc<dyn RunLock>,
        enricher: Arc<Enricher>,
        clock: Arc<dyn Clock>,
        cfg: SchedulerConfig,
        viability: ViabilityConfig,
    ) -> Self {
        Self { client, budget, gateway, lock, enricher, clock, cfg, viability }
    }

    /// One crawl. Safe to call repeatedly and concurrently: a caller that
    /// cannot take the run lock returns `Skipped` immediately.
    pub async fn run(&self) -> Result<RunOutcome> {
        let Some(token) = self.lock.try_acquire(&self.cfg.lock_name, self.cfg.lock_ttl).await? else {
            info!(schedule = %self.cfg.lock_name, "[SCHEDULER] run already in progress, skipping");
            return Ok(RunOutcome::Skipped);
        };

        let mut stats = RunStats::default();
        let result = self.crawl(&mut stats).await;

        if let Err(e) = self.lock.release(&token).await {
            error!(schedule = %self.cfg.lock_name, "[SCHEDULER] failed to release run lock: {e}");
        }

        match result {
            Ok(()) => {
                info!(
                    pages = stats.pages,
                    candidates = stats.candidates,
                    unseen = stats.unseen,
                    existing = stats.existing,
                    zombies = stats.zombies,
                    peek_rejected = stats.peek.rejected(),
                    committed = stats.committed,
                    written = stats.rows_written,
                    deleted = stats.rows_deleted,
                    persist_failures = stats.persist_failures,
                    "[SCHEDULER] run complete"
                );
                Ok(RunOutcome::Completed(stats))
            }
            Err(Halt::Recharge(wait)) => {
                info!(
                    wait_secs = wait.as_secs(),
                    chunks = stats.chunks,
                    written = stats.rows_written,
                    "[SCHEDULER] budget recharge needed, run aborted"
                );
                Ok(RunOutcome::Aborted { wait, stats })
            }
            Err(Halt::Failed(e)) => {
                error!(chunks = stats.chunks, "[SCHEDULER] run abandoned: {e}");
                Err(e)
            }
        }
    }

    async fn crawl(&self, stats: &mut RunStats) -> std::result::Result<(), Halt> {
        if let Err(e) = self.budget.sync_with_authority().await {
            warn!("[SCHEDULER] initial budget sync failed: {e}");
        }

        let stored = self.gateway.load_watermark().await?;
        let mut mark = watermark::initial(stored, self.clock.now(), &self.cfg);
        let sizing = Sizing::for_rate(self.budget.snapshot().await?.refill_rate, &self.cfg);
        if sizing.low_rate {
            info!(max_candidates = sizing.max_candidates, "[SCHEDULER] low refill rate, shrinking run");
        }
        debug!(watermark = %mark, "[SCHEDULER] starting crawl");

        let candidates = self
            .paginate(datetime_to_catalog_minutes(mark), sizing.max_candidates, stats)
            .await?;
        stats.candidates = candidates.len();
        if candidates.is_empty() {
            info!(watermark = %mark, "[SCHEDULER] no candidates newer than watermark");
            return Ok(());
        }

        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let snapshot = match self.gateway.load_existing_snapshot(&ids).await {
            Ok(s) => s,
            Err(e) => {
                warn!("[SCHEDULER] existing-row lookup failed, treating all candidates as unseen: {e}");
                HashMap::new()
            }
        };

        for chunk in candidates.chunks(sizing.peek_chunk) {
            self.process_chunk(chunk, &snapshot, sizing, stats).await?;
            stats.chunks += 1;

            let Some(newest) = chunk.last() else { continue };
            let newest = catalog_minutes_to_datetime(newest.updated_at);
            if let Some(next) = watermark::advance(mark, newest, self.clock.now(), &self.cfg) {
                match self.gateway.save_watermark(next).await {
                    Ok(()) => {
                        debug!(watermark = %next, "[SCHEDULER] watermark advanced");
                        mark = next;
                        stats.watermark = Some(next);
                    }
                    Err(e) => error!(watermark = %next, "[SCHEDULER] failed to save watermark: {e}"),
                }
            }
        }
        Ok(())
    }

    /// Newest-first discovery down to `watermark` (catalog minutes). Returns
    /// candidates strictly newer than the watermark, oldest first. The
    /// candidate ceiling only stops further page fetches; everything already
    /// fetched is returned.
    async fn paginate(
        &self,
        watermark: i64,
        max_candidates: usize,
        stats: &mut RunStats,
    ) -> std::result::Result<Vec<Candidate>, Halt> {
        let mut found: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for page in 0..self.cfg.max_pages_per_run {
            if found.len() >= max_candidates {
                info!(found = found.len(), "[SCHEDULER] candidate ceiling reached");
                break;
            }

            let fetched = self
                .metered(costs::CANDIDATE_PAGE, self.cfg.page_retry, "candidate page", || {
                    self.client.fetch_candidate_page(page, true)
                })
                .await;
            let mut batch = match fetched {
                Ok(batch) => batch,
                Err(Halt::Failed(e)) => {
                    warn!(page, "[SCHEDULER] abandoning pagination: {e}");
                    break;
                }
                Err(halt) => return Err(halt),
            };
            stats.pages += 1;
            if batch.is_empty() {
                break;
            }

            // The feed is only approximately ordered.
            batch.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            let reached = batch.last().is_some_and(|c| c.updated_at <= watermark);
            for c in batch {
                if c.updated_at > watermark && seen.insert(c.id.clone()) {
                    found.push(c);
                }
            }
            if reached {
                debug!(page, "[SCHEDULER] reached watermark");
                break;
            }
            if page + 1 == self.cfg.max_pages_per_run {
                warn!(pages = self.cfg.max_pages_per_run, "[SCHEDULER] page ceiling reached");
            }
        }

        found.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn process_chunk(
        &self,
        chunk: &[Candidate],
        snapshot: &HashMap<String, EnrichedRow>,
        sizing: Sizing,
        stats: &mut RunStats,
    ) -> std::result::Result<(), Halt> {
        let mut unseen: Vec<&Candidate> = Vec::new();
        let mut full: Vec<&Candidate> = Vec::new();
        let mut existing: Vec<&Candidate> = Vec::new();
        for c in chunk {
            match classify(c, snapshot) {
                Classification::Unseen => unseen.push(c),
                Classification::Zombie => full.push(c),
                Classification::Existing => existing.push(c),
            }
        }
        stats.unseen += unseen.len();
        stats.zombies += full.len();
        stats.existing += existing.len();

        // Peek
        if !unseen.is_empty() {
            let ids: Vec<String> = unseen.iter().map(|c| c.id.clone()).collect();
            let summaries = self
                .metered(
                    costs::SUMMARY_PER_ITEM * ids.len() as f64,
                    self.cfg.batch_retry,
                    "summary batch",
                    || self.client.fetch_summary_batch(&ids),
                )
                .await?;
            let by_id: HashMap<&str, &ProductSummary> = summaries.iter().map(|s| (s.id.as_str(), s)).collect();

            for c in unseen {
                let Some(summary) = by_id.get(c.id.as_str()) else {
                    stats.peek.missing += 1;
                    continue;
                };
                let outcome = viability::check(summary, &self.viability);
                stats.peek.record(outcome);
                match outcome {
                    Ok(()) => full.push(c),
                    Err(reason) => debug!(id = %c.id, ?reason, "[SCHEDULER] peek rejected"),
                }
            }
        }

        // Commit + enrich
        let mut rows: Vec<EnrichedRow> = Vec::new();
        let mut doomed: Vec<String> = Vec::new();

        for batch in full.chunks(sizing.commit_chunk) {
            let details = self
                .commit(batch, self.cfg.full_lookback_days, costs::DETAIL_PER_ITEM, stats)
                .await?;
            for c in batch {
                let was_zombie = snapshot.contains_key(&c.id);
                let Some(detail) = details.get(&c.id) else {
                    if was_zombie {
                        doomed.push(c.id.clone());
                    }
                    continue;
                };
                let row = self.enricher.full(c, detail).await;
                if !row.is_zombie() {
                    rows.push(row);
                } else if was_zombie {
                    doomed.push(c.id.clone());
                } else {
                    stats.discarded += 1;
                }
            }
        }

        for batch in existing.chunks(sizing.commit_chunk) {
            let details = self
                .commit(batch, self.cfg.light_lookback_days, costs::LIGHT_DETAIL_PER_ITEM, stats)
                .await?;
            for c in batch {
                if let (Some(detail), Some(previous)) = (details.get(&c.id), snapshot.get(&c.id)) {
                    rows.push(self.enricher.light(c, detail, previous).await);
                }
            }
        }

        self.persist(&rows, &doomed, stats).await;
        Ok(())
    }

    async fn commit(
        &self,
        batch: &[&Candidate],
        lookback_days: u32,
        cost_per_item: f64,
        stats: &mut RunStats,
    ) -> std::result::Result<HashMap<String, ProductDetail>, Halt> {
        let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
        let details = self
            .metered(cost_per_item * ids.len() as f64, self.cfg.batch_retry, "detail batch", || {
                self.client.fetch_detail_batch(&ids, lookback_days)
            })
            .await?;
        stats.committed += details.len();
        Ok(details.into_iter().map(|d| (d.id.clone(), d)).collect())
    }

    /// Persistence failures are logged and counted; they never stop the run.
    async fn persist(&self, rows: &[EnrichedRow], doomed: &[String], stats: &mut RunStats) {
        if !rows.is_empty() {
            match self.gateway.upsert_rows(rows).await {
                Ok(n) => stats.rows_written += n,
                Err(e) => {
                    stats.persist_failures += 1;
                    error!(rows = rows.len(), "[SCHEDULER] upsert failed: {e}");
                }
            }
        }
        if !doomed.is_empty() {
            match self.gateway.delete_rows(doomed).await {
                Ok(n) => {
                    info!(deleted = n, "[SCHEDULER] removed unrecoverable zombie rows");
                    stats.rows_deleted += n;
                }
                Err(e) => {
                    stats.persist_failures += 1;
                    error!(rows = doomed.len(), "[SCHEDULER] zombie delete failed: {e}");
                }
            }
        }
    }

    /// Admission, then the call under `policy`, then the budget update.
    async fn metered<T, F, Fut>(
        &self,
        cost: f64,
        policy: RetryPolicy,
        label: &str,
        op: F,
    ) -> std::result::Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CallResponse<T>>>,
    {
        match self.budget.request_permission(cost).await? {
            Admission::Granted { .. } => {}
            Admission::RechargeNeeded { wait } => return Err(Halt::Recharge(wait)),
        }
        let resp = with_retry(policy, label, op).await?;
        self.budget.update_after_call(resp.tokens_left, resp.refill_rate).await?;
        Ok(resp.data)
    }
}
