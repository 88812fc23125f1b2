use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::budget::store::{BudgetSnapshot, BudgetStore};
use crate::client::BudgetAuthority;
use crate::config::BudgetConfig;
use crate::error::Result;
use crate::types::Clock;

/// Outcome of a permission request. Running out of budget is a control
/// signal for the caller, never an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Granted { balance_after: f64 },
    /// The wait for tokens exceeds the abort cutoff: unwind the current unit of work.
    RechargeNeeded { wait: Duration },
}

/// Admission control for outbound catalog calls, shared by every worker
/// through a `BudgetStore`.
pub struct BudgetCoordinator {
    store: Arc<dyn BudgetStore>,
    authority: Arc<dyn BudgetAuthority>,
    clock: Arc<dyn Clock>,
    cfg: BudgetConfig,
}

impl BudgetCoordinator {
    pub fn new(
        store: Arc<dyn BudgetStore>,
        authority: Arc<dyn BudgetAuthority>,
        clock: Arc<dyn Clock>,
        cfg: BudgetConfig,
    ) -> Self {
        Self { store, authority, clock, cfg }
    }

    pub async fn snapshot(&self) -> Result<BudgetSnapshot> {
        self.store.snapshot().await
    }

    /// Blocks until `cost` tokens are granted, or returns `RechargeNeeded`
    /// when the projected wait exceeds the abort cutoff.
    pub async fn request_permission(&self, cost: f64) -> Result<Admission> {
        let mut waited = Duration::ZERO;

        loop {
            let snap = self.store.snapshot().await?;

            if let Some(started) = snap.recharge_started_at {
                let elapsed = (self.clock.now() - started).to_std().unwrap_or_default();
                if elapsed >= self.cfg.recharge_timeout {
                    warn!(
                        elapsed_mins = elapsed.as_secs() / 60,
                        tokens = snap.tokens,
                        "[BUDGET] recharge exceeded timeout, forcing exit"
                    );
                    self.store.set_recharge(None).await?;
                    continue;
                }

                if snap.tokens >= self.cfg.burst_threshold {
                    info!(tokens = snap.tokens, "[BUDGET] recharge complete");
                    self.store.set_recharge(None).await?;
                } else {
                    let wait = self.wait_for(self.cfg.burst_threshold - snap.tokens, snap.refill_rate);
                    if let Some(signal) = self.abort_if_too_long(wait, waited) {
                        debug!(tokens = snap.tokens, wait_secs = wait.as_secs(), "[BUDGET] recharging");
                        return Ok(signal);
                    }
                    waited += self.sleep_chunk(wait).await;
                    continue;
                }
            }

            // Optimistic decrement; the pre-decrement value is the starting balance.
            let after = self.store.incr(-cost).await?;
            let start = after + cost;

            if admit(start, cost, snap.refill_rate, &self.cfg) {
                debug!(cost, start, after, "[BUDGET] granted");
                return Ok(Admission::Granted { balance_after: after });
            }

            let current = self.store.incr(cost).await?;
            debug!(cost, start, "[BUDGET] denied, reverted");

            if snap.refill_rate < self.cfg.healthy_refill_rate && start < self.cfg.min_threshold {
                info!(
                    tokens = current,
                    refill_rate = snap.refill_rate,
                    burst = self.cfg.burst_threshold,
                    "[BUDGET] low refill rate, entering recharge mode"
                );
                self.store.set_recharge(Some(self.clock.now())).await?;
                continue;
            }

            // Balance needed for the next attempt to be admitted.
            let target = self.cfg.min_threshold.max(cost - self.cfg.max_deficit);
            let wait = self.wait_for(target - current, snap.refill_rate);
            if let Some(signal) = self.abort_if_too_long(wait, waited) {
                info!(tokens = current, cost, wait_secs = wait.as_secs(), "[BUDGET] recharge needed");
                return Ok(signal);
            }
            waited += self.sleep_chunk(wait).await;
        }
    }

    /// Applies the balance reported by a completed call.
    pub async fn update_after_call(&self, tokens_left: Option<f64>, refill_rate: Option<f64>) -> Result<()> {
        match tokens_left {
            Some(tokens) => self.store.set_authoritative(tokens, refill_rate).await,
            None => Ok(()),
        }
    }

    /// Refreshes the shared counter from the catalog's status endpoint,
    /// at most once per `sync_interval` across all workers. Returns whether a sync happened.
    pub async fn sync_with_authority(&self) -> Result<bool> {
        let interval = chrono::Duration::from_std(self.cfg.sync_interval).unwrap_or_default();
        if !self.store.try_claim_sync(self.clock.now(), interval).await? {
            return Ok(false);
        }

        let status = self.authority.fetch_budget_status().await?;
        self.store
            .set_authoritative(status.tokens_remaining, Some(status.refill_rate_per_minute))
            .await?;
        debug!(
            tokens = status.tokens_remaining,
            refill_rate = status.refill_rate_per_minute,
            "[BUDGET] synced with authority"
        );
        Ok(true)
    }

    fn wait_for(&self, deficit: f64, refill_rate: f64) -> Duration {
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if refill_rate <= 0.0 {
            return self.cfg.zero_rate_wait;
        }
        Duration::from_secs_f64(deficit / refill_rate * 60.0)
    }

    /// Waits past the cutoff abort. Total time spent waiting inside one request
    /// is bounded by the recharge timeout so a stalled authority cannot hang a run.
    fn abort_if_too_long(&self, wait: Duration, waited: Duration) -> Option<Admission> {
        if wait > self.cfg.abort_wait_cutoff || waited >= self.cfg.recharge_timeout {
            Some(Admission::RechargeNeeded { wait })
        } else {
            None
        }
    }

    /// Sleeps at most one chunk, then resyncs so the next check sees refilled tokens.
    async fn sleep_chunk(&self, wait: Duration) -> Duration {
        let chunk = wait.min(self.cfg.wait_chunk).max(Duration::from_secs(1));
        tokio::time::sleep(chunk).await;
        if let Err(e) = self.sync_with_authority().await {
            warn!("[BUDGET] sync failed while waiting: {e}");
        }
        chunk
    }
}

/// Admission rule for a request of `cost` against a pre-decrement balance of `start`.
pub fn admit(start: f64, cost: f64, refill_rate: f64, cfg: &BudgetConfig) -> bool {
    if start >= cfg.min_threshold {
        return start - cost >= -cfg.max_deficit;
    }
    cost <= cfg.priority_pass_max_cost && start >= 0.0 && refill_rate >= cfg.healthy_refill_rate
}
