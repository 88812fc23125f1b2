use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::error;

use crate::api::health::HealthState;
use crate::error::Result;
use crate::scheduler::{CrawlScheduler, RunOutcome};
use crate::types::Clock;

/// Periodic caller of `CrawlScheduler::run`. The HTTP `/run` endpoint goes
/// through `fire` as well, so both paths are recorded the same way.
pub struct CrawlTrigger {
    scheduler: Arc<CrawlScheduler>,
    health: Arc<HealthState>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
}

impl CrawlTrigger {
    pub fn new(scheduler: Arc<CrawlScheduler>, health: Arc<HealthState>, clock: Arc<dyn Clock>, interval_secs: u64) -> Self {
        Self { scheduler, health, clock, interval_secs }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // A run can outlast the interval; don't stack up missed ticks behind it.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // First tick fires immediately: crawl once on startup.
            ticker.tick().await;
            if let Err(e) = fire(&self.scheduler, &self.health, self.clock.as_ref()).await {
                error!("Crawl run failed: {e}");
            }
        }
    }
}

/// Runs one crawl and records its outcome.
pub async fn fire(scheduler: &CrawlScheduler, health: &HealthState, clock: &dyn Clock) -> Result<RunOutcome> {
    let result = scheduler.run().await;
    health.record_run(&result, clock.now());
    result
}
