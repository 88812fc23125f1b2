use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::JANITOR_INTERVAL_SECS;
use crate::db::PersistenceGateway;
use crate::error::Result;
use crate::types::Clock;

/// Background task that deletes deal rows not seen by any crawl for
/// `grace_hours`. Runs hourly.
pub struct Janitor {
    gateway: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
    grace_hours: i64,
}

impl Janitor {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, clock: Arc<dyn Clock>, grace_hours: i64) -> Self {
        Self { gateway, clock, grace_hours }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(JANITOR_INTERVAL_SECS));
        interval.tick().await; // consume immediate first tick

        loop {
            interval.tick().await;
            if let Err(e) = self.sweep().await {
                error!("[JANITOR] sweep failed: {e}");
            }
        }
    }

    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = self.clock.now() - chrono::Duration::hours(self.grace_hours);
        let removed = self.gateway.delete_stale(cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "[JANITOR] removed stale deals");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::testing::{row, ManualClock, MemoryGateway};

    #[tokio::test]
    async fn sweep_removes_only_rows_past_grace() {
        let now = Utc::now();
        let gateway = Arc::new(MemoryGateway::default());
        let mut stale = row("B00000OLD1");
        stale.last_seen = now - chrono::Duration::hours(73);
        let mut fresh = row("B00000NEW1");
        fresh.last_seen = now - chrono::Duration::hours(71);
        gateway.insert_row(stale);
        gateway.insert_row(fresh);

        let janitor = Janitor::new(gateway.clone(), Arc::new(ManualClock::new(now)), 72);
        assert_eq!(janitor.sweep().await.unwrap(), 1);
        assert!(gateway.row("B00000OLD1").is_none());
        assert!(gateway.row("B00000NEW1").is_some());
    }
}
