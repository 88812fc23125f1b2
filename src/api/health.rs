//! Shared health state for the /health endpoint.
//! Updated by the crawl trigger after every run.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::scheduler::RunOutcome;

const OUTCOME_COMPLETED: u8 = 1;
const OUTCOME_SKIPPED: u8 = 2;
const OUTCOME_ABORTED: u8 = 3;
const OUTCOME_FAILED: u8 = 4;

/// Run counters. Written by the trigger, read by the API.
#[derive(Default)]
pub struct HealthState {
    runs_completed: AtomicU64,
    runs_skipped: AtomicU64,
    runs_aborted: AtomicU64,
    runs_failed: AtomicU64,
    /// One of the `OUTCOME_*` codes (0 = no run yet).
    last_outcome: AtomicU8,
    /// Millisecond timestamp of the last finished run (0 = none).
    last_run_at_ms: AtomicI64,
    /// Millisecond timestamp of the last watermark a run saved (0 = none).
    last_watermark_ms: AtomicI64,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub runs_completed: u64,
    pub runs_skipped: u64,
    pub runs_aborted: u64,
    pub runs_failed: u64,
    pub last_outcome: Option<&'static str>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_watermark: Option<DateTime<Utc>>,
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    (ms != 0).then(|| DateTime::<Utc>::from_timestamp_millis(ms)).flatten()
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, result: &Result<RunOutcome>, at: DateTime<Utc>) {
        let (counter, code) = match result {
            Ok(RunOutcome::Completed(stats)) => {
                if let Some(w) = stats.watermark {
                    self.last_watermark_ms.store(w.timestamp_millis(), Ordering::Relaxed);
                }
                (&self.runs_completed, OUTCOME_COMPLETED)
            }
            Ok(RunOutcome::Aborted { stats, .. }) => {
                if let Some(w) = stats.watermark {
                    self.last_watermark_ms.store(w.timestamp_millis(), Ordering::Relaxed);
                }
                (&self.runs_aborted, OUTCOME_ABORTED)
            }
            Ok(RunOutcome::Skipped) => (&self.runs_skipped, OUTCOME_SKIPPED),
            Err(_) => (&self.runs_failed, OUTCOME_FAILED),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_outcome.store(code, Ordering::Relaxed);
        self.last_run_at_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last_outcome = match self.last_outcome.load(Ordering::Relaxed) {
            OUTCOME_COMPLETED => Some("completed"),
            OUTCOME_SKIPPED => Some("skipped"),
            OUTCOME_ABORTED => Some("aborted"),
            OUTCOME_FAILED => Some("failed"),
            _ => None,
        };
        HealthSnapshot {
            status: if last_outcome == Some("failed") { "degraded" } else { "ok" },
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_skipped: self.runs_skipped.load(Ordering::Relaxed),
            runs_aborted: self.runs_aborted.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            last_outcome,
            last_run_at: from_ms(self.last_run_at_ms.load(Ordering::Relaxed)),
            last_watermark: from_ms(self.last_watermark_ms.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::AppError;
    use crate::scheduler::RunStats;

    #[test]
    fn counts_outcomes_and_tracks_watermark() {
        let health = HealthState::new();
        let now = Utc::now();
        assert_eq!(health.snapshot().last_outcome, None);

        let stats = RunStats { watermark: Some(now), ..RunStats::default() };
        health.record_run(&Ok(RunOutcome::Completed(stats.clone())), now);
        health.record_run(&Ok(RunOutcome::Skipped), now);
        health.record_run(
            &Ok(RunOutcome::Aborted { wait: Duration::from_secs(600), stats: RunStats::default() }),
            now,
        );

        let snap = health.snapshot();
        assert_eq!((snap.runs_completed, snap.runs_skipped, snap.runs_aborted), (1, 1, 1));
        assert_eq!(snap.last_outcome, Some("aborted"));
        assert_eq!(snap.last_watermark.map(|w| w.timestamp_millis()), Some(now.timestamp_millis()));
        assert_eq!(snap.status, "ok");

        health.record_run(&Err(AppError::Api("down".to_string())), now);
        let snap = health.snapshot();
        assert_eq!(snap.runs_failed, 1);
        assert_eq!(snap.status, "degraded");
    }
}
