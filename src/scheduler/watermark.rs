use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::SchedulerConfig;

/// Starting watermark for a run. Missing → `now - default_watermark_age`.
/// More than `max_future_watermark` ahead of now → reset to now; anything
/// closer is kept so a slightly-ahead value does not cause a rescan loop.
pub fn initial(stored: Option<DateTime<Utc>>, now: DateTime<Utc>, cfg: &SchedulerConfig) -> DateTime<Utc> {
    match stored {
        None => now - cfg.default_watermark_age,
        Some(at) if at > now + cfg.max_future_watermark => {
            warn!(stored = %at, now = %now, "[SCHEDULER] watermark implausibly in the future, resetting to now");
            now
        }
        Some(at) => at,
    }
}

/// Next watermark after a chunk whose newest-scanned item is `chunk_newest`.
/// Never moves backwards and never passes `now + watermark_tolerance`.
/// `None` when there is nothing to save.
pub fn advance(
    current: DateTime<Utc>,
    chunk_newest: DateTime<Utc>,
    now: DateTime<Utc>,
    cfg: &SchedulerConfig,
) -> Option<DateTime<Utc>> {
    let next = chunk_newest.min(now + cfg.watermark_tolerance);
    (next > current).then_some(next)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn initial_defaults_and_clamps() {
        let cfg = SchedulerConfig::default();
        assert_eq!(initial(None, now(), &cfg), now() - Duration::hours(24));

        let past = now() - Duration::hours(3);
        assert_eq!(initial(Some(past), now(), &cfg), past);

        let slightly_ahead = now() + Duration::hours(2);
        assert_eq!(initial(Some(slightly_ahead), now(), &cfg), slightly_ahead);

        let far_future = now() + Duration::days(30);
        assert_eq!(initial(Some(far_future), now(), &cfg), now());
    }

    #[test]
    fn advance_is_monotonic_and_clamped() {
        let cfg = SchedulerConfig::default();
        let current = now() - Duration::hours(1);

        let newer = now() - Duration::minutes(10);
        assert_eq!(advance(current, newer, now(), &cfg), Some(newer));

        // Older chunk never rewinds.
        assert_eq!(advance(current, now() - Duration::hours(2), now(), &cfg), None);
        assert_eq!(advance(current, current, now(), &cfg), None);

        // Future-dated catalog timestamps are clamped to now + tolerance.
        let future = now() + Duration::hours(6);
        assert_eq!(advance(current, future, now(), &cfg), Some(now() + Duration::minutes(5)));
    }
}
