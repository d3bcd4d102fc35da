//! Artifact freshness as a pure function of `(now, timestamp, threshold)`.

use chrono::{DateTime, Duration, Utc};

/// Default maximum age, in hours, of a housekeeping artifact accepted by the exit gate.
pub const DEFAULT_MAX_AGE_HOURS: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub age: Duration,
    pub threshold: Duration,
    pub fresh: bool,
}

/// Evaluate freshness. Fresh means `now - timestamp <= threshold`; the boundary is fresh.
///
/// A timestamp in the future is treated as age zero.
pub fn evaluate(now: DateTime<Utc>, timestamp: DateTime<Utc>, threshold: Duration) -> Freshness {
    let age = (now - timestamp).max(Duration::zero());
    Freshness {
        age,
        threshold,
        fresh: age <= threshold,
    }
}

pub fn is_fresh(now: DateTime<Utc>, timestamp: DateTime<Utc>, threshold: Duration) -> bool {
    evaluate(now, timestamp, threshold).fresh
}

impl Freshness {
    /// Human-readable staleness, e.g. `age 30h > 24h threshold`.
    pub fn describe(&self) -> String {
        let op = if self.fresh { "<=" } else { ">" };
        format!(
            "age {} {op} {} threshold",
            format_duration(self.age),
            format_duration(self.threshold)
        )
    }
}

/// Compact `XhYmZs` rendering that drops trailing zero units.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if seconds != 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes != 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{hours}h")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_is_fresh_and_one_second_past_is_stale() {
        let timestamp = Utc::now();
        let threshold = Duration::hours(24);
        assert!(is_fresh(timestamp + threshold, timestamp, threshold));
        assert!(!is_fresh(
            timestamp + threshold + Duration::seconds(1),
            timestamp,
            threshold
        ));
    }

    #[test]
    fn future_timestamp_counts_as_age_zero() {
        let now = Utc::now();
        let freshness = evaluate(now, now + Duration::minutes(5), Duration::hours(1));
        assert!(freshness.fresh);
        assert_eq!(freshness.age, Duration::zero());
    }

    #[test]
    fn describes_staleness_in_hours() {
        let now = Utc::now();
        let freshness = evaluate(now, now - Duration::hours(30), Duration::hours(24));
        assert_eq!(freshness.describe(), "age 30h > 24h threshold");
    }

    #[test]
    fn formats_partial_hours() {
        assert_eq!(format_duration(Duration::seconds(86_401)), "24h 0m 1s");
        assert_eq!(format_duration(Duration::minutes(90)), "1h 30m");
    }
}
