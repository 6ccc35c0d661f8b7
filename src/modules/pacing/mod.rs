//! Human-like pacing between consecutive requests to one target.
//!
//! Independent of the hourly rate budget: each request picks a randomized
//! minimum gap, and the next request to the same target sleeps out whatever
//! part of that gap has not yet elapsed.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::clock::std_duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 2_000,
            max_interval_ms: 6_000,
        }
    }
}

impl PacingConfig {
    /// No pacing at all; handy for tests and local targets.
    pub const fn disabled() -> Self {
        Self {
            min_interval_ms: 0,
            max_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacingPolicy {
    config: PacingConfig,
}

impl PacingPolicy {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Draws the gap that has to pass before the next request.
    pub fn next_interval(&self) -> Duration {
        let min = self.config.min_interval_ms;
        let max = self.config.max_interval_ms.max(min);
        if max == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(min..=max);
        Duration::from_millis(millis)
    }

    /// Portion of `interval` still outstanding at `now`.
    pub fn remaining(
        &self,
        last_request: Option<DateTime<Utc>>,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Duration {
        let Some(last) = last_request else {
            return Duration::ZERO;
        };
        let elapsed = std_duration(now - last);
        interval.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_stays_in_range() {
        let policy = PacingPolicy::new(PacingConfig {
            min_interval_ms: 100,
            max_interval_ms: 250,
        });
        for _ in 0..200 {
            let interval = policy.next_interval();
            assert!(interval >= Duration::from_millis(100));
            assert!(interval <= Duration::from_millis(250));
        }
        assert_eq!(PacingPolicy::new(PacingConfig::disabled()).next_interval(), Duration::ZERO);
    }

    #[test]
    fn remaining_sleeps_out_the_gap() {
        let policy = PacingPolicy::new(PacingConfig::default());
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(2);
        assert_eq!(
            policy.remaining(Some(last), Duration::from_secs(5), now),
            Duration::from_secs(3)
        );
        assert_eq!(policy.remaining(Some(last), Duration::from_secs(1), now), Duration::ZERO);
        assert_eq!(policy.remaining(None, Duration::from_secs(5), now), Duration::ZERO);
    }
}
