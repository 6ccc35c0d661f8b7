//! Metrics collection utilities.
//!
//! Aggregates global and per-target counters for coordinated actions, with
//! latency percentiles over a bounded sample window.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Aggregated metrics across all targets.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_actions: u64,
    pub successes: u64,
    pub failures: u64,
    pub detections: u64,
    pub refusals: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_actions: 0,
            successes: 0,
            failures: 0,
            detections: 0,
            refusals: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            average_latency: None,
        }
    }
}

/// Target-scoped metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStats {
    pub target: String,
    pub total_actions: u64,
    pub successes: u64,
    pub failures: u64,
    pub detections: u64,
    pub refusals: u64,
    pub consecutive_failures: u32,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl TargetStats {
    fn from_accumulator(target: &str, acc: &TargetAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            target: target.to_string(),
            total_actions: acc.total_actions,
            successes: acc.successes,
            failures: acc.failures,
            detections: acc.detections,
            refusals: acc.refusals,
            consecutive_failures: acc.consecutive_failures,
            average_latency: avg,
            p95_latency: p95,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub targets: Vec<TargetStats>,
}

#[derive(Debug)]
struct TargetAccumulator {
    total_actions: u64,
    successes: u64,
    failures: u64,
    detections: u64,
    refusals: u64,
    consecutive_failures: u32,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl TargetAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_actions: 0,
            successes: 0,
            failures: 0,
            detections: 0,
            refusals: 0,
            consecutive_failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.total_actions += 1;
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().copied().collect();
        samples.sort_unstable();
        let avg = samples.iter().sum::<Duration>() / samples.len() as u32;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(avg), Some(samples[p95_index]))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    targets: HashMap<String, TargetAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            targets: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, target: &str) -> &mut TargetAccumulator {
        let window = self.max_window;
        self.targets
            .entry(target.to_string())
            .or_insert_with(|| TargetAccumulator::new(window))
    }
}

/// Thread-safe metrics collector shared by the coordinator and scheduler.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    pub fn record_outcome(&self, target: &str, success: bool, latency: Duration) {
        let mut guard = self.lock();
        guard.global.total_actions += 1;
        if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => {
                Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1)
            }
            None => latency,
        });

        guard.accumulator_mut(target).record(success, latency);
    }

    pub fn record_detection(&self, target: &str) {
        let mut guard = self.lock();
        guard.global.detections += 1;
        guard.accumulator_mut(target).detections += 1;
    }

    pub fn record_refusal(&self, target: &str) {
        let mut guard = self.lock();
        guard.global.refusals += 1;
        guard.accumulator_mut(target).refusals += 1;
    }

    pub fn record_job(&self, success: bool) {
        let mut guard = self.lock();
        if success {
            guard.global.jobs_completed += 1;
        } else {
            guard.global.jobs_failed += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.lock();
        let mut targets: Vec<_> = guard
            .targets
            .iter()
            .map(|(target, acc)| TargetStats::from_accumulator(target, acc))
            .collect();
        targets.sort_by(|a, b| a.target.cmp(&b.target));
        MetricsSnapshot {
            global: guard.global.clone(),
            targets,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_outcomes_per_target() {
        let metrics = MetricsCollector::new();
        metrics.record_outcome("google.com", true, Duration::from_millis(150));
        metrics.record_outcome("google.com", false, Duration::from_millis(800));
        metrics.record_detection("google.com");
        metrics.record_refusal("yelp.com");

        let snapshot = metrics.snapshot();
        let google = snapshot
            .targets
            .iter()
            .find(|t| t.target == "google.com")
            .unwrap();
        assert_eq!(google.total_actions, 2);
        assert_eq!(google.successes, 1);
        assert_eq!(google.detections, 1);
        assert_eq!(google.p95_latency, Some(Duration::from_millis(800)));
        assert_eq!(snapshot.global.refusals, 1);
    }

    #[test]
    fn counts_jobs() {
        let metrics = MetricsCollector::new();
        metrics.record_job(true);
        metrics.record_job(false);
        metrics.record_job(true);
        let global = metrics.snapshot().global;
        assert_eq!(global.jobs_completed, 2);
        assert_eq!(global.jobs_failed, 1);
    }
}
