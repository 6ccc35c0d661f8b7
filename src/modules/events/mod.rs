//! Coordinator event stream.
//!
//! The coordinator and the job scheduler report what they do through typed
//! events; handlers turn them into log lines, metrics or custom reactions.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::escalation::EscalationTier;
use super::metrics::MetricsCollector;
use crate::session::SessionVariant;

#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub target: String,
    pub tier: EscalationTier,
    pub variant: SessionVariant,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub target: String,
    pub tier: EscalationTier,
    pub latency: Duration,
    /// `None` on success.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub target: String,
    pub signature: String,
    pub reason: String,
    pub quarantine_minutes: u64,
    pub retry_attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    Quarantined,
    RateLimited,
    ProxyUnavailable,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefusalReason::Quarantined => f.write_str("quarantined"),
            RefusalReason::RateLimited => f.write_str("rate limited"),
            RefusalReason::ProxyUnavailable => f.write_str("proxy unavailable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefusalEvent {
    pub target: String,
    pub reason: RefusalReason,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TierChangeEvent {
    pub target: String,
    pub from: EscalationTier,
    pub to: EscalationTier,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: u64,
    pub query: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    ActionStarted(ActionEvent),
    ActionCompleted(OutcomeEvent),
    ActionFailed(OutcomeEvent),
    Detection(DetectionEvent),
    Refused(RefusalEvent),
    TierChanged(TierChangeEvent),
    JobFinished(JobEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CoordinatorEvent);
}

/// Broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: CoordinatorEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &CoordinatorEvent) {
        match event {
            CoordinatorEvent::ActionStarted(action) => {
                log::debug!(
                    "-> {} [{} / {}] via {}",
                    action.target,
                    action.tier,
                    action.variant,
                    action.proxy.as_deref().unwrap_or("direct")
                );
            }
            CoordinatorEvent::ActionCompleted(done) => {
                log::debug!("<- {} ok ({:.2}s)", done.target, done.latency.as_secs_f64());
            }
            CoordinatorEvent::ActionFailed(failed) => {
                log::warn!(
                    "<- {} failed after {:.2}s: {}",
                    failed.target,
                    failed.latency.as_secs_f64(),
                    failed.error.as_deref().unwrap_or("unknown error")
                );
            }
            CoordinatorEvent::Detection(detection) => {
                log::warn!(
                    "detection on {} ({}): quarantined {}m, attempt {}",
                    detection.target,
                    detection.signature,
                    detection.quarantine_minutes,
                    detection.retry_attempt
                );
            }
            CoordinatorEvent::Refused(refusal) => {
                log::info!("refused {}: {}", refusal.target, refusal.reason);
            }
            CoordinatorEvent::TierChanged(change) => {
                log::info!("tier {} -> {} for {}", change.from, change.to, change.target);
            }
            CoordinatorEvent::JobFinished(job) => {
                log::debug!("job-{} '{}' finished success={}", job.job_id, job.query, job.success);
            }
        }
    }
}

/// Feeds events into a [`MetricsCollector`].
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &CoordinatorEvent) {
        match event {
            CoordinatorEvent::ActionCompleted(done) => {
                self.metrics.record_outcome(&done.target, true, done.latency);
            }
            CoordinatorEvent::ActionFailed(failed) => {
                self.metrics.record_outcome(&failed.target, false, failed.latency);
            }
            CoordinatorEvent::Detection(detection) => {
                self.metrics.record_detection(&detection.target);
            }
            CoordinatorEvent::Refused(refusal) => {
                self.metrics.record_refusal(&refusal.target);
            }
            CoordinatorEvent::JobFinished(job) => {
                self.metrics.record_job(job.success);
            }
            CoordinatorEvent::ActionStarted(_) | CoordinatorEvent::TierChanged(_) => {}
        }
    }
}
