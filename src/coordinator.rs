//! Target access orchestration.
//!
//! Composes the rate limiter, quarantine, escalation manager, proxy pool and
//! session factory around a caller-supplied browser action. Each target is
//! served by at most one action at a time; detection-class failures are the
//! only outcomes that touch shared quarantine and escalation state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::sleep;

use crate::config::{ConfigError, CoordinatorConfig};
use crate::detection::{Detection, DetectionKind};
use crate::modules::clock::{SharedClock, system_clock};
use crate::modules::escalation::{EscalationManager, EscalationSnapshot, EscalationTier};
use crate::modules::events::{
	ActionEvent, CoordinatorEvent, DetectionEvent, EventDispatcher, EventHandler, LoggingHandler,
	MetricsHandler, OutcomeEvent, RefusalEvent, RefusalReason, TierChangeEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::pacing::PacingPolicy;
use crate::modules::proxy::{
	FailureKind, Proxy, ProxyHealthReport, ProxyPool, ProxyRepository, RepositoryError,
};
use crate::modules::quarantine::{DomainQuarantine, QuarantineEntry, QuarantineStats};
use crate::modules::rate_limit::RateLimiter;
use crate::modules::state::{SessionSlot, TargetRegistry, TargetSnapshot, TargetState, normalize};
use crate::session::{
	BrowserSession, DefaultSessionFactory, SessionError, SessionFactory, SessionFuture,
	SessionRequest, run_session_action,
};

/// Result alias used across the coordination layer.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Error)]
pub enum CoordinatorError {
	#[error("rate limit exhausted for {target}")]
	RateLimitExhausted { target: String },
	#[error("{target} is quarantined ({})", describe_expiry(.expires_at))]
	Quarantined {
		target: String,
		expires_at: Option<DateTime<Utc>>,
	},
	#[error("detection on {target} ({signature}) at tier {tier}, quarantined for {quarantine_minutes}m")]
	DetectionSignal {
		target: String,
		reason: String,
		signature: String,
		tier: EscalationTier,
		quarantine_minutes: u64,
	},
	#[error("no healthy proxy available in group {group}")]
	ProxyUnavailable { group: String },
	#[error("action against {target} failed: {source}")]
	EngineFailure {
		target: String,
		#[source]
		source: SessionError,
	},
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("proxy repository error: {0}")]
	Repository(#[from] RepositoryError),
}

/// Stable classification of [`CoordinatorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	RateLimitExhausted,
	Quarantined,
	DetectionSignal,
	ProxyUnavailable,
	EngineFailure,
	Setup,
}

impl CoordinatorError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			CoordinatorError::RateLimitExhausted { .. } => ErrorKind::RateLimitExhausted,
			CoordinatorError::Quarantined { .. } => ErrorKind::Quarantined,
			CoordinatorError::DetectionSignal { .. } => ErrorKind::DetectionSignal,
			CoordinatorError::ProxyUnavailable { .. } => ErrorKind::ProxyUnavailable,
			CoordinatorError::EngineFailure { .. } => ErrorKind::EngineFailure,
			CoordinatorError::Config(_) | CoordinatorError::Repository(_) => ErrorKind::Setup,
		}
	}

	/// Whether retrying later can succeed without operator intervention.
	/// Quarantine refusals mean backing off entirely.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self.kind(),
			ErrorKind::RateLimitExhausted | ErrorKind::DetectionSignal | ErrorKind::EngineFailure
		)
	}
}

fn describe_expiry(expires_at: &Option<DateTime<Utc>>) -> String {
	match expires_at {
		Some(at) => format!("until {}", at.to_rfc3339()),
		None => "until released".to_string(),
	}
}

/// Read-only operator view.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorTelemetry {
	pub quarantine: QuarantineStats,
	pub quarantined: Vec<QuarantineEntry>,
	pub escalation: Vec<EscalationSnapshot>,
	pub proxies: ProxyHealthReport,
	pub targets: Vec<TargetSnapshot>,
	pub metrics: Option<MetricsSnapshot>,
}

/// Fluent builder for [`ResourceCoordinator`].
pub struct CoordinatorBuilder {
	config: CoordinatorConfig,
	clock: Option<SharedClock>,
	session_factory: Option<Arc<dyn SessionFactory>>,
	proxy_repository: Option<Arc<dyn ProxyRepository>>,
	proxies: Vec<Proxy>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl CoordinatorBuilder {
	pub fn new() -> Self {
		Self {
			config: CoordinatorConfig::default(),
			clock: None,
			session_factory: None,
			proxy_repository: None,
			proxies: Vec::new(),
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_clock(mut self, clock: SharedClock) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
		self.session_factory = Some(factory);
		self
	}

	pub fn with_proxy_repository(mut self, repository: Arc<dyn ProxyRepository>) -> Self {
		self.proxy_repository = Some(repository);
		self
	}

	pub fn with_proxies<I>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = Proxy>,
	{
		self.proxies.extend(proxies);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> CoordinatorResult<ResourceCoordinator> {
		ResourceCoordinator::from_parts(self)
	}
}

impl Default for CoordinatorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Serializes access to shared browser sessions per target.
pub struct ResourceCoordinator {
	config: CoordinatorConfig,
	clock: SharedClock,
	rate_limiter: RateLimiter,
	quarantine: DomainQuarantine,
	escalation: EscalationManager,
	proxies: ProxyPool,
	sessions: Arc<dyn SessionFactory>,
	targets: TargetRegistry,
	pacing: PacingPolicy,
	metrics: Option<MetricsCollector>,
	events: EventDispatcher,
}

impl std::fmt::Debug for ResourceCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResourceCoordinator")
			.field("targets", &self.targets.targets())
			.field("proxies", &self.proxies.len())
			.finish()
	}
}

impl ResourceCoordinator {
	/// Coordinator with default configuration and the default session factory.
	pub fn new() -> CoordinatorResult<Self> {
		CoordinatorBuilder::new().build()
	}

	pub fn builder() -> CoordinatorBuilder {
		CoordinatorBuilder::new()
	}

	fn from_parts(parts: CoordinatorBuilder) -> CoordinatorResult<Self> {
		let CoordinatorBuilder {
			config,
			clock,
			session_factory,
			proxy_repository,
			proxies,
			handlers,
		} = parts;
		config.validate()?;

		let clock = clock.unwrap_or_else(system_clock);
		let sessions = session_factory
			.unwrap_or_else(|| Arc::new(DefaultSessionFactory::new(config.session.clone())));

		let rate_limiter = RateLimiter::new(config.rate_limit.clone(), clock.clone());
		for (target, overrides) in &config.targets {
			if let Some(tier) = overrides.rate_tier {
				rate_limiter.set_domain_tier(target, tier);
			}
		}

		let pool = match proxy_repository {
			Some(repository) => {
				ProxyPool::with_repository(config.proxy_pool.clone(), clock.clone(), repository)?
			}
			None => ProxyPool::new(config.proxy_pool.clone(), clock.clone()),
		};
		if !proxies.is_empty() {
			let mut merged = pool.proxies();
			for proxy in proxies {
				if !merged.iter().any(|existing| existing.id() == proxy.id()) {
					merged.push(proxy);
				}
			}
			pool.load(merged);
			pool.persist();
		}

		let metrics = config.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}

		Ok(Self {
			quarantine: DomainQuarantine::new(clock.clone()),
			escalation: EscalationManager::new(config.escalation.clone(), clock.clone()),
			pacing: PacingPolicy::new(config.pacing),
			targets: TargetRegistry::new(),
			proxies: pool,
			rate_limiter,
			sessions,
			metrics,
			events,
			clock,
			config,
		})
	}

	/// Runs `action` against `target` under the target's lock.
	///
	/// The action receives whichever session the target's escalation tier
	/// calls for and is dispatched through [`run_session_action`], so
	/// isolated sessions are handled transparently.
	pub async fn execute<T, F>(&self, target: &str, action: F) -> CoordinatorResult<T>
	where
		T: Send + 'static,
		F: for<'a> FnOnce(&'a mut dyn BrowserSession) -> SessionFuture<'a, T> + Send + 'static,
	{
		let target = normalize(target);
		self.refuse_if_quarantined(&target)?;

		let handle = self.targets.handle(&target);
		let mut state = handle.lock().await;
		// Another action may have quarantined the target while we waited.
		self.refuse_if_quarantined(&target)?;

		let wait = self
			.pacing
			.remaining(state.last_request, state.pacing_interval, self.clock.now());
		if !wait.is_zero() {
			log::debug!("pacing {target}: sleeping {:.2}s", wait.as_secs_f64());
			sleep(wait).await;
		}

		let limits = &self.config.rate_limit;
		if !self
			.rate_limiter
			.acquire(&target, limits.wait_for_token, limits.max_wait())
			.await
		{
			self.refused(&target, RefusalReason::RateLimited);
			return Err(CoordinatorError::RateLimitExhausted { target });
		}

		let tier = self.escalation.get_current_tier(&target);
		let slot = self.checkout_session(&target, tier, &mut state).await?;
		let proxy_id = slot.session.proxy().map(Proxy::id);
		let variant = slot.session.variant();

		self.emit(CoordinatorEvent::ActionStarted(ActionEvent {
			target: target.clone(),
			tier,
			variant,
			proxy: proxy_id.clone(),
			timestamp: self.clock.now(),
		}));

		let attempted_at = self.clock.now();
		state.record_attempt(attempted_at, self.pacing.next_interval());

		let SessionSlot {
			session,
			tier: slot_tier,
			created_at,
			actions,
		} = slot;
		let started = Instant::now();
		let outcome =
			run_session_action(session, action, self.config.session.isolated_timeout()).await;
		let latency = started.elapsed();

		let result = match outcome.result {
			Ok(value) => {
				if let Some(session) = outcome.session {
					state.park_session(
						variant,
						SessionSlot {
							session,
							tier: slot_tier,
							created_at,
							actions: actions + 1,
						},
					);
				}
				if let Some(id) = &proxy_id {
					self.proxies.report_success(id);
				}
				let next_tier = self.escalation.record_success(&target);
				self.tier_changed(&target, tier, next_tier);
				self.emit(CoordinatorEvent::ActionCompleted(OutcomeEvent {
					target: target.clone(),
					tier,
					latency,
					error: None,
					timestamp: self.clock.now(),
				}));
				Ok(value)
			}
			Err(err) => {
				state.record_error(attempted_at, err.to_string());
				self.emit(CoordinatorEvent::ActionFailed(OutcomeEvent {
					target: target.clone(),
					tier,
					latency,
					error: Some(err.to_string()),
					timestamp: self.clock.now(),
				}));

				match err.detection() {
					Some(detection) => {
						// A detected session carries a burned fingerprint.
						if let Some(session) = outcome.session {
							close_quietly(session).await;
						}
						Err(self.handle_detection(&target, tier, proxy_id.as_deref(), detection))
					}
					None => {
						if let Some(session) = outcome.session {
							state.park_session(
								variant,
								SessionSlot {
									session,
									tier: slot_tier,
									created_at,
									actions: actions + 1,
								},
							);
						}
						if let (Some(id), Some(kind)) = (&proxy_id, proxy_failure_kind(&err)) {
							self.proxies.report_failure(id, kind);
						}
						Err(CoordinatorError::EngineFailure {
							target: target.clone(),
							source: err,
						})
					}
				}
			}
		};

		drop(state);
		result
	}

	fn refuse_if_quarantined(&self, target: &str) -> CoordinatorResult<()> {
		if self.escalation.get_current_tier(target) != EscalationTier::Standard
			|| !self.quarantine.is_quarantined(target)
		{
			return Ok(());
		}
		self.refused(target, RefusalReason::Quarantined);
		Err(CoordinatorError::Quarantined {
			target: target.to_string(),
			expires_at: self
				.quarantine
				.get_entry(target)
				.and_then(|entry| entry.expires_at),
		})
	}

	/// Parked session for the tier's variant, or a newly created one. Tiers
	/// that demand a fresh identity only reuse a session created at that tier.
	async fn checkout_session(
		&self,
		target: &str,
		tier: EscalationTier,
		state: &mut TargetState,
	) -> CoordinatorResult<SessionSlot> {
		let variant = tier.session_variant();
		let fresh = tier.requires_fresh_identity();

		if let Some(slot) = state.take_session(variant) {
			if !fresh || slot.tier == tier {
				return Ok(slot);
			}
			log::debug!("discarding {variant} session for {target}: identity rotation");
			close_quietly(slot.session).await;
		}

		let proxy = if fresh {
			let proxy = self.fresh_proxy(target)?;
			if proxy.is_some() {
				state.sticky_proxy = proxy.clone();
			}
			proxy
		} else {
			state.sticky_proxy.clone()
		};

		let request = SessionRequest {
			target: target.to_string(),
			variant,
			fresh_identity: fresh,
			proxy,
		};
		let session = self
			.sessions
			.create(&request)
			.await
			.map_err(|source| CoordinatorError::EngineFailure {
				target: target.to_string(),
				source,
			})?;

		Ok(SessionSlot {
			session,
			tier,
			created_at: self.clock.now(),
			actions: 0,
		})
	}

	/// A proxy from the target's group. Targets without a group, or whose group
	/// has no members, run direct.
	fn fresh_proxy(&self, target: &str) -> CoordinatorResult<Option<Proxy>> {
		let Some(group) = self.config.proxy_group_for(target) else {
			return Ok(None);
		};
		if self.proxies.group_size(group) == 0 {
			log::debug!("proxy group {group} is empty, {target} runs direct");
			return Ok(None);
		}
		match self.proxies.get_proxy_for_group(group) {
			Some(proxy) => Ok(Some(proxy)),
			None => {
				self.refused(target, RefusalReason::ProxyUnavailable);
				Err(CoordinatorError::ProxyUnavailable {
					group: group.to_string(),
				})
			}
		}
	}

	fn handle_detection(
		&self,
		target: &str,
		tier: EscalationTier,
		proxy_id: Option<&str>,
		detection: Detection,
	) -> CoordinatorError {
		if let Some(id) = proxy_id {
			let kind = match detection.kind {
				DetectionKind::Captcha => FailureKind::Captcha,
				_ => FailureKind::Blocked,
			};
			self.proxies.report_failure(id, kind);
		}

		let next_tier = self.escalation.record_failure(target, true);
		self.tier_changed(target, tier, next_tier);

		let attempt = self.quarantine.get_retry_attempt(target);
		let minutes = self.config.quarantine.backoff_minutes(attempt);
		let metadata: HashMap<String, Value> = HashMap::from([
			("signature".to_string(), json!(detection.signature)),
			("evidence".to_string(), json!(detection.evidence)),
			("tier".to_string(), json!(tier.to_string())),
			("proxy".to_string(), json!(proxy_id)),
		]);
		let entry = self.quarantine.quarantine_with_metadata(
			target,
			detection.kind.reason(),
			Some(minutes),
			metadata,
		);

		self.emit(CoordinatorEvent::Detection(DetectionEvent {
			target: target.to_string(),
			signature: detection.signature.clone(),
			reason: entry.reason.clone(),
			quarantine_minutes: minutes,
			retry_attempt: entry.retry_attempts,
			timestamp: self.clock.now(),
		}));

		CoordinatorError::DetectionSignal {
			target: target.to_string(),
			reason: entry.reason,
			signature: detection.signature,
			tier,
			quarantine_minutes: minutes,
		}
	}

	fn tier_changed(&self, target: &str, from: EscalationTier, to: EscalationTier) {
		if from != to {
			self.emit(CoordinatorEvent::TierChanged(TierChangeEvent {
				target: target.to_string(),
				from,
				to,
				timestamp: self.clock.now(),
			}));
		}
	}

	fn refused(&self, target: &str, reason: RefusalReason) {
		self.emit(CoordinatorEvent::Refused(RefusalEvent {
			target: target.to_string(),
			reason,
			timestamp: self.clock.now(),
		}));
	}

	pub(crate) fn emit(&self, event: CoordinatorEvent) {
		self.events.dispatch(event);
	}

	/// Manually lifts a quarantine and resets its retry counter.
	pub fn release_quarantine(&self, target: &str) -> bool {
		self.quarantine.release_quarantine(target)
	}

	pub fn clear_all_quarantines(&self) {
		self.quarantine.clear_all();
	}

	/// Closes every parked session of `target`; the next action starts from
	/// scratch. Waits for an in-flight action to finish first.
	pub async fn refresh_session(&self, target: &str) -> usize {
		let Some(handle) = self.targets.get(target) else {
			return 0;
		};
		let sessions = {
			let mut state = handle.lock().await;
			state.sticky_proxy = None;
			state.drain_sessions()
		};
		let closed = sessions.len();
		for session in sessions {
			close_quietly(session).await;
		}
		log::info!("refreshed {closed} session(s) for {target}");
		closed
	}

	pub fn reset_escalation(&self, target: &str) {
		self.escalation.reset(&normalize(target));
	}

	/// Closes all parked sessions of all targets.
	pub async fn close_all_sessions(&self) -> usize {
		let mut closed = 0;
		for target in self.targets.targets() {
			closed += self.refresh_session(&target).await;
		}
		closed
	}

	pub fn telemetry(&self) -> CoordinatorTelemetry {
		CoordinatorTelemetry {
			quarantine: self.quarantine.get_stats(),
			quarantined: self.quarantine.list_entries(),
			escalation: self.escalation.snapshot(),
			proxies: self.proxies.health_report(),
			targets: self.targets.snapshot(),
			metrics: self.metrics.as_ref().map(MetricsCollector::snapshot),
		}
	}

	pub fn config(&self) -> &CoordinatorConfig {
		&self.config
	}

	pub fn clock(&self) -> &SharedClock {
		&self.clock
	}

	pub fn rate_limiter(&self) -> &RateLimiter {
		&self.rate_limiter
	}

	pub fn quarantine(&self) -> &DomainQuarantine {
		&self.quarantine
	}

	pub fn escalation(&self) -> &EscalationManager {
		&self.escalation
	}

	pub fn proxy_pool(&self) -> &ProxyPool {
		&self.proxies
	}

	pub fn metrics(&self) -> Option<&MetricsCollector> {
		self.metrics.as_ref()
	}
}

fn proxy_failure_kind(err: &SessionError) -> Option<FailureKind> {
	match err {
		SessionError::Timeout(_) => Some(FailureKind::Timeout),
		SessionError::Transport(_) | SessionError::Navigation { .. } => Some(FailureKind::Connection),
		_ => None,
	}
}

async fn close_quietly(mut session: Box<dyn BrowserSession>) {
	let closing = session.close();
	if let Err(err) = tokio::time::timeout(Duration::from_secs(5), closing).await.unwrap_or(Ok(())) {
		log::debug!("session close failed: {err}");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_classification() {
		let limited = CoordinatorError::RateLimitExhausted {
			target: "google.com".into(),
		};
		assert!(limited.is_retryable());

		let quarantined = CoordinatorError::Quarantined {
			target: "google.com".into(),
			expires_at: None,
		};
		assert_eq!(quarantined.kind(), ErrorKind::Quarantined);
		assert!(!quarantined.is_retryable());
		assert!(quarantined.to_string().contains("until released"));

		let engine = CoordinatorError::EngineFailure {
			target: "bing.com".into(),
			source: SessionError::Timeout(Duration::from_secs(3)),
		};
		assert!(engine.is_retryable());
		assert!(
			!CoordinatorError::ProxyUnavailable {
				group: "search".into()
			}
			.is_retryable()
		);
	}

	#[test]
	fn proxy_failures_only_for_transport_errors() {
		assert_eq!(
			proxy_failure_kind(&SessionError::Timeout(Duration::from_secs(1))),
			Some(FailureKind::Timeout)
		);
		assert_eq!(proxy_failure_kind(&SessionError::Script("x".into())), None);
	}
}
