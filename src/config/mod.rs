//! Coordinator configuration.
//!
//! Aggregates the per-component settings into one document that can be built
//! in code or loaded from JSON, and validates it before anything is
//! constructed from it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::modules::escalation::EscalationConfig;
use crate::modules::pacing::PacingConfig;
use crate::modules::proxy::{PoolAllocation, ProxyPoolConfig};
use crate::modules::quarantine::QuarantineConfig;
use crate::modules::rate_limit::{RateLimitConfig, RateTier};
use crate::scheduler::SchedulerConfig;
use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-target overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub rate_tier: Option<RateTier>,
    /// Consumer group whose proxy partition serves this target.
    pub proxy_group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub rate_limit: RateLimitConfig,
    pub quarantine: QuarantineConfig,
    pub escalation: EscalationConfig,
    pub proxy_pool: ProxyPoolConfig,
    pub pacing: PacingConfig,
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub targets: HashMap<String, TargetConfig>,
    pub default_proxy_group: Option<String>,
    pub enable_metrics: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            quarantine: QuarantineConfig::default(),
            escalation: EscalationConfig::default(),
            proxy_pool: ProxyPoolConfig::default(),
            pacing: PacingConfig::default(),
            session: SessionConfig::default(),
            scheduler: SchedulerConfig::default(),
            targets: HashMap::new(),
            default_proxy_group: None,
            enable_metrics: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Proxy group serving `target`: its override, else the default group.
    pub fn proxy_group_for(&self, target: &str) -> Option<&str> {
        self.target(target)
            .and_then(|config| config.proxy_group.as_deref())
            .or(self.default_proxy_group.as_deref())
    }

    pub fn target(&self, target: &str) -> Option<&TargetConfig> {
        let key = target.trim().to_ascii_lowercase();
        self.targets
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&key))
            .map(|(_, config)| config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for tier in RateTier::ALL {
            match self.rate_limit.tiers.get(&tier) {
                Some(limits) if limits.window_secs > MAX_SPAN_MINUTES * 60 => {
                    return Err(invalid(format!("rate tier {tier} window is too long")));
                }
                Some(limits) if limits.capacity > 0 && limits.window_secs > 0 => {}
                Some(_) => {
                    return Err(invalid(format!(
                        "rate tier {tier} needs a positive capacity and window"
                    )));
                }
                None => return Err(invalid(format!("rate tier {tier} is not configured"))),
            }
        }

        if self.quarantine.base_minutes == 0 {
            return Err(invalid("quarantine base_minutes must be positive"));
        }
        if self.quarantine.max_minutes < self.quarantine.base_minutes {
            return Err(invalid("quarantine max_minutes is below base_minutes"));
        }
        bounded("quarantine max_minutes", self.quarantine.max_minutes)?;
        if self.escalation.success_threshold == 0 {
            return Err(invalid("escalation success_threshold must be positive"));
        }

        let pool = &self.proxy_pool;
        if pool.failure_threshold == 0 {
            return Err(invalid("proxy failure_threshold must be positive"));
        }
        bounded("proxy failure_window_minutes", pool.failure_window_minutes)?;
        bounded("proxy blacklist_minutes", pool.blacklist_minutes)?;
        if !(0.0..=1.0).contains(&pool.min_success_rate) {
            return Err(invalid("proxy min_success_rate must be within 0..=1"));
        }
        let mut groups = HashSet::new();
        for PoolAllocation { name, .. } in &pool.groups {
            if name.trim().is_empty() {
                return Err(invalid("proxy group names must not be empty"));
            }
            if !groups.insert(name.as_str()) {
                return Err(invalid(format!("proxy group {name} is declared twice")));
            }
        }
        let referenced = self
            .targets
            .values()
            .filter_map(|target| target.proxy_group.as_deref())
            .chain(self.default_proxy_group.as_deref());
        for group in referenced {
            if !groups.contains(group) {
                return Err(invalid(format!("unknown proxy group {group}")));
            }
        }

        if self.pacing.min_interval_ms > self.pacing.max_interval_ms {
            return Err(invalid("pacing min_interval_ms exceeds max_interval_ms"));
        }
        if self.session.isolated_timeout_secs == 0 {
            return Err(invalid("session isolated_timeout_secs must be positive"));
        }
        if self.scheduler.workers == 0 {
            return Err(invalid("scheduler needs at least one worker"));
        }
        bounded("scheduler cache_ttl_secs", self.scheduler.cache_ttl_secs / 60)?;
        Ok(())
    }
}

/// Longest span any timer may be configured with: ten years.
const MAX_SPAN_MINUTES: u64 = 10 * 365 * 24 * 60;

fn bounded(name: &str, minutes: u64) -> Result<(), ConfigError> {
    if minutes > MAX_SPAN_MINUTES {
        return Err(invalid(format!("{name} exceeds ten years")));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Fluent builder for [`CoordinatorConfig`].
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    pub fn with_quarantine(mut self, config: QuarantineConfig) -> Self {
        self.config.quarantine = config;
        self
    }

    pub fn with_escalation(mut self, config: EscalationConfig) -> Self {
        self.config.escalation = config;
        self
    }

    pub fn with_proxy_pool(mut self, config: ProxyPoolConfig) -> Self {
        self.config.proxy_pool = config;
        self
    }

    pub fn with_pacing(mut self, config: PacingConfig) -> Self {
        self.config.pacing = config;
        self
    }

    pub fn with_session(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    pub fn with_scheduler(mut self, config: SchedulerConfig) -> Self {
        self.config.scheduler = config;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>, config: TargetConfig) -> Self {
        self.config
            .targets
            .insert(target.into().trim().to_ascii_lowercase(), config);
        self
    }

    pub fn with_default_proxy_group(mut self, group: impl Into<String>) -> Self {
        self.config.default_proxy_group = Some(group.into());
        self
    }

    pub fn disable_metrics(mut self) -> Self {
        self.config.enable_metrics = false;
        self
    }

    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
