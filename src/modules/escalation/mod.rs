//! Staged evasion escalation per target.
//!
//! The cheap default identity is used until a confirmed detection event; each
//! detection moves the target one tier up, and a streak of successes at the
//! current tier moves it one tier back down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::modules::clock::SharedClock;
use crate::session::SessionVariant;

/// Ordered evasion levels for the browser identity used against a target.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EscalationTier {
    #[default]
    Standard,
    AltEngineSameIdentity,
    AltEngineNewIdentity,
}

impl EscalationTier {
    pub const MAX: EscalationTier = EscalationTier::AltEngineNewIdentity;

    pub fn next(self) -> Self {
        match self {
            EscalationTier::Standard => EscalationTier::AltEngineSameIdentity,
            EscalationTier::AltEngineSameIdentity | EscalationTier::AltEngineNewIdentity => {
                EscalationTier::AltEngineNewIdentity
            }
        }
    }

    pub fn previous(self) -> Self {
        match self {
            EscalationTier::Standard | EscalationTier::AltEngineSameIdentity => {
                EscalationTier::Standard
            }
            EscalationTier::AltEngineNewIdentity => EscalationTier::AltEngineSameIdentity,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            EscalationTier::Standard => 0,
            EscalationTier::AltEngineSameIdentity => 1,
            EscalationTier::AltEngineNewIdentity => 2,
        }
    }

    /// Session implementation serving this tier.
    pub fn session_variant(self) -> SessionVariant {
        match self {
            EscalationTier::Standard => SessionVariant::Standard,
            EscalationTier::AltEngineSameIdentity | EscalationTier::AltEngineNewIdentity => {
                SessionVariant::Alternate
            }
        }
    }

    /// Whether sessions at this tier must present a fresh fingerprint and
    /// egress proxy.
    pub fn requires_fresh_identity(self) -> bool {
        matches!(self, EscalationTier::AltEngineNewIdentity)
    }
}

impl fmt::Display for EscalationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EscalationTier::Standard => "standard",
            EscalationTier::AltEngineSameIdentity => "alt_engine_same_identity",
            EscalationTier::AltEngineNewIdentity => "alt_engine_new_identity",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Consecutive successes needed to step down one tier.
    pub success_threshold: u32,
    pub max_tier: EscalationTier,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            success_threshold: 5,
            max_tier: EscalationTier::MAX,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EscalationState {
    tier: EscalationTier,
    success_streak: u32,
    escalations: u32,
    last_change: Option<DateTime<Utc>>,
}

/// Read-only view for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationSnapshot {
    pub target: String,
    pub tier: EscalationTier,
    pub success_streak: u32,
    pub escalations: u32,
    pub last_change: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct EscalationManager {
    config: EscalationConfig,
    clock: SharedClock,
    states: RwLock<HashMap<String, EscalationState>>,
}

impl EscalationManager {
    pub fn new(config: EscalationConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_current_tier(&self, target: &str) -> EscalationTier {
        self.read()
            .get(&normalize(target))
            .map(|state| state.tier)
            .unwrap_or_default()
    }

    /// Extends the success streak, stepping down one tier once the streak
    /// reaches the configured threshold. Returns the tier now in effect.
    pub fn record_success(&self, target: &str) -> EscalationTier {
        let key = normalize(target);
        let now = self.clock.now();
        let mut states = self.write();
        let state = states.entry(key.clone()).or_default();

        if state.tier == EscalationTier::Standard {
            state.success_streak = 0;
            return state.tier;
        }

        state.success_streak = state.success_streak.saturating_add(1);
        if state.success_streak >= self.config.success_threshold.max(1) {
            let previous = state.tier;
            state.tier = previous.previous();
            state.success_streak = 0;
            state.last_change = Some(now);
            log::info!("de-escalated {key}: {previous} -> {}", state.tier);
        }
        state.tier
    }

    /// Only confirmed captcha/detection failures escalate; ordinary failures
    /// leave the tier and streak untouched.
    pub fn record_failure(&self, target: &str, is_captcha: bool) -> EscalationTier {
        let key = normalize(target);
        if !is_captcha {
            return self.get_current_tier(&key);
        }

        let now = self.clock.now();
        let mut states = self.write();
        let state = states.entry(key.clone()).or_default();
        let previous = state.tier;
        state.tier = previous.next().min(self.config.max_tier);
        state.success_streak = 0;
        state.escalations = state.escalations.saturating_add(1);
        if state.tier != previous {
            state.last_change = Some(now);
            log::warn!("escalated {key}: {previous} -> {}", state.tier);
        }
        state.tier
    }

    pub fn reset(&self, target: &str) {
        self.write().remove(&normalize(target));
    }

    pub fn snapshot(&self) -> Vec<EscalationSnapshot> {
        let mut snapshot: Vec<_> = self
            .read()
            .iter()
            .map(|(target, state)| EscalationSnapshot {
                target: target.clone(),
                tier: state.tier,
                success_streak: state.success_streak,
                escalations: state.escalations,
                last_change: state.last_change,
            })
            .collect();
        snapshot.sort_by(|a, b| a.target.cmp(&b.target));
        snapshot
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, EscalationState>> {
        self.states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, EscalationState>> {
        self.states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn normalize(target: &str) -> String {
    target.trim().to_ascii_lowercase()
}
