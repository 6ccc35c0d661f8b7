//! Per-target state guarded by the target's own lock.
//!
//! The registry hands out one async mutex per target. Holding it is what
//! serializes actions against that target: the live sessions, the pacing
//! timestamp and the request history are only touched under it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use super::escalation::EscalationTier;
use super::proxy::Proxy;
use crate::session::{BrowserSession, SessionVariant};

const ERROR_HISTORY_LIMIT: usize = 20;

/// A live session parked between actions.
#[derive(Debug)]
pub struct SessionSlot {
    pub session: Box<dyn BrowserSession>,
    pub tier: EscalationTier,
    pub created_at: DateTime<Utc>,
    pub actions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct TargetState {
    pub last_request: Option<DateTime<Utc>>,
    /// Gap drawn at the last request that the next one has to respect.
    pub pacing_interval: Duration,
    /// Egress proxy kept for identity-preserving tiers.
    pub sticky_proxy: Option<Proxy>,
    pub requests: u64,
    pub failures: u64,
    sessions: HashMap<SessionVariant, SessionSlot>,
    recent_errors: VecDeque<ErrorRecord>,
}

impl TargetState {
    pub fn take_session(&mut self, variant: SessionVariant) -> Option<SessionSlot> {
        self.sessions.remove(&variant)
    }

    pub fn park_session(&mut self, variant: SessionVariant, slot: SessionSlot) {
        self.sessions.insert(variant, slot);
    }

    pub fn has_session(&self, variant: SessionVariant) -> bool {
        self.sessions.contains_key(&variant)
    }

    /// Removes every parked session so the caller can close them.
    pub fn drain_sessions(&mut self) -> Vec<Box<dyn BrowserSession>> {
        self.sessions.drain().map(|(_, slot)| slot.session).collect()
    }

    pub fn record_attempt(&mut self, at: DateTime<Utc>, next_interval: Duration) {
        self.last_request = Some(at);
        self.pacing_interval = next_interval;
        self.requests += 1;
    }

    pub fn record_error(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.failures += 1;
        if self.recent_errors.len() == ERROR_HISTORY_LIMIT {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(ErrorRecord {
            at,
            message: message.into(),
        });
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.recent_errors.iter()
    }
}

/// Read-only view of a target for operators.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub target: String,
    /// Set when an action held the target lock at snapshot time.
    pub busy: bool,
    pub last_request: Option<DateTime<Utc>>,
    pub requests: u64,
    pub failures: u64,
    pub open_sessions: Vec<SessionVariant>,
    pub sticky_proxy: Option<String>,
    pub recent_errors: Vec<ErrorRecord>,
}

pub type TargetHandle = Arc<AsyncMutex<TargetState>>;

#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Mutex<HashMap<String, TargetHandle>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `target`, created on first use.
    pub fn handle(&self, target: &str) -> TargetHandle {
        self.lock()
            .entry(normalize(target))
            .or_insert_with(|| Arc::new(AsyncMutex::new(TargetState::default())))
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<TargetHandle> {
        self.lock().get(&normalize(target)).cloned()
    }

    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot without waiting on busy targets.
    pub fn snapshot(&self) -> Vec<TargetSnapshot> {
        let handles: Vec<(String, TargetHandle)> = self
            .lock()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();

        let mut snapshot: Vec<_> = handles
            .into_iter()
            .map(|(target, handle)| match handle.try_lock() {
                Ok(state) => {
                    let mut open_sessions: Vec<_> = state.sessions.keys().copied().collect();
                    open_sessions.sort_by_key(|variant| *variant == SessionVariant::Alternate);
                    TargetSnapshot {
                        target,
                        busy: false,
                        last_request: state.last_request,
                        requests: state.requests,
                        failures: state.failures,
                        open_sessions,
                        sticky_proxy: state.sticky_proxy.as_ref().map(Proxy::id),
                        recent_errors: state.recent_errors.iter().cloned().collect(),
                    }
                }
                Err(_) => TargetSnapshot {
                    target,
                    busy: true,
                    last_request: None,
                    requests: 0,
                    failures: 0,
                    open_sessions: Vec::new(),
                    sticky_proxy: None,
                    recent_errors: Vec::new(),
                },
            })
            .collect();
        snapshot.sort_by(|a, b| a.target.cmp(&b.target));
        snapshot
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TargetHandle>> {
        self.targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn normalize(target: &str) -> String {
    target.trim().to_ascii_lowercase()
}
