//! Sticky, health-tracked egress proxy pool.
//!
//! Proxies are partitioned once into named consumer groups; the assignment is
//! persisted so a proxy keeps serving the same group across restarts and
//! builds a stable reputation there. Selection round-robins a group's
//! partition and skips unhealthy members.

mod repository;

pub use repository::{
    JsonFileProxyRepository, MemoryProxyRepository, ProxyDocument, ProxyRepository,
    RedbProxyRepository, RepositoryError,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::modules::clock::{SharedClock, chrono_duration};

/// Geographic metadata attached to a proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyGeo {
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub timezone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl ProxyGeo {
    fn matches_region(&self, region: &str) -> bool {
        [&self.region, &self.country, &self.city]
            .into_iter()
            .flatten()
            .any(|value| value.eq_ignore_ascii_case(region))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    Timeout,
    Blocked,
    Captcha,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::Blocked => "blocked",
            FailureKind::Captcha => "captcha",
            FailureKind::Other => "other",
        };
        f.write_str(label)
    }
}

/// One egress proxy and its health counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub geo: ProxyGeo,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub blacklisted: bool,
    #[serde(default)]
    pub blacklist_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_pool: Option<String>,
    #[serde(default)]
    pub window_failures: u32,
    #[serde(default)]
    pub window_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_kind: Option<FailureKind>,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            geo: ProxyGeo::default(),
            success_count: 0,
            failure_count: 0,
            blacklisted: false,
            blacklist_until: None,
            assigned_pool: None,
            window_failures: 0,
            window_started: None,
            last_failure_kind: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_geo(mut self, geo: ProxyGeo) -> Self {
        self.geo = geo;
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.assigned_pool = Some(pool.into());
        self
    }

    /// Stable identifier, `host:port`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL including credentials, as understood by HTTP clients.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("http://{user}:{pass}@{}:{}", self.host, self.port),
            (Some(user), None) => format!("http://{user}@{}:{}", self.host, self.port),
            _ => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn total_attempts(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_attempts();
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn is_blacklisted(&self, now: DateTime<Utc>) -> bool {
        self.blacklisted && self.blacklist_until.is_none_or(|until| now < until)
    }

    /// Not blacklisted (or the blacklist lapsed) and either still young or
    /// succeeding at least at the configured rate.
    pub fn is_healthy(&self, now: DateTime<Utc>, config: &ProxyPoolConfig) -> bool {
        if self.is_blacklisted(now) {
            return false;
        }
        self.total_attempts() < config.min_attempts_for_rate
            || self.success_rate() >= config.min_success_rate
    }
}

/// Target size of one consumer group's partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAllocation {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub failure_threshold: u32,
    pub failure_window_minutes: u64,
    pub blacklist_minutes: u64,
    pub min_attempts_for_rate: u64,
    pub min_success_rate: f64,
    pub groups: Vec<PoolAllocation>,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_minutes: 10,
            blacklist_minutes: 30,
            min_attempts_for_rate: 10,
            min_success_rate: 0.5,
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupHealth {
    pub total: usize,
    pub healthy: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyHealthReport {
    pub total_proxies: usize,
    pub healthy_proxies: usize,
    pub blacklisted_proxies: usize,
    pub unassigned_proxies: usize,
    pub groups: BTreeMap<String, GroupHealth>,
}

#[derive(Debug, Default)]
struct Partition {
    members: Vec<usize>,
    cursor: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    proxies: Vec<Proxy>,
    partitions: HashMap<String, Partition>,
}

impl PoolState {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.proxies.iter().position(|proxy| proxy.id() == id)
    }

    fn rebuild_partitions(&mut self) {
        self.partitions.clear();
        for (idx, proxy) in self.proxies.iter().enumerate() {
            if let Some(pool) = &proxy.assigned_pool {
                self.partitions.entry(pool.clone()).or_default().members.push(idx);
            }
        }
    }
}

/// Thread-safe proxy pool guarded by its own lock.
#[derive(Debug)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    clock: SharedClock,
    repository: Option<Arc<dyn ProxyRepository>>,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            repository: None,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Builds a pool from the repository contents and persists the partition
    /// assignment it settles on.
    pub fn with_repository(
        config: ProxyPoolConfig,
        clock: SharedClock,
        repository: Arc<dyn ProxyRepository>,
    ) -> Result<Self, RepositoryError> {
        let proxies = repository.load()?;
        let mut pool = Self::new(config, clock);
        pool.repository = Some(repository);
        pool.load(proxies);
        pool.persist();
        Ok(pool)
    }

    /// Replaces the pool contents, keeping existing group assignments and
    /// distributing unassigned proxies over the configured groups.
    pub fn load(&self, proxies: Vec<Proxy>) {
        let mut state = self.lock();
        let mut deduped: Vec<Proxy> = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            if !deduped.iter().any(|existing| existing.id() == proxy.id()) {
                deduped.push(proxy);
            }
        }
        state.proxies = deduped;
        self.assign_partitions(&mut state);
        state.rebuild_partitions();
        log::info!(
            "proxy pool loaded: {} proxies across {} groups",
            state.proxies.len(),
            state.partitions.len()
        );
    }

    fn assign_partitions(&self, state: &mut PoolState) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for proxy in &state.proxies {
            if let Some(pool) = proxy.assigned_pool.as_deref() {
                *counts.entry(pool).or_default() += 1;
            }
        }
        let mut remaining: Vec<(String, usize)> = self
            .config
            .groups
            .iter()
            .map(|group| {
                let taken = counts.get(group.name.as_str()).copied().unwrap_or(0);
                (group.name.clone(), group.size.saturating_sub(taken))
            })
            .collect();

        for proxy in state.proxies.iter_mut().filter(|p| p.assigned_pool.is_none()) {
            if let Some((name, slots)) = remaining.iter_mut().find(|(_, slots)| *slots > 0) {
                proxy.assigned_pool = Some(name.clone());
                *slots -= 1;
                log::debug!("assigned proxy {} to group {name}", proxy.id());
            }
        }
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.lock().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().partitions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn group_size(&self, group: &str) -> usize {
        self.lock()
            .partitions
            .get(group)
            .map(|partition| partition.members.len())
            .unwrap_or(0)
    }

    pub fn proxies(&self) -> Vec<Proxy> {
        self.lock().proxies.clone()
    }

    /// Next healthy member of the group's partition in round-robin order.
    pub fn get_proxy_for_group(&self, group: &str) -> Option<Proxy> {
        let now = self.clock.now();
        let mut guard = self.lock();
        let state = &mut *guard;
        let partition = state.partitions.get_mut(group)?;
        let len = partition.members.len();

        for offset in 0..len {
            let slot = (partition.cursor + offset) % len;
            let idx = partition.members[slot];
            if state.proxies[idx].is_healthy(now, &self.config) {
                partition.cursor = (slot + 1) % len;
                return Some(state.proxies[idx].clone());
            }
        }
        log::warn!("no healthy proxies left in group {group}");
        None
    }

    /// Healthy proxy in the exact region when possible, otherwise any healthy
    /// proxy. Ties go to the better success rate.
    pub fn get_proxy_for_region(&self, region: &str) -> Option<Proxy> {
        let now = self.clock.now();
        let state = self.lock();
        let healthy: Vec<&Proxy> = state
            .proxies
            .iter()
            .filter(|proxy| proxy.is_healthy(now, &self.config))
            .collect();
        let best = |candidates: Vec<&Proxy>| {
            candidates
                .into_iter()
                .max_by(|a, b| a.success_rate().total_cmp(&b.success_rate()))
                .cloned()
        };

        let regional = healthy
            .iter()
            .copied()
            .filter(|proxy| proxy.geo.matches_region(region))
            .collect();
        best(regional).or_else(|| best(healthy))
    }

    pub fn has_healthy_proxies(&self, group: &str) -> bool {
        let now = self.clock.now();
        let state = self.lock();
        state.partitions.get(group).is_some_and(|partition| {
            partition
                .members
                .iter()
                .any(|&idx| state.proxies[idx].is_healthy(now, &self.config))
        })
    }

    /// Counts a success; any success lifts a blacklist immediately.
    pub fn report_success(&self, proxy_id: &str) {
        {
            let mut state = self.lock();
            let Some(idx) = state.index_of(proxy_id) else {
                return;
            };
            let proxy = &mut state.proxies[idx];
            proxy.success_count += 1;
            proxy.window_failures = 0;
            proxy.window_started = None;
            let was_blacklisted = proxy.blacklisted;
            proxy.blacklisted = false;
            proxy.blacklist_until = None;
            if was_blacklisted {
                log::info!("proxy {proxy_id} recovered, blacklist cleared");
            }
        }
        self.persist();
    }

    /// Counts a failure. Reaching the threshold within the failure window
    /// blacklists the proxy for the configured duration. Returns whether this
    /// report blacklisted it.
    pub fn report_failure(&self, proxy_id: &str, kind: FailureKind) -> bool {
        let now = self.clock.now();
        let window = minutes(self.config.failure_window_minutes);
        let blacklisted = {
            let mut state = self.lock();
            let Some(idx) = state.index_of(proxy_id) else {
                return false;
            };
            let proxy = &mut state.proxies[idx];
            proxy.failure_count += 1;
            proxy.last_failure_kind = Some(kind);

            if proxy.blacklisted && !proxy.is_blacklisted(now) {
                proxy.blacklisted = false;
                proxy.blacklist_until = None;
            }

            let window_open = proxy.window_started.is_some_and(|start| now - start < window);
            if !window_open {
                proxy.window_started = Some(now);
                proxy.window_failures = 0;
            }
            proxy.window_failures += 1;

            if !proxy.blacklisted && proxy.window_failures >= self.config.failure_threshold.max(1) {
                proxy.blacklisted = true;
                proxy.blacklist_until = Some(
                    now.checked_add_signed(minutes(self.config.blacklist_minutes))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                );
                proxy.window_failures = 0;
                proxy.window_started = None;
                log::warn!(
                    "proxy {proxy_id} blacklisted for {}m after repeated {kind} failures",
                    self.config.blacklist_minutes
                );
                true
            } else {
                false
            }
        };
        self.persist();
        blacklisted
    }

    pub fn health_report(&self) -> ProxyHealthReport {
        let now = self.clock.now();
        let state = self.lock();
        let mut report = ProxyHealthReport {
            total_proxies: state.proxies.len(),
            ..Default::default()
        };
        for proxy in &state.proxies {
            let healthy = proxy.is_healthy(now, &self.config);
            if healthy {
                report.healthy_proxies += 1;
            }
            if proxy.is_blacklisted(now) {
                report.blacklisted_proxies += 1;
            }
            match &proxy.assigned_pool {
                Some(pool) => {
                    let group = report.groups.entry(pool.clone()).or_default();
                    group.total += 1;
                    if healthy {
                        group.healthy += 1;
                    }
                }
                None => report.unassigned_proxies += 1,
            }
        }
        report
    }

    /// Writes the current state through the repository, if one is attached.
    /// Persistence is best effort; failures are logged.
    pub fn persist(&self) {
        let Some(repository) = &self.repository else {
            return;
        };
        let snapshot = self.proxies();
        if let Err(err) = repository.save(&snapshot) {
            log::error!("failed to persist proxy pool: {err}");
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn minutes(value: u64) -> chrono::Duration {
    chrono_duration(std::time::Duration::from_secs(value.saturating_mul(60)))
}
