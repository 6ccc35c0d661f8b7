//! Per-domain request budgets.
//!
//! Each domain is assigned a named tier (A strictest .. D laxest). A tier fixes
//! the bucket capacity and the window after which a spent token returns to the
//! bucket. Tokens return one by one, so no rolling window of that length ever
//! sees more grants than the capacity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

use crate::modules::clock::{SharedClock, chrono_duration, std_duration};

/// Named request-volume tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RateTier {
    A,
    B,
    C,
    D,
}

impl RateTier {
    pub const ALL: [RateTier; 4] = [RateTier::A, RateTier::B, RateTier::C, RateTier::D];
}

impl fmt::Display for RateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RateTier::A => "A",
            RateTier::B => "B",
            RateTier::C => "C",
            RateTier::D => "D",
        };
        f.write_str(label)
    }
}

impl FromStr for RateTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(RateTier::A),
            "B" => Ok(RateTier::B),
            "C" => Ok(RateTier::C),
            "D" => Ok(RateTier::D),
            other => Err(format!("unknown rate tier '{other}'")),
        }
    }
}

/// Capacity and refill window of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub capacity: u32,
    pub window_secs: u64,
}

impl TierLimits {
    pub const fn per_hour(capacity: u32) -> Self {
        Self {
            capacity,
            window_secs: 3600,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tiers: HashMap<RateTier, TierLimits>,
    pub default_tier: RateTier,
    /// Upper bound between refill checks while a caller waits.
    pub poll_interval_ms: u64,
    /// How long `acquire` blocks by default when waiting is requested.
    pub max_wait_secs: u64,
    /// Whether the coordinator waits for a token or refuses immediately.
    pub wait_for_token: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let tiers = HashMap::from([
            (RateTier::A, TierLimits::per_hour(10)),
            (RateTier::B, TierLimits::per_hour(30)),
            (RateTier::C, TierLimits::per_hour(60)),
            (RateTier::D, TierLimits::per_hour(100)),
        ]);
        Self {
            tiers,
            default_tier: RateTier::C,
            poll_interval_ms: 1_000,
            max_wait_secs: 30,
            wait_for_token: true,
        }
    }
}

impl RateLimitConfig {
    pub fn limits(&self, tier: RateTier) -> TierLimits {
        // Validation guarantees every tier is present; a hole degrades to the
        // strictest possible budget.
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or(TierLimits::per_hour(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

#[derive(Debug)]
struct DomainBucket {
    tier: RateTier,
    grants: VecDeque<DateTime<Utc>>,
}

impl DomainBucket {
    fn new(tier: RateTier) -> Self {
        Self {
            tier,
            grants: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(front) = self.grants.front().copied() {
            if front + window <= now {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-domain token bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    buckets: Mutex<HashMap<String, DomainBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Assigns a tier to a domain. Re-assigning the same tier is a no-op and
    /// changing tiers keeps the tokens already spent.
    pub fn set_domain_tier(&self, domain: &str, tier: RateTier) {
        let mut buckets = self.lock();
        let bucket = buckets
            .entry(normalize(domain))
            .or_insert_with(|| DomainBucket::new(tier));
        if bucket.tier != tier {
            log::debug!("rate tier for {domain}: {} -> {tier}", bucket.tier);
            bucket.tier = tier;
        }
    }

    pub fn tier_for(&self, domain: &str) -> RateTier {
        self.lock()
            .get(&normalize(domain))
            .map(|bucket| bucket.tier)
            .unwrap_or(self.config.default_tier)
    }

    /// Tokens currently available to `domain`.
    pub fn available(&self, domain: &str) -> u32 {
        let now = self.clock.now();
        let mut buckets = self.lock();
        let bucket = buckets
            .entry(normalize(domain))
            .or_insert_with(|| DomainBucket::new(self.config.default_tier));
        let limits = self.config.limits(bucket.tier);
        bucket.expire(now, chrono_duration(limits.window()));
        limits.capacity.saturating_sub(bucket.grants.len() as u32)
    }

    /// Takes one token without waiting. On exhaustion returns the time until
    /// the next token returns.
    pub fn try_acquire(&self, domain: &str) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut buckets = self.lock();
        let bucket = buckets
            .entry(normalize(domain))
            .or_insert_with(|| DomainBucket::new(self.config.default_tier));
        let limits = self.config.limits(bucket.tier);
        let window = chrono_duration(limits.window());
        bucket.expire(now, window);

        if (bucket.grants.len() as u32) < limits.capacity {
            bucket.grants.push_back(now);
            return Ok(());
        }

        let retry_in = bucket
            .grants
            .front()
            .map(|oldest| std_duration(*oldest + window - now))
            .unwrap_or_else(|| limits.window());
        Err(retry_in)
    }

    /// Takes one token. When the bucket is empty and `wait` is set, polls for a
    /// refill for up to `max_wait`; otherwise returns `false` immediately.
    pub async fn acquire(&self, domain: &str, wait: bool, max_wait: Duration) -> bool {
        let mut waited = Duration::ZERO;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            let retry_in = match self.try_acquire(domain) {
                Ok(()) => return true,
                Err(retry_in) => retry_in,
            };

            if !wait || waited >= max_wait {
                log::debug!("rate limit exhausted for {domain} (next token in {retry_in:?})");
                return false;
            }

            let step = retry_in.min(poll).min(max_wait - waited).max(Duration::from_millis(1));
            sleep(step).await;
            waited += step;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DomainBucket>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}
