//! Domain circuit breaker.
//!
//! A domain enters quarantine after a detection event and leaves it either when
//! the entry expires (evaluated lazily on read) or when an operator releases
//! it. The retry attempt counter survives expiry so repeated detections back
//! off exponentially; only a manual release resets it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::modules::clock::SharedClock;

// Roughly a century; longer requests are treated as indefinite.
const MAX_DURATION_MINUTES: u64 = 100 * 365 * 24 * 60;

/// Backoff policy applied by the coordinator when quarantining a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    pub base_minutes: u64,
    pub max_exponent: u32,
    pub max_minutes: u64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            base_minutes: 30,
            max_exponent: 4,
            max_minutes: 24 * 60,
        }
    }
}

impl QuarantineConfig {
    /// `base * 2^min(attempt, max_exponent)`, capped at `max_minutes`.
    pub fn backoff_minutes(&self, attempt: u32) -> u64 {
        let exponent = attempt.min(self.max_exponent).min(32);
        self.base_minutes
            .saturating_mul(1u64 << exponent)
            .min(self.max_minutes)
    }
}

/// Operator-facing view of one quarantined domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub domain: String,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_attempts: u32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl QuarantineEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineStats {
    pub total_quarantined: usize,
    pub by_reason: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct DomainRecord {
    entry: Option<QuarantineEntry>,
    retry_attempt: u32,
}

/// Tracks suspended domains.
#[derive(Debug)]
pub struct DomainQuarantine {
    clock: SharedClock,
    records: RwLock<HashMap<String, DomainRecord>>,
}

impl DomainQuarantine {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Returns whether `domain` is currently suspended, evicting an expired
    /// entry on the way.
    pub fn is_quarantined(&self, domain: &str) -> bool {
        let key = normalize(domain);
        let now = self.clock.now();

        {
            let records = self.read();
            match records.get(&key).and_then(|record| record.entry.as_ref()) {
                None => return false,
                Some(entry) if !entry.is_expired(now) => return true,
                Some(_) => {}
            }
        }

        let mut records = self.write();
        if let Some(record) = records.get_mut(&key)
            && record.entry.as_ref().is_some_and(|entry| entry.is_expired(now))
        {
            log::info!("quarantine expired for {key}");
            record.entry = None;
        }
        false
    }

    /// Quarantines `domain` for `duration_minutes` (`None` keeps it suspended
    /// until released), bumping the retry attempt counter.
    pub fn quarantine_domain(
        &self,
        domain: &str,
        reason: &str,
        duration_minutes: Option<u64>,
    ) -> QuarantineEntry {
        self.quarantine_with_metadata(domain, reason, duration_minutes, HashMap::new())
    }

    pub fn quarantine_with_metadata(
        &self,
        domain: &str,
        reason: &str,
        duration_minutes: Option<u64>,
        metadata: HashMap<String, Value>,
    ) -> QuarantineEntry {
        let key = normalize(domain);
        let now = self.clock.now();
        let mut records = self.write();
        let record = records.entry(key.clone()).or_default();
        record.retry_attempt = record.retry_attempt.saturating_add(1);

        let expires_at = duration_minutes.and_then(|minutes| {
            let span = chrono::Duration::minutes(minutes.min(MAX_DURATION_MINUTES) as i64);
            now.checked_add_signed(span)
        });
        let entry = QuarantineEntry {
            domain: key.clone(),
            reason: reason.to_string(),
            quarantined_at: now,
            expires_at,
            retry_attempts: record.retry_attempt,
            metadata,
        };
        record.entry = Some(entry.clone());

        log::warn!(
            "quarantined {key} ({reason}) attempt {} until {}",
            record.retry_attempt,
            expires_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "released".into())
        );
        entry
    }

    /// Clears the entry and resets the retry counter. Returns whether the
    /// domain was known.
    pub fn release_quarantine(&self, domain: &str) -> bool {
        let key = normalize(domain);
        let released = self.write().remove(&key).is_some();
        if released {
            log::info!("quarantine released for {key}");
        }
        released
    }

    pub fn get_retry_attempt(&self, domain: &str) -> u32 {
        self.read()
            .get(&normalize(domain))
            .map(|record| record.retry_attempt)
            .unwrap_or(0)
    }

    pub fn get_entry(&self, domain: &str) -> Option<QuarantineEntry> {
        let now = self.clock.now();
        self.read()
            .get(&normalize(domain))
            .and_then(|record| record.entry.clone())
            .filter(|entry| !entry.is_expired(now))
    }

    /// Active entries, oldest first.
    pub fn list_entries(&self) -> Vec<QuarantineEntry> {
        let now = self.clock.now();
        let mut entries: Vec<_> = self
            .read()
            .values()
            .filter_map(|record| record.entry.clone())
            .filter(|entry| !entry.is_expired(now))
            .collect();
        entries.sort_by_key(|entry| entry.quarantined_at);
        entries
    }

    pub fn get_stats(&self) -> QuarantineStats {
        let mut stats = QuarantineStats::default();
        for entry in self.list_entries() {
            stats.total_quarantined += 1;
            *stats.by_reason.entry(entry.reason).or_default() += 1;
        }
        stats
    }

    /// Drops expired entries eagerly. Returns how many were evicted.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;
        for record in self.write().values_mut() {
            if record.entry.as_ref().is_some_and(|entry| entry.is_expired(now)) {
                record.entry = None;
                evicted += 1;
            }
        }
        evicted
    }

    pub fn clear_all(&self) {
        self.write().clear();
        log::info!("all quarantines cleared");
    }

    /// Entries suitable for persisting across restarts.
    pub fn snapshot(&self) -> Vec<QuarantineEntry> {
        self.list_entries()
    }

    /// Loads previously persisted entries, skipping those already expired.
    /// Returns the number restored.
    pub fn restore(&self, entries: Vec<QuarantineEntry>) -> usize {
        let now = self.clock.now();
        let mut records = self.write();
        let mut restored = 0;
        for entry in entries.into_iter().filter(|entry| !entry.is_expired(now)) {
            let key = normalize(&entry.domain);
            let record = records.entry(key).or_default();
            record.retry_attempt = record.retry_attempt.max(entry.retry_attempts);
            record.entry = Some(entry);
            restored += 1;
        }
        restored
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(path, json)
    }

    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> io::Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(path)?;
        let entries: Vec<QuarantineEntry> = serde_json::from_str(&raw)?;
        Ok(self.restore(entries))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DomainRecord>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DomainRecord>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;
    use std::sync::Arc;

    fn quarantine() -> (ManualClock, DomainQuarantine) {
        let clock = ManualClock::new();
        let quarantine = DomainQuarantine::new(Arc::new(clock.clone()));
        (clock, quarantine)
    }

    #[test]
    fn expires_after_duration() {
        let (clock, quarantine) = quarantine();
        quarantine.quarantine_domain("www.google.com", "CAPTCHA_DETECTED", Some(60));
        assert!(quarantine.is_quarantined("www.google.com"));

        clock.advance_minutes(59);
        assert!(quarantine.is_quarantined("www.google.com"));

        clock.advance_minutes(2);
        assert!(!quarantine.is_quarantined("www.google.com"));
        assert!(quarantine.get_entry("www.google.com").is_none());
    }

    #[test]
    fn retry_attempt_grows_until_release() {
        let (clock, quarantine) = quarantine();
        for expected in 1..=4 {
            quarantine.quarantine_domain("bing.com", "CAPTCHA_DETECTED", Some(5));
            assert_eq!(quarantine.get_retry_attempt("bing.com"), expected);
            clock.advance_minutes(10);
            assert!(!quarantine.is_quarantined("bing.com"));
        }

        assert!(quarantine.release_quarantine("bing.com"));
        assert_eq!(quarantine.get_retry_attempt("bing.com"), 0);
    }

    #[test]
    fn indefinite_quarantine_needs_release() {
        let (clock, quarantine) = quarantine();
        quarantine.quarantine_domain("example.com", "BLOCKED", None);
        clock.advance_minutes(10_000);
        assert!(quarantine.is_quarantined("example.com"));
        quarantine.release_quarantine("example.com");
        assert!(!quarantine.is_quarantined("example.com"));
    }

    #[test]
    fn stats_group_by_reason() {
        let (_clock, quarantine) = quarantine();
        quarantine.quarantine_domain("a.com", "CAPTCHA_DETECTED", Some(30));
        quarantine.quarantine_domain("b.com", "CAPTCHA_DETECTED", Some(30));
        quarantine.quarantine_domain("c.com", "RATE_LIMITED", Some(30));

        let stats = quarantine.get_stats();
        assert_eq!(stats.total_quarantined, 3);
        assert_eq!(stats.by_reason.get("CAPTCHA_DETECTED"), Some(&2));
        assert_eq!(stats.by_reason.get("RATE_LIMITED"), Some(&1));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_quarantined"], 3);
    }

    #[test]
    fn backoff_policy_is_capped() {
        let config = QuarantineConfig {
            base_minutes: 30,
            max_exponent: 4,
            max_minutes: 300,
        };
        assert_eq!(config.backoff_minutes(0), 30);
        assert_eq!(config.backoff_minutes(1), 60);
        assert_eq!(config.backoff_minutes(3), 240);
        assert_eq!(config.backoff_minutes(4), 300);
        assert_eq!(config.backoff_minutes(40), 300);
    }

    #[test]
    fn snapshot_round_trip_skips_expired() {
        let (clock, quarantine) = quarantine();
        quarantine.quarantine_domain("short.com", "CAPTCHA_DETECTED", Some(1));
        quarantine.quarantine_domain("long.com", "CAPTCHA_DETECTED", Some(120));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarantine.json");
        quarantine.save_snapshot(&path).unwrap();

        clock.advance_minutes(5);
        let restored = DomainQuarantine::new(Arc::new(clock.clone()));
        assert_eq!(restored.load_snapshot(&path).unwrap(), 1);
        assert!(restored.is_quarantined("long.com"));
        assert!(!restored.is_quarantined("short.com"));
        assert_eq!(restored.get_retry_attempt("long.com"), 1);
    }

    #[test]
    fn cleanup_evicts_expired_entries() {
        let (clock, quarantine) = quarantine();
        quarantine.quarantine_domain("a.com", "CAPTCHA_DETECTED", Some(1));
        quarantine.quarantine_domain("b.com", "CAPTCHA_DETECTED", Some(60));
        clock.advance_minutes(2);
        assert_eq!(quarantine.cleanup_expired(), 1);
        assert_eq!(quarantine.list_entries().len(), 1);
    }
}
