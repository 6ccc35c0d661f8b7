use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::modules::clock::{SharedClock, chrono_duration};

#[derive(Debug, Clone)]
struct CachedResult {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Completed job results keyed by normalized `(query, location)`.
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    clock: SharedClock,
    entries: Mutex<HashMap<String, CachedResult>>,
}

impl ResultCache {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached value, unless it has expired.
    pub fn get(&self, query: &str, location: Option<&str>) -> Option<String> {
        let key = cache_key(query, location);
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(cached) if cached.expires_at > now => Some(cached.value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, query: &str, location: Option<&str>, value: impl Into<String>) {
        let expires_at = self.clock.now() + chrono_duration(self.ttl);
        self.lock().insert(
            cache_key(query, location),
            CachedResult {
                value: value.into(),
                expires_at,
            },
        );
    }

    pub fn invalidate(&self, query: &str, location: Option<&str>) -> bool {
        self.lock().remove(&cache_key(query, location)).is_some()
    }

    /// Drops expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, cached| cached.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedResult>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn normalize_part(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Key shared by the cache and in-flight job coalescing.
pub(crate) fn cache_key(query: &str, location: Option<&str>) -> String {
    format!(
        "{}|{}",
        normalize_part(query),
        normalize_part(location.unwrap_or_default())
    )
}
