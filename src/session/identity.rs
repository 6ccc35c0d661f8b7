//! Browser identities presented by sessions.
//!
//! An identity bundles the observable characteristics a target can
//! fingerprint: user agent, language, platform, screen and timezone. Identities
//! are kept consistent per target until a fresh one is explicitly requested.

use chrono::{DateTime, Utc};
use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BrowserFamily {
    Chrome,
    Firefox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionIdentity {
    pub id: String,
    pub browser: BrowserFamily,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub screen_resolution: (u16, u16),
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

impl SessionIdentity {
    /// Default request headers matching this identity.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers
    }

    /// Primary language tag, e.g. `en-US`.
    pub fn language(&self) -> &str {
        self.accept_language
            .split(',')
            .next()
            .unwrap_or("en-US")
    }
}

struct IdentityTemplate {
    user_agents: &'static [&'static str],
    platform: &'static str,
    accept_languages: &'static [&'static str],
    screen_resolutions: &'static [(u16, u16)],
    timezones: &'static [&'static str],
}

const CHROME: IdentityTemplate = IdentityTemplate {
    user_agents: &[
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ],
    platform: "Win32",
    accept_languages: &["en-US,en;q=0.9", "en-GB,en;q=0.8"],
    screen_resolutions: &[(1920, 1080), (2560, 1440), (1366, 768)],
    timezones: &["America/New_York", "America/Chicago", "America/Los_Angeles"],
};

const FIREFOX: IdentityTemplate = IdentityTemplate {
    user_agents: &[
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    ],
    platform: "Win64",
    accept_languages: &["en-US,en;q=0.5", "en-CA,en;q=0.7"],
    screen_resolutions: &[(1920, 1080), (1680, 1050), (1440, 900)],
    timezones: &["America/Denver", "America/New_York", "America/Phoenix"],
};

fn template(browser: BrowserFamily) -> &'static IdentityTemplate {
    match browser {
        BrowserFamily::Chrome => &CHROME,
        BrowserFamily::Firefox => &FIREFOX,
    }
}

/// Hands out identities that stay stable per target and browser family.
#[derive(Debug, Default)]
pub struct IdentityGenerator {
    cache: Mutex<HashMap<(String, BrowserFamily), SessionIdentity>>,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity currently bound to `target`, creating one on first use.
    pub fn identity_for(&self, target: &str, browser: BrowserFamily) -> SessionIdentity {
        self.lock()
            .entry((target.to_ascii_lowercase(), browser))
            .or_insert_with(|| random_identity(browser))
            .clone()
    }

    /// Replaces the identity bound to `target` with a newly generated one.
    pub fn fresh_for(&self, target: &str, browser: BrowserFamily) -> SessionIdentity {
        let identity = random_identity(browser);
        self.lock()
            .insert((target.to_ascii_lowercase(), browser), identity.clone());
        log::debug!("rotated {browser:?} identity for {target}: {}", identity.id);
        identity
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, BrowserFamily), SessionIdentity>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn random_identity(browser: BrowserFamily) -> SessionIdentity {
    let template = template(browser);
    let mut rng = rand::thread_rng();
    let seed: u64 = rng.r#gen();

    SessionIdentity {
        id: format!("id-{seed:016x}"),
        browser,
        user_agent: pick(template.user_agents, &mut rng).to_string(),
        accept_language: pick(template.accept_languages, &mut rng).to_string(),
        platform: template.platform.to_string(),
        screen_resolution: template
            .screen_resolutions
            .choose(&mut rng)
            .copied()
            .unwrap_or((1920, 1080)),
        timezone: pick(template.timezones, &mut rng).to_string(),
        created_at: Utc::now(),
    }
}

fn pick<'a, R: Rng>(values: &[&'a str], rng: &mut R) -> &'a str {
    values.choose(rng).copied().unwrap_or_default()
}
