//! Anti-bot detection signatures.
//!
//! Classifies fetched pages and free-form error text as CAPTCHA walls, block
//! pages or throttling responses. Anything matched here is a detection-class
//! event: it escalates the target and quarantines it.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    Captcha,
    UnusualTraffic,
    AccessDenied,
    Throttled,
}

impl DetectionKind {
    /// Quarantine reason recorded for this kind of detection.
    pub fn reason(self) -> &'static str {
        match self {
            DetectionKind::Captcha => "CAPTCHA_DETECTED",
            DetectionKind::UnusualTraffic => "UNUSUAL_TRAFFIC",
            DetectionKind::AccessDenied => "ACCESS_DENIED",
            DetectionKind::Throttled => "THROTTLED",
        }
    }
}

/// A matched detection signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub kind: DetectionKind,
    pub signature: String,
    pub evidence: String,
}

impl Detection {
    fn new(kind: DetectionKind, signature: &str, evidence: &str) -> Self {
        Self {
            kind,
            signature: signature.to_string(),
            evidence: truncate(evidence, 160),
        }
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind.reason(), self.signature)
    }
}

struct TextSignature {
    name: &'static str,
    kind: DetectionKind,
    pattern: Regex,
}

impl TextSignature {
    fn new(name: &'static str, kind: DetectionKind, pattern: &str) -> Self {
        Self {
            name,
            kind,
            pattern: build_regex(pattern),
        }
    }
}

static TEXT_SIGNATURES: Lazy<Vec<TextSignature>> = Lazy::new(|| {
    vec![
        TextSignature::new("recaptcha", DetectionKind::Captcha, r"g-recaptcha|recaptcha/api\.js|grecaptcha"),
        TextSignature::new("hcaptcha", DetectionKind::Captcha, r"h-captcha|hcaptcha\.com/1/api\.js"),
        TextSignature::new("perimeterx", DetectionKind::Captcha, r"px-captcha|_pxCaptcha|press\s*&\s*hold"),
        TextSignature::new(
            "captcha_marker",
            DetectionKind::Captcha,
            r"\bcaptcha[_\s-]*(?:detected|required|challenge)\b|\bsolve\s+the\s+captcha\b",
        ),
        TextSignature::new(
            "unusual_traffic",
            DetectionKind::UnusualTraffic,
            r"unusual traffic from your computer network|our systems have detected unusual traffic",
        ),
        TextSignature::new("google_sorry", DetectionKind::UnusualTraffic, r"/sorry/index|google\.com/sorry"),
        TextSignature::new(
            "robot_check",
            DetectionKind::Captcha,
            r"are you a (?:human|robot)|verify (?:you are|you're) (?:a )?human|not a robot",
        ),
        TextSignature::new(
            "access_denied",
            DetectionKind::AccessDenied,
            r"<title>\s*access denied\s*</title>|you don't have permission to access|request blocked",
        ),
    ]
});

/// DOM markers of CAPTCHA widgets.
const CAPTCHA_SELECTORS: &[(&str, &str)] = &[
    ("recaptcha_widget", "div.g-recaptcha, iframe[src*='recaptcha']"),
    ("hcaptcha_widget", "div.h-captcha, iframe[src*='hcaptcha']"),
    ("perimeterx_widget", "#px-captcha"),
    ("captcha_form", "form#captcha-form, form[action*='sorry']"),
];

/// Scans free text (page bodies, error messages) for detection markers.
pub fn detect_text(text: &str) -> Option<Detection> {
    TEXT_SIGNATURES.iter().find_map(|signature| {
        signature
            .pattern
            .find(text)
            .map(|found| Detection::new(signature.kind, signature.name, found.as_str()))
    })
}

/// Classifies a fetched page from its status code and body.
pub fn detect_page(status: u16, body: &str) -> Option<Detection> {
    if let Some(detection) = detect_text(body).or_else(|| detect_dom(body)) {
        return Some(detection);
    }
    match status {
        429 => Some(Detection::new(DetectionKind::Throttled, "http_429", "429 Too Many Requests")),
        403 => Some(Detection::new(DetectionKind::AccessDenied, "http_403", "403 Forbidden")),
        _ => None,
    }
}

/// Redirects to an interstitial such as Google's `/sorry/` page. Only the
/// host and path are inspected; query strings carry user search terms.
pub fn detect_url(url: &str) -> Option<Detection> {
    let location = match Url::parse(url) {
        Ok(parsed) => format!("{}{}", parsed.host_str().unwrap_or_default(), parsed.path()),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
    .to_ascii_lowercase();
    (location.contains("/sorry/") || location.contains("captcha"))
        .then(|| Detection::new(DetectionKind::UnusualTraffic, "interstitial_url", url))
}

fn detect_dom(body: &str) -> Option<Detection> {
    if !body.contains('<') {
        return None;
    }
    let document = Html::parse_document(body);
    CAPTCHA_SELECTORS.iter().find_map(|(name, css)| {
        let selector = Selector::parse(css).ok()?;
        document
            .select(&selector)
            .next()
            .map(|element| Detection::new(DetectionKind::Captcha, name, &element.html()))
    })
}

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid detection regex `{pattern}`: {err}"))
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_string(),
    }
}
