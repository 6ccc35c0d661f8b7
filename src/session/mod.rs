//! Browser sessions driven by the coordinator.
//!
//! A session is the expensive, stateful handle (cookies, identity, egress
//! proxy) used to talk to one target. Two variants exist: the cheap
//! [`SessionVariant::Standard`] and the heavier [`SessionVariant::Alternate`]
//! used once a target has detected automation. The coordinator never cares
//! which one it holds; it dispatches every action through
//! [`run_session_action`].

mod identity;
mod isolation;
mod scripted;
mod standard;

pub use self::identity::{BrowserFamily, IdentityGenerator, SessionIdentity};
pub use self::isolation::{ActionOutcome, SessionFuture, run_session_action};
pub use self::scripted::ScriptedSession;
pub use self::standard::{HttpSession, LoadedPage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::detection::{self, Detection};
use crate::modules::proxy::Proxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionVariant {
    Standard,
    Alternate,
}

impl fmt::Display for SessionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionVariant::Standard => f.write_str("standard"),
            SessionVariant::Alternate => f.write_str("alternate"),
        }
    }
}

/// Where a session's actions have to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// On the caller's runtime.
    Inline,
    /// On a dedicated thread with its own runtime; may be hard-timed-out.
    Isolated,
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("operation not supported by this session: {0}")]
    Unsupported(&'static str),
    #[error("session action timed out after {0:?}")]
    Timeout(Duration),
    #[error("session is closed")]
    Closed,
    #[error("session crashed: {0}")]
    Crashed(String),
    #[error("blocked by target: {0}")]
    Blocked(Detection),
    #[error("{0}")]
    Other(String),
}

impl SessionError {
    /// Detection signal carried by this error, if any. Errors raised by
    /// caller actions are classified by their message text.
    pub fn detection(&self) -> Option<Detection> {
        match self {
            SessionError::Blocked(detection) => Some(detection.clone()),
            SessionError::Navigation { message, .. } => detection::detect_text(message),
            SessionError::Script(message) | SessionError::Other(message) => {
                detection::detect_text(message)
            }
            _ => None,
        }
    }

    pub fn is_detection(&self) -> bool {
        self.detection().is_some()
    }
}

/// Uniform handle over both browser backends.
#[async_trait]
pub trait BrowserSession: Send + Sync + fmt::Debug {
    fn variant(&self) -> SessionVariant;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    fn identity(&self) -> &SessionIdentity;

    fn proxy(&self) -> Option<&Proxy>;

    /// Loads `url`. Fails with [`SessionError::Blocked`] when the response
    /// carries a detection signature.
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// Body of the current page.
    async fn content(&self) -> Result<String, SessionError>;

    /// Evaluates a script against the current page and returns its result.
    async fn execute(&mut self, script: &str) -> Result<String, SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

/// What the coordinator needs from a new session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target: String,
    pub variant: SessionVariant,
    pub fresh_identity: bool,
    pub proxy: Option<Proxy>,
}

#[async_trait]
pub trait SessionFactory: Send + Sync + fmt::Debug {
    async fn create(&self, request: &SessionRequest) -> Result<Box<dyn BrowserSession>, SessionError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub request_timeout_secs: u64,
    /// Hard limit for actions on isolated sessions.
    pub isolated_timeout_secs: u64,
    pub max_redirects: usize,
    /// Loop iteration cap for scripts evaluated by alternate sessions.
    pub script_loop_limit: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            isolated_timeout_secs: 90,
            max_redirects: 10,
            script_loop_limit: 1_000_000,
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn isolated_timeout(&self) -> Duration {
        Duration::from_secs(self.isolated_timeout_secs)
    }
}

/// Builds [`HttpSession`]s for the standard variant and [`ScriptedSession`]s
/// for the alternate one.
#[derive(Debug, Default)]
pub struct DefaultSessionFactory {
    config: SessionConfig,
    identities: IdentityGenerator,
}

impl DefaultSessionFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            identities: IdentityGenerator::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[async_trait]
impl SessionFactory for DefaultSessionFactory {
    async fn create(&self, request: &SessionRequest) -> Result<Box<dyn BrowserSession>, SessionError> {
        let browser = match request.variant {
            SessionVariant::Standard => BrowserFamily::Chrome,
            SessionVariant::Alternate => BrowserFamily::Firefox,
        };
        let identity = if request.fresh_identity {
            self.identities.fresh_for(&request.target, browser)
        } else {
            self.identities.identity_for(&request.target, browser)
        };
        log::debug!(
            "creating {} session for {} (identity {}, proxy {})",
            request.variant,
            request.target,
            identity.id,
            request.proxy.as_ref().map(Proxy::id).unwrap_or_else(|| "direct".into())
        );

        match request.variant {
            SessionVariant::Standard => Ok(Box::new(HttpSession::new(
                identity,
                request.proxy.clone(),
                &self.config,
            )?)),
            SessionVariant::Alternate => Ok(Box::new(ScriptedSession::new(
                identity,
                request.proxy.clone(),
                &self.config,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionKind;

    #[test]
    fn detection_is_read_from_error_text() {
        let err = SessionError::Other("CAPTCHA detected after search".into());
        assert_eq!(err.detection().unwrap().kind, DetectionKind::Captcha);
        assert!(!SessionError::Timeout(Duration::from_secs(1)).is_detection());
        assert!(!SessionError::Transport("connection refused".into()).is_detection());
    }

    #[tokio::test]
    async fn default_factory_maps_variants() {
        let factory = DefaultSessionFactory::default();
        let standard = factory
            .create(&SessionRequest {
                target: "example.com".into(),
                variant: SessionVariant::Standard,
                fresh_identity: false,
                proxy: None,
            })
            .await
            .unwrap();
        assert_eq!(standard.variant(), SessionVariant::Standard);
        assert_eq!(standard.execution_mode(), ExecutionMode::Inline);
        assert!(standard.identity().user_agent.contains("Chrome"));

        let alternate = factory
            .create(&SessionRequest {
                target: "example.com".into(),
                variant: SessionVariant::Alternate,
                fresh_identity: true,
                proxy: Some(Proxy::new("127.0.0.1", 3128)),
            })
            .await
            .unwrap();
        assert_eq!(alternate.variant(), SessionVariant::Alternate);
        assert_eq!(alternate.execution_mode(), ExecutionMode::Isolated);
        assert_eq!(alternate.proxy().unwrap().id(), "127.0.0.1:3128");
    }
}
