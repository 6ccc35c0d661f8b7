#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scrape_sentinel::{
    BrowserFamily, BrowserSession, CoordinatorConfig, IdentityGenerator, PacingConfig, Proxy,
    RateLimitConfig, SessionError, SessionFactory, SessionIdentity, SessionRequest,
    SessionFuture, SessionVariant, detect_page,
};

pub const CAPTCHA_PAGE: &str = "<html><body><div class=\"g-recaptcha\"></div></body></html>";

/// Config with pacing off and non-blocking rate limiting.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .with_pacing(PacingConfig::disabled())
        .with_rate_limit(RateLimitConfig {
            wait_for_token: false,
            ..RateLimitConfig::default()
        })
        .build()
        .unwrap()
}

/// What the next navigation returns.
#[derive(Debug, Clone)]
pub enum Scripted {
    Page(String),
    Captcha,
    Fail(SessionError),
}

#[derive(Debug, Default)]
pub struct Probe {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub navigations: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub requests: Mutex<Vec<SessionRequest>>,
    pub visited: Mutex<Vec<String>>,
}

impl Probe {
    pub fn requests(&self) -> Vec<SessionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }
}

/// Session factory whose sessions replay a shared script of responses.
#[derive(Debug, Clone)]
pub struct MockFactory {
    pub probe: Arc<Probe>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    delay: Duration,
    identities: Arc<IdentityGenerator>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(Probe::default()),
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::ZERO,
            identities: Arc::new(IdentityGenerator::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self, request: &SessionRequest) -> Result<Box<dyn BrowserSession>, SessionError> {
        self.probe.created.fetch_add(1, Ordering::SeqCst);
        self.probe.requests.lock().unwrap().push(request.clone());
        let browser = match request.variant {
            SessionVariant::Standard => BrowserFamily::Chrome,
            SessionVariant::Alternate => BrowserFamily::Firefox,
        };
        let identity = if request.fresh_identity {
            self.identities.fresh_for(&request.target, browser)
        } else {
            self.identities.identity_for(&request.target, browser)
        };
        Ok(Box::new(MockSession {
            variant: request.variant,
            identity,
            proxy: request.proxy.clone(),
            body: None,
            factory: self.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct MockSession {
    variant: SessionVariant,
    identity: SessionIdentity,
    proxy: Option<Proxy>,
    body: Option<String>,
    factory: MockFactory,
}

#[async_trait]
impl BrowserSession for MockSession {
    fn variant(&self) -> SessionVariant {
        self.variant
    }

    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let probe = &self.factory.probe;
        probe.navigations.fetch_add(1, Ordering::SeqCst);
        probe.visited.lock().unwrap().push(url.to_string());
        let active = probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.factory.delay.is_zero() {
            tokio::time::sleep(self.factory.delay).await;
        }
        probe.active.fetch_sub(1, Ordering::SeqCst);

        let step = self.factory.script.lock().unwrap().pop_front();
        match step.unwrap_or_else(|| Scripted::Page(format!("<html>{url}</html>"))) {
            Scripted::Page(body) => {
                self.body = Some(body);
                Ok(())
            }
            Scripted::Captcha => Err(SessionError::Blocked(
                detect_page(200, CAPTCHA_PAGE).expect("captcha page is detected"),
            )),
            Scripted::Fail(err) => Err(err),
        }
    }

    async fn content(&self) -> Result<String, SessionError> {
        self.body.clone().ok_or(SessionError::Closed)
    }

    async fn execute(&mut self, _script: &str) -> Result<String, SessionError> {
        Err(SessionError::Unsupported("mock sessions do not run scripts"))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.factory.probe.closed.fetch_add(1, Ordering::SeqCst);
        self.body = None;
        Ok(())
    }
}

/// Navigates to `url` and returns the page body.
pub fn visit(
    url: &str,
) -> impl for<'a> FnOnce(&'a mut dyn BrowserSession) -> SessionFuture<'a, String> + Send + use<> {
    let url = url.to_string();
    move |session| {
        Box::pin(async move {
            session.navigate(&url).await?;
            session.content().await
        })
    }
}
