//! Standard session: a cookie-keeping reqwest client presenting a Chrome-like
//! identity.

use async_trait::async_trait;
use reqwest::{Client, redirect::Policy};
use std::time::Duration;

use super::{BrowserSession, SessionConfig, SessionError, SessionIdentity, SessionVariant};
use crate::detection;
use crate::modules::proxy::Proxy;

/// Last document loaded by a session.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Fetching core shared by both session variants.
#[derive(Debug)]
pub(crate) struct PageClient {
    client: Client,
    timeout: Duration,
    page: Option<LoadedPage>,
    closed: bool,
}

impl PageClient {
    pub(crate) fn build(
        identity: &SessionIdentity,
        proxy: Option<&Proxy>,
        config: &SessionConfig,
        pooled: bool,
    ) -> Result<Self, SessionError> {
        let mut builder = Client::builder()
            .cookie_store(true)
            .default_headers(identity.headers())
            .timeout(config.request_timeout())
            .redirect(Policy::limited(config.max_redirects));

        if !pooled {
            // Connections must not outlive the runtime that opened them.
            builder = builder.pool_max_idle_per_host(0);
        }

        if let Some(proxy) = proxy {
            let upstream = reqwest::Proxy::all(proxy.url())
                .map_err(|err| SessionError::Transport(format!("invalid proxy {}: {err}", proxy.id())))?;
            builder = builder.proxy(upstream);
        }

        let client = builder
            .build()
            .map_err(|err| SessionError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            timeout: config.request_timeout(),
            page: None,
            closed: false,
        })
    }

    pub(crate) async fn fetch(&mut self, url: &str) -> Result<&LoadedPage, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }

        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                SessionError::Timeout(self.timeout)
            } else {
                SessionError::Navigation {
                    url: url.to_string(),
                    message: err.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|err| SessionError::Navigation {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        let detected = detection::detect_url(&final_url).or_else(|| detection::detect_page(status, &body));
        self.page = Some(LoadedPage {
            url: final_url,
            status,
            body,
        });

        if let Some(detection) = detected {
            log::warn!("detection signature on {url}: {detection}");
            return Err(SessionError::Blocked(detection));
        }
        self.page.as_ref().ok_or(SessionError::Closed)
    }

    pub(crate) fn page(&self) -> Result<&LoadedPage, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.page
            .as_ref()
            .ok_or_else(|| SessionError::Other("no page loaded".into()))
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.page = None;
    }
}

/// Session used at the standard escalation tier.
#[derive(Debug)]
pub struct HttpSession {
    inner: PageClient,
    identity: SessionIdentity,
    proxy: Option<Proxy>,
}

impl HttpSession {
    pub fn new(
        identity: SessionIdentity,
        proxy: Option<Proxy>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let inner = PageClient::build(&identity, proxy.as_ref(), config, true)?;
        Ok(Self {
            inner,
            identity,
            proxy,
        })
    }

    pub fn current_page(&self) -> Option<&LoadedPage> {
        self.inner.page().ok()
    }
}

#[async_trait]
impl BrowserSession for HttpSession {
    fn variant(&self) -> SessionVariant {
        SessionVariant::Standard
    }

    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let page = self.inner.fetch(url).await?;
        log::debug!("loaded {} ({})", page.url, page.status);
        Ok(())
    }

    async fn content(&self) -> Result<String, SessionError> {
        Ok(self.inner.page()?.body.clone())
    }

    async fn execute(&mut self, _script: &str) -> Result<String, SessionError> {
        Err(SessionError::Unsupported("script execution requires the alternate engine"))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.inner.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BrowserFamily, IdentityGenerator};

    fn session() -> HttpSession {
        let identity = IdentityGenerator::new().identity_for("example.com", BrowserFamily::Chrome);
        HttpSession::new(identity, None, &SessionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn content_before_navigation_fails() {
        let session = session();
        assert!(session.content().await.is_err());
        assert!(session.current_page().is_none());
    }

    #[tokio::test]
    async fn closed_session_refuses_work() {
        let mut session = session();
        session.close().await.unwrap();
        assert!(matches!(
            session.navigate("http://127.0.0.1:9/").await,
            Err(SessionError::Closed)
        ));
        assert!(matches!(
            session.execute("1 + 1").await,
            Err(SessionError::Unsupported(_))
        ));
    }

    #[test]
    fn invalid_proxy_is_a_transport_error() {
        let identity = IdentityGenerator::new().identity_for("example.com", BrowserFamily::Chrome);
        let proxy = Proxy::new("bad host", 0);
        let err = HttpSession::new(identity, Some(proxy), &SessionConfig::default()).unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }
}
