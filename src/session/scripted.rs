//! Alternate session: a different client fingerprint plus an embedded
//! JavaScript engine for evaluating scripts against the loaded page.
//!
//! Script evaluation is CPU-bound and the engine context is not `Send`, so
//! this session declares [`ExecutionMode::Isolated`] and each evaluation builds
//! and drops its own context.

use async_trait::async_trait;
use boa_engine::{Context, Source};
use url::Url;

use super::standard::PageClient;
use super::{
    BrowserSession, ExecutionMode, SessionConfig, SessionError, SessionIdentity, SessionVariant,
};
use crate::modules::proxy::Proxy;

#[derive(Debug)]
pub struct ScriptedSession {
    inner: PageClient,
    identity: SessionIdentity,
    proxy: Option<Proxy>,
    loop_limit: u64,
}

impl ScriptedSession {
    pub fn new(
        identity: SessionIdentity,
        proxy: Option<Proxy>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let inner = PageClient::build(&identity, proxy.as_ref(), config, false)?;
        Ok(Self {
            inner,
            identity,
            proxy,
            loop_limit: config.script_loop_limit,
        })
    }

    fn build_prelude(&self, page_url: &str, html: &str) -> Result<String, SessionError> {
        let parsed = Url::parse(page_url).ok();
        let host = parsed
            .as_ref()
            .and_then(|url| url.host_str())
            .unwrap_or("localhost");
        let protocol = parsed
            .as_ref()
            .map(|url| format!("{}:", url.scheme()))
            .unwrap_or_else(|| "https:".into());

        let quote = |value: &str| {
            serde_json::to_string(value).map_err(|err| SessionError::Script(err.to_string()))
        };
        let (width, height) = self.identity.screen_resolution;

        Ok(format!(
            r#"
var location = {{
    href: {href},
    hostname: {host},
    protocol: {protocol},
    port: ""
}};
var navigator = {{
    userAgent: {user_agent},
    language: {language},
    languages: [{language}],
    platform: {platform},
    webdriver: false
}};
var screen = {{ width: {width}, height: {height} }};
var document = {{
    location: location,
    documentElement: {{ outerHTML: {html} }},
    title: (/<title[^>]*>([\s\S]*?)<\/title>/i.exec({html}) || [null, ""])[1].trim(),
    body: {{ innerHTML: {html} }},
    cookie: ""
}};
var window = {{
    location: location,
    navigator: navigator,
    document: document,
    screen: screen
}};
function setTimeout(cb, delay) {{ return cb(); }}
function clearTimeout() {{}}
"#,
            href = quote(page_url)?,
            host = quote(host)?,
            protocol = quote(&protocol)?,
            user_agent = quote(&self.identity.user_agent)?,
            language = quote(self.identity.language())?,
            platform = quote(&self.identity.platform)?,
            html = quote(html)?,
        ))
    }

    fn evaluate(&self, prelude: &str, script: &str) -> Result<String, SessionError> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(self.loop_limit);

        context
            .eval(Source::from_bytes(prelude))
            .map_err(|err| SessionError::Script(format!("prelude failed: {err}")))?;

        let result = context
            .eval(Source::from_bytes(script))
            .map_err(|err| SessionError::Script(err.to_string()))?;

        result
            .to_string(&mut context)
            .map_err(|err| SessionError::Script(err.to_string()))?
            .to_std_string()
            .map_err(|_| SessionError::Script("unable to convert script result".into()))
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    fn variant(&self) -> SessionVariant {
        SessionVariant::Alternate
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Isolated
    }

    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let page = self.inner.fetch(url).await?;
        log::debug!("loaded {} ({}) via alternate engine", page.url, page.status);
        Ok(())
    }

    async fn content(&self) -> Result<String, SessionError> {
        Ok(self.inner.page()?.body.clone())
    }

    async fn execute(&mut self, script: &str) -> Result<String, SessionError> {
        let (url, body) = match self.inner.page() {
            Ok(page) => (page.url.clone(), page.body.clone()),
            Err(SessionError::Closed) => return Err(SessionError::Closed),
            Err(_) => ("about:blank".to_string(), String::new()),
        };
        let prelude = self.build_prelude(&url, &body)?;
        self.evaluate(&prelude, script)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.inner.close();
        Ok(())
    }
}
