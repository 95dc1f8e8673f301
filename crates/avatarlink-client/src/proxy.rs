//! Outbound request routing.
//!
//! Calls addressed to the provider's public API are rewritten to the backend's
//! proxy, which injects the real provider credential. Every component that
//! talks HTTP is handed a [`BackendClient`], so the rewrite is applied before
//! any request leaves the process.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use avatarlink_common::helpers::join_url;
use avatarlink_common::{Error, Result};

use crate::config::ClientConfig;

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// A failed HTTP exchange: the status (if a response arrived) and the body text
/// or transport error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    pub status: Option<u16>,
    pub body: String,
}

impl RequestFailure {
    fn transport(err: &reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            body: err.to_string(),
        }
    }
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {status}: {}", self.body),
            None => write!(f, "no response: {}", self.body),
        }
    }
}

pub(crate) fn status_label(status: &Option<u16>) -> String {
    status.map_or_else(|| "no response".to_string(), |s| format!("status {s}"))
}

/// Maps provider API URLs onto the backend proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRoute {
    provider_api_base: String,
    proxy_base: String,
}

impl ProviderRoute {
    pub fn new(provider_api_base: &str, proxy_base: &str) -> Self {
        let mut provider_api_base = provider_api_base.trim().to_string();
        if !provider_api_base.ends_with('/') {
            provider_api_base.push('/');
        }
        Self {
            provider_api_base,
            proxy_base: proxy_base.trim().trim_end_matches('/').to_string(),
        }
    }

    /// Public provider URL for an endpoint such as `streaming.task`.
    pub fn provider_url(&self, endpoint: &str) -> String {
        format!(
            "{}{}",
            self.provider_api_base,
            endpoint.trim_start_matches('/')
        )
    }

    /// Rewrites `{provider_api_base}{subpath}` to `{proxy_base}/{subpath}`.
    /// Other URLs pass through untouched.
    pub fn rewrite<'a>(&self, url: &'a str) -> Cow<'a, str> {
        match url.strip_prefix(self.provider_api_base.as_str()) {
            Some(subpath) => Cow::Owned(format!("{}/{}", self.proxy_base, subpath)),
            None => Cow::Borrowed(url),
        }
    }
}

/// HTTP client bound to one backend, with provider routing applied.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    backend_base: String,
    route: Arc<ProviderRoute>,
    admin_key: Option<Arc<str>>,
    request_timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http(http, config))
    }

    pub fn with_http(http: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            http,
            backend_base: config.backend_base.trim_end_matches('/').to_string(),
            route: Arc::new(ProviderRoute::new(
                &config.provider_api_base,
                &config.proxy_base(),
            )),
            admin_key: config.admin_key.as_deref().map(Arc::from),
            request_timeout: config.request_timeout,
        }
    }

    pub fn route(&self) -> &ProviderRoute {
        &self.route
    }

    pub fn backend_url(&self, path: &str) -> String {
        join_url(&self.backend_base, path)
    }

    /// Provider URL for `endpoint`; goes through the proxy once sent.
    pub fn provider_url(&self, endpoint: &str) -> String {
        self.route.provider_url(endpoint)
    }

    /// Default bound applied to every request built here.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Builds a request, rerouting provider URLs before anything else sees them.
    /// The request is bounded by [`Self::request_timeout`] unless the caller
    /// sets its own timeout.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let target = self.route.rewrite(url);
        if let Cow::Owned(rewritten) = &target {
            debug!(from = url, to = %rewritten, "routing provider call through backend proxy");
        }
        let builder = self
            .http
            .request(method, target.as_ref())
            .timeout(self.request_timeout);
        match &self.admin_key {
            Some(key) => builder.header(ADMIN_KEY_HEADER, key.as_ref()),
            None => builder,
        }
    }

    /// Sends the request and returns the status and body of a successful response.
    pub async fn execute(
        &self,
        builder: RequestBuilder,
    ) -> std::result::Result<(u16, String), RequestFailure> {
        let resp = builder
            .send()
            .await
            .map_err(|e| RequestFailure::transport(&e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| RequestFailure {
            status: Some(status.as_u16()),
            body: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(RequestFailure {
                status: Some(status.as_u16()),
                body,
            });
        }
        Ok((status.as_u16(), body))
    }

    pub async fn post_json<B>(
        &self,
        url: &str,
        body: &B,
        bearer: Option<&str>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, RequestFailure>
    where
        B: Serialize + ?Sized,
    {
        let mut builder = self.request(Method::POST, url).json(body);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let (status, text) = self.execute(builder).await?;
        parse_json_body(status, &text)
    }

    pub async fn get_json(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, RequestFailure> {
        let mut builder = self
            .request(Method::GET, url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let (status, text) = self.execute(builder).await?;
        parse_json_body(status, &text)
    }
}

/// Empty bodies read as `null`; anything else must be JSON.
fn parse_json_body(status: u16, text: &str) -> std::result::Result<Value, RequestFailure> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| {
        warn!("malformed JSON body: {e}");
        RequestFailure {
            status: Some(status),
            body: text.to_string(),
        }
    })
}
