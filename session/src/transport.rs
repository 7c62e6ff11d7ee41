//! HTTP transport seam.
//!
//! The guard never talks to an HTTP client directly; it drives any
//! [`Transport`]. [`ReqwestTransport`] is the production implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use storefront_resilience::RawFailure;
use storefront_resilience::RetryClassifiable;
use storefront_resilience::TransportFailure;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the transport's base URL.
    pub path: String,
    pub body: Option<Value>,
    pub include_credentials: bool,
    /// An authorization failure on this request may trigger a session
    /// refresh followed by one replay.
    pub refresh_on_unauthorized: bool,
    /// A 401 here means "no session" rather than "stale session".
    pub identity_probe: bool,
    /// Set on the replay after a refresh; a replay never refreshes again.
    pub retried: bool,
    pub metadata: HashMap<String, String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            include_credentials: true,
            refresh_on_unauthorized: false,
            identity_probe: false,
            retried: false,
            metadata: HashMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn refresh_on_unauthorized(mut self) -> Self {
        self.refresh_on_unauthorized = true;
        self
    }

    pub fn identity_probe(mut self) -> Self {
        self.identity_probe = true;
        self
    }

    pub fn without_credentials(mut self) -> Self {
        self.include_credentials = false;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Decoded JSON; `Null` for an empty body, a JSON string for non-JSON
    /// text.
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request aborted: {0}")]
    Aborted(String),

    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_builder() {
            TransportError::InvalidUrl(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl RetryClassifiable for TransportError {
    fn to_raw_failure(&self) -> RawFailure {
        let message = self.to_string();
        match self {
            TransportError::Network(_) => RawFailure::transport(TransportFailure::Network, message),
            TransportError::Timeout(_) => RawFailure::transport(TransportFailure::Timeout, message),
            TransportError::Aborted(_) => RawFailure::transport(TransportFailure::Aborted, message),
            TransportError::InvalidUrl(_) => RawFailure::new(message),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// `reqwest` transport with a cookie store for credentialed requests.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    base_url: Url,
    timeout: Duration,
    with_cookies: reqwest::Client,
    without_cookies: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|err| TransportError::InvalidUrl(format!("{}: {err}", config.base_url)))?;
        let with_cookies = reqwest::Client::builder().cookie_store(true).build()?;
        let without_cookies = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url,
            timeout: config.timeout(),
            with_cookies,
            without_cookies,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::InvalidUrl(format!("{path}: {err}")))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path)?;
        let client = if request.include_credentials {
            &self.with_cookies
        } else {
            &self.without_cookies
        };

        let mut builder = client
            .request(request.method.clone(), url)
            .timeout(self.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::trace!(method = %request.method, path = %request.path, "sending request");
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use storefront_resilience::ErrorKind;

    #[test]
    fn builders_set_flags() {
        let request = ApiRequest::post("/cart", serde_json::json!({"sku": "A1"}))
            .refresh_on_unauthorized()
            .with_metadata("trace", "abc");
        assert_eq!(request.method, Method::POST);
        assert!(request.include_credentials);
        assert!(request.refresh_on_unauthorized);
        assert!(!request.identity_probe);
        assert!(!request.retried);
        assert_eq!(request.metadata.get("trace").map(String::as_str), Some("abc"));
    }

    #[test]
    fn transport_errors_classify() {
        assert_eq!(
            TransportError::Network("reset".into()).classify(),
            ErrorKind::Network
        );
        assert_eq!(
            TransportError::Timeout("30s".into()).classify(),
            ErrorKind::Timeout
        );
        assert_eq!(
            TransportError::Aborted("cancelled".into()).classify(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn rejects_bad_base_url() {
        let config = TransportConfig {
            base_url: "not a url".to_string(),
            ..TransportConfig::default()
        };
        assert!(matches!(
            ReqwestTransport::new(&config),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
