use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SessionError;
use crate::transport::ApiRequest;
use crate::transport::Transport;

pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Renews the session credential. Returns the refreshed profile, if the
/// server sent one.
#[async_trait]
pub trait SessionRefresher: Send + Sync {
    async fn refresh(&self) -> Result<Option<Value>, SessionError>;
}

/// Posts to the refresh endpoint; the server rotates the session cookie.
pub struct EndpointRefresher {
    transport: Arc<dyn Transport>,
    path: String,
}

impl EndpointRefresher {
    pub fn new(transport: Arc<dyn Transport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SessionRefresher for EndpointRefresher {
    async fn refresh(&self) -> Result<Option<Value>, SessionError> {
        let request = ApiRequest::new(reqwest::Method::POST, self.path.clone());
        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|err| SessionError::RefreshFailed {
                reason: err.to_string(),
            })?;

        if !response.is_success() {
            return Err(SessionError::RefreshFailed {
                reason: format!("HTTP {}", response.status),
            });
        }

        let profile = match response.body {
            Value::Null => None,
            Value::Object(mut map) if map.contains_key("user") => map.remove("user"),
            other => Some(other),
        };
        Ok(profile)
    }
}
