use serde_json::Value;
use storefront_resilience::RawFailure;
use storefront_resilience::RetryClassifiable;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("request to {path} failed with HTTP {status}")]
    Http {
        path: String,
        status: u16,
        body: Value,
    },

    /// The replay after a successful refresh was rejected again.
    #[error("request to {path} was rejected after the session was refreshed")]
    Unauthorized { path: String },

    #[error("session refresh failed: {reason}")]
    RefreshFailed { reason: String },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("session guard stopped before the request completed")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RetryClassifiable for SessionError {
    fn to_raw_failure(&self) -> RawFailure {
        match self {
            SessionError::Http { status, .. } => RawFailure::http(*status, self.to_string()),
            SessionError::Unauthorized { .. } => RawFailure::http(401, self.to_string()),
            SessionError::RefreshFailed { .. }
            | SessionError::NotAuthenticated
            | SessionError::Cancelled => RawFailure::new(self.to_string()).with_context_tag("auth"),
            SessionError::Transport(err) => err.to_raw_failure(),
        }
    }
}
