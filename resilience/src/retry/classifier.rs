//! Error classification for retry and alerting decisions
//!
//! Maps a transport-neutral [`RawFailure`] onto one [`ErrorKind`]; each kind
//! carries a fixed [`KindPolicy`] that decides severity, whether the failure
//! may be retried automatically and what the user is told.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Validation,
    Permission,
    NotFound,
    Server,
    Timeout,
    RateLimit,
    SessionState,
    Auth,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Network,
        ErrorKind::Validation,
        ErrorKind::Permission,
        ErrorKind::NotFound,
        ErrorKind::Server,
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::SessionState,
        ErrorKind::Auth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Server => "server",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::SessionState => "session_state",
            ErrorKind::Auth => "auth",
        }
    }

    pub fn policy(self) -> KindPolicy {
        use Severity::*;
        let (severity, retryable, user_message) = match self {
            ErrorKind::Network => (
                Medium,
                true,
                "Network connection issue. Please check your internet connection.",
            ),
            ErrorKind::Validation => (
                Low,
                false,
                "Please check the information you entered and try again.",
            ),
            ErrorKind::Permission => (
                High,
                false,
                "You don't have permission to perform this action.",
            ),
            ErrorKind::NotFound => (Medium, false, "The requested item could not be found."),
            ErrorKind::Server => (
                High,
                true,
                "Something went wrong on our end. Please try again shortly.",
            ),
            ErrorKind::Timeout => (Medium, true, "The request took too long. Please try again."),
            ErrorKind::RateLimit => (
                Medium,
                true,
                "Too many requests. Please wait a moment and try again.",
            ),
            ErrorKind::SessionState => (
                Medium,
                true,
                "Your shop session is out of date. Reloading shop data.",
            ),
            ErrorKind::Auth => (
                Critical,
                false,
                "Your session has ended. Please sign in again.",
            ),
        };
        KindPolicy {
            kind: self,
            severity,
            retryable,
            // Every retryable kind is also retried without user action.
            auto_retry: retryable,
            user_message,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// How long a surfaced error stays on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    AutoDismiss(Duration),
    /// Stays until dismissed.
    Sticky,
    /// Stays until acknowledged or the page is reloaded.
    RequiresAcknowledgement,
}

impl Severity {
    pub fn persistence(self, low_dismiss: Duration, medium_dismiss: Duration) -> Persistence {
        match self {
            Severity::Low => Persistence::AutoDismiss(low_dismiss),
            Severity::Medium => Persistence::AutoDismiss(medium_dismiss),
            Severity::High => Persistence::Sticky,
            Severity::Critical => Persistence::RequiresAcknowledgement,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub auto_retry: bool,
    pub user_message: &'static str,
}

/// Transport-level failure observed without an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportFailure {
    /// DNS, connect or reset failures.
    Network,
    Timeout,
    Aborted,
}

/// Everything the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFailure {
    pub status: Option<u16>,
    pub message: String,
    pub transport: Option<TransportFailure>,
    /// The host reported itself offline when the failure happened.
    pub offline: bool,
    /// Domain hint from the caller, e.g. "shop" or "auth".
    pub context_tag: Option<String>,
}

impl RawFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    pub fn transport(failure: TransportFailure, message: impl Into<String>) -> Self {
        Self {
            transport: Some(failure),
            ..Self::new(message)
        }
    }

    pub fn with_context_tag(mut self, tag: impl Into<String>) -> Self {
        self.context_tag = Some(tag.into());
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }
}

impl std::fmt::Display for RawFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// First match wins; see the kind table in the crate docs.
pub fn classify(failure: &RawFailure) -> ErrorKind {
    if failure.status.is_none()
        && (failure.offline || failure.transport == Some(TransportFailure::Network))
    {
        return ErrorKind::Network;
    }

    if let Some(status) = failure.status {
        match status {
            401 | 403 => return ErrorKind::Permission,
            404 => return ErrorKind::NotFound,
            422 => return ErrorKind::Validation,
            429 => return ErrorKind::RateLimit,
            400..=499 => return ErrorKind::Validation,
            500.. => return ErrorKind::Server,
            _ => {}
        }
    }

    let message = failure.message.to_lowercase();
    if matches!(
        failure.transport,
        Some(TransportFailure::Timeout | TransportFailure::Aborted)
    ) || message.contains("timeout")
        || message.contains("timed out")
    {
        return ErrorKind::Timeout;
    }

    let tag = failure
        .context_tag
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();
    let mentions = |needle: &str| message.contains(needle) || tag.contains(needle);
    if mentions("shop") {
        return ErrorKind::SessionState;
    }
    if mentions("auth") {
        return ErrorKind::Auth;
    }

    ErrorKind::Server
}

/// Implemented by error types that can describe themselves to the
/// classifier.
pub trait RetryClassifiable {
    fn to_raw_failure(&self) -> RawFailure;

    fn classify(&self) -> ErrorKind {
        classify(&self.to_raw_failure())
    }

    fn is_retryable(&self) -> bool {
        self.classify().policy().retryable
    }
}

impl RetryClassifiable for RawFailure {
    fn to_raw_failure(&self) -> RawFailure {
        self.clone()
    }
}
