//! Failure handling for the storefront client.
//!
//! Every failure is classified into one [`ErrorKind`]:
//!
//! | kind | severity | auto retry |
//! |---|---|---|
//! | network | medium | yes |
//! | validation | low | no |
//! | permission | high | no |
//! | not_found | medium | no |
//! | server | high | yes |
//! | timeout | medium | yes |
//! | rate_limit | medium | yes |
//! | session_state | medium | yes |
//! | auth | critical | no |
//!
//! [`ErrorHandler::handle_error`] is the entry point: it records the failure
//! in [`Telemetry`], lets the [`RetryScheduler`] retry it with exponential
//! backoff while the kind's circuit is closed, and surfaces it once retries
//! are not possible.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod error;
mod handler;
mod record;
pub mod retry;
pub mod telemetry;

pub use error::ResilienceError;
pub use error::Result;
pub use handler::ErrorHandler;
pub use handler::HandleOptions;
pub use handler::HandledError;
pub use handler::NotificationConfig;
pub use handler::RetryOutcome;
pub use record::ErrorRecord;
pub use retry::ErrorKind;
pub use retry::KindPolicy;
pub use retry::Persistence;
pub use retry::RawFailure;
pub use retry::RetryClassifiable;
pub use retry::RetryConfig;
pub use retry::RetryDecision;
pub use retry::RetryFn;
pub use retry::RetryKey;
pub use retry::RetryScheduler;
pub use retry::Severity;
pub use retry::TransportFailure;
pub use retry::classify;
pub use retry::retry_with_backoff;
pub use retry::run_with_backoff;
pub use telemetry::Alert;
pub use telemetry::AlertType;
pub use telemetry::Telemetry;
pub use telemetry::TelemetryConfig;
pub use telemetry::TelemetrySnapshot;
