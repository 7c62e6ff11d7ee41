use crate::retry::ErrorKind;

pub type Result<T> = std::result::Result<T, ResilienceError>;

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("permanent {kind} failure (not retryable): {message}")]
    NotRetryable { kind: ErrorKind, message: String },

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
