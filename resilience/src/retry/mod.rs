//! Retry logic with exponential backoff
//!
//! This module provides:
//! - Error classification and the per-kind policy table
//! - A fire-and-forget scheduler with per-operation attempt counters
//! - An awaited backoff loop for callers that want a single result
//! - Per-kind circuit breakers fed by telemetry

pub mod circuit_breaker;
pub mod classifier;
pub mod scheduler;
pub mod strategy;

pub use classifier::ErrorKind;
pub use classifier::KindPolicy;
pub use classifier::Persistence;
pub use classifier::RawFailure;
pub use classifier::RetryClassifiable;
pub use classifier::Severity;
pub use classifier::TransportFailure;
pub use classifier::classify;
pub use scheduler::RetryDecision;
pub use scheduler::RetryFn;
pub use scheduler::RetryScheduler;
pub use strategy::retry_with_backoff;
pub use strategy::run_with_backoff;

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ResilienceError;

/// Identifies one logical operation for retry accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryKey {
    pub context: String,
    pub operation: String,
}

impl RetryKey {
    pub fn new(context: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            operation: operation.into(),
        }
    }
}

impl std::fmt::Display for RetryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.context, self.operation)
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Random variation applied to each delay, `0.0..=1.0`. Zero keeps
    /// delays exactly `base * 2^attempt`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.base_delay_ms == 0 {
            return Err(ResilienceError::InvalidConfig(
                "retry.base_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ResilienceError::InvalidConfig(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ResilienceError::InvalidConfig(format!(
                "retry.jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        assert_eq!(RetryKey::new("cart", "add_item").to_string(), "cart:add_item");
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(RetryConfig::default().validate().is_ok());

        let zero_base = RetryConfig {
            base_delay_ms: 0,
            ..RetryConfig::default()
        };
        assert!(zero_base.validate().is_err());

        let inverted = RetryConfig {
            base_delay_ms: 5_000,
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        };
        assert!(inverted.validate().is_err());

        let jitter = RetryConfig {
            jitter_factor: 1.5,
            ..RetryConfig::default()
        };
        assert!(jitter.validate().is_err());
    }
}
