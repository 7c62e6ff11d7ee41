//! Fire-and-forget retry scheduling with per-operation counters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;

use super::RetryConfig;
use super::RetryKey;
use super::classifier::KindPolicy;
use super::classifier::RawFailure;
use crate::telemetry::Telemetry;

/// Callback that re-issues a failed operation.
pub type RetryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), RawFailure>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// `attempt` is 1-indexed: the first retry of an operation is attempt 1.
    Scheduled { attempt: u32, delay: Duration },
    /// The ceiling was reached; the counter has been cleared.
    Exhausted { attempts: u32 },
    NotRetryable,
}

impl RetryDecision {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, RetryDecision::Scheduled { .. })
    }
}

#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: RetryConfig,
    attempts: Mutex<HashMap<RetryKey, u32>>,
    telemetry: Telemetry,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig, telemetry: Telemetry) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                attempts: Mutex::new(HashMap::new()),
                telemetry,
            }),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    fn attempts_map(&self) -> MutexGuard<'_, HashMap<RetryKey, u32>> {
        self.inner
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether `key` gets another attempt and, if so, run `attempt`
    /// on a background task after the backoff delay.
    ///
    /// A failed attempt is only logged here; callers that want the failure
    /// to count toward the ceiling feed it back through their normal
    /// failure path, which calls this method again.
    pub fn schedule_retry<F, Fut>(
        &self,
        key: RetryKey,
        policy: &KindPolicy,
        max_retries: Option<u32>,
        attempt: F,
    ) -> RetryDecision
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RawFailure>> + Send + 'static,
    {
        let max_retries = max_retries.unwrap_or(self.inner.config.max_retries);

        let count = {
            let mut attempts = self.attempts_map();
            let count = attempts.get(&key).copied().unwrap_or_default();
            if count >= max_retries {
                attempts.remove(&key);
                drop(attempts);
                self.inner.telemetry.record_retry_exhausted(&key, count);
                return RetryDecision::Exhausted { attempts: count };
            }
            if !policy.retryable {
                return RetryDecision::NotRetryable;
            }
            attempts.insert(key.clone(), count + 1);
            count
        };

        let delay = self.delay_for(count);
        self.inner
            .telemetry
            .record_retry_scheduled(&key, count + 1, delay);

        let scheduler = self.clone();
        let kind = policy.kind;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match attempt().await {
                Ok(()) => {
                    scheduler.reset(&key);
                    scheduler.inner.telemetry.record_retry_succeeded(&key, kind);
                }
                Err(failure) => {
                    scheduler
                        .inner
                        .telemetry
                        .record_retry_failed(&key, &failure.to_string());
                }
            }
        });

        RetryDecision::Scheduled {
            attempt: count + 1,
            delay,
        }
    }

    /// Backoff for the 0-indexed `attempt`: `base * 2^attempt`, capped at
    /// the configured maximum, then jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let config = &self.inner.config;
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = config
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(config.max_delay_ms);
        apply_jitter(Duration::from_millis(millis), config.jitter_factor)
    }

    pub fn attempts(&self, key: &RetryKey) -> u32 {
        self.attempts_map().get(key).copied().unwrap_or_default()
    }

    pub fn reset(&self, key: &RetryKey) {
        self.attempts_map().remove(key);
    }

    pub fn reset_all(&self) {
        self.attempts_map().clear();
    }
}

/// Adds random variation (±jitter_factor) to a delay.
pub(crate) fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    let jittered_ms = (duration.as_millis() as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}
