//! Awaited exponential backoff.
//!
//! The scheduler is fire-and-forget; this is the inline counterpart for
//! callers that want to await one final result. Only failures whose kind is
//! retryable are retried.

use std::future::Future;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use backon::ExponentialBuilder;
use backon::Retryable;

use super::RetryConfig;
use super::classifier::RetryClassifiable;
use crate::error::ResilienceError;

fn backoff(config: &RetryConfig) -> ExponentialBuilder {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.base_delay())
        .with_max_delay(config.max_delay())
        .with_factor(2.0)
        .with_max_times(config.max_retries as usize);
    if config.jitter_factor > 0.0 {
        backoff.with_jitter()
    } else {
        backoff
    }
}

/// Run `operation` under the configured backoff, retrying while `when`
/// accepts the failure. `notify` sees every failure that will be retried,
/// with the delay before the next attempt. The last failure is returned
/// unchanged.
pub async fn retry_with_backoff<F, Fut, T, E, W, N>(
    operation: F,
    config: &RetryConfig,
    when: W,
    notify: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    W: FnMut(&E) -> bool,
    N: FnMut(&E, Duration),
{
    operation
        .retry(backoff(config))
        .when(when)
        .notify(notify)
        .await
}

/// Execute `operation`, retrying retryable failures with exponential
/// backoff (`base_delay`, doubling, capped at `max_delay`) up to
/// `max_retries` times.
///
/// With the defaults that is 1 initial call plus 3 retries.
pub async fn run_with_backoff<F, Fut, T, E>(
    mut operation: F,
    config: &RetryConfig,
) -> crate::Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    E: std::fmt::Display + RetryClassifiable + Send + Sync + 'static,
{
    let calls = AtomicU32::new(0);
    let result = retry_with_backoff(
        || {
            calls.fetch_add(1, Ordering::Relaxed);
            operation()
        },
        config,
        |err: &E| err.is_retryable(),
        |err: &E, delay: Duration| {
            tracing::warn!(
                error = %err,
                kind = %err.classify(),
                delay_ms = delay.as_millis() as u64,
                "transient failure; backing off"
            );
        },
    )
    .await;

    result.map_err(|err| {
        let kind = err.classify();
        if kind.policy().retryable {
            ResilienceError::RetriesExhausted {
                attempts: calls.load(Ordering::Relaxed),
                last_error: err.to_string(),
            }
        } else {
            ResilienceError::NotRetryable {
                kind,
                message: err.to_string(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ErrorKind;
    use crate::retry::RawFailure;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = run_with_backoff(
            || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(RawFailure::http(503, "unavailable"))
                    } else {
                        Ok("ok")
                    }
                }
            },
            &fast_config(),
        )
        .await;

        assert_eq!(result.ok(), Some("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: crate::Result<()> = run_with_backoff(
            || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RawFailure::http(404, "missing"))
                }
            },
            &fast_config(),
        )
        .await;

        assert!(matches!(
            result,
            Err(ResilienceError::NotRetryable {
                kind: ErrorKind::NotFound,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_total_calls() {
        let result: crate::Result<()> = run_with_backoff(
            || async { Err(RawFailure::http(429, "slow down")) },
            &fast_config(),
        )
        .await;

        match result {
            Err(ResilienceError::RetriesExhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "HTTP 429: slow down");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn notify_sees_doubling_delays_and_last_error_is_kept() {
        let mut delays = Vec::new();
        let result: Result<(), RawFailure> = retry_with_backoff(
            || async { Err(RawFailure::http(503, "unavailable")) },
            &fast_config(),
            |_: &RawFailure| true,
            |_: &RawFailure, delay: Duration| delays.push(delay.as_millis()),
        )
        .await;

        assert_eq!(delays, vec![10, 20, 40]);
        assert_eq!(result, Err(RawFailure::http(503, "unavailable")));
    }
}
