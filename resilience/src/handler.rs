//! Single entry point for failures raised anywhere in the client.
//!
//! `handle_error` classifies, records telemetry, schedules an automatic retry
//! when the kind allows it, and otherwise surfaces an [`ErrorRecord`] to the
//! notification list and the shared `error-banner` state. `run` is the
//! awaited form: it retries inline and only hands the caller a failure once
//! retries are exhausted or the kind is not retryable.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use storefront_state_bus::StateBus;
use storefront_state_bus::keys;
use uuid::Uuid;

use crate::record::ErrorRecord;
use crate::retry::KindPolicy;
use crate::retry::Persistence;
use crate::retry::RawFailure;
use crate::retry::RetryClassifiable;
use crate::retry::RetryDecision;
use crate::retry::RetryFn;
use crate::retry::RetryKey;
use crate::retry::RetryScheduler;
use crate::retry::Severity;
use crate::retry::classify;
use crate::retry::retry_with_backoff;
use crate::telemetry::AlertType;
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub low_dismiss_ms: u64,
    pub medium_dismiss_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            low_dismiss_ms: 5_000,
            medium_dismiss_ms: 8_000,
        }
    }
}

impl NotificationConfig {
    pub fn persistence(&self, severity: Severity) -> Persistence {
        severity.persistence(
            Duration::from_millis(self.low_dismiss_ms),
            Duration::from_millis(self.medium_dismiss_ms),
        )
    }
}

#[derive(Clone)]
pub struct HandleOptions {
    pub context: String,
    pub operation: String,
    pub on_retry: Option<RetryFn>,
    /// Overrides the scheduler's configured ceiling.
    pub max_retries: Option<u32>,
    pub user_message: Option<String>,
    /// Record and retry, but never surface.
    pub silent: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self::new("app", "unknown")
    }
}

impl HandleOptions {
    pub fn new(context: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            operation: operation.into(),
            on_retry: None,
            max_retries: None,
            user_message: None,
            silent: false,
        }
    }

    pub fn on_retry<F, Fut>(mut self, retry: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RawFailure>> + Send + 'static,
    {
        self.on_retry = Some(Arc::new(move || retry().boxed()));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn retry_key(&self) -> RetryKey {
        RetryKey::new(self.context.clone(), self.operation.clone())
    }
}

impl std::fmt::Debug for HandleOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleOptions")
            .field("context", &self.context)
            .field("operation", &self.operation)
            .field("on_retry", &self.on_retry.is_some())
            .field("max_retries", &self.max_retries)
            .field("user_message", &self.user_message)
            .field("silent", &self.silent)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    /// The kind is failing in bulk; automatic retries are paused.
    CircuitOpen,
    NotAttempted,
}

#[derive(Debug, Clone)]
pub struct HandledError {
    pub record: ErrorRecord,
    pub retry: RetryOutcome,
    pub surfaced: bool,
}

#[derive(Clone)]
pub struct ErrorHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    config: NotificationConfig,
    scheduler: RetryScheduler,
    telemetry: Telemetry,
    bus: Option<StateBus>,
    records: Mutex<Vec<ErrorRecord>>,
    /// Retry callbacks of surfaced failures, for manual "Retry" actions.
    manual_retries: Mutex<HashMap<RetryKey, HandleOptions>>,
}

impl ErrorHandler {
    pub fn new(
        config: NotificationConfig,
        scheduler: RetryScheduler,
        telemetry: Telemetry,
        bus: Option<StateBus>,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                config,
                scheduler,
                telemetry,
                bus,
                records: Mutex::new(Vec::new()),
                manual_retries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.inner.scheduler
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.inner.telemetry
    }

    fn records_guard(&self) -> MutexGuard<'_, Vec<ErrorRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn manual_retries(&self) -> MutexGuard<'_, HashMap<RetryKey, HandleOptions>> {
        self.inner
            .manual_retries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle_error<E>(&self, failure: &E, options: HandleOptions) -> HandledError
    where
        E: RetryClassifiable + ?Sized,
    {
        let (raw, policy) = self.classify(failure);
        let key = options.retry_key();
        tracing::debug!(%key, kind = %policy.kind, error = %raw, "handling failure");
        self.inner.telemetry.record_failure(policy.kind);

        let retry = match options.on_retry.clone() {
            Some(_) if !policy.auto_retry => RetryOutcome::NotAttempted,
            Some(_) if self.inner.telemetry.is_circuit_open(policy.kind) => {
                RetryOutcome::CircuitOpen
            }
            Some(on_retry) => {
                let handler = self.clone();
                let reentry = options.clone();
                let decision = self.inner.scheduler.schedule_retry(
                    key,
                    &policy,
                    options.max_retries,
                    move || async move {
                        let result = on_retry().await;
                        if let Err(failure) = &result {
                            handler.handle_error(failure, reentry);
                        }
                        result
                    },
                );
                match decision {
                    RetryDecision::Scheduled { attempt, delay } => {
                        RetryOutcome::Scheduled { attempt, delay }
                    }
                    RetryDecision::Exhausted { attempts } => RetryOutcome::Exhausted { attempts },
                    RetryDecision::NotRetryable => RetryOutcome::NotAttempted,
                }
            }
            None => RetryOutcome::NotAttempted,
        };

        self.conclude(&raw, &policy, options, retry)
    }

    /// Run `operation` and retry its retryable failures inline, with the
    /// scheduler's backoff and ceiling. Only the final failure reaches the
    /// caller; it is recorded and surfaced exactly like one passed to
    /// [`ErrorHandler::handle_error`], but never scheduled again.
    pub async fn run<F, Fut, T, E>(&self, options: HandleOptions, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassifiable,
    {
        let key = options.retry_key();
        let mut config = self.inner.scheduler.config().clone();
        if let Some(max_retries) = options.max_retries {
            config.max_retries = max_retries;
        }
        let telemetry = &self.inner.telemetry;
        let retries = AtomicU32::new(0);
        let last_kind = Mutex::new(None);

        let result = retry_with_backoff(
            operation,
            &config,
            |err: &E| {
                let (_, policy) = self.classify(err);
                telemetry.record_failure(policy.kind);
                *last_kind.lock().unwrap_or_else(PoisonError::into_inner) = Some(policy.kind);
                policy.retryable && policy.auto_retry && !telemetry.is_circuit_open(policy.kind)
            },
            |_: &E, delay: Duration| {
                let attempt = retries.fetch_add(1, Ordering::Relaxed) + 1;
                telemetry.record_retry_scheduled(&key, attempt, delay);
            },
        )
        .await;
        let retries = retries.into_inner();

        match result {
            Ok(value) => {
                if retries > 0
                    && let Some(kind) = last_kind
                        .into_inner()
                        .unwrap_or_else(PoisonError::into_inner)
                {
                    telemetry.record_retry_succeeded(&key, kind);
                }
                Ok(value)
            }
            Err(err) => {
                let (raw, policy) = self.classify(&err);
                let retry = if !policy.retryable || !policy.auto_retry {
                    RetryOutcome::NotAttempted
                } else if retries >= config.max_retries {
                    telemetry.record_retry_exhausted(&key, retries);
                    RetryOutcome::Exhausted { attempts: retries }
                } else {
                    RetryOutcome::CircuitOpen
                };
                self.conclude(&raw, &policy, options, retry);
                Err(err)
            }
        }
    }

    /// Classify `failure`, filling in the offline flag from the bus.
    fn classify<E>(&self, failure: &E) -> (RawFailure, KindPolicy)
    where
        E: RetryClassifiable + ?Sized,
    {
        let mut raw = failure.to_raw_failure();
        if !raw.offline
            && let Some(bus) = &self.inner.bus
        {
            raw.offline = !bus.is_online();
        }
        let policy = classify(&raw).policy();
        (raw, policy)
    }

    /// Build the record and surface it unless a retry is still pending or
    /// the caller asked for silence.
    fn conclude(
        &self,
        raw: &RawFailure,
        policy: &KindPolicy,
        options: HandleOptions,
        retry: RetryOutcome,
    ) -> HandledError {
        let key = options.retry_key();
        let record = ErrorRecord::new(
            policy,
            raw.to_string(),
            options.user_message.clone(),
            &key,
        );

        let retry_pending = matches!(retry, RetryOutcome::Scheduled { .. });
        let surfaced = !options.silent && !retry_pending;
        if surfaced {
            if options.on_retry.is_some() {
                self.manual_retries().insert(key, options);
            }
            self.surface(record.clone());
        }

        HandledError {
            record,
            retry,
            surfaced,
        }
    }

    fn surface(&self, record: ErrorRecord) {
        let persistence = self.inner.config.persistence(record.severity);
        if record.severity == Severity::Critical {
            self.inner.telemetry.raise(
                AlertType::CriticalError,
                json!({
                    "kind": record.kind,
                    "context": record.context,
                    "operation": record.operation,
                    "message": record.message,
                }),
            );
        }

        let id = record.id;
        self.records_guard().push(record);
        self.publish_banner();

        if let Persistence::AutoDismiss(after) = persistence {
            let handler = Arc::downgrade(&self.inner);
            tokio::spawn(auto_dismiss(handler, id, after));
        }
    }

    fn publish_banner(&self) {
        let Some(bus) = &self.inner.bus else {
            return;
        };
        let (count, severity) = {
            let records = self.records_guard();
            (
                records.len(),
                records.iter().map(|record| record.severity).max(),
            )
        };
        bus.publish(
            keys::ERROR_BANNER,
            json!({
                "visible": count > 0,
                "count": count,
                "severity": severity,
            }),
        );
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records_guard().clone()
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        let removed = {
            let mut records = self.records_guard();
            let before = records.len();
            records.retain(|record| record.id != id);
            records.len() != before
        };
        if removed {
            self.publish_banner();
        }
        removed
    }

    /// Drop every record raised under `context`; returns how many went.
    pub fn clear_context(&self, context: &str) -> usize {
        let removed = {
            let mut records = self.records_guard();
            let before = records.len();
            records.retain(|record| record.context != context);
            before - records.len()
        };
        self.manual_retries().retain(|key, _| key.context != context);
        if removed > 0 {
            self.publish_banner();
        }
        removed
    }

    pub fn clear(&self) {
        self.records_guard().clear();
        self.manual_retries().clear();
        self.publish_banner();
    }

    /// Manual retry of a surfaced failure: resets the counter, dismisses the
    /// operation's records and re-runs its retry callback now. A failure
    /// goes through `handle_error` again with a fresh budget.
    pub fn retry_now(&self, key: &RetryKey) -> bool {
        let Some(options) = self.manual_retries().remove(key) else {
            return false;
        };
        let Some(on_retry) = options.on_retry.clone() else {
            return false;
        };

        self.inner.scheduler.reset(key);
        let removed = {
            let mut records = self.records_guard();
            let before = records.len();
            records.retain(|record| record.context != key.context || record.operation != key.operation);
            records.len() != before
        };
        if removed {
            self.publish_banner();
        }

        tracing::info!(%key, "manual retry");
        let handler = self.clone();
        tokio::spawn(async move {
            if let Err(failure) = on_retry().await {
                handler.handle_error(&failure, options);
            }
        });
        true
    }
}

async fn auto_dismiss(handler: Weak<HandlerInner>, id: Uuid, after: Duration) {
    tokio::time::sleep(after).await;
    if let Some(inner) = handler.upgrade() {
        ErrorHandler { inner }.dismiss(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ErrorKind;
    use crate::retry::RetryConfig;
    use crate::telemetry::TelemetryConfig;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use storefront_state_bus::BusConfig;
    use storefront_state_bus::EnvironmentSignal;
    use tokio::time::Instant;

    fn handler_with_bus() -> (ErrorHandler, StateBus) {
        let bus = StateBus::local(BusConfig::default());
        let telemetry = Telemetry::new(TelemetryConfig::default());
        let scheduler = RetryScheduler::new(RetryConfig::default(), telemetry.clone());
        let handler = ErrorHandler::new(
            NotificationConfig::default(),
            scheduler,
            telemetry,
            Some(bus.clone()),
        );
        (handler, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_with_backoff_then_surfaces() {
        let (handler, bus) = handler_with_bus();
        let start = Instant::now();
        let call_times = Arc::new(Mutex::new(Vec::new()));

        // The original call already failed once.
        call_times.lock().unwrap().push(Duration::ZERO);
        let times = Arc::clone(&call_times);
        let options = HandleOptions::new("catalog", "search").on_retry(move || {
            let times = Arc::clone(&times);
            async move {
                times.lock().unwrap().push(start.elapsed());
                Err(RawFailure::http(429, "Too Many Requests"))
            }
        });

        let first = handler.handle_error(&RawFailure::http(429, "Too Many Requests"), options);
        assert_eq!(
            first.retry,
            RetryOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(1_000)
            }
        );
        assert!(!first.surfaced);
        assert!(handler.records().is_empty());

        tokio::time::sleep(Duration::from_millis(7_500)).await;

        let times: Vec<u128> = call_times
            .lock()
            .unwrap()
            .iter()
            .map(Duration::as_millis)
            .collect();
        assert_eq!(times, vec![0, 1_000, 3_000, 7_000]);

        let records = handler.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ErrorKind::RateLimit);
        assert_eq!(records[0].context, "catalog");
        assert_eq!(
            bus.current(keys::ERROR_BANNER),
            Some(json!({"visible": true, "count": 1, "severity": "medium"}))
        );
        assert_eq!(handler.telemetry().snapshot().retries.exhausted, 1);
        assert_eq!(handler.scheduler().attempts(&RetryKey::new("catalog", "search")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_retry_is_never_surfaced() {
        let (handler, _bus) = handler_with_bus();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let options = HandleOptions::new("cart", "load").on_retry(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handler.handle_error(&RawFailure::http(503, "unavailable"), options);
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handler.records().is_empty());
        assert_eq!(handler.telemetry().snapshot().retries.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_surfaces_immediately() {
        let (handler, _bus) = handler_with_bus();
        let handled = handler.handle_error(
            &RawFailure::http(422, "email invalid"),
            HandleOptions::new("account", "update")
                .on_retry(|| async { Ok(()) })
                .user_message("Check your email address."),
        );

        assert_eq!(handled.retry, RetryOutcome::NotAttempted);
        assert!(handled.surfaced);
        assert_eq!(handled.record.kind, ErrorKind::Validation);
        assert_eq!(handled.record.user_message, "Check your email address.");
        assert_eq!(handled.record.message, "HTTP 422: email invalid");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_failures_are_recorded_but_not_surfaced() {
        let (handler, bus) = handler_with_bus();
        let handled = handler.handle_error(
            &RawFailure::http(404, "gone"),
            HandleOptions::new("product", "view").silent(),
        );
        assert!(!handled.surfaced);
        assert!(handler.records().is_empty());
        assert_eq!(bus.current(keys::ERROR_BANNER), None);
        assert_eq!(handler.telemetry().failures(ErrorKind::NotFound), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_indicator_comes_from_bus() {
        let (handler, bus) = handler_with_bus();
        bus.signal(EnvironmentSignal::NetworkOffline);

        let handled = handler.handle_error(&RawFailure::new("Failed to fetch"), HandleOptions::default());
        assert_eq!(handled.record.kind, ErrorKind::Network);
    }

    #[tokio::test(start_paused = true)]
    async fn severity_controls_auto_dismiss() {
        let (handler, bus) = handler_with_bus();
        handler.handle_error(&RawFailure::http(400, "bad"), HandleOptions::new("a", "low"));
        handler.handle_error(&RawFailure::http(404, "missing"), HandleOptions::new("a", "medium"));
        handler.handle_error(&RawFailure::http(403, "nope"), HandleOptions::new("a", "high"));
        assert_eq!(handler.records().len(), 3);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(handler.records().len(), 2);

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let records = handler.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, Severity::High);
        assert_eq!(
            bus.current(keys::ERROR_BANNER),
            Some(json!({"visible": true, "count": 1, "severity": "high"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failures_raise_alert_and_stay() {
        let (handler, _bus) = handler_with_bus();
        handler.handle_error(&RawFailure::new("auth token rejected"), HandleOptions::default());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let records = handler.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ErrorKind::Auth);
        let alerts = handler.telemetry().active_alerts();
        assert!(alerts.iter().any(|alert| alert.alert_type == AlertType::CriticalError));
    }

    #[tokio::test(start_paused = true)]
    async fn dismiss_and_clear() {
        let (handler, bus) = handler_with_bus();
        let a = handler.handle_error(&RawFailure::http(403, "x"), HandleOptions::new("cart", "add"));
        handler.handle_error(&RawFailure::http(403, "y"), HandleOptions::new("cart", "remove"));
        handler.handle_error(&RawFailure::http(403, "z"), HandleOptions::new("orders", "list"));

        assert!(handler.dismiss(a.record.id));
        assert!(!handler.dismiss(a.record.id));
        assert_eq!(handler.clear_context("cart"), 1);
        assert_eq!(handler.records().len(), 1);

        handler.clear();
        assert!(handler.records().is_empty());
        assert_eq!(
            bus.current(keys::ERROR_BANNER),
            Some(json!({"visible": false, "count": 0, "severity": null}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_pauses_automatic_retries() {
        let telemetry = Telemetry::new(TelemetryConfig {
            error_rate_threshold: 2,
            ..TelemetryConfig::default()
        });
        let scheduler = RetryScheduler::new(RetryConfig::default(), telemetry.clone());
        let handler = ErrorHandler::new(NotificationConfig::default(), scheduler, telemetry, None);
        let options = || HandleOptions::new("search", "query").on_retry(|| async { Ok(()) });

        let first = handler.handle_error(&RawFailure::http(500, "a"), options());
        assert!(matches!(first.retry, RetryOutcome::Scheduled { .. }));

        let second = handler.handle_error(&RawFailure::http(500, "b"), options());
        assert_eq!(second.retry, RetryOutcome::CircuitOpen);
        assert!(second.surfaced);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_retry_resets_budget() {
        let (handler, _bus) = handler_with_bus();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let options = HandleOptions::new("checkout", "pay")
            .max_retries(0)
            .on_retry(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        let handled = handler.handle_error(&RawFailure::http(502, "bad gateway"), options);
        assert_eq!(handled.retry, RetryOutcome::Exhausted { attempts: 0 });
        assert_eq!(handler.records().len(), 1);

        let key = RetryKey::new("checkout", "pay");
        assert!(handler.retry_now(&key));
        assert!(handler.records().is_empty());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!handler.retry_now(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_inline_before_returning_the_failure() {
        let (handler, bus) = handler_with_bus();
        let start = Instant::now();
        let call_times = Arc::new(Mutex::new(Vec::new()));

        let result: Result<(), RawFailure> = handler
            .run(HandleOptions::new("catalog", "search"), || {
                let times = Arc::clone(&call_times);
                async move {
                    times.lock().unwrap().push(start.elapsed().as_millis());
                    Err(RawFailure::http(429, "Too Many Requests"))
                }
            })
            .await;

        assert_eq!(result, Err(RawFailure::http(429, "Too Many Requests")));
        assert_eq!(*call_times.lock().unwrap(), vec![0, 1_000, 3_000, 7_000]);
        let records = handler.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ErrorKind::RateLimit);
        assert_eq!(
            bus.current(keys::ERROR_BANNER),
            Some(json!({"visible": true, "count": 1, "severity": "medium"}))
        );
        let retries = handler.telemetry().snapshot().retries;
        assert_eq!(retries.scheduled, 3);
        assert_eq!(retries.exhausted, 1);
        assert_eq!(handler.telemetry().failures(ErrorKind::RateLimit), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn run_hides_transient_failures_that_recover() {
        let (handler, _bus) = handler_with_bus();
        let calls = AtomicU32::new(0);

        let result = handler
            .run(HandleOptions::new("cart", "load"), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RawFailure::http(503, "unavailable"))
                    } else {
                        Ok("cart")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("cart"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(handler.records().is_empty());
        assert_eq!(handler.telemetry().snapshot().retries.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_non_retryable_failures_at_once() {
        let (handler, _bus) = handler_with_bus();
        let calls = AtomicU32::new(0);

        let result: Result<(), RawFailure> = handler
            .run(
                HandleOptions::new("admin", "open").user_message("Ask an admin."),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(RawFailure::http(403, "forbidden")) }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let records = handler.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ErrorKind::Permission);
        assert_eq!(records[0].user_message, "Ask an admin.");
        assert_eq!(handler.telemetry().snapshot().retries.exhausted, 0);
    }
}
