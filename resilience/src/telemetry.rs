//! Failure counters and alerts.
//!
//! The counters are not just for dashboards: the per-kind circuit breakers
//! kept here decide whether the error handler may schedule another automatic
//! retry for a kind that is currently failing in bulk.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::time::Instant;

use crate::retry::ErrorKind;
use crate::retry::RetryKey;
use crate::retry::circuit_breaker::CircuitBreaker;
use crate::retry::circuit_breaker::CircuitState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Unacknowledged alerts disappear after this long.
    pub alert_ttl_secs: u64,
    /// Sliding window for the per-kind failure rate.
    pub error_window_secs: u64,
    /// Failures of one kind inside the window that open its circuit.
    pub error_rate_threshold: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            alert_ttl_secs: 300,
            error_window_secs: 60,
            error_rate_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighErrorRate,
    RetryExhausted,
    RefreshFailed,
    CriticalError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: AlertType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(skip)]
    raised_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryCounters {
    pub scheduled: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub exhausted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshCounters {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub failures_by_kind: HashMap<ErrorKind, u64>,
    pub open_circuits: Vec<ErrorKind>,
    pub retries: RetryCounters,
    pub refresh: RefreshCounters,
    pub active_alerts: Vec<Alert>,
}

#[derive(Default)]
struct TelemetryState {
    failures_by_kind: HashMap<ErrorKind, u64>,
    breakers: HashMap<ErrorKind, CircuitBreaker>,
    retries: RetryCounters,
    refresh: RefreshCounters,
    alerts: Vec<Alert>,
}

/// Shared telemetry handle; clones observe the same counters.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    config: TelemetryConfig,
    state: Mutex<TelemetryState>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(TelemetryConfig::default())
    }
}

impl Telemetry {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                config,
                state: Mutex::new(TelemetryState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TelemetryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.inner.config.error_window_secs)
    }

    fn alert_ttl(&self) -> Duration {
        Duration::from_secs(self.inner.config.alert_ttl_secs)
    }

    /// Count a classified failure. Returns `true` if it opened the kind's
    /// circuit, in which case a `HighErrorRate` alert was raised.
    pub fn record_failure(&self, kind: ErrorKind) -> bool {
        let now = Instant::now();
        let window = self.window();
        let threshold = self.inner.config.error_rate_threshold;

        let (opened, recent) = {
            let mut state = self.state();
            *state.failures_by_kind.entry(kind).or_default() += 1;
            let breaker = state
                .breakers
                .entry(kind)
                .or_insert_with(|| CircuitBreaker::new(window, threshold));
            let opened = breaker.record_failure(now);
            (opened, breaker.recent_failures(now))
        };

        if opened {
            tracing::warn!(%kind, recent, "error rate threshold reached; pausing automatic retries");
            self.raise(
                AlertType::HighErrorRate,
                json!({
                    "kind": kind,
                    "count": recent,
                    "window_secs": window.as_secs(),
                }),
            );
        }
        opened
    }

    pub fn is_circuit_open(&self, kind: ErrorKind) -> bool {
        let now = Instant::now();
        self.state()
            .breakers
            .get_mut(&kind)
            .is_some_and(|breaker| !breaker.allows_retry(now))
    }

    pub fn record_retry_scheduled(&self, key: &RetryKey, attempt: u32, delay: Duration) {
        self.state().retries.scheduled += 1;
        tracing::info!(%key, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
    }

    pub fn record_retry_succeeded(&self, key: &RetryKey, kind: ErrorKind) {
        let mut state = self.state();
        state.retries.succeeded += 1;
        if let Some(breaker) = state.breakers.get_mut(&kind) {
            breaker.record_success();
        }
        tracing::info!(%key, "retry succeeded");
    }

    pub fn record_retry_failed(&self, key: &RetryKey, error: &str) {
        self.state().retries.failed += 1;
        tracing::warn!(%key, error, "retry attempt failed");
    }

    pub fn record_retry_exhausted(&self, key: &RetryKey, attempts: u32) {
        self.state().retries.exhausted += 1;
        tracing::warn!(%key, attempts, "retries exhausted; surfacing failure");
        self.raise(
            AlertType::RetryExhausted,
            json!({
                "context": key.context,
                "operation": key.operation,
                "attempts": attempts,
            }),
        );
    }

    pub fn record_refresh_started(&self) {
        self.state().refresh.started += 1;
    }

    pub fn record_refresh_succeeded(&self) {
        self.state().refresh.succeeded += 1;
    }

    pub fn record_refresh_failed(&self, error: &str) {
        self.state().refresh.failed += 1;
        self.raise(AlertType::RefreshFailed, json!({ "error": error }));
    }

    /// Raise an alert and return its id.
    pub fn raise(&self, alert_type: AlertType, data: Value) -> String {
        let alert = Alert {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            data,
            timestamp: Utc::now(),
            acknowledged: false,
            raised_at: Instant::now(),
        };
        let id = alert.id.clone();
        let mut state = self.state();
        self.prune_alerts(&mut state);
        state.alerts.push(alert);
        id
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut state = self.state();
        match state.alerts.iter_mut().find(|alert| alert.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Unacknowledged alerts that have not expired.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut state = self.state();
        self.prune_alerts(&mut state);
        state
            .alerts
            .iter()
            .filter(|alert| !alert.acknowledged)
            .cloned()
            .collect()
    }

    fn prune_alerts(&self, state: &mut TelemetryState) {
        let ttl = self.alert_ttl();
        let now = Instant::now();
        state
            .alerts
            .retain(|alert| now.duration_since(alert.raised_at) < ttl);
    }

    pub fn failures(&self, kind: ErrorKind) -> u64 {
        self.state()
            .failures_by_kind
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let now = Instant::now();
        let mut state = self.state();
        self.prune_alerts(&mut state);
        let mut open_circuits: Vec<ErrorKind> = state
            .breakers
            .iter_mut()
            .filter_map(|(kind, breaker)| {
                (breaker.state(now) == CircuitState::Open).then_some(*kind)
            })
            .collect();
        open_circuits.sort_by_key(|kind| kind.as_str());

        TelemetrySnapshot {
            failures_by_kind: state.failures_by_kind.clone(),
            open_circuits,
            retries: state.retries.clone(),
            refresh: state.refresh.clone(),
            active_alerts: state
                .alerts
                .iter()
                .filter(|alert| !alert.acknowledged)
                .cloned()
                .collect(),
        }
    }
}
