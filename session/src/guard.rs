//! Single-flight session refresh.
//!
//! The first opted-in request that comes back unauthorized starts a refresh
//! on a detached task; every other request rejected while it runs is parked
//! with a continuation. When the refresh succeeds the parked requests are
//! replayed once, in the order they were parked; when it fails they are all
//! rejected and the session is cleared.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use futures::future::join_all;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use storefront_resilience::Telemetry;
use storefront_state_bus::StateBus;
use storefront_state_bus::SubscribeOptions;
use storefront_state_bus::SyncEvent;
use storefront_state_bus::keys;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Result;
use crate::error::SessionError;
use crate::refresher::DEFAULT_REFRESH_PATH;
use crate::refresher::SessionRefresher;
use crate::transport::ApiRequest;
use crate::transport::ApiResponse;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Statuses treated as "session expired".
    pub unauthorized_statuses: Vec<u16>,
    pub refresh_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            unauthorized_statuses: vec![401],
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Idle,
    Refreshing,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub authenticated: bool,
    pub profile: Option<Value>,
}

struct PendingRequest {
    request: ApiRequest,
    transport: Arc<dyn Transport>,
    queued_at: Instant,
    continuation: oneshot::Sender<Result<ApiResponse>>,
}

struct Shared {
    state: GuardState,
    session: Session,
    pending: Vec<PendingRequest>,
}

#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    config: SessionConfig,
    refresher: Arc<dyn SessionRefresher>,
    bus: Option<StateBus>,
    telemetry: Telemetry,
    shared: Mutex<Shared>,
}

impl SessionGuard {
    pub fn new(
        config: SessionConfig,
        refresher: Arc<dyn SessionRefresher>,
        bus: Option<StateBus>,
        telemetry: Telemetry,
    ) -> Self {
        let inner = Arc::new(GuardInner {
            config,
            refresher,
            bus,
            telemetry,
            shared: Mutex::new(Shared {
                state: GuardState::Idle,
                session: Session::default(),
                pending: Vec::new(),
            }),
        });
        if let Some(bus) = &inner.bus {
            follow_other_tabs(bus, Arc::downgrade(&inner));
        }
        Self { inner }
    }

    /// Bind the guard to a transport.
    pub fn wrap(&self, transport: Arc<dyn Transport>) -> GuardedClient {
        GuardedClient {
            guard: self.clone(),
            transport,
        }
    }

    pub async fn execute(
        &self,
        transport: &Arc<dyn Transport>,
        request: ApiRequest,
    ) -> Result<ApiResponse> {
        let response = transport.send(&request).await?;
        if !self.is_unauthorized(response.status) {
            return finish(&request, response);
        }

        if request.retried {
            return Err(SessionError::Unauthorized { path: request.path });
        }
        if !request.refresh_on_unauthorized {
            if request.identity_probe {
                tracing::debug!(path = %request.path, "identity probe rejected; clearing session");
                self.end_session("unauthenticated");
                return Err(SessionError::NotAuthenticated);
            }
            return finish(&request, response);
        }

        let (tx, rx) = oneshot::channel();
        let start_refresh = {
            let mut shared = self.inner.shared();
            shared.pending.push(PendingRequest {
                request,
                transport: Arc::clone(transport),
                queued_at: Instant::now(),
                continuation: tx,
            });
            if shared.state == GuardState::Refreshing {
                false
            } else {
                shared.state = GuardState::Refreshing;
                true
            }
        };

        if start_refresh {
            // Detached so a caller dropping its future cannot strand the
            // other parked requests.
            tokio::spawn(run_refresh(Arc::clone(&self.inner)));
        }

        rx.await.unwrap_or(Err(SessionError::Cancelled))
    }

    pub fn state(&self) -> GuardState {
        self.inner.shared().state
    }

    pub fn session(&self) -> Session {
        self.inner.shared().session.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.shared().pending.len()
    }

    /// Record a successful login and tell the other tabs.
    pub fn mark_authenticated(&self, profile: Option<Value>) {
        self.inner.set_authenticated(profile);
    }

    pub fn logout(&self) {
        self.end_session("logout");
    }

    fn end_session(&self, reason: &str) {
        self.inner.shared().session = Session::default();
        self.inner.publish(keys::SESSION_ENDED, json!({ "reason": reason }));
    }

    fn is_unauthorized(&self, status: u16) -> bool {
        self.inner.config.unauthorized_statuses.contains(&status)
    }
}

impl GuardInner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, key: &str, value: Value) {
        if let Some(bus) = &self.bus {
            bus.publish(key, value);
        }
    }

    fn set_authenticated(&self, profile: Option<Value>) {
        self.shared().session = Session {
            authenticated: true,
            profile: profile.clone(),
        };
        self.publish(
            keys::SESSION_CHANGED,
            json!({ "authenticated": true, "profile": profile }),
        );
    }
}

/// Apply session transitions published by other tabs. Never refreshes.
fn follow_other_tabs(bus: &StateBus, guard: Weak<GuardInner>) {
    let ended = guard.clone();
    bus.subscribe(
        keys::SESSION_ENDED,
        SubscribeOptions::default(),
        move |event: &SyncEvent| {
            if !event.is_broadcast() {
                return;
            }
            if let Some(inner) = ended.upgrade() {
                tracing::info!("session ended in another tab");
                inner.shared().session = Session::default();
            }
        },
    );

    bus.subscribe(
        keys::SESSION_CHANGED,
        SubscribeOptions::default(),
        move |event: &SyncEvent| {
            if !event.is_broadcast() {
                return;
            }
            if let Some(inner) = guard.upgrade() {
                let authenticated = event
                    .value
                    .get("authenticated")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let profile = event.value.get("profile").filter(|p| !p.is_null()).cloned();
                inner.shared().session = Session {
                    authenticated,
                    profile,
                };
            }
        },
    );
}

async fn run_refresh(inner: Arc<GuardInner>) {
    tracing::info!("session expired; refreshing");
    inner.telemetry.record_refresh_started();

    match inner.refresher.refresh().await {
        Ok(profile) => {
            inner.telemetry.record_refresh_succeeded();
            inner.set_authenticated(profile);
            replay_pending(&inner).await;
        }
        Err(err) => {
            let reason = match &err {
                SessionError::RefreshFailed { reason } => reason.clone(),
                other => other.to_string(),
            };
            tracing::warn!(error = %reason, "session refresh failed; rejecting queued requests");
            inner.telemetry.record_refresh_failed(&reason);

            let pending = {
                let mut shared = inner.shared();
                shared.state = GuardState::Failed;
                shared.session = Session::default();
                std::mem::take(&mut shared.pending)
            };
            for parked in pending {
                let _ = parked.continuation.send(Err(SessionError::RefreshFailed {
                    reason: reason.clone(),
                }));
            }
            inner.publish(keys::SESSION_ENDED, json!({ "reason": "refresh_failed" }));

            // An unauthorized response that arrived meanwhile may already
            // have opened the next cycle.
            let mut shared = inner.shared();
            if shared.state == GuardState::Failed {
                shared.state = GuardState::Idle;
            }
        }
    }
}

/// Replay parked requests until none are left, then close the cycle.
async fn replay_pending(inner: &GuardInner) {
    loop {
        let batch = {
            let mut shared = inner.shared();
            if shared.pending.is_empty() {
                shared.state = GuardState::Idle;
                return;
            }
            std::mem::take(&mut shared.pending)
        };
        tracing::debug!(count = batch.len(), "replaying queued requests");

        // join_all polls in order, so replays are issued in FIFO order.
        join_all(batch.into_iter().map(|parked| async move {
            let PendingRequest {
                mut request,
                transport,
                queued_at,
                continuation,
            } = parked;
            request.retried = true;
            tracing::trace!(
                path = %request.path,
                waited_ms = queued_at.elapsed().as_millis() as u64,
                "replaying request"
            );
            let result = replay(inner, transport.as_ref(), request).await;
            let _ = continuation.send(result);
        }))
        .await;
    }
}

async fn replay(
    inner: &GuardInner,
    transport: &dyn Transport,
    request: ApiRequest,
) -> Result<ApiResponse> {
    let response = transport.send(&request).await?;
    if inner.config.unauthorized_statuses.contains(&response.status) {
        tracing::warn!(path = %request.path, "replay rejected after refresh");
        return Err(SessionError::Unauthorized { path: request.path });
    }
    finish(&request, response)
}

fn finish(request: &ApiRequest, response: ApiResponse) -> Result<ApiResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(SessionError::Http {
            path: request.path.clone(),
            status: response.status,
            body: response.body,
        })
    }
}

/// A transport whose requests go through the session guard.
#[derive(Clone)]
pub struct GuardedClient {
    guard: SessionGuard,
    transport: Arc<dyn Transport>,
}

impl GuardedClient {
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.guard.execute(&self.transport, request).await
    }

    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }
}
