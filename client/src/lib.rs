//! Storefront client resiliency layer.
//!
//! [`StorefrontClient`] builds every component once and wires them
//! together: the state bus, telemetry, the retry scheduler, the error
//! handler and the session guard around the HTTP transport. Nothing is held
//! in globals; embed one client per application instance (per tab).

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;

use std::sync::Arc;

use anyhow::Context;
use storefront_resilience::ErrorHandler;
use storefront_resilience::HandleOptions;
use storefront_resilience::RawFailure;
use storefront_resilience::RetryClassifiable;
use storefront_resilience::RetryScheduler;
use storefront_resilience::Telemetry;
use storefront_session::ApiRequest;
use storefront_session::ApiResponse;
use storefront_session::EndpointRefresher;
use storefront_session::GuardedClient;
use storefront_session::ReqwestTransport;
use storefront_session::SessionError;
use storefront_session::SessionGuard;
use storefront_session::Transport;
use storefront_state_bus::BroadcastChannel;
use storefront_state_bus::NoopBroadcast;
use storefront_state_bus::StateBus;

pub use config::ConfigError;
pub use config::ConfigLoader;
pub use config::StorefrontConfig;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Clone)]
pub struct StorefrontClient {
    config: Arc<StorefrontConfig>,
    bus: StateBus,
    telemetry: Telemetry,
    errors: ErrorHandler,
    session: SessionGuard,
    api: GuardedClient,
}

impl StorefrontClient {
    /// Single-tab client over HTTP, configured from `config`.
    pub fn new(config: StorefrontConfig) -> anyhow::Result<Self> {
        Self::with_channel(config, Arc::new(NoopBroadcast))
    }

    /// Client over HTTP whose state bus reaches other tabs through
    /// `channel`.
    pub fn with_channel(
        config: StorefrontConfig,
        channel: Arc<dyn BroadcastChannel>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid storefront configuration")?;
        let transport = ReqwestTransport::new(&config.transport)
            .with_context(|| format!("building transport for {}", config.transport.base_url))?;
        Ok(Self::with_components(config, Arc::new(transport), channel))
    }

    pub fn with_components(
        config: StorefrontConfig,
        transport: Arc<dyn Transport>,
        channel: Arc<dyn BroadcastChannel>,
    ) -> Self {
        let bus = StateBus::new(config.bus.clone(), channel);
        let telemetry = Telemetry::new(config.telemetry.clone());
        let scheduler = RetryScheduler::new(config.retry.clone(), telemetry.clone());
        let errors = ErrorHandler::new(
            config.notifications.clone(),
            scheduler,
            telemetry.clone(),
            Some(bus.clone()),
        );
        let refresher = Arc::new(EndpointRefresher::new(
            Arc::clone(&transport),
            config.session.refresh_path.clone(),
        ));
        let session = SessionGuard::new(
            config.session.clone(),
            refresher,
            Some(bus.clone()),
            telemetry.clone(),
        );
        let api = session.wrap(transport);

        tracing::info!(
            origin = bus.origin(),
            base_url = %config.transport.base_url,
            broadcast = config.bus.broadcast_enabled,
            "storefront client ready"
        );

        Self {
            config: Arc::new(config),
            bus,
            telemetry,
            errors,
            session,
            api,
        }
    }

    pub fn config(&self) -> &StorefrontConfig {
        &self.config
    }

    pub fn bus(&self) -> &StateBus {
        &self.bus
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn errors(&self) -> &ErrorHandler {
        &self.errors
    }

    pub fn session(&self) -> &SessionGuard {
        &self.session
    }

    pub fn api(&self) -> &GuardedClient {
        &self.api
    }

    /// Send through the session guard, retrying retryable failures inline.
    ///
    /// The caller only sees an error once retries are exhausted or the
    /// failure is not retryable; that failure has already been recorded and
    /// surfaced, and its "Retry" action re-sends the same request.
    pub async fn send(
        &self,
        request: ApiRequest,
        options: HandleOptions,
    ) -> Result<ApiResponse, SessionError> {
        let manual = {
            let api = self.api.clone();
            let request = request.clone();
            move || {
                let api = api.clone();
                let request = request.clone();
                async move {
                    api.send(request)
                        .await
                        .map(|_| ())
                        .map_err(|err| err.to_raw_failure())
                }
            }
        };
        self.errors
            .run(options.on_retry(manual), || self.api.send(request.clone()))
            .await
    }

    /// Report a failure that did not come from [`StorefrontClient::send`].
    pub fn report(&self, failure: &RawFailure, options: HandleOptions) {
        self.errors.handle_error(failure, options);
    }

    pub fn shutdown(&self) {
        self.bus.shutdown();
    }
}
