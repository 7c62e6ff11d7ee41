//! Layered configuration loader
//!
//! Precedence, later layers win:
//! 1. Defaults
//! 2. TOML file (explicit path, or `$STOREFRONT_CONFIG`)
//! 3. Environment overrides (`STOREFRONT_<SECTION>_<FIELD>`)
//!
//! ```no_run
//! use storefront_client::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_file("storefront.toml")
//!     .load()?;
//! # Ok::<(), storefront_client::config::ConfigError>(())
//! ```

use std::env;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use storefront_resilience::NotificationConfig;
use storefront_resilience::RetryConfig;
use storefront_resilience::TelemetryConfig;
use storefront_session::SessionConfig;
use storefront_session::TransportConfig;
use storefront_state_bus::BusConfig;

pub const DEFAULT_ENV_PREFIX: &str = "STOREFRONT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parsing error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),

    #[error("invalid value for ${var}: '{value}' (expected: {expected})")]
    InvalidEnvValue {
        var: String,
        value: String,
        expected: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorefrontConfig {
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub bus: BusConfig,
    pub telemetry: TelemetryConfig,
    pub notifications: NotificationConfig,
    pub transport: TransportConfig,
}

impl StorefrontConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;

        if self.session.unauthorized_statuses.is_empty() {
            return Err(ConfigError::Validation(
                "session.unauthorized_statuses must not be empty".to_string(),
            ));
        }
        if let Some(status) = self
            .session
            .unauthorized_statuses
            .iter()
            .find(|status| !(400..500).contains(*status))
        {
            return Err(ConfigError::Validation(format!(
                "session.unauthorized_statuses must be 4xx codes, got {status}"
            )));
        }
        if !self.session.refresh_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "session.refresh_path must start with '/', got {:?}",
                self.session.refresh_path
            )));
        }
        if self.bus.channel_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "bus.channel_name must not be empty".to_string(),
            ));
        }
        if self.telemetry.error_window_secs == 0 || self.telemetry.error_rate_threshold == 0 {
            return Err(ConfigError::Validation(
                "telemetry.error_window_secs and telemetry.error_rate_threshold must be positive"
                    .to_string(),
            ));
        }
        if self.transport.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "transport.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    skip_file: bool,
    skip_env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            skip_file: false,
            skip_env: false,
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn skip_file_layer(mut self) -> Self {
        self.skip_file = true;
        self
    }

    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn load(self) -> Result<StorefrontConfig, ConfigError> {
        let mut config = StorefrontConfig::default();

        if !self.skip_file
            && let Some(path) = self.resolve_file()
        {
            config = Self::load_from_file(&path)?;
        }

        if !self.skip_env {
            Self::apply_env_overrides(&mut config, &self.env_prefix)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn resolve_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.file {
            return Some(path.clone());
        }
        env::var(format!("{}_CONFIG", self.env_prefix))
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
    }

    /// A missing file yields the defaults.
    pub fn load_from_file(path: &Path) -> Result<StorefrontConfig, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found; using defaults");
                return Ok(StorefrontConfig::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(toml::from_str(&contents)?)
    }

    pub fn apply_env_overrides(
        config: &mut StorefrontConfig,
        prefix: &str,
    ) -> Result<(), ConfigError> {
        let env = EnvLayer { prefix };

        if let Some(value) = env.parse("RETRY_MAX_RETRIES", "unsigned integer")? {
            config.retry.max_retries = value;
        }
        if let Some(value) = env.parse("RETRY_BASE_DELAY_MS", "milliseconds")? {
            config.retry.base_delay_ms = value;
        }
        if let Some(value) = env.parse("RETRY_MAX_DELAY_MS", "milliseconds")? {
            config.retry.max_delay_ms = value;
        }
        if let Some(value) = env.parse("RETRY_JITTER_FACTOR", "number between 0 and 1")? {
            config.retry.jitter_factor = value;
        }

        if let Some(value) = env.string("SESSION_REFRESH_PATH") {
            config.session.refresh_path = value;
        }
        if let Some(raw) = env.string("SESSION_UNAUTHORIZED_STATUSES") {
            config.session.unauthorized_statuses = raw
                .split(',')
                .map(|part| {
                    part.trim()
                        .parse::<u16>()
                        .map_err(|_| env.invalid("SESSION_UNAUTHORIZED_STATUSES", &raw, "comma-separated status codes"))
                })
                .collect::<Result<_, _>>()?;
        }

        if let Some(value) = env.bool("BUS_BROADCAST_ENABLED")? {
            config.bus.broadcast_enabled = value;
        }
        if let Some(value) = env.string("BUS_CHANNEL_NAME") {
            config.bus.channel_name = value;
        }
        if let Some(value) = env.parse("BUS_DEFAULT_DEBOUNCE_MS", "milliseconds")? {
            config.bus.default_debounce_ms = value;
        }

        if let Some(value) = env.parse("TELEMETRY_ALERT_TTL_SECS", "seconds")? {
            config.telemetry.alert_ttl_secs = value;
        }
        if let Some(value) = env.parse("TELEMETRY_ERROR_WINDOW_SECS", "seconds")? {
            config.telemetry.error_window_secs = value;
        }
        if let Some(value) = env.parse("TELEMETRY_ERROR_RATE_THRESHOLD", "unsigned integer")? {
            config.telemetry.error_rate_threshold = value;
        }

        if let Some(value) = env.parse("NOTIFICATIONS_LOW_DISMISS_MS", "milliseconds")? {
            config.notifications.low_dismiss_ms = value;
        }
        if let Some(value) = env.parse("NOTIFICATIONS_MEDIUM_DISMISS_MS", "milliseconds")? {
            config.notifications.medium_dismiss_ms = value;
        }

        if let Some(value) = env.string("TRANSPORT_BASE_URL") {
            config.transport.base_url = value;
        }
        if let Some(value) = env.parse("TRANSPORT_TIMEOUT_MS", "milliseconds")? {
            config.transport.timeout_ms = value;
        }

        Ok(())
    }
}

struct EnvLayer<'a> {
    prefix: &'a str,
}

impl EnvLayer<'_> {
    fn var_name(&self, name: &str) -> String {
        format!("{}_{name}", self.prefix)
    }

    fn string(&self, name: &str) -> Option<String> {
        let var = self.var_name(name);
        let value = env::var(&var).ok().filter(|value| !value.trim().is_empty())?;
        tracing::debug!(%var, %value, "applying env override");
        Some(value)
    }

    fn parse<T: FromStr>(&self, name: &str, expected: &str) -> Result<Option<T>, ConfigError> {
        match self.string(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(name, &raw, expected)),
            None => Ok(None),
        }
    }

    fn bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.string(name) else {
            return Ok(None);
        };
        match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(self.invalid(name, &raw, "true/false, 1/0, yes/no, on/off")),
        }
    }

    fn invalid(&self, name: &str, value: &str, expected: &str) -> ConfigError {
        ConfigError::InvalidEnvValue {
            var: self.var_name(name),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}
