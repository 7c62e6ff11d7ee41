use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Default name of the cross-tab channel shared by all tabs of one app.
pub const DEFAULT_CHANNEL_NAME: &str = "storefront-state-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Post locally published events to the broadcast channel.
    pub broadcast_enabled: bool,
    pub channel_name: String,
    /// Debounce applied by `SubscribeOptions::default()`.
    pub default_debounce_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broadcast_enabled: true,
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            default_debounce_ms: 0,
        }
    }
}

impl BusConfig {
    pub fn default_debounce(&self) -> Duration {
        Duration::from_millis(self.default_debounce_ms)
    }
}
