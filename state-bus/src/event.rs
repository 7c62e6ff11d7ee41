//! Events carried by the bus and their ordering metadata.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Well-known event keys shared by the resiliency layer and its consumers.
pub mod keys {
    /// Session state changed (login, refresh, logout). Value is the session.
    pub const SESSION_CHANGED: &str = "session-changed";
    /// Session cleared after logout or an unrecoverable refresh failure.
    pub const SESSION_ENDED: &str = "session-ended";
    /// Error banner visibility and the number of surfaced errors.
    pub const ERROR_BANNER: &str = "error-banner";
    pub const TAB_VISIBLE: &str = "tab-visible";
    pub const NETWORK_ONLINE: &str = "network-online";
    pub const NETWORK_OFFLINE: &str = "network-offline";
}

/// Where an event entered this bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    /// Published by code running in this tab.
    Local,
    /// Relayed from another tab through the broadcast channel.
    Broadcast,
}

/// Client-generated, time-ordered token.
///
/// Ordering is by wall-clock millis, then by the publishing bus's sequence
/// number, then by origin so two tabs never produce equal versions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub millis: i64,
    pub sequence: u64,
    pub origin: String,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.millis, self.sequence, self.origin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub key: String,
    pub value: Value,
    pub metadata: EventMetadata,
}

impl SyncEvent {
    pub fn is_broadcast(&self) -> bool {
        self.metadata.source == EventSource::Broadcast
    }

    /// Copy of this event as it should appear to other tabs.
    pub(crate) fn as_broadcast(&self) -> SyncEvent {
        let mut event = self.clone();
        event.metadata.source = EventSource::Broadcast;
        event
    }
}
