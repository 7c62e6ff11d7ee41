//! Store synchronization bus for the storefront client.
//!
//! Components publish state transitions ("session changed", "error banner
//! visible", "network offline") under string keys; subscribers observe them
//! in publish order, optionally debounced. When a broadcast channel is
//! available the same events reach every other tab of the application, and
//! a tab that only had its events relayed never re-posts them.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod broadcast;
mod bus;
mod config;
mod environment;
mod error;
mod event;
mod subscription;

pub use broadcast::BroadcastChannel;
pub use broadcast::MemoryBroadcastChannel;
pub use broadcast::MemoryBroadcastHub;
pub use broadcast::NoopBroadcast;
pub use bus::BusStats;
pub use bus::StateBus;
pub use config::BusConfig;
pub use environment::EnvironmentSignal;
pub use error::BusError;
pub use event::EventMetadata;
pub use event::EventSource;
pub use event::SyncEvent;
pub use event::Version;
pub use event::keys;
pub use subscription::SubscribeOptions;
pub use subscription::Subscription;
