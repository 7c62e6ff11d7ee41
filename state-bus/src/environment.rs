//! Page-visibility and connectivity signals.
//!
//! A backgrounded tab resynchronizes by reacting to `tab-visible` instead of
//! polling; stores re-validate on `network-online`. Signals are per tab, so
//! they are published locally and never broadcast.

use futures::Stream;
use futures::StreamExt;
use serde_json::json;

use crate::bus::StateBus;
use crate::event::SyncEvent;
use crate::event::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    TabVisible,
    NetworkOnline,
    NetworkOffline,
}

impl EnvironmentSignal {
    pub fn key(self) -> &'static str {
        match self {
            EnvironmentSignal::TabVisible => keys::TAB_VISIBLE,
            EnvironmentSignal::NetworkOnline => keys::NETWORK_ONLINE,
            EnvironmentSignal::NetworkOffline => keys::NETWORK_OFFLINE,
        }
    }
}

impl StateBus {
    /// Publish one environment transition as a first-class event.
    pub fn signal(&self, signal: EnvironmentSignal) -> SyncEvent {
        let value = match signal {
            EnvironmentSignal::TabVisible => json!({ "visible": true }),
            EnvironmentSignal::NetworkOnline => {
                self.set_online(true);
                json!({ "online": true })
            }
            EnvironmentSignal::NetworkOffline => {
                self.set_online(false);
                json!({ "online": false })
            }
        };
        tracing::debug!(key = signal.key(), "environment signal");
        self.publish_local(signal.key(), value)
    }

    /// Forward a host's stream of environment notifications until the
    /// stream ends or the bus shuts down.
    pub fn attach_environment<S>(&self, signals: S)
    where
        S: Stream<Item = EnvironmentSignal> + Send + 'static,
    {
        let bus = self.downgrade();
        let shutdown = self.shutdown_token();
        tokio::spawn(async move {
            let mut signals = std::pin::pin!(signals);
            loop {
                let signal = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = signals.next() => match next {
                        Some(signal) => signal,
                        None => break,
                    },
                };
                let Some(inner) = bus.upgrade() else {
                    break;
                };
                StateBus::from_inner(inner).signal(signal);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::subscription::SubscribeOptions;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn network_signals_toggle_online_flag() {
        let bus = StateBus::local(BusConfig::default());
        assert!(bus.is_online());

        bus.signal(EnvironmentSignal::NetworkOffline);
        assert!(!bus.is_online());

        bus.signal(EnvironmentSignal::NetworkOnline);
        assert!(bus.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn attached_stream_publishes_events() {
        let bus = StateBus::local(BusConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for signal in [
            EnvironmentSignal::TabVisible,
            EnvironmentSignal::NetworkOffline,
            EnvironmentSignal::NetworkOnline,
        ] {
            let sink = Arc::clone(&seen);
            bus.subscribe(signal.key(), SubscribeOptions::default(), move |event: &SyncEvent| {
                sink.lock().unwrap().push(event.key.clone());
            });
        }

        bus.attach_environment(futures::stream::iter(vec![
            EnvironmentSignal::NetworkOffline,
            EnvironmentSignal::NetworkOnline,
            EnvironmentSignal::TabVisible,
        ]));
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                keys::NETWORK_OFFLINE.to_string(),
                keys::NETWORK_ONLINE.to_string(),
                keys::TAB_VISIBLE.to_string(),
            ]
        );
        assert!(bus.is_online());
    }
}
