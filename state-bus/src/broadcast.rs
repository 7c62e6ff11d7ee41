//! Cross-tab broadcast capability.
//!
//! A browser exposes a named channel that every same-origin tab can post to
//! and listen on; a message is never delivered back to the tab that posted
//! it. Hosts without such a primitive use [`NoopBroadcast`] and the bus
//! degrades to single-tab operation.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::BusError;
use crate::event::SyncEvent;

pub trait BroadcastChannel: Send + Sync {
    /// Channel name; tabs only hear posts made on the same name.
    fn name(&self) -> &str;

    /// Deliver `event` to every other tab listening on this channel.
    fn post(&self, event: &SyncEvent) -> Result<(), BusError>;

    /// Stream of events posted by other tabs, or `None` when the host has no
    /// broadcast primitive.
    fn listen(&self) -> Option<BoxStream<'static, SyncEvent>>;
}

/// Single-tab fallback.
#[derive(Debug, Default, Clone)]
pub struct NoopBroadcast;

impl BroadcastChannel for NoopBroadcast {
    fn name(&self) -> &str {
        "noop"
    }

    fn post(&self, _event: &SyncEvent) -> Result<(), BusError> {
        Ok(())
    }

    fn listen(&self) -> Option<BoxStream<'static, SyncEvent>> {
        None
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    channel: String,
    sender: String,
    payload: String,
}

/// In-process stand-in for the browser's broadcast primitive.
///
/// Every channel opened from the same hub behaves like one tab: posts are
/// serialized to JSON, fanned out to all other channels with the same name
/// and skipped for the posting channel itself.
#[derive(Debug, Clone)]
pub struct MemoryBroadcastHub {
    tx: broadcast::Sender<Envelope>,
}

impl Default for MemoryBroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryBroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Open a channel for one tab.
    pub fn open(&self, name: &str) -> Arc<MemoryBroadcastChannel> {
        Arc::new(MemoryBroadcastChannel {
            name: name.to_string(),
            tab_id: uuid::Uuid::new_v4().to_string(),
            tx: self.tx.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryBroadcastChannel {
    name: String,
    tab_id: String,
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastChannel for MemoryBroadcastChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, event: &SyncEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        // No listeners means no other tab is open.
        let _ = self.tx.send(Envelope {
            channel: self.name.clone(),
            sender: self.tab_id.clone(),
            payload,
        });
        Ok(())
    }

    fn listen(&self) -> Option<BoxStream<'static, SyncEvent>> {
        let name = self.name.clone();
        let tab_id = self.tab_id.clone();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |message| {
            let decoded = match message {
                Ok(envelope) if envelope.channel == name && envelope.sender != tab_id => {
                    match serde_json::from_str::<SyncEvent>(&envelope.payload) {
                        Ok(event) => Some(event),
                        Err(err) => {
                            tracing::warn!(channel = %name, error = %err, "dropping undecodable broadcast");
                            None
                        }
                    }
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %name, skipped, "broadcast listener lagged");
                    None
                }
            };
            futures::future::ready(decoded)
        });
        Some(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use crate::event::EventSource;
    use crate::event::Version;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn event(key: &str) -> SyncEvent {
        SyncEvent {
            key: key.to_string(),
            value: json!({"n": 1}),
            metadata: EventMetadata {
                timestamp: chrono::Utc::now(),
                source: EventSource::Broadcast,
                version: Version {
                    millis: 1,
                    sequence: 1,
                    origin: "tab-a".to_string(),
                },
            },
        }
    }

    #[tokio::test]
    async fn posts_reach_other_tabs_but_not_the_sender() {
        let hub = MemoryBroadcastHub::default();
        let tab_a = hub.open("sync");
        let tab_b = hub.open("sync");
        let mut a_rx = tab_a.listen().unwrap();
        let mut b_rx = tab_b.listen().unwrap();

        tab_a.post(&event("cart")).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), b_rx.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event("cart"));

        let echoed = tokio::time::timeout(Duration::from_millis(50), a_rx.next()).await;
        assert!(echoed.is_err(), "sender must not hear its own post");
    }

    #[tokio::test]
    async fn channels_with_other_names_are_isolated() {
        let hub = MemoryBroadcastHub::default();
        let sender = hub.open("sync");
        let other = hub.open("unrelated");
        let mut rx = other.listen().unwrap();

        sender.post(&event("cart")).unwrap();

        let received = tokio::time::timeout(Duration::from_millis(50), rx.next()).await;
        assert!(received.is_err());
    }

    #[test]
    fn noop_has_no_listener() {
        assert!(NoopBroadcast.listen().is_none());
        assert!(NoopBroadcast.post(&event("cart")).is_ok());
    }
}
