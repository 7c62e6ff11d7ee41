//! The state bus itself: publish, drain, dispatch and cross-tab relay.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastChannel;
use crate::broadcast::NoopBroadcast;
use crate::config::BusConfig;
use crate::event::EventMetadata;
use crate::event::EventSource;
use crate::event::SyncEvent;
use crate::event::Version;
use crate::subscription::Callback;
use crate::subscription::SubscribeOptions;
use crate::subscription::Subscriber;
use crate::subscription::Subscription;

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct BusCounters {
    pub(crate) published: Counter,
    pub(crate) posted: Counter,
    pub(crate) received: Counter,
    pub(crate) stale_dropped: Counter,
    pub(crate) delivered: Counter,
    pub(crate) skipped_duplicates: Counter,
    pub(crate) failed_deliveries: Counter,
}

/// Point-in-time copy of the bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub posted: u64,
    pub received: u64,
    pub stale_dropped: u64,
    pub delivered: u64,
    pub skipped_duplicates: u64,
    pub failed_deliveries: u64,
}

#[derive(Default)]
struct DrainQueue {
    events: VecDeque<SyncEvent>,
    draining: bool,
}

/// Publish/subscribe store synchronization for one tab.
///
/// Cloning is cheap and every clone refers to the same bus. Construction
/// and publishing spawn Tokio tasks, so both must happen inside a runtime.
#[derive(Clone)]
pub struct StateBus {
    inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
    origin: String,
    config: BusConfig,
    channel: Arc<dyn BroadcastChannel>,
    next_subscriber_id: AtomicU64,
    sequence: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<Arc<Subscriber>>>>,
    queue: Mutex<DrainQueue>,
    latest: Mutex<HashMap<String, SyncEvent>>,
    online: AtomicBool,
    counters: Arc<BusCounters>,
    shutdown: CancellationToken,
}

impl StateBus {
    /// Bus with no cross-tab reach.
    pub fn local(config: BusConfig) -> Self {
        Self::new(config, Arc::new(NoopBroadcast))
    }

    pub fn new(config: BusConfig, channel: Arc<dyn BroadcastChannel>) -> Self {
        let inner = Arc::new(BusInner {
            origin: uuid::Uuid::new_v4().simple().to_string(),
            config,
            channel,
            next_subscriber_id: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
            queue: Mutex::new(DrainQueue::default()),
            latest: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            counters: Arc::new(BusCounters::default()),
            shutdown: CancellationToken::new(),
        });

        if inner.config.broadcast_enabled {
            match inner.channel.listen() {
                Some(stream) => spawn_listener(&inner, stream),
                None => tracing::debug!(
                    channel = inner.channel.name(),
                    "broadcast unavailable; bus runs single-tab"
                ),
            }
        }

        Self { inner }
    }

    /// Identifier of this tab, embedded in every version it mints.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn subscribe<F>(&self, key: &str, options: SubscribeOptions, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let debounce = options
            .debounce
            .unwrap_or_else(|| self.inner.config.default_debounce());
        let subscriber = Subscriber::spawn(
            id,
            key,
            callback,
            debounce,
            options.skip_duplicates,
            Arc::clone(&self.inner.counters),
            self.inner.shutdown.child_token(),
        );

        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push(subscriber);

        Subscription {
            bus: Arc::downgrade(&self.inner),
            key: key.to_string(),
            id,
        }
    }

    /// Publish a locally originated value and relay it to other tabs.
    pub fn publish(&self, key: &str, value: Value) -> SyncEvent {
        self.inner.publish(key, value, self.inner.config.broadcast_enabled)
    }

    /// Publish to this tab's subscribers only.
    pub fn publish_local(&self, key: &str, value: Value) -> SyncEvent {
        self.inner.publish(key, value, false)
    }

    /// Last value applied for `key`, from either this tab or a broadcast.
    pub fn current(&self, key: &str) -> Option<Value> {
        self.inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|event| event.value.clone())
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::Release);
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<BusInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.get(),
            posted: c.posted.get(),
            received: c.received.get(),
            stale_dropped: c.stale_dropped.get(),
            delivered: c.delivered.get(),
            skipped_duplicates: c.skipped_duplicates.get(),
            failed_deliveries: c.failed_deliveries.get(),
        }
    }

    /// Stop the broadcast listener, environment forwarders and debounce
    /// workers. Buffered debounced values are discarded.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl BusInner {
    fn next_version(&self) -> Version {
        Version {
            millis: Utc::now().timestamp_millis(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            origin: self.origin.clone(),
        }
    }

    fn publish(self: &Arc<Self>, key: &str, value: Value, broadcast: bool) -> SyncEvent {
        let event = SyncEvent {
            key: key.to_string(),
            value,
            metadata: EventMetadata {
                timestamp: Utc::now(),
                source: EventSource::Local,
                version: self.next_version(),
            },
        };
        self.counters.published.increment();

        // Only locally originated events are ever posted.
        if broadcast {
            match self.channel.post(&event.as_broadcast()) {
                Ok(()) => self.counters.posted.increment(),
                Err(err) => tracing::warn!(
                    key,
                    channel = self.channel.name(),
                    error = %err,
                    "broadcast post failed; delivering locally only"
                ),
            }
        }

        self.record_latest(&event);
        self.enqueue(event.clone());
        event
    }

    /// Apply an event relayed from another tab. Never re-posted.
    pub(crate) fn receive_remote(self: &Arc<Self>, mut event: SyncEvent) {
        event.metadata.source = EventSource::Broadcast;
        self.counters.received.increment();

        {
            let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(applied) = latest.get(&event.key)
                && applied.metadata.version >= event.metadata.version
            {
                self.counters.stale_dropped.increment();
                tracing::debug!(
                    key = %event.key,
                    version = %event.metadata.version,
                    applied = %applied.metadata.version,
                    "dropping stale broadcast"
                );
                return;
            }
        }

        self.record_latest(&event);
        self.enqueue(event);
    }

    fn record_latest(&self, event: &SyncEvent) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.key.clone(), event.clone());
    }

    fn enqueue(self: &Arc<Self>, event: SyncEvent) {
        let start_drain = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.events.push_back(event);
            !std::mem::replace(&mut queue.draining, true)
        };

        if start_drain {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.drain() });
        }
    }

    /// The single active drain loop.
    fn drain(&self) {
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                let next = queue.events.pop_front();
                if next.is_none() {
                    queue.draining = false;
                }
                next
            };
            let Some(event) = next else {
                return;
            };
            self.dispatch(&event);
        }
    }

    fn dispatch(&self, event: &SyncEvent) {
        // Snapshot so callbacks may subscribe or unsubscribe freely.
        let snapshot: Vec<Arc<Subscriber>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.key)
            .cloned()
            .unwrap_or_default();

        for subscriber in snapshot.iter().filter(|s| s.is_active()) {
            subscriber.dispatch(event);
        }
    }

    pub(crate) fn remove_subscriber(&self, key: &str, id: u64) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(registered) = subscribers.get_mut(key) else {
            return false;
        };
        let Some(position) = registered.iter().position(|s| s.id == id) else {
            return false;
        };
        let removed = registered.remove(position);
        removed.deactivate();
        if registered.is_empty() {
            subscribers.remove(key);
        }
        true
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_listener(inner: &Arc<BusInner>, mut stream: BoxStream<'static, SyncEvent>) {
    let bus = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(inner) = bus.upgrade() else {
                break;
            };
            inner.receive_remote(event);
        }
        tracing::debug!("broadcast listener stopped");
    });
}
