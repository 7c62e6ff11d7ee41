//! Subscriber registrations and per-subscription debouncing.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::BusCounters;
use crate::bus::BusInner;
use crate::event::SyncEvent;

pub(crate) type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Quiet period before a buffered value is flushed. `None` uses the
    /// bus default; zero delivers on the drain tick.
    pub debounce: Option<Duration>,
    /// Skip a delivery whose value equals the last one delivered.
    pub skip_duplicates: bool,
}

impl SubscribeOptions {
    pub fn debounced(debounce: Duration) -> Self {
        Self {
            debounce: Some(debounce),
            ..Self::default()
        }
    }

    pub fn skip_duplicates(mut self) -> Self {
        self.skip_duplicates = true;
        self
    }
}

pub(crate) struct Subscriber {
    pub(crate) id: u64,
    callback: Callback,
    skip_duplicates: bool,
    last_value: Mutex<Option<Value>>,
    active: AtomicBool,
    debounce_tx: Option<mpsc::UnboundedSender<SyncEvent>>,
    counters: Arc<BusCounters>,
}

impl Subscriber {
    /// Build a subscriber; debounced ones get a worker task that owns the
    /// receiving end of their buffer.
    pub(crate) fn spawn(
        id: u64,
        key: &str,
        callback: Callback,
        debounce: Duration,
        skip_duplicates: bool,
        counters: Arc<BusCounters>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        if debounce.is_zero() {
            return Arc::new(Self {
                id,
                callback,
                skip_duplicates,
                last_value: Mutex::new(None),
                active: AtomicBool::new(true),
                debounce_tx: None,
                counters,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Arc::new(Self {
            id,
            callback,
            skip_duplicates,
            last_value: Mutex::new(None),
            active: AtomicBool::new(true),
            debounce_tx: Some(tx),
            counters,
        });
        tokio::spawn(debounce_worker(
            key.to_string(),
            Arc::downgrade(&subscriber),
            rx,
            debounce,
            shutdown,
        ));
        subscriber
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Called by the drain loop, in publish order.
    pub(crate) fn dispatch(&self, event: &SyncEvent) {
        match &self.debounce_tx {
            Some(tx) => {
                // Closed only while the subscriber is being torn down.
                let _ = tx.send(event.clone());
            }
            None => self.deliver(event),
        }
    }

    fn deliver(&self, event: &SyncEvent) {
        if !self.is_active() {
            return;
        }

        {
            let mut last = self
                .last_value
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.skip_duplicates && last.as_ref() == Some(&event.value) {
                self.counters.skipped_duplicates.increment();
                return;
            }
            *last = Some(event.value.clone());
        }

        let callback = Arc::clone(&self.callback);
        match std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
            Ok(()) => self.counters.delivered.increment(),
            Err(_) => {
                self.counters.failed_deliveries.increment();
                tracing::error!(
                    key = %event.key,
                    subscriber = self.id,
                    "subscriber callback panicked; continuing with remaining subscribers"
                );
            }
        }
    }
}

async fn debounce_worker(
    key: String,
    subscriber: Weak<Subscriber>,
    mut rx: mpsc::UnboundedReceiver<SyncEvent>,
    debounce: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = rx.recv() => next,
        };
        let Some(mut latest) = first else {
            return;
        };

        // Every new value restarts the quiet period.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                next = rx.recv() => match next {
                    Some(event) => latest = event,
                    None => return,
                },
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        match subscriber.upgrade() {
            Some(subscriber) => subscriber.deliver(&latest),
            None => {
                tracing::debug!(%key, "debounced subscriber dropped before flush");
                return;
            }
        }
    }
}

/// Handle returned by [`crate::StateBus::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) bus: Weak<BusInner>,
    pub(crate) key: String,
    pub(crate) id: u64,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove this registration only. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove_subscriber(&self.key, self.id),
            None => false,
        }
    }
}
