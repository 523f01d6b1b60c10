// In-process event bus on a bounded Tokio mpsc channel.
//
// `publish` waits for channel capacity, so a slow consumer pushes back on
// publishers instead of dropping events. `spawn_store_consumer` plays the
// downstream writer: it drains the channel into an `EventStore` and
// advances the flushed counter, so the flush protocol has real numbers to
// converge on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BusStats, EventBus};
use crate::error::CoreError;
use crate::model::PlaybackEvent;
use crate::store::EventStore;

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    flushed: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Counters {
    fn record_error(&self, message: String) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }
}

#[derive(Debug)]
pub struct ChannelBus {
    tx: mpsc::Sender<PlaybackEvent>,
    /// Parked here until a consumer takes it.
    rx: Mutex<Option<mpsc::Receiver<PlaybackEvent>>>,
    counters: Arc<Counters>,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            counters: Arc::new(Counters::default()),
        }
    }

    fn has_consumer(&self) -> bool {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Drain the bus into `store` until `cancel` fires or every sender is gone.
    ///
    /// On cancellation the channel is closed and whatever it still buffers
    /// is written before the task exits. A bus has a single consumer.
    pub fn spawn_store_consumer(
        &self,
        store: Arc<dyn EventStore>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, CoreError> {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| CoreError::Bus {
                message: "event bus already has a consumer".into(),
            })?;
        let counters = Arc::clone(&self.counters);

        Ok(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        rx.close();
                        None
                    }
                    msg = rx.recv() => msg,
                };
                let Some(event) = event else { break };
                store_one(store.as_ref(), &counters, &event).await;
            }

            // Closed: publishers now fail over, buffered events still land
            let mut drained = 0_u32;
            while let Some(event) = rx.recv().await {
                store_one(store.as_ref(), &counters, &event).await;
                drained += 1;
            }
            debug!(drained, "bus consumer exiting");
        }))
    }
}

async fn store_one(store: &dyn EventStore, counters: &Counters, event: &PlaybackEvent) {
    match store.insert_event(event).await {
        Ok(()) => {
            counters.flushed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            warn!(session_key = %event.session_key, error = %e, "bus consumer insert failed");
            counters.record_error(e.to_string());
        }
    }
}

impl EventBus for ChannelBus {
    fn publish<'a>(&'a self, event: &'a PlaybackEvent) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            if !self.has_consumer() {
                return Err(CoreError::Bus {
                    message: "no consumer attached to the event bus".into(),
                });
            }

            // Count before sending so the consumer can never get ahead of it
            self.counters.received.fetch_add(1, Ordering::Relaxed);
            if self.tx.send(event.clone()).await.is_err() {
                self.counters.received.fetch_sub(1, Ordering::Relaxed);
                return Err(CoreError::Bus {
                    message: "event bus consumer has stopped".into(),
                });
            }
            Ok(())
        })
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async {
            tokio::task::yield_now().await;
            Ok(())
        })
    }

    fn stats(&self) -> Option<BusStats> {
        Some(BusStats {
            events_received: self.counters.received.load(Ordering::Relaxed),
            events_flushed: self.counters.flushed.load(Ordering::Relaxed),
            error_count: self.counters.errors.load(Ordering::Relaxed),
            last_error: self
                .counters
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            buffer_size: self.tx.max_capacity() - self.tx.capacity(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::model::Source;
    use crate::publisher::{Delivery, EventPublisher};
    use crate::store::MemoryStore;

    fn event(key: &str) -> PlaybackEvent {
        PlaybackEvent::new(Source::Jellyfin, key, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn publish_without_consumer_fails() {
        let bus = ChannelBus::new(16);

        let err = bus.publish(&event("s1")).await.unwrap_err();
        assert!(matches!(err, CoreError::Bus { .. }));
        assert_eq!(bus.stats().unwrap().events_received, 0);
    }

    #[tokio::test]
    async fn second_consumer_is_rejected() {
        let bus = ChannelBus::new(4);
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();

        let first = bus.spawn_store_consumer(store.clone(), cancel.clone()).unwrap();
        assert!(bus.spawn_store_consumer(store, cancel.clone()).is_err());

        cancel.cancel();
        first.await.unwrap();
    }

    #[tokio::test]
    async fn consumer_drains_into_store_and_flush_converges() {
        let bus = Arc::new(ChannelBus::new(64));
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let consumer = bus.spawn_store_consumer(store.clone(), cancel.clone()).unwrap();

        let publisher = EventPublisher::new(bus.clone());
        for i in 0..10 {
            publisher.notify_async(event(&format!("s{i}")));
        }

        let outcome = publisher.flush_until_complete(&cancel).await;
        assert!(outcome.is_complete(), "{outcome:?}");
        assert_eq!(store.len(), 10);

        cancel.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn small_capacity_applies_back_pressure_instead_of_dropping() {
        let bus = Arc::new(ChannelBus::new(2));
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let consumer = bus.spawn_store_consumer(store.clone(), cancel.clone()).unwrap();
        let publisher = EventPublisher::new(bus.clone()).with_fallback(Arc::new(MemoryStore::new()));

        for i in 0..20 {
            let delivery = publisher.publish_with_fallback(event(&format!("s{i}"))).await.unwrap();
            assert_eq!(delivery, Delivery::Bus);
        }

        let outcome = publisher.flush_until_complete(&cancel).await;
        assert!(outcome.is_complete(), "{outcome:?}");
        assert_eq!(store.len(), 20);
        assert_eq!(bus.stats().unwrap().error_count, 0);

        cancel.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_consumer_writes_buffered_events_then_refuses_more() {
        let bus = ChannelBus::new(8);
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let consumer = bus.spawn_store_consumer(store.clone(), cancel.clone()).unwrap();

        for i in 0..3 {
            bus.publish(&event(&format!("s{i}"))).await.unwrap();
        }
        cancel.cancel();
        consumer.await.unwrap();

        assert_eq!(store.len(), 3);
        let stats = bus.stats().unwrap();
        assert_eq!((stats.events_received, stats.events_flushed), (3, 3));
        assert!(bus.publish(&event("late")).await.is_err());
    }
}
