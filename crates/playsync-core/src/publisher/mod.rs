// ── Event publisher ──
//
// Two delivery contracts over the same event bus:
//
// - `notify_async`: fire and forget. Failures are counted, never returned.
// - `publish_with_fallback`: bus first, store second. Only the failure of
//   both paths reaches the caller.
//
// `flush_until_complete` (see `flush.rs`) tells the caller when async
// deliveries have actually settled downstream.

mod bus;
mod flush;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::model::PlaybackEvent;
use crate::store::EventStore;

pub use bus::ChannelBus;
pub use flush::{FlushConfig, FlushOutcome};

// ── Bus contract ─────────────────────────────────────────────────────

/// Delivery counters a bus backend may expose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub events_received: u64,
    pub events_flushed: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub buffer_size: usize,
}

impl BusStats {
    pub fn pending(&self) -> u64 {
        self.events_received.saturating_sub(self.events_flushed)
    }
}

pub trait EventBus: Send + Sync {
    fn publish<'a>(&'a self, event: &'a PlaybackEvent) -> BoxFuture<'a, Result<(), CoreError>>;

    /// Push buffered events downstream. Backends without a buffer keep the
    /// default no-op.
    fn flush(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async { Ok(()) })
    }

    /// `None` when the backend cannot report delivery progress.
    fn stats(&self) -> Option<BusStats> {
        None
    }
}

/// Which path made an event durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Bus,
    StoreFallback,
}

// ── In-flight ledger ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Ledger {
    in_flight: AtomicUsize,
    idle: Notify,
    async_errors: AtomicU64,
}

/// Decrements the in-flight count when the publish task ends, even if it
/// panics.
struct InFlightGuard(Arc<Ledger>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// ── EventPublisher ───────────────────────────────────────────────────

pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    store: Option<Arc<dyn EventStore>>,
    flush: FlushConfig,
    ledger: Arc<Ledger>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            store: None,
            flush: FlushConfig::default(),
            ledger: Arc::new(Ledger::default()),
        }
    }

    /// Store used when the bus rejects a synchronous publish.
    #[must_use]
    pub fn with_fallback(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_flush_config(mut self, flush: FlushConfig) -> Self {
        self.flush = flush;
        self
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn flush_config(&self) -> &FlushConfig {
        &self.flush
    }

    /// Async publishes that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.ledger.in_flight.load(Ordering::Acquire)
    }

    /// Background publish failures since construction or the last reset.
    pub fn async_publish_errors(&self) -> u64 {
        self.ledger.async_errors.load(Ordering::Relaxed)
    }

    /// Reset the background failure counter. Intended for tests.
    pub fn reset_async_publish_errors(&self) {
        self.ledger.async_errors.store(0, Ordering::Relaxed);
    }

    /// Publish in a background task and return immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn notify_async(&self, event: PlaybackEvent) {
        self.ledger.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(Arc::clone(&self.ledger));
        let bus = Arc::clone(&self.bus);

        tokio::spawn(async move {
            if let Err(e) = bus.publish(&event).await {
                let total = guard.0.async_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event_id = %event.id,
                    session_key = %event.session_key,
                    error = %e,
                    total_errors = total,
                    "async publish failed"
                );
            }
            drop(guard);
        });
    }

    /// Publish synchronously, falling back to a direct store write.
    ///
    /// The correlation key is attached before the first attempt so both
    /// paths reconcile downstream. Returns `DeliveryFailed` only when the
    /// bus and the store both failed.
    pub async fn publish_with_fallback(&self, mut event: PlaybackEvent) -> Result<Delivery, CoreError> {
        let correlation_key = event.ensure_correlation_key().to_owned();
        debug!(session_key = %event.session_key, %correlation_key, "publishing event");

        let bus_err = match self.bus.publish(&event).await {
            Ok(()) => return Ok(Delivery::Bus),
            Err(e) => e,
        };
        warn!(error = %bus_err, %correlation_key, "bus publish failed, writing to store directly");

        let Some(store) = &self.store else {
            error!(
                critical = true,
                event_id = %event.id,
                %correlation_key,
                bus_error = %bus_err,
                "event lost: bus publish failed and no fallback store is configured"
            );
            return Err(CoreError::DeliveryFailed {
                correlation_key,
                bus: bus_err.to_string(),
                store: "no fallback store configured".into(),
            });
        };

        match store.insert_event(&event).await {
            Ok(()) => {
                info!(event_id = %event.id, %correlation_key, "event saved via store fallback");
                Ok(Delivery::StoreFallback)
            }
            Err(store_err) => {
                error!(
                    critical = true,
                    event_id = %event.id,
                    %correlation_key,
                    bus_error = %bus_err,
                    store_error = %store_err,
                    "event lost: bus publish and store fallback both failed"
                );
                Err(CoreError::DeliveryFailed {
                    correlation_key,
                    bus: bus_err.to_string(),
                    store: store_err.to_string(),
                })
            }
        }
    }

    /// Wait until every `notify_async` task has finished.
    ///
    /// Returns `false` on timeout or cancellation.
    pub async fn wait_for_in_flight(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        let drained = async {
            loop {
                let notified = self.ledger.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            res = tokio::time::timeout(timeout, drained) => res.is_ok(),
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("has_fallback", &self.store.is_some())
            .field("in_flight", &self.in_flight())
            .field("async_errors", &self.async_publish_errors())
            .finish_non_exhaustive()
    }
}
