// ── Flush protocol ──
//
// Async delivery completion is not observable from the publishing side.
// When the bus reports statistics, wait for the received counter to stop
// moving, then flush until flushed catches up with received. Without
// statistics, sleep once and flush once.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{BusStats, EventPublisher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushConfig {
    /// Upper bound on each wait phase (in-flight drain, stability).
    pub verification_timeout: Duration,
    /// Stats poll period while waiting for stability.
    pub poll_interval: Duration,
    /// Consecutive unchanged polls that count as stable.
    pub stability_threshold: u32,
    pub max_flush_attempts: u32,
    /// Pause between flush cycles.
    pub cycle_delay: Duration,
    /// Delay before the single flush of a bus without statistics.
    pub fallback_delay: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            verification_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            stability_threshold: 5,
            max_flush_attempts: 30,
            cycle_delay: Duration::from_millis(500),
            fallback_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every received event was flushed.
    Complete { flushes: u32, received: u64, flushed: u64 },
    /// Attempts ran out with events still pending.
    Incomplete { flushes: u32, received: u64, flushed: u64 },
    /// The bus exposes no statistics; one flush was issued blindly.
    BestEffort,
    Cancelled,
}

impl FlushOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

impl EventPublisher {
    /// Block until async deliveries have settled downstream, or give up.
    pub async fn flush_until_complete(&self, cancel: &CancellationToken) -> FlushOutcome {
        let cfg = &self.flush;
        let started = Instant::now();

        if !self.wait_for_in_flight(cfg.verification_timeout, cancel).await {
            if cancel.is_cancelled() {
                return FlushOutcome::Cancelled;
            }
            warn!(in_flight = self.in_flight(), "async publishes still running, flushing anyway");
        }

        let Some(initial) = self.bus.stats() else {
            trace!("bus has no statistics, using delay-based flush");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return FlushOutcome::Cancelled,
                () = tokio::time::sleep(cfg.fallback_delay) => {}
            }
            if let Err(e) = self.bus.flush().await {
                debug!(error = %e, "flush failed (non-fatal)");
            }
            return FlushOutcome::BestEffort;
        };
        trace!(
            received = initial.events_received,
            flushed = initial.events_flushed,
            buffer = initial.buffer_size,
            errors = initial.error_count,
            "flush initial stats"
        );

        if !self.wait_for_stability(cancel).await {
            return FlushOutcome::Cancelled;
        }

        let mut flushes = 0;
        for attempt in 1..=cfg.max_flush_attempts {
            let stats = self.current_stats();
            if stats.pending() == 0 {
                debug!(
                    received = stats.events_received,
                    flushed = stats.events_flushed,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "all events flushed"
                );
                return FlushOutcome::Complete {
                    flushes,
                    received: stats.events_received,
                    flushed: stats.events_flushed,
                };
            }

            trace!(attempt, pending = stats.pending(), "flush attempt");
            if let Err(e) = self.bus.flush().await {
                debug!(error = %e, "flush failed (non-fatal)");
            }
            flushes += 1;

            tokio::select! {
                biased;
                () = cancel.cancelled() => return FlushOutcome::Cancelled,
                () = tokio::time::sleep(cfg.cycle_delay) => {}
            }
        }

        let stats = self.current_stats();
        if stats.pending() == 0 {
            return FlushOutcome::Complete {
                flushes,
                received: stats.events_received,
                flushed: stats.events_flushed,
            };
        }

        warn!(
            received = stats.events_received,
            flushed = stats.events_flushed,
            buffer = stats.buffer_size,
            errors = stats.error_count,
            last_error = stats.last_error.as_deref().unwrap_or_default(),
            "max flush attempts reached"
        );
        FlushOutcome::Incomplete {
            flushes,
            received: stats.events_received,
            flushed: stats.events_flushed,
        }
    }

    /// Poll until the received counter holds still for
    /// `stability_threshold` polls or the verification timeout passes.
    /// Returns `false` only on cancellation.
    async fn wait_for_stability(&self, cancel: &CancellationToken) -> bool {
        let cfg = &self.flush;
        let deadline = tokio::time::sleep(cfg.verification_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(cfg.poll_interval);
        ticker.tick().await;

        let mut last_received = self.current_stats().events_received;
        let mut stable = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return false,
                () = &mut deadline => {
                    trace!("stability timeout, proceeding with flush");
                    return true;
                }
                _ = ticker.tick() => {
                    let received = self.current_stats().events_received;
                    if received == last_received {
                        stable += 1;
                        if stable >= cfg.stability_threshold {
                            trace!(received, "event flow stabilized");
                            return true;
                        }
                    } else {
                        stable = 0;
                        last_received = received;
                    }
                }
            }
        }
    }

    fn current_stats(&self) -> BusStats {
        self.bus.stats().unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use futures_util::future::BoxFuture;

    use crate::error::CoreError;
    use crate::model::PlaybackEvent;
    use crate::publisher::EventBus;

    /// Reports 50 received; each flush writes up to `per_flush` events.
    struct DrainingBus {
        received: u64,
        flushed: AtomicU64,
        per_flush: u64,
        flush_calls: AtomicU32,
    }

    impl DrainingBus {
        fn new(received: u64, per_flush: u64) -> Self {
            Self {
                received,
                flushed: AtomicU64::new(0),
                per_flush,
                flush_calls: AtomicU32::new(0),
            }
        }
    }

    impl EventBus for DrainingBus {
        fn publish<'a>(&'a self, _: &'a PlaybackEvent) -> BoxFuture<'a, Result<(), CoreError>> {
            Box::pin(async { Ok(()) })
        }

        fn flush(&self) -> BoxFuture<'_, Result<(), CoreError>> {
            Box::pin(async move {
                self.flush_calls.fetch_add(1, Ordering::SeqCst);
                let next = (self.flushed.load(Ordering::SeqCst) + self.per_flush).min(self.received);
                self.flushed.store(next, Ordering::SeqCst);
                Ok(())
            })
        }

        fn stats(&self) -> Option<BusStats> {
            Some(BusStats {
                events_received: self.received,
                events_flushed: self.flushed.load(Ordering::SeqCst),
                ..BusStats::default()
            })
        }
    }

    struct StatlessBus {
        flush_calls: AtomicU32,
    }

    impl EventBus for StatlessBus {
        fn publish<'a>(&'a self, _: &'a PlaybackEvent) -> BoxFuture<'a, Result<(), CoreError>> {
            Box::pin(async { Ok(()) })
        }

        fn flush(&self) -> BoxFuture<'_, Result<(), CoreError>> {
            self.flush_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_flushed_matches_received() {
        let bus = Arc::new(DrainingBus::new(50, 17));
        let publisher = EventPublisher::new(bus.clone());

        let outcome = publisher.flush_until_complete(&CancellationToken::new()).await;

        assert_eq!(
            outcome,
            FlushOutcome::Complete {
                flushes: 3,
                received: 50,
                flushed: 50
            }
        );
        assert_eq!(bus.flush_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let bus = Arc::new(DrainingBus::new(50, 1));
        let publisher = EventPublisher::new(bus.clone()).with_flush_config(FlushConfig {
            max_flush_attempts: 4,
            ..FlushConfig::default()
        });

        let outcome = publisher.flush_until_complete(&CancellationToken::new()).await;

        assert_eq!(
            outcome,
            FlushOutcome::Incomplete {
                flushes: 4,
                received: 50,
                flushed: 4
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn statless_bus_gets_one_blind_flush() {
        let bus = Arc::new(StatlessBus {
            flush_calls: AtomicU32::new(0),
        });
        let publisher = EventPublisher::new(bus.clone());

        let outcome = publisher.flush_until_complete(&CancellationToken::new()).await;

        assert_eq!(outcome, FlushOutcome::BestEffort);
        assert_eq!(bus.flush_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_protocol() {
        let bus = Arc::new(DrainingBus::new(50, 1));
        let publisher = EventPublisher::new(bus);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = publisher.flush_until_complete(&cancel).await;
        assert_eq!(outcome, FlushOutcome::Cancelled);
    }
}
