// ── Circuit breaker ──
//
// Three-state breaker (closed / open / half-open) guarding one backend.
// Counts roll over per generation: a new generation starts on every state
// change and, while closed, every `interval`. Outcomes reported for an old
// generation are ignored.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use strum::Display;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{info, warn};

use crate::error::CoreError;

// ── Settings ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// Name used in logs and `SourceUnavailable` errors, e.g. `tautulli-api`.
    pub name: String,
    /// Trial calls let through while half-open. Also the number of
    /// consecutive trial successes needed to close again. Default: 3.
    pub max_half_open_requests: u32,
    /// Rolling window after which closed-state counts reset. Default: 60s.
    pub interval: Duration,
    /// Cooldown before an open breaker lets trial calls through. Default: 120s.
    pub timeout: Duration,
    /// Minimum requests in the window before the breaker may trip. Default: 10.
    pub min_requests: u32,
    /// Failure ratio at or above which the breaker trips. Default: 0.6.
    pub failure_ratio: f64,
}

impl BreakerSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            name: "default".into(),
            max_half_open_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
            min_requests: 10,
            failure_ratio: 0.6,
        }
    }
}

// ── State ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Request counts for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Lifetime outcome counters, owned by the breaker instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub successes: u64,
    pub failures: u64,
    /// Calls refused without a network attempt.
    pub rejections: u64,
    pub transitions: u64,
}

struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
    last_transition: Instant,
}

// ── CircuitBreaker ───────────────────────────────────────────────────

pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    transitions: AtomicU64,
    state_tx: watch::Sender<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let now = Instant::now();
        let (state_tx, _) = watch::channel(BreakerState::Closed);
        let expiry = (!settings.interval.is_zero()).then(|| now + settings.interval);

        Self {
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
                last_transition: now,
            }),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            state_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state, applying any pending time-based transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Counts for the current generation.
    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    /// When the breaker last changed state.
    pub fn last_transition(&self) -> Instant {
        self.lock().last_transition
    }

    /// Watch state transitions as they happen.
    pub fn subscribe_state(&self) -> watch::Receiver<BreakerState> {
        self.state_tx.subscribe()
    }

    /// State transitions as a `Stream`, starting with the current state.
    pub fn state_stream(&self) -> WatchStream<BreakerState> {
        WatchStream::new(self.state_tx.subscribe())
    }

    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    /// Zero the lifetime counters. Intended for tests.
    pub fn reset_metrics(&self) {
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
        self.transitions.store(0, Ordering::Relaxed);
    }

    /// Run `f` through the breaker.
    ///
    /// Rejected calls return `CoreError::SourceUnavailable` without invoking
    /// `f`. Any `Err` from `f` counts as a failure.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let generation = self.before_request()?;
        let result = f().await;
        self.after_request(generation, result.is_ok());
        result
    }

    // ── Internals ────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_request(&self) -> Result<u64, CoreError> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());

        let rejected = match inner.state {
            BreakerState::Open => true,
            BreakerState::HalfOpen => inner.counts.requests >= self.settings.max_half_open_requests,
            BreakerState::Closed => false,
        };

        if rejected {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::SourceUnavailable {
                source_name: self.settings.name.clone(),
            });
        }

        inner.counts.on_request();
        Ok(inner.generation)
    }

    fn after_request(&self, generation: u64, success: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.on_success();
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.settings.max_half_open_requests
            {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
        } else {
            inner.counts.on_failure();
            match inner.state {
                BreakerState::Closed if self.ready_to_trip(inner.counts) => {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
                BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open, now),
                _ => {}
            }
        }
    }

    fn ready_to_trip(&self, counts: Counts) -> bool {
        if counts.requests < self.settings.min_requests || counts.requests == 0 {
            return false;
        }
        f64::from(counts.total_failures) / f64::from(counts.requests) >= self.settings.failure_ratio
    }

    /// Apply time-based transitions: closed-window rollover and open→half-open.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        let expired = inner.expiry.is_some_and(|e| e <= now);
        match inner.state {
            BreakerState::Closed if expired => self.new_generation(inner, now),
            BreakerState::Open if expired => self.transition(inner, BreakerState::HalfOpen, now),
            _ => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_transition = now;
        self.new_generation(inner, now);
        self.transitions.fetch_add(1, Ordering::Relaxed);
        self.state_tx.send_replace(to);

        if to == BreakerState::Open {
            warn!(breaker = %self.settings.name, %from, %to, "circuit breaker state change");
        } else {
            info!(breaker = %self.settings.name, %from, %to, "circuit breaker state change");
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed => {
                (!self.settings.interval.is_zero()).then(|| now + self.settings.interval)
            }
            BreakerState::Open => Some(now + self.settings.timeout),
            BreakerState::HalfOpen => None,
        };
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.settings.name)
            .field("state", &self.lock().state)
            .finish_non_exhaustive()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn ok(b: &CircuitBreaker) -> Result<(), CoreError> {
        b.call(|| async { Ok(()) }).await
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CoreError> {
        b.call(|| async { Err::<(), _>(CoreError::Timeout) }).await
    }

    #[tokio::test]
    async fn trips_after_ten_requests_at_sixty_percent_failures() {
        let b = CircuitBreaker::new(BreakerSettings::named("tautulli-api"));

        for _ in 0..4 {
            ok(&b).await.unwrap();
        }
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        // 9 requests: below the minimum sample
        assert_eq!(b.state(), BreakerState::Closed);

        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn stays_closed_below_failure_ratio() {
        let b = CircuitBreaker::new(BreakerSettings::named("jellyfin-a"));
        for _ in 0..5 {
            ok(&b).await.unwrap();
        }
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_calling() {
        let b = CircuitBreaker::new(BreakerSettings::named("emby-b"));
        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        let calls = AtomicUsize::new(0);
        let err = b
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(err.is_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.metrics().rejections, 1);
        assert_eq!(b.metrics().failures, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_timeout_then_closes_on_trial_successes() {
        let b = CircuitBreaker::new(BreakerSettings::named("tautulli-api"));
        let mut states = b.subscribe_state();
        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        assert_eq!(*states.borrow_and_update(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        for _ in 0..3 {
            ok(&b).await.unwrap();
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(*states.borrow_and_update(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn state_stream_yields_current_then_transitions() {
        use futures_util::StreamExt;

        let b = CircuitBreaker::new(BreakerSettings::named("emby-b"));
        let mut states = b.state_stream();
        assert_eq!(states.next().await, Some(BreakerState::Closed));

        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        assert_eq!(states.next().await, Some(BreakerState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = CircuitBreaker::new(BreakerSettings::named("tautulli-api"));
        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_concurrent_trials() {
        let settings = BreakerSettings {
            max_half_open_requests: 1,
            ..BreakerSettings::named("jellyfin-a")
        };
        let b = CircuitBreaker::new(settings);
        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(121)).await;

        let generation = b.before_request().unwrap();
        // The single trial slot is taken
        assert!(b.before_request().is_err());
        b.after_request(generation, true);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_counts_roll_over_each_interval() {
        let b = CircuitBreaker::new(BreakerSettings::named("tautulli-api"));
        for _ in 0..9 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.counts().requests, 9);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(b.counts().requests, 0);

        // One more failure is no longer enough to trip
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn reset_metrics_zeroes_counters() {
        let b = CircuitBreaker::new(BreakerSettings::named("x"));
        ok(&b).await.unwrap();
        let _ = fail(&b).await;
        assert_eq!(b.metrics().successes, 1);

        b.reset_metrics();
        assert_eq!(b.metrics(), BreakerMetrics::default());
    }
}
