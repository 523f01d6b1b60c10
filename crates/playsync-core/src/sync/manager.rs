use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::run::SyncReport;
use crate::config::SyncConfig;
use crate::error::CoreError;
use crate::identity::UserResolver;
use crate::monitor::SessionMonitor;
use crate::publisher::EventPublisher;
use crate::source::HistorySource;
use crate::store::EventStore;

/// Called after every successful run with (new records, duration).
pub type SyncCompleted = Arc<dyn Fn(usize, Duration) + Send + Sync>;

// ── Shared state ─────────────────────────────────────────────────────

/// Read by everything that builds or delivers events; written only by
/// the setters and at the end of a successful run.
#[derive(Default)]
pub(super) struct SharedState {
    pub(super) publisher: Option<Arc<EventPublisher>>,
    pub(super) last_sync: Option<DateTime<Utc>>,
    pub(super) on_completed: Option<SyncCompleted>,
}

struct Lifecycle {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub(super) struct Inner {
    pub(super) config: SyncConfig,
    pub(super) source: Option<Arc<dyn HistorySource>>,
    pub(super) store: Arc<dyn EventStore>,
    pub(super) resolver: Option<Arc<dyn UserResolver>>,
    pub(super) state: RwLock<SharedState>,
    monitors: Vec<SessionMonitor>,
    /// Held for the whole of a run: triggers queue behind it.
    sync_lock: Mutex<()>,
    lifecycle: Mutex<Option<Lifecycle>>,
    /// Token observed by manual triggers; replaced after every stop.
    current_cancel: std::sync::Mutex<CancellationToken>,
}

// ── Builder ──────────────────────────────────────────────────────────

pub struct SyncManagerBuilder {
    config: SyncConfig,
    store: Arc<dyn EventStore>,
    source: Option<Arc<dyn HistorySource>>,
    resolver: Option<Arc<dyn UserResolver>>,
    publisher: Option<Arc<EventPublisher>>,
    monitors: Vec<SessionMonitor>,
}

impl SyncManagerBuilder {
    /// Pull source. Without one, runs are no-ops.
    #[must_use]
    pub fn history_source(mut self, source: Arc<dyn HistorySource>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn UserResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Media server monitor started and stopped with the manager.
    #[must_use]
    pub fn monitor(mut self, monitor: SessionMonitor) -> Self {
        self.monitors.push(monitor);
        self
    }

    pub fn build(self) -> SyncManager {
        for monitor in &self.monitors {
            monitor.set_publisher(self.publisher.clone());
            monitor.set_resolver(self.resolver.clone());
        }

        SyncManager {
            inner: Arc::new(Inner {
                config: self.config,
                source: self.source,
                store: self.store,
                resolver: self.resolver,
                state: RwLock::new(SharedState {
                    publisher: self.publisher,
                    ..SharedState::default()
                }),
                monitors: self.monitors,
                sync_lock: Mutex::new(()),
                lifecycle: Mutex::new(None),
                current_cancel: std::sync::Mutex::new(CancellationToken::new()),
            }),
        }
    }
}

// ── SyncManager ──────────────────────────────────────────────────────

/// Orchestrates the pull sync and the lifecycle of every session monitor.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct SyncManager {
    pub(super) inner: Arc<Inner>,
}

impl SyncManager {
    pub fn builder(config: SyncConfig, store: Arc<dyn EventStore>) -> SyncManagerBuilder {
        SyncManagerBuilder {
            config,
            store,
            source: None,
            resolver: None,
            publisher: None,
            monitors: Vec::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn monitors(&self) -> &[SessionMonitor] {
        &self.inner.monitors
    }

    /// Start of the last successful run, if any.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.read_state().last_sync
    }

    /// Replace the publisher for the manager and every monitor.
    pub fn set_publisher(&self, publisher: Option<Arc<EventPublisher>>) {
        for monitor in &self.inner.monitors {
            monitor.set_publisher(publisher.clone());
        }
        self.write_state().publisher = publisher;
    }

    pub fn publisher(&self) -> Option<Arc<EventPublisher>> {
        self.read_state().publisher.clone()
    }

    pub fn set_on_sync_completed<F>(&self, callback: F)
    where
        F: Fn(usize, Duration) + Send + Sync + 'static,
    {
        self.write_state().on_completed = Some(Arc::new(callback));
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.is_some()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the periodic sync (first run immediately) and start every
    /// monitor. A no-op when already running.
    pub async fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!("sync manager already running");
            return;
        }

        let cancel = self.current_cancel();
        let mut handles = Vec::new();

        if self.inner.source.is_some() {
            let manager = self.clone();
            let task_cancel = cancel.clone();
            handles.push(tokio::spawn(sync_task(manager, task_cancel)));
        } else {
            info!("no history source configured, pull sync disabled");
        }

        for monitor in &self.inner.monitors {
            monitor.start().await;
        }

        info!(
            interval_secs = self.inner.config.interval.as_secs(),
            monitors = self.inner.monitors.len(),
            mode = %self.inner.config.mode,
            "sync manager started"
        );
        *lifecycle = Some(Lifecycle { cancel, handles });
    }

    /// Cancel every background task and wait for all of them. A no-op
    /// when not running.
    pub async fn stop(&self) {
        let Some(lifecycle) = self.inner.lifecycle.lock().await.take() else {
            return;
        };

        lifecycle.cancel.cancel();
        for monitor in &self.inner.monitors {
            monitor.stop().await;
        }
        for handle in lifecycle.handles {
            let _ = handle.await;
        }

        *self
            .inner
            .current_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        info!("sync manager stopped");
    }

    /// Run one sync now, queued behind any run in progress.
    pub async fn trigger_sync(&self) -> Result<SyncReport, CoreError> {
        let cancel = self.current_cancel();
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CoreError::Cancelled),
            guard = self.inner.sync_lock.lock() => guard,
        };
        self.run(&cancel).await
    }

    // ── Internals ────────────────────────────────────────────────────

    fn current_cancel(&self) -> CancellationToken {
        self.inner
            .current_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(super) fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SharedState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SharedState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("has_source", &self.inner.source.is_some())
            .field("monitors", &self.inner.monitors.len())
            .field("mode", &self.inner.config.mode)
            .finish_non_exhaustive()
    }
}

// ── Background task ──────────────────────────────────────────────────

/// Initial run immediately, then one per interval. A zero interval
/// leaves only the initial run.
async fn sync_task(manager: SyncManager, cancel: CancellationToken) {
    let interval = manager.inner.config.interval;
    let mut ticker = (!interval.is_zero()).then(|| tokio::time::interval(interval));

    loop {
        if let Some(ticker) = ticker.as_mut() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            guard = manager.inner.sync_lock.lock() => {
                let result = manager.run(&cancel).await;
                drop(guard);
                result
            }
        };

        match result {
            Ok(_) => {}
            Err(CoreError::Cancelled) => break,
            Err(e) if e.is_unavailable() => info!(error = %e, "history source unavailable, skipping cycle"),
            Err(e @ CoreError::DeliveryFailed { .. }) => error!(error = %e, "sync aborted: event delivery failed"),
            Err(e) => warn!(error = %e, "sync failed"),
        }

        if ticker.is_none() {
            break;
        }
    }

    debug!("sync task exiting");
}
