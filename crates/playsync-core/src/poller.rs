// ── Session poller ──
//
// One background task per media server. Polls active sessions on a timer
// and forwards a session only when it is new or its play state changed.
// Push-stream snapshots enter the same task through a channel, so the
// seen-set has a single owner and needs no locking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use playsync_api::mediaserver::Session;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SessionPollerConfig;
use crate::source::SessionSource;

const PUSH_CHANNEL_SIZE: usize = 64;

type SessionSink = Arc<dyn Fn(Session) -> BoxFuture<'static, ()> + Send + Sync>;

// ── Seen-set ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    item_id: String,
    paused: bool,
}

impl Fingerprint {
    fn of(session: &Session) -> Option<Self> {
        let item = session.now_playing_item.as_ref()?;
        Some(Self {
            item_id: item.id.clone(),
            paused: session.is_paused(),
        })
    }
}

/// Sessions already reported, with the state they were reported in.
#[derive(Debug, Default)]
pub(crate) struct SeenSessions {
    entries: HashMap<String, (Fingerprint, Instant)>,
}

impl SeenSessions {
    /// Record an observation. Returns `true` when the session should be
    /// emitted: first sighting, different item, or pause toggled.
    pub(crate) fn observe(&mut self, session: &Session, now: Instant) -> bool {
        let Some(fingerprint) = Fingerprint::of(session) else {
            return false;
        };

        match self.entries.get_mut(&session.id) {
            Some((seen, last)) => {
                *last = now;
                if *seen == fingerprint {
                    false
                } else {
                    *seen = fingerprint;
                    true
                }
            }
            None => {
                self.entries.insert(session.id.clone(), (fingerprint, now));
                true
            }
        }
    }

    /// Forget sessions not observed within `ttl`.
    pub(crate) fn evict(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, last)| now.saturating_duration_since(*last) < ttl);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── SessionPoller ────────────────────────────────────────────────────

struct Running {
    cancel: CancellationToken,
    push_tx: mpsc::Sender<Vec<Session>>,
    handle: JoinHandle<()>,
}

pub struct SessionPoller {
    source: Arc<dyn SessionSource>,
    config: SessionPollerConfig,
    polling: bool,
    sink: SessionSink,
    running: Mutex<Option<Running>>,
}

impl SessionPoller {
    /// `on_session` receives each new or changed session, in order.
    pub fn new<F, Fut>(source: Arc<dyn SessionSource>, config: SessionPollerConfig, on_session: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            source,
            config,
            polling: true,
            sink: Arc::new(move |s| Box::pin(on_session(s))),
            running: Mutex::new(None),
        }
    }

    /// Disable the timer; only pushed snapshots are processed.
    #[must_use]
    pub fn polling(mut self, enabled: bool) -> Self {
        self.polling = enabled;
        self
    }

    pub fn interval(&self) -> Duration {
        self.config.effective_interval()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn the poll task. A no-op when already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let (push_tx, push_rx) = mpsc::channel(PUSH_CHANNEL_SIZE);
        let handle = tokio::spawn(poll_task(
            Arc::clone(&self.source),
            self.polling.then(|| self.config.effective_interval()),
            self.config.seen_ttl,
            Arc::clone(&self.sink),
            push_rx,
            cancel.clone(),
        ));

        if self.polling && self.config.interval < self.config.effective_interval() {
            info!(
                configured_secs = self.config.interval.as_secs(),
                effective_secs = self.config.effective_interval().as_secs(),
                "poll interval raised to minimum"
            );
        }
        *running = Some(Running {
            cancel,
            push_tx,
            handle,
        });
    }

    /// Sender for push-stream snapshots while the task runs.
    pub async fn push_handle(&self) -> Option<mpsc::Sender<Vec<Session>>> {
        self.running.lock().await.as_ref().map(|r| r.push_tx.clone())
    }

    /// Cancel the task and wait for it to exit. A no-op when stopped.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.handle.await;
    }
}

impl std::fmt::Debug for SessionPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPoller")
            .field("kind", &self.source.kind())
            .field("interval", &self.config.effective_interval())
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

// ── Background task ──────────────────────────────────────────────────

async fn poll_task(
    source: Arc<dyn SessionSource>,
    interval: Option<Duration>,
    ttl: Duration,
    sink: SessionSink,
    mut push_rx: mpsc::Receiver<Vec<Session>>,
    cancel: CancellationToken,
) {
    let mut seen = SeenSessions::default();
    // First tick fires immediately: poll once at startup.
    let mut ticker = tokio::time::interval(interval.unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let sessions = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(batch) = push_rx.recv() => batch,
            _ = ticker.tick(), if interval.is_some() => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = source.active_sessions() => match result {
                        Ok(sessions) => sessions,
                        Err(e) if e.is_unavailable() => {
                            debug!(kind = %source.kind(), "source unavailable, skipping poll");
                            continue;
                        }
                        Err(e) => {
                            warn!(kind = %source.kind(), error = %e, "session poll failed");
                            continue;
                        }
                    },
                }
            }
        };

        let now = Instant::now();
        for session in sessions {
            if seen.observe(&session, now) {
                trace!(session_id = %session.id, "session new or changed");
                sink(session).await;
            }
        }

        let evicted = seen.evict(now, ttl);
        if evicted > 0 {
            debug!(evicted, tracked = seen.len(), "expired idle sessions");
        }
    }

    debug!(kind = %source.kind(), "session poller exiting");
}
