//! Push-notification stream for Jellyfin / Emby with auto-reconnect.
//!
//! Connects to the server's session WebSocket, subscribes to session
//! updates, and hands every decoded message to the matching handler slot.
//! Each handler invocation runs in its own tracked task, so a slow handler
//! never stalls the read loop, and [`SessionStream::close`] waits for the
//! ones still running.
//!
//! # Example
//!
//! ```rust,ignore
//! use playsync_api::websocket::{ReconnectConfig, SessionStream, StreamHandlers};
//! use tokio_util::sync::CancellationToken;
//!
//! let handlers = StreamHandlers::default()
//!     .on_sessions(|sessions| async move { println!("{} sessions", sessions.len()) });
//!
//! let stream = SessionStream::connect(client.websocket_url()?, handlers,
//!     ReconnectConfig::default(), CancellationToken::new());
//! // ...
//! stream.close().await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::error::Error;
use crate::mediaserver::Session;

/// Subscription request sent right after connecting: initial delay 0ms,
/// then a session snapshot every 1500ms.
const SESSIONS_START: &str = r#"{"MessageType":"SessionsStart","Data":"0,1500"}"#;
const KEEP_ALIVE: &str = r#"{"MessageType":"KeepAlive"}"#;

// ── Handler slots ────────────────────────────────────────────────────

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Server lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Restarting,
    ShuttingDown,
    RestartRequired,
}

/// `Playstate` command targeting one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaystateChange {
    pub session_id: String,
    pub command: String,
}

/// `UserDataChanged` payload: the user plus the raw changed-items list.
#[derive(Debug, Clone, PartialEq)]
pub struct UserDataChange {
    pub user_id: String,
    pub user_data: serde_json::Value,
}

/// Typed handler slots, registered before [`SessionStream::connect`].
///
/// Unset slots drop their messages silently.
#[derive(Clone, Default)]
pub struct StreamHandlers {
    sessions: Option<Handler<Vec<Session>>>,
    user_data: Option<Handler<UserDataChange>>,
    playstate: Option<Handler<PlaystateChange>>,
    server_status: Option<Handler<ServerStatus>>,
}

impl StreamHandlers {
    /// Session snapshots (`Sessions` messages).
    pub fn on_sessions<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.sessions = Some(Arc::new(move |s| Box::pin(f(s))));
        self
    }

    pub fn on_user_data<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(UserDataChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.user_data = Some(Arc::new(move |c| Box::pin(f(c))));
        self
    }

    pub fn on_playstate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PlaystateChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.playstate = Some(Arc::new(move |c| Box::pin(f(c))));
        self
    }

    pub fn on_server_status<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServerStatus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.server_status = Some(Arc::new(move |s| Box::pin(f(s))));
        self
    }
}

impl std::fmt::Debug for StreamHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandlers")
            .field("sessions", &self.sessions.is_some())
            .field("user_data", &self.user_data.is_some())
            .field("playstate", &self.playstate.is_some())
            .field("server_status", &self.server_status.is_some())
            .finish()
    }
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for WebSocket reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum consecutive failed attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── SessionStream ────────────────────────────────────────────────────

/// Handle to a running push-notification stream.
pub struct SessionStream {
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    handlers: TaskTracker,
}

impl SessionStream {
    /// Spawn the connect/read/reconnect loop and return immediately.
    ///
    /// The first connection attempt happens in the background; use
    /// [`is_connected`](Self::is_connected) to observe it.
    pub fn connect(
        url: Url,
        handlers: StreamHandlers,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let tracker = TaskTracker::new();
        let task = tokio::spawn(ws_loop(
            url,
            handlers,
            reconnect,
            cancel.clone(),
            Arc::clone(&connected),
            tracker.clone(),
        ));

        Self {
            connected,
            cancel,
            task: Mutex::new(Some(task)),
            handlers: tracker,
        }
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Stop the stream and wait for the read loop and every handler it
    /// dispatched to finish. Calling it more than once is harmless.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.handlers.close();
        self.handlers.wait().await;
        self.connected.store(false, Ordering::Release);
    }
}

// ── Background reconnection loop ─────────────────────────────────────

async fn ws_loop(
    url: Url,
    handlers: StreamHandlers,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    tracker: TaskTracker,
) {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_read(&url, &handlers, &tracker, &cancel, &connected) => result,
        };
        connected.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::info!("WebSocket disconnected cleanly, reconnecting");
                attempt = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "WebSocket error");

                if reconnect.max_retries.is_some_and(|max| attempt >= max) {
                    tracing::error!(attempt, "WebSocket reconnection limit reached, giving up");
                    break;
                }

                let delay = calculate_backoff(attempt, &reconnect);
                tracing::info!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    attempt,
                    "Waiting before reconnect"
                );

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                attempt = attempt.saturating_add(1);
            }
        }
    }

    tracing::debug!("WebSocket loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

async fn connect_and_read(
    url: &Url,
    handlers: &StreamHandlers,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    connected: &AtomicBool,
) -> Result<(), Error> {
    tracing::info!(host = url.host_str().unwrap_or_default(), path = url.path(), "Connecting to WebSocket");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();
    write
        .send(Message::text(SESSIONS_START))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    connected.store(true, Ordering::Release);
    tracing::info!("WebSocket connected, session updates subscribed");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = dispatch(&text, handlers, tracker) {
                            write
                                .send(Message::text(reply))
                                .await
                                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(closed_error(e)),
                    None => {
                        tracing::info!("WebSocket stream ended");
                        return Ok(());
                    }
                    // Ping/Pong/Binary: tungstenite answers pings itself
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn closed_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Error::WebSocketClosed {
                code: 1006,
                reason: e.to_string(),
            }
        }
        other => Error::WebSocketConnect(other.to_string()),
    }
}

// ── Message dispatch ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsMessage {
    #[serde(rename = "MessageType")]
    message_type: String,
    #[serde(rename = "Data", default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct UserDataPayload {
    #[serde(rename = "UserId", default)]
    user_id: String,
    #[serde(rename = "UserDataList", default)]
    user_data_list: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PlaystatePayload {
    #[serde(rename = "SessionId", default)]
    session_id: String,
    #[serde(rename = "Command", default)]
    command: String,
}

/// Decode one text frame and spawn the matching handler.
///
/// Returns a frame to send back, if the message asks for one.
fn dispatch(text: &str, handlers: &StreamHandlers, tracker: &TaskTracker) -> Option<&'static str> {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse WebSocket message");
            return None;
        }
    };

    match msg.message_type.as_str() {
        "Sessions" => match serde_json::from_value::<Vec<Session>>(msg.data) {
            Ok(sessions) => spawn_handler(tracker, handlers.sessions.as_ref(), sessions),
            Err(e) => tracing::debug!(error = %e, "Malformed Sessions payload"),
        },
        "UserDataChanged" => match serde_json::from_value::<UserDataPayload>(msg.data) {
            Ok(p) => spawn_handler(
                tracker,
                handlers.user_data.as_ref(),
                UserDataChange {
                    user_id: p.user_id,
                    user_data: p.user_data_list,
                },
            ),
            Err(e) => tracing::debug!(error = %e, "Malformed UserDataChanged payload"),
        },
        "Playstate" => match serde_json::from_value::<PlaystatePayload>(msg.data) {
            Ok(p) => spawn_handler(
                tracker,
                handlers.playstate.as_ref(),
                PlaystateChange {
                    session_id: p.session_id,
                    command: p.command,
                },
            ),
            Err(e) => tracing::debug!(error = %e, "Malformed Playstate payload"),
        },
        "ServerRestarting" => spawn_handler(tracker, handlers.server_status.as_ref(), ServerStatus::Restarting),
        "ServerShuttingDown" => {
            spawn_handler(tracker, handlers.server_status.as_ref(), ServerStatus::ShuttingDown);
        }
        "RestartRequired" => {
            spawn_handler(tracker, handlers.server_status.as_ref(), ServerStatus::RestartRequired);
        }
        "ForceKeepAlive" => return Some(KEEP_ALIVE),
        "KeepAlive" => tracing::trace!("WebSocket keepalive"),
        other => tracing::trace!(message_type = other, "Ignoring WebSocket message"),
    }

    None
}

fn spawn_handler<T: Send + 'static>(tracker: &TaskTracker, handler: Option<&Handler<T>>, payload: T) {
    if let Some(handler) = handler {
        tracker.spawn(handler(payload));
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// `min(initial * 2^attempt, max)` scaled by a deterministic +-20% jitter
/// so several streams reconnecting together spread out.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exp = config
        .initial_delay
        .saturating_mul(1_u32 << attempt.min(16))
        .min(config.max_delay);

    // Cycles through 0.8, 0.9, 1.0, 1.1, 1.2 of the base delay.
    let step = attempt % 5;
    let factor = 0.8 + 0.1 * f64::from(step);
    exp.mul_f64(factor)
}

// ── Tests ────────────────────────────────────────────────────────────
