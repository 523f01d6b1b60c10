// ── Session monitor ──
//
// Everything watching one Jellyfin or Emby server: the (optionally
// breaker-protected) client, the session poller, and the push stream.
// Converted events carry this server's id and go out through the shared
// publisher.

use std::sync::{Arc, RwLock, Weak};

use arc_swap::ArcSwapOption;
use chrono::Utc;
use playsync_api::mediaserver::Session;
use playsync_api::websocket::{ReconnectConfig, ServerStatus};
use playsync_api::{MediaServerClient, ServerKind, SessionStream, StreamHandlers};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::breaker::{BreakerSettings, CircuitBreaker};
use crate::config::{MediaServerConfig, SessionPollerConfig};
use crate::convert::session_to_event;
use crate::error::CoreError;
use crate::identity::{ResolveRequest, UserResolver, resolve_user_id};
use crate::poller::SessionPoller;
use crate::publisher::{Delivery, EventPublisher};
use crate::source::{Protected, SessionSource};

struct Shared {
    server_id: String,
    source: Arc<dyn SessionSource>,
    publisher: ArcSwapOption<EventPublisher>,
    resolver: RwLock<Option<Arc<dyn UserResolver>>>,
}

pub struct SessionMonitor {
    shared: Arc<Shared>,
    breaker: Option<Arc<CircuitBreaker>>,
    poller_config: Option<SessionPollerConfig>,
    websocket_url: Option<Url>,
    reconnect: ReconnectConfig,
    poller: Mutex<Option<SessionPoller>>,
    stream: Mutex<Option<SessionStream>>,
}

impl SessionMonitor {
    /// Monitor over an arbitrary session source. Add a poller and/or a
    /// push stream with the builder methods before `start`.
    pub fn new(server_id: impl Into<String>, source: Arc<dyn SessionSource>) -> Self {
        Self {
            shared: Arc::new(Shared {
                server_id: server_id.into(),
                source,
                publisher: ArcSwapOption::empty(),
                resolver: RwLock::new(None),
            }),
            breaker: None,
            poller_config: None,
            websocket_url: None,
            reconnect: ReconnectConfig::default(),
            poller: Mutex::new(None),
            stream: Mutex::new(None),
        }
    }

    /// Build the client, breaker and transports for one configured server.
    ///
    /// Returns `Ok(None)` when neither polling nor the push stream is
    /// enabled: a disabled server gets no monitor at all.
    pub fn from_config(config: &MediaServerConfig) -> Result<Option<Self>, CoreError> {
        if config.poller.is_none() && !config.websocket {
            debug!(server_id = %config.server_id, "server disabled, no monitor");
            return Ok(None);
        }

        let client = MediaServerClient::new(
            config.kind,
            config.url.as_str(),
            config.api_key.clone(),
            config.user_id.clone(),
            &config.transport,
        )?;
        let websocket_url = if config.websocket {
            Some(client.websocket_url()?)
        } else {
            None
        };

        let mut breaker = None;
        let source: Arc<dyn SessionSource> = match &config.breaker {
            Some(settings) => {
                let shared = Arc::new(CircuitBreaker::new(BreakerSettings {
                    name: config.breaker_name(),
                    ..settings.clone()
                }));
                breaker = Some(Arc::clone(&shared));
                Arc::new(Protected::with_breaker(client, shared))
            }
            None => Arc::new(client),
        };

        let mut monitor = Self::new(config.server_id.clone(), source);
        monitor.breaker = breaker;
        monitor.poller_config = config.poller.clone();
        monitor.websocket_url = websocket_url;
        Ok(Some(monitor))
    }

    #[must_use]
    pub fn with_poller(mut self, config: SessionPollerConfig) -> Self {
        self.poller_config = Some(config);
        self
    }

    #[must_use]
    pub fn with_websocket(mut self, url: Url) -> Self {
        self.websocket_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn kind(&self) -> ServerKind {
        self.shared.source.kind()
    }

    pub fn source(&self) -> &Arc<dyn SessionSource> {
        &self.shared.source
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn set_publisher(&self, publisher: Option<Arc<EventPublisher>>) {
        self.shared.publisher.store(publisher);
    }

    pub fn set_resolver(&self, resolver: Option<Arc<dyn UserResolver>>) {
        *self
            .shared
            .resolver
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = resolver;
    }

    pub async fn is_running(&self) -> bool {
        self.poller.lock().await.is_some()
    }

    pub async fn is_stream_connected(&self) -> bool {
        self.stream
            .lock()
            .await
            .as_ref()
            .is_some_and(SessionStream::is_connected)
    }

    /// Start the poller and push stream. A no-op when already running.
    pub async fn start(&self) {
        let mut poller_slot = self.poller.lock().await;
        if poller_slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.shared);
        let poller = SessionPoller::new(
            Arc::clone(&self.shared.source),
            self.poller_config.clone().unwrap_or_default(),
            move |session| {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.publish_logged(&session).await;
                    }
                }
            },
        )
        .polling(self.poller_config.is_some());
        poller.start().await;

        if let (Some(url), Some(push)) = (&self.websocket_url, poller.push_handle().await) {
            let server_id = self.shared.server_id.clone();
            let handlers = StreamHandlers::default()
                .on_sessions(move |sessions: Vec<Session>| {
                    let push = push.clone();
                    async move {
                        if push.send(sessions).await.is_err() {
                            trace!("poller stopped, dropping pushed sessions");
                        }
                    }
                })
                .on_playstate(|change| async move {
                    debug!(session_id = %change.session_id, command = %change.command, "playstate command");
                })
                .on_user_data(|change| async move {
                    trace!(user_id = %change.user_id, "user data changed");
                })
                .on_server_status(move |status| {
                    let server_id = server_id.clone();
                    async move {
                        match status {
                            ServerStatus::Restarting | ServerStatus::ShuttingDown => {
                                warn!(%server_id, ?status, "media server going away");
                            }
                            ServerStatus::RestartRequired => {
                                info!(%server_id, "media server restart required");
                            }
                        }
                    }
                });

            let stream = SessionStream::connect(
                url.clone(),
                handlers,
                self.reconnect.clone(),
                CancellationToken::new(),
            );
            *self.stream.lock().await = Some(stream);
        }

        info!(
            server_id = %self.shared.server_id,
            kind = %self.kind(),
            polling = self.poller_config.is_some(),
            websocket = self.websocket_url.is_some(),
            "session monitor started"
        );
        *poller_slot = Some(poller);
    }

    /// Stop the stream and the poller, waiting for both. A no-op when
    /// stopped.
    pub async fn stop(&self) {
        let mut poller_slot = self.poller.lock().await;
        let Some(poller) = poller_slot.take() else {
            return;
        };

        if let Some(stream) = self.stream.lock().await.take() {
            stream.close().await;
        }
        poller.stop().await;
        info!(server_id = %self.shared.server_id, "session monitor stopped");
    }

    /// Convert, attribute and deliver one session.
    ///
    /// Returns `Ok(None)` for idle sessions or when no publisher is set.
    pub async fn publish_session(&self, session: &Session) -> Result<Option<Delivery>, CoreError> {
        self.shared.publish(session).await
    }

    /// Ask the server to stop a playback session.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), CoreError> {
        self.shared.source.stop_session(session_id).await
    }
}

impl Shared {
    async fn publish(&self, session: &Session) -> Result<Option<Delivery>, CoreError> {
        let kind = self.source.kind();
        let Some(mut event) = session_to_event(kind, session, Utc::now()) else {
            trace!(session_id = %session.id, "idle session, no event");
            return Ok(None);
        };
        event.server_id = Some(self.server_id.clone());

        let resolver = self
            .resolver
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let request = ResolveRequest {
            source: event.source,
            server_id: self.server_id.clone(),
            external_user_id: session.user_id.clone(),
            username: Some(session.user_name.clone()).filter(|n| !n.is_empty()),
            friendly_name: None,
        };
        event.user_id = resolve_user_id(resolver.as_deref(), &request).await;

        let Some(publisher) = self.publisher.load_full() else {
            debug!(session_id = %session.id, "no publisher configured, event dropped");
            return Ok(None);
        };
        publisher.publish_with_fallback(event).await.map(Some)
    }

    async fn publish_logged(&self, session: &Session) {
        if let Err(e) = self.publish(session).await {
            warn!(server_id = %self.server_id, session_id = %session.id, error = %e, "session event not delivered");
        }
    }
}

impl std::fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("server_id", &self.shared.server_id)
            .field("kind", &self.kind())
            .field("polling", &self.poller_config.is_some())
            .field("websocket", &self.websocket_url.is_some())
            .finish_non_exhaustive()
    }
}
