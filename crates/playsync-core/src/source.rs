// ── Source capabilities ──
//
// Object-safe views of the backend clients. The sync manager and the
// session monitors depend only on these traits, so a raw client and a
// breaker-protected one are interchangeable.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use playsync_api::mediaserver::{Session, SystemInfo, User};
use playsync_api::tautulli::HistoryRecord;
use playsync_api::{MediaServerClient, ServerKind, TautulliClient};

use crate::breaker::{BreakerSettings, CircuitBreaker};
use crate::config::HistorySourceConfig;
use crate::error::CoreError;

/// Pull-based history source, paged by offset from a start timestamp.
pub trait HistorySource: Send + Sync {
    fn name(&self) -> &str;

    fn ping(&self) -> BoxFuture<'_, Result<(), CoreError>>;

    /// One page of records observed on or after `since`. A page shorter
    /// than `page_size` is the last one.
    fn fetch_since(
        &self,
        since: DateTime<Utc>,
        offset: u32,
        page_size: u32,
    ) -> BoxFuture<'_, Result<Vec<HistoryRecord>, CoreError>>;
}

/// Session-oriented media server (Jellyfin, Emby).
pub trait SessionSource: Send + Sync {
    fn kind(&self) -> ServerKind;

    fn ping(&self) -> BoxFuture<'_, Result<(), CoreError>>;

    fn server_info(&self) -> BoxFuture<'_, Result<SystemInfo, CoreError>>;

    /// Sessions with something playing.
    fn active_sessions(&self) -> BoxFuture<'_, Result<Vec<Session>, CoreError>>;

    fn users(&self) -> BoxFuture<'_, Result<Vec<User>, CoreError>>;

    fn stop_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>>;
}

// ── Raw clients ──────────────────────────────────────────────────────

impl HistorySource for TautulliClient {
    fn name(&self) -> &str {
        "tautulli"
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move { Ok(TautulliClient::ping(self).await?) })
    }

    fn fetch_since(
        &self,
        since: DateTime<Utc>,
        offset: u32,
        page_size: u32,
    ) -> BoxFuture<'_, Result<Vec<HistoryRecord>, CoreError>> {
        Box::pin(async move {
            let page = self.get_history_since(since, offset, page_size).await?;
            Ok(page.records)
        })
    }
}

impl SessionSource for MediaServerClient {
    fn kind(&self) -> ServerKind {
        MediaServerClient::kind(self)
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move { Ok(MediaServerClient::ping(self).await?) })
    }

    fn server_info(&self) -> BoxFuture<'_, Result<SystemInfo, CoreError>> {
        Box::pin(async move { Ok(MediaServerClient::server_info(self).await?) })
    }

    fn active_sessions(&self) -> BoxFuture<'_, Result<Vec<Session>, CoreError>> {
        Box::pin(async move { Ok(MediaServerClient::active_sessions(self).await?) })
    }

    fn users(&self) -> BoxFuture<'_, Result<Vec<User>, CoreError>> {
        Box::pin(async move { Ok(MediaServerClient::users(self).await?) })
    }

    fn stop_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move { Ok(MediaServerClient::stop_session(self, session_id).await?) })
    }
}

/// Build the history client described by `config`, wrapped in a breaker
/// when one is configured.
pub fn history_source_from_config(config: &HistorySourceConfig) -> Result<Arc<dyn HistorySource>, CoreError> {
    let client = TautulliClient::new(config.url.as_str(), config.api_key.clone(), &config.transport)?;
    let source: Arc<dyn HistorySource> = match &config.breaker {
        Some(settings) => Arc::new(Protected::new(client, settings.clone())),
        None => Arc::new(client),
    };
    Ok(source)
}

// ── Breaker-protected wrapper ────────────────────────────────────────

/// A source whose every call goes through a [`CircuitBreaker`].
pub struct Protected<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> Protected<S> {
    pub fn new(inner: S, settings: BreakerSettings) -> Self {
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new(settings)),
        }
    }

    /// Share an existing breaker, e.g. one already exposed for monitoring.
    pub fn with_breaker(inner: S, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: HistorySource> HistorySource for Protected<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(self.breaker.call(|| self.inner.ping()))
    }

    fn fetch_since(
        &self,
        since: DateTime<Utc>,
        offset: u32,
        page_size: u32,
    ) -> BoxFuture<'_, Result<Vec<HistoryRecord>, CoreError>> {
        Box::pin(
            self.breaker
                .call(move || self.inner.fetch_since(since, offset, page_size)),
        )
    }
}

impl<S: SessionSource> SessionSource for Protected<S> {
    fn kind(&self) -> ServerKind {
        self.inner.kind()
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(self.breaker.call(|| self.inner.ping()))
    }

    fn server_info(&self) -> BoxFuture<'_, Result<SystemInfo, CoreError>> {
        Box::pin(self.breaker.call(|| self.inner.server_info()))
    }

    fn active_sessions(&self) -> BoxFuture<'_, Result<Vec<Session>, CoreError>> {
        Box::pin(self.breaker.call(|| self.inner.active_sessions()))
    }

    fn users(&self) -> BoxFuture<'_, Result<Vec<User>, CoreError>> {
        Box::pin(self.breaker.call(|| self.inner.users()))
    }

    fn stop_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(self.breaker.call(move || self.inner.stop_session(session_id)))
    }
}
