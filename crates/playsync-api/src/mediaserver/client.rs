// Media server HTTP client
//
// Wraps `RateLimitedTransport` with Jellyfin/Emby URL construction and the
// `X-Emby-*` identification headers. Auth rides on a default header, so
// request helpers only deal with paths and status handling.

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::models::{Session, SystemInfo, User};
use super::{CLIENT_NAME, ServerKind};
use crate::error::Error;
use crate::transport::{self, RateLimitedTransport, TransportConfig};

/// Raw HTTP client for a single Jellyfin or Emby server.
pub struct MediaServerClient {
    kind: ServerKind,
    transport: RateLimitedTransport,
    base_url: Url,
    api_key: SecretString,
    user_id: Option<String>,
}

impl MediaServerClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `user_id` scopes the device id this client reports, so two monitors
    /// on the same server do not evict each other's WebSocket session.
    pub fn new(
        kind: ServerKind,
        base_url: &str,
        api_key: SecretString,
        user_id: Option<String>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let headers = auth_headers(&api_key, &device_id(user_id.as_deref()))?;
        let transport = transport.build_transport(headers)?;
        Self::with_transport(kind, base_url, api_key, user_id, transport)
    }

    /// Create a client around an existing transport. The transport's client
    /// must already carry the auth headers (see [`auth_headers`]).
    pub fn with_transport(
        kind: ServerKind,
        base_url: &str,
        api_key: SecretString,
        user_id: Option<String>,
        transport: RateLimitedTransport,
    ) -> Result<Self, Error> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))?;
        Ok(Self {
            kind,
            transport,
            base_url,
            api_key,
            user_id: user_id.filter(|u| !u.is_empty()),
        })
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// `GET /System/Ping`
    pub async fn ping(&self) -> Result<(), Error> {
        let resp = self.send(self.transport.http().get(self.url("/System/Ping"))).await?;
        ensure_success(resp).await.map(drop)
    }

    /// `GET /System/Info`
    pub async fn server_info(&self) -> Result<SystemInfo, Error> {
        self.get_json("/System/Info").await
    }

    /// `GET /Sessions`: every connected session, idle ones included.
    pub async fn sessions(&self) -> Result<Vec<Session>, Error> {
        self.get_json("/Sessions").await
    }

    /// Sessions that currently have something playing.
    pub async fn active_sessions(&self) -> Result<Vec<Session>, Error> {
        let sessions = self.sessions().await?;
        Ok(sessions.into_iter().filter(Session::is_active).collect())
    }

    /// `GET /Users`
    pub async fn users(&self) -> Result<Vec<User>, Error> {
        self.get_json("/Users").await
    }

    /// `POST /Sessions/{id}/Playing/Stop`. Servers answer 204 or 200.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), Error> {
        let url = self.url_with_segments(&["Sessions", session_id, "Playing", "Stop"])?;
        debug!("POST {}", url);
        let resp = self.send(self.transport.http().post(url)).await?;
        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(transport::status_error(resp).await),
        }
    }

    /// Push-notification URL: REST base with `ws`/`wss` scheme, the
    /// server's socket path, and `api_key` + `deviceId` query parameters.
    pub fn websocket_url(&self) -> Result<Url, Error> {
        let scheme = if self.base_url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        let base_path = self.base_url.path().trim_end_matches('/');
        let raw = format!(
            "{scheme}://{}{base_path}{}",
            authority(&self.base_url),
            self.kind.websocket_path()
        );

        let mut url = Url::parse(&raw)?;
        url.query_pairs_mut()
            .append_pair("api_key", self.api_key.expose_secret())
            .append_pair("deviceId", &device_id(self.user_id.as_deref()));
        Ok(url)
    }

    // ── Request helpers ──────────────────────────────────────────────

    fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{base_path}{path}"));
        url
    }

    /// Append path segments, percent-encoding each one.
    fn url_with_segments(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::ClientBuild(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.url(path);
        debug!("GET {}", url);

        let resp = self.send(self.transport.http().get(url)).await?;
        let resp = ensure_success(resp).await?;
        let body = resp.text().await?;

        serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body,
            }
        })
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, Error> {
        let request = builder.build()?;
        self.transport.execute(request).await
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Default headers identifying this client to the server.
pub fn auth_headers(api_key: &SecretString, device_id: &str) -> Result<HeaderMap, Error> {
    let value = |v: &str| {
        HeaderValue::from_str(v).map_err(|e| Error::ClientBuild(format!("invalid header value: {e}")))
    };

    let mut token = value(api_key.expose_secret())?;
    token.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert("X-Emby-Token", token);
    headers.insert("X-Emby-Client", HeaderValue::from_static(CLIENT_NAME));
    headers.insert("X-Emby-Device-Name", HeaderValue::from_static(CLIENT_NAME));
    headers.insert("X-Emby-Device-Id", value(device_id)?);
    headers.insert(
        "X-Emby-Client-Version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// `playsync`, or `playsync-{user_id}` when scoped to a user.
pub fn device_id(user_id: Option<&str>) -> String {
    match user_id.filter(|u| !u.is_empty()) {
        Some(user) => format!("{CLIENT_NAME}-{user}"),
        None => CLIENT_NAME.to_owned(),
    }
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(transport::status_error(resp).await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::RetryPolicy;

    fn client(kind: ServerKind, base: &str, user: Option<&str>) -> MediaServerClient {
        MediaServerClient::with_transport(
            kind,
            base,
            SecretString::from("secret".to_owned()),
            user.map(String::from),
            RateLimitedTransport::new(reqwest::Client::new(), RetryPolicy::default()),
        )
        .unwrap()
    }

    #[test]
    fn jellyfin_websocket_url_swaps_scheme() {
        let c = client(ServerKind::Jellyfin, "http://jf.local:8096/", None);
        assert_eq!(
            c.websocket_url().unwrap().as_str(),
            "ws://jf.local:8096/socket?api_key=secret&deviceId=playsync"
        );
    }

    #[test]
    fn emby_websocket_url_uses_wss_and_user_device() {
        let c = client(ServerKind::Emby, "https://emby.example.com/emby", Some("u42"));
        assert_eq!(
            c.websocket_url().unwrap().as_str(),
            "wss://emby.example.com/emby/embywebsocket?api_key=secret&deviceId=playsync-u42"
        );
    }

    #[test]
    fn rest_urls_keep_base_path() {
        let c = client(ServerKind::Emby, "https://emby.example.com/emby/", None);
        assert_eq!(
            c.url("/Sessions").as_str(),
            "https://emby.example.com/emby/Sessions"
        );
    }

    #[test]
    fn device_id_ignores_empty_user() {
        assert_eq!(device_id(None), "playsync");
        assert_eq!(device_id(Some("")), "playsync");
        assert_eq!(device_id(Some("abc")), "playsync-abc");
    }
}
