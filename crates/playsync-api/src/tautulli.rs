// Tautulli history API client
//
// Query-string command API: every request is `GET {base}/api/v2?apikey=..&cmd=..`
// and every response is wrapped in `{ "response": { result, message, data } }`.
// A `result` other than "success" is an error even when the HTTP status is 200.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::{self, RateLimitedTransport, TransportConfig};

// ── Envelope ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: EnvelopeBody<T>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeBody<T> {
    result: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

// ── History models ───────────────────────────────────────────────────

/// One page of `get_history` results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryPage {
    #[serde(rename = "recordsFiltered", default)]
    pub records_filtered: u64,
    #[serde(rename = "recordsTotal", default)]
    pub records_total: u64,
    #[serde(rename = "data", default)]
    pub records: Vec<HistoryRecord>,
}

/// A single playback row from Tautulli's history table.
///
/// Timestamps are unix seconds. Most fields are nullable in practice;
/// absent values deserialize to their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistoryRecord {
    /// Null once the session has ended on some Tautulli versions.
    pub session_key: Option<String>,
    pub row_id: Option<i64>,
    pub reference_id: Option<i64>,
    pub date: i64,
    pub started: i64,
    pub stopped: i64,
    pub state: Option<String>,

    pub user_id: Option<i64>,
    pub user: String,
    pub friendly_name: String,
    pub ip_address: String,

    pub media_type: String,
    pub title: String,
    pub parent_title: Option<String>,
    pub grandparent_title: Option<String>,
    pub rating_key: Option<i64>,
    pub guid: String,
    pub year: Option<i32>,

    pub percent_complete: Option<i32>,
    pub paused_counter: Option<i64>,
    pub duration: Option<i64>,

    pub platform: String,
    pub player: String,
    pub product: String,
    pub machine_id: String,
    pub location: String,

    pub transcode_decision: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_resolution: String,
    pub container: String,
    pub stream_bitrate: Option<i64>,
}

impl HistoryRecord {
    /// The session key, or a stable synthesized one when Tautulli returns null.
    ///
    /// Falls back to the database row id, then to `user-started-rating_key`.
    pub fn effective_session_key(&self) -> String {
        if let Some(key) = self.session_key.as_deref().filter(|k| !k.is_empty()) {
            return key.to_owned();
        }
        if let Some(row) = self.row_id {
            return format!("row-{row}");
        }
        format!(
            "{}-{}-{}",
            self.user_id.unwrap_or_default(),
            self.started,
            self.rating_key.unwrap_or_default()
        )
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// Raw HTTP client for the Tautulli v2 API.
pub struct TautulliClient {
    transport: RateLimitedTransport,
    endpoint: Url,
    api_key: SecretString,
}

impl TautulliClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `base_url` is the Tautulli root (e.g. `http://tautulli:8181`); a
    /// trailing slash is ignored.
    pub fn new(
        base_url: &str,
        api_key: SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let transport = transport.build_transport(reqwest::header::HeaderMap::new())?;
        Self::with_transport(base_url, api_key, transport)
    }

    /// Create a client around an existing transport.
    pub fn with_transport(
        base_url: &str,
        api_key: SecretString,
        transport: RateLimitedTransport,
    ) -> Result<Self, Error> {
        let endpoint = Url::parse(&format!("{}/api/v2", base_url.trim_end_matches('/')))?;
        Ok(Self {
            transport,
            endpoint,
            api_key,
        })
    }

    /// The `/api/v2` endpoint all commands are sent to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Connectivity check (`cmd=arnold`).
    pub async fn ping(&self) -> Result<(), Error> {
        self.command::<serde_json::Value>("arnold", &[]).await?;
        Ok(())
    }

    /// Fetch one page of history recorded on or after `since`'s date.
    ///
    /// Tautulli's `after` filter has day granularity, so callers dedup the
    /// overlap themselves.
    pub async fn get_history_since(
        &self,
        since: DateTime<Utc>,
        start: u32,
        length: u32,
    ) -> Result<HistoryPage, Error> {
        let params = [
            ("start", start.to_string()),
            ("length", length.to_string()),
            ("after", since.format("%Y-%m-%d").to_string()),
            ("order_column", "date".to_owned()),
            ("order_dir", "asc".to_owned()),
        ];
        let page: Option<HistoryPage> = self.command("get_history", &params).await?;
        Ok(page.unwrap_or_default())
    }

    // ── Request helper ───────────────────────────────────────────────

    /// Send a command and unwrap the response envelope.
    async fn command<T: DeserializeOwned>(
        &self,
        cmd: &str,
        params: &[(&str, String)],
    ) -> Result<Option<T>, Error> {
        debug!(cmd, "GET {}", self.endpoint);

        let request = self
            .transport
            .http()
            .get(self.endpoint.clone())
            .query(&[("apikey", self.api_key.expose_secret()), ("cmd", cmd)])
            .query(params)
            .build()?;

        let resp = self.transport.execute(request).await?;
        if !resp.status().is_success() {
            return Err(transport::status_error(resp).await);
        }

        let body = resp.text().await?;
        parse_envelope(&body)
    }
}

/// Parse the `{ response: { result, message, data } }` envelope.
fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<Option<T>, Error> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        Error::Deserialization {
            message: format!("{e} (body preview: {preview:?})"),
            body: body.to_owned(),
        }
    })?;

    match envelope.response.result.as_str() {
        "success" => Ok(envelope.response.data),
        other => Err(Error::Api {
            message: envelope
                .response
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("result={other}")),
        }),
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn envelope_error_result_is_an_error() {
        let body = r#"{"response":{"result":"error","message":"Invalid apikey","data":{}}}"#;
        let err = parse_envelope::<serde_json::Value>(body).unwrap_err();
        assert!(matches!(err, Error::Api { ref message } if message == "Invalid apikey"));
    }

    #[test]
    fn envelope_error_without_message_reports_result() {
        let body = r#"{"response":{"result":"failed","data":null}}"#;
        let err = parse_envelope::<serde_json::Value>(body).unwrap_err();
        assert_eq!(err.to_string(), "API error: result=failed");
    }

    #[test]
    fn history_page_deserializes_nullable_fields() {
        let body = r#"{"response":{"result":"success","message":null,"data":{
            "recordsFiltered": 1, "recordsTotal": 10,
            "data": [{
                "session_key": null, "row_id": 812, "date": 1700000000,
                "started": 1700000000, "stopped": 1700003600,
                "user_id": null, "user": "alice", "friendly_name": "Alice",
                "ip_address": "203.0.113.9", "media_type": "episode",
                "title": "Pilot", "parent_title": "Season 1",
                "grandparent_title": "Show", "rating_key": 5521,
                "percent_complete": 97, "paused_counter": 30
            }]
        }}}"#;

        let page: HistoryPage = parse_envelope(body).unwrap().unwrap();
        assert_eq!(page.records_total, 10);
        assert_eq!(page.records.len(), 1);

        let record = &page.records[0];
        assert_eq!(record.session_key, None);
        assert_eq!(record.user_id, None);
        assert_eq!(record.parent_title.as_deref(), Some("Season 1"));
        assert_eq!(record.effective_session_key(), "row-812");
    }

    #[test]
    fn effective_session_key_prefers_vendor_key() {
        let record = HistoryRecord {
            session_key: Some("42".into()),
            row_id: Some(7),
            ..HistoryRecord::default()
        };
        assert_eq!(record.effective_session_key(), "42");

        let record = HistoryRecord {
            session_key: Some(String::new()),
            user_id: Some(3),
            started: 1_700_000_000,
            rating_key: Some(99),
            ..HistoryRecord::default()
        };
        assert_eq!(record.effective_session_key(), "3-1700000000-99");
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let client = TautulliClient::with_transport(
            "http://tautulli:8181/",
            SecretString::from("k".to_owned()),
            RateLimitedTransport::new(reqwest::Client::new(), Default::default()),
        )
        .unwrap();
        assert_eq!(client.endpoint().as_str(), "http://tautulli:8181/api/v2");
    }
}
