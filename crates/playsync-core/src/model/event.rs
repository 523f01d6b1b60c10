// ── Canonical playback event ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::CoreError;

/// User id carried by events whose external user could not be resolved.
pub const UNRESOLVED_USER_ID: i64 = 0;

/// Backend family an event was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Source {
    Tautulli,
    Jellyfin,
    Emby,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Playing,
    Paused,
    Stopped,
}

/// Optional stream metadata. Adapters fill what they know; absence is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityInfo {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub video_resolution: Option<String>,
    pub transcode_decision: Option<String>,
    pub bitrate: Option<i64>,
    pub audio_channels: Option<i32>,
    pub container: Option<String>,
    /// External id such as `imdb://tt0133093`.
    pub guid: Option<String>,
}

/// One observation of a playback session, normalized across sources.
///
/// Immutable once built: a later observation of the same session is a new
/// event sharing its `session_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub id: Uuid,
    pub session_key: String,
    pub server_id: Option<String>,
    pub correlation_key: Option<String>,
    pub source: Source,
    pub user_id: i64,

    pub username: String,
    pub friendly_name: Option<String>,
    pub ip_address: Option<String>,

    pub media_type: String,
    pub title: String,
    /// Season (episodes) or album (tracks).
    pub parent_title: Option<String>,
    /// Show (episodes) or artist (tracks).
    pub grandparent_title: Option<String>,
    pub rating_key: Option<String>,

    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub percent_complete: u8,
    pub paused_counter: i64,
    pub state: PlaybackState,

    pub platform: Option<String>,
    pub player: Option<String>,
    pub machine_id: Option<String>,
    pub location: Option<String>,

    #[serde(default)]
    pub quality: QualityInfo,
}

impl PlaybackEvent {
    /// Start a new event. `session_key` must be non-empty.
    pub fn new(
        source: Source,
        session_key: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        let session_key = session_key.into();
        if session_key.trim().is_empty() {
            return Err(CoreError::InvalidRecord {
                session_key,
                reason: "empty session key".into(),
            });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            session_key,
            server_id: None,
            correlation_key: None,
            source,
            user_id: UNRESOLVED_USER_ID,
            username: String::new(),
            friendly_name: None,
            ip_address: None,
            media_type: String::new(),
            title: String::new(),
            parent_title: None,
            grandparent_title: None,
            rating_key: None,
            started_at,
            stopped_at: None,
            percent_complete: 0,
            paused_counter: 0,
            state: PlaybackState::Playing,
            platform: None,
            player: None,
            machine_id: None,
            location: None,
            quality: QualityInfo::default(),
        })
    }

    /// Check the invariants every delivered event must satisfy.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.session_key.trim().is_empty() {
            return Err(self.invalid("empty session key"));
        }
        if let Some(stopped) = self.stopped_at {
            if stopped < self.started_at {
                return Err(self.invalid("stopped before started"));
            }
        }
        Ok(())
    }

    /// Deterministic idempotence key covering both delivery paths.
    ///
    /// `source:server:user:content:device:started:session`, with the start
    /// time at second precision in UTC.
    pub fn compute_correlation_key(&self) -> String {
        let server = self.server_id.as_deref().filter(|s| !s.is_empty()).unwrap_or("default");
        let content = self
            .rating_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.title);
        let machine = self.machine_id.as_deref().filter(|m| !m.is_empty()).unwrap_or("unknown");

        format!(
            "{}:{server}:{}:{content}:{machine}:{}:{}",
            self.source,
            self.user_id,
            self.started_at.format("%Y-%m-%dT%H:%M:%S"),
            self.session_key
        )
    }

    /// Attach the correlation key if it is not set yet, and return it.
    pub fn ensure_correlation_key(&mut self) -> &str {
        if self.correlation_key.is_none() {
            self.correlation_key = Some(self.compute_correlation_key());
        }
        self.correlation_key.as_deref().unwrap_or_default()
    }

    fn invalid(&self, reason: &str) -> CoreError {
        CoreError::InvalidRecord {
            session_key: self.session_key.clone(),
            reason: reason.into(),
        }
    }
}
