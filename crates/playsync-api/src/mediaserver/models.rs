// Wire models for the Jellyfin / Emby REST and WebSocket payloads.
//
// Field names are PascalCase on the wire. Every struct defaults missing
// fields so partial payloads (idle sessions, minimal test servers) parse.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An active client session, with or without content playing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Session {
    pub id: String,
    pub client: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub application_version: String,
    pub user_id: String,
    pub user_name: String,
    pub remote_end_point: String,
    pub last_activity_date: Option<String>,
    pub now_playing_item: Option<NowPlayingItem>,
    pub play_state: Option<PlayState>,
    pub transcoding_info: Option<TranscodingInfo>,
    pub server_id: Option<String>,
}

impl Session {
    /// A session is active when something is playing.
    pub fn is_active(&self) -> bool {
        self.now_playing_item.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.play_state.as_ref().is_some_and(|p| p.is_paused)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NowPlayingItem {
    pub id: String,
    pub name: String,
    /// `Movie`, `Episode`, `Audio`, ...
    #[serde(rename = "Type")]
    pub item_type: String,
    pub media_type: String,

    pub series_name: Option<String>,
    pub season_name: Option<String>,
    pub index_number: Option<i32>,
    pub parent_index_number: Option<i32>,

    pub album: Option<String>,
    pub album_artist: Option<String>,

    /// Duration in 100ns ticks.
    pub run_time_ticks: i64,
    pub production_year: Option<i32>,
    pub container: Option<String>,
    pub media_streams: Vec<MediaStream>,
    pub provider_ids: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PlayState {
    pub position_ticks: i64,
    pub can_seek: bool,
    pub is_paused: bool,
    pub is_muted: bool,
    /// `DirectPlay`, `DirectStream`, or `Transcode`.
    pub play_method: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TranscodingInfo {
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub container: Option<String>,
    pub is_video_direct: bool,
    pub is_audio_direct: bool,
    pub bitrate: Option<i64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub audio_channels: Option<i32>,
    pub hardware_acceleration_type: Option<String>,
    pub transcode_reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MediaStream {
    pub codec: Option<String>,
    /// `Video`, `Audio`, or `Subtitle`.
    #[serde(rename = "Type")]
    pub stream_type: String,
    pub height: Option<i32>,
    pub width: Option<i32>,
    pub channels: Option<i32>,
    pub bit_rate: Option<i64>,
}

/// `GET /System/Info`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemInfo {
    pub server_name: String,
    pub version: String,
    pub id: String,
    pub operating_system: String,
    pub has_update_available: bool,
}

/// `GET /Users`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct User {
    pub id: String,
    pub name: String,
}
