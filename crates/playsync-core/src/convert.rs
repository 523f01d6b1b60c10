// ── API-to-domain conversions ──
//
// Bridges raw `playsync_api` records into `PlaybackEvent`. History rows
// convert fallibly (a bad row is skipped by the caller); media server
// sessions convert to `None` when nothing is playing.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use playsync_api::ServerKind;
use playsync_api::mediaserver::{MediaStream, NowPlayingItem, Session};
use playsync_api::tautulli::HistoryRecord;

use crate::error::CoreError;
use crate::model::{PlaybackEvent, PlaybackState, QualityInfo, Source};

// ── Helpers ────────────────────────────────────────────────────────

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn non_empty_opt(raw: Option<&String>) -> Option<String> {
    raw.and_then(|s| non_empty(s))
}

fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    (epoch > 0).then(|| DateTime::from_timestamp(epoch, 0)).flatten()
}

fn clamp_percent(value: i64) -> u8 {
    u8::try_from(value.clamp(0, 100)).unwrap_or(100)
}

/// Coarse label for a video height.
pub fn resolution_label(height: i32) -> Option<&'static str> {
    match height {
        h if h >= 2160 => Some("4K"),
        h if h >= 1080 => Some("1080p"),
        h if h >= 720 => Some("720p"),
        h if h > 0 => Some("SD"),
        _ => None,
    }
}

impl From<ServerKind> for Source {
    fn from(kind: ServerKind) -> Self {
        match kind {
            ServerKind::Jellyfin => Self::Jellyfin,
            ServerKind::Emby => Self::Emby,
        }
    }
}

// ── History records ────────────────────────────────────────────────

impl TryFrom<&HistoryRecord> for PlaybackEvent {
    type Error = CoreError;

    fn try_from(r: &HistoryRecord) -> Result<Self, Self::Error> {
        let session_key = r.effective_session_key();
        let invalid = |reason: &str| CoreError::InvalidRecord {
            session_key: session_key.clone(),
            reason: reason.to_owned(),
        };

        let started_at = epoch_to_datetime(r.started)
            .or_else(|| epoch_to_datetime(r.date))
            .ok_or_else(|| invalid("missing start time"))?;

        let ip_address = match non_empty(&r.ip_address) {
            Some(ip) => {
                ip.parse::<IpAddr>()
                    .map_err(|_| invalid(&format!("invalid IP address {ip:?}")))?;
                Some(ip)
            }
            None => None,
        };

        let stopped_at = epoch_to_datetime(r.stopped);
        let state = if stopped_at.is_some() {
            PlaybackState::Stopped
        } else {
            r.state
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default()
        };

        let mut event = Self::new(Source::Tautulli, session_key.clone(), started_at)?;
        event.username = r.user.clone();
        event.friendly_name = non_empty(&r.friendly_name);
        event.ip_address = ip_address;
        event.media_type = r.media_type.clone();
        event.title = r.title.clone();
        event.parent_title = non_empty_opt(r.parent_title.as_ref());
        event.grandparent_title = non_empty_opt(r.grandparent_title.as_ref());
        event.rating_key = r.rating_key.map(|k| k.to_string());
        event.stopped_at = stopped_at;
        event.percent_complete = clamp_percent(r.percent_complete.map_or(0, i64::from));
        event.paused_counter = r.paused_counter.unwrap_or_default();
        event.state = state;
        event.platform = non_empty(&r.platform);
        event.player = non_empty(&r.player);
        event.machine_id = non_empty(&r.machine_id);
        event.location = non_empty(&r.location);
        event.quality = QualityInfo {
            video_codec: non_empty(&r.video_codec),
            audio_codec: non_empty(&r.audio_codec),
            video_resolution: non_empty(&r.video_resolution),
            transcode_decision: non_empty(&r.transcode_decision),
            bitrate: r.stream_bitrate,
            audio_channels: None,
            container: non_empty(&r.container),
            guid: non_empty(&r.guid),
        };

        event.validate()?;
        Ok(event)
    }
}

// ── Media server sessions ──────────────────────────────────────────

/// Convert a Jellyfin/Emby session observed at `now`.
///
/// Returns `None` for idle sessions and sessions without an id.
pub fn session_to_event(kind: ServerKind, session: &Session, now: DateTime<Utc>) -> Option<PlaybackEvent> {
    let item = session.now_playing_item.as_ref()?;
    let mut event = PlaybackEvent::new(kind.into(), session.id.clone(), now).ok()?;

    event.username = session.user_name.clone();
    event.ip_address = non_empty(&session.remote_end_point);
    event.media_type = media_type(&item.item_type);
    event.title = item.name.clone();
    match item.item_type.as_str() {
        "Episode" => {
            event.grandparent_title = non_empty_opt(item.series_name.as_ref());
            event.parent_title = non_empty_opt(item.season_name.as_ref());
        }
        "Audio" => {
            event.grandparent_title = non_empty_opt(item.album_artist.as_ref());
            event.parent_title = non_empty_opt(item.album.as_ref());
        }
        _ => {}
    }
    event.rating_key = non_empty(&item.id);

    let position = session.play_state.as_ref().map_or(0, |p| p.position_ticks);
    if item.run_time_ticks > 0 {
        event.percent_complete = clamp_percent(position.saturating_mul(100) / item.run_time_ticks);
    }
    event.state = if session.is_paused() {
        PlaybackState::Paused
    } else {
        PlaybackState::Playing
    };

    event.platform = non_empty(&session.client);
    event.player = non_empty(&session.device_name);
    event.machine_id = non_empty(&session.device_id);
    event.quality = session_quality(session, item);
    Some(event)
}

fn media_type(item_type: &str) -> String {
    match item_type {
        "Audio" => "track".to_owned(),
        other => other.to_ascii_lowercase(),
    }
}

fn session_quality(session: &Session, item: &NowPlayingItem) -> QualityInfo {
    let video = find_stream(&item.media_streams, "Video");
    let audio = find_stream(&item.media_streams, "Audio");
    let transcode = session.transcoding_info.as_ref();

    let height = transcode
        .and_then(|t| t.height)
        .or_else(|| video.and_then(|v| v.height))
        .unwrap_or_default();

    let transcode_decision = session
        .play_state
        .as_ref()
        .and_then(|p| p.play_method.as_deref())
        .map(|method| match method {
            "Transcode" => "transcode",
            "DirectStream" => "copy",
            _ => "direct play",
        })
        .map(str::to_owned);

    let guid = item
        .provider_ids
        .get("Imdb")
        .map(|id| format!("imdb://{id}"))
        .or_else(|| item.provider_ids.get("Tmdb").map(|id| format!("tmdb://{id}")));

    QualityInfo {
        video_codec: transcode
            .and_then(|t| t.video_codec.clone())
            .or_else(|| video.and_then(|v| v.codec.clone())),
        audio_codec: transcode
            .and_then(|t| t.audio_codec.clone())
            .or_else(|| audio.and_then(|a| a.codec.clone())),
        video_resolution: resolution_label(height).map(str::to_owned),
        transcode_decision,
        bitrate: transcode
            .and_then(|t| t.bitrate)
            .or_else(|| video.and_then(|v| v.bit_rate)),
        audio_channels: transcode
            .and_then(|t| t.audio_channels)
            .or_else(|| audio.and_then(|a| a.channels)),
        container: transcode
            .and_then(|t| t.container.clone())
            .or_else(|| item.container.clone()),
        guid,
    }
}

fn find_stream<'a>(streams: &'a [MediaStream], kind: &str) -> Option<&'a MediaStream> {
    streams.iter().find(|s| s.stream_type == kind)
}
