// ── Runtime configuration ──
//
// Plain data consumed by the core services. Loading from disk and env
// happens in `playsync-config`; everything here is already validated.

use std::time::Duration;

use playsync_api::{ServerKind, TransportConfig};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use crate::breaker::BreakerSettings;

/// Poll intervals below this are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How the sync manager hands events downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeliveryMode {
    /// Bus first with store fallback, then flush until the bus has drained.
    #[default]
    EventSourcing,
    /// Write the store directly, then notify the bus without waiting.
    Notification,
}

/// Pull-sync behaviour.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time between scheduled runs. Zero disables the schedule; runs then
    /// happen only through `trigger_sync`.
    pub interval: Duration,
    /// How far back the first run looks.
    pub lookback: Duration,
    /// Import the full history on the first run instead of `lookback`.
    pub sync_all: bool,
    /// History page size.
    pub batch_size: u32,
    /// Additional attempts for a failed page fetch.
    pub retry_attempts: u32,
    /// Base delay between fetch retries, doubled per attempt.
    pub retry_delay: Duration,
    pub mode: DeliveryMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lookback: Duration::from_secs(24 * 60 * 60),
            sync_all: false,
            batch_size: 1000,
            retry_attempts: 5,
            retry_delay: Duration::from_secs(2),
            mode: DeliveryMode::EventSourcing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPollerConfig {
    pub interval: Duration,
    /// How long a seen session is remembered after it was last observed.
    pub seen_ttl: Duration,
}

impl SessionPollerConfig {
    /// The configured interval, clamped to [`MIN_POLL_INTERVAL`].
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_POLL_INTERVAL)
    }
}

impl Default for SessionPollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            seen_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Connection settings for the history aggregator.
#[derive(Debug, Clone)]
pub struct HistorySourceConfig {
    pub url: Url,
    pub api_key: SecretString,
    /// `None` runs the client unprotected.
    pub breaker: Option<BreakerSettings>,
    pub transport: TransportConfig,
}

/// One Jellyfin or Emby server.
#[derive(Debug, Clone)]
pub struct MediaServerConfig {
    pub kind: ServerKind,
    pub url: Url,
    pub api_key: SecretString,
    /// Stamped on every event from this server.
    pub server_id: String,
    /// Scopes the reported device id.
    pub user_id: Option<String>,
    /// `None` disables polling.
    pub poller: Option<SessionPollerConfig>,
    pub websocket: bool,
    pub breaker: Option<BreakerSettings>,
    pub transport: TransportConfig,
}

impl MediaServerConfig {
    /// Breaker name for this server, e.g. `jellyfin-living-room`.
    pub fn breaker_name(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.server_id)
    }
}
