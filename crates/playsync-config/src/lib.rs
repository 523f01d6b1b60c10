//! Configuration for playsync.
//!
//! TOML file plus `PLAYSYNC_` environment overrides, credential
//! resolution (env + keyring + plaintext), and translation into the
//! runtime types in `playsync_core::config`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use playsync_api::{RetryPolicy, ServerKind, TransportConfig};
use playsync_core::{
    BreakerSettings, DeliveryMode, HistorySourceConfig, MediaServerConfig, SessionPollerConfig,
    SyncConfig,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Keyring service all secrets are stored under.
pub const KEYRING_SERVICE: &str = "playsync";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no API key configured for '{source_name}'")]
    NoCredentials { source_name: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncSection,

    /// History aggregator. Pull sync is disabled without it.
    pub tautulli: Option<TautulliSection>,

    #[serde(default)]
    pub jellyfin: Vec<ServerSection>,

    #[serde(default)]
    pub emby: Vec<ServerSection>,

    /// Breaker settings shared by every source.
    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub transport: TransportSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
    pub interval_secs: u64,
    pub lookback_hours: u64,
    pub sync_all: bool,
    pub batch_size: u32,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub mode: DeliveryMode,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            lookback_hours: 24,
            sync_all: false,
            batch_size: 1000,
            retry_attempts: 5,
            retry_delay_ms: 2000,
            mode: DeliveryMode::EventSourcing,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TautulliSection {
    /// Base URL, e.g. "http://tautulli.local:8181".
    pub url: String,

    /// API key (plaintext, prefer keyring or env var).
    pub api_key: Option<String>,

    /// Environment variable name containing the API key.
    pub api_key_env: Option<String>,
}

/// One `[[jellyfin]]` or `[[emby]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    pub url: String,

    /// Stamped on every event from this server. Unique per server kind.
    pub server_id: String,

    pub api_key: Option<String>,
    pub api_key_env: Option<String>,

    #[serde(default = "default_true")]
    pub poll: bool,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub websocket: bool,

    /// Scopes the device id reported to the server.
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSection {
    pub enabled: bool,
    pub max_half_open: u32,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub min_requests: u32,
    pub failure_ratio: f64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_half_open: 3,
            interval_secs: 60,
            timeout_secs: 120,
            min_requests: 10,
            failure_ratio: 0.6,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportSection {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Accept self-signed certificates.
    pub insecure: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 5,
            base_delay_ms: 1000,
            insecure: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    30
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "playsync", "playsync").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("playsync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load and validate config from `path` (or the platform default) plus
/// `PLAYSYNC_` environment overrides. Nested keys split on `__`, e.g.
/// `PLAYSYNC_SYNC__BATCH_SIZE=500`.
///
/// A missing file is not an error: defaults and env still apply.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("PLAYSYNC_").split("__"))
        .extract()?;

    config.validate()?;
    Ok(config)
}

// ── Validation ──────────────────────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_size == 0 {
            return Err(invalid("sync.batch_size", "must be greater than 0"));
        }

        let ratio = self.breaker.failure_ratio;
        if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
            return Err(invalid(
                "breaker.failure_ratio",
                format!("must be in (0, 1], got {ratio}"),
            ));
        }
        if self.breaker.max_half_open == 0 {
            return Err(invalid("breaker.max_half_open", "must be greater than 0"));
        }

        if let Some(ref tautulli) = self.tautulli {
            parse_url("tautulli.url", &tautulli.url)?;
        }

        for (kind, servers) in self.servers() {
            let mut ids = HashSet::new();
            for (i, server) in servers.iter().enumerate() {
                parse_url(&format!("{kind}[{i}].url"), &server.url)?;
                if server.server_id.trim().is_empty() {
                    return Err(invalid(format!("{kind}[{i}].server_id"), "must not be empty"));
                }
                if !ids.insert(server.server_id.as_str()) {
                    return Err(invalid(
                        format!("{kind}[{i}].server_id"),
                        format!("duplicate server id '{}'", server.server_id),
                    ));
                }
            }
        }
        Ok(())
    }

    fn servers(&self) -> [(ServerKind, &[ServerSection]); 2] {
        [
            (ServerKind::Jellyfin, self.jellyfin.as_slice()),
            (ServerKind::Emby, self.emby.as_slice()),
        ]
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| invalid(field, format!("invalid URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(field, format!("unsupported scheme '{}'", url.scheme())));
    }
    Ok(url)
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve an API key: `api_key_env` → keyring entry
/// `{source}/{server_id}` → plaintext `api_key`.
pub fn resolve_api_key(
    source: &str,
    server_id: &str,
    api_key: Option<&str>,
    api_key_env: Option<&str>,
) -> Result<SecretString, ConfigError> {
    resolve_api_key_with(
        source,
        server_id,
        api_key,
        api_key_env,
        |name| std::env::var(name).ok(),
        |entry| {
            keyring::Entry::new(KEYRING_SERVICE, entry)
                .and_then(|e| e.get_password())
                .ok()
        },
    )
}

fn resolve_api_key_with(
    source: &str,
    server_id: &str,
    api_key: Option<&str>,
    api_key_env: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
    keyring: impl Fn(&str) -> Option<String>,
) -> Result<SecretString, ConfigError> {
    // 1. Named env var
    if let Some(val) = api_key_env.and_then(&env).filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(val));
    }

    // 2. System keyring
    if let Some(secret) = keyring(&keyring_entry(source, server_id)) {
        return Ok(SecretString::from(secret));
    }

    // 3. Plaintext in config
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        return Ok(SecretString::from(key.to_owned()));
    }

    Err(ConfigError::NoCredentials {
        source_name: format!("{source}/{server_id}"),
    })
}

/// Keyring entry name for one source, e.g. `jellyfin/living-room`.
pub fn keyring_entry(source: &str, server_id: &str) -> String {
    format!("{source}/{server_id}")
}

// ── Translation to runtime config ───────────────────────────────────

/// Server id used for the single history aggregator.
const TAUTULLI_SERVER_ID: &str = "default";

impl Config {
    pub fn sync_config(&self) -> SyncConfig {
        let s = &self.sync;
        SyncConfig {
            interval: Duration::from_secs(s.interval_secs),
            lookback: Duration::from_secs(s.lookback_hours.saturating_mul(3600)),
            sync_all: s.sync_all,
            batch_size: s.batch_size,
            retry_attempts: s.retry_attempts,
            retry_delay: Duration::from_millis(s.retry_delay_ms),
            mode: s.mode,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        let t = &self.transport;
        TransportConfig {
            timeout: Duration::from_secs(t.timeout_secs),
            danger_accept_invalid_certs: t.insecure,
            retry: RetryPolicy {
                max_retries: t.max_retries,
                base_delay: Duration::from_millis(t.base_delay_ms),
            },
        }
    }

    /// Breaker settings under `name`, or `None` when breakers are disabled.
    pub fn breaker_settings(&self, name: &str) -> Option<BreakerSettings> {
        let b = &self.breaker;
        b.enabled.then(|| BreakerSettings {
            name: name.to_owned(),
            max_half_open_requests: b.max_half_open,
            interval: Duration::from_secs(b.interval_secs),
            timeout: Duration::from_secs(b.timeout_secs),
            min_requests: b.min_requests,
            failure_ratio: b.failure_ratio,
        })
    }

    /// The history source, or `None` when `[tautulli]` is absent.
    pub fn history_source(&self) -> Result<Option<HistorySourceConfig>, ConfigError> {
        self.history_source_with(resolve_api_key)
    }

    /// Every configured Jellyfin and Emby server, in file order.
    pub fn media_servers(&self) -> Result<Vec<MediaServerConfig>, ConfigError> {
        self.media_servers_with(resolve_api_key)
    }

    fn history_source_with(
        &self,
        resolve: impl Fn(&str, &str, Option<&str>, Option<&str>) -> Result<SecretString, ConfigError>,
    ) -> Result<Option<HistorySourceConfig>, ConfigError> {
        let Some(ref section) = self.tautulli else {
            return Ok(None);
        };
        Ok(Some(HistorySourceConfig {
            url: parse_url("tautulli.url", &section.url)?,
            api_key: resolve(
                "tautulli",
                TAUTULLI_SERVER_ID,
                section.api_key.as_deref(),
                section.api_key_env.as_deref(),
            )?,
            breaker: self.breaker_settings("tautulli-api"),
            transport: self.transport_config(),
        }))
    }

    fn media_servers_with(
        &self,
        resolve: impl Fn(&str, &str, Option<&str>, Option<&str>) -> Result<SecretString, ConfigError>,
    ) -> Result<Vec<MediaServerConfig>, ConfigError> {
        let mut out = Vec::with_capacity(self.jellyfin.len() + self.emby.len());
        for (kind, servers) in self.servers() {
            for (i, server) in servers.iter().enumerate() {
                let mut config = MediaServerConfig {
                    kind,
                    url: parse_url(&format!("{kind}[{i}].url"), &server.url)?,
                    api_key: resolve(
                        kind.as_str(),
                        &server.server_id,
                        server.api_key.as_deref(),
                        server.api_key_env.as_deref(),
                    )?,
                    server_id: server.server_id.clone(),
                    user_id: server.user_id.clone(),
                    poller: server.poll.then(|| SessionPollerConfig {
                        interval: Duration::from_secs(server.poll_interval_secs),
                        ..SessionPollerConfig::default()
                    }),
                    websocket: server.websocket,
                    breaker: None,
                    transport: self.transport_config(),
                };
                config.breaker = self.breaker_settings(&config.breaker_name());
                out.push(config);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn plaintext(
        _: &str,
        _: &str,
        key: Option<&str>,
        _: Option<&str>,
    ) -> Result<SecretString, ConfigError> {
        key.map(|k| SecretString::from(k.to_owned()))
            .ok_or_else(|| ConfigError::NoCredentials {
                source_name: "test".into(),
            })
    }

    const FULL: &str = r#"
[sync]
interval_secs = 120
lookback_hours = 48
batch_size = 250
mode = "notification"

[tautulli]
url = "http://tautulli.local:8181"
api_key = "t-key"

[[jellyfin]]
url = "http://jellyfin.local:8096"
server_id = "living-room"
api_key = "j-key"
websocket = true

[[emby]]
url = "https://emby.local:8920"
server_id = "basement"
api_key = "e-key"
poll = false
user_id = "u-1"

[breaker]
failure_ratio = 0.5

[transport]
timeout_secs = 10
insecure = true
"#;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();

        assert!(config.tautulli.is_none());
        assert!(config.jellyfin.is_empty());
        assert_eq!(config.sync.batch_size, 1000);
        assert_eq!(config.sync.mode, DeliveryMode::EventSourcing);
        assert!(config.breaker.enabled);
    }

    #[test]
    fn full_file_translates_to_runtime_config() {
        let file = write_config(FULL);
        let config = load_config(Some(file.path())).unwrap();

        let sync = config.sync_config();
        assert_eq!(sync.interval, Duration::from_secs(120));
        assert_eq!(sync.lookback, Duration::from_secs(48 * 3600));
        assert_eq!(sync.batch_size, 250);
        assert_eq!(sync.retry_delay, Duration::from_secs(2));
        assert_eq!(sync.mode, DeliveryMode::Notification);

        let history = config.history_source_with(plaintext).unwrap().unwrap();
        assert_eq!(history.api_key.expose_secret(), "t-key");
        assert_eq!(history.breaker.unwrap().name, "tautulli-api");
        assert!(history.transport.danger_accept_invalid_certs);
        assert_eq!(history.transport.timeout, Duration::from_secs(10));

        let servers = config.media_servers_with(plaintext).unwrap();
        assert_eq!(servers.len(), 2);

        let jellyfin = &servers[0];
        assert_eq!(jellyfin.kind, ServerKind::Jellyfin);
        assert_eq!(jellyfin.server_id, "living-room");
        assert!(jellyfin.websocket);
        assert_eq!(jellyfin.poller.as_ref().unwrap().interval, Duration::from_secs(30));
        let breaker = jellyfin.breaker.as_ref().unwrap();
        assert_eq!(breaker.name, "jellyfin-living-room");
        assert!((breaker.failure_ratio - 0.5).abs() < f64::EPSILON);

        let emby = &servers[1];
        assert_eq!(emby.kind, ServerKind::Emby);
        assert!(emby.poller.is_none());
        assert_eq!(emby.user_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn disabled_breaker_yields_no_settings() {
        let file = write_config("[breaker]\nenabled = false\n");
        let config = load_config(Some(file.path())).unwrap();
        assert!(config.breaker_settings("tautulli-api").is_none());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let file = write_config("[sync]\nbatch_size = 0\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "sync.batch_size"));
    }

    #[test]
    fn failure_ratio_must_be_a_fraction() {
        for ratio in ["0.0", "1.5", "-0.2"] {
            let file = write_config(&format!("[breaker]\nfailure_ratio = {ratio}\n"));
            let err = load_config(Some(file.path())).unwrap_err();
            assert!(
                matches!(err, ConfigError::Validation { ref field, .. } if field == "breaker.failure_ratio"),
                "ratio {ratio}: {err}"
            );
        }

        let file = write_config("[breaker]\nfailure_ratio = 1.0\n");
        assert!(load_config(Some(file.path())).is_ok());
    }

    #[test]
    fn bad_urls_are_rejected() {
        let file = write_config("[tautulli]\nurl = \"not a url\"\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("tautulli.url"));

        let file = write_config("[[emby]]\nurl = \"ftp://emby.local\"\nserver_id = \"x\"\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn duplicate_server_ids_are_rejected() {
        let file = write_config(
            r#"
[[jellyfin]]
url = "http://a.local"
server_id = "same"

[[jellyfin]]
url = "http://b.local"
server_id = "same"
"#,
        );
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("duplicate server id"));
    }

    #[test]
    fn unknown_mode_fails_to_load() {
        let file = write_config("[sync]\nmode = \"fire-and-forget\"\n");
        assert!(matches!(
            load_config(Some(file.path())).unwrap_err(),
            ConfigError::Figment(_)
        ));
    }

    // ── Credential chain ─────────────────────────────────────────────

    #[test]
    fn env_var_wins_over_keyring_and_plaintext() {
        let key = resolve_api_key_with(
            "jellyfin",
            "living-room",
            Some("plain"),
            Some("JF_KEY"),
            |name| (name == "JF_KEY").then(|| "from-env".to_owned()),
            |_| Some("from-keyring".to_owned()),
        )
        .unwrap();
        assert_eq!(key.expose_secret(), "from-env");
    }

    #[test]
    fn keyring_is_looked_up_by_source_and_server() {
        let key = resolve_api_key_with(
            "emby",
            "basement",
            Some("plain"),
            Some("UNSET"),
            |_| None,
            |entry| (entry == "emby/basement").then(|| "from-keyring".to_owned()),
        )
        .unwrap();
        assert_eq!(key.expose_secret(), "from-keyring");
    }

    #[test]
    fn plaintext_is_the_last_resort() {
        let key =
            resolve_api_key_with("tautulli", "default", Some("plain"), None, |_| None, |_| None)
                .unwrap();
        assert_eq!(key.expose_secret(), "plain");

        let err = resolve_api_key_with("tautulli", "default", Some(""), None, |_| None, |_| None)
            .unwrap_err();
        assert_eq!(err.to_string(), "no API key configured for 'tautulli/default'");
    }
}
