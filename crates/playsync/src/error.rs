//! CLI error types with miette diagnostics.
//!
//! Maps `ConfigError` and `CoreError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use playsync_config::ConfigError;
use playsync_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to {url}")]
    #[diagnostic(
        code(playsync::connection_failed),
        help(
            "Check that the server is running and reachable.\n\
             Try: playsync check"
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Source {name} is unavailable")]
    #[diagnostic(
        code(playsync::source_unavailable),
        help("The circuit breaker is open after repeated failures. It retries on its own after the cooldown.")
    )]
    SourceUnavailable { name: String },

    #[error("{failed} of {total} sources failed the health check")]
    #[diagnostic(code(playsync::check_failed))]
    CheckFailed { failed: usize, total: usize },

    // ── Configuration ────────────────────────────────────────────────
    #[error("No sources configured")]
    #[diagnostic(
        code(playsync::no_sources),
        help(
            "Add a [tautulli] section or a [[jellyfin]] / [[emby]] entry.\n\
             Expected at: {path}"
        )
    )]
    NoSources { path: String },

    #[error("No history source configured")]
    #[diagnostic(
        code(playsync::no_history_source),
        help("`playsync sync` needs a [tautulli] section in the config file.")
    )]
    NoHistorySource,

    #[error("No API key for {source_name}")]
    #[diagnostic(
        code(playsync::no_credentials),
        help(
            "Set api_key_env to an environment variable holding the key,\n\
             store it in the system keyring under service 'playsync', entry '{source_name}',\n\
             or set api_key in the config file."
        )
    )]
    NoCredentials { source_name: String },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(playsync::config),
        help("Check the config file and PLAYSYNC_* environment variables.")
    )]
    Config(#[source] ConfigError),

    #[error("Could not set up client: {reason}")]
    #[diagnostic(code(playsync::client_setup))]
    ClientSetup { reason: String },

    // ── Usage ────────────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(playsync::validation))]
    Validation { field: String, reason: String },

    // ── Runtime ──────────────────────────────────────────────────────
    #[error("Sync failed: {0}")]
    #[diagnostic(code(playsync::sync_failed))]
    Core(#[source] CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render output: {0}")]
    #[diagnostic(code(playsync::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::SourceUnavailable { .. } | Self::CheckFailed { .. } => {
                exit_code::CONNECTION
            }
            Self::NoSources { .. }
            | Self::NoHistorySource
            | Self::NoCredentials { .. }
            | Self::Config(_)
            | Self::ClientSetup { .. } => exit_code::CONFIG,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Core(_) | Self::Io(_) | Self::Json(_) => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { source_name } => CliError::NoCredentials { source_name },
            other => CliError::Config(other),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed { url, reason },
            CoreError::SourceUnavailable { source_name } => CliError::SourceUnavailable { name: source_name },
            CoreError::Config { message } => CliError::ClientSetup { reason: message },
            other => CliError::Core(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        let err: CliError = CoreError::ConnectionFailed {
            url: "http://jellyfin.local".into(),
            reason: "refused".into(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_code::CONNECTION);

        let err: CliError = ConfigError::NoCredentials {
            source_name: "emby/basement".into(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_code::CONFIG);

        let err: CliError = ConfigError::Validation {
            field: "sync.batch_size".into(),
            reason: "must be greater than 0".into(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_code::CONFIG);

        let err = CliError::Validation {
            field: "bus-capacity".into(),
            reason: "must be greater than 0".into(),
        };
        assert_eq!(err.exit_code(), exit_code::USAGE);

        let err: CliError = CoreError::Timeout.into();
        assert_eq!(err.exit_code(), exit_code::GENERAL);
    }
}
