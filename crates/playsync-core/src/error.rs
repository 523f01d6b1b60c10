// ── Core error types ──
//
// Domain errors for ingestion and delivery. Consumers never match on
// reqwest or serde failures directly: `From<playsync_api::Error>` folds
// transport-layer errors into the variants below.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Source errors ────────────────────────────────────────────────
    /// The source's circuit breaker is open; skip this cycle.
    #[error("Source {source_name} unavailable (circuit open)")]
    SourceUnavailable { source_name: String },

    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Cannot connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Request timed out")]
    Timeout,

    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    #[error("History fetch failed after {attempts} attempts: {message}")]
    FetchFailed { attempts: u32, message: String },

    // ── Record errors ────────────────────────────────────────────────
    #[error("Invalid record {session_key}: {reason}")]
    InvalidRecord { session_key: String, reason: String },

    // ── Collaborator errors ──────────────────────────────────────────
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Event bus error: {message}")]
    Bus { message: String },

    #[error("User resolution failed: {message}")]
    Resolver { message: String },

    /// Bus publish and store fallback both failed. The event is lost.
    #[error("Delivery failed on both paths for {correlation_key}: bus: {bus}; store: {store}")]
    DeliveryFailed {
        correlation_key: String,
        bus: String,
        store: String,
    },

    /// The bus accepted events its downstream writer failed to persist.
    #[error("{pending} events accepted by the bus were not persisted ({errors} downstream errors)")]
    FlushIncomplete { pending: u64, errors: u64 },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` when the backend is known to be down and the caller
    /// should skip this cycle instead of retrying.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::ConnectionFailed { .. } | Self::Timeout => true,
            Self::Api { status, .. } => status.is_some_and(|s| s >= 500),
            _ => false,
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<playsync_api::Error> for CoreError {
    fn from(err: playsync_api::Error) -> Self {
        use playsync_api::Error as ApiError;

        match err {
            ApiError::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e.url().map_or_else(|| "<unknown>".into(), redact),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            ApiError::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            ApiError::ClientBuild(message) => CoreError::Config { message },
            ApiError::RateLimitExceeded { attempts } => CoreError::RateLimited { attempts },
            ApiError::Status { status, body } => CoreError::Api {
                message: format!("HTTP {status}: {body}"),
                status: Some(status),
            },
            ApiError::Api { message } => CoreError::Api {
                message,
                status: None,
            },
            ApiError::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            ApiError::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            ApiError::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}

/// Drop the query string so API keys never reach logs or error messages.
fn redact(url: &url::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_maps_to_transient_core_error() {
        let err: CoreError = playsync_api::Error::RateLimitExceeded { attempts: 6 }.into();
        assert!(matches!(err, CoreError::RateLimited { attempts: 6 }));
        assert!(err.is_transient());
        assert!(err.to_string().contains("rate limit"));
    }

    #[test]
    fn envelope_error_maps_to_api() {
        let err: CoreError = playsync_api::Error::Api {
            message: "Invalid apikey".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Api { status: None, .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn open_circuit_is_unavailable() {
        let err = CoreError::SourceUnavailable {
            source_name: "tautulli-api".into(),
        };
        assert!(err.is_unavailable());
        assert!(!err.is_transient());
    }

    #[test]
    fn redact_strips_query() {
        let url = url::Url::parse("http://t:8181/api/v2?apikey=secret&cmd=arnold").unwrap();
        assert_eq!(redact(&url), "http://t:8181/api/v2");
    }
}
