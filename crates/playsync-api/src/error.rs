use thiserror::Error;

/// Top-level error type for the `playsync-api` crate.
///
/// Covers every failure mode across the backend surfaces: transport,
/// rate limiting, Tautulli envelopes, media server REST, and WebSocket.
/// `playsync-core` maps these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    // ── Rate limiting ───────────────────────────────────────────────
    /// The backend kept answering HTTP 429 until the retry budget ran out.
    #[error("rate limit exceeded after {attempts} attempts (HTTP 429)")]
    RateLimitExceeded { attempts: u32 },

    // ── HTTP ────────────────────────────────────────────────────────
    /// Non-success HTTP status, with a truncated body preview.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    // ── Backend envelopes ───────────────────────────────────────────
    /// Tautulli answered with `result != "success"` (even on HTTP 200).
    #[error("API error: {message}")]
    Api { message: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimitExceeded { .. } | Self::WebSocketConnect(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if the retry budget was exhausted on HTTP 429.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// The HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::Status { status, .. } => Some(*status),
            Self::RateLimitExceeded { .. } => Some(429),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_message_names_attempts() {
        let err = Error::RateLimitExceeded { attempts: 6 };
        assert_eq!(
            err.to_string(),
            "rate limit exceeded after 6 attempts (HTTP 429)"
        );
        assert!(err.is_rate_limited());
        assert!(err.is_transient());
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn client_errors_are_not_transient() {
        let err = Error::Status {
            status: 404,
            body: "not found".into(),
        };
        assert!(!err.is_transient());

        let err = Error::Status {
            status: 503,
            body: String::new(),
        };
        assert!(err.is_transient());

        let err = Error::Api {
            message: "Invalid apikey".into(),
        };
        assert!(!err.is_transient());
    }
}
