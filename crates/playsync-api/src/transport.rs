// Shared transport configuration and the rate-limit-aware request executor.
//
// Every backend client builds its `reqwest::Client` through `TransportConfig`
// and sends through `RateLimitedTransport`, so 429 handling lives in one place.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::error::Error;

/// Upper bound on how much of an error response body is read into memory.
pub(crate) const MAX_ERROR_BODY: usize = 64 * 1024;

/// Characters of an error body kept in `Error::Status` for display.
const ERROR_PREVIEW_CHARS: usize = 200;

// ── TransportConfig ──────────────────────────────────────────────────

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    /// Accept any certificate (self-signed media servers on a LAN).
    pub danger_accept_invalid_certs: bool,
    pub retry: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            danger_accept_invalid_certs: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        self.build_client_with_headers(HeaderMap::new())
    }

    /// Build a `reqwest::Client` with additional default headers.
    ///
    /// Used by the media server client to inject the `X-Emby-*` headers.
    pub fn build_client_with_headers(&self, headers: HeaderMap) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("playsync/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .danger_accept_invalid_certs(self.danger_accept_invalid_certs)
            .build()
            .map_err(|e| Error::ClientBuild(e.to_string()))
    }

    /// Build a client and wrap it in a [`RateLimitedTransport`].
    pub fn build_transport(&self, headers: HeaderMap) -> Result<RateLimitedTransport, Error> {
        let http = self.build_client_with_headers(headers)?;
        Ok(RateLimitedTransport::new(http, self.retry.clone()))
    }
}

// ── RetryPolicy ──────────────────────────────────────────────────────

/// Backoff policy for HTTP 429 responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Default: 5 (six attempts total).
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every further retry. Default: 1s.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^attempt`, where `attempt` is zero-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1_u32 << attempt.min(20))
    }

    /// Total number of attempts this policy allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// ── RateLimitedTransport ─────────────────────────────────────────────

/// Sends requests, retrying only on HTTP 429.
///
/// Any other status (success or failure) and any transport error is
/// returned to the caller on the first attempt. Cheap to clone and safe to
/// share between tasks: the inner `reqwest::Client` is reference counted.
#[derive(Debug, Clone)]
pub struct RateLimitedTransport {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl RateLimitedTransport {
    pub fn new(http: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { http, policy }
    }

    /// The underlying HTTP client, used to build requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a request, backing off on HTTP 429.
    ///
    /// A numeric `Retry-After` header takes precedence over the computed
    /// exponential delay. Dropping the returned future cancels any pending
    /// backoff sleep.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        let attempts = self.policy.attempts();
        let mut pending = Some(request);
        let mut made = 0;

        for attempt in 0..attempts {
            let Some(current) = pending.take() else { break };
            // Keep a copy for the next round; bodies that cannot be cloned
            // (streams) get exactly one attempt.
            pending = current.try_clone();

            debug!(method = %current.method(), url = %current.url(), attempt, "sending request");
            let resp = self.http.execute(current).await?;
            made += 1;

            if resp.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(resp);
            }

            if attempt + 1 >= attempts || pending.is_none() {
                break;
            }

            let delay = retry_after(resp.headers()).unwrap_or_else(|| self.policy.backoff(attempt));
            warn!(
                attempt = attempt + 1,
                max_attempts = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "rate limited (HTTP 429), backing off"
            );
            tokio::time::sleep(delay).await;
        }

        Err(Error::RateLimitExceeded { attempts: made })
    }
}

/// Parse a `Retry-After` header given in whole seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ── Error bodies ─────────────────────────────────────────────────────

/// Turn a non-success response into `Error::Status`, reading at most
/// [`MAX_ERROR_BODY`] bytes of the body.
pub(crate) async fn status_error(mut resp: Response) -> Error {
    let status = resp.status().as_u16();
    let mut buf: Vec<u8> = Vec::new();

    while buf.len() < MAX_ERROR_BODY {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_ERROR_BODY - buf.len();
                buf.extend_from_slice(chunk.get(..room.min(chunk.len())).unwrap_or_default());
            }
            Ok(None) | Err(_) => break,
        }
    }

    let body = String::from_utf8_lossy(&buf);
    Error::Status {
        status,
        body: body.chars().take(ERROR_PREVIEW_CHARS).collect(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────
