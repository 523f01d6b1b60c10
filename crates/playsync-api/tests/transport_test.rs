#![allow(clippy::unwrap_used)]
// Rate-limit behavior of `RateLimitedTransport` against a mock backend.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use playsync_api::{Error, RateLimitedTransport, RetryPolicy};

// ── Helpers ─────────────────────────────────────────────────────────

fn transport(max_retries: u32, base_delay: Duration) -> RateLimitedTransport {
    RateLimitedTransport::new(
        reqwest::Client::new(),
        RetryPolicy {
            max_retries,
            base_delay,
        },
    )
}

async fn get(transport: &RateLimitedTransport, server: &MockServer) -> Result<reqwest::Response, Error> {
    let request = transport
        .http()
        .get(format!("{}/history", server.uri()))
        .build()
        .unwrap();
    transport.execute(request).await
}

/// Answers the first `limited` requests with 429 and records when each
/// request arrived.
#[derive(Clone)]
struct Throttled {
    limited: usize,
    retry_after: Option<&'static str>,
    arrivals: Arc<Mutex<Vec<Instant>>>,
}

impl Throttled {
    fn new(limited: usize, retry_after: Option<&'static str>) -> Self {
        Self {
            limited,
            retry_after,
            arrivals: Arc::default(),
        }
    }

    /// Time between consecutive requests.
    fn gaps(&self) -> Vec<Duration> {
        let arrivals = self.arrivals.lock().unwrap();
        arrivals.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

impl Respond for Throttled {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let mut arrivals = self.arrivals.lock().unwrap();
        arrivals.push(Instant::now());
        if arrivals.len() > self.limited {
            return ResponseTemplate::new(200).set_body_string("ok");
        }
        let template = ResponseTemplate::new(429);
        match self.retry_after {
            Some(secs) => template.insert_header("Retry-After", secs),
            None => template,
        }
    }
}

fn assert_within_20_percent(actual: Duration, expected: Duration) {
    let low = expected.mul_f64(0.8);
    let high = expected.mul_f64(1.2);
    assert!(
        actual >= low && actual <= high,
        "gap {actual:?} outside {low:?}..={high:?}"
    );
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_recovers_after_two_rate_limited_attempts() {
    let server = MockServer::start().await;
    let backend = Throttled::new(2, None);
    Mock::given(method("GET"))
        .and(path("/history"))
        .respond_with(backend.clone())
        .expect(3)
        .mount(&server)
        .await;

    let transport = transport(5, Duration::from_secs(1));
    let resp = get(&transport, &server).await.unwrap();

    assert_eq!(resp.status(), 200);
    let gaps = backend.gaps();
    assert_eq!(gaps.len(), 2, "expected exactly 3 attempts");
    assert_within_20_percent(gaps[0], Duration::from_secs(1));
    assert_within_20_percent(gaps[1], Duration::from_secs(2));
}

#[tokio::test]
async fn test_always_rate_limited_fails_after_all_attempts() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(4)
        .mount(&server)
        .await;

    let transport = transport(3, Duration::from_millis(5));
    let err = get(&transport, &server).await.unwrap_err();

    assert!(matches!(err, Error::RateLimitExceeded { attempts: 4 }));
    assert!(err.to_string().contains("rate limit"));
}

#[tokio::test]
async fn test_retry_after_header_overrides_backoff() {
    let server = MockServer::start().await;
    let backend = Throttled::new(1, Some("2"));
    Mock::given(method("GET"))
        .respond_with(backend.clone())
        .expect(2)
        .mount(&server)
        .await;

    // Computed backoff would be 100ms; the header asks for two seconds.
    let transport = transport(5, Duration::from_millis(100));
    let resp = get(&transport, &server).await.unwrap();

    assert_eq!(resp.status(), 200);
    let gaps = backend.gaps();
    assert_eq!(gaps.len(), 1);
    assert_within_20_percent(gaps[0], Duration::from_secs(2));
}

#[tokio::test]
async fn test_other_failures_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(5, Duration::from_millis(5));
    let resp = get(&transport, &server).await.unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_shared_transport_serves_concurrent_callers() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(8)
        .mount(&server)
        .await;

    let transport = transport(1, Duration::from_millis(5));
    let calls = (0..8).map(|_| get(&transport, &server));
    let results = futures_util::future::join_all(calls).await;
    assert!(results.iter().all(Result::is_ok));
}
