#![allow(clippy::unwrap_used)]
// End-to-end ingestion against mocked Jellyfin, Emby and Tautulli servers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use playsync_api::{MediaServerClient, RetryPolicy, ServerKind, TautulliClient, TransportConfig};
use playsync_core::{
    BreakerSettings, BreakerState, CoreError, EventBus, EventPublisher, MediaServerConfig,
    MemoryStore, PlaybackEvent, PlaybackState, Protected, SessionMonitor, SessionPollerConfig,
    Source, SyncConfig, SyncManager,
};

// ── Helpers ─────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingBus {
    events: Mutex<Vec<PlaybackEvent>>,
}

impl RecordingBus {
    fn events(&self) -> Vec<PlaybackEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventBus for RecordingBus {
    fn publish<'a>(&'a self, event: &'a PlaybackEvent) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        })
    }
}

fn transport() -> TransportConfig {
    TransportConfig {
        retry: RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(5),
        },
        ..TransportConfig::default()
    }
}

fn playing_session(id: &str, user: &str, title: &str) -> serde_json::Value {
    json!({
        "Id": id,
        "UserId": format!("{user}-id"),
        "UserName": user,
        "Client": "Jellyfin Web",
        "DeviceName": "Firefox",
        "DeviceId": "dev-1",
        "RemoteEndPoint": "192.0.2.10",
        "NowPlayingItem": {
            "Id": "item-1",
            "Name": title,
            "Type": "Movie",
            "RunTimeTicks": 72_000_000_000_i64
        },
        "PlayState": { "PositionTicks": 36_000_000_000_i64, "IsPaused": false, "PlayMethod": "DirectPlay" }
    })
}

async fn media_server(sessions: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sessions))
        .mount(&server)
        .await;
    server
}

fn monitor(kind: ServerKind, server_id: &str, server: &MockServer) -> SessionMonitor {
    let client = MediaServerClient::new(
        kind,
        &server.uri(),
        SecretString::from("token".to_owned()),
        None,
        &transport(),
    )
    .unwrap();
    SessionMonitor::new(server_id, Arc::new(client)).with_poller(SessionPollerConfig::default())
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_servers_produce_one_event_each() {
    // Same session id on both servers; server_id keeps them apart.
    let jellyfin = media_server(json!([playing_session("s1", "alice", "Heat")])).await;
    let emby = media_server(json!([playing_session("s1", "bob", "Ronin")])).await;

    let bus = Arc::new(RecordingBus::default());
    let publisher = Arc::new(EventPublisher::new(bus.clone()));
    let store = Arc::new(MemoryStore::new());
    let manager = SyncManager::builder(SyncConfig::default(), store)
        .publisher(publisher)
        .monitor(monitor(ServerKind::Jellyfin, "living-room", &jellyfin))
        .monitor(monitor(ServerKind::Emby, "basement", &emby))
        .build();

    manager.start().await;
    wait_for(|| bus.events().len() >= 2).await;
    manager.stop().await;

    let mut events = bus.events();
    events.sort_by(|a, b| a.server_id.cmp(&b.server_id));
    assert_eq!(events.len(), 2);

    assert_eq!(events[0].server_id.as_deref(), Some("basement"));
    assert_eq!(events[0].source, Source::Emby);
    assert_eq!(events[0].title, "Ronin");

    assert_eq!(events[1].server_id.as_deref(), Some("living-room"));
    assert_eq!(events[1].source, Source::Jellyfin);
    assert_eq!(events[1].username, "alice");
    assert_eq!(events[1].state, PlaybackState::Playing);
    assert_eq!(events[1].percent_complete, 50);

    assert_ne!(events[0].compute_correlation_key(), events[1].compute_correlation_key());
}

#[tokio::test]
async fn test_idle_sessions_produce_no_events() {
    let jellyfin = media_server(json!([{ "Id": "idle", "UserName": "carol" }])).await;

    let bus = Arc::new(RecordingBus::default());
    let monitor = monitor(ServerKind::Jellyfin, "living-room", &jellyfin);
    monitor.set_publisher(Some(Arc::new(EventPublisher::new(bus.clone()))));

    monitor.start().await;
    for _ in 0..200 {
        if !jellyfin.received_requests().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    monitor.stop().await;

    assert!(!jellyfin.received_requests().await.unwrap().is_empty());
    assert!(bus.events().is_empty());
}

#[tokio::test]
async fn test_publish_session_stamps_server_id() {
    let jellyfin = MockServer::start().await;

    let bus = Arc::new(RecordingBus::default());
    let monitor = monitor(ServerKind::Jellyfin, "living-room", &jellyfin);
    monitor.set_publisher(Some(Arc::new(EventPublisher::new(bus.clone()))));

    let session: playsync_api::mediaserver::Session =
        serde_json::from_value(playing_session("s1", "alice", "Heat")).unwrap();
    let delivered = monitor.publish_session(&session).await.unwrap();

    assert!(delivered.is_some());
    let events = bus.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].server_id.as_deref(), Some("living-room"));
    assert!(events[0].correlation_key.is_some());
}

#[tokio::test]
async fn test_disabled_server_gets_no_monitor() {
    let config = MediaServerConfig {
        kind: ServerKind::Jellyfin,
        url: Url::parse("http://jellyfin.local:8096").unwrap(),
        api_key: SecretString::from("token".to_owned()),
        server_id: "attic".into(),
        user_id: None,
        poller: None,
        websocket: false,
        breaker: None,
        transport: TransportConfig::default(),
    };
    assert!(SessionMonitor::from_config(&config).unwrap().is_none());

    let config = MediaServerConfig {
        poller: Some(SessionPollerConfig::default()),
        breaker: Some(BreakerSettings::default()),
        ..config
    };
    let monitor = SessionMonitor::from_config(&config).unwrap().unwrap();
    assert_eq!(monitor.server_id(), "attic");
    assert_eq!(monitor.breaker().unwrap().name(), "jellyfin-attic");
}

#[tokio::test]
async fn test_tautulli_history_flows_into_store() {
    let tautulli = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2"))
        .and(query_param("cmd", "get_history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "result": "success",
                "message": null,
                "data": {
                    "recordsFiltered": 2,
                    "recordsTotal": 2,
                    "data": [
                        {
                            "session_key": "41", "started": 1_700_000_000, "stopped": 1_700_003_600,
                            "user_id": 4, "user": "alice", "ip_address": "198.51.100.7",
                            "media_type": "movie", "title": "Arrival", "rating_key": 321
                        },
                        {
                            "session_key": "42", "started": 1_700_010_000, "stopped": 1_700_011_000,
                            "user_id": 5, "user": "bob", "ip_address": "198.51.100.8",
                            "media_type": "episode", "title": "Pilot", "grandparent_title": "Severance",
                            "rating_key": 654
                        }
                    ]
                }
            }
        })))
        .mount(&tautulli)
        .await;

    let client = TautulliClient::new(
        &tautulli.uri(),
        SecretString::from("key".to_owned()),
        &transport(),
    )
    .unwrap();
    let source = Arc::new(Protected::new(client, BreakerSettings::named("tautulli-api")));
    let breaker = source.breaker().clone();

    let store = Arc::new(MemoryStore::new());
    let manager = SyncManager::builder(SyncConfig::default(), store.clone())
        .history_source(source)
        .build();

    let report = manager.trigger_sync().await.unwrap();

    assert_eq!(report.new_records, 2);
    assert_eq!(report.pages, 1);
    let events = store.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].source, Source::Tautulli);
    assert_eq!(events[0].state, PlaybackState::Stopped);
    assert_eq!(events[1].grandparent_title.as_deref(), Some("Severance"));
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.metrics().successes, 1);
}
