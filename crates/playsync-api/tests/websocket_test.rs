#![allow(clippy::unwrap_used)]
// End-to-end test of `SessionStream` against an in-process WebSocket server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use playsync_api::websocket::{ReconnectConfig, SessionStream, StreamHandlers};

#[tokio::test]
async fn test_subscribes_dispatches_and_answers_keepalive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        // Subscription request comes first
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            frames_tx.send(text.to_string()).unwrap();
        }

        ws.send(Message::text(
            r#"{"MessageType":"Sessions","Data":[{"Id":"s1","NowPlayingItem":{"Id":"i1","Name":"Film"}}]}"#,
        ))
        .await
        .unwrap();
        ws.send(Message::text(r#"{"MessageType":"ForceKeepAlive","Data":60}"#))
            .await
            .unwrap();

        if let Some(Ok(Message::Text(text))) = ws.next().await {
            frames_tx.send(text.to_string()).unwrap();
        }

        // Hold the connection until the client closes it
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let (sessions_tx, mut sessions_rx) = mpsc::unbounded_channel();
    let handlers = StreamHandlers::default().on_sessions(move |sessions| {
        let tx = sessions_tx.clone();
        async move {
            let _ = tx.send(sessions);
        }
    });

    let url = Url::parse(&format!("ws://{addr}/socket?api_key=k&deviceId=playsync")).unwrap();
    let stream = SessionStream::connect(
        url,
        handlers,
        ReconnectConfig::default(),
        CancellationToken::new(),
    );

    let wait = Duration::from_secs(5);

    let subscribe = tokio::time::timeout(wait, frames_rx.recv()).await.unwrap().unwrap();
    assert!(subscribe.contains("SessionsStart"), "{subscribe}");

    let sessions = tokio::time::timeout(wait, sessions_rx.recv()).await.unwrap().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, "s1");
    assert!(stream.is_connected());

    let keepalive = tokio::time::timeout(wait, frames_rx.recv()).await.unwrap().unwrap();
    assert!(keepalive.contains("KeepAlive"), "{keepalive}");

    stream.close().await;
    assert!(!stream.is_connected());
    // Closing twice is fine
    stream.close().await;

    tokio::time::timeout(wait, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_while_server_unreachable() {
    // Nothing listens on this port; the loop sits in backoff until closed.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("ws://{addr}/socket")).unwrap();
    let stream = SessionStream::connect(
        url,
        StreamHandlers::default(),
        ReconnectConfig::default(),
        CancellationToken::new(),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stream.is_connected());

    tokio::time::timeout(Duration::from_secs(2), stream.close())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_waits_for_running_handlers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let _subscribe = ws.next().await;
        ws.send(Message::text(r#"{"MessageType":"Sessions","Data":[{"Id":"s1"}]}"#))
            .await
            .unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));
    let done = finished.clone();
    let handlers = StreamHandlers::default().on_sessions(move |_sessions| {
        let started = started_tx.clone();
        let done = done.clone();
        async move {
            let _ = started.send(());
            tokio::time::sleep(Duration::from_millis(300)).await;
            done.store(true, Ordering::SeqCst);
        }
    });

    let url = Url::parse(&format!("ws://{addr}/socket")).unwrap();
    let stream = SessionStream::connect(
        url,
        handlers,
        ReconnectConfig::default(),
        CancellationToken::new(),
    );

    tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!finished.load(Ordering::SeqCst));

    stream.close().await;
    assert!(finished.load(Ordering::SeqCst), "close returned while a handler was still running");

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}
