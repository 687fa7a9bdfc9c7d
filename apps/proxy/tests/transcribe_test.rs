// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use streamscribe_server::Config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::Message;

fn dummy_config() -> Config {
    let mut config = Config::default();
    config.enable_dummy_provider = true;
    config.providers_priority = "dummy".to_string();
    config
}

async fn start_test_server(config: Config) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test server listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let server_handle = tokio::spawn(async move {
        let (app, _state) = streamscribe_server::server::create_app(config);
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    sleep(Duration::from_millis(50)).await;
    Some((addr, server_handle))
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let Some((addr, server_handle)) = start_test_server(dummy_config()).await else {
        return;
    };

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "response was: {response}");
    assert!(response.ends_with("OK"), "response was: {response}");

    server_handle.abort();
}

#[tokio::test]
async fn ping_round_trip() {
    let Some((addr, server_handle)) = start_test_server(dummy_config()).await else {
        return;
    };

    let url = format!("ws://{addr}/transcribe?provider=dummy&sendBack=true");
    let (mut ws, _response) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text(r#"{"event":"ping","id":7}"#.into())).await.unwrap();
    let reply = timeout(Duration::from_millis(500), ws.next())
        .await
        .expect("pong within deadline")
        .unwrap()
        .unwrap();
    let Message::Text(text) = reply else {
        panic!("expected text frame, got {reply:?}");
    };
    assert_eq!(text.as_str(), r#"{"event":"pong","id":7}"#);

    ws.close(None).await.unwrap();
    server_handle.abort();
}

#[tokio::test]
async fn missing_sink_is_refused_before_upgrade() {
    let Some((addr, server_handle)) = start_test_server(dummy_config()).await else {
        return;
    };

    let url = format!("ws://{addr}/transcribe?provider=dummy");
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    let tokio_tungstenite::tungstenite::Error::Http(response) = err else {
        panic!("Expected HTTP error, got: {err:?}");
    };
    assert_eq!(response.status(), 400);

    server_handle.abort();
}

#[tokio::test]
async fn unknown_provider_closes_with_policy_code() {
    let Some((addr, server_handle)) = start_test_server(dummy_config()).await else {
        return;
    };

    let url = format!("ws://{addr}/transcribe?provider=whisper&sendBack=true");
    let (mut ws, _response) = tokio_tungstenite::connect_async(url).await.unwrap();

    let frame = timeout(Duration::from_millis(500), ws.next())
        .await
        .expect("close frame within deadline")
        .unwrap()
        .unwrap();
    let Message::Close(Some(close)) = frame else {
        panic!("expected close frame, got {frame:?}");
    };
    assert_eq!(u16::from(close.code), 1002);
    assert!(close.reason.contains("whisper"));

    server_handle.abort();
}

#[tokio::test]
async fn media_events_are_accepted_without_response() {
    let Some((addr, server_handle)) = start_test_server(dummy_config()).await else {
        return;
    };

    let url = format!("ws://{addr}/transcribe?provider=dummy&sendBack=true");
    let (mut ws, _response) = tokio_tungstenite::connect_async(url).await.unwrap();

    for chunk in 0..5 {
        let media = format!(
            r#"{{"event":"media","media":{{"tag":"p1-100","payload":"QUJDRA==","chunk":{chunk},"timestamp":{}}}}}"#,
            chunk * 960
        );
        ws.send(Message::Text(media.into())).await.unwrap();
    }

    // The dummy backend never transcribes; the connection stays quiet and
    // healthy, which the ping confirms.
    ws.send(Message::Text(r#"{"event":"ping","id":1}"#.into())).await.unwrap();
    let reply = timeout(Duration::from_secs(1), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = reply else {
        panic!("expected pong, got {reply:?}");
    };
    assert!(text.contains("pong"));

    ws.close(None).await.unwrap();
    server_handle.abort();
}

#[tokio::test]
async fn malformed_json_does_not_disconnect() {
    let Some((addr, server_handle)) = start_test_server(dummy_config()).await else {
        return;
    };

    let url = format!("ws://{addr}/transcribe?provider=dummy&sendBack=true");
    let (mut ws, _response) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text("{definitely not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"event":"ping","id":2}"#.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(1), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = reply else {
        panic!("expected pong after malformed input, got {reply:?}");
    };
    assert_eq!(text.as_str(), r#"{"event":"pong","id":2}"#);

    ws.close(None).await.unwrap();
    server_handle.abort();
}

#[tokio::test]
async fn session_resumes_within_grace_period() {
    let mut config = dummy_config();
    config.session_resume_enabled = true;
    config.session_resume_grace_period = 30;
    let Some((addr, server_handle)) = start_test_server(config).await else {
        return;
    };

    let url = format!("ws://{addr}/transcribe?provider=dummy&sendBack=true&sessionId=S1");
    let (mut ws, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Text(r#"{"event":"ping","id":1}"#.into())).await.unwrap();
    timeout(Duration::from_secs(1), ws.next()).await.unwrap().unwrap().unwrap();
    drop(ws);

    // Reconnect with the same sessionId inside the grace window.
    sleep(Duration::from_millis(100)).await;
    let (mut ws, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Text(r#"{"event":"ping","id":2}"#.into())).await.unwrap();
    let reply = timeout(Duration::from_secs(1), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = reply else {
        panic!("expected pong on resumed session, got {reply:?}");
    };
    assert_eq!(text.as_str(), r#"{"event":"pong","id":2}"#);

    ws.close(None).await.unwrap();
    server_handle.abort();
}

#[tokio::test]
async fn duplicate_session_id_closes_the_first_socket() {
    let mut config = dummy_config();
    config.session_resume_enabled = true;
    let Some((addr, server_handle)) = start_test_server(config).await else {
        return;
    };

    let url = format!("ws://{addr}/transcribe?provider=dummy&sendBack=true&sessionId=DUP");
    let (mut first, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    first.send(Message::Text(r#"{"event":"ping","id":1}"#.into())).await.unwrap();
    timeout(Duration::from_secs(1), first.next()).await.unwrap().unwrap().unwrap();

    let (mut second, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    second.send(Message::Text(r#"{"event":"ping","id":2}"#.into())).await.unwrap();
    let reply = timeout(Duration::from_secs(1), second.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = reply else {
        panic!("expected pong on the replacement socket, got {reply:?}");
    };
    assert_eq!(text.as_str(), r#"{"event":"pong","id":2}"#);

    // The first socket is force-closed by the takeover.
    let frame = timeout(Duration::from_secs(1), first.next())
        .await
        .expect("first socket should close");
    match frame {
        Some(Ok(Message::Close(_))) | None => {},
        other => panic!("expected close on the first socket, got {other:?}"),
    }

    second.close(None).await.unwrap();
    server_handle.abort();
}
