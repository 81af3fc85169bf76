//! End-to-end tests for the broadcast server.
//!
//! These tests bind a real server on a free port and talk to it with raw
//! `tokio-tungstenite` sockets and hand-written HTTP requests.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use modelcast_core::{shared, LiveModel, Operation, SharedModel};
use modelcast_sync::protocol::{decode_value, encode_value, ApiResponse};
use modelcast_sync::server::{AuthRejection, ServerError, ServerEvent, WsServer};
use modelcast_sync::config::ServerConfig;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig, model: SharedModel) -> (WsServer, mpsc::Receiver<ServerEvent>) {
    let server = WsServer::bind(config, model).await.unwrap();
    let events = server.take_event_rx().unwrap();
    (server, events)
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}/")
}

async fn next_event(events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("server event channel closed")
}

/// Read the next text frame and unwrap its envelope.
async fn next_payload(socket: &mut Socket) -> (String, Value) {
    loop {
        let message = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            let raw = text.as_str().to_string();
            let payload = decode_value(&raw).unwrap();
            return (raw, payload);
        }
    }
}

async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("timed out reading HTTP response")
        .unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_connect_without_auth() {
    let model = shared(LiveModel::new());
    model
        .write()
        .unwrap()
        .mutate(&[Operation::set("title", "hello")])
        .unwrap();
    let (server, mut events) = start(test_config(), model).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(server.local_addr()))
        .await
        .unwrap();

    let client_id = match next_event(&mut events).await {
        ServerEvent::ClientNew(info) => info.client_id,
        other => panic!("expected ClientNew, got {other:?}"),
    };
    assert_eq!(server.metrics().await.num_connections, 1);

    // Full refresh first.
    let (_, refresh) = next_payload(&mut socket).await;
    assert_eq!(refresh["type"], json!("apply"));
    assert_eq!(refresh["ops"][0]["type"], json!("$clearAll"));
    assert_eq!(refresh["ops"][1]["type"], json!("$shallowAssign"));
    assert_eq!(refresh["ops"][1]["value"], json!({"title": "hello"}));

    socket.close(None).await.unwrap();
    match next_event(&mut events).await {
        ServerEvent::ClientEnd { client_id: ended } => assert_eq!(ended, client_id),
        other => panic!("expected ClientEnd, got {other:?}"),
    }
    assert_eq!(server.metrics().await.num_connections, 0);

    server.close().await;
}

#[tokio::test]
async fn test_model_mutation_reaches_client() {
    let model = shared(LiveModel::new());
    let (server, mut events) = start(test_config(), model.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(server.local_addr()))
        .await
        .unwrap();
    let _ = next_event(&mut events).await;
    let _ = next_payload(&mut socket).await;

    model
        .write()
        .unwrap()
        .mutate(&[Operation::set("a.b", 1), Operation::merge("c", json!({"d": 2}))])
        .unwrap();

    let (_, delta) = next_payload(&mut socket).await;
    assert_eq!(delta["type"], json!("apply"));
    assert_eq!(delta["ops"].as_array().unwrap().len(), 2);
    assert_eq!(delta["ops"][0]["type"], json!("$set"));
    assert_eq!(delta["ops"][0]["keyPath"], json!("a.b"));

    server.close().await;
}

#[tokio::test]
async fn test_auth_timeout_rejects_with_503() {
    let config = ServerConfig {
        auth_enabled: true,
        auth_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let (server, mut events) = start(config, shared(LiveModel::new())).await;

    let result = tokio_tungstenite::connect_async(ws_url(server.local_addr())).await;
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 503),
        Err(other) => panic!("expected HTTP rejection, got {other:?}"),
        Ok(_) => panic!("upgrade should not succeed without authorization"),
    }

    assert!(matches!(next_event(&mut events).await, ServerEvent::WsAuthRequest(_)));
    let metrics = server.metrics().await;
    assert_eq!(metrics.auth_timeouts, 1);
    assert_eq!(metrics.pending_auth, 0);
    assert_eq!(metrics.num_connections, 0);

    server.close().await;
}

#[tokio::test]
async fn test_auth_hangup_clears_pending_upgrade() {
    let config = ServerConfig {
        auth_enabled: true,
        auth_timeout: Duration::from_secs(3),
        ..test_config()
    };
    let (server, mut events) = start(config, shared(LiveModel::new())).await;
    let addr = server.local_addr();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let upgrade = format!(
        "GET / HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(upgrade.as_bytes()).await.unwrap();

    let client_id = match next_event(&mut events).await {
        ServerEvent::WsAuthRequest(request) => request.client_id,
        other => panic!("expected WsAuthRequest, got {other:?}"),
    };
    assert_eq!(server.metrics().await.pending_auth, 1);

    drop(stream);
    let mut cleared = false;
    for _ in 0..60 {
        if server.metrics().await.pending_auth == 0 {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(cleared, "pending upgrade outlived its connection");
    assert_eq!(server.metrics().await.auth_timeouts, 0);

    // A late decision for the vanished client is a no-op.
    server.authorize_websocket(&client_id);
    assert_eq!(server.metrics().await.num_connections, 0);

    server.close().await;
}

#[tokio::test]
async fn test_auth_authorize_and_reject() {
    let config = ServerConfig {
        auth_enabled: true,
        auth_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let (server, mut events) = start(config, shared(LiveModel::new())).await;

    // Answer auth requests based on a header, like a backend would.
    let authorizer = server.clone();
    let (forward_tx, mut forwarded) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ServerEvent::WsAuthRequest(request) = &event {
                if request.headers.get("x-demo-token").map(String::as_str) == Some("letmein") {
                    authorizer.authorize_websocket(&request.client_id);
                } else {
                    authorizer.reject_websocket(&request.client_id, AuthRejection::new(401, "bad token"));
                }
            }
            let _ = forward_tx.send(event);
        }
    });

    let url = ws_url(server.local_addr());
    match tokio_tungstenite::connect_async(url.as_str()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        Err(other) => panic!("expected HTTP rejection, got {other:?}"),
        Ok(_) => panic!("upgrade without token should be rejected"),
    }

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-demo-token", HeaderValue::from_static("letmein"));
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let (_, refresh) = next_payload(&mut socket).await;
    assert_eq!(refresh["type"], json!("apply"));

    let mut saw_client_new = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(500), forwarded.recv()).await {
        if matches!(event, ServerEvent::ClientNew(_)) {
            saw_client_new = true;
            break;
        }
    }
    assert!(saw_client_new);

    let metrics = server.metrics().await;
    assert_eq!(metrics.auth_rejections, 1);
    assert_eq!(metrics.num_connections, 1);

    server.close().await;
}

#[tokio::test]
async fn test_broadcast_reaches_each_client_once() {
    let (server, mut events) = start(test_config(), shared(LiveModel::new())).await;
    let url = ws_url(server.local_addr());

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let _ = next_event(&mut events).await;
    let _ = next_event(&mut events).await;
    let _ = next_payload(&mut first).await;
    let _ = next_payload(&mut second).await;

    server.broadcast(&json!({"type": "foo", "n": 1})).unwrap();

    let (raw_first, payload) = next_payload(&mut first).await;
    let (raw_second, _) = next_payload(&mut second).await;
    assert_eq!(raw_first, raw_second);
    assert_eq!(payload, json!({"type": "foo", "n": 1}));

    // Nothing else queued.
    assert!(timeout(Duration::from_millis(150), first.next()).await.is_err());
    assert!(timeout(Duration::from_millis(150), second.next()).await.is_err());

    let stats = server.metrics().await.broadcast;
    assert_eq!(stats.broadcasts, 1);

    server.close().await;
}

#[tokio::test]
async fn test_broadcast_requires_type() {
    let (server, _events) = start(test_config(), shared(LiveModel::new())).await;
    let result = server.broadcast(&json!({"n": 1}));
    assert!(matches!(result, Err(ServerError::InvalidMessage(_))));
    server.close().await;
}

#[tokio::test]
async fn test_send_one_targets_single_client() {
    let (server, mut events) = start(test_config(), shared(LiveModel::new())).await;
    let url = ws_url(server.local_addr());

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let first_id = match next_event(&mut events).await {
        ServerEvent::ClientNew(info) => info.client_id,
        other => panic!("expected ClientNew, got {other:?}"),
    };
    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let _ = next_event(&mut events).await;
    let _ = next_payload(&mut first).await;
    let _ = next_payload(&mut second).await;

    let connected = server.connected_clients().await;
    assert_eq!(connected.len(), 2);
    assert!(connected.iter().any(|info| info.client_id == first_id));

    server
        .send_one(&first_id, &json!({"type": "note", "to": "first"}))
        .unwrap();
    let (_, payload) = next_payload(&mut first).await;
    assert_eq!(payload["to"], json!("first"));
    assert!(timeout(Duration::from_millis(150), second.next()).await.is_err());

    // Unknown client is dropped without error.
    server
        .send_one("no-such-client", &json!({"type": "note"}))
        .unwrap();

    server.close().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let (server, mut events) = start(test_config(), shared(LiveModel::new())).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(server.local_addr()))
        .await
        .unwrap();
    let client_id = match next_event(&mut events).await {
        ServerEvent::ClientNew(info) => info.client_id,
        other => panic!("expected ClientNew, got {other:?}"),
    };

    socket.send(Message::Text("not json".into())).await.unwrap();
    match next_event(&mut events).await {
        ServerEvent::IncomingMessageMalformed {
            client_id: from,
            msg_str,
            ..
        } => {
            assert_eq!(from, client_id);
            assert_eq!(msg_str, "not json");
        }
        other => panic!("expected IncomingMessageMalformed, got {other:?}"),
    }

    let frame = encode_value(&json!({"type": "rpc_request", "rpcId": "r1", "fnName": "echo"}));
    socket.send(Message::Text(frame.clone().into())).await.unwrap();
    match next_event(&mut events).await {
        ServerEvent::IncomingMessage { payload, meta } => {
            assert_eq!(payload["fnName"], json!("echo"));
            assert_eq!(meta.client_id, client_id);
            assert_eq!(meta.raw_length, frame.len());
            assert!(meta.received_at >= meta.connected_at);
        }
        other => panic!("expected IncomingMessage, got {other:?}"),
    }

    assert_eq!(server.metrics().await.malformed_messages, 1);
    server.close().await;
}

#[tokio::test]
async fn test_api_request_resolved() {
    let (server, mut events) = start(test_config(), shared(LiveModel::new())).await;

    let responder = server.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ServerEvent::ApiRequest(request) = event {
                let body = json!({"path": request.path, "query": request.query, "body": request.body});
                responder.resolve_api(ApiResponse::new(request.req_id, 201, body));
            }
        }
    });

    let (status, body) = http_request(server.local_addr(), "POST", "/api/items?x=1", r#"{"a":1}"#).await;
    assert_eq!(status, 201);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["path"], json!("/items"));
    assert_eq!(body["query"], json!({"x": "1"}));
    assert_eq!(body["body"], json!({"a": 1}));

    server.close().await;
}

#[tokio::test]
async fn test_api_request_times_out() {
    let config = ServerConfig {
        api_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let (server, mut events) = start(config, shared(LiveModel::new())).await;

    let (status, body) = http_request(server.local_addr(), "GET", "/api/slow", "").await;
    assert_eq!(status, 504);
    assert!(body.contains("error"));

    let req_id = match next_event(&mut events).await {
        ServerEvent::ApiRequest(request) => request.req_id,
        other => panic!("expected ApiRequest, got {other:?}"),
    };
    // Late answer is dropped.
    assert!(!server.resolve_api(ApiResponse::new(req_id, 200, Value::Null)));
    assert_eq!(server.metrics().await.pending_api, 0);

    server.close().await;
}

#[tokio::test]
async fn test_close_rejects_new_upgrades() {
    let (server, _events) = start(test_config(), shared(LiveModel::new())).await;
    let addr = server.local_addr();
    server.close().await;
    server.close().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tokio_tungstenite::connect_async(ws_url(addr)).await.is_err());
}
