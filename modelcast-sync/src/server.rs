//! WebSocket broadcast server.
//!
//! Architecture:
//! ```text
//!                 ┌──────────── axum router ────────────┐
//!  upgrade ──────▸│ ws_path    ── auth gate ── socket   │──▸ ServerEvent channel
//!  HTTP ─────────▸│ api_prefix ── ApiBridge ── 504      │
//!                 └──────────────────┬──────────────────┘
//!                                    │ attach / detach
//!  LiveModel ── listener ── encode ──▸ Pump ──▸ per-client queues
//! ```
//!
//! Each connection gets a full refresh (`$clearAll` + `$shallowAssign`) taken
//! under the model read lock and enqueued on the pump before the lock is
//! released. Every later model mutation reaches the client as a delta.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use modelcast_core::{full_refresh, SharedModel};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::api::{parse_body, ApiBridge};
use crate::broadcast::{client_channel, BroadcastStats, ClientInfo, Outbound, Pump};
use crate::config::ServerConfig;
use crate::protocol::{
    decode_value, encode_value, now_ms, ApiRequest, ApiResponse, InnerMessage, MessageMeta,
    ProtocolError, WsAuthRequest,
};

/// Events raised by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientNew(ClientInfo),
    ClientEnd {
        client_id: String,
    },
    IncomingMessage {
        payload: Value,
        meta: MessageMeta,
    },
    IncomingMessageMalformed {
        client_id: String,
        msg_str: String,
        error: ProtocolError,
    },
    WsAuthRequest(WsAuthRequest),
    ApiRequest(ApiRequest),
}

/// Refusal of a pending WebSocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRejection {
    /// HTTP status returned instead of the upgrade
    pub code: u16,
    pub message: String,
}

impl AuthRejection {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        (status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug)]
enum AuthDecision {
    Allow,
    Reject(AuthRejection),
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Invalid outbound message: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Server counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMetrics {
    pub num_connections: usize,
    pub pending_auth: usize,
    pub pending_api: usize,
    pub auth_timeouts: u64,
    pub auth_rejections: u64,
    pub malformed_messages: u64,
    pub broadcast: BroadcastStats,
}

struct ServerInner {
    config: ServerConfig,
    model: SharedModel,
    pump: Pump,
    api: ApiBridge,
    pending_auth: Mutex<HashMap<String, oneshot::Sender<AuthDecision>>>,
    events: mpsc::Sender<ServerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    auth_timeouts: AtomicU64,
    auth_rejections: AtomicU64,
    malformed_messages: AtomicU64,
}

/// The broadcast server. Cheap to clone; all clones share one listener.
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<ServerInner>,
}

impl WsServer {
    /// Bind, hook into `model`, and start serving in the background.
    pub async fn bind(config: ServerConfig, model: SharedModel) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;

        let pump = Pump::spawn(config.broadcast_concurrency, config.slow_client_timeout);
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let delta_pump = pump.clone();
        model
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_listener(move |ops| match InnerMessage::apply(ops.to_vec()).encode() {
                Ok(frame) => delta_pump.broadcast(Arc::from(frame)),
                Err(e) => log::error!("Failed to encode model delta: {e}"),
            });

        let server = Self {
            inner: Arc::new(ServerInner {
                api: ApiBridge::new(config.api_timeout),
                config,
                model,
                pump,
                pending_auth: Mutex::new(HashMap::new()),
                events,
                event_rx: Mutex::new(Some(event_rx)),
                local_addr,
                shutdown,
                closed: AtomicBool::new(false),
                auth_timeouts: AtomicU64::new(0),
                auth_rejections: AtomicU64::new(0),
                malformed_messages: AtomicU64::new(0),
            }),
        };

        let prefix = server.inner.config.api_prefix.trim_end_matches('/').to_string();
        let router = Router::new()
            .route(&server.inner.config.ws_path, get(ws_handler))
            .route(&prefix, any(api_handler))
            .route(&format!("{prefix}/{{*rest}}"), any(api_handler))
            .with_state(server.clone());

        tokio::spawn(async move {
            let served = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|closed| *closed).await;
            })
            .await;
            if let Err(e) = served {
                log::error!("WebSocket server stopped: {e}");
            }
        });

        log::info!("Broadcast server listening on {local_addr}");
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn model(&self) -> &SharedModel {
        &self.inner.model
    }

    /// Take the event receiver. Succeeds once.
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.inner
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Complete a pending upgrade.
    pub fn authorize_websocket(&self, client_id: &str) {
        match self.take_pending_auth(client_id) {
            Some(tx) => {
                if tx.send(AuthDecision::Allow).is_err() {
                    log::debug!("Upgrade for {client_id} abandoned before authorization");
                }
            }
            None => log::warn!("authorize_websocket: no pending upgrade for {client_id}"),
        }
    }

    /// Refuse a pending upgrade with an HTTP error.
    pub fn reject_websocket(&self, client_id: &str, rejection: AuthRejection) {
        match self.take_pending_auth(client_id) {
            Some(tx) => {
                self.inner.auth_rejections.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(AuthDecision::Reject(rejection));
            }
            None => log::warn!("reject_websocket: no pending upgrade for {client_id}"),
        }
    }

    /// Encode once and send to every client.
    ///
    /// The message must serialize to an object with a string `type`.
    pub fn broadcast<T: Serialize>(&self, message: &T) -> Result<(), ServerError> {
        let value = serde_json::to_value(message)?;
        if !value.get("type").is_some_and(Value::is_string) {
            return Err(ServerError::InvalidMessage(
                "broadcast messages must be objects with a string \"type\"".into(),
            ));
        }
        self.inner.pump.broadcast(Arc::from(encode_value(&value)));
        Ok(())
    }

    /// Send one message to one client. Unknown clients are logged and skipped.
    pub fn send_one<T: Serialize>(&self, client_id: &str, message: &T) -> Result<(), ServerError> {
        let value = serde_json::to_value(message)?;
        self.send_one_raw(client_id, encode_value(&value));
        Ok(())
    }

    /// Send an already-encoded envelope to one client.
    pub fn send_one_raw(&self, client_id: &str, frame: String) {
        self.inner.pump.unicast(client_id, Arc::from(frame));
    }

    /// Deliver a backend answer to a held HTTP request.
    pub fn resolve_api(&self, response: ApiResponse) -> bool {
        self.inner.api.resolve(response)
    }

    pub async fn connected_clients(&self) -> Vec<ClientInfo> {
        self.inner.pump.clients().await
    }

    pub async fn metrics(&self) -> ServerMetrics {
        let broadcast = self.inner.pump.stats().await;
        ServerMetrics {
            num_connections: broadcast.active_clients,
            pending_auth: self.lock_pending_auth().len(),
            pending_api: self.inner.api.pending_count(),
            auth_timeouts: self.inner.auth_timeouts.load(Ordering::Relaxed),
            auth_rejections: self.inner.auth_rejections.load(Ordering::Relaxed),
            malformed_messages: self.inner.malformed_messages.load(Ordering::Relaxed),
            broadcast,
        }
    }

    /// Reject pending upgrades, close every connection and stop listening.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending: Vec<_> = self.lock_pending_auth().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(AuthDecision::Reject(AuthRejection::new(
                503,
                "Server shutting down",
            )));
        }
        self.inner.api.fail_all(503, "Server shutting down");
        self.inner.pump.shutdown().await;
        let _ = self.inner.shutdown.send(true);
        log::info!("Broadcast server on {} closed", self.inner.local_addr);
    }

    fn emit(&self, event: ServerEvent) {
        match self.inner.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Server event queue full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn lock_pending_auth(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<AuthDecision>>> {
        self.inner
            .pending_auth
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending_auth(&self, client_id: &str) -> Option<oneshot::Sender<AuthDecision>> {
        self.lock_pending_auth().remove(client_id)
    }

    async fn await_authorization(&self, request: WsAuthRequest) -> AuthDecision {
        let client_id = request.client_id.clone();
        let (tx, mut rx) = oneshot::channel();
        self.lock_pending_auth().insert(client_id.clone(), tx);
        // The handler future is dropped if the client hangs up mid-handshake.
        let _pending = PendingAuthGuard {
            server: self,
            client_id: &client_id,
        };
        self.emit(ServerEvent::WsAuthRequest(request));

        let timeout = self.inner.config.effective_auth_timeout();
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => AuthDecision::Reject(AuthRejection::new(503, "Server shutting down")),
            Err(_) => {
                if self.take_pending_auth(&client_id).is_some() {
                    self.inner.auth_timeouts.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Authorization of {client_id} timed out after {timeout:?}");
                    AuthDecision::Reject(AuthRejection::new(503, "Authorization timed out"))
                } else {
                    // A decision raced the deadline.
                    rx.try_recv().unwrap_or_else(|_| {
                        AuthDecision::Reject(AuthRejection::new(503, "Authorization timed out"))
                    })
                }
            }
        }
    }

    async fn handle_socket(self, socket: WebSocket, info: ClientInfo) {
        let client_id = info.client_id.clone();
        let (handle, mut queue) = client_channel(info.clone(), self.inner.config.client_queue_capacity);

        let attached = {
            let model = self.inner.model.read().unwrap_or_else(PoisonError::into_inner);
            match InnerMessage::apply(full_refresh(model.document())).encode() {
                Ok(refresh) => Some(self.inner.pump.attach(handle, Arc::from(refresh))),
                Err(e) => {
                    log::error!("Failed to encode refresh for {client_id}: {e}");
                    None
                }
            }
        };
        let Some(attached) = attached else {
            return;
        };
        let _ = attached.await;

        log::info!("Client {client_id} connected from {}", info.remote_ip);
        self.emit(ServerEvent::ClientNew(info.clone()));

        let (mut sink, mut stream) = socket.split();
        let mut writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if sink.send(Message::Text(String::from(&*text).into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_incoming(&info, text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {client_id}: {e}");
                        break;
                    }
                },
                _ = &mut writer => break,
            }
        }

        writer.abort();
        self.inner.pump.detach(&client_id).await;
        log::info!("Client {client_id} disconnected");
        self.emit(ServerEvent::ClientEnd { client_id });
    }

    fn handle_incoming(&self, info: &ClientInfo, text: &str) {
        let received_at = now_ms();
        match decode_value(text) {
            Ok(payload) => self.emit(ServerEvent::IncomingMessage {
                payload,
                meta: MessageMeta {
                    client_id: info.client_id.clone(),
                    remote_ip: info.remote_ip.clone(),
                    connected_at: info.connected_at,
                    received_at,
                    raw_length: text.len(),
                },
            }),
            Err(error) => {
                self.inner.malformed_messages.fetch_add(1, Ordering::Relaxed);
                log::warn!("Malformed message from {}: {error}", info.client_id);
                self.emit(ServerEvent::IncomingMessageMalformed {
                    client_id: info.client_id.clone(),
                    msg_str: text.to_string(),
                    error,
                });
            }
        }
    }
}

/// Removes a pending upgrade however the wait for its decision ends.
struct PendingAuthGuard<'a> {
    server: &'a WsServer,
    client_id: &'a str,
}

impl Drop for PendingAuthGuard<'_> {
    fn drop(&mut self) {
        if self.server.take_pending_auth(self.client_id).is_some() {
            log::debug!("Upgrade for {} abandoned during authorization", self.client_id);
        }
    }
}

async fn ws_handler(
    State(server): State<WsServer>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if server.inner.closed.load(Ordering::SeqCst) {
        return AuthRejection::new(503, "Server shutting down").into_response();
    }

    let client_id = Uuid::new_v4().to_string();
    let remote_ip = remote_ip(&headers, addr);

    if server.inner.config.auth_enabled {
        let request = WsAuthRequest {
            client_id: client_id.clone(),
            remote_ip: remote_ip.clone(),
            method: method.to_string(),
            url: uri.to_string(),
            headers: header_map(&headers),
        };
        if let AuthDecision::Reject(rejection) = server.await_authorization(request).await {
            log::info!(
                "Upgrade for {client_id} rejected with {}: {}",
                rejection.code,
                rejection.message
            );
            return rejection.into_response();
        }
    }

    let info = ClientInfo {
        client_id,
        remote_ip,
        connected_at: now_ms(),
    };
    ws.on_upgrade(move |socket| server.handle_socket(socket, info))
}

async fn api_handler(
    State(server): State<WsServer>,
    method: Method,
    uri: Uri,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let prefix = server.inner.config.api_prefix.trim_end_matches('/');
    let path = match uri.path().strip_prefix(prefix) {
        Some("") | None => "/",
        Some(rest) => rest,
    };

    let (req_id, rx) = server.inner.api.register();
    server.emit(ServerEvent::ApiRequest(ApiRequest {
        req_id: req_id.clone(),
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers: header_map(&headers),
        body: parse_body(&body),
    }));

    server.inner.api.wait(&req_id, rx).await.into_response()
}

/// First `X-Forwarded-For` entry, else the peer address.
fn remote_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from)
        .unwrap_or_else(|| addr.ip().to_string())
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
