//! WebSocket client that mirrors the server's model.
//!
//! Provides:
//! - A local replica rebuilt from the `apply` stream
//! - RPC invocation with correlation ids and timeouts
//! - Reconnection with jittered exponential backoff
//!
//! ```text
//!  Connecting ──ok──▸ Connected ──close/error──▸ BackingOff ──delay──▸ Connecting
//!       │                                            ▲
//!       └──────────────────failure───────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use modelcast_core::{apply_operations, Document};
use rand::Rng;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{BackoffConfig, ClientConfig};
use crate::protocol::{decode_value, InnerMessage, ProtocolError, RpcRequest, RpcResponse};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    BackingOff,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub messages_received: u64,
    pub ops_applied: u64,
    pub reconnects: u64,
    pub rpc_calls: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub stats: ClientStats,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// The replica changed after an `apply`
    ModelUpdated { ops: usize },
    /// A broadcast whose type is not part of the inner protocol
    Message(Value),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("RPC \"{fn_name}\" timed out after {timeout:?}")]
    Timeout { fn_name: String, timeout: Duration },

    #[error("{0}")]
    Remote(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Next undecorated delay: `initial` first, then multiplied and clamped to
/// `[initial, max]`.
pub fn next_delay_after(prev: Option<Duration>, config: &BackoffConfig) -> Duration {
    match prev {
        None => clamp_delay(config.initial_delay.as_secs_f64(), config),
        Some(prev) => clamp_delay(prev.as_secs_f64() * config.multiplier, config),
    }
}

/// Spread `delay` by up to `±jitter` of itself, then clamp to `[initial, max]`.
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, config: &BackoffConfig, rng: &mut R) -> Duration {
    let spread = config.jitter.min(1.0);
    if spread.is_nan() || spread <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rng.gen_range(-spread..=spread);
    clamp_delay(delay.as_secs_f64() * factor, config)
}

fn clamp_delay(secs: f64, config: &BackoffConfig) -> Duration {
    let floor = config.initial_delay.min(config.max_delay);
    if secs.is_nan() || secs <= floor.as_secs_f64() {
        return floor;
    }
    Duration::try_from_secs_f64(secs)
        .map_or(config.max_delay, |delay| delay.min(config.max_delay))
}

/// Reconnect delay state: attempt counter plus the last undecorated delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            current: None,
        }
    }

    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = next_delay_after(self.current, &self.config);
        self.current = Some(base);
        self.attempt += 1;
        apply_jitter(base, &self.config, rng)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = None;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

type PendingRpc = oneshot::Sender<Result<Value, RpcError>>;

struct ClientShared {
    replica: RwLock<Document>,
    status: Mutex<ClientStatus>,
    pending: Mutex<HashMap<String, PendingRpc>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::Sender<ClientEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ClientShared {
    fn set_state(&self, state: ConnectionState) {
        let mut status = lock(&self.status);
        status.state = state;
        status.connected = state == ConnectionState::Connected;
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.try_send(event).is_err() {
            log::debug!("Client event channel full or closed; dropping event");
        }
    }

    fn fail_pending(&self, error: RpcError) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    fn handle_text(&self, text: &str) {
        lock(&self.status).stats.messages_received += 1;

        let value = match decode_value(text) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };
        match InnerMessage::from_value(&value) {
            Ok(InnerMessage::Apply(apply)) => {
                let result = {
                    let mut replica = self.replica.write().unwrap_or_else(|e| e.into_inner());
                    apply_operations(&mut replica, &apply.ops)
                };
                match result {
                    Ok(()) => {
                        lock(&self.status).stats.ops_applied += apply.ops.len() as u64;
                        self.emit(ClientEvent::ModelUpdated {
                            ops: apply.ops.len(),
                        });
                    }
                    Err(e) => log::error!("Failed to apply operations to replica: {e}"),
                }
            }
            Ok(InnerMessage::RpcResponse(response)) => self.resolve_rpc(response),
            Ok(other) => log::debug!("Ignoring {} message", other.type_name()),
            Err(ProtocolError::UnknownType(_)) => self.emit(ClientEvent::Message(value)),
            Err(e) => log::warn!("Dropping malformed message: {e}"),
        }
    }

    fn resolve_rpc(&self, response: RpcResponse) {
        let Some(tx) = lock(&self.pending).remove(&response.rpc_id) else {
            log::warn!("Dropping rpc_response for unknown call {}", response.rpc_id);
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(RpcError::Remote(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }
}

/// Handle on a running client. Dropping it stops the connection loop.
pub struct ModelClient {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    event_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ModelClient {
    /// Start connecting in the background.
    pub fn connect(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let shared = Arc::new(ClientShared {
            replica: RwLock::new(Document::new()),
            status: Mutex::new(ClientStatus {
                connected: false,
                state: ConnectionState::Connecting,
                stats: ClientStats::default(),
            }),
            pending: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(None),
            events,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(connection_loop(
            config.clone(),
            Arc::clone(&shared),
            shutdown_rx,
        ));

        Self {
            config,
            shared,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        lock(&self.event_rx).take()
    }

    /// Deep copy of the replica.
    pub fn snapshot(&self) -> Document {
        self.shared
            .replica
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> ClientStatus {
        lock(&self.shared.status).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.status).connected
    }

    /// Call a backend function and wait for its result.
    pub async fn invoke_rpc(
        &self,
        fn_name: &str,
        args: Map<String, Value>,
    ) -> Result<Value, RpcError> {
        let request = RpcRequest::new(fn_name, args);
        let rpc_id = request.rpc_id.clone();
        let frame = InnerMessage::from(request).encode()?;

        let outgoing = lock(&self.shared.outgoing)
            .clone()
            .ok_or(RpcError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(rpc_id.clone(), tx);
        if outgoing.send(frame).is_err() {
            lock(&self.shared.pending).remove(&rpc_id);
            return Err(RpcError::NotConnected);
        }
        lock(&self.shared.status).stats.rpc_calls += 1;

        match tokio::time::timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::NotConnected),
            Err(_) => {
                lock(&self.shared.pending).remove(&rpc_id);
                Err(RpcError::Timeout {
                    fn_name: fn_name.to_string(),
                    timeout: self.config.rpc_timeout,
                })
            }
        }
    }

    /// Number of calls awaiting a response.
    pub fn pending_rpcs(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Stop reconnecting and drop the connection.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.set_state(ConnectionState::Stopped);
    }
}

impl Drop for ModelClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn connection_loop(
    config: ClientConfig,
    shared: Arc<ClientShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.backoff);
    let mut first_attempt = true;

    while !*shutdown.borrow() {
        shared.set_state(ConnectionState::Connecting);
        if !first_attempt {
            lock(&shared.status).stats.reconnects += 1;
        }
        first_attempt = false;

        let connect = tokio_tungstenite::connect_async(config.url.as_str());
        let result = tokio::select! {
            result = connect => result,
            _ = shutdown.changed() => break,
        };

        match result {
            Ok((stream, _)) => {
                log::info!("Connected to {}", config.url);
                backoff.reset();
                run_session(stream, &shared, &mut shutdown).await;
                shared.set_state(ConnectionState::BackingOff);
                shared.fail_pending(RpcError::NotConnected);
                shared.emit(ClientEvent::Disconnected);
            }
            Err(e) => log::debug!("Connection to {} failed: {e}", config.url),
        }

        if *shutdown.borrow() {
            break;
        }
        shared.set_state(ConnectionState::BackingOff);
        let delay = backoff.next_delay(&mut rand::thread_rng());
        log::info!(
            "Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            backoff.attempt()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.fail_pending(RpcError::NotConnected);
    shared.set_state(ConnectionState::Stopped);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_session(stream: WsStream, shared: &ClientShared, shutdown: &mut watch::Receiver<bool>) {
    let (mut sink, mut source) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    *lock(&shared.outgoing) = Some(out_tx);
    shared.set_state(ConnectionState::Connected);
    shared.emit(ClientEvent::Connected);

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("WebSocket read failed: {e}");
                    break;
                }
            },
            Some(frame) = out_rx.recv() => {
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    *lock(&shared.outgoing) = None;
}
