//! Backend process supervisor and inbound dispatch.
//!
//! The supervisor is a single actor task. Commands from the public handle,
//! events from the current child and events from the broadcast server all
//! arrive on channels and are handled one at a time, so the lifecycle state
//! has exactly one writer.
//!
//! ```text
//!  Supervisor (handle) ──Command──▸ ┌───────────┐ ──lines──▸ child process
//!  SourceWatcher ───SourceChanged──▸│   actor   │◂─ChildEvent── child channel
//!  WsServer ──────────ServerEvent──▸│           │──▸ LiveModel / WsServer
//!                                   └───────────┘──▸ SupervisorEvent
//! ```

mod process;
mod state;
mod watcher;

pub use state::BackendState;
pub use watcher::{SourceWatcher, WatchError};

use std::sync::{Arc, Mutex, PoisonError};

use modelcast_core::SharedModel;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::SupervisorConfig;
use crate::protocol::{
    ApiResponse, ChannelFrame, InnerMessage, LogMessage, MessageMeta, RpcResponse, WsAuthResponse,
};
use crate::server::{AuthRejection, ServerEvent, WsServer};
use process::{spawn_child, ChildEvent, ChildHandle};

/// Supervisor errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn backend '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Backend channel error: {0}")]
    Channel(String),

    #[error("Backend handshake failed: {0}")]
    Handshake(String),

    #[error("Backend exited before it was ready (exit code {code:?})")]
    EarlyExit { code: Option<i32> },

    #[error("Backend was stopped")]
    Stopped,

    #[error("Supervisor is no longer running")]
    ActorGone,

    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Events raised by the supervisor.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged {
        from: BackendState,
        to: BackendState,
    },
    /// An `rpc_response` from the backend, after it was relayed.
    RpcResponse(RpcResponse),
    BackendCrashed {
        code: Option<i32>,
        during_start: bool,
    },
}

/// Sink for log lines forwarded by the backend.
pub trait LogTransport: Send + Sync {
    fn push_line(&self, line: &str);
}

/// Writes forwarded lines to the `app` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppLogTransport;

impl LogTransport for AppLogTransport {
    fn push_line(&self, line: &str) {
        log::info!(target: "app", "{line}");
    }
}

type StartReply = oneshot::Sender<Result<(), SupervisorError>>;

enum Command {
    Start { reply: StartReply },
    Stop { reply: oneshot::Sender<()> },
    Restart { reply: StartReply },
    Send { frame: ChannelFrame },
    SourceChanged,
    Respawn { epoch: u64 },
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<BackendState>,
    event_rx: Mutex<Option<mpsc::Receiver<SupervisorEvent>>>,
    watcher: Mutex<Option<SourceWatcher>>,
}

/// Handle to the supervisor actor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Spawn the actor. With a server, inbound client traffic is dispatched
    /// to the backend and backend answers are relayed to clients.
    pub fn spawn(
        config: SupervisorConfig,
        model: SharedModel,
        server: Option<WsServer>,
    ) -> Result<Self, SupervisorError> {
        Self::spawn_with_transport(config, model, server, Arc::new(AppLogTransport))
    }

    pub fn spawn_with_transport(
        config: SupervisorConfig,
        model: SharedModel,
        server: Option<WsServer>,
        log_transport: Arc<dyn LogTransport>,
    ) -> Result<Self, SupervisorError> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(BackendState::NotStarted);
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (child_tx, child_rx) = mpsc::unbounded_channel();

        let server_rx = server.as_ref().and_then(WsServer::take_event_rx);
        if server.is_some() && server_rx.is_none() {
            log::warn!("Server events already taken; inbound dispatch disabled");
        }

        let watcher = match (&config.source_root, config.production) {
            (Some(root), false) => {
                let tx = commands.clone();
                Some(SourceWatcher::watch(root, config.watch_debounce, move |paths| {
                    log::info!("Source change detected ({} path(s))", paths.len());
                    let _ = tx.send(Command::SourceChanged);
                })?)
            }
            _ => None,
        };

        let actor = Actor {
            respawn_tx: commands.downgrade(),
            config,
            model,
            server,
            log_transport,
            state: BackendState::NotStarted,
            state_tx,
            events,
            child: None,
            child_tx,
            generation: 0,
            pending_start: Vec::new(),
            stop_waiters: Vec::new(),
            restart_after_exit: false,
            stopped: false,
            respawn_epoch: 0,
        };
        tokio::spawn(actor.run(command_rx, child_rx, server_rx));

        Ok(Self {
            shared: Arc::new(Shared {
                commands,
                state,
                event_rx: Mutex::new(Some(event_rx)),
                watcher: Mutex::new(watcher),
            }),
        })
    }

    /// Spawn the backend and wait for its `ready` handshake.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Start { reply })?;
        rx.await.map_err(|_| SupervisorError::ActorGone)?
    }

    /// Kill the backend and disable auto-respawn until the next start.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.submit(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Kill (if running) and spawn a fresh backend.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Restart { reply })?;
        rx.await.map_err(|_| SupervisorError::ActorGone)?
    }

    /// Write `{message, meta}` to the backend.
    pub fn send(&self, message: Value, meta: Option<MessageMeta>) {
        let _ = self.submit(Command::Send {
            frame: ChannelFrame { message, meta },
        });
    }

    /// Same effect as a change detected by the source watcher.
    pub fn notify_source_changed(&self) {
        let _ = self.submit(Command::SourceChanged);
    }

    pub fn state(&self) -> BackendState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn state_rx(&self) -> watch::Receiver<BackendState> {
        self.shared.state.clone()
    }

    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SupervisorEvent>> {
        self.shared
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_watching(&self) -> bool {
        self.shared
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn submit(&self, command: Command) -> Result<(), SupervisorError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| SupervisorError::ActorGone)
    }
}

struct Actor {
    config: SupervisorConfig,
    model: SharedModel,
    server: Option<WsServer>,
    log_transport: Arc<dyn LogTransport>,
    state: BackendState,
    state_tx: watch::Sender<BackendState>,
    events: mpsc::Sender<SupervisorEvent>,
    child: Option<ChildHandle>,
    child_tx: mpsc::UnboundedSender<ChildEvent>,
    generation: u64,
    /// Callers waiting for the next `ready`
    pending_start: Vec<StartReply>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    /// Spawn again as soon as the current child exits
    restart_after_exit: bool,
    /// Set by `stop()`; suppresses auto-respawn and source restarts
    stopped: bool,
    /// Bumped to invalidate scheduled respawns
    respawn_epoch: u64,
    respawn_tx: mpsc::WeakUnboundedSender<Command>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut child_rx: mpsc::UnboundedReceiver<ChildEvent>,
        mut server_rx: Option<mpsc::Receiver<ServerEvent>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = child_rx.recv() => self.handle_child_event(event).await,
                event = next_server_event(&mut server_rx) => match event {
                    Some(event) => self.handle_server_event(event),
                    None => server_rx = None,
                },
            }
        }

        if let Some(mut child) = self.child.take() {
            child.kill();
        }
        log::debug!("Supervisor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                self.stopped = false;
                match self.state {
                    BackendState::Running => {
                        let _ = reply.send(Ok(()));
                    }
                    BackendState::Starting => self.pending_start.push(reply),
                    BackendState::ShuttingDown => {
                        self.restart_after_exit = true;
                        self.pending_start.push(reply);
                    }
                    BackendState::NotStarted | BackendState::Dead => {
                        self.pending_start.push(reply);
                        self.spawn().await;
                    }
                }
            }
            Command::Stop { reply } => {
                self.stopped = true;
                self.restart_after_exit = false;
                self.respawn_epoch += 1;
                match self.state {
                    BackendState::Starting | BackendState::Running => {
                        self.stop_waiters.push(reply);
                        self.kill_child();
                    }
                    BackendState::ShuttingDown => self.stop_waiters.push(reply),
                    BackendState::NotStarted | BackendState::Dead => {
                        let _ = reply.send(());
                    }
                }
            }
            Command::Restart { reply } => {
                self.stopped = false;
                self.pending_start.push(reply);
                self.cycle().await;
            }
            Command::SourceChanged => {
                if self.stopped {
                    log::debug!("Ignoring source change, backend is stopped");
                } else {
                    log::info!("Restarting backend after source change");
                    self.cycle().await;
                }
            }
            Command::Respawn { epoch } => {
                if epoch == self.respawn_epoch
                    && self.state == BackendState::Dead
                    && !self.stopped
                {
                    log::info!("Respawning backend");
                    self.spawn().await;
                }
            }
            Command::Send { frame } => {
                self.forward(frame);
            }
        }
    }

    /// Kill-then-spawn. Triggers that arrive mid-cycle join it.
    async fn cycle(&mut self) {
        self.respawn_epoch += 1;
        match self.state {
            BackendState::Starting | BackendState::Running => {
                self.restart_after_exit = true;
                self.kill_child();
            }
            BackendState::ShuttingDown => self.restart_after_exit = true,
            BackendState::NotStarted | BackendState::Dead => self.spawn().await,
        }
    }

    async fn spawn(&mut self) {
        self.generation += 1;
        self.transition(BackendState::Starting);

        match spawn_child(&self.config, self.generation, self.child_tx.clone()).await {
            Ok(child) => self.child = Some(child),
            Err(e) => {
                log::error!("{e}");
                self.transition(BackendState::Dead);
                self.fail_pending_start(e);
            }
        }
    }

    fn kill_child(&mut self) {
        if let Some(child) = self.child.as_mut() {
            log::info!(
                "Stopping backend generation {} (pid {:?})",
                child.generation,
                child.pid
            );
            child.kill();
        }
        self.transition(BackendState::ShuttingDown);
    }

    async fn handle_child_event(&mut self, event: ChildEvent) {
        if event.generation() != self.generation {
            log::debug!("Ignoring event from stale backend generation {}", event.generation());
            return;
        }

        match event {
            ChildEvent::Ready { .. } => {
                if self.state != BackendState::Starting {
                    log::warn!("Unexpected ready while {}", self.state);
                    return;
                }
                self.transition(BackendState::Running);
                log::info!("Backend ready");
                for reply in self.pending_start.drain(..) {
                    let _ = reply.send(Ok(()));
                }
            }
            ChildEvent::HandshakeFailed { reason, .. } => {
                log::error!("Backend handshake failed: {reason}");
                self.fail_pending_start(SupervisorError::Handshake(reason));
                self.kill_child();
            }
            ChildEvent::Message { message, .. } => self.dispatch_from_child(message),
            ChildEvent::Malformed { line, error, .. } => {
                log::warn!("Malformed message from backend ({error}): {line}");
            }
            ChildEvent::Exited { code, .. } => self.handle_exit(code).await,
        }
    }

    async fn handle_exit(&mut self, code: Option<i32>) {
        self.child = None;
        let previous = self.state;
        self.transition(BackendState::Dead);

        match previous {
            BackendState::Starting => {
                log::error!("Backend exited before ready (exit code {code:?})");
                self.emit(SupervisorEvent::BackendCrashed {
                    code,
                    during_start: true,
                });
                self.restart_after_exit = false;
                self.fail_pending_start(SupervisorError::EarlyExit { code });
            }
            BackendState::Running => {
                log::error!("Backend crashed (exit code {code:?})");
                self.emit(SupervisorEvent::BackendCrashed {
                    code,
                    during_start: false,
                });
                if !self.stopped {
                    self.schedule_respawn();
                }
            }
            _ => {
                log::info!("Backend exited (exit code {code:?})");
                for waiter in self.stop_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if self.restart_after_exit {
                    self.restart_after_exit = false;
                    self.spawn().await;
                } else if self.stopped {
                    self.fail_pending_start(SupervisorError::Stopped);
                }
            }
        }
    }

    fn schedule_respawn(&mut self) {
        self.respawn_epoch += 1;
        let epoch = self.respawn_epoch;
        let delay = self.config.respawn_delay;
        let tx = self.respawn_tx.clone();
        log::info!("Respawning backend in {delay:?}");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Respawn { epoch });
            }
        });
    }

    fn transition(&mut self, next: BackendState) {
        let from = self.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            log::warn!("Unexpected backend transition {from} -> {next}");
        }
        self.state = next;
        self.state_tx.send_replace(next);
        log::debug!("Backend state {from} -> {next}");
        self.emit(SupervisorEvent::StateChanged { from, to: next });
    }

    fn fail_pending_start(&mut self, error: SupervisorError) {
        for reply in self.pending_start.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::warn!("Supervisor event queue full, dropping {event:?}");
        }
    }

    fn forward(&self, frame: ChannelFrame) -> bool {
        let child = match (&self.child, self.state) {
            (Some(child), BackendState::Running) => child,
            _ => {
                log::warn!("Backend is not running, dropping outbound message");
                return false;
            }
        };
        match serde_json::to_string(&frame) {
            Ok(line) => child.send_line(line),
            Err(e) => {
                log::error!("Failed to encode backend frame: {e}");
                false
            }
        }
    }

    fn dispatch_from_child(&self, message: InnerMessage) {
        match message {
            InnerMessage::Apply(apply) => {
                let mut model = self.model.write().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = model.mutate(&apply.ops) {
                    log::error!("Rejected apply batch from backend: {e}");
                }
            }
            InnerMessage::RpcResponse(response) => {
                match (&self.server, response.client_id.as_deref()) {
                    (Some(server), Some(client_id)) => {
                        let relay = InnerMessage::RpcResponse(response.clone());
                        if let Err(e) = server.send_one(client_id, &relay) {
                            log::error!("Failed to relay rpc_response: {e}");
                        }
                    }
                    (_, None) => log::warn!("rpc_response {} has no clientId", response.rpc_id),
                    (None, _) => {}
                }
                self.emit(SupervisorEvent::RpcResponse(response));
            }
            InnerMessage::WsAuthResponse(response) => self.apply_auth_verdict(response),
            InnerMessage::ApiResponse(response) => match &self.server {
                Some(server) => {
                    server.resolve_api(response);
                }
                None => log::warn!("api_response {} without a server", response.req_id),
            },
            InnerMessage::Log(LogMessage { payload }) => {
                for line in &payload {
                    self.log_transport.push_line(line);
                }
            }
            other => log::warn!("Unexpected {} message from backend", other.type_name()),
        }
    }

    fn apply_auth_verdict(&self, response: WsAuthResponse) {
        let Some(server) = &self.server else {
            return;
        };
        if response.is_authorized() {
            server.authorize_websocket(&response.client_id);
        } else {
            let message = response
                .error
                .clone()
                .unwrap_or_else(|| "Unauthorized".to_string());
            server.reject_websocket(
                &response.client_id,
                AuthRejection::new(response.status, message),
            );
        }
    }

    fn handle_server_event(&self, event: ServerEvent) {
        let Some(server) = &self.server else {
            return;
        };
        let running = self.state == BackendState::Running;

        match event {
            ServerEvent::ClientNew(info) => {
                log::debug!("Client {} joined", info.client_id);
            }
            ServerEvent::ClientEnd { client_id } => {
                log::debug!("Client {client_id} left");
            }
            ServerEvent::IncomingMessageMalformed { client_id, .. } => {
                log::debug!("Dropped malformed message from {client_id}");
            }
            ServerEvent::IncomingMessage { payload, meta } => {
                let kind = payload.get("type").and_then(Value::as_str);
                if kind != Some("rpc_request") {
                    log::warn!(
                        "Dropping unsupported message type {:?} from {}",
                        kind,
                        meta.client_id
                    );
                    return;
                }
                if running {
                    self.forward(ChannelFrame {
                        message: payload,
                        meta: Some(meta),
                    });
                } else {
                    let rpc_id = payload
                        .get("rpcId")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let fn_name = payload
                        .get("fnName")
                        .and_then(Value::as_str)
                        .map(String::from);
                    let reply = InnerMessage::RpcResponse(RpcResponse::failure(
                        rpc_id,
                        Some(meta.client_id.clone()),
                        "Backend is not running",
                        fn_name,
                    ));
                    if let Err(e) = server.send_one(&meta.client_id, &reply) {
                        log::error!("Failed to answer rpc_request locally: {e}");
                    }
                }
            }
            ServerEvent::WsAuthRequest(request) => {
                if running {
                    self.forward_message(InnerMessage::WsAuthRequest(request));
                } else {
                    server.reject_websocket(
                        &request.client_id,
                        AuthRejection::new(503, "Backend is not running"),
                    );
                }
            }
            ServerEvent::ApiRequest(request) => {
                if running {
                    self.forward_message(InnerMessage::ApiRequest(request));
                } else {
                    server.resolve_api(ApiResponse::error(
                        request.req_id,
                        503,
                        "Backend is not running",
                    ));
                }
            }
        }
    }

    fn forward_message(&self, message: InnerMessage) {
        match message.to_value() {
            Ok(value) => {
                self.forward(ChannelFrame {
                    message: value,
                    meta: None,
                });
            }
            Err(e) => log::error!("Failed to encode {} for backend: {e}", message.type_name()),
        }
    }
}

async fn next_server_event(rx: &mut Option<mpsc::Receiver<ServerEvent>>) -> Option<ServerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
