//! # modelcast-sync: live model transport
//!
//! Streams a [`modelcast_core::LiveModel`] to WebSocket clients and relays
//! their calls to a supervised backend process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   line JSON / TCP   ┌─────────────┐    WebSocket     ┌─────────────┐
//! │   backend   │ ◄─────────────────► │ Supervisor  │                  │ ModelClient │
//! │ (runtime)   │   apply, rpc, api   │  (actor)    │                  │  (replica)  │
//! └─────────────┘                     └──────┬──────┘                  └──────▲──────┘
//!                                            │ mutate                         │
//!                                            ▼                                │
//!                                     ┌─────────────┐  listener  ┌──────────┐ │
//!                                     │  LiveModel  ├──────────▸ │ WsServer ├─┘
//!                                     └─────────────┘            │  + Pump  │
//!                                                                └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Envelope codec and typed inner messages
//! - [`broadcast`]: Per-client queues and the fan-out pump
//! - [`server`]: WebSocket server with auth handshake
//! - [`api`]: HTTP requests held open for the backend
//! - [`supervisor`]: Backend child process lifecycle and dispatch
//! - [`runtime`]: Library side of a supervised backend
//! - [`client`]: Reconnecting client that mirrors the model
//! - [`config`]: Configuration structs and environment loading

pub mod api;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod supervisor;

pub use api::ApiBridge;
pub use broadcast::{BroadcastStats, ClientInfo, Pump};
pub use client::{
    Backoff, ClientEvent, ClientStats, ClientStatus, ConnectionState, ModelClient, RpcError,
};
pub use config::{
    BackoffConfig, ClientConfig, ConfigError, ConfigSource, EnvConfig, ServerConfig,
    SupervisorConfig,
};
pub use protocol::{
    ApiRequest, ApiResponse, ChannelFrame, InnerMessage, MessageMeta, ProtocolError, RpcRequest,
    RpcResponse, WsAuthRequest, WsAuthResponse, PROTOCOL_VERSION,
};
pub use runtime::{BackendRuntime, HandlerError, ModelWriter, RpcCall, RuntimeError};
pub use server::{AuthRejection, ServerError, ServerEvent, ServerMetrics, WsServer};
pub use supervisor::{
    AppLogTransport, BackendState, LogTransport, Supervisor, SupervisorError, SupervisorEvent,
};
