//! Backend-side runtime: the library a supervised child links against.
//!
//! ```text
//!  BackendRuntime::from_env()
//!     ├── register_rpc("name", handler)    rpc_request      ─▸ rpc_response
//!     ├── set_ws_auth_handler(handler)     ws_auth_request  ─▸ ws_auth_response
//!     ├── set_api_handler(handler)         api_request      ─▸ api_response
//!     ├── model_writer().apply(ops)                         ─▸ apply
//!     └── run().await   connect MODELCAST_CHANNEL, send ready, serve frames
//! ```
//!
//! Requests are handled concurrently; replies share one ordered writer.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use modelcast_core::Operation;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{
    ApiRequest, ApiResponse, ChannelFrame, InnerMessage, LogMessage, MessageMeta, RpcResponse,
    WsAuthRequest, WsAuthResponse,
};

/// Error type handlers return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RpcHandler = Arc<dyn Fn(RpcCall) -> BoxFuture<Result<Value, HandlerError>> + Send + Sync>;
type AuthHandler =
    Arc<dyn Fn(WsAuthRequest) -> BoxFuture<Result<Map<String, Value>, HandlerError>> + Send + Sync>;
type ApiHandler = Arc<dyn Fn(ApiRequest) -> BoxFuture<Result<ApiResponse, HandlerError>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("MODELCAST_CHANNEL is not set; this process must be started by the supervisor")]
    MissingChannel,

    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Logger already installed")]
    Logger,
}

/// One invocation of an RPC handler.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub rpc_id: String,
    pub fn_name: String,
    pub args: Map<String, Value>,
    /// Delivery metadata of the calling client
    pub meta: Option<MessageMeta>,
    pub model: ModelWriter,
}

impl RpcCall {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }
}

/// Sends model mutations to the supervisor.
#[derive(Debug, Clone)]
pub struct ModelWriter {
    outbound: mpsc::UnboundedSender<String>,
}

impl ModelWriter {
    pub fn apply(&self, ops: Vec<Operation>) -> Result<(), RuntimeError> {
        send_message(&self.outbound, &InnerMessage::apply(ops))
    }
}

fn send_message(
    outbound: &mpsc::UnboundedSender<String>,
    message: &InnerMessage,
) -> Result<(), RuntimeError> {
    let line = serde_json::to_string(message)?;
    outbound
        .send(line)
        .map_err(|_| RuntimeError::ChannelClosed)
}

/// Handler registry plus the channel to the supervisor.
pub struct BackendRuntime {
    rpc: HashMap<String, RpcHandler>,
    ws_auth: Option<AuthHandler>,
    api: Option<ApiHandler>,
    outbound: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    channel_addr: Option<String>,
    runtime_root: Option<PathBuf>,
    log_passthrough: bool,
}

impl BackendRuntime {
    /// A runtime with no channel address. Useful for driving handlers directly.
    pub fn new() -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            rpc: HashMap::new(),
            ws_auth: None,
            api: None,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            channel_addr: None,
            runtime_root: None,
            log_passthrough: false,
        }
    }

    /// Read `MODELCAST_CHANNEL`, `MODELCAST_RUNTIME_ROOT` and
    /// `MODELCAST_LOG_PASSTHROUGH` from the environment.
    pub fn from_env() -> Self {
        let mut runtime = Self::new();
        runtime.channel_addr = std::env::var("MODELCAST_CHANNEL").ok();
        runtime.runtime_root = std::env::var_os("MODELCAST_RUNTIME_ROOT").map(PathBuf::from);
        runtime.log_passthrough = std::env::var("MODELCAST_LOG_PASSTHROUGH").as_deref() == Ok("1");
        runtime
    }

    pub fn runtime_root(&self) -> Option<&PathBuf> {
        self.runtime_root.as_ref()
    }

    pub fn model_writer(&self) -> ModelWriter {
        ModelWriter {
            outbound: self.outbound.clone(),
        }
    }

    /// Register an RPC function. A later registration under the same name wins.
    pub fn register_rpc<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(RpcCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.rpc
            .insert(name.into(), Arc::new(move |call| Box::pin(handler(call))));
    }

    /// Install the WebSocket auth handler, replacing any previous one.
    ///
    /// The returned map is merged over a status-200 response, so a handler
    /// can refuse a client by returning `{"status": 401, "error": "…"}`.
    pub fn set_ws_auth_handler<F, Fut>(&mut self, handler: F)
    where
        F: Fn(WsAuthRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Map<String, Value>, HandlerError>> + Send + 'static,
    {
        if self.ws_auth.is_some() {
            log::warn!("Replacing existing WebSocket auth handler");
        }
        self.ws_auth = Some(Arc::new(move |req| Box::pin(handler(req))));
    }

    pub fn set_api_handler<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, HandlerError>> + Send + 'static,
    {
        self.api = Some(Arc::new(move |req| Box::pin(handler(req))));
    }

    /// Install the process logger: passthrough to the supervisor when it asked
    /// for it, `env_logger` otherwise.
    pub fn init_logging(&self) -> Result<(), RuntimeError> {
        if self.log_passthrough {
            let logger = PassthroughLogger::new(self.outbound.clone(), log::LevelFilter::Info);
            log::set_boxed_logger(Box::new(logger)).map_err(|_| RuntimeError::Logger)?;
            log::set_max_level(log::LevelFilter::Info);
            Ok(())
        } else {
            env_logger::try_init().map_err(|_| RuntimeError::Logger)
        }
    }

    /// Handle one frame from the supervisor, returning the reply to send.
    pub async fn handle_frame(&self, frame: ChannelFrame) -> Option<InnerMessage> {
        let message = match InnerMessage::from_value(&frame.message) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Ignoring malformed frame from supervisor: {e}");
                return None;
            }
        };

        match message {
            InnerMessage::RpcRequest(request) => Some(
                self.call_rpc(request.rpc_id, request.fn_name, request.args, frame.meta)
                    .await
                    .into(),
            ),
            InnerMessage::WsAuthRequest(request) => Some(self.authorize(request).await.into()),
            InnerMessage::ApiRequest(request) => Some(self.call_api(request).await.into()),
            other => {
                log::warn!("Unexpected {} frame from supervisor", other.type_name());
                None
            }
        }
    }

    async fn call_rpc(
        &self,
        rpc_id: String,
        fn_name: String,
        args: Map<String, Value>,
        meta: Option<MessageMeta>,
    ) -> RpcResponse {
        let client_id = meta.as_ref().map(|m| m.client_id.clone());
        let Some(handler) = self.rpc.get(&fn_name).cloned() else {
            return RpcResponse::not_found(rpc_id, client_id, &fn_name);
        };

        let call = RpcCall {
            rpc_id: rpc_id.clone(),
            fn_name: fn_name.clone(),
            args,
            meta,
            model: self.model_writer(),
        };
        match AssertUnwindSafe(handler(call)).catch_unwind().await {
            Ok(Ok(result)) => RpcResponse::success(rpc_id, client_id, result),
            Ok(Err(e)) => RpcResponse::failure(
                rpc_id,
                client_id,
                format!("Error in RPC function \"{fn_name}\": {e}"),
                Some(fn_name),
            ),
            Err(panic) => RpcResponse::failure(
                rpc_id,
                client_id,
                format!(
                    "RPC function \"{fn_name}\" panicked: {}",
                    panic_message(panic.as_ref())
                ),
                Some(fn_name),
            ),
        }
    }

    async fn authorize(&self, request: WsAuthRequest) -> WsAuthResponse {
        let client_id = request.client_id.clone();
        let Some(handler) = self.ws_auth.clone() else {
            return WsAuthResponse::allow(client_id);
        };

        let outcome = AssertUnwindSafe(handler(request)).catch_unwind().await;
        match outcome {
            Ok(Ok(fields)) => {
                let mut response = WsAuthResponse::allow(client_id);
                for (key, value) in fields {
                    match (key.as_str(), &value) {
                        ("status", Value::Number(n)) => {
                            response.status = n.as_u64().and_then(|s| u16::try_from(s).ok()).unwrap_or(500);
                        }
                        ("error", Value::String(text)) => response.error = Some(text.clone()),
                        ("clientId", _) | ("type", _) => {}
                        _ => {
                            response.extra.insert(key, value);
                        }
                    }
                }
                response
            }
            Ok(Err(e)) => WsAuthResponse::deny(client_id, 500, e.to_string()),
            Err(panic) => WsAuthResponse::deny(client_id, 500, panic_message(panic.as_ref())),
        }
    }

    async fn call_api(&self, request: ApiRequest) -> ApiResponse {
        let req_id = request.req_id.clone();
        let Some(handler) = self.api.clone() else {
            return ApiResponse::error(req_id, 500, "No API handler registered");
        };

        match AssertUnwindSafe(handler(request)).catch_unwind().await {
            Ok(Ok(mut response)) => {
                response.req_id = req_id;
                response
            }
            Ok(Err(e)) => ApiResponse::error(req_id, 500, e.to_string()),
            Err(panic) => ApiResponse::error(req_id, 500, panic_message(panic.as_ref())),
        }
    }

    /// Connect to the supervisor, announce readiness and serve until the
    /// channel closes.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let addr = self.channel_addr.clone().ok_or(RuntimeError::MissingChannel)?;
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RuntimeError::ChannelClosed)?;

        let stream = TcpStream::connect(&addr).await?;
        let (read, mut write) = stream.into_split();

        // `ready` must precede anything queued before the connection existed.
        let mut ready = serde_json::to_string(&InnerMessage::ready())?;
        ready.push('\n');
        write.write_all(ready.as_bytes()).await?;

        let writer = tokio::spawn(async move {
            while let Some(mut line) = outbound_rx.recv().await {
                line.push('\n');
                if write.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let runtime = Arc::new(self);
        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let frame: ChannelFrame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Unreadable line from supervisor: {e}");
                    continue;
                }
            };
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                if let Some(reply) = runtime.handle_frame(frame).await {
                    if let Err(e) = send_message(&runtime.outbound, &reply) {
                        log::warn!("Failed to queue reply: {e}");
                    }
                }
            });
        }

        writer.abort();
        Ok(())
    }
}

impl Default for BackendRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `log::Log` implementation that ships records to the supervisor as `log`
/// messages.
pub struct PassthroughLogger {
    outbound: mpsc::UnboundedSender<String>,
    level: log::LevelFilter,
}

impl PassthroughLogger {
    pub fn new(outbound: mpsc::UnboundedSender<String>, level: log::LevelFilter) -> Self {
        Self { outbound, level }
    }
}

impl log::Log for PassthroughLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{} {}] {}", record.level(), record.target(), record.args());
        let _ = send_message(&self.outbound, &LogMessage::line(line).into());
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rpc_frame(fn_name: &str, args: Value) -> ChannelFrame {
        let mut message = json!({"type": "rpc_request", "rpcId": "r1", "fnName": fn_name});
        if let (Some(target), Value::Object(extra)) = (message.as_object_mut(), args) {
            target.extend(extra);
        }
        ChannelFrame {
            message,
            meta: Some(MessageMeta {
                client_id: "c1".into(),
                remote_ip: "127.0.0.1".into(),
                connected_at: 1,
                received_at: 2,
                raw_length: 3,
            }),
        }
    }

    fn expect_rpc(reply: Option<InnerMessage>) -> RpcResponse {
        match reply {
            Some(InnerMessage::RpcResponse(response)) => response,
            other => panic!("expected rpc_response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_rpc_function() {
        let runtime = BackendRuntime::new();
        let response = expect_rpc(runtime.handle_frame(rpc_frame("missing", json!({}))).await);
        assert_eq!(response.error.as_deref(), Some("Cannot find RPC function \"missing\"."));
        assert_eq!(response.client_id.as_deref(), Some("c1"));
        assert_eq!(response.rpc_id, "r1");
    }

    #[tokio::test]
    async fn test_rpc_success_uses_args() {
        let mut runtime = BackendRuntime::new();
        runtime.register_rpc("add", |call: RpcCall| async move {
            let a = call.arg("a").and_then(Value::as_i64).unwrap_or(0);
            let b = call.arg("b").and_then(Value::as_i64).unwrap_or(0);
            Ok::<Value, HandlerError>(json!(a + b))
        });

        let response = expect_rpc(runtime.handle_frame(rpc_frame("add", json!({"a": 2, "b": 3}))).await);
        assert_eq!(response.result, Some(json!(5)));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_rpc_handler_error_names_function() {
        let mut runtime = BackendRuntime::new();
        runtime.register_rpc("explode", |_call: RpcCall| async move {
            Err::<Value, HandlerError>("kaboom".into())
        });

        let response = expect_rpc(runtime.handle_frame(rpc_frame("explode", json!({}))).await);
        let error = response.error.unwrap();
        assert!(error.contains("explode"));
        assert!(error.contains("kaboom"));
        assert_eq!(response.fn_name.as_deref(), Some("explode"));
    }

    #[tokio::test]
    async fn test_rpc_handler_panic_is_caught() {
        let mut runtime = BackendRuntime::new();
        runtime.register_rpc("panics", |_call: RpcCall| async move {
            if true {
                panic!("handler bug");
            }
            Ok::<Value, HandlerError>(Value::Null)
        });

        let response = expect_rpc(runtime.handle_frame(rpc_frame("panics", json!({}))).await);
        let error = response.error.unwrap();
        assert!(error.contains("panics"));
        assert!(error.contains("handler bug"));
    }

    #[tokio::test]
    async fn test_ws_auth_merges_fields() {
        let mut runtime = BackendRuntime::new();
        runtime.set_ws_auth_handler(|req: WsAuthRequest| async move {
            let mut fields = Map::new();
            if req.headers.get("x-token").map(String::as_str) != Some("ok") {
                fields.insert("status".into(), json!(401));
                fields.insert("error".into(), json!("bad token"));
            } else {
                fields.insert("user".into(), json!("ann"));
            }
            Ok(fields)
        });

        let mut request = WsAuthRequest {
            client_id: "c9".into(),
            remote_ip: "127.0.0.1".into(),
            method: "GET".into(),
            url: "/".into(),
            headers: Default::default(),
        };
        let denied = runtime.authorize(request.clone()).await;
        assert_eq!(denied.status, 401);
        assert_eq!(denied.error.as_deref(), Some("bad token"));

        request.headers.insert("x-token".into(), "ok".into());
        let allowed = runtime.authorize(request).await;
        assert!(allowed.is_authorized());
        assert_eq!(allowed.extra.get("user"), Some(&json!("ann")));
    }

    #[tokio::test]
    async fn test_ws_auth_error_is_500() {
        let mut runtime = BackendRuntime::new();
        runtime.set_ws_auth_handler(|_req: WsAuthRequest| async move {
            Err::<Map<String, Value>, HandlerError>("db down".into())
        });
        let request = WsAuthRequest {
            client_id: "c".into(),
            remote_ip: String::new(),
            method: "GET".into(),
            url: "/".into(),
            headers: Default::default(),
        };
        let response = runtime.authorize(request).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.error.as_deref(), Some("db down"));
    }

    #[tokio::test]
    async fn test_missing_api_handler_is_500() {
        let runtime = BackendRuntime::new();
        let request = ApiRequest {
            req_id: "q".into(),
            method: "GET".into(),
            path: "/".into(),
            query: Default::default(),
            headers: Default::default(),
            body: Value::Null,
        };
        let response = runtime.call_api(request).await;
        assert_eq!(response.status_code, 500);
        assert_eq!(response.req_id, "q");
    }

    #[tokio::test]
    async fn test_model_writer_queues_apply() {
        let runtime = BackendRuntime::new();
        runtime
            .model_writer()
            .apply(vec![Operation::set("a", 1)])
            .unwrap();

        let mut rx = runtime.outbound_rx.lock().unwrap().take().unwrap();
        let line = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], json!("apply"));
        assert_eq!(value["ops"][0]["keyPath"], json!("a"));
    }

    #[tokio::test]
    async fn test_run_without_channel_fails() {
        let runtime = BackendRuntime::new();
        assert!(matches!(runtime.run().await, Err(RuntimeError::MissingChannel)));
    }
}
