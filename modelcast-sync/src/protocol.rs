//! Versioned text protocol shared by clients, the server and the backend.
//!
//! Wire format (one WebSocket text frame):
//! ```text
//! {"v": 1, "payload": "<inner message, JSON-encoded again>"}
//! ```
//!
//! The inner message is a JSON object tagged by `type`. The same inner
//! messages travel over the backend channel, one per line and without the
//! envelope.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use modelcast_core::Operation;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Envelope version written by this crate and required on decode.
pub const PROTOCOL_VERSION: u64 = 1;

/// Every inner `type` tag.
pub const MESSAGE_TYPES: &[&str] = &[
    "ready",
    "apply",
    "rpc_request",
    "rpc_response",
    "api_request",
    "api_response",
    "ws_auth_request",
    "ws_auth_response",
    "log",
];

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wrap any JSON value in a version-1 envelope.
pub fn encode_value(value: &Value) -> String {
    let mut envelope = Map::with_capacity(2);
    envelope.insert("v".into(), Value::from(PROTOCOL_VERSION));
    envelope.insert("payload".into(), Value::String(value.to_string()));
    Value::Object(envelope).to_string()
}

/// Unwrap an envelope. A missing payload decodes to `null`.
pub fn decode_value(text: &str) -> Result<Value, ProtocolError> {
    let raw: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let envelope = raw.as_object().ok_or(ProtocolError::NotAnObject)?;

    let version = envelope.get("v").cloned().unwrap_or(Value::Null);
    if version.as_u64() != Some(PROTOCOL_VERSION) {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: version.to_string(),
        });
    }

    match envelope.get("payload") {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(Value::String(inner)) => serde_json::from_str(inner)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string())),
        Some(_) => Err(ProtocolError::InvalidPayload(
            "payload must be a JSON-encoded string".into(),
        )),
    }
}

/// Per-message delivery metadata attached by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    pub client_id: String,
    pub remote_ip: String,
    pub connected_at: u64,
    pub received_at: u64,
    pub raw_length: usize,
}

/// One line written from the supervisor to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub message: Value,
    #[serde(default)]
    pub meta: Option<MessageMeta>,
}

/// Typed inner message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InnerMessage {
    /// First line a backend sends; completes the start handshake.
    Ready,
    Apply(ApplyMessage),
    RpcRequest(RpcRequest),
    RpcResponse(RpcResponse),
    ApiRequest(ApiRequest),
    ApiResponse(ApiResponse),
    WsAuthRequest(WsAuthRequest),
    WsAuthResponse(WsAuthResponse),
    Log(LogMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyMessage {
    pub ops: Vec<Operation>,
}

/// Client → backend function call. Extra keys are the call arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub rpc_id: String,
    pub fn_name: String,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl RpcRequest {
    /// New request with a random correlation id.
    pub fn new(fn_name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            rpc_id: Uuid::new_v4().to_string(),
            fn_name: fn_name.into(),
            args,
        }
    }
}

/// Backend → client answer to an [`RpcRequest`].
///
/// Exactly one of `result` and `error` is set. A `result` of JSON `null` is
/// kept distinct from an absent result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub rpc_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fn_name: Option<String>,
}

impl RpcResponse {
    pub fn success(rpc_id: impl Into<String>, client_id: Option<String>, result: Value) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            client_id,
            result: Some(result),
            error: None,
            fn_name: None,
        }
    }

    pub fn failure(
        rpc_id: impl Into<String>,
        client_id: Option<String>,
        error: impl Into<String>,
        fn_name: Option<String>,
    ) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            client_id,
            result: None,
            error: Some(error.into()),
            fn_name,
        }
    }

    /// Failure for a function name nobody registered.
    pub fn not_found(rpc_id: impl Into<String>, client_id: Option<String>, fn_name: &str) -> Self {
        Self::failure(
            rpc_id,
            client_id,
            format!("Cannot find RPC function \"{fn_name}\"."),
            None,
        )
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// An HTTP request under the API prefix, forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub req_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub req_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl ApiResponse {
    pub fn new(req_id: impl Into<String>, status_code: u16, body: Value) -> Self {
        Self {
            req_id: req_id.into(),
            status_code,
            headers: BTreeMap::new(),
            body,
        }
    }

    /// `{"error": message}` with the given status.
    pub fn error(req_id: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("error".into(), Value::String(message.into()));
        Self::new(req_id, status_code, Value::Object(body))
    }
}

/// Sent to the backend while a WebSocket upgrade is held open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsAuthRequest {
    pub client_id: String,
    pub remote_ip: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Backend verdict on a pending upgrade. 2xx authorizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsAuthResponse {
    pub client_id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WsAuthResponse {
    pub fn allow(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            status: 200,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn deny(client_id: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            status,
            error: Some(error.into()),
            extra: Map::new(),
        }
    }

    pub fn is_authorized(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Log lines forwarded from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub payload: Vec<String>,
}

impl LogMessage {
    pub fn line(text: impl Into<String>) -> Self {
        Self {
            payload: vec![text.into()],
        }
    }
}

impl InnerMessage {
    pub fn ready() -> Self {
        InnerMessage::Ready
    }

    pub fn apply(ops: Vec<Operation>) -> Self {
        InnerMessage::Apply(ApplyMessage { ops })
    }

    /// The wire `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            InnerMessage::Ready => "ready",
            InnerMessage::Apply(_) => "apply",
            InnerMessage::RpcRequest(_) => "rpc_request",
            InnerMessage::RpcResponse(_) => "rpc_response",
            InnerMessage::ApiRequest(_) => "api_request",
            InnerMessage::ApiResponse(_) => "api_response",
            InnerMessage::WsAuthRequest(_) => "ws_auth_request",
            InnerMessage::WsAuthResponse(_) => "ws_auth_response",
            InnerMessage::Log(_) => "log",
        }
    }

    /// Parse a raw inner message, reporting unknown tags distinctly.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidPayload("missing string \"type\" field".into()))?;
        if !MESSAGE_TYPES.contains(&tag) {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }
        serde_json::from_value(value.clone()).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Encode inside an envelope.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(encode_value(&self.to_value()?))
    }

    /// Decode from an envelope.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_value(&decode_value(text)?)
    }
}

macro_rules! inner_from {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for InnerMessage {
            fn from(msg: $ty) -> Self {
                InnerMessage::$variant(msg)
            }
        })*
    };
}

inner_from! {
    ApplyMessage => Apply,
    RpcRequest => RpcRequest,
    RpcResponse => RpcResponse,
    ApiRequest => ApiRequest,
    ApiResponse => ApiResponse,
    WsAuthRequest => WsAuthRequest,
    WsAuthResponse => WsAuthResponse,
    LogMessage => Log,
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    InvalidJson(String),
    NotAnObject,
    VersionMismatch { expected: u64, found: String },
    InvalidPayload(String),
    UnknownType(String),
    Serialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "Invalid JSON: {e}"),
            Self::NotAnObject => write!(f, "Envelope is not a JSON object"),
            Self::VersionMismatch { expected, found } => {
                write!(f, "Protocol version mismatch: expected {expected}, got {found}")
            }
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::UnknownType(t) => write!(f, "Unknown message type: {t}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
