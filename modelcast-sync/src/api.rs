//! HTTP API bridge: holds HTTP requests open until the backend answers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::ApiResponse;

/// Pending `api_request`s keyed by request id.
pub struct ApiBridge {
    pending: Mutex<HashMap<String, oneshot::Sender<ApiResponse>>>,
    timeout: Duration,
}

impl ApiBridge {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Allocate a request id and the receiver its answer arrives on.
    pub fn register(&self) -> (String, oneshot::Receiver<ApiResponse>) {
        let req_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(req_id.clone(), tx);
        (req_id, rx)
    }

    /// Complete a pending request. Unknown or late ids are dropped.
    pub fn resolve(&self, response: ApiResponse) -> bool {
        match self.lock().remove(&response.req_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                log::warn!(
                    "Dropping api_response for unknown request {}",
                    response.req_id
                );
                false
            }
        }
    }

    /// Answer every pending request with the same error.
    pub fn fail_all(&self, status_code: u16, message: &str) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (req_id, tx) in drained {
            let _ = tx.send(ApiResponse::error(req_id, status_code, message));
        }
    }

    /// Wait for the answer to `req_id`, or a 504 after the timeout.
    pub async fn wait(&self, req_id: &str, mut rx: oneshot::Receiver<ApiResponse>) -> ApiResponse {
        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => ApiResponse::error(req_id, 503, "Backend unavailable"),
            Err(_) => {
                if self.lock().remove(req_id).is_some() {
                    log::warn!("API request {req_id} timed out after {:?}", self.timeout);
                    ApiResponse::error(req_id, 504, "Backend did not respond in time")
                } else {
                    // Resolved right at the deadline.
                    rx.try_recv().unwrap_or_else(|_| {
                        ApiResponse::error(req_id, 504, "Backend did not respond in time")
                    })
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ApiResponse>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse an HTTP body: JSON if possible, else text, `null` when empty.
pub fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut response = match self.body {
            Value::String(text) => (status, Body::from(text)).into_response(),
            Value::Null => status.into_response(),
            body => (status, Json(body)).into_response(),
        };

        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => log::warn!("Skipping invalid response header {name}"),
            }
        }
        response
    }
}
