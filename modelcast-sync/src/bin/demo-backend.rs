//! Small backend used by the host and the integration tests.
//!
//! RPC functions: `echo`, `add`, `fail`, `crash`, `bump`, `slow`.
//! WebSocket auth requires the header `x-demo-token: letmein`.
//! Every API request is echoed back as JSON.
//!
//! `DEMO_BACKEND_EXIT_EARLY=1` exits before connecting,
//! `DEMO_BACKEND_FAIL_HANDSHAKE=1` sends something other than `ready` and
//! `DEMO_BACKEND_STALL=1` stays alive without ever connecting.

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modelcast_core::Operation;
use modelcast_sync::protocol::{ApiRequest, ApiResponse, WsAuthRequest};
use modelcast_sync::runtime::{BackendRuntime, HandlerError, RpcCall};
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;

const DEMO_TOKEN: &str = "letmein";

fn flag(name: &str) -> bool {
    std::env::var(name).as_deref() == Ok("1")
}

async fn fail_handshake() -> ExitCode {
    let Ok(addr) = std::env::var("MODELCAST_CHANNEL") else {
        return ExitCode::FAILURE;
    };
    if let Ok(mut stream) = tokio::net::TcpStream::connect(addr).await {
        let _ = stream
            .write_all(b"{\"type\":\"log\",\"payload\":[\"not ready\"]}\n")
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    ExitCode::FAILURE
}

async fn echo(call: RpcCall) -> Result<Value, HandlerError> {
    Ok(Value::Object(call.args))
}

async fn add(call: RpcCall) -> Result<Value, HandlerError> {
    let a = call.arg("a").and_then(Value::as_f64).ok_or("missing number \"a\"")?;
    let b = call.arg("b").and_then(Value::as_f64).ok_or("missing number \"b\"")?;
    Ok(json!(a + b))
}

async fn fail(_call: RpcCall) -> Result<Value, HandlerError> {
    Err("requested failure".into())
}

async fn crash(_call: RpcCall) -> Result<Value, HandlerError> {
    log::warn!("Crashing on request");
    std::process::exit(3)
}

async fn slow(call: RpcCall) -> Result<Value, HandlerError> {
    let ms = call.arg("ms").and_then(Value::as_u64).unwrap_or(1000);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!(ms))
}

#[tokio::main]
async fn main() -> ExitCode {
    if flag("DEMO_BACKEND_EXIT_EARLY") {
        return ExitCode::from(2);
    }
    if flag("DEMO_BACKEND_FAIL_HANDSHAKE") {
        return fail_handshake().await;
    }
    if flag("DEMO_BACKEND_STALL") {
        tokio::time::sleep(Duration::from_secs(60)).await;
        return ExitCode::FAILURE;
    }

    let mut runtime = BackendRuntime::from_env();
    if let Err(e) = runtime.init_logging() {
        eprintln!("demo-backend: {e}");
    }
    log::info!("Demo backend starting");

    let counter = Arc::new(AtomicU64::new(0));

    runtime.register_rpc("echo", echo);
    runtime.register_rpc("add", add);
    runtime.register_rpc("fail", fail);
    runtime.register_rpc("crash", crash);
    runtime.register_rpc("slow", slow);

    runtime.register_rpc("bump", move |call: RpcCall| {
        let counter = Arc::clone(&counter);
        async move {
            let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
            call.model.apply(vec![Operation::set("counter", value)])?;
            Ok::<Value, HandlerError>(json!(value))
        }
    });

    runtime.set_ws_auth_handler(|req: WsAuthRequest| async move {
        let mut verdict = Map::new();
        if req.headers.get("x-demo-token").map(String::as_str) == Some(DEMO_TOKEN) {
            verdict.insert("user".into(), json!("demo"));
        } else {
            verdict.insert("status".into(), json!(401));
            verdict.insert("error".into(), json!("Missing or invalid demo token"));
        }
        Ok::<_, HandlerError>(verdict)
    });

    runtime.set_api_handler(|req: ApiRequest| async move {
        let body = json!({
            "method": req.method,
            "path": req.path,
            "query": req.query,
            "body": req.body,
        });
        Ok::<_, HandlerError>(ApiResponse::new(req.req_id, 200, body))
    });

    let writer = runtime.model_writer();
    if let Err(e) = writer.apply(vec![Operation::merge(
        "backend",
        json!({"pid": std::process::id(), "status": "up"}),
    )]) {
        log::error!("Failed to publish initial model: {e}");
    }

    match runtime.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Backend runtime failed: {e}");
            ExitCode::FAILURE
        }
    }
}
