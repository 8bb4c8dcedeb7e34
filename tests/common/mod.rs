//! Shared fixtures: an in-process stub MCP backend.
//!
//! The stub speaks just enough of the protocol to exercise the dispatcher
//! end to end: initialize issues a session id (and counts how often it is
//! asked), tools/list exposes a few fixed tools, and tools/call returns
//! canned payloads covering the interesting reply shapes (text content,
//! SSE framing, tool errors, RPC errors).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub struct StubBackend {
    pub addr: SocketAddr,
    pub init_calls: Arc<AtomicUsize>,
}

impl StubBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn initialize_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

/// Start the stub on an ephemeral port.  It serves until the test process
/// exits; tests are short-lived so the task is simply detached.
pub async fn spawn_stub() -> StubBackend {
    let init_calls = Arc::new(AtomicUsize::new(0));
    let state = init_calls.clone();

    let app = Router::new().route("/mcp", post(handler)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    StubBackend { addr, init_calls }
}

fn rpc_result(id: Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn handler(
    State(init_calls): State<Arc<AtomicUsize>>,
    Json(body): Json<Value>,
) -> Response {
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
    let id = body.get("id").cloned().unwrap_or(Value::Null);

    match method {
        "initialize" => {
            init_calls.fetch_add(1, Ordering::SeqCst);
            let result = json!({
                "protocolVersion": "2025-11-25",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "stub-backend", "version": "0.0.0"},
            });
            ([("mcp-session-id", "stub-session-1")], rpc_result(id, result)).into_response()
        }
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "tools/list" => rpc_result(
            id,
            json!({"tools": [
                {"name": "Scheduler-Health", "description": "health", "inputSchema": {}},
                {"name": "echo", "description": "echo args back", "inputSchema": {}},
                {"name": "sse_case", "description": "SSE-framed reply", "inputSchema": {}},
                {"name": "fail_tool", "description": "always fails", "inputSchema": {}},
            ]}),
        )
        .into_response(),
        "tools/call" => {
            let params = body.get("params").cloned().unwrap_or_default();
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            match name {
                "Scheduler-Health" => rpc_result(
                    id,
                    json!({"content": [
                        {"type": "text", "text": "{\"ok\": true, \"thread_alive\": true}"}
                    ]}),
                )
                .into_response(),
                "echo" => rpc_result(
                    id,
                    json!({"content": [
                        {"type": "text", "text": arguments.to_string()}
                    ]}),
                )
                .into_response(),
                "sse_case" => {
                    let payload = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"ok": true, "framing": "sse"},
                    });
                    (
                        [("content-type", "text/event-stream")],
                        format!("event: message\ndata: {payload}\n\n"),
                    )
                        .into_response()
                }
                "fail_tool" => {
                    rpc_result(id, json!({"ok": false, "error": "backend says no"})).into_response()
                }
                other => Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("unknown tool: {other}")},
                }))
                .into_response(),
            }
        }
        _ => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "method not found"},
        }))
        .into_response(),
    }
}
