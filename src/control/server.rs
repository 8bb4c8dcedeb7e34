//! Control-plane HTTP server: the scheduler as an MCP backend.
//!
//! One endpoint, `POST /mcp`, speaks the same JSON-RPC envelope the
//! dispatcher sends to remote backends: `initialize` issues an
//! `mcp-session-id` header that must be echoed on subsequent requests,
//! `tools/list` describes the scheduler_* tools, and `tools/call` runs them.
//! Tool results are returned as text content blocks, which round-trip
//! through the dispatcher's own normalization.
//!
//! A plain `GET /healthz` is kept for load balancers.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::clock::ShutdownListener;
use crate::dispatch::protocol::PROTOCOL_VERSION;

use super::tools::{ControlContext, call_tool, tool_definitions};

/// Session id header, shared with the dispatcher's HTTP transport.
const SESSION_HEADER: &str = "mcp-session-id";

// ─── Server state ────────────────────────────────────────────────────────────

struct ServerState {
    ctx: Arc<ControlContext>,
    /// Session ids issued by `initialize`.  Requests for other methods must
    /// present one of these.
    sessions: Mutex<HashSet<String>>,
}

// ─── Entry points ────────────────────────────────────────────────────────────

/// Bind the configured host/port.
pub async fn bind(ctx: &ControlContext) -> Result<TcpListener, String> {
    let addr = format!("{}:{}", ctx.cfg.mcp_host, ctx.cfg.mcp_port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("could not bind control plane to {addr}: {e}"))
}

/// Serve the control plane on `listener` until shutdown fires.
pub async fn serve_on(
    listener: TcpListener,
    ctx: Arc<ControlContext>,
    mut shutdown: ShutdownListener,
) -> Result<(), String> {
    let state = Arc::new(ServerState { ctx, sessions: Mutex::new(HashSet::new()) });

    let app = Router::new()
        .route("/mcp", post(rpc_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // Control plane sits on an internal network.

    let addr: SocketAddr = listener.local_addr().map_err(|e| e.to_string())?;
    log::info!("control plane listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(|e| format!("control plane error: {e}"))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "scheduler"}))
}

fn rpc_result(id: Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn rpc_error(id: Value, code: i64, message: &str) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }))
}

async fn rpc_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    let params = body
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    // Notifications carry no id and expect no reply.
    if method.starts_with("notifications/") {
        return StatusCode::ACCEPTED.into_response();
    }

    match method.as_str() {
        "initialize" => {
            let session_id = Uuid::new_v4().simple().to_string();
            state.sessions.lock().await.insert(session_id.clone());
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "cadence-scheduler",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            ([(SESSION_HEADER, session_id)], rpc_result(id, result)).into_response()
        }
        "ping" => rpc_result(id, json!({})).into_response(),
        "tools/list" | "tools/call" => {
            let presented = headers
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let known = match &presented {
                Some(session_id) => state.sessions.lock().await.contains(session_id),
                None => false,
            };
            if !known {
                return (
                    StatusCode::BAD_REQUEST,
                    rpc_error(id, -32000, "missing or unknown session id; call initialize first"),
                )
                    .into_response();
            }

            if method == "tools/list" {
                let tools: Vec<Value> = tool_definitions()
                    .iter()
                    .map(|def| {
                        json!({
                            "name": def.name,
                            "description": def.description,
                            "inputSchema": def.input_schema,
                        })
                    })
                    .collect();
                return rpc_result(id, json!({"tools": tools})).into_response();
            }

            let name = params.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let mut arguments = params
                .get("arguments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let result = authorized_call(&state.ctx, &name, &mut arguments).await;
            let is_error = result.get("ok") == Some(&Value::Bool(false));
            let text = serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
            rpc_result(
                id,
                json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": is_error,
                }),
            )
            .into_response()
        }
        "" => (StatusCode::BAD_REQUEST, rpc_error(id, -32600, "missing method")).into_response(),
        other => {
            rpc_error(id, -32601, &format!("method not found: {other}")).into_response()
        }
    }
}

/// Enforce the `_client_token` gate, then run the tool.
///
/// The token argument is stripped before the handler sees it either way;
/// when no token is configured (local dev) the surface is open.
async fn authorized_call(
    ctx: &ControlContext,
    name: &str,
    arguments: &mut Map<String, Value>,
) -> Value {
    let presented = arguments
        .remove("_client_token")
        .and_then(|v| v.as_str().map(str::to_string));

    if let Some(expected) = &ctx.cfg.client_token {
        if presented.as_deref() != Some(expected.as_str()) {
            return json!({"ok": false, "error": "unauthorized"});
        }
    }
    call_tool(ctx, name, arguments).await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
