//! Dispatch of tool calls to configured backends.
//!
//! The [`Dispatcher`] owns one logical session per backend (an HTTP session
//! id + tool cache, or a live child process) and serializes calls that share
//! a session; calls against different backends proceed independently.
//!
//! Its public surface never fails: every configuration, transport, protocol,
//! or RPC problem is folded into the normalized `{ok: false, error, …}`
//! value shape, and every invocation, successful or not, produces exactly
//! one audit row.

pub mod http;
pub mod protocol;
pub mod stdio;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::audit::AuditLog;
use crate::config::{BackendSpec, Transport};

pub use protocol::{ToolDef, normalize_tool_result, resolve_tool_name, result_error, result_ok};

/// Default bound on initialize/call exchanges.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-job call budget: the default timeout, capped at the job's own
/// interval (a tool may not outlive its slot) and floored at one second.
pub fn call_timeout(interval_seconds: i64) -> Duration {
    let secs = interval_seconds.clamp(1, DEFAULT_CALL_TIMEOUT.as_secs() as i64);
    Duration::from_secs(secs as u64)
}

// ─── DispatchError ───────────────────────────────────────────────────────────

/// Internal dispatch failure.  Converted to a `{ok: false, error}` value at
/// the dispatcher boundary; callers never see this type raised.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown server: {0}")]
    UnknownBackend(String),

    #[error("{0}")]
    Config(String),

    #[error("{message}")]
    Transport { message: String, details: Option<String> },

    #[error("{message}")]
    Protocol { message: String, details: Option<String> },

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Rpc(String),
}

impl DispatchError {
    /// Coarse classification recorded as the audit row's `error_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownBackend(_) | DispatchError::Config(_) => "config",
            DispatchError::Transport { .. } => "transport",
            DispatchError::Protocol { .. } => "protocol",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Rpc(_) => "rpc",
        }
    }

    /// The caller-facing failure value.
    pub fn to_value(&self) -> Value {
        let mut value = json!({"ok": false, "error": self.to_string()});
        if let DispatchError::Transport { details: Some(details), .. }
        | DispatchError::Protocol { details: Some(details), .. } = self
        {
            value["details"] = Value::String(details.clone());
        }
        value
    }

    /// Whether the backing session should be discarded so the next call
    /// starts from a fresh connection or child process.
    fn poisons_session(&self) -> bool {
        matches!(
            self,
            DispatchError::Transport { .. }
                | DispatchError::Timeout(_)
                | DispatchError::Protocol { .. }
        )
    }
}

// ─── BackendSession ──────────────────────────────────────────────────────────

enum SessionKind {
    Http(http::HttpSession),
    Stdio(stdio::StdioSession),
}

/// Per-backend session state, guarded by one async mutex so the session id
/// and tool-list cache stay consistent under concurrent callers.
struct BackendSession {
    spec: BackendSpec,
    kind: Option<SessionKind>,
}

impl BackendSession {
    fn new(spec: BackendSpec) -> Self {
        Self { spec, kind: None }
    }

    /// Connect and complete the handshake if not already done.
    async fn ensure_ready(
        &mut self,
        client: &reqwest::Client,
        repo_root: &std::path::Path,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        if self.kind.is_none() {
            self.kind = Some(match self.spec.transport {
                Transport::Http => {
                    let base = self.spec.url.as_deref().ok_or_else(|| {
                        DispatchError::Config(format!("backend '{}' has no URL", self.spec.name))
                    })?;
                    url::Url::parse(base).map_err(|e| {
                        DispatchError::Config(format!(
                            "backend '{}' has malformed URL '{base}': {e}",
                            self.spec.name
                        ))
                    })?;
                    SessionKind::Http(http::HttpSession::new(base, client.clone()))
                }
                Transport::Stdio => {
                    let mut session = stdio::StdioSession::spawn(&self.spec, repo_root).await?;
                    session.initialize(timeout).await?;
                    SessionKind::Stdio(session)
                }
            });
        }
        if let Some(SessionKind::Http(session)) = &mut self.kind {
            session.ensure_initialized(timeout).await?;
        }
        Ok(())
    }

    fn session_id(&self) -> Option<&str> {
        match &self.kind {
            Some(SessionKind::Http(session)) => session.session_id(),
            _ => None,
        }
    }

    async fn tools(
        &mut self,
        force_refresh: bool,
        timeout: Duration,
    ) -> Result<Vec<ToolDef>, DispatchError> {
        match &mut self.kind {
            Some(SessionKind::Http(session)) => session.tools(force_refresh, timeout).await,
            Some(SessionKind::Stdio(session)) => session.tools(force_refresh, timeout).await,
            None => Ok(Vec::new()),
        }
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        match &mut self.kind {
            Some(SessionKind::Http(session)) => session.call_tool(name, arguments, timeout).await,
            Some(SessionKind::Stdio(session)) => session.call_tool(name, arguments, timeout).await,
            None => Err(DispatchError::Transport {
                message: "session not connected".to_string(),
                details: None,
            }),
        }
    }

    /// Discard session state; stdio children are killed.
    async fn teardown(&mut self) {
        match self.kind.take() {
            Some(SessionKind::Stdio(session)) => session.shutdown().await,
            Some(SessionKind::Http(mut session)) => session.reset(),
            None => {}
        }
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// Routes tool calls to backends over the right transport.
pub struct Dispatcher {
    backends: HashMap<String, BackendSpec>,
    sessions: Mutex<HashMap<String, Arc<Mutex<BackendSession>>>>,
    client: reqwest::Client,
    audit: Arc<AuditLog>,
    repo_root: PathBuf,
}

impl Dispatcher {
    pub fn new(backends: HashMap<String, BackendSpec>, audit: Arc<AuditLog>) -> Self {
        let repo_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            backends,
            sessions: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
            audit,
            repo_root,
        }
    }

    /// The configured backend registry, for operator inspection.
    pub fn backend_specs(&self) -> Vec<&BackendSpec> {
        let mut specs: Vec<&BackendSpec> = self.backends.values().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    async fn session_handle(&self, server: &str) -> Option<Arc<Mutex<BackendSession>>> {
        let spec = self.backends.get(server)?;
        let mut sessions = self.sessions.lock().await;
        Some(
            sessions
                .entry(server.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BackendSession::new(spec.clone()))))
                .clone(),
        )
    }

    /// Invoke `tool` on `server` with the default timeout.
    pub async fn call(&self, server: &str, tool: &str, args: Value, source: Option<&str>) -> Value {
        self.call_with_timeout(server, tool, args, source, DEFAULT_CALL_TIMEOUT).await
    }

    /// Invoke `tool` on `server`, folding every failure into the normalized
    /// `{ok: false, error}` shape.  Exactly one audit row is written.
    pub async fn call_with_timeout(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        source: Option<&str>,
        timeout: Duration,
    ) -> Value {
        let Some(handle) = self.session_handle(server).await else {
            let err = DispatchError::UnknownBackend(server.to_string());
            let ticket = self.audit.begin(server, tool, &args, source, None);
            self.audit
                .finish(ticket, false, None, Some(err.to_string()), Some(err.kind().to_string()))
                .await;
            return err.to_value();
        };

        // One session per backend: holding this lock serializes calls that
        // share the session id and tool cache.
        let mut session = handle.lock().await;

        if let Err(err) = session.ensure_ready(&self.client, &self.repo_root, timeout).await {
            session.teardown().await;
            let ticket = self.audit.begin(server, tool, &args, source, None);
            self.audit
                .finish(ticket, false, None, Some(err.to_string()), Some(err.kind().to_string()))
                .await;
            return err.to_value();
        }

        // Resolve human-authored names against the backend's tool list.  A
        // failed listing falls back to the literal name and lets the backend
        // reject it.
        let resolved = match session.tools(false, timeout).await {
            Ok(tools) => {
                let names: Vec<String> = tools.into_iter().map(|t| t.name).collect();
                resolve_tool_name(tool, &names)
            }
            Err(e) => {
                log::debug!("dispatch: tools/list for '{server}' failed ({e}); using literal name");
                tool.to_string()
            }
        };

        // The audit ticket captures the args before token injection, so the
        // stored row can never contain the real secret.
        let ticket = self.audit.begin(server, &resolved, &args, source, session.session_id());

        let mut args = args;
        if let Some(token) = &session.spec.client_token {
            if let Value::Object(map) = &mut args {
                map.entry("_client_token".to_string())
                    .or_insert_with(|| Value::String(token.clone()));
            }
        }

        match session.call_tool(&resolved, args, timeout).await {
            Ok(raw) => {
                let normalized = normalize_tool_result(raw);
                let success = result_ok(&normalized) != Some(false);
                let error = result_error(&normalized);
                self.audit
                    .finish(
                        ticket,
                        success,
                        Some(AuditLog::preview(&normalized)),
                        error,
                        (!success).then(|| "tool".to_string()),
                    )
                    .await;
                normalized
            }
            Err(err) => {
                if err.poisons_session() {
                    session.teardown().await;
                }
                self.audit
                    .finish(ticket, false, None, Some(err.to_string()), Some(err.kind().to_string()))
                    .await;
                err.to_value()
            }
        }
    }

    /// Initialize + list tools, reporting reachability and latency.
    pub async fn health_check(&self, server: &str) -> Value {
        let started = std::time::Instant::now();
        let elapsed_ms = |started: std::time::Instant| started.elapsed().as_millis() as u64;

        let Some(handle) = self.session_handle(server).await else {
            return json!({
                "ok": false,
                "status": "unknown",
                "message": format!("unknown server: {server}"),
                "response_time_ms": elapsed_ms(started),
            });
        };
        let mut session = handle.lock().await;

        let ready = session.ensure_ready(&self.client, &self.repo_root, DEFAULT_CALL_TIMEOUT).await;
        let listed = match ready {
            Ok(()) => session.tools(true, DEFAULT_CALL_TIMEOUT).await,
            Err(e) => Err(e),
        };
        match listed {
            Ok(tools) => json!({
                "ok": true,
                "status": "healthy",
                "message": format!("{} tools available", tools.len()),
                "tool_count": tools.len(),
                "response_time_ms": elapsed_ms(started),
            }),
            Err(e) => {
                session.teardown().await;
                json!({
                    "ok": false,
                    "status": "unhealthy",
                    "message": e.to_string(),
                    "response_time_ms": elapsed_ms(started),
                })
            }
        }
    }

    /// Tear down every session; stdio children are killed.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, handle) in sessions.drain() {
            handle.lock().await.teardown().await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
