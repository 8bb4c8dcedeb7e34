//! Streamable-HTTP transport: JSON-RPC POSTs to `<base>/mcp`.
//!
//! The initialize reply carries a session identifier in the
//! `mcp-session-id` response header, which must be echoed on every
//! subsequent request.  Response bodies may be plain JSON or Server-Sent
//! Events framing; both are accepted without prior knowledge of which the
//! backend speaks.

use std::time::Duration;

use serde_json::Value;

use super::DispatchError;
use super::protocol::{JsonRpcRequest, JsonRpcResponse, ToolDef, parse_tool_list};

/// Response header carrying the session identifier.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// How much of an error body is kept for diagnostics.
const BODY_SNIPPET_CHARS: usize = 500;

// ─── URL / SSE helpers ───────────────────────────────────────────────────────

/// Append `/mcp` to a base URL unless it is already present.
pub fn normalize_mcp_url(url: &str) -> String {
    let base = url.trim().trim_end_matches('/');
    if base.ends_with("/mcp") {
        base.to_string()
    } else {
        format!("{base}/mcp")
    }
}

/// Extract the JSON payload from an SSE-framed response body: every `data:`
/// line is stripped of its prefix, the lines are joined with newlines, and
/// the result is parsed as JSON.
pub fn extract_sse_json(text: &str) -> Option<Value> {
    let data_lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect();
    if data_lines.is_empty() {
        return None;
    }
    serde_json::from_str(&data_lines.join("\n")).ok()
}

fn snippet(text: &str) -> String {
    text.chars().take(BODY_SNIPPET_CHARS).collect()
}

// ─── HttpSession ─────────────────────────────────────────────────────────────

/// One logical MCP session against one HTTP backend.
///
/// Holds the cached session id and tool list; the owning dispatcher
/// serializes access so both stay consistent.
pub struct HttpSession {
    endpoint: String,
    client: reqwest::Client,
    session_id: Option<String>,
    initialized: bool,
    tools: Option<Vec<ToolDef>>,
    next_id: u64,
}

impl HttpSession {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            endpoint: normalize_mcp_url(base_url),
            client,
            session_id: None,
            initialized: false,
            tools: None,
            next_id: 1,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Drop session state so the next call re-initializes.
    pub fn reset(&mut self) {
        self.session_id = None;
        self.initialized = false;
        self.tools = None;
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// POST one JSON-RPC request and return its `result` payload.
    async fn request(
        &mut self,
        req: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(req);
        if let Some(session_id) = &self.session_id {
            builder = builder.header(SESSION_HEADER, session_id.as_str());
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout(format!("timeout after {}s", timeout.as_secs()))
            } else {
                DispatchError::Transport {
                    message: format!("connection failed: {e}"),
                    details: None,
                }
            }
        })?;

        // A new session id supersedes the cached one.
        if let Some(session_id) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let status = resp.status();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = resp.text().await.map_err(|e| DispatchError::Transport {
            message: format!("failed to read response body: {e}"),
            details: None,
        })?;

        if status.as_u16() >= 400 {
            return Err(DispatchError::Transport {
                message: format!("HTTP {}", status.as_u16()),
                details: Some(snippet(&body)),
            });
        }

        let parsed: Value = if content_type.contains("text/event-stream") {
            extract_sse_json(&body).ok_or_else(|| DispatchError::Protocol {
                message: "failed to parse SSE response".to_string(),
                details: Some(snippet(&body)),
            })?
        } else {
            serde_json::from_str(&body).map_err(|e| DispatchError::Protocol {
                message: format!("invalid JSON response: {e}"),
                details: Some(snippet(&body)),
            })?
        };

        serde_json::from_value::<JsonRpcResponse>(parsed)
            .map_err(|e| DispatchError::Protocol {
                message: format!("malformed JSON-RPC response: {e}"),
                details: None,
            })?
            .into_result()
            .map_err(DispatchError::Rpc)
    }

    /// Complete the handshake once per session.
    pub async fn ensure_initialized(&mut self, timeout: Duration) -> Result<(), DispatchError> {
        if self.initialized {
            return Ok(());
        }
        let id = self.next_id();
        self.request(&JsonRpcRequest::initialize(id), timeout).await?;
        if self.session_id.is_none() {
            log::warn!("backend at {} returned no {SESSION_HEADER} header", self.endpoint);
        }
        self.initialized = true;
        Ok(())
    }

    /// The backend's tool list, cached per session.
    pub async fn tools(
        &mut self,
        force_refresh: bool,
        timeout: Duration,
    ) -> Result<Vec<ToolDef>, DispatchError> {
        self.ensure_initialized(timeout).await?;
        if !force_refresh {
            if let Some(tools) = &self.tools {
                return Ok(tools.clone());
            }
        }
        let id = self.next_id();
        let result = self.request(&JsonRpcRequest::tools_list(id), timeout).await?;
        let tools = parse_tool_list(&result);
        self.tools = Some(tools.clone());
        Ok(tools)
    }

    /// Invoke one tool; returns the raw (un-normalized) result payload.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        self.ensure_initialized(timeout).await?;
        let id = self.next_id();
        self.request(&JsonRpcRequest::tools_call(id, name, arguments), timeout).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
