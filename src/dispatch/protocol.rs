//! JSON-RPC 2.0 wire types, result normalization, and tool-name resolution.
//!
//! Every backend, regardless of transport, is spoken to with the same
//! envelope: `{"jsonrpc": "2.0", "id": n, "method": "...", "params": {...}}`.
//! Downstream code (the tick loop, the audit log, control-plane callers)
//! only ever sees the normalized `{ok, ...}` object shape produced by
//! [`normalize_tool_result`].

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Protocol version advertised on `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-11-25";

/// Client name sent in `clientInfo`.
pub const CLIENT_NAME: &str = "cadence";

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

/// A JSON-RPC 2.0 request.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self { jsonrpc: "2.0", id, method: method.to_string(), params }
    }

    pub fn initialize(id: u64) -> Self {
        Self::new(
            id,
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
            })),
        )
    }

    pub fn tools_list(id: u64) -> Self {
        Self::new(id, "tools/list", Some(json!({})))
    }

    pub fn tools_call(id: u64, name: &str, arguments: Value) -> Self {
        Self::new(id, "tools/call", Some(json!({"name": name, "arguments": arguments})))
    }
}

/// The `notifications/initialized` notification (no id, no reply expected).
pub fn initialized_notification() -> Value {
    json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Convert into `Ok(result)` or `Err(message)`.
    pub fn into_result(self) -> Result<Value, String> {
        if let Some(err) = self.error {
            let mut msg = format!("RPC error {}: {}", err.code, err.message);
            if let Some(data) = err.data {
                if !data.is_null() {
                    msg.push_str(&format!(" ({data})"));
                }
            }
            return Err(msg);
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ─── Tool descriptors ────────────────────────────────────────────────────────

/// A tool exposed by a backend, as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Parse the `tools/list` result payload into descriptors.
pub fn parse_tool_list(result: &Value) -> Vec<ToolDef> {
    result
        .get("tools")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

// ─── Result normalization ────────────────────────────────────────────────────

/// Normalize a `tools/call` result into the uniform `{ok, ...}` shape.
///
/// - a dict with a `content` array of `{type: "text", text}` blocks: the
///   texts are joined with newlines; if the joined text parses as a JSON
///   object that object is returned, otherwise `{ok: true, text}`.
/// - any other dict: passed through, with `ok: true` added when missing.
/// - a non-object: wrapped as `{ok: true, result}`.
pub fn normalize_tool_result(result: Value) -> Value {
    if let Value::Object(map) = &result {
        if let Some(Value::Array(content)) = map.get("content") {
            let texts: Vec<&str> = content
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if !texts.is_empty() {
                let joined = texts.join("\n");
                if let Ok(Value::Object(parsed)) = serde_json::from_str::<Value>(&joined) {
                    return Value::Object(parsed);
                }
                let is_error =
                    map.get("isError").and_then(Value::as_bool).unwrap_or(false);
                if is_error {
                    return json!({"ok": false, "error": joined});
                }
                return json!({"ok": true, "text": joined});
            }
        }

        let mut map = map.clone();
        map.entry("ok".to_string()).or_insert(Value::Bool(true));
        return Value::Object(map);
    }

    json!({"ok": true, "result": result})
}

/// Extract the caller-facing `ok` flag from a normalized value.
pub fn result_ok(value: &Value) -> Option<bool> {
    value.get("ok").and_then(Value::as_bool)
}

/// Extract the caller-facing error text from a normalized value.
pub fn result_error(value: &Value) -> Option<String> {
    match value.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

// ─── Tool-name resolution ────────────────────────────────────────────────────

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

/// Resolve a human-authored tool name against the backend's tool list.
///
/// Handles case and hyphen/underscore differences, then falls back to a
/// unique suffix/prefix match.  When nothing matches unambiguously the
/// original name is returned and the backend gets to reject it.
pub fn resolve_tool_name(requested: &str, names: &[String]) -> String {
    if names.is_empty() || names.iter().any(|n| n == requested) {
        return requested.to_string();
    }

    let norm = normalize_name(requested);
    if let Some(hit) = names.iter().find(|n| normalize_name(n) == norm) {
        return hit.clone();
    }

    let candidates: Vec<&String> = names
        .iter()
        .filter(|n| {
            let nn = normalize_name(n);
            nn.ends_with(&norm) || norm.ends_with(&nn)
        })
        .collect();
    if let [only] = candidates.as_slice() {
        return (*only).clone();
    }

    requested.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── JSON-RPC serialization ────────────────────────────────────────────────

    #[test]
    fn request_serializes_envelope() {
        let req = JsonRpcRequest::tools_call(3, "health_check", json!({"a": 1}));
        let s = serde_json::to_string(&req).expect("serialize");
        assert!(s.contains("\"jsonrpc\":\"2.0\""));
        assert!(s.contains("\"method\":\"tools/call\""));
        assert!(s.contains("\"id\":3"));
        assert!(s.contains("\"name\":\"health_check\""));
    }

    #[test]
    fn request_omits_missing_params() {
        let req = JsonRpcRequest::new(1, "ping", None);
        let s = serde_json::to_string(&req).expect("serialize");
        assert!(!s.contains("params"));
    }

    #[test]
    fn initialize_carries_protocol_version() {
        let req = JsonRpcRequest::initialize(1);
        let params = req.params.expect("params");
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
    }

    #[test]
    fn response_error_becomes_err() {
        let raw = r#"{"id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).expect("deserialize");
        let err = resp.into_result().expect_err("should be an error");
        assert!(err.contains("Method not found"));
        assert!(err.contains("-32601"));
    }

    #[test]
    fn response_result_becomes_ok() {
        let raw = r#"{"id":1,"result":{"tools":[]}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(resp.into_result().expect("ok"), json!({"tools": []}));
    }

    // ── Normalization ─────────────────────────────────────────────────────────

    #[test]
    fn content_text_parsing_returns_embedded_object() {
        let result = json!({
            "content": [{"type": "text", "text": "{\"ok\": true, \"n\": 7}"}]
        });
        assert_eq!(normalize_tool_result(result), json!({"ok": true, "n": 7}));
    }

    #[test]
    fn content_plain_text_wraps_as_text() {
        let result = json!({"content": [{"type": "text", "text": "all systems go"}]});
        assert_eq!(
            normalize_tool_result(result),
            json!({"ok": true, "text": "all systems go"})
        );
    }

    #[test]
    fn content_blocks_are_joined_with_newlines() {
        let result = json!({"content": [
            {"type": "text", "text": "line one"},
            {"type": "image", "data": "ignored"},
            {"type": "text", "text": "line two"},
        ]});
        assert_eq!(
            normalize_tool_result(result),
            json!({"ok": true, "text": "line one\nline two"})
        );
    }

    #[test]
    fn content_is_error_flag_maps_to_failure() {
        let result = json!({
            "isError": true,
            "content": [{"type": "text", "text": "tool exploded"}]
        });
        assert_eq!(
            normalize_tool_result(result),
            json!({"ok": false, "error": "tool exploded"})
        );
    }

    #[test]
    fn dict_with_ok_passes_through() {
        let result = json!({"ok": false, "error": "nope", "detail": 1});
        assert_eq!(normalize_tool_result(result.clone()), result);
    }

    #[test]
    fn dict_without_ok_gains_ok_true() {
        let normalized = normalize_tool_result(json!({"status": "healthy"}));
        assert_eq!(normalized, json!({"ok": true, "status": "healthy"}));
    }

    #[test]
    fn non_object_wraps_as_result() {
        assert_eq!(normalize_tool_result(json!(42)), json!({"ok": true, "result": 42}));
        assert_eq!(
            normalize_tool_result(json!(["a", "b"])),
            json!({"ok": true, "result": ["a", "b"]})
        );
    }

    #[test]
    fn result_helpers_read_normalized_values() {
        let value = json!({"ok": false, "error": "boom"});
        assert_eq!(result_ok(&value), Some(false));
        assert_eq!(result_error(&value), Some("boom".to_string()));

        let value = json!({"n": 1});
        assert_eq!(result_ok(&value), None);
        assert_eq!(result_error(&value), None);
    }

    // ── Tool resolution ───────────────────────────────────────────────────────

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_name_wins() {
        let list = names(&["health_check", "list_containers"]);
        assert_eq!(resolve_tool_name("health_check", &list), "health_check");
    }

    #[test]
    fn case_and_hyphen_differences_resolve() {
        let list = names(&["Scheduler-Health"]);
        assert_eq!(resolve_tool_name("scheduler_health", &list), "Scheduler-Health");
    }

    #[test]
    fn unique_suffix_match_resolves() {
        let list = names(&["jenkins_get_server_info", "jenkins_list_jobs"]);
        assert_eq!(resolve_tool_name("get_server_info", &list), "jenkins_get_server_info");
    }

    #[test]
    fn ambiguous_suffix_keeps_original() {
        let list = names(&["a_health_check", "b_health_check"]);
        assert_eq!(resolve_tool_name("health_check", &list), "health_check");
    }

    #[test]
    fn unknown_name_passes_through() {
        let list = names(&["health_check"]);
        assert_eq!(resolve_tool_name("totally_unknown", &list), "totally_unknown");
    }

    #[test]
    fn empty_tool_list_passes_through() {
        assert_eq!(resolve_tool_name("anything", &[]), "anything");
    }

    #[test]
    fn parse_tool_list_reads_defs() {
        let result = json!({"tools": [
            {"name": "a", "description": "first", "inputSchema": {"type": "object"}},
            {"name": "b"},
        ]});
        let tools = parse_tool_list(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "a");
        assert!(tools[1].description.is_empty());
        assert!(tools[1].input_schema.is_null());
    }
}
