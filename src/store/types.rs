//! Domain types persisted by the store: jobs, runs, and audit rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::StoreError;

/// Floor applied to `interval_seconds` on every write.
pub const MIN_INTERVAL_SECONDS: i64 = 5;

// ─── Job ─────────────────────────────────────────────────────────────────────

/// A stored instruction to invoke one tool on one backend at a fixed interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub enabled: bool,
    pub label: String,
    /// Backend identifier; must match a configured backend at dispatch time.
    pub server: String,
    /// Tool name, opaque to the scheduler and resolved by the dispatcher.
    pub tool: String,
    /// Tool arguments as JSON text.  Always a JSON object after upsert
    /// normalization; `_client_token` is never stored here.
    pub args_json: String,
    pub interval_seconds: i64,
    /// Next eligible fire time; `None` means eligible immediately.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Parse the stored args into an object, falling back to empty on any
    /// malformed text that predates normalization.
    pub fn args(&self) -> Map<String, Value> {
        match serde_json::from_str::<Value>(&self.args_json) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

// ─── JobDraft ────────────────────────────────────────────────────────────────

/// Input to `upsert_job`.  `id = None` inserts a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDraft {
    pub id: Option<Uuid>,
    pub enabled: bool,
    pub label: String,
    pub server: String,
    pub tool: String,
    pub args: Value,
    pub interval_seconds: i64,
}

impl JobDraft {
    /// Apply write-time invariants: trim names, clamp the interval, coerce
    /// args to an object.  An empty label becomes `"Untitled"`; an empty
    /// server or tool is a caller error.
    pub fn normalized(mut self) -> Result<JobDraft, StoreError> {
        let label = self.label.trim();
        self.label = if label.is_empty() { "Untitled".to_string() } else { label.to_string() };

        self.server = self.server.trim().to_string();
        if self.server.is_empty() {
            return Err(StoreError::InvalidJob("server must be non-empty".to_string()));
        }
        self.tool = self.tool.trim().to_string();
        if self.tool.is_empty() {
            return Err(StoreError::InvalidJob("tool must be non-empty".to_string()));
        }

        if !self.args.is_object() {
            self.args = Value::Object(Map::new());
        }
        self.interval_seconds = self.interval_seconds.max(MIN_INTERVAL_SECONDS);
        Ok(self)
    }

    /// Serialized args for storage.  Only valid on a normalized draft.
    pub fn args_json(&self) -> String {
        serde_json::to_string(&self.args).unwrap_or_else(|_| "{}".to_string())
    }
}

// ─── Run ─────────────────────────────────────────────────────────────────────

/// One historical execution attempt of one job.  Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    /// May dangle after the job is deleted; history is kept for audit.
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` when the backend returned a shape with no explicit success
    /// flag but no failure either.
    pub ok: Option<bool>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Input to `record_run`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: Option<bool>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

// ─── Audit rows ──────────────────────────────────────────────────────────────

/// One persisted tool invocation, scheduled or interactive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: i64,
    pub server_name: String,
    pub tool_name: String,
    /// Redacted before it ever reaches the store.
    pub args_json: String,
    pub success: bool,
    pub result_preview: Option<String>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    /// Free-form caller tag, e.g. `scheduler` or a page name.
    pub source: Option<String>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
}

/// Input to `insert_tool_call`.  `args_json` must already be redacted.
#[derive(Debug, Clone)]
pub struct NewToolCall {
    pub server_name: String,
    pub tool_name: String,
    pub args_json: String,
    pub success: bool,
    pub result_preview: Option<String>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub source: Option<String>,
    pub request_id: String,
    pub session_id: Option<String>,
}

/// Filter for `get_tool_calls`.
#[derive(Debug, Clone, Default)]
pub struct ToolCallQuery {
    pub server: Option<String>,
    pub tool: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl ToolCallQuery {
    pub fn with_limit(limit: i64) -> Self {
        Self { limit, ..Default::default() }
    }
}

// ─── Stats shapes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CallStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    /// Percentage, rounded to one decimal place.
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub unique_servers: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub server_name: String,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: f64,
    pub unique_tools: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub server_name: String,
    pub tool_name: String,
    pub total: i64,
    pub successful: i64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyStats {
    /// UTC hour bucket in `YYYY-MM-DDTHH` form.
    pub hour: String,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
}

/// Shared success-rate rounding so both engines report identically.
pub fn success_rate(successful: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let rate = successful as f64 / total as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

// ─── Tests ───────────────────────────────────────────────────────────────────
