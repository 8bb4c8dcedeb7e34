//! Persistent audit log of every tool invocation, scheduled or interactive.
//!
//! The write path is a pair of hooks around each dispatch: [`AuditLog::begin`]
//! captures the start time and a redacted copy of the arguments *before*
//! token injection; [`AuditLog::finish`] adds the outcome and writes one row.
//! Writes are best-effort — a failed audit insert is logged and swallowed,
//! never surfaced to the caller.
//!
//! The read side exposes the query and statistics API used by operators.

pub mod redact;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::store::{
    CallStats, HourlyStats, NewToolCall, ServerStats, Store, StoreError, ToolCallQuery,
    ToolCallRecord, ToolStats,
};

pub use redact::{REDACTED, redact_args};

/// Audit rows older than this are removed by [`AuditLog::cleanup_old_logs`].
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Result previews are truncated to this many Unicode code points.
pub const PREVIEW_MAX_CHARS: usize = 2000;

// ─── CallTicket ──────────────────────────────────────────────────────────────

/// State captured by the `before` hook, consumed by the `after` hook.
#[derive(Debug, Clone)]
pub struct CallTicket {
    server_name: String,
    tool_name: String,
    /// Redacted at capture time; the raw args never touch this struct.
    args_json: String,
    source: Option<String>,
    request_id: String,
    session_id: Option<String>,
    started_at: DateTime<Utc>,
}

impl CallTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

// ─── AuditLog ────────────────────────────────────────────────────────────────

/// Interceptor and query facade over the audit table.
pub struct AuditLog {
    store: Arc<dyn Store>,
    retention_days: i64,
}

impl AuditLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, retention_days: DEFAULT_RETENTION_DAYS }
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days.max(1);
        self
    }

    // ── write path ──────────────────────────────────────────────────────────

    /// `before` hook: capture start time and redacted args.
    pub fn begin(
        &self,
        server_name: &str,
        tool_name: &str,
        args: &Value,
        source: Option<&str>,
        session_id: Option<&str>,
    ) -> CallTicket {
        let redacted = redact_args(args);
        CallTicket {
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            args_json: serde_json::to_string(&redacted).unwrap_or_else(|_| "{}".to_string()),
            source: source.map(str::to_string),
            request_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            session_id: session_id.map(str::to_string),
            started_at: Utc::now(),
        }
    }

    /// `after` hook: write one row.  Failures are logged and dropped.
    pub async fn finish(
        &self,
        ticket: CallTicket,
        success: bool,
        result_preview: Option<String>,
        error_message: Option<String>,
        error_type: Option<String>,
    ) {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - ticket.started_at).num_microseconds().unwrap_or(0) as f64
            / 1000.0;
        let row = NewToolCall {
            server_name: ticket.server_name,
            tool_name: ticket.tool_name,
            args_json: ticket.args_json,
            success,
            result_preview,
            error_message,
            error_type,
            started_at: ticket.started_at,
            finished_at,
            duration_ms,
            source: ticket.source,
            request_id: ticket.request_id,
            session_id: ticket.session_id,
        };
        if let Err(e) = self.store.insert_tool_call(row).await {
            log::warn!("audit: failed to record tool call: {e}");
        }
    }

    /// Truncate a result value to the caller-visible preview.
    pub fn preview(value: &Value) -> String {
        let text = match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
        };
        truncate_chars(&text, PREVIEW_MAX_CHARS)
    }

    // ── query API ───────────────────────────────────────────────────────────

    pub async fn get_tool_calls(
        &self,
        query: ToolCallQuery,
    ) -> Result<Vec<ToolCallRecord>, StoreError> {
        self.store.get_tool_calls(query).await
    }

    pub async fn get_tool_call_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<CallStats, StoreError> {
        self.store.tool_call_stats(since, until).await
    }

    pub async fn get_server_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ServerStats>, StoreError> {
        self.store.server_stats(since, until).await
    }

    pub async fn get_tool_stats(
        &self,
        server: Option<String>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ToolStats>, StoreError> {
        self.store.tool_stats(server, since, until, limit).await
    }

    pub async fn get_hourly_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<HourlyStats>, StoreError> {
        self.store.hourly_stats(since, until).await
    }

    pub async fn get_recent_errors(
        &self,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ToolCallRecord>, StoreError> {
        self.store.recent_errors(since, limit).await
    }

    /// Delete rows older than the retention horizon; returns rows removed.
    pub async fn cleanup_old_logs(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let removed = self.store.delete_tool_calls_before(cutoff).await?;
        if removed > 0 {
            log::info!("audit: retention sweep removed {removed} row(s)");
        }
        Ok(removed)
    }
}

/// Truncate on a code-point boundary, never mid-scalar.
fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
