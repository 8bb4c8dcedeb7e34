//! Durable persistence for job definitions, run history, and the tool-call
//! audit log.
//!
//! Two engines live behind the [`Store`] trait: an embedded SQLite file
//! (default, safe for single-host deployments) and networked Postgres (for
//! the shared platform database).  [`open_store`] picks the engine from the
//! URL alone; nothing engine-specific leaks past this module boundary.
//!
//! Three tables: `scheduler_jobs`, `scheduler_runs`, `mcp_tool_calls`.
//! Schema creation is idempotent and migrations are additive only — opening
//! a store with an older schema adds missing columns without data loss.

pub mod postgres;
pub mod sqlite;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use types::{
    CallStats, HourlyStats, Job, JobDraft, MIN_INTERVAL_SECONDS, NewRun, NewToolCall, Run,
    ServerStats, ToolCallQuery, ToolCallRecord, ToolStats,
};

use crate::config::schema::is_postgres_url;

/// How far `claim_due_jobs` pushes `next_run_at` forward while a job is being
/// executed.  Not a distributed lock: it only makes a second scheduler
/// instance unlikely to select the same job, and tolerates crashes (a missed
/// advance re-fires the job after this horizon).
pub const CLAIM_HORIZON_SECONDS: i64 = 30;

// ─── StoreError ──────────────────────────────────────────────────────────────

/// Engine-neutral store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),
}

// ─── Store trait ─────────────────────────────────────────────────────────────

/// Relational persistence contract shared by both engines.
///
/// All timestamps are UTC.  Implementations must tolerate concurrent access
/// from the tick loop and the control-plane request handlers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create tables and indexes if missing, then apply additive migrations.
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Engine name for health reporting (`"sqlite"` / `"postgres"`).
    fn kind(&self) -> &'static str;

    // ── jobs ────────────────────────────────────────────────────────────────

    /// All jobs, newest first by `created_at`.
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Insert or mutate in place.  Applies the write-time invariants via
    /// [`JobDraft::normalized`]; initializes `next_run_at` to
    /// `now + interval_seconds` iff previously null; refreshes `updated_at`.
    async fn upsert_job(&self, draft: JobDraft) -> Result<Job, StoreError>;

    /// Returns `true` iff a row was removed.  Never cascades to runs.
    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn count_jobs(&self) -> Result<i64, StoreError>;

    /// Claim up to `limit` enabled jobs with `next_run_at <= now` or null,
    /// nulls first, pushing each claimed job's `next_run_at` forward by
    /// [`CLAIM_HORIZON_SECONDS`] inside the same transaction.
    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError>;

    async fn set_next_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    // ── runs ────────────────────────────────────────────────────────────────

    async fn record_run(&self, run: NewRun) -> Result<Run, StoreError>;

    /// Runs newest first, optionally filtered to one job.
    async fn list_runs(&self, limit: i64, job_id: Option<Uuid>) -> Result<Vec<Run>, StoreError>;

    // ── audit ───────────────────────────────────────────────────────────────

    async fn insert_tool_call(&self, call: NewToolCall) -> Result<(), StoreError>;

    async fn get_tool_calls(&self, query: ToolCallQuery) -> Result<Vec<ToolCallRecord>, StoreError>;

    async fn tool_call_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<CallStats, StoreError>;

    async fn server_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ServerStats>, StoreError>;

    async fn tool_stats(
        &self,
        server: Option<String>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ToolStats>, StoreError>;

    async fn hourly_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<HourlyStats>, StoreError>;

    async fn recent_errors(
        &self,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ToolCallRecord>, StoreError>;

    /// Delete audit rows older than `cutoff`; returns the number removed.
    async fn delete_tool_calls_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

// ─── open_store ──────────────────────────────────────────────────────────────

/// Open the store implied by `url` and initialize its schema.
///
/// `postgres://` / `postgresql://` select the networked engine; everything
/// else is treated as a SQLite location (`sqlite://path`, `sqlite:///path`,
/// or a bare filesystem path).
pub async fn open_store(url: &str) -> Result<Arc<dyn Store>, StoreError> {
    let store: Arc<dyn Store> = if is_postgres_url(url) {
        Arc::new(postgres::PostgresStore::connect(url).await?)
    } else {
        Arc::new(sqlite::SqliteStore::open(&sqlite_path(url))?)
    };
    store.init_schema().await?;
    Ok(store)
}

/// Strip the `sqlite:` URL dressing down to a filesystem path.
fn sqlite_path(url: &str) -> String {
    let trimmed = url.trim();
    for prefix in ["sqlite:///", "sqlite://", "sqlite:"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    trimmed.to_string()
}
