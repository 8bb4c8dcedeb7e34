//! Postgres-backed implementation of the [`Store`] trait.
//!
//! Used when `PLATFORM_DATABASE_URL` points at the central Postgres cluster.
//! A `sqlx` pool is shared between the tick loop and the control-plane
//! handlers.  Identifiers are stored as TEXT (not native UUID) so the column
//! layout matches the embedded engine row for row; timestamps use
//! `TIMESTAMPTZ` and all arithmetic is done in UTC.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::types::{
    CallStats, HourlyStats, Job, JobDraft, NewRun, NewToolCall, Run, ServerStats, ToolCallQuery,
    ToolCallRecord, ToolStats, success_rate,
};
use super::{CLAIM_HORIZON_SECONDS, Store, StoreError};

// ─── Schema ──────────────────────────────────────────────────────────────────

const SCHEMA_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS scheduler_jobs (
        id TEXT PRIMARY KEY,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        label TEXT NOT NULL,
        server TEXT NOT NULL,
        tool TEXT NOT NULL,
        args_json TEXT NOT NULL DEFAULT '{}',
        interval_seconds BIGINT NOT NULL DEFAULT 60,
        next_run_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_next_run
        ON scheduler_jobs (enabled, next_run_at)",
    "CREATE TABLE IF NOT EXISTS scheduler_runs (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        ok BOOLEAN,
        result_json TEXT,
        error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_scheduler_runs_job_id ON scheduler_runs (job_id)",
    "CREATE INDEX IF NOT EXISTS idx_scheduler_runs_started_at ON scheduler_runs (started_at)",
    "CREATE TABLE IF NOT EXISTS mcp_tool_calls (
        id BIGSERIAL PRIMARY KEY,
        server_name TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        args_json TEXT NOT NULL DEFAULT '{}',
        success BOOLEAN NOT NULL,
        result_preview TEXT,
        error_message TEXT,
        error_type TEXT,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        duration_ms DOUBLE PRECISION,
        source TEXT,
        request_id TEXT,
        session_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_mcp_tool_calls_server ON mcp_tool_calls (server_name)",
    "CREATE INDEX IF NOT EXISTS idx_mcp_tool_calls_started_at ON mcp_tool_calls (started_at)",
    "CREATE INDEX IF NOT EXISTS idx_mcp_tool_calls_success ON mcp_tool_calls (success)",
];

/// Columns added after the first shipped schema.  Postgres supports
/// `ADD COLUMN IF NOT EXISTS`, which keeps the step naturally additive.
const ADDITIVE_COLUMNS: &[&str] = &[
    "ALTER TABLE scheduler_jobs ADD COLUMN IF NOT EXISTS updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()",
    "ALTER TABLE mcp_tool_calls ADD COLUMN IF NOT EXISTS source TEXT",
    "ALTER TABLE mcp_tool_calls ADD COLUMN IF NOT EXISTS request_id TEXT",
    "ALTER TABLE mcp_tool_calls ADD COLUMN IF NOT EXISTS session_id TEXT",
];

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

const JOB_COLUMNS: &str =
    "id, enabled, label, server, tool, args_json, interval_seconds, next_run_at, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let id: String = row.try_get("id")?;
    Ok(Job {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        enabled: row.try_get("enabled")?,
        label: row.try_get("label")?,
        server: row.try_get("server")?,
        tool: row.try_get("tool")?,
        args_json: row.try_get("args_json")?,
        interval_seconds: row.try_get("interval_seconds")?,
        next_run_at: row.try_get("next_run_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const RUN_COLUMNS: &str = "id, job_id, started_at, finished_at, ok, result_json, error";

fn run_from_row(row: &PgRow) -> Result<Run, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let job_id: String = row.try_get("job_id")?;
    let result_json: Option<String> = row.try_get("result_json")?;
    Ok(Run {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        job_id: Uuid::parse_str(&job_id).unwrap_or_default(),
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        ok: row.try_get("ok")?,
        result: result_json.as_deref().and_then(|raw| serde_json::from_str(raw).ok()),
        error: row.try_get("error")?,
    })
}

const CALL_COLUMNS: &str = "id, server_name, tool_name, args_json, success, result_preview, \
     error_message, error_type, started_at, finished_at, duration_ms, source, request_id, session_id";

fn call_from_row(row: &PgRow) -> Result<ToolCallRecord, sqlx::Error> {
    Ok(ToolCallRecord {
        id: row.try_get("id")?,
        server_name: row.try_get("server_name")?,
        tool_name: row.try_get("tool_name")?,
        args_json: row.try_get("args_json")?,
        success: row.try_get("success")?,
        result_preview: row.try_get("result_preview")?,
        error_message: row.try_get("error_message")?,
        error_type: row.try_get("error_type")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        source: row.try_get("source")?,
        request_id: row.try_get("request_id")?,
        session_id: row.try_get("session_id")?,
    })
}

/// Append audit `WHERE` conditions to a query builder.
fn push_call_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &ToolCallQuery) {
    let mut first = true;
    let mut sep = |builder: &mut QueryBuilder<'_, Postgres>| {
        builder.push(if std::mem::take(&mut first) { " WHERE " } else { " AND " });
    };
    if let Some(server) = &query.server {
        sep(builder);
        builder.push("server_name = ").push_bind(server.clone());
    }
    if let Some(tool) = &query.tool {
        sep(builder);
        builder.push("tool_name = ").push_bind(tool.clone());
    }
    if let Some(success) = query.success {
        sep(builder);
        builder.push("success = ").push_bind(success);
    }
    if let Some(since) = query.since {
        sep(builder);
        builder.push("started_at >= ").push_bind(since);
    }
    if let Some(until) = query.until {
        sep(builder);
        builder.push("started_at <= ").push_bind(until);
    }
}

fn range_query(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> ToolCallQuery {
    ToolCallQuery { since, until, ..Default::default() }
}

// ─── PostgresStore ───────────────────────────────────────────────────────────

/// Networked store over a shared `sqlx` connection pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with a modest pool; the scheduler is a light writer.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("postgres connect: {e}")))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by integration tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        for sql in SCHEMA_SQL {
            sqlx::query(sql).execute(&self.pool).await.map_err(query_err)?;
        }
        for sql in ADDITIVE_COLUMNS {
            sqlx::query(sql).execute(&self.pool).await.map_err(query_err)?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        rows.iter().map(|row| job_from_row(row).map_err(query_err)).collect()
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM scheduler_jobs WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.as_ref().map(|row| job_from_row(row).map_err(query_err)).transpose()
    }

    async fn upsert_job(&self, draft: JobDraft) -> Result<Job, StoreError> {
        let draft = draft.normalized()?;
        let now = Utc::now();
        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let first_run = now + Duration::seconds(draft.interval_seconds);

        // `ON CONFLICT` keeps insert-or-mutate atomic.  `created_at` and an
        // already-scheduled `next_run_at` are preserved on update.
        let row = sqlx::query(&format!(
            "INSERT INTO scheduler_jobs
                 (id, enabled, label, server, tool, args_json, interval_seconds,
                  next_run_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
             ON CONFLICT (id) DO UPDATE SET
                 enabled = EXCLUDED.enabled,
                 label = EXCLUDED.label,
                 server = EXCLUDED.server,
                 tool = EXCLUDED.tool,
                 args_json = EXCLUDED.args_json,
                 interval_seconds = EXCLUDED.interval_seconds,
                 next_run_at = COALESCE(scheduler_jobs.next_run_at, EXCLUDED.next_run_at),
                 updated_at = EXCLUDED.updated_at
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(draft.enabled)
        .bind(&draft.label)
        .bind(&draft.server)
        .bind(&draft.tool)
        .bind(draft.args_json())
        .bind(draft.interval_seconds)
        .bind(first_run)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;
        job_from_row(&row).map_err(query_err)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM scheduler_jobs WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM scheduler_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?;
        row.try_get("n").map_err(query_err)
    }

    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs
             WHERE enabled AND (next_run_at IS NULL OR next_run_at <= $1)
             ORDER BY next_run_at ASC NULLS FIRST
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(query_err)?;

        let jobs: Vec<Job> = rows
            .iter()
            .map(|row| job_from_row(row).map_err(query_err))
            .collect::<Result<_, _>>()?;

        if !jobs.is_empty() {
            let ids: Vec<String> = jobs.iter().map(|j| j.id.to_string()).collect();
            sqlx::query("UPDATE scheduler_jobs SET next_run_at = $1 WHERE id = ANY($2)")
                .bind(now + Duration::seconds(CLAIM_HORIZON_SECONDS))
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(jobs)
    }

    async fn set_next_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduler_jobs SET next_run_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn record_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let id = Uuid::new_v4();
        let result_json = run
            .result
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()));
        sqlx::query(
            "INSERT INTO scheduler_runs (id, job_id, started_at, finished_at, ok, result_json, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id.to_string())
        .bind(run.job_id.to_string())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.ok)
        .bind(result_json)
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(Run {
            id,
            job_id: run.job_id,
            started_at: run.started_at,
            finished_at: Some(run.finished_at),
            ok: run.ok,
            result: run.result,
            error: run.error,
        })
    }

    async fn list_runs(&self, limit: i64, job_id: Option<Uuid>) -> Result<Vec<Run>, StoreError> {
        let rows = match job_id {
            Some(job_id) => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM scheduler_runs WHERE job_id = $1
                     ORDER BY started_at DESC LIMIT $2"
                ))
                .bind(job_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM scheduler_runs ORDER BY started_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(query_err)?;
        rows.iter().map(|row| run_from_row(row).map_err(query_err)).collect()
    }

    async fn insert_tool_call(&self, call: NewToolCall) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mcp_tool_calls
                 (server_name, tool_name, args_json, success, result_preview, error_message,
                  error_type, started_at, finished_at, duration_ms, source, request_id, session_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&call.server_name)
        .bind(&call.tool_name)
        .bind(&call.args_json)
        .bind(call.success)
        .bind(&call.result_preview)
        .bind(&call.error_message)
        .bind(&call.error_type)
        .bind(call.started_at)
        .bind(call.finished_at)
        .bind(call.duration_ms)
        .bind(&call.source)
        .bind(&call.request_id)
        .bind(&call.session_id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_tool_calls(&self, query: ToolCallQuery) -> Result<Vec<ToolCallRecord>, StoreError> {
        let mut builder =
            QueryBuilder::new(format!("SELECT {CALL_COLUMNS} FROM mcp_tool_calls"));
        push_call_filters(&mut builder, &query);
        builder.push(" ORDER BY started_at DESC LIMIT ").push_bind(query.limit.max(0));

        let rows = builder.build().fetch_all(&self.pool).await.map_err(query_err)?;
        rows.iter().map(|row| call_from_row(row).map_err(query_err)).collect()
    }

    async fn tool_call_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<CallStats, StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE success) AS successful,
                    COALESCE(AVG(duration_ms), 0) AS avg_duration_ms,
                    COUNT(DISTINCT server_name) AS unique_servers
             FROM mcp_tool_calls",
        );
        push_call_filters(&mut builder, &range_query(since, until));

        let row = builder.build().fetch_one(&self.pool).await.map_err(query_err)?;
        let total: i64 = row.try_get("total").map_err(query_err)?;
        let successful: i64 = row.try_get("successful").map_err(query_err)?;
        Ok(CallStats {
            total,
            successful,
            failed: total - successful,
            success_rate: success_rate(successful, total),
            avg_duration_ms: row.try_get("avg_duration_ms").map_err(query_err)?,
            unique_servers: row.try_get("unique_servers").map_err(query_err)?,
        })
    }

    async fn server_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ServerStats>, StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT server_name,
                    COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE success) AS successful,
                    COALESCE(AVG(duration_ms), 0) AS avg_duration_ms,
                    COALESCE(MAX(duration_ms), 0) AS max_duration_ms,
                    COUNT(DISTINCT tool_name) AS unique_tools
             FROM mcp_tool_calls",
        );
        push_call_filters(&mut builder, &range_query(since, until));
        builder.push(" GROUP BY server_name ORDER BY COUNT(*) DESC");

        let rows = builder.build().fetch_all(&self.pool).await.map_err(query_err)?;
        rows.iter()
            .map(|row| {
                let total: i64 = row.try_get("total").map_err(query_err)?;
                let successful: i64 = row.try_get("successful").map_err(query_err)?;
                Ok(ServerStats {
                    server_name: row.try_get("server_name").map_err(query_err)?,
                    total,
                    successful,
                    failed: total - successful,
                    success_rate: success_rate(successful, total),
                    avg_duration_ms: row.try_get("avg_duration_ms").map_err(query_err)?,
                    max_duration_ms: row.try_get("max_duration_ms").map_err(query_err)?,
                    unique_tools: row.try_get("unique_tools").map_err(query_err)?,
                })
            })
            .collect()
    }

    async fn tool_stats(
        &self,
        server: Option<String>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ToolStats>, StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT server_name, tool_name,
                    COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE success) AS successful,
                    COALESCE(AVG(duration_ms), 0) AS avg_duration_ms
             FROM mcp_tool_calls",
        );
        push_call_filters(&mut builder, &ToolCallQuery { server, since, until, ..Default::default() });
        builder
            .push(" GROUP BY server_name, tool_name ORDER BY COUNT(*) DESC LIMIT ")
            .push_bind(limit.max(0));

        let rows = builder.build().fetch_all(&self.pool).await.map_err(query_err)?;
        rows.iter()
            .map(|row| {
                let total: i64 = row.try_get("total").map_err(query_err)?;
                let successful: i64 = row.try_get("successful").map_err(query_err)?;
                Ok(ToolStats {
                    server_name: row.try_get("server_name").map_err(query_err)?,
                    tool_name: row.try_get("tool_name").map_err(query_err)?,
                    total,
                    successful,
                    success_rate: success_rate(successful, total),
                    avg_duration_ms: row.try_get("avg_duration_ms").map_err(query_err)?,
                })
            })
            .collect()
    }

    async fn hourly_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<HourlyStats>, StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT to_char(started_at AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24') AS hour,
                    COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE success) AS successful
             FROM mcp_tool_calls",
        );
        push_call_filters(&mut builder, &range_query(since, until));
        builder.push(" GROUP BY 1 ORDER BY 1");

        let rows = builder.build().fetch_all(&self.pool).await.map_err(query_err)?;
        rows.iter()
            .map(|row| {
                let total: i64 = row.try_get("total").map_err(query_err)?;
                let successful: i64 = row.try_get("successful").map_err(query_err)?;
                Ok(HourlyStats {
                    hour: row.try_get("hour").map_err(query_err)?,
                    total,
                    successful,
                    failed: total - successful,
                })
            })
            .collect()
    }

    async fn recent_errors(
        &self,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ToolCallRecord>, StoreError> {
        self.get_tool_calls(ToolCallQuery {
            success: Some(false),
            since,
            limit,
            ..Default::default()
        })
        .await
    }

    async fn delete_tool_calls_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM mcp_tool_calls WHERE started_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
