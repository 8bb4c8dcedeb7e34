//! SQLite-backed implementation of the [`Store`] trait.
//!
//! A [`rusqlite::Connection`] wrapped in an `Arc<Mutex<…>>` is held
//! internally, making the store `Send + Sync` while keeping SQLite's
//! single-writer requirement.  The tick loop and the control-plane handlers
//! share the one connection; every operation is short, so contention on the
//! mutex stays negligible.
//!
//! Timestamps are stored as RFC 3339 TEXT in UTC with a fixed precision, so
//! lexicographic comparison in SQL matches chronological order.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use super::types::{
    CallStats, HourlyStats, Job, JobDraft, NewRun, NewToolCall, Run, ServerStats, ToolCallQuery,
    ToolCallRecord, ToolStats, success_rate,
};
use super::{CLAIM_HORIZON_SECONDS, Store, StoreError};

// ─── Schema ──────────────────────────────────────────────────────────────────

/// DDL executed on every open.  `IF NOT EXISTS` keeps it idempotent.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scheduler_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    label TEXT NOT NULL,
    server TEXT NOT NULL,
    tool TEXT NOT NULL,
    args_json TEXT NOT NULL DEFAULT '{}',
    interval_seconds INTEGER NOT NULL DEFAULT 60,
    next_run_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_next_run ON scheduler_jobs (enabled, next_run_at);

CREATE TABLE IF NOT EXISTS scheduler_runs (
    id TEXT PRIMARY KEY NOT NULL,
    job_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    ok INTEGER,
    result_json TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_scheduler_runs_job_id ON scheduler_runs (job_id);
CREATE INDEX IF NOT EXISTS idx_scheduler_runs_started_at ON scheduler_runs (started_at);

CREATE TABLE IF NOT EXISTS mcp_tool_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    server_name TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    args_json TEXT NOT NULL DEFAULT '{}',
    success INTEGER NOT NULL,
    result_preview TEXT,
    error_message TEXT,
    error_type TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_ms REAL,
    source TEXT,
    request_id TEXT,
    session_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_mcp_tool_calls_server ON mcp_tool_calls (server_name);
CREATE INDEX IF NOT EXISTS idx_mcp_tool_calls_started_at ON mcp_tool_calls (started_at);
CREATE INDEX IF NOT EXISTS idx_mcp_tool_calls_success ON mcp_tool_calls (success);
"#;

/// Columns added after the first shipped schema.  Applied with
/// `ALTER TABLE … ADD COLUMN`, ignoring "duplicate column" failures, so an
/// older database upgrades in place without data loss.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("scheduler_jobs", "updated_at", "TEXT NOT NULL DEFAULT ''"),
    ("mcp_tool_calls", "source", "TEXT"),
    ("mcp_tool_calls", "request_id", "TEXT"),
    ("mcp_tool_calls", "session_id", "TEXT"),
];

// ─── Timestamp helpers ───────────────────────────────────────────────────────

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_ts)
}

// ─── SqliteStore ─────────────────────────────────────────────────────────────

/// Embedded, thread-safe store over a single SQLite file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and enable WAL.
    ///
    /// The parent directory is created when missing, so the repo-default
    /// `data/scheduler.db` works on a fresh checkout.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Unavailable(format!("create data dir: {e}")))?;
                }
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("sqlite open: {e}")))?;
        // `PRAGMA journal_mode` returns a result row, so query_row rather
        // than execute_batch.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| StoreError::Unavailable(format!("sqlite pragma: {e}")))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("sqlite open: {e}")))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }
}

fn query_err(e: rusqlite::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

const JOB_COLUMNS: &str =
    "id, enabled, label, server, tool, args_json, interval_seconds, next_run_at, created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let next_run_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(Job {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        enabled: row.get::<_, i64>(1)? != 0,
        label: row.get(2)?,
        server: row.get(3)?,
        tool: row.get(4)?,
        args_json: row.get(5)?,
        interval_seconds: row.get(6)?,
        next_run_at: parse_ts_opt(next_run_at),
        created_at: parse_ts(&created_at).unwrap_or_default(),
        updated_at: parse_ts(&updated_at).unwrap_or_default(),
    })
}

const RUN_COLUMNS: &str = "id, job_id, started_at, finished_at, ok, result_json, error";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let started_at: String = row.get(2)?;
    let finished_at: Option<String> = row.get(3)?;
    let ok: Option<i64> = row.get(4)?;
    let result_json: Option<String> = row.get(5)?;
    Ok(Run {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        job_id: Uuid::parse_str(&job_id).unwrap_or_default(),
        started_at: parse_ts(&started_at).unwrap_or_default(),
        finished_at: parse_ts_opt(finished_at),
        ok: ok.map(|v| v != 0),
        result: result_json.as_deref().and_then(|raw| serde_json::from_str(raw).ok()),
        error: row.get(6)?,
    })
}

const CALL_COLUMNS: &str = "id, server_name, tool_name, args_json, success, result_preview, \
     error_message, error_type, started_at, finished_at, duration_ms, source, request_id, session_id";

fn call_from_row(row: &Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    let started_at: String = row.get(8)?;
    let finished_at: Option<String> = row.get(9)?;
    Ok(ToolCallRecord {
        id: row.get(0)?,
        server_name: row.get(1)?,
        tool_name: row.get(2)?,
        args_json: row.get(3)?,
        success: row.get::<_, i64>(4)? != 0,
        result_preview: row.get(5)?,
        error_message: row.get(6)?,
        error_type: row.get(7)?,
        started_at: parse_ts(&started_at).unwrap_or_default(),
        finished_at: parse_ts_opt(finished_at),
        duration_ms: row.get(10)?,
        source: row.get(11)?,
        request_id: row.get(12)?,
        session_id: row.get(13)?,
    })
}

// ─── Audit filter assembly ───────────────────────────────────────────────────

/// Build `WHERE` conditions and TEXT parameters for audit queries.  Boolean
/// and limit values are embedded as validated integers, keeping the bound
/// parameter list homogeneous.
fn call_filters(query: &ToolCallQuery) -> (Vec<String>, Vec<String>) {
    let mut conds = Vec::new();
    let mut args = Vec::new();
    if let Some(server) = &query.server {
        args.push(server.clone());
        conds.push(format!("server_name = ?{}", args.len()));
    }
    if let Some(tool) = &query.tool {
        args.push(tool.clone());
        conds.push(format!("tool_name = ?{}", args.len()));
    }
    if let Some(success) = query.success {
        conds.push(format!("success = {}", i64::from(success)));
    }
    if let Some(since) = query.since {
        args.push(ts(since));
        conds.push(format!("started_at >= ?{}", args.len()));
    }
    if let Some(until) = query.until {
        args.push(ts(until));
        conds.push(format!("started_at <= ?{}", args.len()));
    }
    (conds, args)
}

fn where_clause(conds: &[String]) -> String {
    if conds.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conds.join(" AND "))
    }
}

fn range_query(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> ToolCallQuery {
    ToolCallQuery { since, until, ..Default::default() }
}

// ─── Store impl ──────────────────────────────────────────────────────────────

#[async_trait]
impl Store for SqliteStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL).map_err(query_err)?;
        for (table, column, decl) in ADDITIVE_COLUMNS {
            let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
            if let Err(e) = conn.execute(&sql, []) {
                let msg = e.to_string();
                if !msg.contains("duplicate column") {
                    return Err(StoreError::Query(msg));
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM scheduler_jobs ORDER BY created_at DESC"
            ))
            .map_err(query_err)?;
        let jobs = stmt
            .query_map([], job_from_row)
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        Ok(jobs)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM scheduler_jobs WHERE id = ?1"))
            .map_err(query_err)?;
        let mut rows = stmt
            .query_map(params![id.to_string()], job_from_row)
            .map_err(query_err)?;
        match rows.next() {
            Some(job) => Ok(Some(job.map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn upsert_job(&self, draft: JobDraft) -> Result<Job, StoreError> {
        let draft = draft.normalized()?;
        let now = Utc::now();
        let now_ts = ts(now);

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(query_err)?;

        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let exists: bool = tx
            .query_row(
                "SELECT COUNT(*) FROM scheduler_jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )
            .map_err(query_err)?;

        if exists {
            tx.execute(
                "UPDATE scheduler_jobs
                 SET enabled = ?2, label = ?3, server = ?4, tool = ?5, args_json = ?6,
                     interval_seconds = ?7, updated_at = ?8,
                     next_run_at = COALESCE(next_run_at, ?9)
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    i64::from(draft.enabled),
                    draft.label,
                    draft.server,
                    draft.tool,
                    draft.args_json(),
                    draft.interval_seconds,
                    now_ts,
                    ts(now + Duration::seconds(draft.interval_seconds)),
                ],
            )
            .map_err(query_err)?;
        } else {
            tx.execute(
                "INSERT INTO scheduler_jobs
                 (id, enabled, label, server, tool, args_json, interval_seconds,
                  next_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id.to_string(),
                    i64::from(draft.enabled),
                    draft.label,
                    draft.server,
                    draft.tool,
                    draft.args_json(),
                    draft.interval_seconds,
                    ts(now + Duration::seconds(draft.interval_seconds)),
                    now_ts,
                ],
            )
            .map_err(query_err)?;
        }

        let job = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scheduler_jobs WHERE id = ?1"),
                params![id.to_string()],
                job_from_row,
            )
            .map_err(query_err)?;
        tx.commit().map_err(query_err)?;
        Ok(job)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM scheduler_jobs WHERE id = ?1", params![id.to_string()])
            .map_err(query_err)?;
        Ok(removed > 0)
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM scheduler_jobs", [], |row| row.get(0))
            .map_err(query_err)
    }

    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(query_err)?;

        let jobs = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM scheduler_jobs
                     WHERE enabled = 1 AND (next_run_at IS NULL OR next_run_at <= ?1)
                     ORDER BY (next_run_at IS NOT NULL), next_run_at
                     LIMIT ?2"
                ))
                .map_err(query_err)?;
            stmt.query_map(params![ts(now), limit], job_from_row)
                .map_err(query_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_err)?
        };

        // Best-effort claim: push next_run_at forward so a second scheduler
        // instance is unlikely to select the same jobs.  Not a lock.
        let claim_until = ts(now + Duration::seconds(CLAIM_HORIZON_SECONDS));
        for job in &jobs {
            tx.execute(
                "UPDATE scheduler_jobs SET next_run_at = ?1 WHERE id = ?2",
                params![claim_until, job.id.to_string()],
            )
            .map_err(query_err)?;
        }
        tx.commit().map_err(query_err)?;
        Ok(jobs)
    }

    async fn set_next_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE scheduler_jobs SET next_run_at = ?1 WHERE id = ?2",
            params![ts(at), id.to_string()],
        )
        .map_err(query_err)?;
        Ok(())
    }

    async fn record_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let id = Uuid::new_v4();
        let result_json = run
            .result
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()));
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduler_runs (id, job_id, started_at, finished_at, ok, result_json, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                run.job_id.to_string(),
                ts(run.started_at),
                ts(run.finished_at),
                run.ok.map(i64::from),
                result_json,
                run.error,
            ],
        )
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
        let conn = self.lock()?;
        let runs = match job_id {
            Some(job_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {RUN_COLUMNS} FROM scheduler_runs WHERE job_id = ?1
                         ORDER BY started_at DESC LIMIT ?2"
                    ))
                    .map_err(query_err)?;
                stmt.query_map(params![job_id.to_string(), limit], run_from_row)
                    .map_err(query_err)?
                    .collect::<Result<Vec<_>, _>>()
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {RUN_COLUMNS} FROM scheduler_runs ORDER BY started_at DESC LIMIT ?1"
                    ))
                    .map_err(query_err)?;
                stmt.query_map(params![limit], run_from_row)
                    .map_err(query_err)?
                    .collect::<Result<Vec<_>, _>>()
            }
        }
        .map_err(query_err)?;
        Ok(runs)
    }

    async fn insert_tool_call(&self, call: NewToolCall) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO mcp_tool_calls
             (server_name, tool_name, args_json, success, result_preview, error_message,
              error_type, started_at, finished_at, duration_ms, source, request_id, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                call.server_name,
                call.tool_name,
                call.args_json,
                i64::from(call.success),
                call.result_preview,
                call.error_message,
                call.error_type,
                ts(call.started_at),
                ts(call.finished_at),
                call.duration_ms,
                call.source,
                call.request_id,
                call.session_id,
            ],
        )
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_tool_calls(&self, query: ToolCallQuery) -> Result<Vec<ToolCallRecord>, StoreError> {
        let (conds, args) = call_filters(&query);
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM mcp_tool_calls {} ORDER BY started_at DESC LIMIT {}",
            where_clause(&conds),
            query.limit.max(0),
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let calls = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), call_from_row)
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        Ok(calls)
    }

    async fn tool_call_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<CallStats, StoreError> {
        let (conds, args) = call_filters(&range_query(since, until));
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(success), 0), COALESCE(AVG(duration_ms), 0),
                    COUNT(DISTINCT server_name)
             FROM mcp_tool_calls {}",
            where_clause(&conds),
        );
        let conn = self.lock()?;
        let (total, successful, avg_duration_ms, unique_servers) = conn
            .query_row(&sql, rusqlite::params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(query_err)?;
        Ok(CallStats {
            total,
            successful,
            failed: total - successful,
            success_rate: success_rate(successful, total),
            avg_duration_ms,
            unique_servers,
        })
    }

    async fn server_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ServerStats>, StoreError> {
        let (conds, args) = call_filters(&range_query(since, until));
        let sql = format!(
            "SELECT server_name, COUNT(*), COALESCE(SUM(success), 0),
                    COALESCE(AVG(duration_ms), 0), COALESCE(MAX(duration_ms), 0),
                    COUNT(DISTINCT tool_name)
             FROM mcp_tool_calls {}
             GROUP BY server_name ORDER BY COUNT(*) DESC",
            where_clause(&conds),
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let stats = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let total: i64 = row.get(1)?;
                let successful: i64 = row.get(2)?;
                Ok(ServerStats {
                    server_name: row.get(0)?,
                    total,
                    successful,
                    failed: total - successful,
                    success_rate: success_rate(successful, total),
                    avg_duration_ms: row.get(3)?,
                    max_duration_ms: row.get(4)?,
                    unique_tools: row.get(5)?,
                })
            })
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        Ok(stats)
    }

    async fn tool_stats(
        &self,
        server: Option<String>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ToolStats>, StoreError> {
        let query = ToolCallQuery { server, since, until, ..Default::default() };
        let (conds, args) = call_filters(&query);
        let sql = format!(
            "SELECT server_name, tool_name, COUNT(*), COALESCE(SUM(success), 0),
                    COALESCE(AVG(duration_ms), 0)
             FROM mcp_tool_calls {}
             GROUP BY server_name, tool_name ORDER BY COUNT(*) DESC LIMIT {}",
            where_clause(&conds),
            limit.max(0),
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let stats = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let total: i64 = row.get(2)?;
                let successful: i64 = row.get(3)?;
                Ok(ToolStats {
                    server_name: row.get(0)?,
                    tool_name: row.get(1)?,
                    total,
                    successful,
                    success_rate: success_rate(successful, total),
                    avg_duration_ms: row.get(4)?,
                })
            })
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        Ok(stats)
    }

    async fn hourly_stats(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<HourlyStats>, StoreError> {
        let (conds, args) = call_filters(&range_query(since, until));
        // RFC 3339 TEXT timestamps: the first 13 characters are the UTC hour.
        let sql = format!(
            "SELECT substr(started_at, 1, 13), COUNT(*), COALESCE(SUM(success), 0)
             FROM mcp_tool_calls {}
             GROUP BY substr(started_at, 1, 13) ORDER BY substr(started_at, 1, 13)",
            where_clause(&conds),
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let stats = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let total: i64 = row.get(1)?;
                let successful: i64 = row.get(2)?;
                Ok(HourlyStats {
                    hour: row.get(0)?,
                    total,
                    successful,
                    failed: total - successful,
                })
            })
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        Ok(stats)
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
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM mcp_tool_calls WHERE started_at < ?1", params![ts(cutoff)])
            .map_err(query_err)?;
        Ok(removed as u64)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().expect("in-memory store");
        store.init_schema().await.expect("schema");
        store
    }

    fn draft(label: &str) -> JobDraft {
        JobDraft {
            id: None,
            enabled: true,
            label: label.to_string(),
            server: "docker".to_string(),
            tool: "health_check".to_string(),
            args: json!({}),
            interval_seconds: 60,
        }
    }

    fn call(server: &str, tool: &str, success: bool, started_at: DateTime<Utc>) -> NewToolCall {
        NewToolCall {
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            args_json: "{}".to_string(),
            success,
            result_preview: None,
            error_message: (!success).then(|| "boom".to_string()),
            error_type: None,
            started_at,
            finished_at: started_at + Duration::milliseconds(40),
            duration_ms: 40.0,
            source: Some("test".to_string()),
            request_id: "req".to_string(),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let store = store().await;
        store.init_schema().await.expect("second init should not fail");
    }

    #[tokio::test]
    async fn init_schema_adds_missing_columns() {
        // Simulate a pre-upgrade database that lacks the later audit columns.
        let store = SqliteStore::in_memory().expect("store");
        {
            let conn = store.lock().expect("lock");
            conn.execute_batch(
                "CREATE TABLE mcp_tool_calls (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    server_name TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    args_json TEXT NOT NULL DEFAULT '{}',
                    success INTEGER NOT NULL,
                    result_preview TEXT,
                    error_message TEXT,
                    error_type TEXT,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    duration_ms REAL
                );",
            )
            .expect("old schema");
        }
        store.init_schema().await.expect("migration");
        store
            .insert_tool_call(call("docker", "health_check", true, Utc::now()))
            .await
            .expect("insert with migrated columns");
    }

    #[tokio::test]
    async fn upsert_inserts_and_initializes_next_run() {
        let store = store().await;
        let before = Utc::now();
        let job = store.upsert_job(draft("a")).await.expect("upsert");
        assert!(job.enabled);
        let next = job.next_run_at.expect("next_run_at initialized");
        assert!(next >= before + Duration::seconds(59), "first fire is ~interval away");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_clamps_interval() {
        let store = store().await;
        let created = store.upsert_job(draft("a")).await.expect("insert");

        let updated = store
            .upsert_job(JobDraft {
                id: Some(created.id),
                label: "renamed".to_string(),
                interval_seconds: 1,
                args: json!({"q": "hello"}),
                ..draft("a")
            })
            .await
            .expect("update");

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.label, "renamed");
        assert_eq!(updated.interval_seconds, 5, "interval clamped to floor");
        assert_eq!(updated.created_at, created.created_at, "created_at is stable");
        assert!(updated.updated_at >= created.updated_at);

        let fetched = store.get_job(created.id).await.expect("get").expect("exists");
        assert_eq!(fetched, updated);
    }

    #[tokio::test]
    async fn upsert_preserves_existing_next_run() {
        let store = store().await;
        let created = store.upsert_job(draft("a")).await.expect("insert");
        let original_next = created.next_run_at;

        let updated = store
            .upsert_job(JobDraft { id: Some(created.id), ..draft("a") })
            .await
            .expect("update");
        assert_eq!(updated.next_run_at, original_next, "mutation must not reschedule");
    }

    #[tokio::test]
    async fn list_jobs_newest_first() {
        let store = store().await;
        store.upsert_job(draft("first")).await.expect("insert");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.upsert_job(draft("second")).await.expect("insert");

        let jobs = store.list_jobs().await.expect("list");
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].label, "second", "newest job listed first");
    }

    #[tokio::test]
    async fn delete_job_reports_removal() {
        let store = store().await;
        let job = store.upsert_job(draft("a")).await.expect("insert");
        assert!(store.delete_job(job.id).await.expect("delete"));
        assert!(!store.delete_job(job.id).await.expect("second delete"));
        assert!(store.get_job(job.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn delete_job_preserves_run_history() {
        let store = store().await;
        let job = store.upsert_job(draft("a")).await.expect("insert");
        let now = Utc::now();
        store
            .record_run(NewRun {
                job_id: job.id,
                started_at: now,
                finished_at: now + Duration::seconds(1),
                ok: Some(true),
                result: Some(json!({"ok": true})),
                error: None,
            })
            .await
            .expect("record");

        store.delete_job(job.id).await.expect("delete");
        let runs = store.list_runs(10, Some(job.id)).await.expect("list runs");
        assert_eq!(runs.len(), 1, "run history outlives the job");
    }

    #[tokio::test]
    async fn claim_returns_null_next_run_first_and_advances() {
        let store = store().await;
        let eligible = store.upsert_job(draft("eligible")).await.expect("insert");
        let immediate = store.upsert_job(draft("immediate")).await.expect("insert");

        let now = Utc::now();
        // One job eligible in the past, one eligible-immediately via NULL.
        store.set_next_run(eligible.id, now - Duration::seconds(10)).await.expect("set");
        {
            let conn = store.lock().expect("lock");
            conn.execute(
                "UPDATE scheduler_jobs SET next_run_at = NULL WHERE id = ?1",
                params![immediate.id.to_string()],
            )
            .expect("null next_run");
        }

        let claimed = store.claim_due_jobs(now, 10).await.expect("claim");
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, immediate.id, "null next_run_at sorts first");

        // Claimed jobs are pushed past the horizon and not re-claimed.
        let again = store.claim_due_jobs(now, 10).await.expect("second claim");
        assert!(again.is_empty(), "claim horizon should defer re-selection");

        let job = store.get_job(eligible.id).await.expect("get").expect("exists");
        let next = job.next_run_at.expect("set by claim");
        assert!(next > now, "next_run_at advanced by the claim horizon");
    }

    #[tokio::test]
    async fn claim_skips_disabled_jobs() {
        let store = store().await;
        let job = store
            .upsert_job(JobDraft { enabled: false, ..draft("off") })
            .await
            .expect("insert");
        store.set_next_run(job.id, Utc::now() - Duration::seconds(60)).await.expect("set");

        let claimed = store.claim_due_jobs(Utc::now(), 10).await.expect("claim");
        assert!(claimed.is_empty(), "disabled jobs are never claimed");
    }

    #[tokio::test]
    async fn claim_fairness_under_per_tick_cap() {
        // N = 5 eligible jobs, M = 2 per tick: every job must be claimed
        // within ceil(N / M) = 3 rounds.
        let store = store().await;
        let now = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let job = store.upsert_job(draft(&format!("job-{i}"))).await.expect("insert");
            store.set_next_run(job.id, now - Duration::seconds(60)).await.expect("set");
            ids.push(job.id);
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            for job in store.claim_due_jobs(now, 2).await.expect("claim") {
                seen.insert(job.id);
            }
        }
        assert_eq!(seen.len(), 5, "all jobs fire within ceil(N/M) ticks");
    }

    #[tokio::test]
    async fn runs_are_listed_newest_first_with_limit() {
        let store = store().await;
        let job = store.upsert_job(draft("a")).await.expect("insert");
        let base = Utc::now();
        for i in 0..3 {
            store
                .record_run(NewRun {
                    job_id: job.id,
                    started_at: base + Duration::seconds(i),
                    finished_at: base + Duration::seconds(i) + Duration::milliseconds(100),
                    ok: Some(i % 2 == 0),
                    result: None,
                    error: None,
                })
                .await
                .expect("record");
        }

        let runs = store.list_runs(2, Some(job.id)).await.expect("list");
        assert_eq!(runs.len(), 2);
        assert!(runs[0].started_at > runs[1].started_at, "newest first");
    }

    #[tokio::test]
    async fn run_result_round_trips_as_json() {
        let store = store().await;
        let job = store.upsert_job(draft("a")).await.expect("insert");
        let now = Utc::now();
        store
            .record_run(NewRun {
                job_id: job.id,
                started_at: now,
                finished_at: now,
                ok: None,
                result: Some(json!({"ok": true, "n": 7})),
                error: None,
            })
            .await
            .expect("record");

        let runs = store.list_runs(1, Some(job.id)).await.expect("list");
        assert_eq!(runs[0].ok, None, "tri-state ok survives storage");
        assert_eq!(runs[0].result, Some(json!({"ok": true, "n": 7})));
    }

    #[tokio::test]
    async fn tool_call_queries_filter_and_order() {
        let store = store().await;
        let base = Utc::now() - Duration::minutes(10);
        store.insert_tool_call(call("docker", "health_check", true, base)).await.expect("a");
        store
            .insert_tool_call(call("jenkins", "get_server_info", false, base + Duration::minutes(1)))
            .await
            .expect("b");
        store
            .insert_tool_call(call("docker", "list_containers", true, base + Duration::minutes(2)))
            .await
            .expect("c");

        let docker_only = store
            .get_tool_calls(ToolCallQuery {
                server: Some("docker".to_string()),
                limit: 10,
                ..Default::default()
            })
            .await
            .expect("query");
        assert_eq!(docker_only.len(), 2);
        assert_eq!(docker_only[0].tool_name, "list_containers", "newest first");

        let failures = store
            .get_tool_calls(ToolCallQuery {
                success: Some(false),
                limit: 10,
                ..Default::default()
            })
            .await
            .expect("query");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].server_name, "jenkins");

        let windowed = store
            .get_tool_calls(ToolCallQuery {
                since: Some(base + Duration::seconds(90)),
                limit: 10,
                ..Default::default()
            })
            .await
            .expect("query");
        assert_eq!(windowed.len(), 1);
    }

    #[tokio::test]
    async fn stats_aggregate_counts_and_rates() {
        let store = store().await;
        let base = Utc::now() - Duration::minutes(5);
        store.insert_tool_call(call("docker", "health_check", true, base)).await.expect("a");
        store.insert_tool_call(call("docker", "health_check", false, base)).await.expect("b");
        store.insert_tool_call(call("jenkins", "get_server_info", true, base)).await.expect("c");

        let stats = store.tool_call_stats(None, None).await.expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 66.7);
        assert_eq!(stats.unique_servers, 2);

        let servers = store.server_stats(None, None).await.expect("server stats");
        assert_eq!(servers[0].server_name, "docker", "busiest server first");
        assert_eq!(servers[0].total, 2);
        assert_eq!(servers[0].unique_tools, 1);

        let tools = store.tool_stats(None, None, None, 10).await.expect("tool stats");
        assert_eq!(tools[0].tool_name, "health_check");
        assert_eq!(tools[0].total, 2);

        let hourly = store.hourly_stats(None, None).await.expect("hourly");
        let total: i64 = hourly.iter().map(|h| h.total).sum();
        assert_eq!(total, 3);
        assert_eq!(hourly[0].hour.len(), 13, "hour bucket is YYYY-MM-DDTHH");
    }

    #[tokio::test]
    async fn recent_errors_only_returns_failures() {
        let store = store().await;
        let now = Utc::now();
        store.insert_tool_call(call("docker", "a", true, now)).await.expect("ok call");
        store.insert_tool_call(call("docker", "b", false, now)).await.expect("failed call");

        let errors = store.recent_errors(None, 10).await.expect("errors");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].tool_name, "b");
        assert_eq!(errors[0].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn retention_sweep_deletes_old_rows_only() {
        let store = store().await;
        let now = Utc::now();
        store
            .insert_tool_call(call("docker", "old", true, now - Duration::days(40)))
            .await
            .expect("old");
        store.insert_tool_call(call("docker", "fresh", true, now)).await.expect("fresh");

        let removed = store
            .delete_tool_calls_before(now - Duration::days(30))
            .await
            .expect("sweep");
        assert_eq!(removed, 1);

        let remaining = store
            .get_tool_calls(ToolCallQuery::with_limit(10))
            .await
            .expect("query");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tool_name, "fresh");
    }
}
