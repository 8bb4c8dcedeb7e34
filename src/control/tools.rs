//! Control-plane tool handlers.
//!
//! These are the tools the scheduler exposes about itself: job CRUD, health,
//! run listing, backend listing, and audit inspection.  Every handler
//! returns the same normalized `{ok, ...}` object shape the dispatcher
//! produces for remote backends, so callers cannot tell the scheduler apart
//! from any other backend.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::config::{SchedulerConfig, Transport};
use crate::dispatch::{Dispatcher, ToolDef};
use crate::runner::StateHandle;
use crate::store::{JobDraft, Store, StoreError, ToolCallQuery};

// ─── ControlContext ──────────────────────────────────────────────────────────

/// Everything the handlers need, shared with the rest of the service.
pub struct ControlContext {
    pub cfg: SchedulerConfig,
    pub store: Arc<dyn Store>,
    pub audit: Arc<AuditLog>,
    pub dispatcher: Arc<Dispatcher>,
    pub state: StateHandle,
}

// ─── Tool definitions ────────────────────────────────────────────────────────

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({"type": "object", "properties": properties, "required": required})
}

/// The `tools/list` payload for the control plane.
pub fn tool_definitions() -> Vec<ToolDef> {
    let defs = [
        (
            "scheduler_health",
            "Scheduler service health: loop liveness and last tick summary.",
            schema(json!({}), &[]),
        ),
        (
            "scheduler_list_jobs",
            "List all scheduled jobs, newest first.",
            schema(json!({}), &[]),
        ),
        (
            "scheduler_get_job",
            "Fetch one job by id.",
            schema(json!({"job_id": {"type": "string"}}), &["job_id"]),
        ),
        (
            "scheduler_upsert_job",
            "Create a job, or update it in place when job_id is given.",
            schema(
                json!({
                    "job_id": {"type": "string"},
                    "enabled": {"type": "boolean", "default": true},
                    "label": {"type": "string"},
                    "server": {"type": "string"},
                    "tool": {"type": "string"},
                    "args": {"type": "object"},
                    "interval_seconds": {"type": "integer", "minimum": 5, "default": 60},
                }),
                &["label", "server", "tool"],
            ),
        ),
        (
            "scheduler_delete_job",
            "Delete a job.  Historical runs are preserved.",
            schema(json!({"job_id": {"type": "string"}}), &["job_id"]),
        ),
        (
            "scheduler_list_runs",
            "List recent runs, newest first, optionally for one job.",
            schema(
                json!({
                    "limit": {"type": "integer", "default": 50},
                    "job_id": {"type": "string"},
                }),
                &[],
            ),
        ),
        (
            "scheduler_backends",
            "List the configured dispatch backends.",
            schema(json!({}), &[]),
        ),
        (
            "scheduler_tool_log",
            "Query the tool-call audit log, newest first.",
            schema(
                json!({
                    "server": {"type": "string"},
                    "tool": {"type": "string"},
                    "success": {"type": "boolean"},
                    "since_hours": {"type": "number"},
                    "limit": {"type": "integer", "default": 50},
                }),
                &[],
            ),
        ),
        (
            "scheduler_tool_log_stats",
            "Aggregate audit statistics over a time window.",
            schema(json!({"since_hours": {"type": "number"}}), &[]),
        ),
        (
            "scheduler_recent_errors",
            "Recent failed tool calls from the audit log.",
            schema(
                json!({
                    "since_hours": {"type": "number"},
                    "limit": {"type": "integer", "default": 30},
                }),
                &[],
            ),
        ),
        (
            "scheduler_cleanup_logs",
            "Delete audit rows past the retention horizon.",
            schema(json!({}), &[]),
        ),
    ];
    defs.into_iter()
        .map(|(name, description, input_schema)| ToolDef {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        })
        .collect()
}

// ─── Argument helpers ────────────────────────────────────────────────────────

fn arg_str(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn arg_i64(args: &Map<String, Value>, key: &str, default: i64) -> i64 {
    args.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn arg_f64(args: &Map<String, Value>, key: &str) -> Option<f64> {
    args.get(key).and_then(Value::as_f64)
}

fn arg_job_id(args: &Map<String, Value>, key: &str) -> Result<Option<Uuid>, Value> {
    match arg_str(args, key) {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|_| json!({"ok": false, "error": format!("invalid {key}: {raw}")})),
    }
}

fn since_hours(args: &Map<String, Value>) -> Option<chrono::DateTime<Utc>> {
    arg_f64(args, "since_hours")
        .filter(|h| *h > 0.0)
        .map(|h| Utc::now() - Duration::seconds((h * 3600.0) as i64))
}

fn store_failure(e: StoreError) -> Value {
    json!({"ok": false, "error": e.to_string()})
}

// ─── Dispatch to handlers ────────────────────────────────────────────────────

/// Invoke one control tool by name.  Authorization has already happened.
pub async fn call_tool(ctx: &ControlContext, name: &str, args: &Map<String, Value>) -> Value {
    match name {
        "scheduler_health" => health(ctx),
        "scheduler_list_jobs" => list_jobs(ctx).await,
        "scheduler_get_job" => get_job(ctx, args).await,
        "scheduler_upsert_job" => upsert_job(ctx, args).await,
        "scheduler_delete_job" => delete_job(ctx, args).await,
        "scheduler_list_runs" => list_runs(ctx, args).await,
        "scheduler_backends" => backends(ctx),
        "scheduler_tool_log" => tool_log(ctx, args).await,
        "scheduler_tool_log_stats" => tool_log_stats(ctx, args).await,
        "scheduler_recent_errors" => recent_errors(ctx, args).await,
        "scheduler_cleanup_logs" => cleanup_logs(ctx).await,
        other => json!({"ok": false, "error": format!("unknown tool: {other}")}),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn health(ctx: &ControlContext) -> Value {
    let snapshot = ctx.state.snapshot();
    json!({
        "ok": true,
        "service": "scheduler",
        "thread_alive": ctx.state.thread_alive(),
        "tick_seconds": ctx.cfg.tick_seconds,
        "db_kind": ctx.store.kind(),
        "started_at_utc": snapshot.started_at_utc,
        "last_tick_at_utc": snapshot.last_tick_at_utc,
        "last_tick_summary": snapshot.last_tick_summary,
    })
}

async fn list_jobs(ctx: &ControlContext) -> Value {
    match ctx.store.list_jobs().await {
        Ok(jobs) => json!({"ok": true, "jobs": jobs}),
        Err(e) => store_failure(e),
    }
}

async fn get_job(ctx: &ControlContext, args: &Map<String, Value>) -> Value {
    let id = match arg_job_id(args, "job_id") {
        Ok(Some(id)) => id,
        Ok(None) => return json!({"ok": false, "error": "job_id is required"}),
        Err(e) => return e,
    };
    match ctx.store.get_job(id).await {
        Ok(Some(job)) => json!({"ok": true, "job": job}),
        Ok(None) => json!({"ok": false, "error": "not_found"}),
        Err(e) => store_failure(e),
    }
}

async fn upsert_job(ctx: &ControlContext, args: &Map<String, Value>) -> Value {
    let id = match arg_job_id(args, "job_id") {
        Ok(id) => id,
        Err(e) => return e,
    };
    let draft = JobDraft {
        id,
        enabled: arg_bool(args, "enabled", true),
        label: arg_str(args, "label").unwrap_or_default(),
        server: arg_str(args, "server").unwrap_or_default(),
        tool: arg_str(args, "tool").unwrap_or_default(),
        args: args.get("args").cloned().unwrap_or_else(|| json!({})),
        interval_seconds: arg_i64(args, "interval_seconds", 60),
    };
    match ctx.store.upsert_job(draft).await {
        Ok(job) => json!({"ok": true, "job": job}),
        Err(e) => store_failure(e),
    }
}

async fn delete_job(ctx: &ControlContext, args: &Map<String, Value>) -> Value {
    let id = match arg_job_id(args, "job_id") {
        Ok(Some(id)) => id,
        Ok(None) => return json!({"ok": false, "error": "job_id is required"}),
        Err(e) => return e,
    };
    match ctx.store.delete_job(id).await {
        Ok(removed) => json!({"ok": removed}),
        Err(e) => store_failure(e),
    }
}

async fn list_runs(ctx: &ControlContext, args: &Map<String, Value>) -> Value {
    let job_id = match arg_job_id(args, "job_id") {
        Ok(id) => id,
        Err(e) => return e,
    };
    let limit = arg_i64(args, "limit", 50).clamp(1, 500);
    match ctx.store.list_runs(limit, job_id).await {
        Ok(runs) => json!({"ok": true, "runs": runs}),
        Err(e) => store_failure(e),
    }
}

fn backends(ctx: &ControlContext) -> Value {
    let backends: Vec<Value> = ctx
        .dispatcher
        .backend_specs()
        .into_iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "transport": spec.transport.as_str(),
                "url": (spec.transport == Transport::Http).then(|| spec.url.clone()),
                "has_client_token": spec.client_token.is_some(),
            })
        })
        .collect();
    json!({"ok": true, "backends": backends})
}

async fn tool_log(ctx: &ControlContext, args: &Map<String, Value>) -> Value {
    let query = ToolCallQuery {
        server: arg_str(args, "server"),
        tool: arg_str(args, "tool"),
        success: args.get("success").and_then(Value::as_bool),
        since: since_hours(args),
        until: None,
        limit: arg_i64(args, "limit", 50).clamp(1, 500),
    };
    match ctx.audit.get_tool_calls(query).await {
        Ok(calls) => json!({"ok": true, "calls": calls}),
        Err(e) => store_failure(e),
    }
}

async fn tool_log_stats(ctx: &ControlContext, args: &Map<String, Value>) -> Value {
    match ctx.audit.get_tool_call_stats(since_hours(args), None).await {
        Ok(stats) => json!({"ok": true, "stats": stats}),
        Err(e) => store_failure(e),
    }
}

async fn recent_errors(ctx: &ControlContext, args: &Map<String, Value>) -> Value {
    let limit = arg_i64(args, "limit", 30).clamp(1, 500);
    match ctx.audit.get_recent_errors(since_hours(args), limit).await {
        Ok(errors) => json!({"ok": true, "errors": errors}),
        Err(e) => store_failure(e),
    }
}

async fn cleanup_logs(ctx: &ControlContext) -> Value {
    match ctx.audit.cleanup_old_logs().await {
        Ok(deleted) => json!({"ok": true, "deleted": deleted}),
        Err(e) => store_failure(e),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use std::collections::HashMap;

    async fn context() -> ControlContext {
        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        store.init_schema().await.expect("schema");
        let audit = Arc::new(AuditLog::new(store.clone()));
        ControlContext {
            cfg: SchedulerConfig::default(),
            store,
            audit: audit.clone(),
            dispatcher: Arc::new(Dispatcher::new(HashMap::new(), audit)),
            state: StateHandle::new(Utc::now()),
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn health_reports_service_shape() {
        let ctx = context().await;
        let health = call_tool(&ctx, "scheduler_health", &Map::new()).await;
        assert_eq!(health["ok"], true);
        assert_eq!(health["service"], "scheduler");
        assert_eq!(health["thread_alive"], false, "no loop running in this test");
        assert_eq!(health["db_kind"], "sqlite");
        assert_eq!(health["tick_seconds"], 5);
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips_with_clamped_interval() {
        let ctx = context().await;
        let created = call_tool(
            &ctx,
            "scheduler_upsert_job",
            &args(json!({
                "label": "ping",
                "server": "scheduler",
                "tool": "scheduler_health",
                "args": {},
                "interval_seconds": 1,
            })),
        )
        .await;
        assert_eq!(created["ok"], true, "got: {created}");
        assert_eq!(created["job"]["interval_seconds"], 5, "interval clamped to floor");

        let id = created["job"]["id"].as_str().expect("id").to_string();
        let fetched = call_tool(&ctx, "scheduler_get_job", &args(json!({"job_id": id}))).await;
        assert_eq!(fetched["ok"], true);
        assert_eq!(fetched["job"]["label"], "ping");
    }

    #[tokio::test]
    async fn get_job_unknown_id_is_not_found() {
        let ctx = context().await;
        let missing = call_tool(
            &ctx,
            "scheduler_get_job",
            &args(json!({"job_id": Uuid::new_v4().to_string()})),
        )
        .await;
        assert_eq!(missing["ok"], false);
        assert_eq!(missing["error"], "not_found");
    }

    #[tokio::test]
    async fn upsert_rejects_empty_server() {
        let ctx = context().await;
        let result = call_tool(
            &ctx,
            "scheduler_upsert_job",
            &args(json!({"label": "x", "server": "", "tool": "t"})),
        )
        .await;
        assert_eq!(result["ok"], false);
        assert!(result["error"].as_str().unwrap_or_default().contains("server"));
    }

    #[tokio::test]
    async fn delete_job_returns_whether_row_was_removed() {
        let ctx = context().await;
        let created = call_tool(
            &ctx,
            "scheduler_upsert_job",
            &args(json!({"label": "x", "server": "docker", "tool": "health_check"})),
        )
        .await;
        let id = created["job"]["id"].as_str().expect("id").to_string();

        let deleted = call_tool(&ctx, "scheduler_delete_job", &args(json!({"job_id": id}))).await;
        assert_eq!(deleted["ok"], true);

        let again = call_tool(&ctx, "scheduler_delete_job", &args(json!({"job_id": id}))).await;
        assert_eq!(again["ok"], false);
    }

    #[tokio::test]
    async fn invalid_job_id_is_rejected_not_crashed() {
        let ctx = context().await;
        let result =
            call_tool(&ctx, "scheduler_get_job", &args(json!({"job_id": "not-a-uuid"}))).await;
        assert_eq!(result["ok"], false);
        assert!(result["error"].as_str().unwrap_or_default().contains("invalid job_id"));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let ctx = context().await;
        let result = call_tool(&ctx, "scheduler_fly_to_moon", &Map::new()).await;
        assert_eq!(result["ok"], false);
        assert!(result["error"].as_str().unwrap_or_default().contains("unknown tool"));
    }

    #[tokio::test]
    async fn tool_definitions_cover_every_handler() {
        let ctx = context().await;
        for def in tool_definitions() {
            let result = call_tool(&ctx, &def.name, &Map::new()).await;
            assert!(
                result.get("ok").is_some(),
                "tool {} should return a normalized shape, got {result}",
                def.name
            );
        }
    }
}
