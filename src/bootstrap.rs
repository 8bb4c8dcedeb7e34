//! First-start seeding of health-check jobs.
//!
//! A fresh local install shows activity immediately: when the store is the
//! repo-default SQLite file and holds zero jobs, a small set of per-backend
//! health checks is created with `next_run_at = now`.  Shared or remote
//! stores are never auto-seeded, and `SCHEDULER_BOOTSTRAP_JOBS=false` opts
//! out entirely.  The seeded jobs may fail if their target backends are not
//! running; the recorded runs still exercise the whole loop, which is the
//! point.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::config::SchedulerConfig;
use crate::store::{JobDraft, Store};

/// One health-check job per built-in backend, 60-second cadence.
const DEFAULT_JOBS: &[(&str, &str, &str)] = &[
    ("Docker: health_check", "docker", "health_check"),
    ("Kubernetes: health_check", "kubernetes", "health_check"),
    ("Jenkins: get_server_info", "jenkins", "get_server_info"),
    ("Nexus: nexus_health_check", "nexus", "nexus_health_check"),
];

const DEFAULT_INTERVAL_SECONDS: i64 = 60;

/// Seed the default jobs when (and only when) it is safe to do so.
pub async fn seed_default_jobs(cfg: &SchedulerConfig, store: &Arc<dyn Store>) {
    if !cfg.bootstrap_jobs {
        return;
    }
    if !cfg.is_repo_local_sqlite() {
        return;
    }

    match store.count_jobs().await {
        Ok(0) => {}
        Ok(_) => return,
        Err(e) => {
            // If counting fails, don't block startup.
            log::warn!("bootstrap: could not inspect store, skipping seed: {e}");
            return;
        }
    }

    let now = Utc::now();
    let mut seeded = 0;
    for (label, server, tool) in DEFAULT_JOBS {
        let draft = JobDraft {
            id: None,
            enabled: true,
            label: label.to_string(),
            server: server.to_string(),
            tool: tool.to_string(),
            args: json!({}),
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
        };
        match store.upsert_job(draft).await {
            Ok(job) => {
                // Make the first run happen on the next tick.
                if let Err(e) = store.set_next_run(job.id, now).await {
                    log::warn!("bootstrap: could not schedule '{label}' immediately: {e}");
                }
                seeded += 1;
            }
            Err(e) => log::warn!("bootstrap: could not seed '{label}': {e}"),
        }
    }
    if seeded > 0 {
        log::info!("bootstrap: seeded {seeded} default job(s)");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
