//! The tick loop: claim due jobs, dispatch them, record runs, re-schedule.
//!
//! One background task drives the loop.  Each tick claims up to
//! `max_jobs_per_tick` due jobs under the store's 30-second best-effort
//! claim, executes them sequentially, records a Run per attempt (success or
//! not), and advances `next_run_at` from *completion* time so a slow tool
//! cannot pile up invocations.  No error terminates the loop.
//!
//! A small [`RuntimeState`] snapshot (started-at, last tick, last summary)
//! is published for `scheduler_health`; the loop is the only writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::clock::{Clock, ShutdownListener};
use crate::dispatch::{Dispatcher, call_timeout, result_error, result_ok};
use crate::store::{Job, NewRun, Store};

/// Floor on the inter-tick sleep, so a busy tick never busy-waits.
const MIN_SLEEP: Duration = Duration::from_millis(200);

/// Caller tag written into audit rows for scheduled invocations.
const SOURCE: &str = "scheduler";

// ─── Runtime state ───────────────────────────────────────────────────────────

/// Outcome counters for one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TickSummary {
    pub executed: i64,
    pub ok: i64,
    pub failed: i64,
    pub jobs_due: i64,
}

/// Loop status published for the health tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub started_at_utc: DateTime<Utc>,
    pub last_tick_at_utc: Option<DateTime<Utc>>,
    pub last_tick_summary: Option<TickSummary>,
}

/// Shared handle over [`RuntimeState`] plus a loop-liveness flag.
///
/// Written only by the tick loop; read by `scheduler_health`.  A plain
/// `RwLock` with short critical sections is enough — readers tolerate
/// slightly stale snapshots.
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<RwLock<RuntimeState>>,
    alive: Arc<AtomicBool>,
}

impl StateHandle {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(RwLock::new(RuntimeState {
                started_at_utc: started_at,
                last_tick_at_utc: None,
                last_tick_summary: None,
            })),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn snapshot(&self) -> RuntimeState {
        self.state
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn thread_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    fn record_tick(&self, at: DateTime<Utc>, summary: TickSummary) {
        if let Ok(mut guard) = self.state.write() {
            guard.last_tick_at_utc = Some(at);
            guard.last_tick_summary = Some(summary);
        }
    }
}

// ─── Outcome interpretation ──────────────────────────────────────────────────

/// Read the Run-able outcome out of a normalized dispatch value.
///
/// `ok` is tri-state: a boolean `ok` field is taken at face value; a shape
/// without one is neither success nor failure.  The error text is carried
/// whenever the value is not a definite success, so failed runs are
/// self-describing.
pub fn interpret(value: &Value) -> (Option<bool>, Option<String>) {
    let ok = result_ok(value);
    let error = if ok == Some(true) { None } else { result_error(value) };
    (ok, error)
}

// ─── TickLoop ────────────────────────────────────────────────────────────────

/// The scheduler's single background worker.
pub struct TickLoop {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    state: StateHandle,
    tick_interval: Duration,
    max_jobs_per_tick: i64,
}

impl TickLoop {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        state: StateHandle,
        tick_seconds: u64,
        max_jobs_per_tick: i64,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            state,
            tick_interval: Duration::from_secs(tick_seconds.max(1)),
            max_jobs_per_tick: max_jobs_per_tick.max(1),
        }
    }

    /// Spawn the loop onto the runtime.  It exits when `shutdown` fires,
    /// finishing the job in flight but starting no new one.
    pub fn spawn(self, shutdown: ShutdownListener) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: ShutdownListener) {
        self.state.set_alive(true);
        log::info!(
            "tick loop started (tick {}s, max {} jobs/tick)",
            self.tick_interval.as_secs(),
            self.max_jobs_per_tick
        );

        while !shutdown.is_triggered() {
            let tick_started = self.clock.now();
            let summary = self.tick(tick_started, &shutdown).await;
            self.state.record_tick(tick_started, summary);

            let elapsed = (self.clock.now() - tick_started)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let sleep = self.tick_interval.saturating_sub(elapsed).max(MIN_SLEEP);
            if !shutdown.sleep(sleep).await {
                break;
            }
        }

        self.state.set_alive(false);
        log::info!("tick loop stopped");
    }

    /// One pass: claim, execute, record.  Never propagates an error.
    async fn tick(&self, now: DateTime<Utc>, shutdown: &ShutdownListener) -> TickSummary {
        let due = match self.store.claim_due_jobs(now, self.max_jobs_per_tick).await {
            Ok(due) => due,
            Err(e) => {
                // Without claimed rows there is nothing to attribute a Run
                // to; surface the outage in the log and try next tick.
                log::warn!("tick: claim_due_jobs failed: {e}");
                return TickSummary::default();
            }
        };

        let mut summary = TickSummary { jobs_due: due.len() as i64, ..TickSummary::default() };

        for job in due {
            if shutdown.is_triggered() {
                break;
            }
            let ok = self.execute_one(&job).await;
            summary.executed += 1;
            // Indeterminate outcomes (no explicit flag) count as neither ok
            // nor failed; the executed counter still reflects them.
            match ok {
                Some(true) => summary.ok += 1,
                Some(false) => summary.failed += 1,
                None => {}
            }
        }
        summary
    }

    /// Execute one claimed job: dispatch, record the Run, re-schedule.
    /// Returns the interpreted `ok` for the tick summary.
    async fn execute_one(&self, job: &Job) -> Option<bool> {
        let run_started = self.clock.now();
        let args = Value::Object(job.args());
        let timeout = call_timeout(job.interval_seconds);

        let result = self
            .dispatcher
            .call_with_timeout(&job.server, &job.tool, args, Some(SOURCE), timeout)
            .await;
        let (ok, error) = interpret(&result);
        let run_finished = self.clock.now();

        if let Err(e) = self
            .store
            .record_run(NewRun {
                job_id: job.id,
                started_at: run_started,
                finished_at: run_finished,
                ok,
                result: Some(result),
                error: error.clone(),
            })
            .await
        {
            log::warn!("tick: record_run for job '{}' failed: {e}", job.label);
        }

        // Anchor the next fire at completion, not claim time, so runs stay
        // "every ~N seconds" even when the tool is slower than the interval.
        let next = self.clock.now() + chrono::Duration::seconds(job.interval_seconds);
        if let Err(e) = self.store.set_next_run(job.id, next).await {
            log::warn!("tick: set_next_run for job '{}' failed: {e}", job.label);
        }

        if ok == Some(false) {
            log::debug!(
                "job '{}' failed: {}",
                job.label,
                error.as_deref().unwrap_or("unknown error")
            );
        }
        ok
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interpret_reads_definite_outcomes() {
        assert_eq!(interpret(&json!({"ok": true, "n": 1})), (Some(true), None));
        assert_eq!(
            interpret(&json!({"ok": false, "error": "boom"})),
            (Some(false), Some("boom".to_string()))
        );
    }

    #[test]
    fn interpret_treats_missing_ok_as_indeterminate() {
        let (ok, error) = interpret(&json!({"text": "raw output"}));
        assert_eq!(ok, None, "no explicit flag → neither success nor failure");
        assert_eq!(error, None);
    }

    #[test]
    fn interpret_keeps_error_text_on_indeterminate_shapes() {
        let (ok, error) = interpret(&json!({"error": "partial failure"}));
        assert_eq!(ok, None);
        assert_eq!(error, Some("partial failure".to_string()));
    }

    #[test]
    fn state_handle_publishes_ticks() {
        let handle = StateHandle::new(Utc::now());
        assert!(!handle.thread_alive());
        assert!(handle.snapshot().last_tick_at_utc.is_none());

        let at = Utc::now();
        handle.record_tick(at, TickSummary { executed: 2, ok: 1, failed: 1, jobs_due: 3 });
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.last_tick_at_utc, Some(at));
        assert_eq!(snapshot.last_tick_summary.map(|s| s.jobs_due), Some(3));
    }
}
