//! `cadenced` — the scheduler daemon.
//!
//! Startup order: logging → config → store (+ schema) → bootstrap seed →
//! audit/dispatcher wiring → tick loop → control-plane HTTP server.
//! Ctrl-C (SIGINT) broadcasts shutdown; the tick loop finishes its job in
//! flight, the server drains, and stdio children are torn down.

use std::sync::Arc;

use cadence::audit::AuditLog;
use cadence::bootstrap::seed_default_jobs;
use cadence::clock::{Clock, Shutdown, SystemClock};
use cadence::config::{builtin_backends, load_scheduler_config};
use cadence::control::{ControlContext, bind, serve_on};
use cadence::dispatch::Dispatcher;
use cadence::runner::{StateHandle, TickLoop};
use cadence::store::open_store;

#[tokio::main]
async fn main() -> Result<(), String> {
    cadence::logging::init();

    let cfg = load_scheduler_config();
    log::info!(
        "config: db={} tick={}s max_jobs_per_tick={} control={}:{}",
        cfg.db_kind(),
        cfg.tick_seconds,
        cfg.max_jobs_per_tick,
        cfg.mcp_host,
        cfg.mcp_port,
    );

    let store = open_store(&cfg.database_url)
        .await
        .map_err(|e| format!("failed to open store: {e}"))?;

    seed_default_jobs(&cfg, &store).await;

    let audit = Arc::new(AuditLog::new(store.clone()));
    let dispatcher = Arc::new(Dispatcher::new(builtin_backends(&cfg), audit.clone()));
    let clock = Arc::new(SystemClock);
    let state = StateHandle::new(clock.now());

    let shutdown = Shutdown::new();

    let loop_handle = TickLoop::new(
        store.clone(),
        dispatcher.clone(),
        clock,
        state.clone(),
        cfg.tick_seconds,
        cfg.max_jobs_per_tick,
    )
    .spawn(shutdown.listener());

    let ctx = Arc::new(ControlContext {
        cfg: cfg.clone(),
        store,
        audit,
        dispatcher: dispatcher.clone(),
        state,
    });
    let listener = bind(&ctx).await?;
    let server = tokio::spawn(serve_on(listener, ctx, shutdown.listener()));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for ctrl-c: {e}"))?;
    log::info!("shutdown requested");
    shutdown.trigger();

    if let Err(e) = loop_handle.await {
        log::warn!("tick loop join error: {e}");
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("control plane exited with error: {e}"),
        Err(e) => log::warn!("control plane join error: {e}"),
    }
    dispatcher.shutdown().await;
    log::info!("cadence stopped");
    Ok(())
}
