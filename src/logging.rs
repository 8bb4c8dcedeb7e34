//! Tracing subscriber setup for the daemon.
//!
//! Verbosity is controlled by the `RUST_LOG` environment variable (defaults
//! to `info` when unset).  All existing `log::` call sites are forwarded
//! into the tracing pipeline via `LogTracer`.  Output goes to stdout; the
//! service runs in containers where stdout is the log sink.

/// Initialise the tracing subscriber.  Idempotent; later calls are no-ops.
pub fn init() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .ok();

    // Forward all log:: macro call sites into the tracing pipeline.
    tracing_log::LogTracer::init().ok();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cadence starting");
}
