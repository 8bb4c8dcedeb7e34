//! Cadence: a persistent job scheduler for MCP tool invocations.
//!
//! Operators register jobs that say "every N seconds, invoke tool T on
//! backend B with arguments A".  The scheduler stores the definitions
//! durably, runs them on a wall-clock tick loop, dispatches each invocation
//! over the right transport (streamable HTTP or a stdio child process),
//! records every run, and audits every tool call with secret redaction.
//!
//! The control plane is itself an MCP backend named `scheduler`, so the
//! whole service is operated through the same protocol it speaks.
//!
//! ```text
//! control RPC ──▶ Store ◀── tick loop ──▶ Dispatcher ──▶ backends
//!                  ▲                          │
//!                  └───────── audit ◀─────────┘
//! ```

pub mod audit;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod logging;
pub mod runner;
pub mod store;

/// Convenience re-exports for the most commonly used types across the
/// Cadence codebase.
///
/// ```rust
/// use cadence::prelude::*;
/// ```
pub mod prelude {
    // Configuration
    pub use crate::config::{BackendSpec, SchedulerConfig, Transport, builtin_backends, load_scheduler_config};

    // Clock / shutdown
    pub use crate::clock::{Clock, Shutdown, ShutdownListener, SystemClock};

    // Store
    pub use crate::store::{Job, JobDraft, Run, Store, StoreError, open_store};

    // Dispatch
    pub use crate::dispatch::{Dispatcher, normalize_tool_result, resolve_tool_name};

    // Audit
    pub use crate::audit::{AuditLog, redact_args};

    // Tick loop
    pub use crate::runner::{RuntimeState, StateHandle, TickLoop, TickSummary};

    // Control plane
    pub use crate::control::{ControlContext, tool_definitions};
}
