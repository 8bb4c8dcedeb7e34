pub mod loader;
pub mod schema;

pub use loader::{builtin_backends, load_scheduler_config};
pub use schema::{BackendSpec, SchedulerConfig, Transport};
