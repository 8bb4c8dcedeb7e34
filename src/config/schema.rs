//! Runtime configuration types for the scheduler service.
//!
//! Everything here is resolved once at startup from environment variables
//! (see [`super::loader`]) and then passed around as plain values.  There is
//! no config file: the service is deployed as a container and configured the
//! twelve-factor way.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── Transport ───────────────────────────────────────────────────────────────

/// How the dispatcher reaches a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Streamable HTTP: JSON-RPC POSTs to `<base>/mcp`, replies may be SSE.
    #[default]
    Http,
    /// Child process speaking newline-delimited JSON-RPC on stdin/stdout.
    Stdio,
}

impl Transport {
    /// Parse a transport string from the environment.
    ///
    /// `"sse"` is a legacy synonym for HTTP; anything unrecognised falls back
    /// to HTTP so a typo never silently selects a subprocess launch.
    pub fn parse(raw: &str) -> Transport {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stdio" => Transport::Stdio,
            "http" | "sse" | "streamable-http" | "" => Transport::Http,
            other => {
                log::warn!("unknown transport '{other}', falling back to http");
                Transport::Http
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Stdio => "stdio",
        }
    }
}

// ─── BackendSpec ─────────────────────────────────────────────────────────────

/// A configured backend the scheduler can dispatch tool calls to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Backend identifier, referenced by `Job::server`.
    pub name: String,
    pub transport: Transport,
    /// Base URL for the HTTP transport (the `/mcp` suffix is appended by the
    /// dispatcher when missing).
    pub url: Option<String>,
    /// Command to launch for the stdio transport.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Extra environment variables injected into the child process.
    pub env: HashMap<String, String>,
    /// Shared secret injected as `_client_token` into every `tools/call`.
    /// Never persisted; the audit log redacts it before it can be stored.
    pub client_token: Option<String>,
}

impl BackendSpec {
    /// A plain HTTP backend with no token.
    pub fn http(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: Transport::Http,
            url: Some(url.to_string()),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            client_token: None,
        }
    }
}

// ─── SchedulerConfig ─────────────────────────────────────────────────────────

/// Tick-loop and control-plane settings.
///
/// DB selection:
/// - `PLATFORM_DATABASE_URL`: shared DB URL (preferred)
/// - `SCHEDULER_DATABASE_URL`: scheduler-specific DB URL
/// - neither set: local SQLite at `data/scheduler.db`
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub database_url: String,
    /// How often the loop checks for due jobs, in seconds (floor 1).
    pub tick_seconds: u64,
    /// Cap on due jobs executed per tick (floor 1); the rest roll over.
    pub max_jobs_per_tick: i64,
    pub mcp_transport: Transport,
    pub mcp_host: String,
    pub mcp_port: u16,
    /// When set, every control-plane `tools/call` must carry a matching
    /// `_client_token` argument.
    pub client_token: Option<String>,
    /// Seed health-check jobs into an empty repo-local SQLite store.
    pub bootstrap_jobs: bool,
}

impl SchedulerConfig {
    /// The engine implied by the database URL, for health reporting.
    pub fn db_kind(&self) -> &'static str {
        if is_postgres_url(&self.database_url) {
            "postgres"
        } else {
            "sqlite"
        }
    }

    /// True when the store is the repo-default local SQLite file.  Bootstrap
    /// seeding only ever targets this store, never a shared database.
    pub fn is_repo_local_sqlite(&self) -> bool {
        let url = self.database_url.replace('\\', "/");
        url.starts_with("sqlite:") && url.ends_with("data/scheduler.db")
    }

    /// Loopback address of the service's own control plane, used to register
    /// the `scheduler` backend.
    pub fn self_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.mcp_port)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_url: super::loader::DEFAULT_DATABASE_URL.to_string(),
            tick_seconds: 5,
            max_jobs_per_tick: 20,
            mcp_transport: Transport::Http,
            mcp_host: "0.0.0.0".to_string(),
            mcp_port: 8010,
            client_token: None,
            bootstrap_jobs: true,
        }
    }
}

/// URL-scheme check shared with the store opener.
pub fn is_postgres_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    lower.starts_with("postgres://") || lower.starts_with("postgresql://")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_parses_sse_as_http() {
        assert_eq!(Transport::parse("sse"), Transport::Http);
        assert_eq!(Transport::parse("SSE"), Transport::Http);
        assert_eq!(Transport::parse("streamable-http"), Transport::Http);
    }

    #[test]
    fn transport_parses_stdio() {
        assert_eq!(Transport::parse("stdio"), Transport::Stdio);
        assert_eq!(Transport::parse("  STDIO "), Transport::Stdio);
    }

    #[test]
    fn transport_unknown_falls_back_to_http() {
        assert_eq!(Transport::parse("carrier-pigeon"), Transport::Http);
    }

    #[test]
    fn db_kind_from_url_scheme() {
        let mut cfg = SchedulerConfig::default();
        assert_eq!(cfg.db_kind(), "sqlite");

        cfg.database_url = "postgres://user:pw@db:5432/platform".to_string();
        assert_eq!(cfg.db_kind(), "postgres");

        cfg.database_url = "postgresql://db/platform".to_string();
        assert_eq!(cfg.db_kind(), "postgres");
    }

    #[test]
    fn repo_local_sqlite_detection() {
        let mut cfg = SchedulerConfig::default();
        assert!(cfg.is_repo_local_sqlite(), "default URL is the local store");

        cfg.database_url = "sqlite:///var/lib/other.db".to_string();
        assert!(!cfg.is_repo_local_sqlite());

        cfg.database_url = "postgres://db/platform".to_string();
        assert!(!cfg.is_repo_local_sqlite());
    }
}
