//! Environment variable resolution for scheduler and backend configuration.
//!
//! # Loading order
//! 1. `PLATFORM_DATABASE_URL` / `SCHEDULER_DATABASE_URL` pick the store
//! 2. `SCHEDULER_*` variables shape the tick loop and control plane
//! 3. Per-backend `{NAME}_MCP_*` variables shape the dispatch targets
//!
//! Everything is resolved exactly once at startup; the resulting structs are
//! immutable for the life of the process.

use std::collections::HashMap;
use std::env;

use super::schema::{BackendSpec, SchedulerConfig, Transport};

/// Repo-default embedded store location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/scheduler.db";

/// Backends wired in by default.  Each can be reconfigured or repointed via
/// its `{NAME}_MCP_*` environment variables; the default URLs match the
/// compose-network service names the platform deploys with.
const BUILTIN_BACKENDS: &[(&str, &str)] = &[
    ("docker", "http://docker-mcp:8000"),
    ("kubernetes", "http://kubernetes-mcp:8000"),
    ("jenkins", "http://jenkins-mcp:8000"),
    ("nexus", "http://nexus-mcp:8000"),
    ("git", "http://git-mcp:8000"),
    ("trivy", "http://trivy-mcp:8000"),
    ("playwright", "http://playwright-mcp:8000"),
    ("websearch", "http://websearch-mcp:8000"),
];

// ─── env helpers ─────────────────────────────────────────────────────────────

fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env_str(name) {
        Some(raw) => raw.parse().unwrap_or(default),
        None => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_str(name).map(|v| v.to_ascii_lowercase()) {
        Some(v) if ["1", "true", "yes", "y", "on"].contains(&v.as_str()) => true,
        Some(v) if ["0", "false", "no", "n", "off"].contains(&v.as_str()) => false,
        _ => default,
    }
}

// ─── load_scheduler_config ───────────────────────────────────────────────────

/// Resolve [`SchedulerConfig`] from the environment.
pub fn load_scheduler_config() -> SchedulerConfig {
    let database_url = env_str("PLATFORM_DATABASE_URL")
        .or_else(|| env_str("SCHEDULER_DATABASE_URL"))
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

    SchedulerConfig {
        database_url,
        tick_seconds: env_u64("SCHEDULER_TICK_SECONDS", 5).max(1),
        max_jobs_per_tick: env_u64("SCHEDULER_MAX_JOBS_PER_TICK", 20).max(1) as i64,
        mcp_transport: Transport::parse(
            &env_str("SCHEDULER_MCP_TRANSPORT").unwrap_or_else(|| "http".to_string()),
        ),
        mcp_host: env_str("SCHEDULER_MCP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
        mcp_port: env_u64("SCHEDULER_MCP_PORT", 8010) as u16,
        client_token: env_str("SCHEDULER_MCP_CLIENT_TOKEN"),
        bootstrap_jobs: env_bool("SCHEDULER_BOOTSTRAP_JOBS", true),
    }
}

// ─── builtin_backends ────────────────────────────────────────────────────────

/// Resolve the backend registry from the environment.
///
/// For each built-in backend `X` (uppercased in variable names):
/// - `X_MCP_TRANSPORT` ∈ {stdio, http, sse}, default http
/// - `X_MCP_URL` base URL for http, default compose-network address
/// - `X_MCP_CLIENT_TOKEN` optional shared secret
/// - `X_MCP_COMMAND` / `X_MCP_ARGS` (whitespace-split) for stdio launches
/// - `X_MCP_ENV` comma-separated `KEY=VALUE` pairs for the child environment
///
/// The scheduler itself is registered as backend `scheduler`, pointing at the
/// loopback control plane, so jobs can target the scheduler's own tools.
pub fn builtin_backends(cfg: &SchedulerConfig) -> HashMap<String, BackendSpec> {
    let mut backends = HashMap::new();

    for (name, default_url) in BUILTIN_BACKENDS {
        backends.insert(name.to_string(), backend_from_env(name, default_url));
    }

    let mut own = BackendSpec::http("scheduler", &cfg.self_url());
    own.client_token = cfg.client_token.clone();
    backends.insert("scheduler".to_string(), own);

    backends
}

fn backend_from_env(name: &str, default_url: &str) -> BackendSpec {
    let prefix = name.to_ascii_uppercase();

    let transport = Transport::parse(
        &env_str(&format!("{prefix}_MCP_TRANSPORT")).unwrap_or_default(),
    );
    let url = env_str(&format!("{prefix}_MCP_URL")).unwrap_or_else(|| default_url.to_string());

    BackendSpec {
        name: name.to_string(),
        transport,
        url: Some(url),
        command: env_str(&format!("{prefix}_MCP_COMMAND")),
        args: env_str(&format!("{prefix}_MCP_ARGS"))
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        env: parse_env_pairs(&env_str(&format!("{prefix}_MCP_ENV")).unwrap_or_default()),
        client_token: env_str(&format!("{prefix}_MCP_CLIENT_TOKEN")),
    }
}

/// Parse `KEY=VALUE,KEY2=VALUE2` into a map.  Malformed entries are skipped.
fn parse_env_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unsafe_code)] // env::set_var / remove_var are unsafe in Rust 2024; tests serialize on ENV_LOCK.
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Process environment is shared across test threads; serialize the
    // tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_env_is_empty() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let cfg = load_scheduler_config();
        assert_eq!(cfg.tick_seconds, 5);
        assert_eq!(cfg.max_jobs_per_tick, 20);
        assert_eq!(cfg.mcp_port, 8010);
        assert!(cfg.bootstrap_jobs);
    }

    #[test]
    fn tick_seconds_floor_is_one() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let key = "SCHEDULER_TICK_SECONDS";
        // SAFETY: ENV_LOCK is held; no other test reads this var concurrently.
        unsafe { env::set_var(key, "0") };
        let cfg = load_scheduler_config();
        // SAFETY: same as set_var above.
        unsafe { env::remove_var(key) };
        assert_eq!(cfg.tick_seconds, 1, "tick floor should be 1 second");
    }

    #[test]
    fn database_url_prefers_platform_over_scheduler() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        // SAFETY: ENV_LOCK is held.
        unsafe {
            env::set_var("PLATFORM_DATABASE_URL", "postgres://db/platform");
            env::set_var("SCHEDULER_DATABASE_URL", "sqlite://other.db");
        }
        let cfg = load_scheduler_config();
        // SAFETY: same as set_var above.
        unsafe {
            env::remove_var("PLATFORM_DATABASE_URL");
            env::remove_var("SCHEDULER_DATABASE_URL");
        }
        assert_eq!(cfg.database_url, "postgres://db/platform");
    }

    #[test]
    fn builtin_backends_include_scheduler_itself() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let cfg = SchedulerConfig::default();
        let backends = builtin_backends(&cfg);
        let own = backends.get("scheduler").expect("scheduler backend registered");
        assert_eq!(own.transport, Transport::Http);
        assert_eq!(own.url.as_deref(), Some("http://127.0.0.1:8010"));
        assert!(backends.contains_key("docker"));
        assert!(backends.contains_key("jenkins"));
    }

    #[test]
    fn backend_env_overrides_url_and_token() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        // SAFETY: ENV_LOCK is held.
        unsafe {
            env::set_var("NEXUS_MCP_URL", "http://10.0.0.9:9100");
            env::set_var("NEXUS_MCP_CLIENT_TOKEN", "s3cret");
        }
        let backends = builtin_backends(&SchedulerConfig::default());
        // SAFETY: same as set_var above.
        unsafe {
            env::remove_var("NEXUS_MCP_URL");
            env::remove_var("NEXUS_MCP_CLIENT_TOKEN");
        }
        let nexus = backends.get("nexus").expect("nexus backend");
        assert_eq!(nexus.url.as_deref(), Some("http://10.0.0.9:9100"));
        assert_eq!(nexus.client_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn env_pairs_parse_and_skip_malformed() {
        let pairs = parse_env_pairs("A=1, B = two ,broken,=nope");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs.get("A").map(String::as_str), Some("1"));
        assert_eq!(pairs.get("B").map(String::as_str), Some("two"));
    }
}
