//! Stdio transport: a supervised child process speaking newline-delimited
//! JSON-RPC on its standard streams.
//!
//! The child outlives a single call and is reused while tools keep being
//! invoked.  On any stream error the owning dispatcher drops the session;
//! the next call relaunches the child transparently.  The child's stderr is
//! inherited so operator-visible diagnostics flow to the service log without
//! any pump thread.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::DispatchError;
use super::protocol::{
    JsonRpcRequest, JsonRpcResponse, ToolDef, initialized_notification, parse_tool_list,
};
use crate::config::BackendSpec;

// ─── StdioSession ────────────────────────────────────────────────────────────

/// A live child process plus its framed streams.
#[derive(Debug)]
pub struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    tools: Option<Vec<ToolDef>>,
    next_id: u64,
}

impl StdioSession {
    /// Launch the configured command with a merged environment.
    ///
    /// The child sees the scheduler's environment, the backend-specific
    /// overrides, and a `PYTHONPATH` with `repo_root` prepended so module
    /// launches resolve regardless of the scheduler's working directory.
    pub async fn spawn(spec: &BackendSpec, repo_root: &Path) -> Result<Self, DispatchError> {
        let command = spec.command.as_deref().ok_or_else(|| {
            DispatchError::Config(format!("backend '{}' has stdio transport but no command", spec.name))
        })?;

        let mut cmd = Command::new(command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        let root = repo_root.to_string_lossy();
        let pythonpath = match spec.env.get("PYTHONPATH").cloned().or_else(|| std::env::var("PYTHONPATH").ok()) {
            Some(existing) if !existing.is_empty() => format!("{root}:{existing}"),
            _ => root.to_string(),
        };
        cmd.env("PYTHONPATH", pythonpath);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| DispatchError::Transport {
            message: format!("failed to launch backend '{}' ({command}): {e}", spec.name),
            details: None,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| DispatchError::Transport {
            message: format!("backend '{}' child has no stdin", spec.name),
            details: None,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| DispatchError::Transport {
            message: format!("backend '{}' child has no stdout", spec.name),
            details: None,
        })?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            tools: None,
            next_id: 1,
        })
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn write_line(&mut self, value: &Value) -> Result<(), DispatchError> {
        let mut line = serde_json::to_string(value).map_err(|e| DispatchError::Protocol {
            message: format!("request serialize error: {e}"),
            details: None,
        })?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DispatchError::Transport {
                message: format!("child write error: {e}"),
                details: None,
            })?;
        self.stdin.flush().await.map_err(|e| DispatchError::Transport {
            message: format!("child flush error: {e}"),
            details: None,
        })
    }

    async fn read_response(&mut self) -> Result<Value, DispatchError> {
        let mut line = String::new();
        let n = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|e| DispatchError::Transport {
                message: format!("child read error: {e}"),
                details: None,
            })?;
        if n == 0 {
            return Err(DispatchError::Transport {
                message: "child closed its stdout".to_string(),
                details: None,
            });
        }
        serde_json::from_str::<JsonRpcResponse>(&line)
            .map_err(|e| DispatchError::Protocol {
                message: format!("malformed JSON-RPC line: {e}"),
                details: Some(line.trim().chars().take(500).collect()),
            })?
            .into_result()
            .map_err(DispatchError::Rpc)
    }

    /// One request/response exchange, bounded by `timeout`.
    async fn rpc(&mut self, req: &JsonRpcRequest, timeout: Duration) -> Result<Value, DispatchError> {
        let exchange = async {
            self.write_line(&serde_json::to_value(req).map_err(|e| DispatchError::Protocol {
                message: format!("request serialize error: {e}"),
                details: None,
            })?)
            .await?;
            self.read_response().await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DispatchError::Timeout(format!("timeout after {}s", timeout.as_secs())))?
    }

    /// Handshake: `initialize`, then the `notifications/initialized` note.
    pub async fn initialize(&mut self, timeout: Duration) -> Result<(), DispatchError> {
        let id = self.next_id();
        self.rpc(&JsonRpcRequest::initialize(id), timeout).await?;
        self.write_line(&initialized_notification()).await
    }

    pub async fn tools(
        &mut self,
        force_refresh: bool,
        timeout: Duration,
    ) -> Result<Vec<ToolDef>, DispatchError> {
        if !force_refresh {
            if let Some(tools) = &self.tools {
                return Ok(tools.clone());
            }
        }
        let id = self.next_id();
        let result = self.rpc(&JsonRpcRequest::tools_list(id), timeout).await?;
        let tools = parse_tool_list(&result);
        self.tools = Some(tools.clone());
        Ok(tools)
    }

    /// Invoke one tool; returns the raw (un-normalized) result payload.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let id = self.next_id();
        self.rpc(&JsonRpcRequest::tools_call(id, name, arguments), timeout).await
    }

    /// Kill the child.  Closing stdin alone would only signal EOF; the kill
    /// guarantees teardown even for a wedged backend.
    pub async fn shutdown(mut self) {
        let _ = self.child.kill().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    use crate::config::Transport;

    fn stdio_spec(command: Option<&str>) -> BackendSpec {
        BackendSpec {
            name: "fixture".to_string(),
            transport: Transport::Stdio,
            url: None,
            command: command.map(str::to_string),
            args: Vec::new(),
            env: HashMap::new(),
            client_token: None,
        }
    }

    #[tokio::test]
    async fn missing_command_is_a_config_error() {
        let err = StdioSession::spawn(&stdio_spec(None), &PathBuf::from("."))
            .await
            .expect_err("no command configured");
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[tokio::test]
    async fn nonexistent_command_is_a_transport_error() {
        let err = StdioSession::spawn(&stdio_spec(Some("cadence-no-such-binary")), &PathBuf::from("."))
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, DispatchError::Transport { .. }));
    }

    #[tokio::test]
    async fn child_eof_surfaces_as_transport_error() {
        // `true` exits immediately, so the first read sees EOF.
        let mut session = StdioSession::spawn(&stdio_spec(Some("true")), &PathBuf::from("."))
            .await
            .expect("spawn /bin/true");
        let err = session
            .initialize(Duration::from_secs(2))
            .await
            .expect_err("EOF expected");
        assert!(matches!(err, DispatchError::Transport { .. }));
    }

    #[tokio::test]
    async fn scripted_child_completes_a_call_round_trip() {
        // A tiny shell MCP server: answers initialize, swallows the
        // notification, then answers tools/list and tools/call.
        let script = r#"
read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"fixture"}}}'
read notif
read line; printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"echo"}]}}'
read line; printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'
"#;
        let mut spec = stdio_spec(Some("sh"));
        spec.args = vec!["-c".to_string(), script.to_string()];

        let mut session = StdioSession::spawn(&spec, &PathBuf::from("."))
            .await
            .expect("spawn scripted child");
        let timeout = Duration::from_secs(5);

        session.initialize(timeout).await.expect("handshake");
        let tools = session.tools(false, timeout).await.expect("tools/list");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = session
            .call_tool("echo", serde_json::json!({}), timeout)
            .await
            .expect("tools/call");
        assert!(result.get("content").is_some(), "raw result is returned unnormalized");

        session.shutdown().await;
    }
}
