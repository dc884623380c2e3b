//! Stdio transport for MCP servers.

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::mcp::{McpError, McpTransport, Result};

/// Runs an MCP server as a child process speaking newline-delimited JSON.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    /// Complete environment of the child; the parent's is not inherited.
    env: BTreeMap<String, String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
}

impl StdioTransport {
    /// Create a new stdio transport.
    pub fn new(command: String, args: Vec<String>, env: BTreeMap<String, String>) -> Self {
        Self { command, args, env, child: None, stdin: None, stdout: None }
    }
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(McpError::Connection("Already connected".to_string()));
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                McpError::Transport(format!("Failed to spawn '{}': {}", self.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to get stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to get stdout handle".to_string()))?;

        // Server diagnostics go to our log instead of filling the pipe.
        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "server stderr: {}", line);
                }
            });
        }

        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout));
        self.child = Some(child);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stdin = None;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            // The server may already have exited on its own.
            if let Err(e) = child.kill().await {
                debug!(command = %self.command, error = %e, "kill after exit");
            }
        }
        Ok(())
    }

    async fn send(&mut self, message: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| McpError::Connection("Not connected".to_string()))?;

        stdin.write_all(message).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| McpError::Connection("Not connected".to_string()))?;

        loop {
            let mut line = String::new();
            if stdout.read_line(&mut line).await? == 0 {
                return Err(McpError::Connection("Connection closed".to_string()));
            }
            let line = line.trim();
            if !line.is_empty() {
                return Ok(line.as_bytes().to_vec());
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
    }
}
