//! Opens, retries and owns tool-server connections.
//!
//! [`ConnectionSupervisor::connect`] resolves a descriptor, optionally warms
//! the npx package cache, opens the connection with a fixed retry policy and
//! hands the live handle to a [`ConnectionRegistry`]. The registry is the
//! only owner allowed to close a handle.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::capability::{Capability, CapabilityArguments, CapabilityHandler};
use crate::mcp::{self, McpClient, McpError, McpTool};
use crate::resolver::{self, ConnectionParams};

/// Failure to bring up one tool server.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("server '{server}' failed after {attempts} attempt(s): {source}")]
    ConnectFailed {
        server: String,
        attempts: u32,
        #[source]
        source: McpError,
    },
}

/// Aggregate of every close failure seen during a bulk shutdown.
#[derive(Debug)]
pub struct ShutdownError {
    pub failures: Vec<(String, McpError)>,
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} connection(s) failed to close:", self.failures.len())?;
        for (name, err) in &self.failures {
            write!(f, " [{}: {}]", name, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

/// Retry behaviour for opening a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed sleep between attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2, retry_delay: Duration::from_secs(5) }
    }
}

/// A live connection to one tool back-end.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Server key the connection was opened for.
    fn name(&self) -> &str;

    /// Capabilities the back-end publishes, named by the back-end.
    fn capabilities(&self) -> Vec<Capability>;

    /// Closes the connection.
    async fn close(&self) -> mcp::Result<()>;
}

/// Opens connections. Abstracted so retry and ownership can be tested
/// without real servers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, name: &str, params: &ConnectionParams)
    -> mcp::Result<Arc<dyn ConnectionHandle>>;
}

/// Production connector backed by [`McpClient`].
#[derive(Debug, Default, Clone, Copy)]
pub struct McpConnector;

#[async_trait]
impl Connector for McpConnector {
    async fn open(
        &self,
        name: &str,
        params: &ConnectionParams,
    ) -> mcp::Result<Arc<dyn ConnectionHandle>> {
        let client = Arc::new(McpClient::connect(params).await?);
        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = client.disconnect().await {
                    debug!(server = %name, error = %close_err, "Disconnect after failed listing");
                }
                return Err(e);
            }
        };
        Ok(Arc::new(McpConnection { name: name.to_string(), client, tools }))
    }
}

struct McpConnection {
    name: String,
    client: Arc<McpClient>,
    tools: Vec<McpTool>,
}

#[async_trait]
impl ConnectionHandle for McpConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.tools
            .iter()
            .map(|tool| {
                let schema = tool
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
                Capability::new(
                    tool.name.clone(),
                    tool.description.clone().unwrap_or_default(),
                    schema,
                    Arc::new(RemoteToolHandler {
                        client: Arc::clone(&self.client),
                        tool: tool.name.clone(),
                    }),
                )
            })
            .collect()
    }

    async fn close(&self) -> mcp::Result<()> {
        self.client.disconnect().await
    }
}

/// Forwards a capability call to `tools/call` on the live connection.
struct RemoteToolHandler {
    client: Arc<McpClient>,
    tool: String,
}

#[async_trait]
impl CapabilityHandler for RemoteToolHandler {
    async fn execute(&self, args: &CapabilityArguments) -> crate::error::Result<String> {
        let arguments = match &args.args {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        let result = self.client.call_tool(&self.tool, arguments).await?;
        if result.is_error {
            warn!(tool = %self.tool, "Tool reported an error");
        }
        Ok(result.text())
    }
}

/// Owns every successfully opened connection until bulk shutdown.
#[derive(Default)]
pub struct ConnectionRegistry {
    handles: Mutex<Vec<Arc<dyn ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<dyn ConnectionHandle>) {
        self.lock().push(handle);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every handle and clears the registry.
    ///
    /// All handles are attempted even when some fail; the registry is empty
    /// afterwards either way. Failures come back as one [`ShutdownError`].
    pub async fn shutdown_all(&self) -> Result<(), ShutdownError> {
        let handles = std::mem::take(&mut *self.lock());
        info!(connections = handles.len(), "Shutting down connections");

        let mut failures = Vec::new();
        for handle in handles {
            match handle.close().await {
                Ok(()) => debug!(server = %handle.name(), "Connection closed"),
                Err(e) => {
                    error!(server = %handle.name(), error = %e, "Failed to close connection");
                    failures.push((handle.name().to_string(), e));
                }
            }
        }

        if failures.is_empty() { Ok(()) } else { Err(ShutdownError { failures }) }
    }

    // The guarded Vec stays consistent even if a holder panicked.
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn ConnectionHandle>>> {
        self.handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry").field("connections", &self.len()).finish()
    }
}

/// Connects tool servers with retry and registers the result.
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    registry: Arc<ConnectionRegistry>,
    policy: RetryPolicy,
    warmup: bool,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<ConnectionRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self { connector, registry, policy, warmup: true }
    }

    /// Enables or disables the npx cache warmup step.
    #[must_use]
    pub fn with_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Connects the server described by `descriptor` and returns its
    /// capabilities.
    ///
    /// An unresolvable descriptor is skipped and yields no capabilities.
    /// Exhausting the retry policy is an error.
    pub async fn connect(
        &self,
        name: &str,
        descriptor: &Map<String, Value>,
    ) -> Result<Vec<Capability>, SupervisorError> {
        let Some(params) = resolver::resolve(descriptor) else {
            warn!(server = %name, "Cannot build connection parameters, skipping");
            return Ok(Vec::new());
        };

        if self.warmup {
            warmup(name, descriptor, &params).await;
        }

        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        let handle = loop {
            info!(server = %name, transport = %params.transport(), attempt, attempts, "Connecting");
            match self.connector.open(name, &params).await {
                Ok(handle) => break handle,
                Err(e) if attempt < attempts => {
                    warn!(server = %name, attempt, error = %e, "Connection attempt failed");
                    tokio::time::sleep(self.policy.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(server = %name, attempts, error = %e, "All connection attempts failed");
                    return Err(SupervisorError::ConnectFailed {
                        server: name.to_string(),
                        attempts,
                        source: e,
                    });
                }
            }
        };

        let capabilities = handle.capabilities();
        info!(
            server = %name,
            tools = ?capabilities.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Connected"
        );
        self.registry.register(handle);
        Ok(capabilities)
    }
}

const WARMUP_FAST: Duration = Duration::from_secs(10);
const WARMUP_SLOW: Duration = Duration::from_secs(60);

/// Pre-fetches an `npx -y <pkg>` package so the real start is fast.
///
/// Only applies to descriptors whose command is literally `npx` with `-y`
/// as the first argument. Every failure is ignored.
async fn warmup(name: &str, descriptor: &Map<String, Value>, params: &ConnectionParams) {
    let ConnectionParams::Stdio { command, env, .. } = params else {
        return;
    };
    if descriptor.get("command").and_then(Value::as_str) != Some("npx") {
        return;
    }
    let args: Vec<&str> = descriptor
        .get("args")
        .and_then(Value::as_array)
        .map(|args| args.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let (Some(&"-y"), Some(&package)) = (args.first(), args.get(1)) else {
        debug!(server = %name, "Warmup skipped: no -y flag");
        return;
    };

    for limit in [WARMUP_FAST, WARMUP_SLOW] {
        let run = Command::new(command)
            .args(["-y", package, "--help"])
            .env_clear()
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(limit, run).await {
            Ok(Ok(_)) => {
                info!(server = %name, package = %package, "Package cache warmed");
                return;
            }
            Ok(Err(e)) => debug!(server = %name, error = %e, "Warmup failed"),
            Err(_) => debug!(server = %name, limit = limit.as_secs(), "Warmup timed out"),
        }
    }
}
