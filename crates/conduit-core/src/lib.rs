//! Conduit Core - capability provisioning for autonomous agents.
//!
//! This crate provides:
//! - resolution of tool-server descriptors into MCP connection parameters
//! - supervised MCP connections (stdio, websocket, SSE, streamable HTTP)
//! - built-in knowledge capabilities and remote-agent capabilities
//! - an idempotent "ask a human" channel over a shared event log
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use conduit_core::{ProvisionContext, ProvisionMode, Provisioner, ToolServersConfig};
//!
//! fn main() -> conduit_core::Result<()> {
//!     let servers = ToolServersConfig::from_json_str(
//!         r#"{"mcpServers": {"github": {"command": "npx", "args": ["-y", "@acme/github-mcp"]}}}"#,
//!     )?;
//!     let provisioner = Provisioner::new(servers, ProvisionContext::default())?;
//!     let capabilities =
//!         provisioner.provision(&["github".to_string()], ProvisionMode::Standard, &BTreeMap::new())?;
//!     println!("{} capabilities", capabilities.len());
//!     provisioner.shutdown_all()
//! }
//! ```

pub mod a2a;
pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod human;
pub mod knowledge;
pub mod mcp;
pub mod provisioner;
pub mod recorder;
pub mod resolver;
pub mod supervisor;

pub use a2a::{AgentEndpoint, RemoteAgentCapability, RemoteAgentError};
pub use bridge::{BridgeError, TaskBridge};
pub use capability::{
    Capability, CapabilityArguments, CapabilityHandler, CapabilityParameters, PropertySchema,
};
pub use config::{Config, ConfigError, ToolServersConfig};
pub use error::{ConduitError, Result};
pub use events::{
    EventLog, EventRecord, EventType, NewEvent, Notification, SqliteEventLog, StorageError,
};
pub use human::{
    AskSignature, HumanQuery, HumanQueryContext, HumanQueryError, NO_RESPONSE_REJECTION,
    PollSettings, QueryKind,
};
pub use knowledge::{
    AdvisoryLock, CollectionKey, IndexCatalog, KnowledgeError, Mem0, Memento, MemoryBackend,
    MemoryHit, guarded_create_index,
};
pub use provisioner::{ProvisionContext, ProvisionMode, Provisioner};
pub use recorder::{AgentInfo, EventRecorder, HostEvent};
pub use resolver::{ConnectionParams, resolve};
pub use supervisor::{
    ConnectionHandle, ConnectionRegistry, ConnectionSupervisor, Connector, McpConnector,
    RetryPolicy, ShutdownError, SupervisorError,
};
