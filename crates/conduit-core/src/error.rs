//! Error types for Conduit Core.

use thiserror::Error;

use crate::a2a::RemoteAgentError;
use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::events::StorageError;
use crate::human::HumanQueryError;
use crate::knowledge::KnowledgeError;
use crate::mcp::McpError;
use crate::supervisor::{ShutdownError, SupervisorError};

/// Core error type for Conduit operations.
#[derive(Error, Debug)]
pub enum ConduitError {
    /// Missing or unusable configuration/context.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be loaded.
    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    /// Capability input failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Event log errors.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// MCP protocol or transport errors.
    #[error(transparent)]
    Mcp(#[from] McpError),

    /// A tool server could not be connected.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// One or more connections failed to close.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// A bridged task failed to complete.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The human query channel failed.
    #[error(transparent)]
    HumanQuery(#[from] HumanQueryError),

    /// Knowledge backends failed.
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),

    /// A remote agent failed.
    #[error(transparent)]
    RemoteAgent(#[from] RemoteAgentError),
}

/// Result type alias for Conduit operations.
pub type Result<T> = std::result::Result<T, ConduitError>;
