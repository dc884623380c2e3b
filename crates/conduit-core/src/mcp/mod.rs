//! Model Context Protocol (MCP) client plumbing.
//!
//! This module provides the client side of MCP: JSON-RPC message types, a
//! transport trait with stdio, websocket, SSE and streamable-HTTP
//! implementations, and a client that performs the handshake and exposes
//! the server's tools.

pub mod client;
pub mod error;
pub mod messages;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use client::McpClient;
pub use error::{McpError, Result};

/// MCP transport types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Local subprocess speaking newline-delimited JSON-RPC on stdio.
    #[serde(rename = "stdio")]
    Stdio,
    /// Full-duplex websocket.
    #[serde(rename = "websocket")]
    WebSocket,
    /// Server-Sent Events stream plus a POST endpoint.
    #[serde(rename = "sse")]
    Sse,
    /// Streamable HTTP (POST per message, JSON or SSE responses).
    #[serde(rename = "streamable-http")]
    StreamableHttp,
}

impl TransportType {
    /// Parses a transport name as written in tool-server descriptors.
    ///
    /// `http` is accepted as an alias of `streamable-http`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "stdio" => Some(Self::Stdio),
            "websocket" | "ws" => Some(Self::WebSocket),
            "sse" => Some(Self::Sse),
            "streamable-http" | "streamable_http" | "http" => Some(Self::StreamableHttp),
            _ => None,
        }
    }

    /// Canonical name of the transport.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MCP transport trait for different transport implementations.
#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
    /// Connect to the MCP server.
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from the MCP server.
    async fn disconnect(&mut self) -> Result<()>;

    /// Send a message to the server.
    async fn send(&mut self, message: &[u8]) -> Result<()>;

    /// Receive a message from the server.
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// MCP tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tool input schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

/// MCP tool execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolResult {
    /// Tool execution result content.
    pub content: Vec<McpContent>,
    /// Whether the tool reported an error.
    #[serde(default)]
    pub is_error: bool,
}

impl McpToolResult {
    /// Concatenates the textual parts of the result.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                McpContent::Text { text } => Some(text.as_str()),
                McpContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// MCP content item. Only text is rendered back to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    /// Text content.
    Text {
        /// Text content.
        text: String,
    },
    /// Images, audio, embedded resources.
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_parse_aliases() {
        assert_eq!(TransportType::parse("STDIO"), Some(TransportType::Stdio));
        assert_eq!(TransportType::parse("http"), Some(TransportType::StreamableHttp));
        assert_eq!(TransportType::parse("streamable-http"), Some(TransportType::StreamableHttp));
        assert_eq!(TransportType::parse("websocket"), Some(TransportType::WebSocket));
        assert_eq!(TransportType::parse("sse"), Some(TransportType::Sse));
        assert_eq!(TransportType::parse("carrier-pigeon"), None);
    }

    #[test]
    fn test_transport_type_serialization() {
        let json = serde_json::to_string(&TransportType::StreamableHttp).unwrap();
        assert_eq!(json, "\"streamable-http\"");
        let transport: TransportType = serde_json::from_str("\"websocket\"").unwrap();
        assert_eq!(transport, TransportType::WebSocket);
    }

    #[test]
    fn test_mcp_tool_camel_case_schema() {
        let json = r#"{"name":"search","description":"Search","inputSchema":{"type":"object"}}"#;
        let tool: McpTool = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "search");
        assert_eq!(tool.input_schema, Some(serde_json::json!({"type": "object"})));
    }

    #[test]
    fn test_tool_result_text_skips_non_text() {
        let json = r#"{"content":[{"type":"text","text":"a"},{"type":"image","data":"x","mimeType":"image/png"},{"type":"text","text":"b"}],"isError":false}"#;
        let result: McpToolResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.text(), "a\nb");
        assert!(!result.is_error);
    }
}
