//! MCP client implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::mcp::messages::{
    ClientInfo, InitializeParams, InitializeResult, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION, is_response_to,
};
use crate::mcp::transport::{HttpTransport, SseTransport, StdioTransport, WebSocketTransport};
use crate::mcp::{McpError, McpTool, McpToolResult, McpTransport, Result};
use crate::resolver::ConnectionParams;

/// MCP client for communicating with one MCP server.
///
/// Requests are serialized through the transport lock, so a client can be
/// shared behind an `Arc` by every capability it publishes.
pub struct McpClient {
    transport: Mutex<Box<dyn McpTransport>>,
    server_name: Option<String>,
    request_id: AtomicU64,
    timeout: Duration,
}

impl McpClient {
    /// Opens the transport described by `params` and performs the handshake.
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        let timeout = params.timeout();
        let transport: Box<dyn McpTransport> = match params {
            ConnectionParams::Stdio { command, args, env, .. } => {
                Box::new(StdioTransport::new(command.clone(), args.clone(), env.clone()))
            }
            ConnectionParams::WebSocket { url, headers, .. } => {
                Box::new(WebSocketTransport::new(url.clone(), headers.clone()))
            }
            ConnectionParams::Sse { url, headers, .. } => {
                Box::new(SseTransport::new(url.clone(), headers, timeout))
            }
            ConnectionParams::StreamableHttp { url, headers, .. } => {
                Box::new(HttpTransport::new(url.clone(), headers))
            }
        };
        Self::with_transport(transport, timeout).await
    }

    /// Connects an already constructed transport and performs the handshake.
    pub async fn with_transport(
        mut transport: Box<dyn McpTransport>,
        timeout: Duration,
    ) -> Result<Self> {
        with_deadline(timeout, transport.connect()).await?;

        let mut client = Self {
            transport: Mutex::new(transport),
            server_name: None,
            request_id: AtomicU64::new(0),
            timeout,
        };

        let init = client.initialize().await?;
        client.server_name = init.server_info.map(|info| info.name);
        info!(
            server = client.server_name.as_deref().unwrap_or("unknown"),
            protocol = %init.protocol_version,
            "MCP session initialized"
        );
        Ok(client)
    }

    async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ClientInfo {
                name: "conduit".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self.send_request("initialize", Some(serde_json::to_value(params)?)).await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        let initialized = JsonRpcRequest::notification("notifications/initialized", None);
        let bytes = serde_json::to_vec(&initialized)?;
        with_deadline(self.timeout, async { self.transport.lock().await.send(&bytes).await })
            .await?;
        Ok(init)
    }

    /// Sends a request and waits for the matching response.
    ///
    /// Notifications and server-initiated requests arriving in between are
    /// skipped.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = JsonRpcRequest::new(id, method, params);
        let bytes = serde_json::to_vec(&request)?;

        let response = with_deadline(self.timeout, async {
            let mut transport = self.transport.lock().await;
            transport.send(&bytes).await?;
            loop {
                let raw = transport.receive().await?;
                let message: Value = serde_json::from_slice(&raw)?;
                if is_response_to(&message, id) {
                    return Ok::<_, McpError>(serde_json::from_value::<JsonRpcResponse>(message)?);
                }
                debug!(method, "Skipping unrelated message while waiting for response");
            }
        })
        .await?;

        if let Some(error) = response.error {
            return Err(McpError::Protocol(format!(
                "{} failed: {} (code: {})",
                method, error.message, error.code
            )));
        }
        response.result.ok_or_else(|| McpError::Protocol(format!("{} response missing result", method)))
    }

    /// Lists every tool the server publishes, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.send_request("tools/list", params).await?;
            if let Some(page) = result.get("tools") {
                tools.extend(serde_json::from_value::<Vec<McpTool>>(page.clone())?);
            }
            cursor = result.get("nextCursor").and_then(Value::as_str).map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(tools)
    }

    /// Invokes a tool on the server.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpToolResult> {
        let result = self
            .send_request("tools/call", Some(json!({ "name": name, "arguments": arguments })))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Name the server reported during the handshake.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Closes the underlying transport.
    pub async fn disconnect(&self) -> Result<()> {
        self.transport.lock().await.disconnect().await
    }
}

async fn with_deadline<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| McpError::Timeout(timeout.as_secs()))?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};

    /// Scripted transport: answers each request from a queue of canned replies.
    pub(crate) struct MockTransport {
        pub connected: bool,
        pub sent: Arc<StdMutex<Vec<Value>>>,
        pub replies: VecDeque<Value>,
        pub fail_connect: bool,
    }

    impl MockTransport {
        pub(crate) fn new(replies: Vec<Value>) -> Self {
            Self {
                connected: false,
                sent: Arc::new(StdMutex::new(Vec::new())),
                replies: replies.into(),
                fail_connect: false,
            }
        }

        pub(crate) fn handshake() -> Value {
            json!({"jsonrpc": "2.0", "id": 1, "result": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock-server", "version": "1.0"}
            }})
        }
    }

    #[async_trait::async_trait]
    impl McpTransport for MockTransport {
        async fn connect(&mut self) -> Result<()> {
            if self.fail_connect {
                return Err(McpError::Connection("refused".to_string()));
            }
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }

        async fn send(&mut self, message: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(serde_json::from_slice(message)?);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Vec<u8>> {
            match self.replies.pop_front() {
                Some(reply) => Ok(serde_json::to_vec(&reply)?),
                None => std::future::pending().await,
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[tokio::test]
    async fn test_handshake_sends_initialize_then_initialized() {
        let transport = MockTransport::new(vec![MockTransport::handshake()]);
        let sent = transport.sent.clone();
        let client = McpClient::with_transport(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(client.server_name(), Some("mock-server"));
        let sent = sent.lock().unwrap();
        assert_eq!(sent[0]["method"], "initialize");
        assert_eq!(sent[0]["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(sent[1]["method"], "notifications/initialized");
        assert!(sent[1].get("id").is_none());
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_and_skips_notifications() {
        let transport = MockTransport::new(vec![
            MockTransport::handshake(),
            json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
            json!({"jsonrpc": "2.0", "id": 2, "result": {
                "tools": [{"name": "search", "inputSchema": {"type": "object"}}],
                "nextCursor": "page-2"
            }}),
            json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": [{"name": "fetch"}]}}),
        ]);
        let sent = transport.sent.clone();
        let client = McpClient::with_transport(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();

        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["search", "fetch"]);
        assert_eq!(sent.lock().unwrap()[3]["params"]["cursor"], "page-2");
    }

    #[tokio::test]
    async fn test_call_tool_error_is_protocol_error() {
        let transport = MockTransport::new(vec![
            MockTransport::handshake(),
            json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32602, "message": "bad args"}}),
        ]);
        let client = McpClient::with_transport(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();

        let err = client.call_tool("search", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Protocol(ref m) if m.contains("bad args")));
    }

    #[tokio::test]
    async fn test_call_tool_returns_text() {
        let transport = MockTransport::new(vec![
            MockTransport::handshake(),
            json!({"jsonrpc": "2.0", "id": 2, "result": {
                "content": [{"type": "text", "text": "42 results"}]
            }}),
        ]);
        let client = McpClient::with_transport(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();
        let result = client.call_tool("search", json!({"q": "rust"})).await.unwrap();
        assert_eq!(result.text(), "42 results");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let transport = MockTransport::new(vec![]);
        let result = McpClient::with_transport(Box::new(transport), Duration::from_secs(40)).await;
        assert!(matches!(result, Err(McpError::Timeout(40))));
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let mut transport = MockTransport::new(vec![]);
        transport.fail_connect = true;
        let result = McpClient::with_transport(Box::new(transport), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(McpError::Connection(_))));
    }
}
