//! WebSocket transport for MCP servers.

use std::collections::BTreeMap;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::mcp::transport::header_map;
use crate::mcp::{McpError, McpTransport, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport; each text frame carries one JSON-RPC message.
pub struct WebSocketTransport {
    url: String,
    headers: BTreeMap<String, String>,
    socket: Option<Socket>,
}

impl WebSocketTransport {
    /// Create a new websocket transport.
    pub fn new(url: String, headers: BTreeMap<String, String>) -> Self {
        Self { url, headers, socket: None }
    }
}

#[async_trait::async_trait]
impl McpTransport for WebSocketTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Err(McpError::Connection("Already connected".to_string()));
        }

        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().extend(header_map(&self.headers));
        request.headers_mut().insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mcp"));

        let (socket, response) = connect_async(request).await?;
        debug!(url = %self.url, status = %response.status(), "WebSocket connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!(url = %self.url, error = %e, "WebSocket close failed");
            }
        }
        Ok(())
    }

    async fn send(&mut self, message: &[u8]) -> Result<()> {
        let socket =
            self.socket.as_mut().ok_or_else(|| McpError::Connection("Not connected".to_string()))?;
        let text = String::from_utf8(message.to_vec())
            .map_err(|e| McpError::Protocol(format!("Message is not UTF-8: {}", e)))?;
        socket.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let socket =
            self.socket.as_mut().ok_or_else(|| McpError::Connection("Not connected".to_string()))?;
        while let Some(frame) = socket.next().await {
            match frame? {
                Message::Text(text) => return Ok(text.into_bytes()),
                Message::Binary(bytes) => return Ok(bytes),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        self.socket = None;
        Err(McpError::Connection("Connection closed".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}
