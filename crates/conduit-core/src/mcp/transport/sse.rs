//! Server-Sent Events (SSE) transport for MCP servers.
//!
//! The server keeps a GET stream open and announces, in an `endpoint`
//! event, the URL messages must be POSTed to. Responses arrive as
//! `message` events on the stream.

use std::collections::BTreeMap;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::mcp::transport::{header_map, is_rpc_message};
use crate::mcp::{McpError, McpTransport, Result};

/// SSE transport implementation for MCP servers.
pub struct SseTransport {
    url: String,
    headers: HeaderMap,
    timeout: Duration,
    client: reqwest::Client,
    endpoint: Option<reqwest::Url>,
    inbox: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl SseTransport {
    /// Create a new SSE transport.
    pub fn new(url: String, headers: &BTreeMap<String, String>, timeout: Duration) -> Self {
        Self {
            url,
            headers: header_map(headers),
            timeout,
            client: reqwest::Client::new(),
            endpoint: None,
            inbox: None,
            reader: None,
        }
    }
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(McpError::Connection("Already connected".to_string()));
        }

        let base = reqwest::Url::parse(&self.url)
            .map_err(|e| McpError::Connection(format!("Invalid SSE url '{}': {}", self.url, e)))?;

        let response = self
            .client
            .get(base.clone())
            .headers(self.headers.clone())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(McpError::Transport(format!(
                "SSE endpoint returned error: {}",
                response.status()
            )));
        }

        let (endpoint_tx, mut endpoint_rx) = mpsc::unbounded_channel::<String>();
        let (message_tx, message_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut events = Box::pin(response.bytes_stream().eventsource());

        let reader = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "SSE stream ended");
                        break;
                    }
                };
                if event.event == "endpoint" {
                    let _ = endpoint_tx.send(event.data);
                } else if is_rpc_message(&event) {
                    if message_tx.send(event.data.into_bytes()).is_err() {
                        return;
                    }
                } else {
                    debug!(event = %event.event, "Ignoring SSE event");
                }
            }
        });

        let endpoint = match tokio::time::timeout(self.timeout, endpoint_rx.recv()).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                reader.abort();
                return Err(McpError::Connection(
                    "SSE stream closed before announcing an endpoint".to_string(),
                ));
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::Timeout(self.timeout.as_secs()));
            }
        };

        let endpoint = base
            .join(endpoint.trim())
            .map_err(|e| McpError::Protocol(format!("Invalid endpoint '{}': {}", endpoint, e)))?;
        debug!(endpoint = %endpoint, "SSE endpoint announced");

        self.endpoint = Some(endpoint);
        self.inbox = Some(message_rx);
        self.reader = Some(reader);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.endpoint = None;
        self.inbox = None;
        Ok(())
    }

    async fn send(&mut self, message: &[u8]) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| McpError::Connection("Not connected".to_string()))?;

        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .header("Content-Type", "application/json")
            .body(message.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(McpError::Transport(format!(
                "Failed to send message: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let inbox = self
            .inbox
            .as_mut()
            .ok_or_else(|| McpError::Connection("Not connected".to_string()))?;
        inbox.recv().await.ok_or_else(|| McpError::Connection("SSE stream closed".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }
}
