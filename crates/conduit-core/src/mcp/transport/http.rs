//! Streamable HTTP transport for MCP servers.
//!
//! Every client message is a POST to the server URL. The server answers
//! with either a single JSON body or an SSE stream of messages; both are
//! queued for `receive`.

use std::collections::{BTreeMap, VecDeque};
use std::pin::pin;

use eventsource_stream::Eventsource;
use futures::{StreamExt, stream};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use tracing::debug;

use crate::mcp::transport::{header_map, is_rpc_message};
use crate::mcp::{McpError, McpTransport, Result};

const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport implementation for MCP servers.
pub struct HttpTransport {
    url: String,
    headers: HeaderMap,
    client: reqwest::Client,
    session_id: Option<String>,
    pending: VecDeque<Vec<u8>>,
    connected: bool,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(url: String, headers: &BTreeMap<String, String>) -> Self {
        Self {
            url,
            headers: header_map(headers),
            client: reqwest::Client::new(),
            session_id: None,
            pending: VecDeque::new(),
            connected: false,
        }
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

#[async_trait::async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Err(McpError::Connection("Already connected".to_string()));
        }
        reqwest::Url::parse(&self.url)
            .map_err(|e| McpError::Connection(format!("Invalid url '{}': {}", self.url, e)))?;
        // The session starts with the first POST (initialize).
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        if let Some(session) = self.session_id.take() {
            let result = self
                .client
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                debug!(url = %self.url, error = %e, "Session termination failed");
            }
        }
        self.pending.clear();
        self.connected = false;
        Ok(())
    }

    async fn send(&mut self, message: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(McpError::Connection("Not connected".to_string()));
        }

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header("Accept", "application/json, text/event-stream");
        if let Some(session) = &self.session_id {
            request = request.header(SESSION_HEADER, session.as_str());
        }

        let response = request.body(message.to_vec()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!("Failed to send message: {}", status)));
        }

        if let Some(session) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            self.session_id = Some(session.to_string());
        }
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        if is_stream {
            // A trailing blank line flushes an unterminated final event.
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .chain(stream::once(async { Ok(b"\n\n".to_vec()) }));
            let mut events = pin!(body.eventsource());
            while let Some(event) = events.next().await {
                let event =
                    event.map_err(|e| McpError::Transport(format!("Invalid event stream: {}", e)))?;
                if is_rpc_message(&event) {
                    self.pending.push_back(event.data.into_bytes());
                }
            }
        } else {
            let body = response.bytes().await?;
            if !body.iter().all(u8::is_ascii_whitespace) {
                self.pending.push_back(body.to_vec());
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(McpError::Connection("Not connected".to_string()));
        }
        self.pending
            .pop_front()
            .ok_or_else(|| McpError::Protocol("No pending response from HTTP server".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::testing::{serve_event_stream_in_chunks, split_at_bytes};

    #[tokio::test]
    async fn test_json_response_is_queued_and_session_kept() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/mcp")
            .match_header("accept", "application/json, text/event-stream")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("mcp-session-id", "s-1")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .expect(1)
            .create_async()
            .await;

        let mut transport = HttpTransport::new(format!("{}/mcp", server.url()), &BTreeMap::new());
        transport.connect().await.unwrap();
        transport.send(br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#).await.unwrap();
        first.assert_async().await;
        assert_eq!(transport.session_id(), Some("s-1"));

        let reply: serde_json::Value =
            serde_json::from_slice(&transport.receive().await.unwrap()).unwrap();
        assert_eq!(reply["id"], 1);
        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_event_stream_response_is_split_into_messages() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                 data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[]}}",
            )
            .create_async()
            .await;

        let mut transport = HttpTransport::new(format!("{}/mcp", server.url()), &BTreeMap::new());
        transport.connect().await.unwrap();
        transport.send(br#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#).await.unwrap();

        let first: serde_json::Value =
            serde_json::from_slice(&transport.receive().await.unwrap()).unwrap();
        let second: serde_json::Value =
            serde_json::from_slice(&transport.receive().await.unwrap()).unwrap();
        assert_eq!(first["method"], "notifications/progress");
        assert_eq!(second["id"], 2);
    }

    #[tokio::test]
    async fn test_event_stream_response_reassembled_across_reads() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\n\
                    data: \"result\":{\"content\":[{\"type\":\"text\",\"text\":\"사용자 승인\"}]}}\n\n";
        let line_split = "event: mess".len();
        let data_split = body.find("\"result").unwrap();
        let char_split = body.find('승').unwrap() + 2;
        let url = serve_event_stream_in_chunks(split_at_bytes(body, &[line_split, data_split, char_split]))
            .await;

        let mut transport = HttpTransport::new(format!("{url}/mcp"), &BTreeMap::new());
        transport.connect().await.unwrap();
        transport.send(br#"{"jsonrpc":"2.0","id":3,"method":"tools/call"}"#).await.unwrap();

        let reply: serde_json::Value =
            serde_json::from_slice(&transport.receive().await.unwrap()).unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["result"]["content"][0]["text"], "사용자 승인");
        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_accepted_notification_queues_nothing() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/mcp").with_status(202).create_async().await;

        let mut transport = HttpTransport::new(format!("{}/mcp", server.url()), &BTreeMap::new());
        transport.connect().await.unwrap();
        transport.send(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await.unwrap();
        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_error_status_and_custom_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .match_header("authorization", "Bearer abc")
            .with_status(500)
            .create_async()
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        let mut transport = HttpTransport::new(format!("{}/mcp", server.url()), &headers);
        transport.connect().await.unwrap();
        let err = transport.send(b"{}").await.unwrap_err();
        mock.assert_async().await;
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_on_connect() {
        let mut transport = HttpTransport::new("not a url".to_string(), &BTreeMap::new());
        assert!(matches!(transport.connect().await, Err(McpError::Connection(_))));
    }
}
