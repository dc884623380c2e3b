//! MCP transport implementations.

use std::collections::BTreeMap;

use eventsource_stream::Event;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

pub use crate::mcp::McpTransport;
pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Builds a header map from descriptor headers, skipping invalid entries.
pub(crate) fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "Ignoring invalid header"),
        }
    }
    map
}

/// Whether an SSE event carries a JSON-RPC message. Unnamed events count
/// as `message`; events without data are keepalives.
pub(crate) fn is_rpc_message(event: &Event) -> bool {
    matches!(event.event.as_str(), "" | "message") && !event.data.is_empty()
}
