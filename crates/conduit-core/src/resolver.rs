//! Maps a declarative tool-server descriptor to connection parameters.
//!
//! A descriptor is one entry of the `mcpServers` document:
//!
//! ```json
//! { "command": "npx", "args": ["-y", "@acme/mcp"], "env": { "TOKEN": "..." } }
//! { "url": "wss://tools.acme.io/mcp", "headers": { "Authorization": "Bearer ..." } }
//! ```
//!
//! The transport is taken from `transport`, then `type`, then inferred from
//! the URL scheme, and falls back to `stdio`. Resolution never fails loudly:
//! a descriptor that cannot be turned into parameters yields `None` so the
//! caller can skip that server.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::mcp::TransportType;

/// Per-connection timeout when the descriptor names none.
pub const DEFAULT_TIMEOUT_SECS: u64 = 40;

/// Fully resolved parameters for one connection. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum ConnectionParams {
    Stdio {
        command: String,
        args: Vec<String>,
        /// Complete child environment (process env overlaid with `env`).
        #[serde(skip)]
        env: BTreeMap<String, String>,
        timeout_secs: u64,
    },
    #[serde(rename = "websocket")]
    WebSocket { url: String, headers: BTreeMap<String, String>, timeout_secs: u64 },
    Sse { url: String, headers: BTreeMap<String, String>, timeout_secs: u64 },
    StreamableHttp { url: String, headers: BTreeMap<String, String>, timeout_secs: u64 },
}

impl ConnectionParams {
    pub fn transport(&self) -> TransportType {
        match self {
            Self::Stdio { .. } => TransportType::Stdio,
            Self::WebSocket { .. } => TransportType::WebSocket,
            Self::Sse { .. } => TransportType::Sse,
            Self::StreamableHttp { .. } => TransportType::StreamableHttp,
        }
    }

    pub fn timeout(&self) -> Duration {
        let secs = match self {
            Self::Stdio { timeout_secs, .. }
            | Self::WebSocket { timeout_secs, .. }
            | Self::Sse { timeout_secs, .. }
            | Self::StreamableHttp { timeout_secs, .. } => *timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Resolves a descriptor against the current process environment.
pub fn resolve(descriptor: &Map<String, Value>) -> Option<ConnectionParams> {
    resolve_with_env(descriptor, std::env::vars())
}

/// Resolves a descriptor against an explicit base environment.
pub fn resolve_with_env(
    descriptor: &Map<String, Value>,
    base_env: impl IntoIterator<Item = (String, String)>,
) -> Option<ConnectionParams> {
    let name = transport_name(descriptor);
    let Some(transport) = TransportType::parse(&name) else {
        warn!(transport = %name, "Unknown transport");
        return None;
    };
    let timeout_secs = timeout_secs(descriptor.get("timeout"));

    match transport {
        TransportType::Stdio => {
            let Some(command) = descriptor.get("command").map(as_text).filter(|c| !c.is_empty())
            else {
                warn!("stdio descriptor has no command");
                return None;
            };
            let command = if command == "npx" { find_npx().unwrap_or(command) } else { command };
            let args = descriptor
                .get("args")
                .and_then(Value::as_array)
                .map(|args| args.iter().map(as_text).collect())
                .unwrap_or_default();
            let mut env: BTreeMap<String, String> = base_env.into_iter().collect();
            env.extend(text_map(descriptor.get("env")));
            Some(ConnectionParams::Stdio { command, args, env, timeout_secs })
        }
        network => {
            let Some(url) = descriptor.get("url").map(as_text).filter(|u| !u.is_empty()) else {
                warn!(transport = %network, "descriptor has no url");
                return None;
            };
            let headers = text_map(descriptor.get("headers"));
            Some(match network {
                TransportType::WebSocket => ConnectionParams::WebSocket { url, headers, timeout_secs },
                TransportType::Sse => ConnectionParams::Sse { url, headers, timeout_secs },
                _ => ConnectionParams::StreamableHttp { url, headers, timeout_secs },
            })
        }
    }
}

fn transport_name(descriptor: &Map<String, Value>) -> String {
    let explicit = ["transport", "type"]
        .iter()
        .filter_map(|key| descriptor.get(*key))
        .map(as_text)
        .find(|name| !name.is_empty());
    if let Some(name) = explicit {
        return name.to_ascii_lowercase();
    }
    match descriptor.get("url").and_then(Value::as_str) {
        Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => "websocket".into(),
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            "streamable-http".into()
        }
        _ => "stdio".into(),
    }
}

fn timeout_secs(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .unwrap_or(DEFAULT_TIMEOUT_SECS)
}

/// Renders any JSON value as text; strings are taken verbatim.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), as_text(v))).collect())
        .unwrap_or_default()
}

fn find_npx() -> Option<String> {
    which::which("npx")
        .or_else(|_| which::which("npx.cmd"))
        .ok()
        .map(|path| path.to_string_lossy().into_owned())
}
