//! Remote agents exposed as capabilities.
//!
//! A remote agent publishes a card at `/.well-known/agent.json` and accepts
//! JSON-RPC `message/send` requests carrying a single text part.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::capability::{Capability, CapabilityArguments, CapabilityHandler, CapabilityParameters};
use crate::error::Result;
use crate::human::canonical_json;
use crate::mcp::transport::header_map;

/// Default per-call timeout for remote agents.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const AGENT_CARD_PATH: &str = "/.well-known/agent.json";

#[derive(Debug, Error)]
pub enum RemoteAgentError {
    #[error("remote agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote agent '{agent}' returned error {code}: {message}")]
    Rpc { agent: String, code: i64, message: String },

    #[error("remote agent '{agent}' sent an invalid reply: {reason}")]
    InvalidReply { agent: String, reason: String },
}

/// Where a remote agent lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl AgentEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), headers: BTreeMap::new() }
    }

    fn base(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// Subset of the agent card this crate reads.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentCard {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// RPC endpoint when it differs from the card's host.
    #[serde(default)]
    pub url: Option<String>,
}

/// Capability that forwards a request to a remote agent.
pub struct RemoteAgentCapability {
    client: reqwest::Client,
    name: String,
    rpc_url: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,
}

impl RemoteAgentCapability {
    /// Fetches the agent card and builds the capability named `name`.
    pub async fn create(
        endpoint: &AgentEndpoint,
        name: impl Into<String>,
        timeout: Duration,
    ) -> std::result::Result<Capability, RemoteAgentError> {
        let name = name.into();
        let client = reqwest::Client::new();

        let card: AgentCard = client
            .get(format!("{}{}", endpoint.base(), AGENT_CARD_PATH))
            .headers(header_map(&endpoint.headers))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(agent = %name, card = ?card.name, "Agent card fetched");

        let description = card
            .description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("Delegates the request to the remote agent '{}'.", name));
        let rpc_url = card.url.filter(|u| !u.is_empty()).unwrap_or_else(|| endpoint.url.clone());
        info!(agent = %name, url = %rpc_url, "Remote agent ready");

        let handler = Self { client, name: name.clone(), rpc_url, headers: endpoint.headers.clone(), timeout };
        let schema = CapabilityParameters::new()
            .add_property("query", "string", "Request for the remote agent", true)
            .to_schema();
        Ok(Capability::new(name, description, schema, Arc::new(handler)))
    }

    async fn send(&self, text: &str) -> std::result::Result<String, RemoteAgentError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": "message/send",
            "params": {
                "message": {
                    "role": "user",
                    "messageId": Uuid::new_v4().to_string(),
                    "parts": [{"kind": "text", "text": text}],
                }
            }
        });

        let reply: Value = self
            .client
            .post(&self.rpc_url)
            .headers(header_map(&self.headers))
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = reply.get("error") {
            return Err(RemoteAgentError::Rpc {
                agent: self.name.clone(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error.get("message").and_then(Value::as_str).unwrap_or_default().to_string(),
            });
        }
        let Some(result) = reply.get("result") else {
            return Err(RemoteAgentError::InvalidReply {
                agent: self.name.clone(),
                reason: "missing result".to_string(),
            });
        };

        let texts = reply_texts(result);
        if texts.is_empty() { Ok(canonical_json(result)) } else { Ok(texts.join("\n")) }
    }
}

/// Text parts of a message reply, or of a task's artifacts and status.
fn reply_texts(result: &Value) -> Vec<String> {
    let mut part_lists: Vec<&Value> = Vec::new();
    part_lists.extend(result.get("parts"));
    if let Some(artifacts) = result.get("artifacts").and_then(Value::as_array) {
        part_lists.extend(artifacts.iter().filter_map(|a| a.get("parts")));
    }
    part_lists.extend(result.pointer("/status/message/parts"));

    part_lists
        .into_iter()
        .filter_map(Value::as_array)
        .flatten()
        .filter(|part| {
            let kind = part.get("kind").or_else(|| part.get("type")).and_then(Value::as_str);
            kind.is_none_or(|k| k == "text")
        })
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl CapabilityHandler for RemoteAgentCapability {
    async fn execute(&self, args: &CapabilityArguments) -> Result<String> {
        let query = args.require_string("query")?;
        info!(agent = %self.name, "Calling remote agent");
        Ok(self.send(&query).await?)
    }
}
