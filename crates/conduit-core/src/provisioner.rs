//! Assembles the capability set for one agent.
//!
//! The provisioner is synchronous: remote-agent creation and tool-server
//! connections run on its [`TaskBridge`]. Built-in capabilities load first,
//! then remote agents (in [`ProvisionMode::RemoteAgent`]), then configured
//! tool servers. The final list never holds two capabilities with the same
//! name; the first one loaded wins.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::a2a::{self, AgentEndpoint, RemoteAgentCapability};
use crate::bridge::TaskBridge;
use crate::capability::Capability;
use crate::config::{Config, ToolServersConfig};
use crate::error::Result;
use crate::events::EventLog;
use crate::human::{self, HumanQuery, HumanQueryContext, PollSettings};
use crate::knowledge::{DEFAULT_MEMENTO_URL, Mem0, Memento, MemoryBackend};
use crate::supervisor::{ConnectionRegistry, ConnectionSupervisor, McpConnector, RetryPolicy};

/// Names handled by built-in capabilities rather than tool servers.
const LOCAL_CAPABILITIES: [&str; 3] = ["mem0", "memento", human::CAPABILITY_NAME];

const REMOTE_AGENT_PREFIX: &str = "a2a:";

/// How requested names are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvisionMode {
    #[default]
    Standard,
    /// `a2a:<name>` entries are provisioned as remote agents.
    RemoteAgent,
}

impl ProvisionMode {
    /// `"a2a"` in any case selects [`ProvisionMode::RemoteAgent`]; anything
    /// else, including nothing, is standard.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("a2a") => Self::RemoteAgent,
            _ => Self::Standard,
        }
    }
}

/// Who the capabilities are provisioned for.
#[derive(Debug, Clone, Default)]
pub struct ProvisionContext {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub agent_name: Option<String>,
    pub conversation_id: Option<String>,
    pub process_instance_id: Option<String>,
    /// Comma separated recipients of human query notifications.
    pub recipients: Option<String>,
    pub crew_type: Option<String>,
}

type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Builds capability lists and owns the connections behind them.
pub struct Provisioner {
    bridge: TaskBridge,
    supervisor: Arc<ConnectionSupervisor>,
    servers: ToolServersConfig,
    context: ProvisionContext,
    event_log: Option<Arc<dyn EventLog>>,
    memory: Option<Arc<dyn MemoryBackend>>,
    memento_url: String,
    memento_timeout: Duration,
    poll: PollSettings,
    a2a_prefix: String,
    a2a_timeout: Duration,
    env: Box<EnvLookup>,
}

impl Provisioner {
    /// Creates a provisioner with default settings and a fresh registry.
    pub fn new(servers: ToolServersConfig, context: ProvisionContext) -> Result<Self> {
        let supervisor = ConnectionSupervisor::new(
            Arc::new(McpConnector),
            Arc::new(ConnectionRegistry::new()),
            RetryPolicy::default(),
        );
        Ok(Self {
            bridge: TaskBridge::new()?,
            supervisor: Arc::new(supervisor),
            servers,
            context,
            event_log: None,
            memory: None,
            memento_url: DEFAULT_MEMENTO_URL.to_string(),
            memento_timeout: Duration::from_secs(40),
            poll: PollSettings::default(),
            a2a_prefix: "A2A".to_string(),
            a2a_timeout: a2a::DEFAULT_TIMEOUT,
            env: Box::new(|key| std::env::var(key).ok()),
        })
    }

    /// Applies file configuration. Keeps the current connector and registry.
    #[must_use]
    pub fn with_config(mut self, config: &Config) -> Self {
        self.memento_url.clone_from(&config.memento.base_url);
        self.memento_timeout = Duration::from_secs(config.memento.timeout_secs);
        self.poll = config.human_query.poll_settings();
        self.a2a_prefix.clone_from(&config.a2a.env_prefix);
        self.a2a_timeout = Duration::from_secs(config.a2a.timeout_secs);
        let supervisor = ConnectionSupervisor::new(
            Arc::new(McpConnector),
            Arc::clone(self.supervisor.registry()),
            config.supervisor.retry_policy(),
        )
        .with_warmup(config.supervisor.warmup);
        self.supervisor = Arc::new(supervisor);
        self
    }

    #[must_use]
    pub fn with_supervisor(mut self, supervisor: ConnectionSupervisor) -> Self {
        self.supervisor = Arc::new(supervisor);
        self
    }

    /// Event log backing the `human_asked` capability.
    #[must_use]
    pub fn with_event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Memory store backing the `mem0` capability.
    #[must_use]
    pub fn with_memory_backend(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(backend);
        self
    }

    #[must_use]
    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Replaces the environment used to resolve remote-agent endpoints.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Box::new(lookup);
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.supervisor.registry()
    }

    /// Provisions the capabilities for `names`.
    ///
    /// Missing context, descriptors or endpoints skip the affected entry,
    /// and a server or agent that fails to come up is logged and skipped.
    pub fn provision(
        &self,
        names: &[String],
        mode: ProvisionMode,
        endpoints: &BTreeMap<String, AgentEndpoint>,
    ) -> Result<Vec<Capability>> {
        info!(names = ?names, mode = ?mode, "Provisioning capabilities");
        let mut capabilities = self.local_capabilities();
        info!(count = capabilities.len(), "Built-in capabilities loaded");

        if mode == ProvisionMode::RemoteAgent {
            let candidates: Vec<String> = names
                .iter()
                .filter_map(|name| remote_agent_name(name))
                .collect();
            if candidates.is_empty() {
                info!("No remote agents requested");
            } else {
                capabilities.extend(self.remote_agents(&candidates, endpoints));
            }
        }

        for name in names {
            let key = name.trim().to_lowercase();
            if LOCAL_CAPABILITIES.contains(&key.as_str()) || key.starts_with(REMOTE_AGENT_PREFIX) {
                continue;
            }
            let Some(descriptor) = self.servers.descriptor(&key).cloned() else {
                warn!(server = %key, available = ?self.servers.mcp_servers.keys().collect::<Vec<_>>(), "No descriptor, skipping");
                continue;
            };

            let supervisor = Arc::clone(&self.supervisor);
            let server = key.clone();
            match self.bridge.run(async move { supervisor.connect(&server, &descriptor).await }) {
                Ok(Ok(tools)) => {
                    info!(server = %key, tools = tools.len(), "Tool server provisioned");
                    capabilities.extend(tools);
                }
                Ok(Err(e)) => error!(server = %key, error = %e, "Tool server unavailable, skipping"),
                Err(e) => error!(server = %key, error = %e, "Tool server task failed, skipping"),
            }
        }

        let capabilities = dedup_by_name(capabilities);
        info!(
            total = capabilities.len(),
            names = ?capabilities.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Provisioning finished"
        );
        Ok(capabilities)
    }

    /// Closes every connection opened by this provisioner.
    pub fn shutdown_all(&self) -> Result<()> {
        let registry = Arc::clone(self.supervisor.registry());
        self.bridge.run(async move { registry.shutdown_all().await })??;
        Ok(())
    }

    fn local_capabilities(&self) -> Vec<Capability> {
        let ctx = &self.context;
        let mut local = Vec::new();

        match (&ctx.user_id, &self.memory) {
            (Some(user_id), Some(backend)) => {
                local.push(Mem0::new(Arc::clone(backend), Some(user_id.clone())).into_capability());
            }
            (None, _) => info!("mem0 skipped: no user id"),
            (_, None) => info!("mem0 skipped: no memory backend"),
        }

        match &ctx.tenant_id {
            Some(tenant_id) => local.push(
                Memento::new(self.memento_url.clone(), tenant_id.clone(), ctx.process_instance_id.clone())
                    .with_timeout(self.memento_timeout)
                    .into_capability(),
            ),
            None => info!("memento skipped: no tenant id"),
        }

        match (&ctx.tenant_id, &ctx.agent_name, &self.event_log) {
            (Some(tenant_id), Some(agent_name), Some(log)) => {
                let query_context = HumanQueryContext {
                    conversation_id: ctx.conversation_id.clone(),
                    process_instance_id: ctx.process_instance_id.clone(),
                    tenant_id: Some(tenant_id.clone()),
                    agent_name: Some(agent_name.clone()),
                    recipients: ctx.recipients.clone(),
                    crew_type: ctx.crew_type.clone(),
                };
                local.push(HumanQuery::new(Arc::clone(log), query_context, self.poll).into_capability());
            }
            (None, _, _) => info!("human_asked skipped: no tenant id"),
            (_, None, _) => info!("human_asked skipped: no agent name"),
            (_, _, None) => info!("human_asked skipped: no event log"),
        }

        local
    }

    fn remote_agents(&self, names: &[String], endpoints: &BTreeMap<String, AgentEndpoint>) -> Vec<Capability> {
        info!(candidates = ?names, "Loading remote agents");
        let mut loaded = Vec::new();
        for name in names {
            let Some(endpoint) = self.resolve_endpoint(name, endpoints) else {
                warn!(agent = %name, "No endpoint, skipping");
                continue;
            };
            let capability_name = format!("A2A:{}", name);
            let timeout = self.a2a_timeout;
            let url = endpoint.url.clone();
            let created = self
                .bridge
                .run(async move { RemoteAgentCapability::create(&endpoint, capability_name, timeout).await });
            match created {
                Ok(Ok(capability)) => {
                    info!(agent = %name, url = %url, "Remote agent loaded");
                    loaded.push(capability);
                }
                Ok(Err(e)) => error!(agent = %name, error = %e, "Remote agent unavailable, skipping"),
                Err(e) => error!(agent = %name, error = %e, "Remote agent task failed, skipping"),
            }
        }
        loaded
    }

    /// Explicit endpoints first, then `<PREFIX>_<NAME>_URL` and the optional
    /// JSON `<PREFIX>_<NAME>_HEADERS`.
    fn resolve_endpoint(&self, name: &str, endpoints: &BTreeMap<String, AgentEndpoint>) -> Option<AgentEndpoint> {
        if let Some(endpoint) = endpoints.get(name).filter(|e| !e.url.is_empty()) {
            return Some(endpoint.clone());
        }

        let key = name.to_uppercase().replace('-', "_");
        let url = (self.env)(&format!("{}_{}_URL", self.a2a_prefix, key)).filter(|u| !u.is_empty())?;
        let headers = match (self.env)(&format!("{}_{}_HEADERS", self.a2a_prefix, key)) {
            Some(raw) if !raw.trim().is_empty() => parse_headers(&raw).unwrap_or_else(|| {
                warn!(agent = %name, "Ignoring malformed headers variable");
                BTreeMap::new()
            }),
            _ => BTreeMap::new(),
        };
        Some(AgentEndpoint { url, headers })
    }
}

/// Name after a case-insensitive `a2a:` prefix.
fn remote_agent_name(name: &str) -> Option<String> {
    let (prefix, rest) = name.split_at_checked(REMOTE_AGENT_PREFIX.len())?;
    prefix.eq_ignore_ascii_case(REMOTE_AGENT_PREFIX).then(|| rest.trim().to_string())
}

fn parse_headers(raw: &str) -> Option<BTreeMap<String, String>> {
    match serde_json::from_str::<Value>(raw).ok()? {
        Value::Object(map) => Some(
            map.into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect(),
        ),
        Value::Null => Some(BTreeMap::new()),
        _ => None,
    }
}

fn dedup_by_name(capabilities: Vec<Capability>) -> Vec<Capability> {
    let mut seen = HashSet::new();
    capabilities
        .into_iter()
        .filter(|c| {
            let first = seen.insert(c.name.clone());
            if !first {
                warn!(capability = %c.name, "Dropping duplicate capability");
            }
            first
        })
        .collect()
}
