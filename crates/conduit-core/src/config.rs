//! Configuration for Conduit.
//!
//! `Config` is read from a TOML file (`.conduit/conduit.toml` by default);
//! a missing file yields defaults. Tool servers come from a separate JSON
//! document in the common `{"mcpServers": {...}}` shape.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::human::PollSettings;
use crate::knowledge::DEFAULT_MEMENTO_URL;
use crate::supervisor::RetryPolicy;

/// Env var overriding `[event_log] path`.
pub const EVENT_LOG_PATH_ENV: &str = "CONDUIT_EVENT_LOG_PATH";
/// Env var overriding `[memento] base_url`.
pub const MEMENTO_URL_ENV: &str = "CONDUIT_MEMENTO_URL";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    /// File content is malformed.
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// `[event_log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogSection {
    /// SQLite database file.
    #[serde(default = "default_event_log_path")]
    pub path: PathBuf,
}

fn default_event_log_path() -> PathBuf {
    PathBuf::from(".conduit/events.db")
}

impl Default for EventLogSection {
    fn default() -> Self {
        Self { path: default_event_log_path() }
    }
}

/// `[human_query]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanQuerySection {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_consecutive_errors: u32,
}

impl Default for HumanQuerySection {
    fn default() -> Self {
        Self { timeout_secs: 180, poll_interval_secs: 5, max_consecutive_errors: 3 }
    }
}

impl HumanQuerySection {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            interval: Duration::from_secs(self.poll_interval_secs),
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    /// Pre-fetch `npx -y` packages before connecting.
    pub warmup: bool,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self { max_attempts: 2, retry_delay_secs: 5, warmup: true }
    }
}

impl SupervisorSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { max_attempts: self.max_attempts, retry_delay: Duration::from_secs(self.retry_delay_secs) }
    }
}

/// `[memento]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MementoSection {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for MementoSection {
    fn default() -> Self {
        Self { base_url: DEFAULT_MEMENTO_URL.to_string(), timeout_secs: 40 }
    }
}

/// `[a2a]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct A2aSection {
    /// Prefix of the `<PREFIX>_<NAME>_URL` endpoint variables.
    pub env_prefix: String,
    pub timeout_secs: u64,
}

impl Default for A2aSection {
    fn default() -> Self {
        Self { env_prefix: "A2A".to_string(), timeout_secs: 60 }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub event_log: EventLogSection,
    #[serde(default)]
    pub human_query: HumanQuerySection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub memento: MementoSection,
    #[serde(default)]
    pub a2a: A2aSection,
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        PathBuf::from(".conduit").join("conduit.toml")
    }

    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Loads `path`, or defaults when the file does not exist.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Loads `path` (or the default path) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        let mut config = Self::load_from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies overrides from an environment lookup. Blank values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(path) = value(EVENT_LOG_PATH_ENV) {
            self.event_log.path = PathBuf::from(path);
        }
        if let Some(url) = value(MEMENTO_URL_ENV) {
            self.memento.base_url = url;
        }
    }
}

/// The `{"mcpServers": {name: descriptor}}` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolServersConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: Map<String, Value>,
}

impl ToolServersConfig {
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Descriptor for `name`; empty or non-object entries count as absent.
    pub fn descriptor(&self, name: &str) -> Option<&Map<String, Value>> {
        self.mcp_servers.get(name).and_then(Value::as_object).filter(|d| !d.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.mcp_servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.event_log.path, PathBuf::from(".conduit/events.db"));
        assert_eq!(config.human_query.poll_settings(), PollSettings::default());
        assert_eq!(config.supervisor.retry_policy(), RetryPolicy::default());
        assert!(config.supervisor.warmup);
        assert_eq!(config.memento.base_url, DEFAULT_MEMENTO_URL);
        assert_eq!(config.a2a.env_prefix, "A2A");
        assert_eq!(config.a2a.timeout_secs, 60);
    }

    #[test]
    fn test_config_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [human_query]
            timeout_secs = 30

            [supervisor]
            warmup = false

            [a2a]
            env_prefix = "AGENTS"
            "#,
        )
        .unwrap();
        assert_eq!(config.human_query.timeout_secs, 30);
        assert_eq!(config.human_query.poll_interval_secs, 5);
        assert!(!config.supervisor.warmup);
        assert_eq!(config.supervisor.max_attempts, 2);
        assert_eq!(config.a2a.env_prefix, "AGENTS");
    }

    #[test]
    fn test_config_load_missing_file_and_invalid_file() {
        let dir = TempDir::new().unwrap();
        let missing = Config::load_from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing, Config::default());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[supervisor\nmax_attempts = ").unwrap();
        assert!(matches!(Config::load_from_file(&bad), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([(EVENT_LOG_PATH_ENV, "/var/lib/conduit/events.db"), (MEMENTO_URL_ENV, "  ")]);
        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.event_log.path, PathBuf::from("/var/lib/conduit/events.db"));
        assert_eq!(config.memento.base_url, DEFAULT_MEMENTO_URL);
    }

    #[test]
    fn test_tool_servers_descriptor_lookup() {
        let servers = ToolServersConfig::from_json_str(
            r#"{"mcpServers": {
                "github": {"command": "npx", "args": ["-y", "@acme/github-mcp"]},
                "empty": {},
                "broken": "not an object"
            }}"#,
        )
        .unwrap();
        assert_eq!(servers.descriptor("github").unwrap()["command"], "npx");
        assert!(servers.descriptor("empty").is_none());
        assert!(servers.descriptor("broken").is_none());
        assert!(servers.descriptor("missing").is_none());

        assert!(ToolServersConfig::from_json_str("{}").unwrap().is_empty());
        assert!(ToolServersConfig::from_json_str("[").is_err());
    }
}
