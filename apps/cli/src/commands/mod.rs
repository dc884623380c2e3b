//! Subcommand implementations.

pub mod ask;
pub mod provision;
pub mod resolve;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use conduit_core::SqliteEventLog;

/// Opens the configured event log, creating its directory when needed.
pub fn open_event_log(path: &Path) -> anyhow::Result<Arc<SqliteEventLog>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let path = path.to_str().context("Event log path is not valid UTF-8")?;
    let log = SqliteEventLog::open(path).with_context(|| format!("Failed to open event log {}", path))?;
    Ok(Arc::new(log))
}
