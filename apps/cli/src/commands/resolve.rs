//! `conduit resolve`

use std::path::Path;

use anyhow::{Context, bail};
use conduit_core::{ToolServersConfig, resolve};

pub fn execute(servers: &Path, name: &str) -> anyhow::Result<()> {
    let servers = ToolServersConfig::load_from_file(servers)?;
    let Some(descriptor) = servers.descriptor(name) else {
        bail!("Server '{}' is not configured", name);
    };
    let Some(params) = resolve(descriptor) else {
        bail!("Server '{}' cannot be resolved to connection parameters", name);
    };
    let rendered = serde_json::to_string_pretty(&params).context("Failed to render parameters")?;
    println!("{}", rendered);
    Ok(())
}
