//! `conduit provision`

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use conduit_core::{Config, ProvisionContext, ProvisionMode, Provisioner, ToolServersConfig};

use super::open_event_log;

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Capability or server names (`a2a:<name>` for remote agents)
    pub names: Vec<String>,

    /// Provisioning mode (`a2a` enables remote agents)
    #[arg(long)]
    pub mode: Option<String>,

    /// JSON file with an `mcpServers` object
    #[arg(long)]
    pub servers: Option<PathBuf>,

    #[arg(long)]
    pub tenant: Option<String>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub agent: Option<String>,

    /// Conversation the human query capability asks under
    #[arg(long)]
    pub conversation: Option<String>,
}

pub fn execute(args: ProvisionArgs, config: &Config) -> anyhow::Result<()> {
    let servers = match &args.servers {
        Some(path) => ToolServersConfig::load_from_file(path)?,
        None => ToolServersConfig::default(),
    };
    let context = ProvisionContext {
        tenant_id: args.tenant,
        user_id: args.user,
        agent_name: args.agent,
        conversation_id: args.conversation,
        ..ProvisionContext::default()
    };

    let provisioner = Provisioner::new(servers, context)?
        .with_config(config)
        .with_event_log(open_event_log(&config.event_log.path)?);
    let mode = ProvisionMode::parse(args.mode.as_deref());

    let capabilities = provisioner.provision(&args.names, mode, &BTreeMap::new());
    let shutdown = provisioner.shutdown_all();

    let capabilities = capabilities?;
    tracing::info!(count = capabilities.len(), "Provisioned capabilities");
    for capability in &capabilities {
        println!("{}", capability.name);
    }
    shutdown?;
    Ok(())
}
