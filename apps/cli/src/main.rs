//! Conduit CLI - provisions agent capabilities from the command line.
//!
//! The `conduit` binary resolves tool-server descriptors, provisions
//! capability sets and puts questions to humans through the event log.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{ask, provision, resolve};

#[derive(Parser, Debug)]
#[command(name = "conduit", author, version, about = "Conduit - capability provisioning for agents")]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Config file (defaults to .conduit/conduit.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the connection parameters a tool server resolves to
    Resolve {
        /// JSON file with an `mcpServers` object
        servers: PathBuf,
        /// Server name
        name: String,
    },

    /// Provision capabilities and list their names
    Provision(provision::ProvisionArgs),

    /// Ask a human a question and wait for the answer
    Ask(ask::AskArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    let config = conduit_core::Config::load(args.config.as_deref())?;

    match args.command {
        Command::Resolve { servers, name } => resolve::execute(&servers, &name),
        Command::Provision(cmd) => provision::execute(cmd, &config),
        Command::Ask(cmd) => ask::execute(cmd, &config).await,
    }
}
