//! `conduit ask`

use std::time::Duration;

use anyhow::bail;
use clap::Args;
use conduit_core::{Config, HumanQuery, HumanQueryContext, QueryKind};

use super::open_event_log;

#[derive(Args, Debug)]
pub struct AskArgs {
    /// Conversation (task) the question belongs to
    #[arg(long)]
    pub conversation: String,

    /// Who the question is for
    #[arg(long, default_value = "user")]
    pub role: String,

    #[arg(long)]
    pub text: String,

    /// Answer kind: text, select or confirm
    #[arg(long = "type", default_value = "text")]
    pub kind: String,

    /// Choice for select questions (repeatable)
    #[arg(long = "option")]
    pub options: Vec<String>,

    /// Comma separated recipients to notify
    #[arg(long)]
    pub notify: Option<String>,

    #[arg(long)]
    pub agent: Option<String>,

    #[arg(long)]
    pub tenant: Option<String>,

    /// Seconds to wait for an answer (overrides the config)
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn execute(args: AskArgs, config: &Config) -> anyhow::Result<()> {
    let Some(kind) = QueryKind::parse(&args.kind) else {
        bail!("Unknown question type '{}': expected text, select or confirm", args.kind);
    };

    let mut poll = config.human_query.poll_settings();
    if let Some(secs) = args.timeout {
        poll.timeout = Duration::from_secs(secs);
    }

    let context = HumanQueryContext {
        conversation_id: Some(args.conversation),
        tenant_id: args.tenant,
        agent_name: args.agent,
        recipients: args.notify,
        ..HumanQueryContext::default()
    };
    let query = HumanQuery::new(open_event_log(&config.event_log.path)?, context, poll);
    let options = if args.options.is_empty() { None } else { Some(args.options) };

    let answer = query.ask(&args.role, &args.text, kind, options).await?;
    println!("{}", answer);
    Ok(())
}
