//! Session commands.

use anyhow::Result;
use clap::Args;

use super::{load_config, offline_agent, print_json, GlobalArgs};

#[derive(Args)]
pub struct SessionArgs {
    /// Session identifier
    #[arg(short, long)]
    pub session: String,
}

pub async fn clear(args: SessionArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = offline_agent(&config)?;

    agent.clear_session(&args.session).await?;
    println!("Cleared session '{}'", args.session);
    Ok(())
}

pub fn history(args: SessionArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = offline_agent(&config)?;

    if global.json {
        return print_json(&agent.history(&args.session)?);
    }
    super::chat::print_history(&agent, &args.session)
}

pub fn list(global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = offline_agent(&config)?;
    let sessions = agent.list_sessions()?;

    if global.json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{:<24} {:<28} {:>3} turns  {:<11} updated {}",
            session.id,
            session.project_id,
            session.turns,
            session.stage.to_string(),
            session.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
