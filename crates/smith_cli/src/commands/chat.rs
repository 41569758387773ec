//! Chat commands - one-shot messages and the interactive session.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use smith_chat::{ChatReply, MessageRole, SiteAgent};

use super::{attach_watcher, load_config, online_agent, print_json, GlobalArgs};

#[derive(Args)]
pub struct ChatArgs {
    /// Session identifier
    #[arg(short, long)]
    pub session: String,

    /// Message text
    #[arg(required = true)]
    pub message: Vec<String>,
}

#[derive(Args)]
pub struct ReplArgs {
    /// Session identifier
    #[arg(short, long, default_value = "default")]
    pub session: String,
}

pub async fn execute(args: ChatArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = online_agent(&config)?;

    let message = args.message.join(" ");
    let reply = agent
        .handle_message(&args.session, &message)
        .await
        .context("Message rejected")?;

    if global.json {
        print_json(&reply)?;
    } else {
        print_reply(&reply);
    }

    if let Some(category) = &reply.failure {
        anyhow::bail!("Turn failed ({} error)", category);
    }
    Ok(())
}

pub async fn repl(args: ReplArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = online_agent(&config)?;

    let (agent, watcher) = if config.watcher.enabled {
        let (agent, watcher) = attach_watcher(agent, &config);
        (agent, Some(watcher))
    } else {
        (agent, None)
    };

    match agent.reconcile().await {
        Ok(report) => info!(projects = report.projects, watched = report.watched, "Ready"),
        Err(e) => warn!(error = %e, "Startup reconciliation failed"),
    }

    println!("sitesmith session '{}'. Commands: /history, /clear, /quit", args.session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/history" => print_history(&agent, &args.session)?,
            "/clear" => {
                agent.clear_session(&args.session).await?;
                println!("Session cleared.");
            }
            text => {
                let reply = agent.chat(&args.session, text).await;
                if global.json {
                    print_json(&reply)?;
                } else {
                    print_reply(&reply);
                }
            }
        }
    }

    if let Some(watcher) = watcher {
        watcher.shutdown().await;
    }
    Ok(())
}

fn print_reply(reply: &ChatReply) {
    println!("smith> {}", reply.reply_text);
    if let Some(path) = &reply.project_path {
        println!("        project: {}", path.display());
    }
    if !reply.files.is_empty() {
        println!("        files:   {}", reply.files.join(", "));
    }
}

pub(crate) fn print_history(agent: &SiteAgent, session_id: &str) -> Result<()> {
    for turn in agent.history(session_id)? {
        let who = match turn.role {
            MessageRole::User => "you",
            MessageRole::Assistant => "smith",
        };
        println!(
            "[{}] {}> {}",
            turn.created_at.format("%Y-%m-%d %H:%M:%S"),
            who,
            turn.content
        );
    }
    Ok(())
}
