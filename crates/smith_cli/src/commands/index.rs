//! Index maintenance commands.

use anyhow::Result;
use tracing::info;

use super::{attach_watcher, load_config, offline_agent, print_json, GlobalArgs};

pub async fn reindex(global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = offline_agent(&config)?;

    let report = agent.reconcile().await?;
    if global.json {
        return print_json(&report);
    }
    println!(
        "Reindexed {} project(s): {} file(s) indexed, {} removed, {} orphaned project(s) dropped",
        report.projects, report.files_indexed, report.files_removed, report.orphans_dropped
    );
    Ok(())
}

pub async fn watch(global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = offline_agent(&config)?;
    let (agent, watcher) = attach_watcher(agent, &config);

    let report = agent.reconcile().await?;
    println!("Watching {} project(s). Press Ctrl-C to stop.", report.watched);

    tokio::signal::ctrl_c().await?;

    let stats = watcher.stats();
    info!(
        reindexed = stats.reindexed(),
        removed = stats.removed(),
        dropped = stats.dropped(),
        "Stopping watcher"
    );
    watcher.shutdown().await;
    Ok(())
}
