//! Project file commands.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;

use super::{load_config, offline_agent, print_json, GlobalArgs};

#[derive(Args)]
pub struct ShowArgs {
    /// Project identifier (e.g. site-<session>)
    pub project: String,

    /// File path relative to the project root
    pub path: String,
}

#[derive(Args)]
pub struct FilesArgs {
    /// Project identifier (e.g. site-<session>)
    pub project: String,
}

pub fn show(args: ShowArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = offline_agent(&config)?;

    let bytes = agent.get_project_file(&args.project, &args.path)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes).context("Failed to write to stdout")?;
    stdout.flush()?;
    Ok(())
}

pub fn files(args: FilesArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let agent = offline_agent(&config)?;
    let files = agent.project_files(&args.project)?;

    if global.json {
        return print_json(&files);
    }
    println!("{}", agent.project_path(&args.project).display());
    for file in files {
        println!("  {:>8}  {}", file.size, file.path);
    }
    Ok(())
}
