//! sitesmith CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Validation failure
//! - 4: Model error

use std::process::ExitCode;

use clap::Parser;
use smith_chat::ChatError;
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const VALIDATION_FAILURE: u8 = 3;
    pub const MODEL_ERROR: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json);

    let global = cli.global();
    let result = match cli.command {
        Commands::Chat(args) => commands::chat::execute(args, &global).await,
        Commands::Repl(args) => commands::chat::repl(args, &global).await,
        Commands::Clear(args) => commands::session::clear(args, &global).await,
        Commands::History(args) => commands::session::history(args, &global),
        Commands::Sessions => commands::session::list(&global),
        Commands::Show(args) => commands::project::show(args, &global),
        Commands::Files(args) => commands::project::files(args, &global),
        Commands::Reindex => commands::index::reindex(&global).await,
        Commands::Watch => commands::index::watch(&global).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for directive in [format!("smith={}", default_level), "warn".to_string()] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    let registry = tracing_subscriber::registry().with(filter);
    let log_result = if json {
        registry
            .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };

    if log_result.is_err() {
        // Logging already initialized, continue
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if let Some(chat_error) = e.downcast_ref::<ChatError>() {
        return match chat_error {
            ChatError::Validation(_) => ExitCodes::VALIDATION_FAILURE,
            ChatError::Model(_) | ChatError::LlmNotConfigured => ExitCodes::MODEL_ERROR,
            ChatError::NotFound(_) => ExitCodes::INVALID_ARGS,
            _ => ExitCodes::GENERAL_ERROR,
        };
    }

    let msg = e.to_string().to_lowercase();
    if msg.contains("validation") {
        ExitCodes::VALIDATION_FAILURE
    } else if msg.contains("model") {
        ExitCodes::MODEL_ERROR
    } else if msg.contains("argument") || msg.contains("option") || msg.contains("not found") {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::GENERAL_ERROR
    }
}
