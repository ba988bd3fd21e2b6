//! Recon CLI - Main entry point

use clap::Parser;
use recon_cli::{Cli, Commands, EXIT_OPERATIONAL_FAILURE};
use recon_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    let Some(command) = &cli.command else {
        eprintln!("Error: A subcommand is required");
        eprintln!();
        eprintln!("For more information, try '--help'.");
        process::exit(EXIT_OPERATIONAL_FAILURE);
    };

    // Warnings and errors go to stderr unless --verbose; RECON_LOG_* overrides both
    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Warn };
    let log_config = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("recon")
        .build()
        .merge_env()
        .unwrap_or_else(|_| LogConfig::builder().level(level).build());

    // the CLI works without logging
    let guard = init_logging(&log_config).ok().flatten();

    let code = match execute_command(command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            EXIT_OPERATIONAL_FAILURE
        },
    };

    // flush file logs before exiting
    drop(guard);
    process::exit(code);
}

async fn execute_command(command: &Commands) -> recon_cli::Result<i32> {
    match command {
        Commands::Run(args) => recon_cli::commands::run::run(args).await,
        Commands::Show { run_id, store, json } => recon_cli::commands::history::show(*run_id, store, *json).await,
        Commands::List { limit, store, json } => recon_cli::commands::history::list(*limit, store, *json).await,
        Commands::Trend(args) => recon_cli::commands::trend::run(args).await,
        Commands::Migrate { store } => recon_cli::commands::migrate::run(store).await,
    }
}
