//! Trendy CLI - operator front end for the local-first event store
//!
//! Records events offline and drives the sync engine against the backend.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ConfigCommands};
use crate::commands::common::{
    build_coordinator, load_config, open_store, resolve_config_path, resolve_db_path,
};
use crate::commands::completions::run_completions;
use crate::commands::config::{run_config, run_config_init};
use crate::commands::events::run_events;
use crate::commands::history::run_history;
use crate::commands::queue::run_queue;
use crate::commands::status::run_status;
use crate::commands::sync::{run_resync, run_sync};
use crate::commands::types::run_types;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn default_directive() -> Directive {
    "trendy=info"
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into())
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_directive()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);

    // These must work even when the existing file does not parse
    match &cli.command {
        Commands::Completions { shell, output } => {
            return run_completions(*shell, output.as_deref());
        }
        Commands::Config {
            command:
                ConfigCommands::Init {
                    api_url,
                    store_path,
                    force,
                },
        } => {
            return run_config_init(&config_path, api_url.clone(), store_path.clone(), *force);
        }
        _ => {}
    }

    let config = load_config(&config_path)?;
    let db_path = resolve_db_path(cli.db_path, &config);
    tracing::debug!(db_path = %db_path.display(), "Resolved database path");

    match cli.command {
        Commands::Sync { json } => {
            let coordinator = build_coordinator(open_store(&db_path)?, &config)?;
            run_sync(&coordinator, json).await?;
        }
        Commands::Resync => {
            let coordinator = build_coordinator(open_store(&db_path)?, &config)?;
            run_resync(&coordinator).await?;
        }
        Commands::Status { json } => {
            let coordinator = build_coordinator(open_store(&db_path)?, &config)?;
            run_status(&coordinator, json).await?;
        }
        Commands::Queue { command } => run_queue(command, &open_store(&db_path)?).await?,
        Commands::History { limit, json } => {
            run_history(limit, json, &open_store(&db_path)?).await?;
        }
        Commands::Events { command } => run_events(command, &open_store(&db_path)?).await?,
        Commands::Types { command } => run_types(command, &open_store(&db_path)?).await?,
        Commands::Config { command } => run_config(command, &config_path, &config)?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
