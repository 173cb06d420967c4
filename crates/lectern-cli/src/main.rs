//! Lectern CLI - write sermons offline and sync them across devices
//!
//! Every command works against the local database; only `lectern sync`
//! talks to the remote store.

mod cli;
mod commands;
mod config;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::add::run_add;
use crate::commands::common::resolve_db_path;
use crate::commands::config::run_config;
use crate::commands::delete::run_delete;
use crate::commands::edit::{run_edit, EditPatch};
use crate::commands::list::run_list;
use crate::commands::show::run_show;
use crate::commands::sync::{
    run_sync, run_sync_conflicts, run_sync_requeue, run_sync_resolve, run_sync_status,
    run_sync_unblock,
};
use crate::config::CliConfig;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "lectern=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Config { command } = cli.command {
        return run_config(command, cli.db_path);
    }

    let config = CliConfig::effective()?;
    let db_path = resolve_db_path(cli.db_path, &config)?;

    match cli.command {
        Commands::Add { kind } => run_add(kind, &config, &db_path).await,
        Commands::List { kind, limit, json } => run_list(kind, limit, json, &db_path).await,
        Commands::Show { id, json } => run_show(&id, json, &db_path).await,
        Commands::Edit {
            id,
            title,
            body,
            description,
            tags,
            status,
            series,
        } => {
            let patch = EditPatch {
                title,
                body,
                description,
                tags,
                status,
                series,
            };
            run_edit(&id, patch, &db_path).await
        }
        Commands::Delete { id, cascade } => run_delete(&id, cascade, &db_path).await,
        Commands::Sync { command } => match command {
            None => run_sync(&config, false, &db_path).await,
            Some(SyncCommands::Run { json }) => run_sync(&config, json, &db_path).await,
            Some(SyncCommands::Status { json }) => run_sync_status(json, &db_path).await,
            Some(SyncCommands::Conflicts { json }) => run_sync_conflicts(json, &db_path).await,
            Some(SyncCommands::Resolve {
                id,
                resolution,
                merged_file,
            }) => run_sync_resolve(&id, resolution, merged_file, &db_path).await,
            Some(SyncCommands::Requeue { id }) => run_sync_requeue(id.as_deref(), &db_path).await,
            Some(SyncCommands::Unblock { id }) => run_sync_unblock(&id, &db_path).await,
        },
        Commands::Config { .. } => Ok(()),
    }
}
