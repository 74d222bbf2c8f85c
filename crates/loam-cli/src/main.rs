//! Loam CLI - inspect and edit a local replica, and sync it with a server
//!
//! Writes go through the same change capture the library uses, so anything
//! done here shows up in the outbox and is pushed on the next sync.

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use std::io::Write;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::{resolve_config, resolve_db_path};
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

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(log_directive("loam_cli=info")?)
                .add_directive(log_directive("loam_core=warn")?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        let script = shell.script();
        match output {
            Some(path) => {
                std::fs::write(path, &script)?;
                println!("{}", path.display());
            }
            None => std::io::stdout().write_all(&script)?,
        }
        return Ok(());
    }

    let db_path = resolve_db_path(cli.db_path)?;
    let config = resolve_config(cli.server_url, cli.tenant)?;

    match cli.command {
        Commands::Create { table, id, doc } => {
            commands::write::run_create(&table, &id, &doc, &db_path, config).await?;
        }
        Commands::Update { table, id, patch } => {
            commands::write::run_update(&table, &id, &patch, &db_path, config).await?;
        }
        Commands::Delete { table, id } => {
            commands::write::run_delete(&table, &id, &db_path, config).await?;
        }
        Commands::Get { table, id } => commands::read::run_get(&table, &id, &db_path, config).await?,
        Commands::List { table, limit, json } => {
            commands::read::run_list(&table, limit, json, &db_path, config).await?;
        }
        Commands::Outbox { json } => commands::status::run_outbox(json, &db_path, config).await?,
        Commands::Status { json } => commands::status::run_status(json, &db_path, config).await?,
        Commands::Quarantine { release } => {
            commands::status::run_quarantine(release.as_deref(), &db_path, config).await?;
        }
        Commands::Sync => commands::sync::run_sync(&db_path, config).await?,
        Commands::Daemon => commands::sync::run_daemon(&db_path, config).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn log_directive(raw: &str) -> Result<tracing_subscriber::filter::Directive, CliError> {
    raw.parse()
        .map_err(|error| CliError::Config(format!("bad log directive {raw:?}: {error}")))
}
