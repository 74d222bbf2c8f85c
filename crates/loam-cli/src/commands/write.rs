use std::path::Path;

use loam_core::ReplicaConfig;

use crate::commands::common::{normalize_identifier, open_replica, read_document_arg};
use crate::error::CliError;

pub async fn run_create(
    table: &str,
    id: &str,
    doc: &str,
    db_path: &Path,
    config: ReplicaConfig,
) -> Result<(), CliError> {
    let table = normalize_identifier("Table", table)?;
    let id = normalize_identifier("Record ID", id)?;
    let doc = read_document_arg(doc)?;

    let replica = open_replica(db_path, config).await?;
    let result = replica.capture().create(&table, &id, doc).await;
    replica.shutdown().await?;

    println!("{}", result?.id);
    Ok(())
}

pub async fn run_update(
    table: &str,
    id: &str,
    patch: &str,
    db_path: &Path,
    config: ReplicaConfig,
) -> Result<(), CliError> {
    let table = normalize_identifier("Table", table)?;
    let id = normalize_identifier("Record ID", id)?;
    let patch = read_document_arg(patch)?;

    let replica = open_replica(db_path, config).await?;
    let result = replica.capture().update(&table, &id, patch).await;
    replica.shutdown().await?;

    match result.map_err(not_found(&table, &id))? {
        Some(change) => println!("{}", change.id),
        None => println!("No changes"),
    }
    Ok(())
}

pub async fn run_delete(
    table: &str,
    id: &str,
    db_path: &Path,
    config: ReplicaConfig,
) -> Result<(), CliError> {
    let table = normalize_identifier("Table", table)?;
    let id = normalize_identifier("Record ID", id)?;

    let replica = open_replica(db_path, config).await?;
    let result = replica.capture().delete(&table, &id).await;
    replica.shutdown().await?;

    println!("{}", result.map_err(not_found(&table, &id))?.id);
    Ok(())
}

fn not_found<'a>(table: &'a str, id: &'a str) -> impl FnOnce(loam_core::Error) -> CliError + 'a {
    move |error| match error {
        loam_core::Error::NotFound(_) => CliError::RecordNotFound(format!("{table}/{id}")),
        other => CliError::Core(other),
    }
}
