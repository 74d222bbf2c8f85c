use std::path::Path;

use chrono::Utc;
use loam_core::ReplicaConfig;

use crate::commands::common::{
    format_record_lines, normalize_identifier, open_replica, record_to_item, RecordListItem,
};
use crate::error::CliError;

pub async fn run_get(
    table: &str,
    id: &str,
    db_path: &Path,
    config: ReplicaConfig,
) -> Result<(), CliError> {
    let table = normalize_identifier("Table", table)?;
    let id = normalize_identifier("Record ID", id)?;

    let replica = open_replica(db_path, config).await?;
    let record = replica.capture().get(&table, &id).await;
    replica.shutdown().await?;

    let record = record?.ok_or_else(|| CliError::RecordNotFound(format!("{table}/{id}")))?;
    println!("{}", serde_json::to_string_pretty(&record.doc)?);
    Ok(())
}

pub async fn run_list(
    table: &str,
    limit: usize,
    as_json: bool,
    db_path: &Path,
    config: ReplicaConfig,
) -> Result<(), CliError> {
    let table = normalize_identifier("Table", table)?;

    let replica = open_replica(db_path, config).await?;
    let records = replica.capture().list(&table, limit).await;
    replica.shutdown().await?;
    let records = records?;

    if as_json {
        let now_ms = Utc::now().timestamp_millis();
        let json_items = records
            .iter()
            .map(|record| record_to_item(record, now_ms))
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}
