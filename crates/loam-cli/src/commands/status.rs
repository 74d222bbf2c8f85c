use std::path::Path;

use loam_core::ReplicaConfig;
use serde::Serialize;

use crate::commands::common::{
    format_outbox_lines, format_revision, open_replica, outbox_to_item, parse_entity_ref,
    OutboxItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct StatusReport {
    replica_id: String,
    tenant: String,
    server_url: Option<String>,
    last_applied_remote_revision: Option<u64>,
    last_received_remote_revision: Option<u64>,
    pending_changes: usize,
    quarantined: usize,
}

pub async fn run_status(as_json: bool, db_path: &Path, config: ReplicaConfig) -> Result<(), CliError> {
    let tenant = config.tenant.clone();
    let server_url = config.server_url.clone();

    let replica = open_replica(db_path, config).await?;
    let gathered = async {
        Ok::<_, loam_core::Error>((
            replica.status().await?,
            replica.outbox().await?.len(),
            replica.quarantined().await?.len(),
        ))
    }
    .await;
    replica.shutdown().await?;
    let (status, pending_changes, quarantined) = gathered?;

    let report = StatusReport {
        replica_id: status.replica_id.to_string(),
        tenant,
        server_url,
        last_applied_remote_revision: status.last_applied_remote_revision,
        last_received_remote_revision: status.last_received_remote_revision,
        pending_changes,
        quarantined,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Replica:          {}", report.replica_id);
    println!(
        "Server:           {} (tenant {})",
        report.server_url.as_deref().unwrap_or("not configured"),
        report.tenant
    );
    println!(
        "Applied revision: {}",
        format_revision(report.last_applied_remote_revision)
    );
    println!(
        "Pulled revision:  {}",
        format_revision(report.last_received_remote_revision)
    );
    println!("Pending changes:  {}", report.pending_changes);
    println!("Quarantined:      {}", report.quarantined);
    Ok(())
}

pub async fn run_outbox(as_json: bool, db_path: &Path, config: ReplicaConfig) -> Result<(), CliError> {
    let replica = open_replica(db_path, config).await?;
    let entries = replica.outbox().await;
    replica.shutdown().await?;
    let entries = entries?;

    if as_json {
        let json_items = entries.iter().map(outbox_to_item).collect::<Vec<OutboxItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    for line in format_outbox_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_quarantine(
    release: Option<&str>,
    db_path: &Path,
    config: ReplicaConfig,
) -> Result<(), CliError> {
    let target = release.map(parse_entity_ref).transpose()?;

    let replica = open_replica(db_path, config).await?;
    let result = match &target {
        Some((table, id)) => replica.release(table, id).await.map(|released| (released, Vec::new())),
        None => replica.quarantined().await.map(|entities| (false, entities)),
    };
    replica.shutdown().await?;
    let (released, entities) = result?;

    if let Some((table, id)) = target {
        if released {
            println!("Released {table}/{id}");
            return Ok(());
        }
        return Err(CliError::RecordNotFound(format!("quarantined {table}/{id}")));
    }

    if entities.is_empty() {
        println!("Nothing is quarantined.");
        return Ok(());
    }
    for entity in entities {
        println!("{}/{}  {}", entity.table, entity.id, entity.reason);
    }
    Ok(())
}
