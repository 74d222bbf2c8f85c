use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use loam_core::db::{Database, OutboxEntry, Schema, StoredRecord};
use loam_core::models::{ChangeOp, Document};
use loam_core::util::{is_server_url, normalize_text_option};
use loam_core::{Replica, ReplicaConfig};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub table: String,
    pub id: String,
    pub doc: Document,
    pub updated_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct OutboxItem {
    pub seq: i64,
    pub change_id: String,
    pub table: String,
    pub id: String,
    pub op: &'static str,
    pub timestamp: i64,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("LOAM_DB_PATH").map(PathBuf::from)) {
        return Ok(path);
    }
    default_db_path().ok_or_else(|| {
        CliError::Config("no data directory found; pass --db-path or set LOAM_DB_PATH".to_string())
    })
}

pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("loam").join("replica.db"))
}

/// `LOAM_*` settings with command-line flags taking precedence.
pub fn resolve_config(
    server_url: Option<String>,
    tenant: Option<String>,
) -> Result<ReplicaConfig, CliError> {
    apply_overrides(ReplicaConfig::from_env()?, server_url, tenant)
}

pub fn apply_overrides(
    mut config: ReplicaConfig,
    server_url: Option<String>,
    tenant: Option<String>,
) -> Result<ReplicaConfig, CliError> {
    if let Some(url) = normalize_text_option(server_url) {
        if !is_server_url(&url) {
            return Err(CliError::Config(
                "--server-url must start with http://, https://, ws:// or wss://".to_string(),
            ));
        }
        config.server_url = Some(url.trim_end_matches('/').to_string());
    }
    if let Some(tenant) = normalize_text_option(tenant) {
        config.tenant = tenant;
    }
    Ok(config)
}

pub async fn open_database(path: &Path) -> Result<Database, CliError> {
    Ok(Database::open(path, Schema::Replica).await?)
}

/// A replica context that edits the store without syncing.
pub async fn open_replica(path: &Path, config: ReplicaConfig) -> Result<Replica, CliError> {
    let db = open_database(path).await?;
    Ok(Replica::open_offline(db, config).await?)
}

pub fn normalize_identifier(label: &'static str, value: &str) -> Result<String, CliError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyIdentifier(label))
    } else {
        Ok(trimmed.to_string())
    }
}

/// `table/id` as used by `loam quarantine --release`.
pub fn parse_entity_ref(raw: &str) -> Result<(String, String), CliError> {
    let (table, id) = raw
        .split_once('/')
        .ok_or_else(|| CliError::BadEntityRef(raw.to_string()))?;
    let table = normalize_identifier("Table", table)?;
    let id = normalize_identifier("Record ID", id)?;
    Ok((table, id))
}

/// Parse a JSON object argument; `-` reads it from stdin.
pub fn read_document_arg(raw: &str) -> Result<Document, CliError> {
    if raw.trim() == "-" {
        let mut buffer = String::new();
        io::stdin().lock().read_to_string(&mut buffer)?;
        parse_document(&buffer)
    } else {
        parse_document(raw)
    }
}

pub fn parse_document(text: &str) -> Result<Document, CliError> {
    match serde_json::from_str::<Value>(text.trim())? {
        Value::Object(map) => Ok(map),
        other => Err(CliError::NotAnObject(other.to_string())),
    }
}

pub fn record_to_item(record: &StoredRecord, now_ms: i64) -> RecordListItem {
    RecordListItem {
        table: record.table.clone(),
        id: record.id.clone(),
        doc: record.doc.clone(),
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
    }
}

pub fn format_record_lines(records: &[StoredRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let preview = document_preview(&record.doc, 48);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            format!("{:<20}  {preview:<48}  {relative_time}", record.id)
        })
        .collect()
}

pub fn outbox_to_item(entry: &OutboxEntry) -> OutboxItem {
    OutboxItem {
        seq: entry.seq,
        change_id: entry.change.id.to_string(),
        table: entry.change.table.clone(),
        id: entry.change.key.clone(),
        op: entry.change.op.kind(),
        timestamp: entry.change.timestamp,
    }
}

pub fn format_outbox_lines(entries: &[OutboxEntry]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    entries
        .iter()
        .map(|entry| {
            let change = &entry.change;
            let target = format!("{}/{}", change.table, change.key);
            let detail = match &change.op {
                ChangeOp::Create { obj } => document_preview(obj, 40),
                ChangeOp::Update { to, .. } => document_preview(to, 40),
                ChangeOp::Delete => String::new(),
            };
            format!(
                "{:>5}  {:<6}  {target:<32}  {:<10}  {detail}",
                entry.seq,
                change.op.kind(),
                format_relative_time(change.timestamp, now_ms)
            )
        })
        .collect()
}

/// Compact one-line JSON, truncated to `max_chars`.
pub fn document_preview(doc: &Document, max_chars: usize) -> String {
    let rendered = Value::Object(doc.clone()).to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = rendered.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

pub fn format_revision(revision: Option<u64>) -> String {
    revision.map_or_else(|| "-".to_string(), |revision| revision.to_string())
}
