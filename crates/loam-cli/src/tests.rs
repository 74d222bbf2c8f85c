use std::time::Duration;

use loam_core::sync::StepReport;
use loam_core::ReplicaConfig;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;

use crate::cli::CompletionShell;
use crate::commands::common::{
    apply_overrides, document_preview, format_relative_time, normalize_identifier, open_replica,
    parse_document, parse_entity_ref,
};
use crate::commands::sync::{format_step_report, run_sync};
use crate::commands::write::{run_create, run_delete, run_update};
use crate::error::CliError;

fn quiet_config() -> ReplicaConfig {
    ReplicaConfig::default().with_debounce(Duration::from_millis(10))
}

#[test]
fn parse_document_requires_object() {
    let doc = parse_document(r#" {"title": "A", "tags": ["x"]} "#).unwrap();
    assert_eq!(doc["title"], "A");
    assert!(matches!(parse_document("[1, 2]"), Err(CliError::NotAnObject(_))));
    assert!(matches!(parse_document("{not json"), Err(CliError::Serialization(_))));
}

#[test]
fn identifiers_are_trimmed_and_required() {
    assert_eq!(normalize_identifier("Table", "  notes ").unwrap(), "notes");
    assert!(matches!(
        normalize_identifier("Record ID", "  "),
        Err(CliError::EmptyIdentifier("Record ID"))
    ));
}

#[test]
fn entity_ref_splits_on_first_slash() {
    assert_eq!(
        parse_entity_ref("notes/n1").unwrap(),
        ("notes".to_string(), "n1".to_string())
    );
    assert!(matches!(parse_entity_ref("notes"), Err(CliError::BadEntityRef(_))));
    assert!(matches!(parse_entity_ref("notes/ "), Err(CliError::EmptyIdentifier(_))));
}

#[test]
fn flags_override_environment_settings() {
    let config = apply_overrides(
        quiet_config(),
        Some("https://sync.example.com/".to_string()),
        Some(" acme ".to_string()),
    )
    .unwrap();
    assert_eq!(config.server_url.as_deref(), Some("https://sync.example.com"));
    assert_eq!(config.tenant, "acme");

    let unchanged = apply_overrides(quiet_config(), None, Some(String::new())).unwrap();
    assert_eq!(unchanged.tenant, "default");

    assert!(matches!(
        apply_overrides(quiet_config(), Some("sync.example.com".to_string()), None),
        Err(CliError::Config(_))
    ));
}

#[test]
fn previews_and_relative_times() {
    let doc = parse_document(r#"{"title": "a fairly long title for a note"}"#).unwrap();
    let preview = document_preview(&doc, 20);
    assert_eq!(preview.chars().count(), 20);
    assert!(preview.ends_with("..."));

    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
}

#[test]
fn step_report_mentions_only_what_happened() {
    let quiet = StepReport {
        pulled: 2,
        sent: 1,
        server_revision: Some(7),
        ..StepReport::default()
    };
    assert_eq!(
        format_step_report(&quiet),
        vec!["Pulled 2 change(s), pushed 1; server revision 7".to_string()]
    );

    let busy = StepReport {
        quarantined: 1,
        more_pending: true,
        ..StepReport::default()
    };
    let lines = format_step_report(&busy);
    assert_eq!(lines.len(), 3);
    assert!(lines[0].ends_with("server revision -"));
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_land_in_store_and_outbox() {
    let tmp = tempdir().unwrap();
    let db_path = tmp.path().join("replica.db");

    run_create("notes", "n1", r#"{"title": "A"}"#, &db_path, quiet_config())
        .await
        .unwrap();
    run_update("notes", "n1", r#"{"title": "B", "pinned": true}"#, &db_path, quiet_config())
        .await
        .unwrap();

    let replica = open_replica(&db_path, quiet_config()).await.unwrap();
    let record = replica.capture().get("notes", "n1").await.unwrap().unwrap();
    assert_eq!(serde_json::Value::Object(record.doc), json!({"title": "B", "pinned": true}));
    assert_eq!(replica.outbox().await.unwrap().len(), 2);
    replica.shutdown().await.unwrap();

    run_delete("notes", "n1", &db_path, quiet_config()).await.unwrap();
    let replica = open_replica(&db_path, quiet_config()).await.unwrap();
    assert!(replica.capture().get("notes", "n1").await.unwrap().is_none());
    replica.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_records_are_reported() {
    let tmp = tempdir().unwrap();
    let db_path = tmp.path().join("replica.db");

    let err = run_update("notes", "ghost", r#"{"title": "B"}"#, &db_path, quiet_config())
        .await
        .unwrap_err();
    assert!(matches!(err, CliError::RecordNotFound(ref target) if target == "notes/ghost"));

    let err = run_delete("notes", "ghost", &db_path, quiet_config())
        .await
        .unwrap_err();
    assert!(matches!(err, CliError::RecordNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_requires_a_server() {
    let tmp = tempdir().unwrap();
    let err = run_sync(&tmp.path().join("replica.db"), quiet_config())
        .await
        .unwrap_err();
    assert!(matches!(err, CliError::SyncNotConfigured));
}

#[test]
fn completion_scripts_cover_subcommands() {
    let bash = String::from_utf8(CompletionShell::Bash.script()).unwrap();
    assert!(bash.contains("loam"));
    assert!(bash.contains("outbox"));

    let fish = String::from_utf8(CompletionShell::Fish.script()).unwrap();
    assert!(fish.contains("complete -c loam"));
    assert!(!CompletionShell::Zsh.script().is_empty());
}
