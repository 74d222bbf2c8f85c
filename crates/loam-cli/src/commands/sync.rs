use std::path::Path;
use std::sync::Arc;

use loam_core::sync::{LeaderElector, StepReport, SyncTrigger, Synchronizer};
use loam_core::{ChangeFeed, Replica, ReplicaConfig, SyncState};
use tokio::sync::Mutex;

use crate::commands::common::{format_revision, open_database};
use crate::error::CliError;

/// One pull/apply/push step, run as the replica's leader so it never races a
/// daemon syncing the same database.
pub async fn run_sync(db_path: &Path, config: ReplicaConfig) -> Result<(), CliError> {
    let connector = config.ws_connector().ok_or(CliError::SyncNotConfigured)?;
    let db = Arc::new(Mutex::new(open_database(db_path).await?));

    let holder = format!("loam-cli-{}", std::process::id());
    let leader = LeaderElector::start(db.clone(), holder.clone(), config.leader_lease);
    let wait = config.leader_lease * 2;
    if tokio::time::timeout(wait, leader.wait_for_leadership())
        .await
        .is_err()
    {
        leader.resign().await?;
        return Err(CliError::LeaseBusy);
    }

    // Pulled changes are logged under the lease holder for other open contexts.
    let synchronizer = Synchronizer::new(db, ChangeFeed::default(), connector, config, SyncTrigger::new())
        .with_context(holder);
    let result = async {
        let executer = synchronizer.connect().await?;
        synchronizer.step(&executer).await
    }
    .await;
    leader.resign().await?;

    for line in format_step_report(&result?) {
        println!("{line}");
    }
    Ok(())
}

/// Keep the replica synced until Ctrl-C.
pub async fn run_daemon(db_path: &Path, config: ReplicaConfig) -> Result<(), CliError> {
    let connector = config.ws_connector().ok_or(CliError::SyncNotConfigured)?;
    let replica = Replica::open_path(db_path, config, connector).await?;
    let mut state = replica.watch_sync_state();
    tracing::info!(context = replica.context(), "Sync daemon started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let outcome = loop {
        tokio::select! {
            signal = &mut shutdown => break signal.map_err(CliError::from),
            changed = state.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *state.borrow_and_update();
                if current == SyncState::Error {
                    tracing::warn!("Sync step failed; retrying on the next trigger");
                } else {
                    tracing::info!(state = ?current, leader = replica.is_leader(), "Sync state changed");
                }
            }
        }
    };

    replica.shutdown().await?;
    outcome
}

pub fn format_step_report(report: &StepReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Pulled {} change(s), pushed {}; server revision {}",
        report.pulled,
        report.sent,
        format_revision(report.server_revision)
    )];
    if report.conflicted > 0 {
        lines.push(format!("Rebased {} conflicting change(s)", report.conflicted));
    }
    if report.discarded > 0 {
        lines.push(format!(
            "Dropped {} local change(s) to remotely deleted records",
            report.discarded
        ));
    }
    if report.quarantined > 0 {
        lines.push(format!(
            "Quarantined {} record(s); see `loam quarantine`",
            report.quarantined
        ));
    }
    if report.more_pending {
        lines.push("More changes are pending; run `loam sync` again".to_string());
    }
    lines
}
