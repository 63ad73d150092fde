use trendy_core::{SyncCoordinator, SyncReport, SyncTrigger};

use crate::error::CliError;

pub async fn run_sync(coordinator: &SyncCoordinator, as_json: bool) -> Result<(), CliError> {
    let report = coordinator.sync(SyncTrigger::Manual).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", format_sync_report(&report));
    }
    Ok(())
}

pub async fn run_resync(coordinator: &SyncCoordinator) -> Result<(), CliError> {
    coordinator.force_resync().await?;
    let report = coordinator.sync(SyncTrigger::Manual).await?;
    println!("Resync completed: {}", format_sync_report(&report));
    Ok(())
}

pub fn format_sync_report(report: &SyncReport) -> String {
    let mut summary = if report.bootstrapped {
        format!(
            "Sync completed: pushed {}, downloaded full snapshot ({} records)",
            report.pushed, report.pulled
        )
    } else {
        format!(
            "Sync completed: pushed {}, pulled {}",
            report.pushed, report.pulled
        )
    };
    if report.flush_halted {
        summary.push_str(" (some changes are still queued; the server is unavailable or rate limiting)");
    }
    summary
}
