use trendy_core::{SyncCoordinator, SyncState, SyncStatusReport};

use crate::commands::common::format_timestamp;
use crate::error::CliError;

pub async fn run_status(coordinator: &SyncCoordinator, as_json: bool) -> Result<(), CliError> {
    let status = coordinator.status().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(status: &SyncStatusReport) -> Vec<String> {
    let state = match &status.state {
        SyncState::Idle => "idle".to_string(),
        SyncState::Syncing(progress) => format!(
            "syncing ({:?} {}/{})",
            progress.phase, progress.completed, progress.total
        ),
        SyncState::Error { message } => format!("error: {message}"),
    };

    let mut lines = vec![
        format!("State:    {state}"),
        format!("Cursor:   {}", status.cursor),
        format!("Queue:    {} pending, {} failed", status.pending, status.failed),
    ];
    if let Some(secs) = status.breaker_open_secs {
        lines.push(format!("Breaker:  open for another {secs}s"));
    }
    match &status.last_sync {
        Some(entry) => lines.push(format!(
            "Last:     {} at {}",
            entry.outcome,
            format_timestamp(&entry.started_at)
        )),
        None => lines.push("Last:     never synced".to_string()),
    }
    for recommendation in &status.recommendations {
        lines.push(format!("- {recommendation}"));
    }
    lines
}
