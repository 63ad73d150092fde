use trendy_core::LocalStore;

use crate::commands::common::format_history_lines;
use crate::error::CliError;

pub async fn run_history(limit: usize, as_json: bool, store: &LocalStore) -> Result<(), CliError> {
    let entries = store.recent_history(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No sync cycles recorded.");
        return Ok(());
    }

    for line in format_history_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}
