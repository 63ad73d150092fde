use trendy_core::LocalStore;

use crate::cli::QueueCommands;
use crate::commands::common::{format_mutation_lines, mutation_to_list_item, MutationListItem};
use crate::error::CliError;

pub async fn run_queue(command: QueueCommands, store: &LocalStore) -> Result<(), CliError> {
    match command {
        QueueCommands::List { json } => run_queue_list(json, store).await,
        QueueCommands::Clear => {
            let cleared = store.clear_mutations().await?;
            println!("Cleared {cleared} queued mutation(s)");
            Ok(())
        }
        QueueCommands::Retry => {
            let retried = store.retry_failed_mutations().await?;
            println!("Re-queued {retried} failed mutation(s)");
            Ok(())
        }
    }
}

async fn run_queue_list(as_json: bool, store: &LocalStore) -> Result<(), CliError> {
    let mutations = store.list_mutations().await?;

    if as_json {
        let json_items = mutations
            .iter()
            .map(mutation_to_list_item)
            .collect::<Vec<MutationListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if mutations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for line in format_mutation_lines(&mutations) {
        println!("{line}");
    }
    Ok(())
}
