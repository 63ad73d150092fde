use trendy_core::{EventType, LocalStore};

use crate::cli::TypeCommands;
use crate::error::CliError;

pub async fn run_types(command: TypeCommands, store: &LocalStore) -> Result<(), CliError> {
    match command {
        TypeCommands::List { json } => {
            let event_types = store.list_event_types().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&event_types)?);
            } else if event_types.is_empty() {
                println!("No event types yet. Create one with `trendy types add <NAME>`.");
            } else {
                for event_type in &event_types {
                    println!(
                        "{}  {:<20}  {}  {}",
                        event_type.id, event_type.name, event_type.color, event_type.icon
                    );
                }
            }
            Ok(())
        }
        TypeCommands::Add { name, color, icon } => {
            let event_type = EventType::new(name, color, icon)?;
            store.create_event_type(&event_type).await?;
            println!("{}", event_type.id);
            Ok(())
        }
    }
}
