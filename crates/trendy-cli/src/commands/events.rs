use trendy_core::models::{EventEdit, Patch};
use trendy_core::{Event, LocalStore};

use crate::cli::EventCommands;
use crate::commands::common::{
    event_to_list_item, event_type_names, format_event_lines, normalize_event_identifier,
    parse_timestamp, resolve_event, resolve_event_type, EventListItem,
};
use crate::error::CliError;

pub async fn run_events(command: EventCommands, store: &LocalStore) -> Result<(), CliError> {
    match command {
        EventCommands::List { limit, json } => run_list(limit, json, store).await,
        EventCommands::Add {
            event_type,
            notes,
            at,
            end,
            all_day,
        } => {
            run_add(
                &event_type,
                notes,
                at.as_deref(),
                end.as_deref(),
                all_day,
                store,
            )
            .await
        }
        EventCommands::Edit {
            id,
            notes,
            clear_notes,
            at,
            end,
            clear_end,
        } => {
            let edit = build_event_edit(notes, clear_notes, at.as_deref(), end.as_deref(), clear_end)?;
            run_edit(&id, &edit, store).await
        }
        EventCommands::Delete { id } => run_delete(&id, store).await,
    }
}

async fn run_list(limit: usize, as_json: bool, store: &LocalStore) -> Result<(), CliError> {
    let events = store.list_events(limit, 0).await?;
    let type_names = event_type_names(store).await?;

    if as_json {
        let json_items = events
            .iter()
            .map(|event| event_to_list_item(event, &type_names))
            .collect::<Vec<EventListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        for line in format_event_lines(&events, &type_names) {
            println!("{line}");
        }
    }

    Ok(())
}

async fn run_add(
    event_type: &str,
    notes: Option<String>,
    at: Option<&str>,
    end: Option<&str>,
    all_day: bool,
    store: &LocalStore,
) -> Result<(), CliError> {
    let event_type = resolve_event_type(event_type, store).await?;
    let timestamp = at.map(parse_timestamp).transpose()?.unwrap_or_else(chrono::Utc::now);

    let mut event = Event::new(event_type.id, timestamp);
    event.notes = trendy_core::util::normalize_text_option(notes);
    event.end_date = end.map(parse_timestamp).transpose()?;
    event.is_all_day = all_day;

    store.create_event(&event).await?;
    println!("{}", event.id);
    Ok(())
}

pub fn build_event_edit(
    notes: Option<String>,
    clear_notes: bool,
    at: Option<&str>,
    end: Option<&str>,
    clear_end: bool,
) -> Result<EventEdit, CliError> {
    let notes = match (notes, clear_notes) {
        (_, true) => Patch::Null,
        (Some(notes), false) => Patch::Value(notes),
        (None, false) => Patch::Absent,
    };
    let end_date = match (end, clear_end) {
        (_, true) => Patch::Null,
        (Some(end), false) => Patch::Value(parse_timestamp(end)?),
        (None, false) => Patch::Absent,
    };

    let edit = EventEdit {
        timestamp: at.map(parse_timestamp).transpose()?,
        end_date,
        notes,
        ..EventEdit::default()
    };
    if edit.is_empty() {
        return Err(CliError::EmptyEdit);
    }
    Ok(edit)
}

async fn run_edit(id: &str, edit: &EventEdit, store: &LocalStore) -> Result<(), CliError> {
    let normalized_id = normalize_event_identifier(id)?;
    let event = resolve_event(&normalized_id, store).await?;

    store.update_event(&event.id, edit).await?;
    println!("{}", event.id);
    Ok(())
}

async fn run_delete(id: &str, store: &LocalStore) -> Result<(), CliError> {
    let normalized_id = normalize_event_identifier(id)?;
    let event = resolve_event(&normalized_id, store).await?;

    store.delete_event(&event.id).await?;
    println!("{}", event.id);
    Ok(())
}
