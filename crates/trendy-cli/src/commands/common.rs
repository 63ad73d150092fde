use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use trendy_core::models::{PendingMutation, SyncHistoryEntry, SyncStatus};
use trendy_core::util::normalize_text_option;
use trendy_core::{
    Event, EventId, EventType, EventTypeId, HttpRemoteApi, LocalStore, NoopExtender,
    SyncCoordinator, TrendyConfig,
};

use crate::error::CliError;

const SHORT_ID_LEN: usize = 13;

#[derive(Debug, Serialize)]
pub struct EventListItem {
    pub id: String,
    pub event_type: String,
    pub timestamp: String,
    pub end_date: Option<String>,
    pub is_all_day: bool,
    pub notes: Option<String>,
    pub source: String,
    pub sync_status: String,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct MutationListItem {
    pub id: i64,
    pub entity: String,
    pub operation: String,
    pub entity_id: String,
    pub status: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: String,
}

pub fn resolve_config_path(cli_config_path: Option<PathBuf>) -> PathBuf {
    cli_config_path
        .or_else(|| std::env::var_os("TRENDY_CONFIG").map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trendy")
        .join("config.json")
}

pub fn load_config(config_path: &Path) -> Result<TrendyConfig, CliError> {
    Ok(TrendyConfig::load(Some(config_path))?)
}

/// Explicit flag first, then the configured path (file or `TRENDY_DB_PATH`)
pub fn resolve_db_path(cli_db_path: Option<PathBuf>, config: &TrendyConfig) -> PathBuf {
    cli_db_path
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trendy")
        .join("trendy.db")
}

pub fn open_store(db_path: &Path) -> Result<LocalStore, CliError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(LocalStore::open(db_path)?)
}

pub fn build_coordinator(
    store: LocalStore,
    config: &TrendyConfig,
) -> Result<SyncCoordinator, CliError> {
    let (Some(base_url), Some(token)) = (
        normalize_text_option(config.api_base_url.clone()),
        normalize_text_option(config.api_token.clone()),
    ) else {
        return Err(CliError::SyncNotConfigured);
    };

    let api = HttpRemoteApi::new(base_url, token, config.sync.request_timeout())?;
    Ok(SyncCoordinator::new(
        store,
        Arc::new(api),
        config,
        Arc::new(NoopExtender),
    ))
}

pub fn normalize_event_identifier(raw: &str) -> Result<String, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyEventId);
    }
    Ok(trimmed.to_ascii_lowercase())
}

pub async fn resolve_event(event_query: &str, store: &LocalStore) -> Result<Event, CliError> {
    if let Ok(event_id) = event_query.parse::<EventId>() {
        if let Some(event) = store.get_event(&event_id).await? {
            return Ok(event);
        }
    }

    let matching_ids = store.event_ids_by_prefix(event_query, 3).await?;

    match matching_ids.len() {
        0 => Err(CliError::EventNotFound(event_query.to_string())),
        1 => {
            let resolved_id = matching_ids[0]
                .parse::<EventId>()
                .map_err(|_| CliError::EventNotFound(event_query.to_string()))?;
            store
                .get_event(&resolved_id)
                .await?
                .ok_or_else(|| CliError::EventNotFound(event_query.to_string()))
        }
        _ => {
            let options = matching_ids
                .iter()
                .map(|id| short_id(id))
                .collect::<Vec<_>>()
                .join(", ");

            Err(CliError::AmbiguousEventId(format!(
                "ID prefix '{event_query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

/// Look an event type up by ID, falling back to a case-insensitive name match
pub async fn resolve_event_type(query: &str, store: &LocalStore) -> Result<EventType, CliError> {
    let query = query.trim();
    if let Ok(type_id) = query.parse::<EventTypeId>() {
        if let Some(event_type) = store.get_event_type(&type_id).await? {
            return Ok(event_type);
        }
    }

    store
        .find_event_type_by_name(query)
        .await?
        .ok_or_else(|| CliError::EventTypeNotFound(query.to_string()))
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CliError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|value| value.with_timezone(&Utc))
        .map_err(|_| CliError::InvalidTimestamp(raw.to_string()))
}

pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn notes_preview(notes: Option<&str>, max_chars: usize) -> String {
    let Some(notes) = notes else {
        return String::new();
    };
    let single_line = notes.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let mut preview = single_line
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    preview.push_str("...");
    preview
}

pub async fn event_type_names(
    store: &LocalStore,
) -> Result<HashMap<EventTypeId, String>, CliError> {
    Ok(store
        .list_event_types()
        .await?
        .into_iter()
        .map(|event_type| (event_type.id, event_type.name))
        .collect())
}

fn type_label(event: &Event, type_names: &HashMap<EventTypeId, String>) -> String {
    type_names
        .get(&event.event_type_id)
        .cloned()
        .unwrap_or_else(|| short_id(&event.event_type_id.to_string()))
}

pub fn format_event_lines(
    events: &[Event],
    type_names: &HashMap<EventTypeId, String>,
) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    events
        .iter()
        .map(|event| {
            let short_id = short_id(&event.id.to_string());
            let type_label = type_label(event, type_names);
            let relative_time = format_relative_time(event.timestamp.timestamp_millis(), now_ms);
            let preview = notes_preview(event.notes.as_deref(), 40);
            let pending = if event.sync_status == SyncStatus::Synced {
                ""
            } else {
                " *"
            };

            if preview.is_empty() {
                format!("{short_id:<13}  {type_label:<16}  {relative_time}{pending}")
            } else {
                format!("{short_id:<13}  {type_label:<16}  {relative_time:<10}  {preview}{pending}")
            }
        })
        .collect()
}

pub fn event_to_list_item(event: &Event, type_names: &HashMap<EventTypeId, String>) -> EventListItem {
    let now_ms = Utc::now().timestamp_millis();
    EventListItem {
        id: event.id.to_string(),
        event_type: type_label(event, type_names),
        timestamp: event.timestamp.to_rfc3339(),
        end_date: event.end_date.map(|end| end.to_rfc3339()),
        is_all_day: event.is_all_day,
        notes: event.notes.clone(),
        source: event.source.as_str().to_string(),
        sync_status: event.sync_status.as_str().to_string(),
        relative_time: format_relative_time(event.timestamp.timestamp_millis(), now_ms),
    }
}

pub fn mutation_to_list_item(mutation: &PendingMutation) -> MutationListItem {
    MutationListItem {
        id: mutation.id,
        entity: mutation.entity.as_str().to_string(),
        operation: mutation.operation.as_str().to_string(),
        entity_id: mutation.entity_id.clone(),
        status: mutation.status.as_str().to_string(),
        attempts: mutation.attempts,
        last_error: mutation.last_error.clone(),
        created_at: mutation.created_at.to_rfc3339(),
    }
}

pub fn format_mutation_lines(mutations: &[PendingMutation]) -> Vec<String> {
    mutations
        .iter()
        .map(|mutation| {
            let target = format!(
                "{} {}",
                mutation.operation.as_str(),
                mutation.entity.as_str()
            );
            let base = format!(
                "#{:<6} {target:<20} {:<13}  {:<9} attempts={}",
                mutation.id,
                short_id(&mutation.entity_id),
                mutation.status.as_str(),
                mutation.attempts,
            );
            match &mutation.last_error {
                Some(error) => format!("{base}  {}", notes_preview(Some(error), 60)),
                None => base,
            }
        })
        .collect()
}

pub fn format_history_lines(entries: &[SyncHistoryEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let mode = if entry.bootstrapped { "bootstrap" } else { "incremental" };
            let base = format!(
                "{}  {:<9}  {mode:<11}  pushed={} pulled={} ({} ms)",
                format_timestamp(&entry.started_at),
                entry.outcome,
                entry.pushed,
                entry.pulled,
                entry.duration_ms,
            );
            match &entry.error {
                Some(error) => format!("{base}  {error}"),
                None => base,
            }
        })
        .collect()
}
