use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] trendy_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Event ID cannot be empty")]
    EmptyEventId,
    #[error("Event not found for id/prefix: {0}")]
    EventNotFound(String),
    #[error("{0}")]
    AmbiguousEventId(String),
    #[error("Event type not found: {0}")]
    EventTypeNotFound(String),
    #[error("Invalid timestamp '{0}': expected RFC 3339 (e.g. 2024-05-01T08:30:00Z)")]
    InvalidTimestamp(String),
    #[error("Nothing to change; pass at least one of --notes, --clear-notes, --at, --end, --clear-end")]
    EmptyEdit,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Set TRENDY_API_URL and TRENDY_API_TOKEN, or run `trendy config init --api-url <URL>` and export TRENDY_API_TOKEN."
    )]
    SyncNotConfigured,
}
