//! Error types for trendy-core

use thiserror::Error;

use crate::sync::ApiError;

/// Result type alias using trendy-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in trendy-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The cached store handle is no longer usable
    #[error("Stale database handle: {0}")]
    StaleHandle(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote API error
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sync cycle failed (reported to callers that joined an in-flight cycle)
    #[error("Sync failed: {0}")]
    SyncFailed(String),

    /// Sync cycle was cancelled by a reset, queue clear or resume
    #[error("Sync cancelled")]
    Cancelled,

    /// Platform collaborator (HealthKit, region monitoring) failed
    #[error("Platform error: {0}")]
    Platform(String),
}

impl Error {
    /// Whether this error indicates the cached store handle must be recreated.
    ///
    /// `SQLite` reports invalidated file handles through a handful of messages
    /// rather than a single code, so the check is pattern based.
    pub fn is_stale_handle(&self) -> bool {
        match self {
            Self::StaleHandle(_) => true,
            Self::Sqlite(_) | Self::Database(_) | Self::Io(_) => {
                let message = self.to_string().to_ascii_lowercase();
                STALE_HANDLE_PATTERNS
                    .iter()
                    .any(|pattern| message.contains(pattern))
            }
            _ => false,
        }
    }
}

const STALE_HANDLE_PATTERNS: &[&str] = &[
    "unable to open database file",
    "disk i/o error",
    "couldn't be opened",
    "attempt to write a readonly database",
    "database handle was released",
    "bad file descriptor",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_stale_handle_messages() {
        assert!(Error::StaleHandle("released".to_string()).is_stale_handle());
        assert!(
            Error::Database("The file “trendy.store” couldn't be opened.".to_string())
                .is_stale_handle()
        );
        assert!(Error::Database("disk I/O error".to_string()).is_stale_handle());
        assert!(!Error::InvalidInput("unable to open database file".to_string()).is_stale_handle());
        assert!(!Error::NotFound("event".to_string()).is_stale_handle());
    }
}
