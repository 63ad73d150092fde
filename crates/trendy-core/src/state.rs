//! Sync state published to UI-facing observers.

use serde::Serialize;

/// Phase of an in-flight sync cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Preparing,
    Flushing,
    Pulling,
    Bootstrapping,
}

/// Progress of an in-flight sync cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub completed: usize,
    pub total: usize,
}

impl SyncProgress {
    pub const fn new(phase: SyncPhase) -> Self {
        Self {
            phase,
            completed: 0,
            total: 0,
        }
    }
}

/// Sync engine state machine.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing(SyncProgress),
    Error { message: String },
}

impl SyncState {
    pub const fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing(_))
    }
}
