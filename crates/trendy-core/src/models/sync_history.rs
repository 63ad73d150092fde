//! Sync history model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded sync cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    /// History row identifier
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// `success`, `error` or `cancelled`
    pub outcome: String,
    pub pushed: i64,
    pub pulled: i64,
    pub bootstrapped: bool,
    pub error: Option<String>,
}
