//! Pending outbound mutation model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of record a mutation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationEntity {
    Event,
    EventType,
    Geofence,
}

impl MutationEntity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::EventType => "event_type",
            Self::Geofence => "geofence",
        }
    }
}

impl FromStr for MutationEntity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(Self::Event),
            "event_type" => Ok(Self::EventType),
            "geofence" => Ok(Self::Geofence),
            other => Err(format!("unknown mutation entity: {other}")),
        }
    }
}

/// Operation carried by a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

impl MutationOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for MutationOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown mutation operation: {other}")),
        }
    }
}

/// Queue status of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Waiting to be flushed
    Pending,
    /// Exceeded the retry ceiling; kept until the user clears or retries it
    Failed,
}

impl MutationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown mutation status: {other}")),
        }
    }
}

/// A local write awaiting server acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Queue position (autoincrement, defines FIFO order)
    pub id: i64,
    pub entity: MutationEntity,
    pub operation: MutationOperation,
    pub entity_id: String,
    /// Serialized wire request
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: MutationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sent with every attempt so the server applies a retried write once
    pub idempotency_key: String,
}

impl PendingMutation {
    pub fn is_event_create(&self) -> bool {
        self.entity == MutationEntity::Event && self.operation == MutationOperation::Create
    }
}

impl fmt::Display for PendingMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {}",
            self.id,
            self.operation.as_str(),
            self.entity.as_str(),
            self.entity_id
        )
    }
}

/// A mutation about to be appended to the queue
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub entity: MutationEntity,
    pub operation: MutationOperation,
    pub entity_id: String,
    pub payload: serde_json::Value,
}

impl NewMutation {
    pub fn new(
        entity: MutationEntity,
        operation: MutationOperation,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity,
            operation,
            entity_id: entity_id.into(),
            payload,
        }
    }
}
