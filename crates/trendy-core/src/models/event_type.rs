//! Event type model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::SyncStatus;
use super::ids::EventTypeId;
use crate::error::{Error, Result};

/// A user-defined category of events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub id: EventTypeId,
    pub name: String,
    /// Hex color, e.g. `#FF9500`
    pub color: String,
    /// Icon name
    pub icon: String,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventType {
    /// Create a new event type, trimming and validating its fields
    pub fn new(
        name: impl Into<String>,
        color: impl Into<String>,
        icon: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into().trim().to_string();
        let color = color.into().trim().to_string();
        let icon = icon.into().trim().to_string();

        if name.is_empty() {
            return Err(Error::InvalidInput(
                "Event type name cannot be empty".to_string(),
            ));
        }
        if color.is_empty() {
            return Err(Error::InvalidInput(
                "Event type color cannot be empty".to_string(),
            ));
        }
        if icon.is_empty() {
            return Err(Error::InvalidInput(
                "Event type icon cannot be empty".to_string(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: EventTypeId::new(),
            name,
            color,
            icon,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A local edit to an event type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTypeEdit {
    pub name: Option<String>,
    pub color: Option<String>,
    pub icon: Option<String>,
}

impl EventTypeEdit {
    pub fn apply(self, event_type: &mut EventType) {
        if let Some(name) = self.name {
            event_type.name = name;
        }
        if let Some(color) = self.color {
            event_type.color = color;
        }
        if let Some(icon) = self.icon {
            event_type.icon = icon;
        }
        event_type.updated_at = Utc::now();
    }
}
