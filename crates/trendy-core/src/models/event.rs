//! Event model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EventId, EventTypeId, GeofenceId};
use super::patch::Patch;

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Entered by the user
    #[default]
    Manual,
    /// Imported from a calendar
    Imported,
    /// Recorded from a region crossing
    Geofence,
    /// Recorded from a health sample
    #[serde(rename = "healthkit")]
    HealthKit,
}

impl EventSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Imported => "imported",
            Self::Geofence => "geofence",
            Self::HealthKit => "healthkit",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "imported" => Ok(Self::Imported),
            "geofence" => Ok(Self::Geofence),
            "healthkit" => Ok(Self::HealthKit),
            other => Err(format!("unknown event source: {other}")),
        }
    }
}

/// Local sync status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local write not yet acknowledged by the server
    #[default]
    Pending,
    /// Matches the server
    Synced,
    /// Outbound mutation exceeded its retry ceiling
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// A timestamped user activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type_id: EventTypeId,
    pub timestamp: DateTime<Utc>,
    /// End of a multi-day/all-day event, or exit time of a geofence visit
    pub end_date: Option<DateTime<Utc>>,
    pub is_all_day: bool,
    pub notes: Option<String>,
    pub source: EventSource,
    /// Calendar identifier for imported events
    pub external_id: Option<String>,
    /// Local geofence id for geofence events
    pub geofence_id: Option<GeofenceId>,
    pub healthkit_sample_id: Option<String>,
    pub healthkit_category: Option<String>,
    /// Free-form attributes (e.g. heart-rate enrichment)
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Create a new manual event at the given time
    #[must_use]
    pub fn new(event_type_id: EventTypeId, timestamp: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            event_type_id,
            timestamp,
            end_date: None,
            is_all_day: false,
            notes: None,
            source: EventSource::Manual,
            external_id: None,
            geofence_id: None,
            healthkit_sample_id: None,
            healthkit_category: None,
            properties: BTreeMap::new(),
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Whether this is a geofence entry still waiting for its exit
    pub fn is_open_geofence_entry(&self) -> bool {
        self.source == EventSource::Geofence && self.end_date.is_none()
    }
}

/// A local edit to an existing event.
///
/// Nullable fields use [`Patch`] so that clearing a value is an explicit edit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventEdit {
    pub event_type_id: Option<EventTypeId>,
    pub timestamp: Option<DateTime<Utc>>,
    pub end_date: Patch<DateTime<Utc>>,
    pub is_all_day: Option<bool>,
    pub notes: Patch<String>,
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

impl EventEdit {
    /// Whether the edit changes nothing
    pub const fn is_empty(&self) -> bool {
        self.event_type_id.is_none()
            && self.timestamp.is_none()
            && self.end_date.is_absent()
            && self.is_all_day.is_none()
            && self.notes.is_absent()
            && self.properties.is_none()
    }

    /// Apply the edit to an event, bumping `updated_at`
    pub fn apply(self, event: &mut Event) {
        if let Some(event_type_id) = self.event_type_id {
            event.event_type_id = event_type_id;
        }
        if let Some(timestamp) = self.timestamp {
            event.timestamp = timestamp;
        }
        self.end_date.apply_to(&mut event.end_date);
        if let Some(is_all_day) = self.is_all_day {
            event.is_all_day = is_all_day;
        }
        self.notes.apply_to(&mut event.notes);
        if let Some(properties) = self.properties {
            event.properties = properties;
        }
        event.updated_at = Utc::now();
    }
}
