//! JSON bodies exchanged with the Trendy backend under `/api/v1`

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    Event, EventEdit, EventId, EventSource, EventType, EventTypeEdit, EventTypeId, Geofence,
    GeofenceEdit, Patch, SyncStatus,
};

/// Event as returned by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDto {
    pub id: EventId,
    pub event_type_id: EventTypeId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default)]
    pub external_id: Option<String>,
    /// Server geofence id
    #[serde(default)]
    pub geofence_id: Option<String>,
    #[serde(default)]
    pub healthkit_sample_id: Option<String>,
    #[serde(default)]
    pub healthkit_category: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_source_type() -> String {
    EventSource::Manual.as_str().to_string()
}

impl EventDto {
    /// Convert into a synced local event.
    ///
    /// `geofence_id` must already be translated to the local id.
    pub fn into_event(self, geofence_id: Option<crate::models::GeofenceId>) -> Event {
        let now = Utc::now();
        Event {
            id: self.id,
            event_type_id: self.event_type_id,
            timestamp: self.timestamp,
            end_date: self.end_date,
            is_all_day: self.is_all_day,
            notes: self.notes,
            source: self.source_type.parse().unwrap_or(EventSource::Manual),
            external_id: self.external_id,
            geofence_id,
            healthkit_sample_id: self.healthkit_sample_id,
            healthkit_category: self.healthkit_category,
            properties: self.properties,
            sync_status: SyncStatus::Synced,
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at.unwrap_or(now),
        }
    }
}

/// Body of `POST /events` and one element of a batch create.
///
/// The client id travels with the request so the server keeps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEventRequest {
    pub id: EventId,
    pub event_type_id: EventTypeId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Local geofence id while queued, server geofence id once sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthkit_sample_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthkit_category: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl From<&Event> for CreateEventRequest {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            event_type_id: event.event_type_id,
            timestamp: event.timestamp,
            notes: event.notes.clone(),
            is_all_day: event.is_all_day,
            end_date: event.end_date,
            source_type: event.source.as_str().to_string(),
            external_id: event.external_id.clone(),
            geofence_id: event.geofence_id.map(|id| id.as_str()),
            healthkit_sample_id: event.healthkit_sample_id.clone(),
            healthkit_category: event.healthkit_category.clone(),
            properties: event.properties.clone(),
        }
    }
}

/// Body of `PUT /events/{id}`; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateEventRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type_id: Option<EventTypeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub notes: Patch<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_all_day: Option<bool>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub end_date: Patch<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

impl From<&EventEdit> for UpdateEventRequest {
    fn from(edit: &EventEdit) -> Self {
        Self {
            event_type_id: edit.event_type_id,
            timestamp: edit.timestamp,
            notes: edit.notes.clone(),
            is_all_day: edit.is_all_day,
            end_date: edit.end_date.clone(),
            properties: edit.properties.clone(),
        }
    }
}

/// Event type as exchanged with the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeDto {
    pub id: EventTypeId,
    pub name: String,
    pub color: String,
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EventTypeDto {
    pub fn into_event_type(self) -> EventType {
        let now = Utc::now();
        EventType {
            id: self.id,
            name: self.name,
            color: self.color,
            icon: self.icon,
            sync_status: SyncStatus::Synced,
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at.unwrap_or(now),
        }
    }
}

impl From<&EventType> for EventTypeDto {
    fn from(event_type: &EventType) -> Self {
        Self {
            id: event_type.id,
            name: event_type.name.clone(),
            color: event_type.color.clone(),
            icon: event_type.icon.clone(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Body of `PUT /event-types/{id}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEventTypeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl From<&EventTypeEdit> for UpdateEventTypeRequest {
    fn from(edit: &EventTypeEdit) -> Self {
        Self {
            name: edit.name.clone(),
            color: edit.color.clone(),
            icon: edit.icon.clone(),
        }
    }
}

/// Geofence as returned by the server; `id` is the server id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceDto {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    #[serde(default)]
    pub event_type_entry_id: Option<EventTypeId>,
    #[serde(default)]
    pub event_type_exit_id: Option<EventTypeId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub notify_on_entry: bool,
    #[serde(default)]
    pub notify_on_exit: bool,
}

const fn default_true() -> bool {
    true
}

impl GeofenceDto {
    /// Merge server state into an existing local geofence, or build a new one
    pub fn into_geofence(self, existing: Option<Geofence>) -> Geofence {
        let now = Utc::now();
        let (id, created_at) = existing.map_or_else(
            || (crate::models::GeofenceId::new(), now),
            |geofence| (geofence.id, geofence.created_at),
        );
        Geofence {
            id,
            server_id: Some(self.id),
            name: self.name,
            latitude: self.latitude,
            longitude: self.longitude,
            radius: self.radius,
            event_type_entry_id: self.event_type_entry_id,
            event_type_exit_id: self.event_type_exit_id,
            is_active: self.is_active,
            notify_on_entry: self.notify_on_entry,
            notify_on_exit: self.notify_on_exit,
            sync_status: SyncStatus::Synced,
            created_at,
            updated_at: now,
        }
    }
}

/// Body of `POST /geofences`; the server assigns the id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateGeofenceRequest {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type_entry_id: Option<EventTypeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type_exit_id: Option<EventTypeId>,
    pub is_active: bool,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
}

impl From<&Geofence> for CreateGeofenceRequest {
    fn from(geofence: &Geofence) -> Self {
        Self {
            name: geofence.name.clone(),
            latitude: geofence.latitude,
            longitude: geofence.longitude,
            radius: geofence.radius,
            event_type_entry_id: geofence.event_type_entry_id,
            event_type_exit_id: geofence.event_type_exit_id,
            is_active: geofence.is_active,
            notify_on_entry: geofence.notify_on_entry,
            notify_on_exit: geofence.notify_on_exit,
        }
    }
}

/// Body of `PUT /geofences/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateGeofenceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_on_entry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_on_exit: Option<bool>,
}

impl From<&GeofenceEdit> for UpdateGeofenceRequest {
    fn from(edit: &GeofenceEdit) -> Self {
        Self {
            name: edit.name.clone(),
            radius: edit.radius,
            is_active: edit.is_active,
            notify_on_entry: edit.notify_on_entry,
            notify_on_exit: edit.notify_on_exit,
        }
    }
}

/// Body of `POST /events/batch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCreateEventsRequest {
    pub events: Vec<CreateEventRequest>,
}

/// Per-item failure inside a batch create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub index: usize,
    pub message: String,
}

/// Response of `POST /events/batch`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchCreateEventsResponse {
    #[serde(default)]
    pub created: Vec<EventDto>,
    #[serde(default)]
    pub errors: Vec<BatchError>,
    #[serde(default)]
    pub total: usize,
}

/// Kind of record a change-feed entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEntityType {
    Event,
    EventType,
    Geofence,
    /// Entity kinds this client does not track
    #[serde(other)]
    Unknown,
}

/// Change-feed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// One entry of `GET /changes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: i64,
    pub entity_type: ChangeEntityType,
    pub operation: ChangeOperation,
    pub entity_id: String,
    /// Full entity for create/update
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Response of `GET /changes?since=&limit=`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedResponse {
    #[serde(default)]
    pub changes: Vec<ChangeEntry>,
    pub next_cursor: i64,
    #[serde(default)]
    pub has_more: bool,
}

/// Response of `GET /changes/latest-cursor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestCursorResponse {
    pub cursor: i64,
}
