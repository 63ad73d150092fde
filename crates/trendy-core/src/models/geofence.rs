//! Geofence model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::SyncStatus;
use super::ids::{EventTypeId, GeofenceId};
use crate::error::{Error, Result};

/// Smallest radius the backend accepts, in metres
pub const MIN_RADIUS_METERS: f64 = 50.0;
/// Largest radius the backend accepts, in metres
pub const MAX_RADIUS_METERS: f64 = 10_000.0;

/// A named circular region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    /// Local id, also used as the platform region identifier
    pub id: GeofenceId,
    /// Id assigned by the backend; `None` until the create is acknowledged
    pub server_id: Option<String>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    pub event_type_entry_id: Option<EventTypeId>,
    pub event_type_exit_id: Option<EventTypeId>,
    pub is_active: bool,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Geofence {
    /// Create a new active geofence, validating coordinates and radius
    pub fn new(
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
        radius: f64,
        event_type_entry_id: Option<EventTypeId>,
    ) -> Result<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(Error::InvalidInput(
                "Geofence name cannot be empty".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::InvalidInput(format!(
                "Geofence latitude out of range: {latitude}"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::InvalidInput(format!(
                "Geofence longitude out of range: {longitude}"
            )));
        }
        if !(MIN_RADIUS_METERS..=MAX_RADIUS_METERS).contains(&radius) {
            return Err(Error::InvalidInput(format!(
                "Geofence radius must be between {MIN_RADIUS_METERS} and {MAX_RADIUS_METERS} metres"
            )));
        }

        let now = Utc::now();
        Ok(Self {
            id: GeofenceId::new(),
            server_id: None,
            name,
            latitude,
            longitude,
            radius,
            event_type_entry_id,
            event_type_exit_id: None,
            is_active: true,
            notify_on_entry: false,
            notify_on_exit: false,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    /// Platform region identifier for this geofence
    pub fn region_identifier(&self) -> String {
        self.id.as_str()
    }
}

/// A local edit to a geofence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeofenceEdit {
    pub name: Option<String>,
    pub radius: Option<f64>,
    pub is_active: Option<bool>,
    pub notify_on_entry: Option<bool>,
    pub notify_on_exit: Option<bool>,
}

impl GeofenceEdit {
    pub fn apply(self, geofence: &mut Geofence) {
        if let Some(name) = self.name {
            geofence.name = name;
        }
        if let Some(radius) = self.radius {
            geofence.radius = radius;
        }
        if let Some(is_active) = self.is_active {
            geofence.is_active = is_active;
        }
        if let Some(notify_on_entry) = self.notify_on_entry {
            geofence.notify_on_entry = notify_on_entry;
        }
        if let Some(notify_on_exit) = self.notify_on_exit {
            geofence.notify_on_exit = notify_on_exit;
        }
        geofence.updated_at = Utc::now();
    }
}

/// Direction of a region boundary crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionCrossing {
    Entry,
    Exit,
}

impl RegionCrossing {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }
}

impl std::fmt::Display for RegionCrossing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RegionCrossing {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "entry" => Ok(Self::Entry),
            "exit" => Ok(Self::Exit),
            other => Err(format!("unknown region crossing: {other}")),
        }
    }
}

/// A crossing persisted while no handler was attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRegionEvent {
    pub id: i64,
    pub region_id: String,
    pub crossing: RegionCrossing,
    pub occurred_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}
