//! Geofence repository implementation

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::columns::{flag, parse_optional_text, parse_text, timestamp};
use crate::error::{Error, Result};
use crate::models::{Geofence, GeofenceId, SyncStatus};
use crate::util::to_millis;

const GEOFENCE_COLUMNS: &str = "id, server_id, name, latitude, longitude, radius, \
     event_type_entry_id, event_type_exit_id, is_active, notify_on_entry, notify_on_exit, \
     sync_status, created_at, updated_at";

/// `SQLite` storage for geofences
pub struct SqliteGeofenceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteGeofenceRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_geofence(row: &Row<'_>) -> rusqlite::Result<Geofence> {
        Ok(Geofence {
            id: parse_text(row, 0)?,
            server_id: row.get(1)?,
            name: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            radius: row.get(5)?,
            event_type_entry_id: parse_optional_text(row, 6)?,
            event_type_exit_id: parse_optional_text(row, 7)?,
            is_active: flag(row, 8)?,
            notify_on_entry: flag(row, 9)?,
            notify_on_exit: flag(row, 10)?,
            sync_status: parse_text(row, 11)?,
            created_at: timestamp(row, 12)?,
            updated_at: timestamp(row, 13)?,
        })
    }

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Geofence>> {
        Ok(self
            .conn
            .query_row(sql, params, Self::parse_geofence)
            .optional()?)
    }

    /// Insert or replace a geofence by local id
    pub fn upsert(&self, geofence: &Geofence) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO geofences ({GEOFENCE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                geofence.id.as_str(),
                geofence.server_id,
                geofence.name,
                geofence.latitude,
                geofence.longitude,
                geofence.radius,
                geofence.event_type_entry_id.map(|id| id.as_str()),
                geofence.event_type_exit_id.map(|id| id.as_str()),
                i32::from(geofence.is_active),
                i32::from(geofence.notify_on_entry),
                i32::from(geofence.notify_on_exit),
                geofence.sync_status.as_str(),
                to_millis(&geofence.created_at),
                to_millis(&geofence.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &GeofenceId) -> Result<Option<Geofence>> {
        self.query_one(
            &format!("SELECT {GEOFENCE_COLUMNS} FROM geofences WHERE id = ?1"),
            params![id.as_str()],
        )
    }

    pub fn get_by_server_id(&self, server_id: &str) -> Result<Option<Geofence>> {
        self.query_one(
            &format!("SELECT {GEOFENCE_COLUMNS} FROM geofences WHERE server_id = ?1"),
            params![server_id],
        )
    }

    /// Resolve a region identifier, which may be a local id or a server id
    pub fn resolve(&self, region_id: &str) -> Result<Option<Geofence>> {
        if let Ok(id) = region_id.parse::<GeofenceId>() {
            if let Some(geofence) = self.get(&id)? {
                return Ok(Some(geofence));
            }
        }
        self.get_by_server_id(region_id)
    }

    pub fn list(&self, active_only: bool) -> Result<Vec<Geofence>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {GEOFENCE_COLUMNS} FROM geofences
             WHERE ?1 = 0 OR is_active = 1
             ORDER BY name COLLATE NOCASE"
        ))?;
        let geofences = stmt
            .query_map(params![i32::from(active_only)], Self::parse_geofence)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(geofences)
    }

    pub fn update(&self, geofence: &Geofence) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE geofences SET name = ?2, latitude = ?3, longitude = ?4, radius = ?5,
                event_type_entry_id = ?6, event_type_exit_id = ?7, is_active = ?8,
                notify_on_entry = ?9, notify_on_exit = ?10, sync_status = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                geofence.id.as_str(),
                geofence.name,
                geofence.latitude,
                geofence.longitude,
                geofence.radius,
                geofence.event_type_entry_id.map(|id| id.as_str()),
                geofence.event_type_exit_id.map(|id| id.as_str()),
                i32::from(geofence.is_active),
                i32::from(geofence.notify_on_entry),
                i32::from(geofence.notify_on_exit),
                geofence.sync_status.as_str(),
                to_millis(&geofence.updated_at),
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("geofence {}", geofence.id)));
        }
        Ok(())
    }

    pub fn delete(&self, id: &GeofenceId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM geofences WHERE id = ?1", params![id.as_str()])?;
        Ok(rows > 0)
    }

    /// Record the id the server assigned to a locally created geofence
    pub fn set_server_id(&self, id: &GeofenceId, server_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE geofences SET server_id = ?2, sync_status = ?3 WHERE id = ?1",
            params![id.as_str(), server_id, SyncStatus::Synced.as_str()],
        )?;
        Ok(())
    }

    pub fn set_sync_status(&self, id: &GeofenceId, status: SyncStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE geofences SET sync_status = ?2 WHERE id = ?1",
            params![id.as_str(), status.as_str()],
        )?;
        Ok(())
    }
}
