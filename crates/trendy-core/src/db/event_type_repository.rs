//! Event type repository implementation

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::columns::{parse_text, timestamp};
use crate::error::{Error, Result};
use crate::models::{EventType, EventTypeId, SyncStatus};
use crate::util::to_millis;

const EVENT_TYPE_COLUMNS: &str = "id, name, color, icon, sync_status, created_at, updated_at";

/// `SQLite` storage for event types
pub struct SqliteEventTypeRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEventTypeRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_event_type(row: &Row<'_>) -> rusqlite::Result<EventType> {
        Ok(EventType {
            id: parse_text(row, 0)?,
            name: row.get(1)?,
            color: row.get(2)?,
            icon: row.get(3)?,
            sync_status: parse_text(row, 4)?,
            created_at: timestamp(row, 5)?,
            updated_at: timestamp(row, 6)?,
        })
    }

    /// Insert or replace an event type by id
    pub fn upsert(&self, event_type: &EventType) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO event_types ({EVENT_TYPE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                event_type.id.as_str(),
                event_type.name,
                event_type.color,
                event_type.icon,
                event_type.sync_status.as_str(),
                to_millis(&event_type.created_at),
                to_millis(&event_type.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &EventTypeId) -> Result<Option<EventType>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {EVENT_TYPE_COLUMNS} FROM event_types WHERE id = ?1"),
                params![id.as_str()],
                Self::parse_event_type,
            )
            .optional()?)
    }

    /// Find an event type by case-insensitive name
    pub fn find_by_name(&self, name: &str) -> Result<Option<EventType>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {EVENT_TYPE_COLUMNS} FROM event_types
                     WHERE name = ?1 COLLATE NOCASE
                     ORDER BY created_at
                     LIMIT 1"
                ),
                params![name.trim()],
                Self::parse_event_type,
            )
            .optional()?)
    }

    /// List event types alphabetically
    pub fn list(&self) -> Result<Vec<EventType>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_TYPE_COLUMNS} FROM event_types ORDER BY name COLLATE NOCASE"
        ))?;
        let event_types = stmt
            .query_map([], Self::parse_event_type)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(event_types)
    }

    pub fn update(&self, event_type: &EventType) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE event_types SET name = ?2, color = ?3, icon = ?4, sync_status = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                event_type.id.as_str(),
                event_type.name,
                event_type.color,
                event_type.icon,
                event_type.sync_status.as_str(),
                to_millis(&event_type.updated_at),
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("event type {}", event_type.id)));
        }
        Ok(())
    }

    pub fn delete(&self, id: &EventTypeId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM event_types WHERE id = ?1", params![id.as_str()])?;
        Ok(rows > 0)
    }

    pub fn set_sync_status(&self, id: &EventTypeId, status: SyncStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE event_types SET sync_status = ?2 WHERE id = ?1",
            params![id.as_str(), status.as_str()],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM event_types", [], |row| row.get(0))?)
    }
}
