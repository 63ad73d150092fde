//! Event repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::columns::{flag, optional_timestamp, parse_optional_text, parse_text, timestamp};
use crate::error::{Error, Result};
use crate::models::{Event, EventId, EventSource, EventTypeId, GeofenceId, SyncStatus};
use crate::util::to_millis;

const EVENT_COLUMNS: &str = "id, event_type_id, timestamp, end_date, is_all_day, notes, source, \
     external_id, geofence_id, healthkit_sample_id, healthkit_category, properties, sync_status, \
     created_at, updated_at";

/// Trait for event storage operations
pub trait EventRepository {
    /// Insert a new event
    fn insert(&self, event: &Event) -> Result<()>;

    /// Insert or replace an event by id
    fn upsert(&self, event: &Event) -> Result<()>;

    /// Get an event by ID
    fn get(&self, id: &EventId) -> Result<Option<Event>>;

    /// List events, newest first
    fn list(&self, limit: usize, offset: usize) -> Result<Vec<Event>>;

    /// Overwrite all fields of an existing event
    fn update(&self, event: &Event) -> Result<()>;

    /// Delete an event, returning whether a row was removed
    fn delete(&self, id: &EventId) -> Result<bool>;

    /// Find an event by HealthKit sample id
    fn find_by_healthkit_sample(&self, sample_id: &str) -> Result<Option<Event>>;

    /// Find a HealthKit event with the same type and category whose timestamp
    /// lies within `tolerance_ms` (inclusive) of `at`
    fn find_content_match(
        &self,
        event_type_id: &EventTypeId,
        at: &DateTime<Utc>,
        category: Option<&str>,
        tolerance_ms: i64,
    ) -> Result<Option<Event>>;

    /// Most recent geofence entry without an exit, optionally no older than `since`
    fn latest_open_geofence_entry(
        &self,
        geofence_id: &GeofenceId,
        since: Option<&DateTime<Utc>>,
    ) -> Result<Option<Event>>;

    /// All HealthKit sample ids currently stored
    fn healthkit_sample_ids(&self) -> Result<Vec<String>>;

    /// Set the sync status of an event
    fn set_sync_status(&self, id: &EventId, status: SyncStatus) -> Result<()>;

    /// Change an event's id, e.g. after the server upserted it under its own id
    fn replace_id(&self, old: &EventId, new: &EventId) -> Result<()>;

    /// Number of stored events
    fn count(&self) -> Result<i64>;

    /// Ids starting with `prefix`, at most `limit`
    fn ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;
}

/// `SQLite` implementation of `EventRepository`
pub struct SqliteEventRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEventRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an event from a database row
    fn parse_event(row: &Row<'_>) -> rusqlite::Result<Event> {
        let properties: String = row.get(11)?;
        let properties: BTreeMap<String, serde_json::Value> = serde_json::from_str(&properties)
            .map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    11,
                    rusqlite::types::Type::Text,
                    Box::new(error),
                )
            })?;

        Ok(Event {
            id: parse_text(row, 0)?,
            event_type_id: parse_text(row, 1)?,
            timestamp: timestamp(row, 2)?,
            end_date: optional_timestamp(row, 3)?,
            is_all_day: flag(row, 4)?,
            notes: row.get(5)?,
            source: parse_text(row, 6)?,
            external_id: row.get(7)?,
            geofence_id: parse_optional_text(row, 8)?,
            healthkit_sample_id: row.get(9)?,
            healthkit_category: row.get(10)?,
            properties,
            sync_status: parse_text(row, 12)?,
            created_at: timestamp(row, 13)?,
            updated_at: timestamp(row, 14)?,
        })
    }

    fn write(&self, verb: &str, event: &Event) -> Result<()> {
        let properties = serde_json::to_string(&event.properties)?;
        self.conn.execute(
            &format!(
                "{verb} INTO events ({EVENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                event.id.as_str(),
                event.event_type_id.as_str(),
                to_millis(&event.timestamp),
                event.end_date.as_ref().map(to_millis),
                i32::from(event.is_all_day),
                event.notes,
                event.source.as_str(),
                event.external_id,
                event.geofence_id.map(|id| id.as_str()),
                event.healthkit_sample_id,
                event.healthkit_category,
                properties,
                event.sync_status.as_str(),
                to_millis(&event.created_at),
                to_millis(&event.updated_at),
            ],
        )?;
        Ok(())
    }

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Event>> {
        Ok(self
            .conn
            .query_row(sql, params, Self::parse_event)
            .optional()?)
    }
}

impl EventRepository for SqliteEventRepository<'_> {
    fn insert(&self, event: &Event) -> Result<()> {
        self.write("INSERT", event)
    }

    fn upsert(&self, event: &Event) -> Result<()> {
        self.write("INSERT OR REPLACE", event)
    }

    fn get(&self, id: &EventId) -> Result<Option<Event>> {
        self.query_one(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
            params![id.as_str()],
        )
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM events
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1 OFFSET ?2"
        ))?;

        let events = stmt
            .query_map(params![limit as i64, offset as i64], Self::parse_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }

    fn update(&self, event: &Event) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE events SET
                event_type_id = ?2, timestamp = ?3, end_date = ?4, is_all_day = ?5, notes = ?6,
                properties = ?7, sync_status = ?8, updated_at = ?9, geofence_id = ?10
             WHERE id = ?1",
            params![
                event.id.as_str(),
                event.event_type_id.as_str(),
                to_millis(&event.timestamp),
                event.end_date.as_ref().map(to_millis),
                i32::from(event.is_all_day),
                event.notes,
                serde_json::to_string(&event.properties)?,
                event.sync_status.as_str(),
                to_millis(&event.updated_at),
                event.geofence_id.map(|id| id.as_str()),
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("event {}", event.id)));
        }
        Ok(())
    }

    fn delete(&self, id: &EventId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM events WHERE id = ?1", params![id.as_str()])?;
        Ok(rows > 0)
    }

    fn find_by_healthkit_sample(&self, sample_id: &str) -> Result<Option<Event>> {
        self.query_one(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE healthkit_sample_id = ?1 LIMIT 1"
            ),
            params![sample_id],
        )
    }

    fn find_content_match(
        &self,
        event_type_id: &EventTypeId,
        at: &DateTime<Utc>,
        category: Option<&str>,
        tolerance_ms: i64,
    ) -> Result<Option<Event>> {
        let at = to_millis(at);
        // BETWEEN is inclusive on both ends
        self.query_one(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE event_type_id = ?1
                   AND source = ?2
                   AND timestamp BETWEEN ?3 AND ?4
                   AND healthkit_category IS ?5
                 ORDER BY ABS(timestamp - ?6)
                 LIMIT 1"
            ),
            params![
                event_type_id.as_str(),
                EventSource::HealthKit.as_str(),
                at - tolerance_ms,
                at + tolerance_ms,
                category,
                at,
            ],
        )
    }

    fn latest_open_geofence_entry(
        &self,
        geofence_id: &GeofenceId,
        since: Option<&DateTime<Utc>>,
    ) -> Result<Option<Event>> {
        self.query_one(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE geofence_id = ?1
                   AND source = ?2
                   AND end_date IS NULL
                   AND timestamp >= ?3
                 ORDER BY timestamp DESC
                 LIMIT 1"
            ),
            params![
                geofence_id.as_str(),
                EventSource::Geofence.as_str(),
                since.map_or(i64::MIN, to_millis),
            ],
        )
    }

    fn healthkit_sample_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT healthkit_sample_id FROM events WHERE healthkit_sample_id IS NOT NULL")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn set_sync_status(&self, id: &EventId, status: SyncStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE events SET sync_status = ?2 WHERE id = ?1",
            params![id.as_str(), status.as_str()],
        )?;
        Ok(())
    }

    fn replace_id(&self, old: &EventId, new: &EventId) -> Result<()> {
        self.conn.execute(
            "UPDATE events SET id = ?2 WHERE id = ?1",
            params![old.as_str(), new.as_str()],
        )?;
        Ok(())
    }

    fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }

    fn ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let mut stmt = self.conn.prepare(
            "SELECT id FROM events WHERE id LIKE ?1 ESCAPE '\\' ORDER BY id LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![format!("{escaped}%"), limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}
