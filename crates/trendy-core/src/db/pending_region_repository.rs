//! Durable queue of region crossings awaiting a handler

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::columns::{parse_text, timestamp};
use crate::error::Result;
use crate::models::{PendingRegionEvent, RegionCrossing};
use crate::util::to_millis;

/// `SQLite` storage for pending region crossings
pub struct SqlitePendingRegionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqlitePendingRegionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_pending(row: &Row<'_>) -> rusqlite::Result<PendingRegionEvent> {
        Ok(PendingRegionEvent {
            id: row.get(0)?,
            region_id: row.get(1)?,
            crossing: parse_text(row, 2)?,
            occurred_at: timestamp(row, 3)?,
            enqueued_at: timestamp(row, 4)?,
        })
    }

    pub fn push(
        &self,
        region_id: &str,
        crossing: RegionCrossing,
        occurred_at: &DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO pending_region_events (region_id, crossing, occurred_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                region_id,
                crossing.as_str(),
                to_millis(occurred_at),
                to_millis(&Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Every queued crossing, oldest first. Rows stay queued until removed.
    pub fn list(&self) -> Result<Vec<PendingRegionEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, region_id, crossing, occurred_at, enqueued_at
             FROM pending_region_events
             ORDER BY id",
        )?;
        let pending = stmt
            .query_map([], Self::parse_pending)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pending)
    }

    pub fn remove(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM pending_region_events WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_region_events", [], |row| {
                row.get(0)
            })?)
    }
}
