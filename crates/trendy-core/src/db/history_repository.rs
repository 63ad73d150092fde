//! Bounded sync history

#![allow(clippy::cast_possible_wrap)]

use rusqlite::{params, Connection, Row};

use super::columns::{flag, timestamp};
use crate::error::Result;
use crate::models::SyncHistoryEntry;
use crate::util::to_millis;

/// `SQLite` storage for sync history entries
pub struct SqliteHistoryRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteHistoryRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &Row<'_>) -> rusqlite::Result<SyncHistoryEntry> {
        Ok(SyncHistoryEntry {
            id: row.get(0)?,
            started_at: timestamp(row, 1)?,
            duration_ms: row.get(2)?,
            outcome: row.get(3)?,
            pushed: row.get(4)?,
            pulled: row.get(5)?,
            bootstrapped: flag(row, 6)?,
            error: row.get(7)?,
        })
    }

    /// Append an entry and drop the oldest ones beyond `keep`
    pub fn record(&self, entry: &SyncHistoryEntry, keep: usize) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_history
                (started_at, duration_ms, outcome, pushed, pulled, bootstrapped, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                to_millis(&entry.started_at),
                entry.duration_ms,
                entry.outcome,
                entry.pushed,
                entry.pulled,
                i32::from(entry.bootstrapped),
                entry.error,
            ],
        )?;
        self.conn.execute(
            "DELETE FROM sync_history WHERE id NOT IN (
                SELECT id FROM sync_history ORDER BY id DESC LIMIT ?1
             )",
            params![keep as i64],
        )?;
        Ok(())
    }

    /// Most recent entries first
    pub fn recent(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, duration_ms, outcome, pushed, pulled, bootstrapped, error
             FROM sync_history
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Utc;

    fn entry(pushed: i64) -> SyncHistoryEntry {
        SyncHistoryEntry {
            id: 0,
            started_at: Utc::now(),
            duration_ms: 12,
            outcome: "success".to_string(),
            pushed,
            pulled: 0,
            bootstrapped: false,
            error: None,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteHistoryRepository::new(db.connection());

        for pushed in 0..5 {
            repo.record(&entry(pushed), 3).unwrap();
        }

        let recent = repo.recent(10).unwrap();
        let pushed: Vec<_> = recent.iter().map(|e| e.pushed).collect();
        assert_eq!(pushed, vec![4, 3, 2]);
    }
}
