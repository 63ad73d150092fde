//! Sync state repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

const CURSOR_KEY: &str = "cursor";

/// Trait for sync bookkeeping storage operations
pub trait SyncStateRepository {
    /// Change-feed cursor; 0 means a bootstrap is required
    fn cursor(&self) -> Result<i64>;

    /// Persist the change-feed cursor
    fn set_cursor(&self, cursor: i64) -> Result<()>;

    /// Opaque HealthKit query anchor for a category
    fn anchor(&self, category: &str) -> Result<Option<String>>;

    /// Persist a HealthKit query anchor for a category
    fn set_anchor(&self, category: &str, anchor: &str) -> Result<()>;
}

/// `SQLite` implementation of `SyncStateRepository`
pub struct SqliteSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSyncStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

fn anchor_key(category: &str) -> String {
    format!("healthkit_anchor:{category}")
}

impl SyncStateRepository for SqliteSyncStateRepository<'_> {
    fn cursor(&self) -> Result<i64> {
        Ok(self
            .get_value(CURSOR_KEY)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    fn set_cursor(&self, cursor: i64) -> Result<()> {
        self.set_value(CURSOR_KEY, &cursor.to_string())
    }

    fn anchor(&self, category: &str) -> Result<Option<String>> {
        self.get_value(&anchor_key(category))
    }

    fn set_anchor(&self, category: &str, anchor: &str) -> Result<()> {
        self.set_value(&anchor_key(category), anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_cursor_defaults_to_zero() {
        let db = setup();
        let repo = SqliteSyncStateRepository::new(db.connection());

        assert_eq!(repo.cursor().unwrap(), 0);
        repo.set_cursor(42).unwrap();
        assert_eq!(repo.cursor().unwrap(), 42);
    }

    #[test]
    fn test_anchors_are_per_category() {
        let db = setup();
        let repo = SqliteSyncStateRepository::new(db.connection());

        repo.set_anchor("workout", "a1").unwrap();
        assert_eq!(repo.anchor("workout").unwrap().as_deref(), Some("a1"));
        assert!(repo.anchor("sleep").unwrap().is_none());
    }
}
