//! Database migrations

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version
pub const CURRENT_VERSION: i32 = 4;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2)?;
    }
    if version < 3 {
        apply(conn, 3, MIGRATION_V3)?;
    }
    if version < 4 {
        apply(conn, 4, MIGRATION_V4)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

fn apply(conn: &mut Connection, version: i32, sql: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(sql)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Version 1: synced entities, mutation queue and sync state
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS event_types (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        color TEXT NOT NULL,
        icon TEXT NOT NULL,
        sync_status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS geofences (
        id TEXT PRIMARY KEY,
        server_id TEXT UNIQUE,
        name TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        radius REAL NOT NULL,
        event_type_entry_id TEXT,
        event_type_exit_id TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        notify_on_entry INTEGER NOT NULL DEFAULT 0,
        notify_on_exit INTEGER NOT NULL DEFAULT 0,
        sync_status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        event_type_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        end_date INTEGER,
        is_all_day INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        source TEXT NOT NULL DEFAULT 'manual',
        external_id TEXT,
        geofence_id TEXT,
        healthkit_sample_id TEXT,
        healthkit_category TEXT,
        properties TEXT NOT NULL DEFAULT '{}',
        sync_status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC);
    CREATE INDEX IF NOT EXISTS idx_events_healthkit_sample ON events(healthkit_sample_id);
    CREATE INDEX IF NOT EXISTS idx_events_content ON events(event_type_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_geofence ON events(geofence_id, end_date);

    CREATE TABLE IF NOT EXISTS pending_mutations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity TEXT NOT NULL,
        operation TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_mutations_status ON pending_mutations(status, id);
    CREATE INDEX IF NOT EXISTS idx_pending_mutations_entity ON pending_mutations(entity_id);

    CREATE TABLE IF NOT EXISTS sync_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Version 2: bounded sync history
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS sync_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        pushed INTEGER NOT NULL DEFAULT 0,
        pulled INTEGER NOT NULL DEFAULT 0,
        bootstrapped INTEGER NOT NULL DEFAULT 0,
        error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_sync_history_started_at ON sync_history(started_at DESC);
";

/// Version 3: region crossings delivered before the handler is ready
const MIGRATION_V3: &str = "
    CREATE TABLE IF NOT EXISTS pending_region_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        region_id TEXT NOT NULL,
        crossing TEXT NOT NULL,
        occurred_at INTEGER NOT NULL,
        enqueued_at INTEGER NOT NULL
    );
";

/// Version 4: per-mutation idempotency key sent with every write
const MIGRATION_V4: &str = "
    ALTER TABLE pending_mutations ADD COLUMN idempotency_key TEXT;
    UPDATE pending_mutations
       SET idempotency_key = lower(hex(randomblob(16)))
     WHERE idempotency_key IS NULL;
";

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_v3_creates_pending_region_table() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = 'pending_region_events'
                )",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert!(exists);
    }

    #[test]
    fn test_migration_v4_keys_already_queued_mutations() {
        let mut conn = setup();
        apply(&mut conn, 1, MIGRATION_V1).unwrap();
        apply(&mut conn, 2, MIGRATION_V2).unwrap();
        apply(&mut conn, 3, MIGRATION_V3).unwrap();
        for entity_id in ["a", "b"] {
            conn.execute(
                "INSERT INTO pending_mutations
                    (entity, operation, entity_id, payload, created_at, updated_at)
                 VALUES ('event', 'create', ?1, '{}', 0, 0)",
                [entity_id],
            )
            .unwrap();
        }

        run(&mut conn).unwrap();

        let keys: Vec<Option<String>> = conn
            .prepare("SELECT idempotency_key FROM pending_mutations ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|key| key.as_deref().is_some_and(|key| key.len() == 32)));
        assert_ne!(keys[0], keys[1]);
    }
}
