//! Durable FIFO of local writes awaiting server acknowledgment

#![allow(clippy::cast_possible_wrap)]

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::columns::{parse_text, timestamp};
use crate::error::Result;
use crate::models::{MutationEntity, MutationStatus, NewMutation, PendingMutation, SyncStatus};
use crate::util::to_millis;

const MUTATION_COLUMNS: &str =
    "id, entity, operation, entity_id, payload, attempts, last_error, status, created_at, updated_at, \
     idempotency_key";

/// Result of recording a failed flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub attempts: u32,
    /// The mutation reached the retry ceiling and is now `failed`
    pub abandoned: bool,
}

/// `SQLite` implementation of the mutation queue
pub struct SqliteMutationQueue<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMutationQueue<'a> {
    /// Create a new queue view over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_mutation(row: &Row<'_>) -> rusqlite::Result<PendingMutation> {
        let payload: String = row.get(4)?;
        let payload = serde_json::from_str(&payload).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(error),
            )
        })?;
        let attempts: i64 = row.get(5)?;

        Ok(PendingMutation {
            id: row.get(0)?,
            entity: parse_text(row, 1)?,
            operation: parse_text(row, 2)?,
            entity_id: row.get(3)?,
            payload,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            last_error: row.get(6)?,
            status: parse_text(row, 7)?,
            created_at: timestamp(row, 8)?,
            updated_at: timestamp(row, 9)?,
            idempotency_key: row.get(10)?,
        })
    }

    fn collect(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<PendingMutation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mutations = stmt
            .query_map(params, Self::parse_mutation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mutations)
    }

    /// Append a mutation, returning its queue position
    pub fn enqueue(&self, mutation: &NewMutation) -> Result<i64> {
        let now = to_millis(&Utc::now());
        self.conn.execute(
            "INSERT INTO pending_mutations
                (entity, operation, entity_id, payload, attempts, status, created_at, updated_at,
                 idempotency_key)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6, ?7)",
            params![
                mutation.entity.as_str(),
                mutation.operation.as_str(),
                mutation.entity_id,
                serde_json::to_string(&mutation.payload)?,
                MutationStatus::Pending.as_str(),
                now,
                Uuid::now_v7().to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mutations still eligible for flushing, oldest first
    pub fn pending(&self, limit: usize) -> Result<Vec<PendingMutation>> {
        self.collect(
            &format!(
                "SELECT {MUTATION_COLUMNS} FROM pending_mutations
                 WHERE status = ?1
                 ORDER BY id
                 LIMIT ?2"
            ),
            params![MutationStatus::Pending.as_str(), limit as i64],
        )
    }

    /// Every queued mutation, pending and failed, oldest first
    pub fn list(&self) -> Result<Vec<PendingMutation>> {
        self.collect(
            &format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations ORDER BY id"),
            [],
        )
    }

    pub fn get(&self, id: i64) -> Result<Option<PendingMutation>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations WHERE id = ?1"),
                params![id],
                Self::parse_mutation,
            )
            .optional()?)
    }

    /// Remove a mutation the server has accepted
    pub fn acknowledge(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM pending_mutations WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Record a failed attempt.
    ///
    /// When `counts` is false only the error text is stored, so rate limiting
    /// never consumes the retry budget. Reaching `max_attempts` marks the
    /// mutation `failed` and flags the targeted entity the same way.
    pub fn record_failure(
        &self,
        mutation: &PendingMutation,
        error: &str,
        counts: bool,
        max_attempts: u32,
    ) -> Result<FailureOutcome> {
        let attempts = if counts {
            mutation.attempts.saturating_add(1)
        } else {
            mutation.attempts
        };
        let abandoned = counts && attempts >= max_attempts;
        let status = if abandoned {
            MutationStatus::Failed
        } else {
            MutationStatus::Pending
        };

        self.conn.execute(
            "UPDATE pending_mutations
             SET attempts = ?2, last_error = ?3, status = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                mutation.id,
                i64::from(attempts),
                error,
                status.as_str(),
                to_millis(&Utc::now()),
            ],
        )?;

        if abandoned {
            self.flag_entity_failed(mutation.entity, &mutation.entity_id)?;
        }

        Ok(FailureOutcome {
            attempts,
            abandoned,
        })
    }

    fn flag_entity_failed(&self, entity: MutationEntity, entity_id: &str) -> Result<()> {
        let table = match entity {
            MutationEntity::Event => "events",
            MutationEntity::EventType => "event_types",
            MutationEntity::Geofence => "geofences",
        };
        self.conn.execute(
            &format!("UPDATE {table} SET sync_status = ?2 WHERE id = ?1"),
            params![entity_id, SyncStatus::Failed.as_str()],
        )?;
        Ok(())
    }

    /// Delete every queued mutation, returning how many were removed
    pub fn clear(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM pending_mutations", [])?)
    }

    /// Give failed mutations a fresh retry budget
    pub fn retry_failed(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE pending_mutations
             SET status = ?1, attempts = 0, updated_at = ?3
             WHERE status = ?2",
            params![
                MutationStatus::Pending.as_str(),
                MutationStatus::Failed.as_str(),
                to_millis(&Utc::now()),
            ],
        )?)
    }

    /// Whether any queued mutation (pending or failed) targets `entity_id`
    pub fn has_pending_for(&self, entity_id: &str) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_mutations WHERE entity_id = ?1)",
            params![entity_id],
            |row| row.get(0),
        )?)
    }

    /// Point queued mutations at a new entity id after a server-side remap
    pub fn retarget(&self, old_id: &str, new_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE pending_mutations SET entity_id = ?2 WHERE entity_id = ?1",
            params![old_id, new_id],
        )?)
    }

    /// Counts of (pending, failed) mutations
    pub fn counts(&self) -> Result<(i64, i64)> {
        Ok(self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM pending_mutations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }
}
