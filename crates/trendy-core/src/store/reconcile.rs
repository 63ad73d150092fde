//! Applying server state to the local store

use std::collections::HashMap;

use rusqlite::Connection;

use super::LocalStore;
use crate::db::{
    EventRepository, SqliteEventRepository, SqliteEventTypeRepository, SqliteGeofenceRepository,
    SqliteMutationQueue, SqliteSyncStateRepository, SyncStateRepository,
};
use crate::error::Result;
use crate::models::{EventId, EventTypeId, GeofenceId, PendingMutation};
use crate::sync::wire::{
    ChangeEntityType, ChangeEntry, ChangeFeedResponse, ChangeOperation, EventDto, EventTypeDto,
    GeofenceDto,
};

/// Full server state fetched for a bootstrap
#[derive(Debug, Clone, Default)]
pub struct BootstrapSnapshot {
    pub event_types: Vec<EventTypeDto>,
    pub geofences: Vec<GeofenceDto>,
    pub events: Vec<EventDto>,
}

impl BootstrapSnapshot {
    pub fn len(&self) -> usize {
        self.event_types.len() + self.geofences.len() + self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What applying one change page did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub applied: usize,
    /// Entries left alone because a local mutation is still queued for them
    pub skipped: usize,
}

impl LocalStore {
    /// Apply one change-feed page and advance the cursor in the same transaction.
    ///
    /// Entities with queued local mutations are not overwritten; their own
    /// mutation reaches the server first and comes back through the feed.
    pub async fn apply_change_page(&self, page: &ChangeFeedResponse) -> Result<PageOutcome> {
        self.write(|tx| {
            let mut outcome = PageOutcome::default();
            for change in &page.changes {
                if apply_change(tx, change)? {
                    outcome.applied += 1;
                } else {
                    outcome.skipped += 1;
                }
            }
            // An empty page echoes the request cursor; never move backwards.
            let state = SqliteSyncStateRepository::new(tx);
            state.set_cursor(page.next_cursor.max(state.cursor()?))?;
            Ok(outcome)
        })
        .await
    }

    /// Replace every sync-managed row with a server snapshot.
    ///
    /// Rows with queued mutations survive untouched; everything else is
    /// deleted and rebuilt from the snapshot. Geofences keep their local ids
    /// when the server id is already known, so monitored regions stay valid.
    pub async fn replace_with_snapshot(
        &self,
        snapshot: &BootstrapSnapshot,
        cursor: i64,
    ) -> Result<usize> {
        self.write(|tx| {
            let local_ids = geofence_ids_by_server_id(tx)?;

            for table in ["events", "event_types", "geofences"] {
                tx.execute(
                    &format!(
                        "DELETE FROM {table}
                         WHERE id NOT IN (SELECT entity_id FROM pending_mutations)"
                    ),
                    [],
                )?;
            }

            let queue = SqliteMutationQueue::new(tx);
            let mut inserted = 0;

            let event_types = SqliteEventTypeRepository::new(tx);
            for dto in &snapshot.event_types {
                if queue.has_pending_for(&dto.id.as_str())? {
                    continue;
                }
                event_types.upsert(&dto.clone().into_event_type())?;
                inserted += 1;
            }

            let geofences = SqliteGeofenceRepository::new(tx);
            for dto in &snapshot.geofences {
                if geofences.get_by_server_id(&dto.id)?.is_some() {
                    continue;
                }
                let mut geofence = dto.clone().into_geofence(None);
                if let Some(local_id) = local_ids.get(&dto.id) {
                    geofence.id = *local_id;
                }
                geofences.upsert(&geofence)?;
                inserted += 1;
            }

            let events = SqliteEventRepository::new(tx);
            for dto in &snapshot.events {
                if queue.has_pending_for(&dto.id.as_str())? {
                    continue;
                }
                let geofence_id = local_geofence_id(tx, dto.geofence_id.as_deref())?;
                events.upsert(&dto.clone().into_event(geofence_id))?;
                inserted += 1;
            }

            SqliteSyncStateRepository::new(tx).set_cursor(cursor)?;
            Ok(inserted)
        })
        .await
    }

    /// Move a locally created event onto the id the server stored it under.
    ///
    /// Happens when the server upserted the event by HealthKit sample id or
    /// external id and kept an existing row instead of the client id.
    pub async fn remap_event(&self, mutation: &PendingMutation, server: &EventDto) -> Result<()> {
        self.write(|tx| {
            let queue = SqliteMutationQueue::new(tx);
            queue.acknowledge(mutation.id)?;

            let Ok(local_id) = mutation.entity_id.parse::<EventId>() else {
                return Ok(());
            };
            if local_id == server.id {
                return Ok(());
            }

            let events = SqliteEventRepository::new(tx);
            if events.get(&server.id)?.is_some() {
                events.delete(&local_id)?;
            } else {
                events.replace_id(&local_id, &server.id)?;
            }
            queue.retarget(&local_id.as_str(), &server.id.as_str())?;

            if !queue.has_pending_for(&server.id.as_str())? {
                events.set_sync_status(&server.id, crate::models::SyncStatus::Synced)?;
            }
            tracing::info!(
                local_id = %local_id,
                server_id = %server.id,
                "Remapped event to server id"
            );
            Ok(())
        })
        .await
    }

    /// Server id of a geofence, `None` while its create is still queued
    pub async fn geofence_server_id(&self, id: &GeofenceId) -> Result<Option<String>> {
        Ok(self
            .get_geofence(id)
            .await?
            .and_then(|geofence| geofence.server_id))
    }
}

fn geofence_ids_by_server_id(conn: &Connection) -> Result<HashMap<String, GeofenceId>> {
    let mut stmt =
        conn.prepare("SELECT server_id, id FROM geofences WHERE server_id IS NOT NULL")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .filter_map(|(server_id, id)| id.parse().ok().map(|id| (server_id, id)))
        .collect())
}

fn local_geofence_id(conn: &Connection, server_id: Option<&str>) -> Result<Option<GeofenceId>> {
    let Some(server_id) = server_id else {
        return Ok(None);
    };
    Ok(SqliteGeofenceRepository::new(conn)
        .resolve(server_id)?
        .map(|geofence| geofence.id))
}

/// Apply one change entry; returns false when it was skipped
fn apply_change(conn: &Connection, change: &ChangeEntry) -> Result<bool> {
    let queue = SqliteMutationQueue::new(conn);

    match change.entity_type {
        ChangeEntityType::Event => {
            let Ok(id) = change.entity_id.parse::<EventId>() else {
                return Ok(skip_malformed(change));
            };
            if queue.has_pending_for(&change.entity_id)? {
                return Ok(false);
            }
            let events = SqliteEventRepository::new(conn);
            if change.operation == ChangeOperation::Delete {
                events.delete(&id)?;
                return Ok(true);
            }
            let Some(dto) = decode::<EventDto>(change) else {
                return Ok(skip_malformed(change));
            };
            if let Some(sample_id) = dto.healthkit_sample_id.as_deref() {
                if let Some(local) = events.find_by_healthkit_sample(sample_id)? {
                    if local.id != dto.id {
                        if queue.has_pending_for(&local.id.as_str())? {
                            return Ok(false);
                        }
                        events.delete(&local.id)?;
                    }
                }
            }
            let geofence_id = local_geofence_id(conn, dto.geofence_id.as_deref())?;
            events.upsert(&dto.into_event(geofence_id))?;
            Ok(true)
        }
        ChangeEntityType::EventType => {
            let Ok(id) = change.entity_id.parse::<EventTypeId>() else {
                return Ok(skip_malformed(change));
            };
            if queue.has_pending_for(&change.entity_id)? {
                return Ok(false);
            }
            let event_types = SqliteEventTypeRepository::new(conn);
            if change.operation == ChangeOperation::Delete {
                event_types.delete(&id)?;
                return Ok(true);
            }
            let Some(dto) = decode::<EventTypeDto>(change) else {
                return Ok(skip_malformed(change));
            };
            event_types.upsert(&dto.into_event_type())?;
            Ok(true)
        }
        ChangeEntityType::Geofence => {
            let geofences = SqliteGeofenceRepository::new(conn);
            let existing = geofences.get_by_server_id(&change.entity_id)?;
            if let Some(existing) = existing.as_ref() {
                if queue.has_pending_for(&existing.id.as_str())? {
                    return Ok(false);
                }
            }
            if change.operation == ChangeOperation::Delete {
                if let Some(existing) = existing {
                    geofences.delete(&existing.id)?;
                }
                return Ok(true);
            }
            let Some(dto) = decode::<GeofenceDto>(change) else {
                return Ok(skip_malformed(change));
            };
            geofences.upsert(&dto.into_geofence(existing))?;
            Ok(true)
        }
        ChangeEntityType::Unknown => Ok(false),
    }
}

fn decode<T: serde::de::DeserializeOwned>(change: &ChangeEntry) -> Option<T> {
    let data = change.data.clone()?;
    serde_json::from_value(data).ok()
}

fn skip_malformed(change: &ChangeEntry) -> bool {
    tracing::warn!(
        change_id = change.id,
        entity_id = %change.entity_id,
        "Skipping malformed change entry"
    );
    false
}
