//! Local store: one cached `SQLite` handle shared by the engine and ingestors.
//!
//! The handle can go stale while the host is suspended (file protection,
//! released descriptors). Every operation goes through [`LocalStore::with_db`],
//! which recreates the handle and retries once when it sees one of the
//! stale-handle errors. Local writes append their outbound mutation in the
//! same transaction, so the queue never disagrees with the rows it describes.

mod reconcile;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use serde_json::json;
use tokio::sync::Mutex;

use crate::db::{
    Database, EventRepository, FailureOutcome, SqliteEventRepository, SqliteEventTypeRepository,
    SqliteGeofenceRepository, SqliteHistoryRepository, SqliteMutationQueue,
    SqlitePendingRegionRepository, SqliteSyncStateRepository, SyncStateRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    Event, EventEdit, EventId, EventType, EventTypeEdit, EventTypeId, Geofence, GeofenceEdit,
    GeofenceId, MutationEntity, MutationOperation, NewMutation, PendingMutation,
    PendingRegionEvent, RegionCrossing, SyncHistoryEntry, SyncStatus,
};
use crate::sync::wire::{
    CreateEventRequest, CreateGeofenceRequest, EventTypeDto, UpdateEventRequest,
    UpdateEventTypeRequest, UpdateGeofenceRequest,
};

pub use reconcile::{BootstrapSnapshot, PageOutcome};

const RELEASED: &str = "database handle was released";

/// Thread-safe handle cache over the local database
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Option<Database>>>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the store at the given filesystem path
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let db = Self::open_database(&path)?;
        Ok(Self {
            db: Arc::new(Mutex::new(Some(db))),
            path: Some(path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    ///
    /// An in-memory handle cannot be recreated, so stale-handle errors
    /// surface unchanged.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Some(Database::open_in_memory()?))),
            path: None,
        })
    }

    fn open_database(path: &Path) -> Result<Database> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Database::open(path)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn run<T>(slot: &mut Option<Database>, op: &impl Fn(&mut Database) -> Result<T>) -> Result<T> {
        match slot.as_mut() {
            Some(db) => op(db),
            None => Err(Error::StaleHandle(RELEASED.to_string())),
        }
    }

    /// Run `op` against the handle, recreating it and retrying once if it
    /// turns out to be stale
    async fn with_db<T>(&self, op: impl Fn(&mut Database) -> Result<T>) -> Result<T> {
        let first_attempt = {
            let mut slot = self.db.lock().await;
            Self::run(&mut slot, &op)
        };

        match first_attempt {
            Err(error) if error.is_stale_handle() => {
                if self.reopen(&error).await? {
                    let mut slot = self.db.lock().await;
                    Self::run(&mut slot, &op)
                } else {
                    Err(error)
                }
            }
            other => other,
        }
    }

    async fn read<T>(&self, op: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        self.with_db(|db| op(db.connection())).await
    }

    async fn write<T>(&self, op: impl Fn(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.with_db(|db| {
            let tx = db.connection_mut().transaction()?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    async fn reopen(&self, cause: &Error) -> Result<bool> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };

        tracing::warn!(
            path = %path.display(),
            error = %cause,
            "Recreating stale database handle"
        );

        let mut slot = self.db.lock().await;
        drop(slot.take());
        *slot = Some(Self::open_database(path)?);
        Ok(true)
    }

    // Handle lifecycle

    /// Cheap query that only checks the handle works
    pub async fn probe(&self) -> Result<i64> {
        self.with_db(|db| db.probe()).await
    }

    /// Make sure the handle is usable, recreating it if needed
    pub async fn ensure_ready(&self) -> Result<()> {
        self.probe().await.map(|_| ())
    }

    /// Drop the connection, e.g. before the host is suspended
    pub async fn release_handle(&self) {
        let mut slot = self.db.lock().await;
        if slot.take().is_some() {
            tracing::info!("Released database handle");
        }
    }

    /// Close and reopen the connection, e.g. after the host resumes
    pub async fn refresh_handle(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let mut slot = self.db.lock().await;
        drop(slot.take());
        *slot = Some(Self::open_database(path)?);
        tracing::info!(path = %path.display(), "Refreshed database handle");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn is_released(&self) -> bool {
        self.db.lock().await.is_none()
    }

    // Events

    /// Insert a new event and queue its creation
    pub async fn create_event(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_value(CreateEventRequest::from(event))?;
        let id = event.id.as_str();
        self.write(|tx| {
            SqliteEventRepository::new(tx).insert(event)?;
            SqliteMutationQueue::new(tx).enqueue(&NewMutation::new(
                MutationEntity::Event,
                MutationOperation::Create,
                id.clone(),
                payload.clone(),
            ))?;
            Ok(())
        })
        .await?;
        tracing::debug!(event_id = %event.id, source = %event.source, "Created event");
        Ok(())
    }

    /// Apply a partial edit and queue it.
    ///
    /// An empty edit leaves the event and the queue untouched.
    pub async fn update_event(&self, id: &EventId, edit: &EventEdit) -> Result<Event> {
        let payload = serde_json::to_value(UpdateEventRequest::from(edit))?;
        self.write(|tx| {
            let repo = SqliteEventRepository::new(tx);
            let mut event = repo
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("event {id}")))?;
            if edit.is_empty() {
                return Ok(event);
            }

            edit.clone().apply(&mut event);
            event.sync_status = SyncStatus::Pending;
            repo.update(&event)?;
            SqliteMutationQueue::new(tx).enqueue(&NewMutation::new(
                MutationEntity::Event,
                MutationOperation::Update,
                id.as_str(),
                payload.clone(),
            ))?;
            Ok(event)
        })
        .await
    }

    /// Delete an event and queue the deletion, returning whether it existed
    pub async fn delete_event(&self, id: &EventId) -> Result<bool> {
        self.write(|tx| {
            let deleted = SqliteEventRepository::new(tx).delete(id)?;
            if deleted {
                SqliteMutationQueue::new(tx).enqueue(&NewMutation::new(
                    MutationEntity::Event,
                    MutationOperation::Delete,
                    id.as_str(),
                    json!({}),
                ))?;
            }
            Ok(deleted)
        })
        .await
    }

    pub async fn get_event(&self, id: &EventId) -> Result<Option<Event>> {
        self.read(|conn| SqliteEventRepository::new(conn).get(id))
            .await
    }

    pub async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<Event>> {
        self.read(|conn| SqliteEventRepository::new(conn).list(limit, offset))
            .await
    }

    pub async fn event_count(&self) -> Result<i64> {
        self.read(|conn| SqliteEventRepository::new(conn).count())
            .await
    }

    pub async fn find_by_healthkit_sample(&self, sample_id: &str) -> Result<Option<Event>> {
        self.read(|conn| SqliteEventRepository::new(conn).find_by_healthkit_sample(sample_id))
            .await
    }

    /// HealthKit event with the same content key, timestamps compared with
    /// an inclusive tolerance
    pub async fn find_content_match(
        &self,
        event_type_id: &EventTypeId,
        at: &DateTime<Utc>,
        category: Option<&str>,
        tolerance_ms: i64,
    ) -> Result<Option<Event>> {
        self.read(|conn| {
            SqliteEventRepository::new(conn).find_content_match(
                event_type_id,
                at,
                category,
                tolerance_ms,
            )
        })
        .await
    }

    pub async fn latest_open_geofence_entry(
        &self,
        geofence_id: &GeofenceId,
        since: Option<&DateTime<Utc>>,
    ) -> Result<Option<Event>> {
        self.read(|conn| {
            SqliteEventRepository::new(conn).latest_open_geofence_entry(geofence_id, since)
        })
        .await
    }

    /// Event ids starting with `prefix`, for short-id lookups
    pub async fn event_ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.read(|conn| SqliteEventRepository::new(conn).ids_by_prefix(prefix, limit))
            .await
    }

    pub async fn healthkit_sample_ids(&self) -> Result<Vec<String>> {
        self.read(|conn| SqliteEventRepository::new(conn).healthkit_sample_ids())
            .await
    }

    // Event types

    pub async fn create_event_type(&self, event_type: &EventType) -> Result<()> {
        let payload = serde_json::to_value(EventTypeDto::from(event_type))?;
        self.write(|tx| {
            SqliteEventTypeRepository::new(tx).upsert(event_type)?;
            SqliteMutationQueue::new(tx).enqueue(&NewMutation::new(
                MutationEntity::EventType,
                MutationOperation::Create,
                event_type.id.as_str(),
                payload.clone(),
            ))?;
            Ok(())
        })
        .await
    }

    pub async fn update_event_type(
        &self,
        id: &EventTypeId,
        edit: &EventTypeEdit,
    ) -> Result<EventType> {
        let payload = serde_json::to_value(UpdateEventTypeRequest::from(edit))?;
        self.write(|tx| {
            let repo = SqliteEventTypeRepository::new(tx);
            let mut event_type = repo
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("event type {id}")))?;
            edit.clone().apply(&mut event_type);
            event_type.sync_status = SyncStatus::Pending;
            repo.update(&event_type)?;
            SqliteMutationQueue::new(tx).enqueue(&NewMutation::new(
                MutationEntity::EventType,
                MutationOperation::Update,
                id.as_str(),
                payload.clone(),
            ))?;
            Ok(event_type)
        })
        .await
    }

    pub async fn delete_event_type(&self, id: &EventTypeId) -> Result<bool> {
        self.write(|tx| {
            let deleted = SqliteEventTypeRepository::new(tx).delete(id)?;
            if deleted {
                SqliteMutationQueue::new(tx).enqueue(&NewMutation::new(
                    MutationEntity::EventType,
                    MutationOperation::Delete,
                    id.as_str(),
                    json!({}),
                ))?;
            }
            Ok(deleted)
        })
        .await
    }

    pub async fn get_event_type(&self, id: &EventTypeId) -> Result<Option<EventType>> {
        self.read(|conn| SqliteEventTypeRepository::new(conn).get(id))
            .await
    }

    pub async fn find_event_type_by_name(&self, name: &str) -> Result<Option<EventType>> {
        self.read(|conn| SqliteEventTypeRepository::new(conn).find_by_name(name))
            .await
    }

    pub async fn list_event_types(&self) -> Result<Vec<EventType>> {
        self.read(|conn| SqliteEventTypeRepository::new(conn).list())
            .await
    }

    // Geofences

    pub async fn create_geofence(&self, geofence: &Geofence) -> Result<()> {
        let payload = serde_json::to_value(CreateGeofenceRequest::from(geofence))?;
        self.write(|tx| {
            SqliteGeofenceRepository::new(tx).upsert(geofence)?;
            SqliteMutationQueue::new(tx).enqueue(&NewMutation::new(
                MutationEntity::Geofence,
                MutationOperation::Create,
                geofence.id.as_str(),
                payload.clone(),
            ))?;
            Ok(())
        })
        .await
    }

    pub async fn update_geofence(&self, id: &GeofenceId, edit: &GeofenceEdit) -> Result<Geofence> {
        let payload = serde_json::to_value(UpdateGeofenceRequest::from(edit))?;
        self.write(|tx| {
            let repo = SqliteGeofenceRepository::new(tx);
            let mut geofence = repo
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("geofence {id}")))?;
            edit.clone().apply(&mut geofence);
            geofence.sync_status = SyncStatus::Pending;
            repo.update(&geofence)?;
            SqliteMutationQueue::new(tx).enqueue(&NewMutation::new(
                MutationEntity::Geofence,
                MutationOperation::Update,
                id.as_str(),
                payload.clone(),
            ))?;
            Ok(geofence)
        })
        .await
    }

    /// Delete a geofence.
    ///
    /// A geofence the server has never seen just drops its queued mutations;
    /// otherwise the deletion is queued with the server id it needs.
    pub async fn delete_geofence(&self, id: &GeofenceId) -> Result<bool> {
        self.write(|tx| {
            let repo = SqliteGeofenceRepository::new(tx);
            let Some(geofence) = repo.get(id)? else {
                return Ok(false);
            };
            repo.delete(id)?;

            let queue = SqliteMutationQueue::new(tx);
            match geofence.server_id {
                Some(server_id) => {
                    queue.enqueue(&NewMutation::new(
                        MutationEntity::Geofence,
                        MutationOperation::Delete,
                        id.as_str(),
                        json!({ "server_id": server_id }),
                    ))?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM pending_mutations WHERE entity_id = ?1",
                        [id.as_str()],
                    )?;
                }
            }
            Ok(true)
        })
        .await
    }

    pub async fn get_geofence(&self, id: &GeofenceId) -> Result<Option<Geofence>> {
        self.read(|conn| SqliteGeofenceRepository::new(conn).get(id))
            .await
    }

    /// Look a geofence up by platform region identifier (local or server id)
    pub async fn resolve_geofence(&self, region_id: &str) -> Result<Option<Geofence>> {
        self.read(|conn| SqliteGeofenceRepository::new(conn).resolve(region_id))
            .await
    }

    pub async fn list_geofences(&self, active_only: bool) -> Result<Vec<Geofence>> {
        self.read(|conn| SqliteGeofenceRepository::new(conn).list(active_only))
            .await
    }

    // Sync bookkeeping

    pub async fn cursor(&self) -> Result<i64> {
        self.read(|conn| SqliteSyncStateRepository::new(conn).cursor())
            .await
    }

    pub async fn set_cursor(&self, cursor: i64) -> Result<()> {
        self.write(|tx| SqliteSyncStateRepository::new(tx).set_cursor(cursor))
            .await
    }

    pub async fn anchor(&self, category: &str) -> Result<Option<String>> {
        self.read(|conn| SqliteSyncStateRepository::new(conn).anchor(category))
            .await
    }

    pub async fn set_anchor(&self, category: &str, anchor: &str) -> Result<()> {
        self.write(|tx| SqliteSyncStateRepository::new(tx).set_anchor(category, anchor))
            .await
    }

    // Mutation queue

    pub async fn pending_mutations(&self, limit: usize) -> Result<Vec<PendingMutation>> {
        self.read(|conn| SqliteMutationQueue::new(conn).pending(limit))
            .await
    }

    pub async fn list_mutations(&self) -> Result<Vec<PendingMutation>> {
        self.read(|conn| SqliteMutationQueue::new(conn).list())
            .await
    }

    /// Counts of (pending, failed) mutations
    pub async fn mutation_counts(&self) -> Result<(i64, i64)> {
        self.read(|conn| SqliteMutationQueue::new(conn).counts())
            .await
    }

    /// Drop an acknowledged mutation; the entity becomes `synced` once
    /// nothing else is queued for it
    pub async fn complete_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        self.write(|tx| {
            let queue = SqliteMutationQueue::new(tx);
            queue.acknowledge(mutation.id)?;
            if !queue.has_pending_for(&mutation.entity_id)? {
                mark_synced(tx, mutation.entity, &mutation.entity_id)?;
            }
            Ok(())
        })
        .await
    }

    /// Acknowledge a geofence create and remember the server's id for it
    pub async fn complete_geofence_create(
        &self,
        mutation: &PendingMutation,
        server_id: &str,
    ) -> Result<()> {
        self.write(|tx| {
            SqliteMutationQueue::new(tx).acknowledge(mutation.id)?;
            if let Ok(id) = mutation.entity_id.parse::<GeofenceId>() {
                SqliteGeofenceRepository::new(tx).set_server_id(&id, server_id)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn record_mutation_failure(
        &self,
        mutation: &PendingMutation,
        error: &str,
        counts: bool,
        max_attempts: u32,
    ) -> Result<FailureOutcome> {
        self.write(|tx| {
            SqliteMutationQueue::new(tx).record_failure(mutation, error, counts, max_attempts)
        })
        .await
    }

    /// Delete every queued mutation
    pub async fn clear_mutations(&self) -> Result<usize> {
        self.write(|tx| SqliteMutationQueue::new(tx).clear())
            .await
    }

    /// Give failed mutations a fresh retry budget
    pub async fn retry_failed_mutations(&self) -> Result<usize> {
        self.write(|tx| SqliteMutationQueue::new(tx).retry_failed())
            .await
    }

    // History

    pub async fn record_history(&self, entry: &SyncHistoryEntry, keep: usize) -> Result<()> {
        self.write(|tx| SqliteHistoryRepository::new(tx).record(entry, keep))
            .await
    }

    pub async fn recent_history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>> {
        self.read(|conn| SqliteHistoryRepository::new(conn).recent(limit))
            .await
    }

    // Pending region crossings

    pub async fn push_pending_region(
        &self,
        region_id: &str,
        crossing: RegionCrossing,
        occurred_at: &DateTime<Utc>,
    ) -> Result<i64> {
        self.write(|tx| {
            SqlitePendingRegionRepository::new(tx).push(region_id, crossing, occurred_at)
        })
        .await
    }

    /// Queued crossings, oldest first, left in place until removed
    pub async fn pending_regions(&self) -> Result<Vec<PendingRegionEvent>> {
        self.read(|conn| SqlitePendingRegionRepository::new(conn).list())
            .await
    }

    pub async fn remove_pending_region(&self, id: i64) -> Result<bool> {
        self.write(|tx| SqlitePendingRegionRepository::new(tx).remove(id))
            .await
    }
}

fn mark_synced(conn: &Connection, entity: MutationEntity, entity_id: &str) -> Result<()> {
    match entity {
        MutationEntity::Event => {
            if let Ok(id) = entity_id.parse::<EventId>() {
                SqliteEventRepository::new(conn).set_sync_status(&id, SyncStatus::Synced)?;
            }
        }
        MutationEntity::EventType => {
            if let Ok(id) = entity_id.parse::<EventTypeId>() {
                SqliteEventTypeRepository::new(conn).set_sync_status(&id, SyncStatus::Synced)?;
            }
        }
        MutationEntity::Geofence => {
            if let Ok(id) = entity_id.parse::<GeofenceId>() {
                SqliteGeofenceRepository::new(conn).set_sync_status(&id, SyncStatus::Synced)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Patch;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_write_queues_mutation_atomically() {
        let store = LocalStore::open_in_memory().unwrap();
        let event = Event::new(EventTypeId::new(), Utc::now()).with_notes("leg day");

        store.create_event(&event).await.unwrap();

        let queued = store.list_mutations().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].is_event_create());
        assert_eq!(queued[0].entity_id, event.id.as_str());
        assert_eq!(queued[0].payload["notes"], "leg day");
    }

    #[tokio::test]
    async fn test_clearing_notes_queues_explicit_null() {
        let store = LocalStore::open_in_memory().unwrap();
        let event = Event::new(EventTypeId::new(), Utc::now()).with_notes("x");
        store.create_event(&event).await.unwrap();

        let edit = EventEdit {
            notes: Patch::Null,
            ..EventEdit::default()
        };
        let updated = store.update_event(&event.id, &edit).await.unwrap();
        assert_eq!(updated.notes, None);

        let queued = store.list_mutations().await.unwrap();
        assert_eq!(queued[1].operation, MutationOperation::Update);
        assert_eq!(queued[1].payload, json!({ "notes": null }));
    }

    #[tokio::test]
    async fn test_empty_edit_queues_nothing() {
        let store = LocalStore::open_in_memory().unwrap();
        let event = Event::new(EventTypeId::new(), Utc::now());
        store.create_event(&event).await.unwrap();

        store
            .update_event(&event.id, &EventEdit::default())
            .await
            .unwrap();
        assert_eq!(store.list_mutations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_mutation_marks_entity_synced() {
        let store = LocalStore::open_in_memory().unwrap();
        let event = Event::new(EventTypeId::new(), Utc::now());
        store.create_event(&event).await.unwrap();

        let mutation = store.pending_mutations(10).await.unwrap().remove(0);
        store.complete_mutation(&mutation).await.unwrap();

        let stored = store.get_event(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(store.list_mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_unsynced_geofence_drops_its_mutations() {
        let store = LocalStore::open_in_memory().unwrap();
        let geofence = Geofence::new("Gym", 37.0, -122.0, 100.0, None).unwrap();
        store.create_geofence(&geofence).await.unwrap();

        assert!(store.delete_geofence(&geofence.id).await.unwrap());
        assert!(store.list_mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_released_handle_is_recreated_on_next_use() {
        let tmp = tempdir().unwrap();
        let store = LocalStore::open(tmp.path().join("trendy.db")).unwrap();
        let event = Event::new(EventTypeId::new(), Utc::now());
        store.create_event(&event).await.unwrap();

        store.release_handle().await;
        assert!(store.is_released().await);

        assert_eq!(store.event_count().await.unwrap(), 1);
        assert!(!store.is_released().await);
    }

    #[tokio::test]
    async fn test_refresh_handle_keeps_data() {
        let tmp = tempdir().unwrap();
        let store = LocalStore::open(tmp.path().join("nested").join("trendy.db")).unwrap();
        store.set_cursor(17).await.unwrap();

        store.refresh_handle().await.unwrap();
        assert_eq!(store.cursor().await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_history_insert_rolls_back_when_prune_fails() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("trendy.db");
        let store = LocalStore::open(&path).unwrap();
        let entry = SyncHistoryEntry {
            id: 0,
            started_at: Utc::now(),
            duration_ms: 5,
            outcome: "success".to_string(),
            pushed: 1,
            pulled: 0,
            bootstrapped: false,
            error: None,
        };
        store.record_history(&entry, 1).await.unwrap();

        let side = Connection::open(&path).unwrap();
        side.execute_batch(
            "CREATE TRIGGER keep_history BEFORE DELETE ON sync_history
             BEGIN SELECT RAISE(ABORT, 'history is read-only'); END;",
        )
        .unwrap();

        assert!(store.record_history(&entry, 1).await.is_err());
        assert_eq!(store.recent_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_store_surfaces_released_handle() {
        let store = LocalStore::open_in_memory().unwrap();
        store.release_handle().await;

        let error = store.probe().await.unwrap_err();
        assert!(error.is_stale_handle());
    }
}
