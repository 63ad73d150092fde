//! In-memory backend used by the engine and ingestion tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use super::api::{clamp_changes_limit, clamp_events_limit, ApiError, ApiResult, RemoteApi};
use super::wire::{
    BatchCreateEventsResponse, BatchError, ChangeEntityType, ChangeEntry, ChangeFeedResponse,
    ChangeOperation, CreateEventRequest, CreateGeofenceRequest, EventDto, EventTypeDto,
    GeofenceDto, UpdateEventRequest, UpdateEventTypeRequest, UpdateGeofenceRequest,
};
use crate::models::{EventId, EventTypeId};

/// Which call a scripted failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    CreateEvent,
    BatchCreate,
    UpdateEvent,
    DeleteEvent,
    ListEvents,
    CreateEventType,
    UpdateEventType,
    CreateGeofence,
    UpdateGeofence,
    Changes,
    LatestCursor,
}

#[derive(Default)]
pub struct FakeState {
    pub events: BTreeMap<EventId, EventDto>,
    pub event_types: BTreeMap<EventTypeId, EventTypeDto>,
    pub geofences: BTreeMap<String, GeofenceDto>,
    pub change_log: Vec<ChangeEntry>,
    pub failures: VecDeque<(Call, ApiError)>,
    pub calls: Vec<Call>,
    pub batch_sizes: Vec<usize>,
    pub event_updates: Vec<serde_json::Value>,
    /// Item indexes of the next batch to reject with a per-item error
    pub reject_batch_items: Vec<usize>,
    /// Largest event page served regardless of the requested limit
    pub events_page_cap: Option<usize>,
    /// Apply the next write of this kind but fail its response
    pub lose_next_response: Option<Call>,
    /// Idempotency keys received with writes, in arrival order
    pub idempotency_keys: Vec<String>,
    /// Writes answered from the idempotency cache
    pub replayed: usize,
    replays: HashMap<String, serde_json::Value>,
    next_geofence: u64,
}

/// Backend fake keeping server state in memory
#[derive(Default)]
pub struct FakeRemote {
    pub state: Mutex<FakeState>,
    /// When set, `changes` waits for a notification before answering
    pub hold_changes: Mutex<Option<Arc<Notify>>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` calls of `call` fail with `error`
    pub async fn fail_next(&self, call: Call, error: ApiError, count: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            state.failures.push_back((call, error.clone()));
        }
    }

    pub async fn calls(&self, call: Call) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|recorded| **recorded == call)
            .count()
    }

    /// Seed server-side state as if another device created it
    pub async fn seed_event(&self, dto: EventDto) {
        let mut state = self.state.lock().await;
        log_change(&mut state, ChangeEntityType::Event, ChangeOperation::Create, dto.id.as_str(), Some(&dto));
        state.events.insert(dto.id, dto);
    }

    pub async fn seed_event_type(&self, dto: EventTypeDto) {
        let mut state = self.state.lock().await;
        log_change(&mut state, ChangeEntityType::EventType, ChangeOperation::Create, dto.id.as_str(), Some(&dto));
        state.event_types.insert(dto.id, dto);
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }

    /// Run a write the way the backend does: a key seen before replays the
    /// stored 2xx response and leaves state untouched
    async fn idempotent<T, F>(&self, call: Call, key: &str, apply: F) -> ApiResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(&mut FakeState) -> ApiResult<T> + Send,
    {
        self.enter(call).await?;
        let mut state = self.state.lock().await;
        state.idempotency_keys.push(key.to_string());
        if let Some(cached) = state.replays.get(key).cloned() {
            state.replayed += 1;
            return serde_json::from_value(cached)
                .map_err(|error| ApiError::Decode(error.to_string()));
        }

        let response = apply(&mut *state)?;
        if let Ok(cached) = serde_json::to_value(&response) {
            state.replays.insert(key.to_string(), cached);
        }
        if state.lose_next_response == Some(call) {
            state.lose_next_response = None;
            return Err(ApiError::Network("connection reset".to_string()));
        }
        Ok(response)
    }

    async fn enter(&self, call: Call) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(call);
        if let Some(position) = state.failures.iter().position(|(c, _)| *c == call) {
            if let Some((_, error)) = state.failures.remove(position) {
                return Err(error);
            }
        }
        Ok(())
    }
}

fn log_change<T: serde::Serialize>(
    state: &mut FakeState,
    entity_type: ChangeEntityType,
    operation: ChangeOperation,
    entity_id: String,
    data: Option<&T>,
) {
    let id = i64::try_from(state.change_log.len()).unwrap_or(i64::MAX) + 1;
    state.change_log.push(ChangeEntry {
        id,
        entity_type,
        operation,
        entity_id,
        data: data.and_then(|value| serde_json::to_value(value).ok()),
        deleted_at: (operation == ChangeOperation::Delete).then(Utc::now),
        created_at: Some(Utc::now()),
    });
}

fn to_dto(request: &CreateEventRequest) -> EventDto {
    EventDto {
        id: request.id,
        event_type_id: request.event_type_id,
        timestamp: request.timestamp,
        notes: request.notes.clone(),
        is_all_day: request.is_all_day,
        end_date: request.end_date,
        source_type: request.source_type.clone(),
        external_id: request.external_id.clone(),
        geofence_id: request.geofence_id.clone(),
        healthkit_sample_id: request.healthkit_sample_id.clone(),
        healthkit_category: request.healthkit_category.clone(),
        properties: request.properties.clone(),
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
    }
}

/// Server-side create: events sharing a HealthKit sample id are upserted
/// onto the existing row and keep its id
fn upsert_event(state: &mut FakeState, request: &CreateEventRequest) -> ApiResult<EventDto> {
    if state.events.contains_key(&request.id) {
        return Err(ApiError::Conflict("event already exists".to_string()));
    }

    let existing = request.healthkit_sample_id.as_ref().and_then(|sample| {
        state
            .events
            .values()
            .find(|event| event.healthkit_sample_id.as_ref() == Some(sample))
            .map(|event| event.id)
    });

    let mut dto = to_dto(request);
    let operation = if let Some(existing) = existing {
        dto.id = existing;
        ChangeOperation::Update
    } else {
        ChangeOperation::Create
    };
    log_change(state, ChangeEntityType::Event, operation, dto.id.as_str(), Some(&dto));
    state.events.insert(dto.id, dto.clone());
    Ok(dto)
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create_event(
        &self,
        request: &CreateEventRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventDto> {
        self.idempotent(Call::CreateEvent, idempotency_key, |state| {
            upsert_event(state, request)
        })
        .await
    }

    async fn batch_create_events(
        &self,
        requests: &[CreateEventRequest],
        idempotency_key: &str,
    ) -> ApiResult<BatchCreateEventsResponse> {
        self.idempotent(Call::BatchCreate, idempotency_key, |state| {
            state.batch_sizes.push(requests.len());
            let rejected = std::mem::take(&mut state.reject_batch_items);

            let mut response = BatchCreateEventsResponse {
                total: requests.len(),
                ..BatchCreateEventsResponse::default()
            };
            for (index, request) in requests.iter().enumerate() {
                if rejected.contains(&index) {
                    response.errors.push(BatchError {
                        index,
                        message: "invalid event".to_string(),
                    });
                    continue;
                }
                if let Some(existing) = state.events.get(&request.id) {
                    response.created.push(existing.clone());
                    continue;
                }
                match upsert_event(state, request) {
                    Ok(dto) => response.created.push(dto),
                    Err(error) => response.errors.push(BatchError {
                        index,
                        message: error.to_string(),
                    }),
                }
            }
            Ok(response)
        })
        .await
    }

    async fn update_event(
        &self,
        id: &EventId,
        request: &UpdateEventRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventDto> {
        self.idempotent(Call::UpdateEvent, idempotency_key, |state| {
            state
                .event_updates
                .push(serde_json::to_value(request).unwrap_or_default());

            let Some(mut dto) = state.events.get(id).cloned() else {
                return Err(ApiError::NotFound);
            };
            if let Some(event_type_id) = request.event_type_id {
                dto.event_type_id = event_type_id;
            }
            if let Some(timestamp) = request.timestamp {
                dto.timestamp = timestamp;
            }
            request.notes.clone().apply_to(&mut dto.notes);
            request.end_date.clone().apply_to(&mut dto.end_date);
            if let Some(is_all_day) = request.is_all_day {
                dto.is_all_day = is_all_day;
            }
            if let Some(properties) = request.properties.clone() {
                dto.properties = properties;
            }
            dto.updated_at = Some(Utc::now());

            log_change(state, ChangeEntityType::Event, ChangeOperation::Update, id.as_str(), Some(&dto));
            state.events.insert(*id, dto.clone());
            Ok(dto)
        })
        .await
    }

    async fn delete_event(&self, id: &EventId) -> ApiResult<()> {
        self.enter(Call::DeleteEvent).await?;
        let mut state = self.state.lock().await;
        if state.events.remove(id).is_none() {
            return Err(ApiError::NotFound);
        }
        log_change::<EventDto>(&mut state, ChangeEntityType::Event, ChangeOperation::Delete, id.as_str(), None);
        Ok(())
    }

    async fn list_events(&self, limit: usize, offset: usize) -> ApiResult<Vec<EventDto>> {
        self.enter(Call::ListEvents).await?;
        let state = self.state.lock().await;
        let limit = state
            .events_page_cap
            .map_or(clamp_events_limit(limit), |cap| cap.min(limit));
        Ok(state
            .events
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_event_type(
        &self,
        request: &EventTypeDto,
        idempotency_key: &str,
    ) -> ApiResult<EventTypeDto> {
        self.idempotent(Call::CreateEventType, idempotency_key, |state| {
            log_change(state, ChangeEntityType::EventType, ChangeOperation::Create, request.id.as_str(), Some(request));
            state.event_types.insert(request.id, request.clone());
            Ok(request.clone())
        })
        .await
    }

    async fn update_event_type(
        &self,
        id: &EventTypeId,
        request: &UpdateEventTypeRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventTypeDto> {
        self.idempotent(Call::UpdateEventType, idempotency_key, |state| {
            let Some(mut dto) = state.event_types.get(id).cloned() else {
                return Err(ApiError::NotFound);
            };
            if let Some(name) = request.name.clone() {
                dto.name = name;
            }
            if let Some(color) = request.color.clone() {
                dto.color = color;
            }
            if let Some(icon) = request.icon.clone() {
                dto.icon = icon;
            }
            log_change(state, ChangeEntityType::EventType, ChangeOperation::Update, id.as_str(), Some(&dto));
            state.event_types.insert(*id, dto.clone());
            Ok(dto)
        })
        .await
    }

    async fn delete_event_type(&self, id: &EventTypeId) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        if state.event_types.remove(id).is_none() {
            return Err(ApiError::NotFound);
        }
        log_change::<EventTypeDto>(&mut state, ChangeEntityType::EventType, ChangeOperation::Delete, id.as_str(), None);
        Ok(())
    }

    async fn list_event_types(&self) -> ApiResult<Vec<EventTypeDto>> {
        Ok(self.state.lock().await.event_types.values().cloned().collect())
    }

    async fn create_geofence(
        &self,
        request: &CreateGeofenceRequest,
        idempotency_key: &str,
    ) -> ApiResult<GeofenceDto> {
        self.idempotent(Call::CreateGeofence, idempotency_key, |state| {
            state.next_geofence += 1;
            let dto = GeofenceDto {
                id: format!("srv-geofence-{}", state.next_geofence),
                name: request.name.clone(),
                latitude: request.latitude,
                longitude: request.longitude,
                radius: request.radius,
                event_type_entry_id: request.event_type_entry_id,
                event_type_exit_id: request.event_type_exit_id,
                is_active: request.is_active,
                notify_on_entry: request.notify_on_entry,
                notify_on_exit: request.notify_on_exit,
            };
            log_change(state, ChangeEntityType::Geofence, ChangeOperation::Create, dto.id.clone(), Some(&dto));
            state.geofences.insert(dto.id.clone(), dto.clone());
            Ok(dto)
        })
        .await
    }

    async fn update_geofence(
        &self,
        server_id: &str,
        request: &UpdateGeofenceRequest,
        idempotency_key: &str,
    ) -> ApiResult<GeofenceDto> {
        self.idempotent(Call::UpdateGeofence, idempotency_key, |state| {
            let Some(mut dto) = state.geofences.get(server_id).cloned() else {
                return Err(ApiError::NotFound);
            };
            if let Some(name) = request.name.clone() {
                dto.name = name;
            }
            if let Some(radius) = request.radius {
                dto.radius = radius;
            }
            if let Some(is_active) = request.is_active {
                dto.is_active = is_active;
            }
            log_change(state, ChangeEntityType::Geofence, ChangeOperation::Update, server_id.to_string(), Some(&dto));
            state.geofences.insert(server_id.to_string(), dto.clone());
            Ok(dto)
        })
        .await
    }

    async fn delete_geofence(&self, server_id: &str) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        if state.geofences.remove(server_id).is_none() {
            return Err(ApiError::NotFound);
        }
        log_change::<GeofenceDto>(&mut state, ChangeEntityType::Geofence, ChangeOperation::Delete, server_id.to_string(), None);
        Ok(())
    }

    async fn list_geofences(&self) -> ApiResult<Vec<GeofenceDto>> {
        Ok(self.state.lock().await.geofences.values().cloned().collect())
    }

    async fn changes(&self, since: i64, limit: usize) -> ApiResult<ChangeFeedResponse> {
        let hold = self.hold_changes.lock().await.clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        self.enter(Call::Changes).await?;

        let limit = clamp_changes_limit(limit);
        let state = self.state.lock().await;
        let mut changes: Vec<ChangeEntry> = state
            .change_log
            .iter()
            .filter(|entry| entry.id > since)
            .take(limit + 1)
            .cloned()
            .collect();
        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let next_cursor = changes.last().map_or(since, |entry| entry.id);

        Ok(ChangeFeedResponse {
            changes,
            next_cursor,
            has_more,
        })
    }

    async fn latest_cursor(&self) -> ApiResult<i64> {
        self.enter(Call::LatestCursor).await?;
        Ok(self
            .state
            .lock()
            .await
            .change_log
            .last()
            .map_or(0, |entry| entry.id))
    }
}
