//! Sync engine: flush the mutation queue, then pull the change feed or
//! bootstrap from a full snapshot.
//!
//! Only one cycle runs at a time. A trigger that arrives while a cycle is in
//! flight joins it and receives the same outcome. Cancelling bumps an epoch
//! the running cycle selects on, so the in-flight future is dropped at its
//! next await point and the state returns to idle.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use super::api::{ApiError, ApiResult, RemoteApi, RetryClass};
use super::breaker::CircuitBreaker;
use super::wire::{
    BatchCreateEventsResponse, CreateEventRequest, CreateGeofenceRequest, EventDto, EventTypeDto,
    UpdateEventRequest, UpdateEventTypeRequest, UpdateGeofenceRequest,
};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    EventId, EventTypeId, GeofenceId, MutationEntity, MutationOperation, PendingMutation,
    SyncHistoryEntry,
};
use crate::state::{SyncPhase, SyncProgress, SyncState};
use crate::store::{BootstrapSnapshot, LocalStore};

/// Upper bound of mutations considered in one flush
const FLUSH_LIMIT: usize = 10_000;

/// Summary of one completed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Mutations acknowledged by the server
    pub pushed: usize,
    /// Records applied from the change feed or snapshot
    pub pulled: usize,
    pub bootstrapped: bool,
    /// Flushing stopped early (rate limited, breaker open or server unavailable)
    pub flush_halted: bool,
}

/// Point-in-time view of the engine for status displays
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub state: SyncState,
    pub cursor: i64,
    pub pending: i64,
    pub failed: i64,
    pub breaker_open_secs: Option<u64>,
    pub last_sync: Option<SyncHistoryEntry>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone)]
enum CycleEnd {
    Completed(SyncReport),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Default)]
struct Flight {
    running: bool,
    completed: u64,
    last: Option<CycleEnd>,
}

#[derive(Debug, Default)]
struct FlushReport {
    pushed: usize,
    halted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Halt,
}

enum Prepared {
    Ready(CreateEventRequest),
    /// Waiting for a dependency (geofence server id) to sync first
    Deferred,
    Invalid(String),
}

enum Ack {
    Done,
    Remap(EventDto),
    GeofenceCreated(String),
}

enum Sent {
    Response(ApiResult<Ack>),
    Deferred,
    Invalid(String),
}

/// Drives sync cycles against a [`RemoteApi`]
pub struct SyncEngine {
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    config: SyncConfig,
    state: watch::Sender<SyncState>,
    flight: watch::Sender<Flight>,
    epoch: watch::Sender<u64>,
    breaker: Mutex<CircuitBreaker>,
}

impl SyncEngine {
    pub fn new(store: LocalStore, api: Arc<dyn RemoteApi>, config: SyncConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_base(), config.breaker_max());
        Self {
            store,
            api,
            config,
            state: watch::Sender::new(SyncState::Idle),
            flight: watch::Sender::new(Flight::default()),
            epoch: watch::Sender::new(0),
            breaker: Mutex::new(breaker),
        }
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.flight.borrow().running
    }

    /// Wait until no cycle is in flight
    pub async fn wait_idle(&self) {
        let mut flight = self.flight.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = flight.wait_for(|flight| !flight.running).await;
    }

    /// Run a sync cycle, or join the one already in flight
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut joined = None;
        self.flight.send_if_modified(|flight| {
            if flight.running {
                joined = Some(flight.completed);
                false
            } else {
                flight.running = true;
                true
            }
        });
        if let Some(seen) = joined {
            tracing::debug!("Sync already in flight, joining it");
            return self.join(seen).await;
        }

        let mut guard = FlightGuard {
            engine: self,
            end: None,
        };
        let started_at = Utc::now();
        let started = Instant::now();

        let result = self.run_cancellable().await;

        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let (end, next_state) = match &result {
            Ok(report) => (CycleEnd::Completed(*report), SyncState::Idle),
            Err(Error::Cancelled) => (CycleEnd::Cancelled, SyncState::Idle),
            Err(error) => (
                CycleEnd::Failed(error.to_string()),
                SyncState::Error {
                    message: error.to_string(),
                },
            ),
        };
        self.state.send_replace(next_state);
        self.record_history(&end, started_at, duration_ms).await;
        guard.end = Some(end);
        drop(guard);

        match &result {
            Ok(report) => tracing::info!(
                pushed = report.pushed,
                pulled = report.pulled,
                bootstrapped = report.bootstrapped,
                duration_ms,
                "Sync cycle completed"
            ),
            Err(Error::Cancelled) => tracing::info!(duration_ms, "Sync cycle cancelled"),
            Err(error) => tracing::warn!(%error, duration_ms, "Sync cycle failed"),
        }
        result
    }

    async fn join(&self, seen: u64) -> Result<SyncReport> {
        let mut flight = self.flight.subscribe();
        let finished = flight
            .wait_for(|flight| flight.completed > seen)
            .await
            .map_err(|_| Error::Cancelled)?;
        match finished.last.clone() {
            Some(CycleEnd::Completed(report)) => Ok(report),
            Some(CycleEnd::Failed(message)) => Err(Error::SyncFailed(message)),
            Some(CycleEnd::Cancelled) | None => Err(Error::Cancelled),
        }
    }

    async fn run_cancellable(&self) -> Result<SyncReport> {
        let mut epoch = self.epoch.subscribe();
        let start = *epoch.borrow_and_update();

        tokio::select! {
            biased;
            _ = epoch.wait_for(|current| *current != start) => Err(Error::Cancelled),
            result = self.cycle() => result,
        }
    }

    /// Drop the in-flight cycle, if any, at its next await point
    pub fn cancel_in_flight(&self) {
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        if self.is_syncing() {
            tracing::info!("Cancelling in-flight sync");
        }
    }

    /// Reset the cursor so the next cycle bootstraps from a full snapshot.
    ///
    /// The in-flight cycle is cancelled and fully unwound before the cursor
    /// is written, so a late pull cannot overwrite the reset.
    pub async fn force_resync(&self) -> Result<()> {
        let guard = self.take_flight().await;
        let reset = self.store.set_cursor(0).await;
        drop(guard);
        reset?;
        tracing::info!("Forced full resync");
        Ok(())
    }

    /// Cancel whatever is running and hold the flight slot until the guard
    /// drops. Triggers arriving meanwhile join and see `Cancelled`.
    async fn take_flight(&self) -> FlightGuard<'_> {
        loop {
            self.cancel_in_flight();
            self.wait_idle().await;
            let acquired = self.flight.send_if_modified(|flight| {
                if flight.running {
                    false
                } else {
                    flight.running = true;
                    true
                }
            });
            if acquired {
                return FlightGuard {
                    engine: self,
                    end: None,
                };
            }
        }
    }

    /// Delete every queued mutation and close the circuit breaker
    pub async fn clear_queue(&self) -> Result<usize> {
        let cleared = self.store.clear_mutations().await?;
        self.breaker.lock().await.reset();
        self.cancel_in_flight();
        tracing::warn!(cleared, "Cleared mutation queue");
        Ok(cleared)
    }

    /// Give failed mutations another chance
    pub async fn retry_failed(&self) -> Result<usize> {
        let retried = self.store.retry_failed_mutations().await?;
        tracing::info!(retried, "Re-queued failed mutations");
        Ok(retried)
    }

    pub async fn status(&self) -> Result<SyncStatusReport> {
        let cursor = self.store.cursor().await?;
        let (pending, failed) = self.store.mutation_counts().await?;
        let breaker_open_secs = self
            .breaker
            .lock()
            .await
            .remaining()
            .map(|remaining| remaining.as_secs());
        let last_sync = self.store.recent_history(1).await?.into_iter().next();

        let mut recommendations = Vec::new();
        if cursor == 0 {
            recommendations.push("Next sync downloads a full snapshot".to_string());
        }
        if failed > 0 {
            recommendations.push(format!(
                "{failed} mutation(s) were rejected; retry or clear the queue"
            ));
        }
        if let Some(secs) = breaker_open_secs {
            recommendations.push(format!("Server is rate limiting; flushing resumes in {secs}s"));
        }
        if matches!(&last_sync, Some(entry) if entry.outcome == "error") {
            recommendations.push("Last sync failed; check connectivity and credentials".to_string());
        }

        Ok(SyncStatusReport {
            state: self.state(),
            cursor,
            pending,
            failed,
            breaker_open_secs,
            last_sync,
            recommendations,
        })
    }

    fn publish(&self, phase: SyncPhase, completed: usize, total: usize) {
        self.state.send_replace(SyncState::Syncing(SyncProgress {
            phase,
            completed,
            total,
        }));
    }

    async fn record_history(
        &self,
        end: &CycleEnd,
        started_at: chrono::DateTime<Utc>,
        duration_ms: i64,
    ) {
        let (outcome, report, error) = match end {
            CycleEnd::Completed(report) => ("success", *report, None),
            CycleEnd::Failed(message) => ("error", SyncReport::default(), Some(message.clone())),
            CycleEnd::Cancelled => ("cancelled", SyncReport::default(), None),
        };
        let entry = SyncHistoryEntry {
            id: 0,
            started_at,
            duration_ms,
            outcome: outcome.to_string(),
            pushed: i64::try_from(report.pushed).unwrap_or(i64::MAX),
            pulled: i64::try_from(report.pulled).unwrap_or(i64::MAX),
            bootstrapped: report.bootstrapped,
            error,
        };
        if let Err(error) = self
            .store
            .record_history(&entry, self.config.history_limit)
            .await
        {
            tracing::warn!(%error, "Failed to record sync history");
        }
    }

    async fn cycle(&self) -> Result<SyncReport> {
        self.publish(SyncPhase::Preparing, 0, 0);
        self.store.ensure_ready().await?;

        let flush = self.flush().await?;

        let cursor = self.store.cursor().await?;
        let (pulled, bootstrapped) = if cursor == 0 {
            (self.bootstrap().await?, true)
        } else {
            (self.pull(cursor).await?, false)
        };

        Ok(SyncReport {
            pushed: flush.pushed,
            pulled,
            bootstrapped,
            flush_halted: flush.halted,
        })
    }

    /// Retry network errors and 5xx responses with exponential backoff
    async fn with_retry<T, F, Fut>(&self, mut call: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut attempt = 0_u32;
        loop {
            match call().await {
                Err(error)
                    if error.retry_class() == RetryClass::Transient
                        && attempt < self.config.transient_retries =>
                {
                    let delay = self
                        .config
                        .retry_base_delay()
                        .saturating_mul(1_u32 << attempt.min(16));
                    tracing::debug!(attempt, delay_ms = delay.as_millis(), %error, "Retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Call the backend outside the flush loop, opening the breaker on 429
    async fn remote<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        match self.with_retry(call).await {
            Ok(value) => Ok(value),
            Err(error) => {
                if let ApiError::RateLimited { retry_after } = &error {
                    self.breaker.lock().await.trip(*retry_after);
                }
                Err(error.into())
            }
        }
    }

    // Flush

    async fn flush(&self) -> Result<FlushReport> {
        let mut report = FlushReport::default();

        if let Some(remaining) = self.breaker.lock().await.remaining() {
            tracing::info!(
                remaining_secs = remaining.as_secs(),
                "Circuit breaker open, skipping flush"
            );
            report.halted = true;
            return Ok(report);
        }

        let pending = self.store.pending_mutations(FLUSH_LIMIT).await?;
        if pending.is_empty() {
            return Ok(report);
        }

        let total = pending.len();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut index = 0;
        self.publish(SyncPhase::Flushing, 0, total);

        while index < total {
            let mutation = &pending[index];
            if blocked.contains(&mutation.entity_id) {
                index += 1;
                continue;
            }

            let step = if mutation.is_event_create() {
                let end = create_run_end(&pending, index, self.config.batch_size);
                let step = self
                    .flush_event_creates(&pending[index..end], &mut blocked, &mut report)
                    .await?;
                index = end;
                step
            } else {
                index += 1;
                self.flush_one(mutation, &mut blocked, &mut report).await?
            };

            self.publish(SyncPhase::Flushing, index, total);
            if step == Step::Halt {
                report.halted = true;
                break;
            }
        }

        if !report.halted {
            self.breaker.lock().await.record_success();
        }
        tracing::info!(
            pushed = report.pushed,
            queued = total,
            halted = report.halted,
            "Flushed pending mutations"
        );
        Ok(report)
    }

    async fn flush_event_creates(
        &self,
        run: &[PendingMutation],
        blocked: &mut HashSet<String>,
        report: &mut FlushReport,
    ) -> Result<Step> {
        let mut items: Vec<(&PendingMutation, CreateEventRequest)> = Vec::with_capacity(run.len());
        for mutation in run {
            if blocked.contains(&mutation.entity_id) {
                continue;
            }
            match self.prepare_event_create(mutation).await? {
                Prepared::Ready(request) => items.push((mutation, request)),
                Prepared::Deferred => {
                    blocked.insert(mutation.entity_id.clone());
                }
                Prepared::Invalid(message) => {
                    self.abandon(mutation, &message).await?;
                    blocked.insert(mutation.entity_id.clone());
                }
            }
        }
        if items.is_empty() {
            return Ok(Step::Continue);
        }

        let requests: Vec<CreateEventRequest> =
            items.iter().map(|(_, request)| request.clone()).collect();
        let key = batch_idempotency_key(items.iter().map(|(mutation, _)| *mutation));
        match self
            .with_retry(|| self.api.batch_create_events(&requests, &key))
            .await
        {
            Ok(response) => {
                self.apply_batch_response(&items, response, blocked, report)
                    .await?;
                Ok(Step::Continue)
            }
            Err(ApiError::NotFound) => {
                // Backend without the batch endpoint
                tracing::debug!("Batch endpoint unavailable, sending creates one by one");
                for (mutation, _) in &items {
                    if self.flush_one(mutation, blocked, report).await? == Step::Halt {
                        return Ok(Step::Halt);
                    }
                }
                Ok(Step::Continue)
            }
            Err(error) => {
                let mutations: Vec<&PendingMutation> =
                    items.iter().map(|(mutation, _)| *mutation).collect();
                self.fail(&mutations, &error, blocked).await
            }
        }
    }

    async fn apply_batch_response(
        &self,
        items: &[(&PendingMutation, CreateEventRequest)],
        response: BatchCreateEventsResponse,
        blocked: &mut HashSet<String>,
        report: &mut FlushReport,
    ) -> Result<()> {
        let rejected: HashMap<usize, String> = response
            .errors
            .into_iter()
            .map(|error| (error.index, error.message))
            .collect();
        let created = response.created;
        let mut used = vec![false; created.len()];
        let mut unmatched = Vec::new();

        for (index, (mutation, request)) in items.iter().enumerate() {
            if let Some(message) = rejected.get(&index) {
                let error = ApiError::Validation {
                    status: 400,
                    message: message.clone(),
                };
                self.fail(&[*mutation], &error, blocked).await?;
                continue;
            }
            let matched = created
                .iter()
                .enumerate()
                .position(|(i, dto)| !used[i] && dto.id == request.id);
            if let Some(position) = matched {
                used[position] = true;
                self.store.complete_mutation(mutation).await?;
                report.pushed += 1;
            } else {
                unmatched.push((*mutation, request));
            }
        }

        for (mutation, request) in unmatched {
            let matched = created
                .iter()
                .enumerate()
                .position(|(i, dto)| !used[i] && same_source_record(request, dto));
            if let Some(position) = matched {
                used[position] = true;
                self.store.remap_event(mutation, &created[position]).await?;
                report.pushed += 1;
            } else {
                tracing::warn!(
                    mutation = %mutation,
                    "Batch response did not include event, keeping it queued"
                );
            }
        }
        Ok(())
    }

    async fn flush_one(
        &self,
        mutation: &PendingMutation,
        blocked: &mut HashSet<String>,
        report: &mut FlushReport,
    ) -> Result<Step> {
        let response = match self.send(mutation).await? {
            Sent::Response(response) => response,
            Sent::Deferred => {
                blocked.insert(mutation.entity_id.clone());
                return Ok(Step::Continue);
            }
            Sent::Invalid(message) => {
                self.abandon(mutation, &message).await?;
                blocked.insert(mutation.entity_id.clone());
                return Ok(Step::Continue);
            }
        };

        match response {
            Ok(Ack::Done) => self.store.complete_mutation(mutation).await?,
            Ok(Ack::Remap(dto)) => self.store.remap_event(mutation, &dto).await?,
            Ok(Ack::GeofenceCreated(server_id)) => {
                self.store
                    .complete_geofence_create(mutation, &server_id)
                    .await?;
            }
            Err(error) if already_applied(mutation, &error) => {
                tracing::debug!(mutation = %mutation, %error, "Server already applied mutation");
                self.store.complete_mutation(mutation).await?;
            }
            Err(error) => return self.fail(&[mutation], &error, blocked).await,
        }
        report.pushed += 1;
        Ok(Step::Continue)
    }

    async fn send(&self, mutation: &PendingMutation) -> Result<Sent> {
        use MutationEntity as Entity;
        use MutationOperation as Op;

        let id = mutation.entity_id.as_str();
        let key = mutation.idempotency_key.as_str();
        let sent = match (mutation.entity, mutation.operation) {
            (Entity::Event, Op::Create) => match self.prepare_event_create(mutation).await? {
                Prepared::Ready(request) => Sent::Response(
                    self.with_retry(|| self.api.create_event(&request, key))
                        .await
                        .map(|dto| {
                            if dto.id == request.id {
                                Ack::Done
                            } else {
                                Ack::Remap(dto)
                            }
                        }),
                ),
                Prepared::Deferred => Sent::Deferred,
                Prepared::Invalid(message) => Sent::Invalid(message),
            },
            (Entity::Event, Op::Update) => {
                let (Ok(id), Ok(request)) = (
                    id.parse::<EventId>(),
                    decode::<UpdateEventRequest>(mutation),
                ) else {
                    return Ok(Sent::Invalid(invalid_payload(mutation)));
                };
                Sent::Response(
                    self.with_retry(|| self.api.update_event(&id, &request, key))
                        .await
                        .map(|_| Ack::Done),
                )
            }
            (Entity::Event, Op::Delete) => {
                let Ok(id) = id.parse::<EventId>() else {
                    return Ok(Sent::Invalid(invalid_payload(mutation)));
                };
                Sent::Response(
                    self.with_retry(|| self.api.delete_event(&id))
                        .await
                        .map(|()| Ack::Done),
                )
            }
            (Entity::EventType, Op::Create) => {
                let Ok(request) = decode::<EventTypeDto>(mutation) else {
                    return Ok(Sent::Invalid(invalid_payload(mutation)));
                };
                Sent::Response(
                    self.with_retry(|| self.api.create_event_type(&request, key))
                        .await
                        .map(|_| Ack::Done),
                )
            }
            (Entity::EventType, Op::Update) => {
                let (Ok(id), Ok(request)) = (
                    id.parse::<EventTypeId>(),
                    decode::<UpdateEventTypeRequest>(mutation),
                ) else {
                    return Ok(Sent::Invalid(invalid_payload(mutation)));
                };
                Sent::Response(
                    self.with_retry(|| self.api.update_event_type(&id, &request, key))
                        .await
                        .map(|_| Ack::Done),
                )
            }
            (Entity::EventType, Op::Delete) => {
                let Ok(id) = id.parse::<EventTypeId>() else {
                    return Ok(Sent::Invalid(invalid_payload(mutation)));
                };
                Sent::Response(
                    self.with_retry(|| self.api.delete_event_type(&id))
                        .await
                        .map(|()| Ack::Done),
                )
            }
            (Entity::Geofence, Op::Create) => {
                let Ok(request) = decode::<CreateGeofenceRequest>(mutation) else {
                    return Ok(Sent::Invalid(invalid_payload(mutation)));
                };
                Sent::Response(
                    self.with_retry(|| self.api.create_geofence(&request, key))
                        .await
                        .map(|dto| Ack::GeofenceCreated(dto.id)),
                )
            }
            (Entity::Geofence, Op::Update) => {
                let (Ok(local_id), Ok(request)) = (
                    id.parse::<GeofenceId>(),
                    decode::<UpdateGeofenceRequest>(mutation),
                ) else {
                    return Ok(Sent::Invalid(invalid_payload(mutation)));
                };
                let Some(server_id) = self.store.geofence_server_id(&local_id).await? else {
                    return Ok(Sent::Deferred);
                };
                Sent::Response(
                    self.with_retry(|| self.api.update_geofence(&server_id, &request, key))
                        .await
                        .map(|_| Ack::Done),
                )
            }
            (Entity::Geofence, Op::Delete) => {
                let Some(server_id) = mutation
                    .payload
                    .get("server_id")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                else {
                    return Ok(Sent::Invalid(invalid_payload(mutation)));
                };
                Sent::Response(
                    self.with_retry(|| self.api.delete_geofence(&server_id))
                        .await
                        .map(|()| Ack::Done),
                )
            }
        };
        Ok(sent)
    }

    /// Decode a queued event create and swap the local geofence id for the
    /// server one
    async fn prepare_event_create(&self, mutation: &PendingMutation) -> Result<Prepared> {
        let Ok(mut request) = decode::<CreateEventRequest>(mutation) else {
            return Ok(Prepared::Invalid(invalid_payload(mutation)));
        };

        // Ids that do not parse as local ids are already server ids
        let local_id = request
            .geofence_id
            .as_deref()
            .and_then(|id| id.parse::<GeofenceId>().ok());
        if let Some(local_id) = local_id {
            match self.store.get_geofence(&local_id).await? {
                Some(geofence) => match geofence.server_id {
                    Some(server_id) => request.geofence_id = Some(server_id),
                    None => return Ok(Prepared::Deferred),
                },
                None => request.geofence_id = None,
            }
        }
        Ok(Prepared::Ready(request))
    }

    /// Record a failure for `mutations` according to the error's retry class
    async fn fail(
        &self,
        mutations: &[&PendingMutation],
        error: &ApiError,
        blocked: &mut HashSet<String>,
    ) -> Result<Step> {
        let message = error.to_string();
        match error.retry_class() {
            RetryClass::Fatal => Err(Error::Api(error.clone())),
            RetryClass::RateLimited => {
                let retry_after = match error {
                    ApiError::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                self.breaker.lock().await.trip(retry_after);
                for mutation in mutations {
                    self.store
                        .record_mutation_failure(mutation, &message, false, self.config.max_attempts)
                        .await?;
                }
                Ok(Step::Halt)
            }
            RetryClass::Transient => {
                for mutation in mutations {
                    // Outages count as attempts but never abandon a local write
                    self.store
                        .record_mutation_failure(mutation, &message, true, u32::MAX)
                        .await?;
                }
                tracing::warn!(%error, "Server unavailable, stopping flush");
                Ok(Step::Halt)
            }
            RetryClass::Permanent => {
                for mutation in mutations {
                    let outcome = self
                        .store
                        .record_mutation_failure(mutation, &message, true, self.config.max_attempts)
                        .await?;
                    blocked.insert(mutation.entity_id.clone());
                    if outcome.abandoned {
                        tracing::warn!(
                            mutation = %mutation,
                            attempts = outcome.attempts,
                            %error,
                            "Mutation rejected too often, marked failed"
                        );
                    }
                }
                Ok(Step::Continue)
            }
        }
    }

    async fn abandon(&self, mutation: &PendingMutation, message: &str) -> Result<()> {
        tracing::warn!(
            mutation = %mutation,
            reason = message,
            "Dropping undecodable mutation from flush"
        );
        self.store
            .record_mutation_failure(mutation, message, true, mutation.attempts.saturating_add(1))
            .await?;
        Ok(())
    }

    // Pull

    async fn bootstrap(&self) -> Result<usize> {
        self.publish(SyncPhase::Bootstrapping, 0, 0);

        // Cursor first: changes made while the snapshot downloads are pulled next cycle
        let cursor = self.remote(|| self.api.latest_cursor()).await?;
        let snapshot = BootstrapSnapshot {
            event_types: self.remote(|| self.api.list_event_types()).await?,
            geofences: self.remote(|| self.api.list_geofences()).await?,
            events: self.fetch_all_events().await?,
        };
        self.publish(SyncPhase::Bootstrapping, 0, snapshot.len());

        let inserted = self.store.replace_with_snapshot(&snapshot, cursor).await?;
        tracing::info!(cursor, records = snapshot.len(), inserted, "Bootstrapped local store");
        Ok(inserted)
    }

    /// Page through the event listing until the server runs dry. Pages may
    /// be shorter than requested, so only an empty page (or one that adds
    /// nothing new) ends the walk.
    async fn fetch_all_events(&self) -> Result<Vec<EventDto>> {
        let limit = self.config.snapshot_page_size;
        let mut events = Vec::new();
        let mut seen = HashSet::new();
        loop {
            let offset = events.len();
            let page = self
                .remote(|| self.api.list_events(limit, offset))
                .await?;
            let before = events.len();
            for event in page {
                if seen.insert(event.id) {
                    events.push(event);
                }
            }
            tracing::debug!(offset, fetched = events.len() - before, "Fetched event page");
            if events.len() == before {
                break;
            }
            self.publish(SyncPhase::Bootstrapping, events.len(), 0);
        }
        Ok(events)
    }

    async fn pull(&self, mut cursor: i64) -> Result<usize> {
        let mut pulled = 0;
        loop {
            self.publish(SyncPhase::Pulling, pulled, 0);
            let since = cursor;
            let page = self
                .remote(|| self.api.changes(since, self.config.page_size))
                .await?;
            let outcome = self.store.apply_change_page(&page).await?;
            pulled += outcome.applied;

            let advanced = page.next_cursor > cursor;
            cursor = cursor.max(page.next_cursor);
            tracing::debug!(
                cursor,
                applied = outcome.applied,
                skipped = outcome.skipped,
                "Applied change page"
            );
            if !page.has_more || !advanced {
                break;
            }
        }
        Ok(pulled)
    }
}

/// Publishes the end of a cycle even when the leading future is dropped
struct FlightGuard<'a> {
    engine: &'a SyncEngine,
    end: Option<CycleEnd>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let end = self.end.take().unwrap_or(CycleEnd::Cancelled);
        self.engine.state.send_if_modified(|state| {
            if state.is_syncing() {
                *state = SyncState::Idle;
                true
            } else {
                false
            }
        });
        self.engine.flight.send_modify(|flight| {
            flight.running = false;
            flight.completed += 1;
            flight.last = Some(end);
        });
    }
}

/// Key of a batch request, stable for as long as the batch carries the same
/// mutations in the same order
fn batch_idempotency_key<'a>(mutations: impl Iterator<Item = &'a PendingMutation>) -> String {
    let members: Vec<&str> = mutations
        .map(|mutation| mutation.idempotency_key.as_str())
        .collect();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, members.join(",").as_bytes()).to_string()
}

/// End (exclusive) of the run of consecutive event creates starting at `start`
fn create_run_end(pending: &[PendingMutation], start: usize, batch_size: usize) -> usize {
    let limit = start.saturating_add(batch_size.max(1)).min(pending.len());
    let mut end = start;
    while end < limit && pending[end].is_event_create() {
        end += 1;
    }
    end
}

/// Fallback match for a batch item the server stored under another id
fn same_source_record(request: &CreateEventRequest, dto: &EventDto) -> bool {
    let same = |left: &Option<String>, right: &Option<String>| {
        left.is_some() && left.as_deref() == right.as_deref()
    };
    same(&request.healthkit_sample_id, &dto.healthkit_sample_id)
        || same(&request.external_id, &dto.external_id)
}

/// 404 on delete and 409 on create mean the server is already in the
/// requested state
fn already_applied(mutation: &PendingMutation, error: &ApiError) -> bool {
    matches!(
        (mutation.operation, error),
        (MutationOperation::Delete, ApiError::NotFound)
            | (MutationOperation::Create, ApiError::Conflict(_))
    )
}

fn decode<T: DeserializeOwned>(mutation: &PendingMutation) -> serde_json::Result<T> {
    serde_json::from_value(mutation.payload.clone())
}

fn invalid_payload(mutation: &PendingMutation) -> String {
    format!("invalid payload for {mutation}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::models::{Event, EventEdit, EventSource, Geofence, MutationStatus, Patch, SyncStatus};
    use crate::sync::fake::{Call, FakeRemote};

    fn test_config() -> SyncConfig {
        SyncConfig {
            retry_base_delay_ms: 1,
            ..SyncConfig::default()
        }
    }

    fn engine_with(config: SyncConfig) -> (SyncEngine, Arc<FakeRemote>) {
        let store = LocalStore::open_in_memory().unwrap();
        let remote = FakeRemote::new();
        let engine = SyncEngine::new(store, remote.clone(), config);
        (engine, remote)
    }

    fn server_event(event_type_id: EventTypeId) -> EventDto {
        EventDto {
            id: EventId::new(),
            event_type_id,
            timestamp: Utc::now(),
            notes: None,
            is_all_day: false,
            end_date: None,
            source_type: "manual".to_string(),
            external_id: None,
            geofence_id: None,
            healthkit_sample_id: None,
            healthkit_category: None,
            properties: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        }
    }

    async fn queue_event(engine: &SyncEngine) -> Event {
        let event = Event::new(EventTypeId::new(), Utc::now());
        engine.store().create_event(&event).await.unwrap();
        event
    }

    #[tokio::test]
    async fn test_flush_batches_consecutive_event_creates() {
        let (engine, remote) = engine_with(SyncConfig {
            batch_size: 2,
            ..test_config()
        });
        for _ in 0..3 {
            queue_event(&engine).await;
        }

        let report = engine.sync().await.unwrap();

        assert_eq!(report.pushed, 3);
        assert!(report.bootstrapped);
        assert_eq!(remote.state.lock().await.batch_sizes, vec![2, 1]);
        assert_eq!(engine.store().mutation_counts().await.unwrap(), (0, 0));
        assert_eq!(engine.store().event_count().await.unwrap(), 3);
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_rate_limit_opens_breaker_without_counting_attempt() {
        let (engine, remote) = engine_with(test_config());
        queue_event(&engine).await;
        remote
            .fail_next(
                Call::BatchCreate,
                ApiError::RateLimited {
                    retry_after: Some(Duration::from_secs(120)),
                },
                1,
            )
            .await;

        let report = engine.sync().await.unwrap();
        assert!(report.flush_halted);
        assert_eq!(report.pushed, 0);

        let queued = engine.store().list_mutations().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 0);
        assert_eq!(queued[0].status, MutationStatus::Pending);

        let status = engine.status().await.unwrap();
        assert!(status.breaker_open_secs.unwrap() >= 100);

        // Breaker still open: the next cycle does not touch the queue
        engine.sync().await.unwrap();
        assert_eq!(remote.calls(Call::BatchCreate).await, 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_abandoned_at_ceiling() {
        let (engine, remote) = engine_with(SyncConfig {
            max_attempts: 2,
            ..test_config()
        });
        let event = queue_event(&engine).await;
        remote
            .fail_next(
                Call::BatchCreate,
                ApiError::Validation {
                    status: 422,
                    message: "bad timestamp".to_string(),
                },
                2,
            )
            .await;

        engine.sync().await.unwrap();
        let queued = engine.store().list_mutations().await.unwrap();
        assert_eq!(queued[0].attempts, 1);
        assert_eq!(queued[0].status, MutationStatus::Pending);

        engine.sync().await.unwrap();
        let queued = engine.store().list_mutations().await.unwrap();
        assert_eq!(queued[0].attempts, 2);
        assert_eq!(queued[0].status, MutationStatus::Failed);

        engine.sync().await.unwrap();
        assert_eq!(remote.calls(Call::BatchCreate).await, 2);

        let local = engine.store().get_event(&event.id).await.unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Failed);
        assert_eq!(engine.status().await.unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_within_cycle() {
        let (engine, remote) = engine_with(SyncConfig::default());
        queue_event(&engine).await;
        remote
            .fail_next(
                Call::BatchCreate,
                ApiError::Server {
                    status: 503,
                    message: "unavailable".to_string(),
                },
                2,
            )
            .await;

        let report = engine.sync().await.unwrap();

        assert_eq!(report.pushed, 1);
        assert_eq!(remote.calls(Call::BatchCreate).await, 3);
        assert_eq!(engine.store().mutation_counts().await.unwrap(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_outage_counts_attempt_and_halts() {
        let (engine, remote) = engine_with(SyncConfig::default());
        queue_event(&engine).await;
        remote
            .fail_next(Call::BatchCreate, ApiError::Network("offline".to_string()), 4)
            .await;

        let report = engine.sync().await.unwrap();

        assert!(report.flush_halted);
        let queued = engine.store().list_mutations().await.unwrap();
        assert_eq!(queued[0].attempts, 1);
        assert_eq!(queued[0].status, MutationStatus::Pending);
    }

    #[tokio::test]
    async fn test_unauthorized_aborts_cycle() {
        let (engine, remote) = engine_with(test_config());
        queue_event(&engine).await;
        remote
            .fail_next(Call::BatchCreate, ApiError::Unauthorized, 1)
            .await;

        let result = engine.sync().await;

        assert!(matches!(result, Err(Error::Api(ApiError::Unauthorized))));
        assert!(matches!(engine.state(), SyncState::Error { .. }));
        let history = engine.store().recent_history(1).await.unwrap();
        assert_eq!(history[0].outcome, "error");
        assert_eq!(engine.store().mutation_counts().await.unwrap(), (1, 0));
    }

    #[tokio::test]
    async fn test_delete_of_missing_server_record_is_acknowledged() {
        let (engine, remote) = engine_with(test_config());
        let event = queue_event(&engine).await;
        engine.sync().await.unwrap();

        remote.state.lock().await.events.clear();
        engine.store().delete_event(&event.id).await.unwrap();
        engine.sync().await.unwrap();

        assert_eq!(remote.calls(Call::DeleteEvent).await, 1);
        assert_eq!(engine.store().mutation_counts().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_cleared_notes_reach_server_as_null() {
        let (engine, remote) = engine_with(test_config());
        let event = Event::new(EventTypeId::new(), Utc::now()).with_notes("tempo run");
        engine.store().create_event(&event).await.unwrap();
        engine.sync().await.unwrap();

        let edit = EventEdit {
            notes: Patch::Null,
            ..EventEdit::default()
        };
        engine.store().update_event(&event.id, &edit).await.unwrap();
        engine.sync().await.unwrap();

        let state = remote.state.lock().await;
        assert_eq!(state.event_updates.last(), Some(&json!({ "notes": null })));
        assert_eq!(state.events[&event.id].notes, None);
    }

    #[tokio::test]
    async fn test_force_resync_replaces_local_with_server_state() {
        let (engine, remote) = engine_with(test_config());
        let local_only = queue_event(&engine).await;
        engine.sync().await.unwrap();

        // Server loses the record without a change entry and gains another
        remote.state.lock().await.events.remove(&local_only.id);
        let server = server_event(EventTypeId::new());
        remote.seed_event(server.clone()).await;

        engine.force_resync().await.unwrap();
        let report = engine.sync().await.unwrap();

        assert!(report.bootstrapped);
        let ids: Vec<EventId> = engine
            .store()
            .list_events(100, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.id)
            .collect();
        assert_eq!(ids, vec![server.id]);
        assert!(engine.store().cursor().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_force_resync_unwinds_in_flight_pull_before_reset() {
        let (engine, remote) = engine_with(test_config());
        engine.store().set_cursor(1).await.unwrap();
        let hold = Arc::new(Notify::new());
        *remote.hold_changes.lock().await = Some(hold.clone());

        let (result, ()) = tokio::join!(engine.sync(), async {
            tokio::task::yield_now().await;
            engine.force_resync().await.unwrap();
            assert!(!engine.is_syncing());
            hold.notify_one();
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(engine.store().cursor().await.unwrap(), 0);

        *remote.hold_changes.lock().await = None;
        let report = engine.sync().await.unwrap();
        assert!(report.bootstrapped);
    }

    #[tokio::test]
    async fn test_bootstrap_pages_past_server_cap() {
        let (engine, remote) = engine_with(test_config());
        let event_type_id = EventTypeId::new();
        for _ in 0..120 {
            remote.seed_event(server_event(event_type_id)).await;
        }
        remote.state.lock().await.events_page_cap = Some(50);

        let report = engine.sync().await.unwrap();

        assert!(report.bootstrapped);
        assert_eq!(engine.store().event_count().await.unwrap(), 120);
        // 50 + 50 + 20, then an empty page ends the walk
        assert_eq!(remote.calls(Call::ListEvents).await, 4);
    }

    #[tokio::test]
    async fn test_lost_create_response_is_replayed_not_reapplied() {
        let (engine, remote) = engine_with(test_config());
        let geofence = Geofence::new("Gym", 37.77, -122.41, 100.0, None).unwrap();
        engine.store().create_geofence(&geofence).await.unwrap();
        let key = engine.store().list_mutations().await.unwrap()[0]
            .idempotency_key
            .clone();
        remote.state.lock().await.lose_next_response = Some(Call::CreateGeofence);

        let report = engine.sync().await.unwrap();

        assert_eq!(report.pushed, 1);
        let state = remote.state.lock().await;
        assert_eq!(state.geofences.len(), 1);
        assert_eq!(state.replayed, 1);
        assert_eq!(state.idempotency_keys, vec![key.clone(), key]);
        drop(state);
        assert!(engine.store().list_mutations().await.unwrap().is_empty());
    }

    #[test]
    fn batch_key_follows_members() {
        let queued = |key: &str| PendingMutation {
            id: 1,
            entity: MutationEntity::Event,
            operation: MutationOperation::Create,
            entity_id: "e".to_string(),
            payload: json!({}),
            attempts: 0,
            last_error: None,
            status: MutationStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            idempotency_key: key.to_string(),
        };
        let (a, b) = (queued("a"), queued("b"));

        let key = batch_idempotency_key([&a, &b].into_iter());
        assert_eq!(key, batch_idempotency_key([&a, &b].into_iter()));
        assert_ne!(key, batch_idempotency_key([&a].into_iter()));
        assert_ne!(key, batch_idempotency_key([&b, &a].into_iter()));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_share_one_cycle() {
        let (engine, remote) = engine_with(test_config());
        engine.store().set_cursor(1).await.unwrap();
        let hold = Arc::new(Notify::new());
        *remote.hold_changes.lock().await = Some(hold.clone());

        let (first, second, ()) = tokio::join!(engine.sync(), engine.sync(), async {
            tokio::task::yield_now().await;
            hold.notify_one();
        });

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(remote.calls(Call::Changes).await, 1);
        assert_eq!(engine.store().recent_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_in_flight_cycle() {
        let (engine, remote) = engine_with(test_config());
        engine.store().set_cursor(1).await.unwrap();
        *remote.hold_changes.lock().await = Some(Arc::new(Notify::new()));

        let (result, ()) = tokio::join!(engine.sync(), async {
            tokio::task::yield_now().await;
            engine.cancel_in_flight();
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(engine.state(), SyncState::Idle);
        assert!(!engine.is_syncing());
        let history = engine.store().recent_history(1).await.unwrap();
        assert_eq!(history[0].outcome, "cancelled");
    }

    #[tokio::test]
    async fn test_clear_queue_closes_breaker() {
        let (engine, remote) = engine_with(test_config());
        queue_event(&engine).await;
        remote
            .fail_next(
                Call::BatchCreate,
                ApiError::RateLimited { retry_after: None },
                1,
            )
            .await;
        engine.sync().await.unwrap();
        assert!(engine.status().await.unwrap().breaker_open_secs.is_some());

        assert_eq!(engine.clear_queue().await.unwrap(), 1);

        let status = engine.status().await.unwrap();
        assert_eq!(status.breaker_open_secs, None);
        assert_eq!(status.pending, 0);
    }

    #[tokio::test]
    async fn test_batch_item_stored_under_server_id_is_remapped() {
        let (engine, remote) = engine_with(test_config());
        let type_id = EventTypeId::new();
        let mut server = server_event(type_id);
        server.source_type = "healthkit".to_string();
        server.healthkit_sample_id = Some("hk-1".to_string());
        remote.seed_event(server.clone()).await;

        let mut local = Event::new(type_id, server.timestamp);
        local.source = EventSource::HealthKit;
        local.healthkit_sample_id = Some("hk-1".to_string());
        engine.store().create_event(&local).await.unwrap();

        let report = engine.sync().await.unwrap();

        assert_eq!(report.pushed, 1);
        let events = engine.store().list_events(100, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, server.id);
        assert_eq!(engine.store().mutation_counts().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_event_create_waits_for_geofence_server_id() {
        let (engine, remote) = engine_with(test_config());
        let geofence = Geofence::new("Gym", 37.77, -122.41, 100.0, None).unwrap();
        engine.store().create_geofence(&geofence).await.unwrap();
        let mut event = Event::new(EventTypeId::new(), Utc::now());
        event.source = EventSource::Geofence;
        event.geofence_id = Some(geofence.id);
        engine.store().create_event(&event).await.unwrap();

        engine.sync().await.unwrap();

        let server_id = engine
            .store()
            .get_geofence(&geofence.id)
            .await
            .unwrap()
            .and_then(|geofence| geofence.server_id)
            .unwrap();
        assert_eq!(
            remote.state.lock().await.events[&event.id].geofence_id,
            Some(server_id)
        );
        let local = engine.store().get_event(&event.id).await.unwrap().unwrap();
        assert_eq!(local.geofence_id, Some(geofence.id));
    }
}
