//! Remote API port used by the sync engine

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::wire::{
    BatchCreateEventsResponse, ChangeFeedResponse, CreateEventRequest, CreateGeofenceRequest,
    EventDto, EventTypeDto, GeofenceDto, UpdateEventRequest, UpdateEventTypeRequest,
    UpdateGeofenceRequest,
};
use crate::models::{EventId, EventTypeId};

/// Default page size of the change feed
pub const DEFAULT_CHANGES_LIMIT: usize = 100;
/// Largest page size the change feed accepts
pub const MAX_CHANGES_LIMIT: usize = 500;

/// Largest page the event listing honors; larger requests fall back to 100
pub const MAX_EVENTS_LIMIT: usize = 1000;

/// Clamp a requested change-feed page size to what the server accepts
pub fn clamp_changes_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_CHANGES_LIMIT)
}

pub fn clamp_events_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_EVENTS_LIMIT)
}

/// Transport-level failure classified for retry decisions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed ({status}): {message}")]
    Validation { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
}

/// How the flush loop should react to an [`ApiError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry in-cycle with backoff
    Transient,
    /// Open the circuit breaker, do not count an attempt
    RateLimited,
    /// Count an attempt, never retry in-cycle
    Permanent,
    /// Abort the cycle
    Fatal,
}

impl ApiError {
    pub const fn retry_class(&self) -> RetryClass {
        match self {
            Self::Network(_) | Self::Server { .. } => RetryClass::Transient,
            Self::RateLimited { .. } => RetryClass::RateLimited,
            Self::Unauthorized => RetryClass::Fatal,
            Self::NotFound | Self::Conflict(_) | Self::Validation { .. } | Self::Decode(_) => {
                RetryClass::Permanent
            }
        }
    }

    /// Map an HTTP status and message to an error
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 => Self::Unauthorized,
            404 => Self::NotFound,
            409 => Self::Conflict(message),
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::Server { status, message },
            _ => Self::Validation { status, message },
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Operations the sync engine needs from the backend.
///
/// Every create and update carries the queued mutation's idempotency key, so
/// a write the server applied but whose response was lost is replayed
/// rather than applied twice.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create_event(
        &self,
        request: &CreateEventRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventDto>;

    async fn batch_create_events(
        &self,
        requests: &[CreateEventRequest],
        idempotency_key: &str,
    ) -> ApiResult<BatchCreateEventsResponse>;

    async fn update_event(
        &self,
        id: &EventId,
        request: &UpdateEventRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventDto>;

    async fn delete_event(&self, id: &EventId) -> ApiResult<()>;

    /// One page of the caller's events, newest first
    async fn list_events(&self, limit: usize, offset: usize) -> ApiResult<Vec<EventDto>>;

    async fn create_event_type(
        &self,
        request: &EventTypeDto,
        idempotency_key: &str,
    ) -> ApiResult<EventTypeDto>;

    async fn update_event_type(
        &self,
        id: &EventTypeId,
        request: &UpdateEventTypeRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventTypeDto>;

    async fn delete_event_type(&self, id: &EventTypeId) -> ApiResult<()>;

    async fn list_event_types(&self) -> ApiResult<Vec<EventTypeDto>>;

    async fn create_geofence(
        &self,
        request: &CreateGeofenceRequest,
        idempotency_key: &str,
    ) -> ApiResult<GeofenceDto>;

    async fn update_geofence(
        &self,
        server_id: &str,
        request: &UpdateGeofenceRequest,
        idempotency_key: &str,
    ) -> ApiResult<GeofenceDto>;

    async fn delete_geofence(&self, server_id: &str) -> ApiResult<()>;

    async fn list_geofences(&self) -> ApiResult<Vec<GeofenceDto>>;

    /// One page of the change feed after `since`
    async fn changes(&self, since: i64, limit: usize) -> ApiResult<ChangeFeedResponse>;

    /// Cursor of the newest change, taken before a bootstrap snapshot
    async fn latest_cursor(&self) -> ApiResult<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            ApiError::from_status(429, String::new(), None).retry_class(),
            RetryClass::RateLimited
        );
        assert_eq!(
            ApiError::from_status(503, String::new(), None).retry_class(),
            RetryClass::Transient
        );
        assert_eq!(
            ApiError::from_status(422, "bad".to_string(), None).retry_class(),
            RetryClass::Permanent
        );
        assert_eq!(
            ApiError::from_status(401, String::new(), None).retry_class(),
            RetryClass::Fatal
        );
        assert_eq!(ApiError::from_status(404, String::new(), None), ApiError::NotFound);
    }

    #[test]
    fn clamps_changes_limit() {
        assert_eq!(clamp_changes_limit(0), 1);
        assert_eq!(clamp_changes_limit(100), 100);
        assert_eq!(clamp_changes_limit(10_000), MAX_CHANGES_LIMIT);
        assert_eq!(clamp_events_limit(5_000), MAX_EVENTS_LIMIT);
    }
}
