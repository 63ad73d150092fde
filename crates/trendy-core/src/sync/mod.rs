//! Server synchronization: wire types, the backend client and the engine
//! that drives flush and pull cycles.

pub mod api;
mod breaker;
mod engine;
#[cfg(test)]
pub(crate) mod fake;
mod http;
pub mod wire;

pub use api::{
    clamp_changes_limit, clamp_events_limit, ApiError, ApiResult, RemoteApi, RetryClass,
    DEFAULT_CHANGES_LIMIT, MAX_CHANGES_LIMIT, MAX_EVENTS_LIMIT,
};
pub use breaker::CircuitBreaker;
pub use engine::{SyncEngine, SyncReport, SyncStatusReport};
pub use http::HttpRemoteApi;
