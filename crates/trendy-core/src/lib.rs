//! trendy-core - Core library for Trendy
//!
//! This crate contains the models, local store, mutation queue, sync engine
//! and ingestion pipelines shared by every Trendy host (mobile shell, CLI).

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod state;
pub mod store;
pub mod sync;
pub mod util;

pub use config::TrendyConfig;
pub use coordinator::{BackgroundExtender, NoopExtender, SyncCoordinator, SyncTrigger};
pub use error::{Error, Result};
pub use models::{Event, EventId, EventType, EventTypeId, Geofence, GeofenceId};
pub use state::{SyncPhase, SyncProgress, SyncState};
pub use store::LocalStore;
pub use sync::{HttpRemoteApi, RemoteApi, SyncEngine, SyncReport, SyncStatusReport};
