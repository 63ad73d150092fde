//! Database layer for Trendy

mod columns;
mod connection;
mod event_repository;
mod event_type_repository;
mod geofence_repository;
mod history_repository;
mod migrations;
mod mutation_queue;
mod pending_region_repository;
mod sync_state_repository;

pub use connection::Database;
pub use event_repository::{EventRepository, SqliteEventRepository};
pub use event_type_repository::SqliteEventTypeRepository;
pub use geofence_repository::SqliteGeofenceRepository;
pub use history_repository::SqliteHistoryRepository;
pub use migrations::CURRENT_VERSION as SCHEMA_VERSION;
pub use mutation_queue::{FailureOutcome, SqliteMutationQueue};
pub use pending_region_repository::SqlitePendingRegionRepository;
pub use sync_state_repository::{SqliteSyncStateRepository, SyncStateRepository};
