//! Data models for Trendy

mod event;
mod event_type;
mod geofence;
mod ids;
mod mutation;
mod patch;
mod sync_history;

pub use event::{Event, EventEdit, EventSource, SyncStatus};
pub use event_type::{EventType, EventTypeEdit};
pub use geofence::{
    Geofence, GeofenceEdit, PendingRegionEvent, RegionCrossing, MAX_RADIUS_METERS,
    MIN_RADIUS_METERS,
};
pub use ids::{EventId, EventTypeId, GeofenceId};
pub use mutation::{
    MutationEntity, MutationOperation, MutationStatus, NewMutation, PendingMutation,
};
pub use patch::Patch;
pub use sync_history::SyncHistoryEntry;
