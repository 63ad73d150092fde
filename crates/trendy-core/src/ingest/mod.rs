//! Importers turning platform deliveries into local events

pub mod geofence;
pub mod healthkit;

pub use geofence::{
    sync_monitored_regions, CrossingOutcome, Delivery, DrainReport, GeofenceInbox,
    GeofenceIngestor, LocationAuthorization, MonitoredRegion, RegionMonitor, RegionSyncReport,
};
pub use healthkit::{
    AnchoredBatch, HealthKitIngestor, HealthSample, HealthSampleSource, HeartRateStats,
    ImportProgress, IngestReport, ObserverCompletion, SampleOutcome,
};
