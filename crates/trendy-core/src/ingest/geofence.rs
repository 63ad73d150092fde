//! Geofence crossing ingestion.
//!
//! An entry records an open event (no `end_date`); the matching exit closes
//! it. The duplicate-entry check runs against the store, not memory, so it
//! holds across process restarts.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::GeofenceConfig;
use crate::error::{Error, Result};
use crate::models::{Event, EventEdit, EventId, EventSource, Geofence, Patch, RegionCrossing};
use crate::store::LocalStore;

/// Regions the platform monitors at most at once
pub const MAX_MONITORED_REGIONS: usize = 20;

/// What handling one crossing did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrossingOutcome {
    /// Entry recorded as a new open event
    Recorded(EventId),
    /// Exit closed this open entry
    Closed(EventId),
    /// An open entry inside the duplicate window already exists
    DuplicateEntry(EventId),
    /// The same crossing is being handled concurrently
    InFlight,
    UnknownRegion,
    Inactive,
    /// The geofence has no entry event type
    NoEventType,
    /// Exit without a matching open entry
    NoOpenEntry,
}

/// Removes the crossing key when handling finishes
struct CrossingClaim<'a> {
    claims: &'a std::sync::Mutex<HashSet<String>>,
    key: String,
}

impl Drop for CrossingClaim<'_> {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct GeofenceIngestor {
    store: LocalStore,
    config: GeofenceConfig,
    claims: std::sync::Mutex<HashSet<String>>,
}

impl GeofenceIngestor {
    pub fn new(store: LocalStore, config: GeofenceConfig) -> Self {
        Self {
            store,
            config,
            claims: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Forget in-flight crossing keys, e.g. after local ids were replaced
    pub fn reset_claims(&self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn try_claim(&self, region_id: &str, crossing: RegionCrossing) -> Option<CrossingClaim<'_>> {
        let key = format!("{region_id}:{crossing}");
        let inserted = self
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        inserted.then_some(CrossingClaim {
            claims: &self.claims,
            key,
        })
    }

    /// Handle a crossing reported by the platform for `region_id`
    pub async fn handle(
        &self,
        region_id: &str,
        crossing: RegionCrossing,
        occurred_at: DateTime<Utc>,
    ) -> Result<CrossingOutcome> {
        let Some(_claim) = self.try_claim(region_id, crossing) else {
            tracing::debug!(region_id, %crossing, "Crossing already being handled");
            return Ok(CrossingOutcome::InFlight);
        };

        let Some(geofence) = self.store.resolve_geofence(region_id).await? else {
            tracing::warn!(region_id, "Crossing for unknown region");
            return Ok(CrossingOutcome::UnknownRegion);
        };
        if !geofence.is_active {
            return Ok(CrossingOutcome::Inactive);
        }

        match crossing {
            RegionCrossing::Entry => self.record_entry(&geofence, occurred_at).await,
            RegionCrossing::Exit => self.record_exit(&geofence, occurred_at).await,
        }
    }

    async fn record_entry(
        &self,
        geofence: &Geofence,
        occurred_at: DateTime<Utc>,
    ) -> Result<CrossingOutcome> {
        let Some(event_type_id) = geofence.event_type_entry_id else {
            return Ok(CrossingOutcome::NoEventType);
        };

        let window = Duration::from_std(self.config.duplicate_entry_window())
            .unwrap_or(Duration::MAX);
        let since = occurred_at.checked_sub_signed(window);
        if let Some(open) = self
            .store
            .latest_open_geofence_entry(&geofence.id, since.as_ref())
            .await?
        {
            tracing::debug!(geofence = %geofence.name, event_id = %open.id, "Entry already open");
            return Ok(CrossingOutcome::DuplicateEntry(open.id));
        }

        let mut event = Event::new(event_type_id, occurred_at);
        event.source = EventSource::Geofence;
        event.geofence_id = Some(geofence.id);
        self.store.create_event(&event).await?;

        tracing::info!(geofence = %geofence.name, event_id = %event.id, "Recorded geofence entry");
        Ok(CrossingOutcome::Recorded(event.id))
    }

    async fn record_exit(
        &self,
        geofence: &Geofence,
        occurred_at: DateTime<Utc>,
    ) -> Result<CrossingOutcome> {
        let Some(open) = self
            .store
            .latest_open_geofence_entry(&geofence.id, None)
            .await?
        else {
            tracing::debug!(geofence = %geofence.name, "Exit without open entry");
            return Ok(CrossingOutcome::NoOpenEntry);
        };

        let edit = EventEdit {
            end_date: Patch::Value(occurred_at.max(open.timestamp)),
            ..EventEdit::default()
        };
        self.store.update_event(&open.id, &edit).await?;

        tracing::info!(geofence = %geofence.name, event_id = %open.id, "Closed geofence entry");
        Ok(CrossingOutcome::Closed(open.id))
    }
}

/// Result of a delivery to the inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Handled(CrossingOutcome),
    /// No handler yet; persisted under this queue id
    Queued(i64),
}

/// Tally of draining the durable queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub replayed: usize,
    pub discarded: usize,
    /// Replays that failed; these stay queued for the next attach
    pub retained: usize,
}

/// Entry point for crossings that may arrive before the ingestor exists,
/// e.g. when the process was launched only to deliver a region event
pub struct GeofenceInbox {
    store: LocalStore,
    config: GeofenceConfig,
    handler: Mutex<Option<Arc<GeofenceIngestor>>>,
}

impl GeofenceInbox {
    pub fn new(store: LocalStore, config: GeofenceConfig) -> Self {
        Self {
            store,
            config,
            handler: Mutex::new(None),
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.handler.lock().await.is_some()
    }

    pub async fn deliver(
        &self,
        region_id: &str,
        crossing: RegionCrossing,
        occurred_at: DateTime<Utc>,
    ) -> Result<Delivery> {
        let handler = self.handler.lock().await.clone();
        match handler {
            Some(handler) => Ok(Delivery::Handled(
                handler.handle(region_id, crossing, occurred_at).await?,
            )),
            None => {
                let id = self
                    .store
                    .push_pending_region(region_id, crossing, &occurred_at)
                    .await?;
                tracing::info!(
                    region_id,
                    %crossing,
                    queue_id = id,
                    "Queued crossing until handler attaches"
                );
                Ok(Delivery::Queued(id))
            }
        }
    }

    /// Attach the handler and replay queued crossings in arrival order.
    ///
    /// A row leaves the queue only once its replay succeeds or it is stale.
    /// Deliveries arriving while the queue drains wait until it is empty.
    pub async fn attach(&self, ingestor: Arc<GeofenceIngestor>) -> Result<DrainReport> {
        let mut handler = self.handler.lock().await;
        let max_age = Duration::from_std(self.config.pending_max_age()).unwrap_or(Duration::MAX);
        let now = Utc::now();

        let mut report = DrainReport::default();
        for pending in self.store.pending_regions().await? {
            if now - pending.enqueued_at > max_age {
                tracing::debug!(
                    region_id = %pending.region_id,
                    queue_id = pending.id,
                    "Discarding stale crossing"
                );
                self.store.remove_pending_region(pending.id).await?;
                report.discarded += 1;
                continue;
            }
            let outcome = ingestor
                .handle(&pending.region_id, pending.crossing, pending.occurred_at)
                .await;
            if let Err(error) = outcome {
                tracing::warn!(
                    region_id = %pending.region_id,
                    queue_id = pending.id,
                    %error,
                    "Replaying queued crossing failed; keeping it queued"
                );
                report.retained += 1;
                continue;
            }
            self.store.remove_pending_region(pending.id).await?;
            report.replayed += 1;
        }

        *handler = Some(ingestor);
        tracing::info!(
            replayed = report.replayed,
            discarded = report.discarded,
            retained = report.retained,
            "Geofence handler attached"
        );
        Ok(report)
    }

    /// Drop the handler; later deliveries are queued again
    pub async fn detach(&self) -> Option<Arc<GeofenceIngestor>> {
        self.handler.lock().await.take()
    }
}

/// Location permission level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationAuthorization {
    NotDetermined,
    Denied,
    WhenInUse,
    Always,
}

/// Region handed to the platform monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredRegion {
    pub identifier: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
}

impl From<&Geofence> for MonitoredRegion {
    fn from(geofence: &Geofence) -> Self {
        Self {
            identifier: geofence.region_identifier(),
            latitude: geofence.latitude,
            longitude: geofence.longitude,
            radius: geofence.radius,
        }
    }
}

/// Platform region monitoring
#[async_trait]
pub trait RegionMonitor: Send + Sync {
    async fn authorization(&self) -> LocationAuthorization;

    /// Identifiers currently monitored
    async fn monitored_regions(&self) -> Result<Vec<String>>;

    async fn start_monitoring(&self, region: &MonitoredRegion) -> Result<()>;

    async fn stop_monitoring(&self, identifier: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegionSyncReport {
    pub started: usize,
    pub stopped: usize,
    /// Active geofences left out because of the platform limit
    pub over_limit: usize,
}

/// Make the monitored regions match the active geofences
pub async fn sync_monitored_regions(
    store: &LocalStore,
    monitor: &dyn RegionMonitor,
) -> Result<RegionSyncReport> {
    let authorization = monitor.authorization().await;
    if authorization != LocationAuthorization::Always {
        return Err(Error::Platform(format!(
            "region monitoring requires always authorization (have {authorization:?})"
        )));
    }

    let active = store.list_geofences(true).await?;
    let over_limit = active.len().saturating_sub(MAX_MONITORED_REGIONS);
    let desired: Vec<MonitoredRegion> = active
        .iter()
        .take(MAX_MONITORED_REGIONS)
        .map(MonitoredRegion::from)
        .collect();
    let wanted: BTreeSet<&str> = desired
        .iter()
        .map(|region| region.identifier.as_str())
        .collect();
    let monitored: BTreeSet<String> = monitor.monitored_regions().await?.into_iter().collect();

    let mut report = RegionSyncReport {
        over_limit,
        ..RegionSyncReport::default()
    };
    for identifier in monitored.iter().filter(|id| !wanted.contains(id.as_str())) {
        monitor.stop_monitoring(identifier).await?;
        report.stopped += 1;
    }
    for region in desired
        .iter()
        .filter(|region| !monitored.contains(&region.identifier))
    {
        monitor.start_monitoring(region).await?;
        report.started += 1;
    }

    if over_limit > 0 {
        tracing::warn!(over_limit, "More active geofences than the platform can monitor");
    }
    tracing::info!(started = report.started, stopped = report.stopped, "Synced monitored regions");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::{EventTypeId, GeofenceEdit};

    async fn setup() -> (GeofenceIngestor, LocalStore, Geofence) {
        let store = LocalStore::open_in_memory().unwrap();
        let geofence =
            Geofence::new("gym", 37.77, -122.41, 100.0, Some(EventTypeId::new())).unwrap();
        store.create_geofence(&geofence).await.unwrap();
        let ingestor = GeofenceIngestor::new(store.clone(), GeofenceConfig::default());
        (ingestor, store, geofence)
    }

    async fn open_entries(store: &LocalStore) -> usize {
        store
            .list_events(100, 0)
            .await
            .unwrap()
            .iter()
            .filter(|event| event.is_open_geofence_entry())
            .count()
    }

    #[tokio::test]
    async fn test_repeated_entry_keeps_one_open_event() {
        let (ingestor, store, geofence) = setup().await;
        let region = geofence.region_identifier();
        let now = Utc::now();

        let first = ingestor.handle(&region, RegionCrossing::Entry, now).await.unwrap();
        let second = ingestor
            .handle(&region, RegionCrossing::Entry, now + Duration::seconds(2))
            .await
            .unwrap();

        let CrossingOutcome::Recorded(id) = first else {
            panic!("expected entry to be recorded, got {first:?}");
        };
        assert_eq!(second, CrossingOutcome::DuplicateEntry(id));
        assert_eq!(open_entries(&store).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_entry_is_claimed_once() {
        let (ingestor, store, geofence) = setup().await;
        let region = geofence.region_identifier();
        let now = Utc::now();

        let (a, b) = tokio::join!(
            ingestor.handle(&region, RegionCrossing::Entry, now),
            ingestor.handle(&region, RegionCrossing::Entry, now),
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|outcome| matches!(outcome, CrossingOutcome::Recorded(_)))
                .count(),
            1
        );
        assert_eq!(open_entries(&store).await, 1);
    }

    #[tokio::test]
    async fn test_exit_closes_open_entry() {
        let (ingestor, store, geofence) = setup().await;
        let region = geofence.region_identifier();
        let entered = Utc::now() - Duration::minutes(50);
        let exited = Utc::now();

        ingestor.handle(&region, RegionCrossing::Entry, entered).await.unwrap();
        let outcome = ingestor.handle(&region, RegionCrossing::Exit, exited).await.unwrap();

        let CrossingOutcome::Closed(id) = outcome else {
            panic!("expected exit to close entry, got {outcome:?}");
        };
        let event = store.get_event(&id).await.unwrap().unwrap();
        assert_eq!(
            event.end_date.map(|end| end.timestamp_millis()),
            Some(exited.timestamp_millis())
        );
        assert_eq!(open_entries(&store).await, 0);

        // A new visit opens a new entry
        let again = ingestor
            .handle(&region, RegionCrossing::Entry, exited + Duration::minutes(5))
            .await
            .unwrap();
        assert!(matches!(again, CrossingOutcome::Recorded(_)));
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_regions_are_skipped() {
        let (ingestor, store, geofence) = setup().await;

        let unknown = ingestor
            .handle("nowhere", RegionCrossing::Entry, Utc::now())
            .await
            .unwrap();
        assert_eq!(unknown, CrossingOutcome::UnknownRegion);

        let edit = GeofenceEdit {
            is_active: Some(false),
            ..GeofenceEdit::default()
        };
        store.update_geofence(&geofence.id, &edit).await.unwrap();
        let inactive = ingestor
            .handle(&geofence.region_identifier(), RegionCrossing::Entry, Utc::now())
            .await
            .unwrap();
        assert_eq!(inactive, CrossingOutcome::Inactive);
        assert_eq!(store.event_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inbox_queues_until_attached_and_drops_stale_entries() {
        let (ingestor, store, geofence) = setup().await;
        let inbox = GeofenceInbox::new(store.clone(), GeofenceConfig::default());
        let region = geofence.region_identifier();

        let queued = inbox
            .deliver(&region, RegionCrossing::Entry, Utc::now())
            .await
            .unwrap();
        assert!(matches!(queued, Delivery::Queued(_)));
        assert_eq!(store.event_count().await.unwrap(), 0);

        let report = inbox.attach(Arc::new(ingestor)).await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                replayed: 1,
                discarded: 0,
                retained: 0,
            }
        );
        assert_eq!(open_entries(&store).await, 1);

        let handled = inbox
            .deliver(&region, RegionCrossing::Exit, Utc::now())
            .await
            .unwrap();
        assert!(matches!(handled, Delivery::Handled(CrossingOutcome::Closed(_))));
    }

    #[tokio::test]
    async fn test_inbox_discards_entries_past_max_age() {
        let (ingestor, store, geofence) = setup().await;
        let config = GeofenceConfig {
            pending_max_age_secs: 0,
            ..GeofenceConfig::default()
        };
        let inbox = GeofenceInbox::new(store.clone(), config);
        inbox
            .deliver(&geofence.region_identifier(), RegionCrossing::Entry, Utc::now())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let report = inbox.attach(Arc::new(ingestor)).await.unwrap();

        assert_eq!(report.discarded, 1);
        assert_eq!(store.event_count().await.unwrap(), 0);
        assert!(store.pending_regions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inbox_keeps_crossing_whose_replay_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trendy.sqlite3");
        let store = LocalStore::open(&path).unwrap();
        let geofence =
            Geofence::new("gym", 37.77, -122.41, 100.0, Some(EventTypeId::new())).unwrap();
        store.create_geofence(&geofence).await.unwrap();
        let region = geofence.region_identifier();
        let inbox = GeofenceInbox::new(store.clone(), GeofenceConfig::default());
        inbox
            .deliver(&region, RegionCrossing::Entry, Utc::now())
            .await
            .unwrap();

        // Event inserts fail until the trigger is dropped
        let side = rusqlite::Connection::open(&path).unwrap();
        side.execute_batch(
            "CREATE TRIGGER reject_events BEFORE INSERT ON events
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

        let ingestor = Arc::new(GeofenceIngestor::new(store.clone(), GeofenceConfig::default()));
        let report = inbox.attach(ingestor.clone()).await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(report.replayed, 0);
        assert_eq!(store.pending_regions().await.unwrap().len(), 1);
        assert_eq!(store.event_count().await.unwrap(), 0);

        side.execute_batch("DROP TRIGGER reject_events;").unwrap();
        inbox.detach().await;
        let report = inbox.attach(ingestor).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert!(store.pending_regions().await.unwrap().is_empty());
        assert_eq!(open_entries(&store).await, 1);
    }

    #[derive(Default)]
    struct FakeMonitor {
        authorization: Option<LocationAuthorization>,
        regions: Mutex<BTreeSet<String>>,
    }

    #[async_trait]
    impl RegionMonitor for FakeMonitor {
        async fn authorization(&self) -> LocationAuthorization {
            self.authorization.unwrap_or(LocationAuthorization::Always)
        }

        async fn monitored_regions(&self) -> Result<Vec<String>> {
            Ok(self.regions.lock().await.iter().cloned().collect())
        }

        async fn start_monitoring(&self, region: &MonitoredRegion) -> Result<()> {
            self.regions.lock().await.insert(region.identifier.clone());
            Ok(())
        }

        async fn stop_monitoring(&self, identifier: &str) -> Result<()> {
            self.regions.lock().await.remove(identifier);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_monitored_regions_follow_active_geofences() {
        let (_, store, geofence) = setup().await;
        let monitor = FakeMonitor::default();
        monitor.regions.lock().await.insert("deleted-region".to_string());

        let report = sync_monitored_regions(&store, &monitor).await.unwrap();

        assert_eq!(report.started, 1);
        assert_eq!(report.stopped, 1);
        let regions: Vec<String> = monitor.regions.lock().await.iter().cloned().collect();
        assert_eq!(regions, vec![geofence.region_identifier()]);
    }

    #[tokio::test]
    async fn test_region_sync_requires_always_authorization() {
        let (_, store, _) = setup().await;
        let monitor = FakeMonitor {
            authorization: Some(LocationAuthorization::WhenInUse),
            ..FakeMonitor::default()
        };

        let result = sync_monitored_regions(&store, &monitor).await;

        assert!(matches!(result, Err(Error::Platform(_))));
        assert!(monitor.regions.lock().await.is_empty());
    }
}
