//! Lifecycle coordinator tying the store, the sync engine and the importers
//! to host events (foreground, suspend, resume).

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{LifecycleConfig, TrendyConfig};
use crate::error::Result;
use crate::ingest::{
    DrainReport, GeofenceInbox, GeofenceIngestor, HealthKitIngestor, HealthSampleSource,
};
use crate::store::LocalStore;
use crate::sync::{RemoteApi, SyncEngine, SyncReport, SyncStatusReport};

/// Why a sync was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Launch,
    Foreground,
    Resume,
    Manual,
    /// Local data changed (manual edit or ingestion)
    LocalChange,
}

impl SyncTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Foreground => "foreground",
            Self::Resume => "resume",
            Self::Manual => "manual",
            Self::LocalChange => "local_change",
        }
    }
}

/// Keeps the platform from suspending the process until dropped
pub struct BackgroundExtension(Option<Box<dyn FnOnce() + Send>>);

impl BackgroundExtension {
    pub fn new(end: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(end)))
    }

    /// An extension with nothing to end
    pub fn none() -> Self {
        Self(None)
    }
}

impl Drop for BackgroundExtension {
    fn drop(&mut self) {
        if let Some(end) = self.0.take() {
            end();
        }
    }
}

/// Platform "let me finish this before suspending" facility
pub trait BackgroundExtender: Send + Sync {
    fn begin(&self, name: &str) -> BackgroundExtension;
}

/// Extender for hosts that are never suspended
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExtender;

impl BackgroundExtender for NoopExtender {
    fn begin(&self, _name: &str) -> BackgroundExtension {
        BackgroundExtension::none()
    }
}

pub struct SyncCoordinator {
    store: LocalStore,
    engine: Arc<SyncEngine>,
    healthkit: Option<Arc<HealthKitIngestor>>,
    geofences: Arc<GeofenceIngestor>,
    inbox: Arc<GeofenceInbox>,
    extender: Arc<dyn BackgroundExtender>,
    lifecycle: LifecycleConfig,
    suspended_at: Mutex<Option<Instant>>,
}

impl SyncCoordinator {
    pub fn new(
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        config: &TrendyConfig,
        extender: Arc<dyn BackgroundExtender>,
    ) -> Self {
        let engine = SyncEngine::new(store.clone(), api, config.sync.clone());
        let geofences = GeofenceIngestor::new(store.clone(), config.geofence.clone());
        let inbox = GeofenceInbox::new(store.clone(), config.geofence.clone());
        Self {
            store,
            engine: Arc::new(engine),
            healthkit: None,
            geofences: Arc::new(geofences),
            inbox: Arc::new(inbox),
            extender,
            lifecycle: config.lifecycle.clone(),
            suspended_at: Mutex::new(None),
        }
    }

    /// Enable HealthKit ingestion backed by `source`
    #[must_use]
    pub fn with_healthkit(
        mut self,
        source: Arc<dyn HealthSampleSource>,
        config: &TrendyConfig,
    ) -> Self {
        self.healthkit = Some(Arc::new(HealthKitIngestor::new(
            self.store.clone(),
            source,
            config.healthkit.clone(),
        )));
        self
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn healthkit(&self) -> Option<&Arc<HealthKitIngestor>> {
        self.healthkit.as_ref()
    }

    pub fn geofences(&self) -> &Arc<GeofenceIngestor> {
        &self.geofences
    }

    /// Crossing entry point for the platform callback
    pub fn inbox(&self) -> &Arc<GeofenceInbox> {
        &self.inbox
    }

    /// Hand the geofence ingestor to the inbox, replaying queued crossings
    pub async fn attach_geofence_handler(&self) -> Result<DrainReport> {
        self.inbox.attach(Arc::clone(&self.geofences)).await
    }

    /// Run a sync cycle; after a bootstrap, importer state is rebuilt
    /// before returning
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        tracing::debug!(trigger = trigger.as_str(), "Sync requested");
        let report = self.engine.sync().await?;

        if report.bootstrapped {
            if let Some(healthkit) = &self.healthkit {
                healthkit.reconcile_after_bootstrap().await?;
            }
            self.geofences.reset_claims();
        }
        Ok(report)
    }

    /// Release the store handle before the host is suspended
    pub async fn on_suspend(&self) {
        let _extension = self.extender.begin("release-store-handle");
        *self.suspended_at.lock().await = Some(Instant::now());
        self.store.release_handle().await;
    }

    /// Recover after the host resumes, then run a foreground sync.
    ///
    /// A cycle still in flight after a long suspension is assumed wedged and
    /// is cancelled.
    pub async fn on_resume(&self) -> Result<SyncReport> {
        let suspended_for = self
            .suspended_at
            .lock()
            .await
            .take()
            .map(|at| at.elapsed());

        if let Some(suspended_for) = suspended_for {
            if suspended_for > self.lifecycle.stale_sync_after() && self.engine.is_syncing() {
                tracing::warn!(
                    suspended_secs = suspended_for.as_secs(),
                    "Cancelling sync left over from before suspension"
                );
                self.engine.cancel_in_flight();
                self.engine.wait_idle().await;
            }
        }

        self.store.refresh_handle().await?;
        self.sync(SyncTrigger::Resume).await
    }

    pub async fn force_resync(&self) -> Result<()> {
        self.engine.force_resync().await
    }

    pub async fn clear_queue(&self) -> Result<usize> {
        self.engine.clear_queue().await
    }

    pub async fn status(&self) -> Result<SyncStatusReport> {
        self.engine.status().await
    }
}
