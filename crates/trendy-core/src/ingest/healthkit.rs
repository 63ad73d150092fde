//! HealthKit sample ingestion.
//!
//! Every sample goes through three dedup layers before an event is written:
//! the in-memory set of processed sample ids, a store lookup by sample id and
//! a content match on (event type, category, start time) with an inclusive
//! tolerance. The content match catches the same physical workout mirrored
//! from another device under a different sample id.
//!
//! Concurrent deliveries are serialized per content key by an in-flight
//! claim taken before the store is consulted. A sample whose key conflicts
//! with a live claim waits for it to be released and then re-runs the checks.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::HealthKitConfig;
use crate::error::Result;
use crate::models::{Event, EventId, EventSource, EventType, EventTypeId};
use crate::store::LocalStore;
use crate::util::{to_millis, within_tolerance};

/// Category whose live samples are enriched with heart-rate statistics
pub const WORKOUT_CATEGORY: &str = "workout";

const DEFAULT_TYPE_COLOR: &str = "#4ECDC4";
const DEFAULT_TYPE_ICON: &str = "heart";

/// A sample delivered by the health store
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    /// Platform identifier; not stable across mirrored devices
    pub sample_id: String,
    pub category: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Result of an anchored query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchoredBatch {
    pub samples: Vec<HealthSample>,
    /// Opaque token to resume from; `None` keeps the previous anchor
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeartRateStats {
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

/// Platform health store
#[async_trait]
pub trait HealthSampleSource: Send + Sync {
    /// Samples added since `anchor`; without an anchor, samples starting at
    /// or after `since`
    async fn anchored_samples(
        &self,
        category: &str,
        anchor: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<AnchoredBatch>;

    /// Samples starting in `[start, end)`
    async fn samples_between(
        &self,
        category: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HealthSample>>;

    async fn heart_rate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<HeartRateStats>>;
}

/// Platform "done processing" callback of an observer query.
///
/// Invoked exactly once, when completed explicitly or when dropped, so every
/// return path acknowledges the delivery.
pub struct ObserverCompletion(Option<Box<dyn FnOnce() + Send>>);

impl ObserverCompletion {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(callback)))
    }

    pub fn complete(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

impl Drop for ObserverCompletion {
    fn drop(&mut self) {
        self.fire();
    }
}

impl std::fmt::Debug for ObserverCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObserverCompletion")
            .field(&self.0.is_some())
            .finish()
    }
}

/// What happened to one sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    Inserted(EventId),
    /// Sample id already in the processed set
    AlreadyProcessed,
    /// Stored under this event (same sample id or same content)
    Duplicate(EventId),
    /// No event type configured for the category
    Unmapped,
}

/// Tally of a batch of samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

impl IngestReport {
    fn record(&mut self, outcome: &SampleOutcome) {
        match outcome {
            SampleOutcome::Inserted(_) => self.inserted += 1,
            SampleOutcome::AlreadyProcessed | SampleOutcome::Duplicate(_) => self.duplicates += 1,
            SampleOutcome::Unmapped => self.skipped += 1,
        }
    }
}

/// Progress of a historical import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportProgress {
    pub processed: usize,
    pub total: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClaimKey {
    event_type_id: EventTypeId,
    category: String,
    start: DateTime<Utc>,
}

struct InFlight {
    id: u64,
    key: ClaimKey,
    gate: Arc<Mutex<()>>,
}

/// Held while a sample is checked and written
struct SampleClaim<'a> {
    ingestor: &'a HealthKitIngestor,
    id: u64,
    _gate: OwnedMutexGuard<()>,
}

impl Drop for SampleClaim<'_> {
    fn drop(&mut self) {
        self.ingestor
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|claim| claim.id != self.id);
    }
}

pub struct HealthKitIngestor {
    store: LocalStore,
    source: Arc<dyn HealthSampleSource>,
    config: HealthKitConfig,
    processed: Mutex<HashSet<String>>,
    claims: std::sync::Mutex<Vec<InFlight>>,
    next_claim: AtomicU64,
    /// Serializes find-or-create of mapped event types
    type_lock: Mutex<()>,
}

impl HealthKitIngestor {
    pub fn new(
        store: LocalStore,
        source: Arc<dyn HealthSampleSource>,
        config: HealthKitConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
            processed: Mutex::new(HashSet::new()),
            claims: std::sync::Mutex::new(Vec::new()),
            next_claim: AtomicU64::new(1),
            type_lock: Mutex::new(()),
        }
    }

    /// Categories with a configured event type
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.config.categories.keys().map(String::as_str)
    }

    pub async fn processed_count(&self) -> usize {
        self.processed.lock().await.len()
    }

    /// Handle an observer wake-up for `category`.
    ///
    /// The anchor is persisted only after the whole batch is written, so a
    /// failure part way re-delivers the batch next time.
    pub async fn handle_observer_update(
        &self,
        category: &str,
        completion: ObserverCompletion,
    ) -> Result<IngestReport> {
        let _completion = completion;

        let anchor = self.store.anchor(category).await?;
        let initial = anchor.is_none();
        let since = initial
            .then(|| Utc::now() - Duration::days(i64::from(self.config.initial_window_days)));

        let batch = self
            .source
            .anchored_samples(category, anchor.as_deref(), since)
            .await?;

        let mut report = IngestReport::default();
        for sample in &batch.samples {
            // The initial window is history: no enrichment
            let outcome = self.process_sample(sample, !initial).await?;
            report.record(&outcome);
        }

        if let Some(anchor) = batch.anchor {
            self.store.set_anchor(category, &anchor).await?;
        }

        tracing::info!(
            category,
            initial,
            inserted = report.inserted,
            duplicates = report.duplicates,
            skipped = report.skipped,
            "Processed HealthKit update"
        );
        Ok(report)
    }

    /// Import samples from the `days` before `before`, without enrichment
    pub async fn import_older(
        &self,
        category: &str,
        before: DateTime<Utc>,
        days: u32,
        mut progress: impl FnMut(ImportProgress) + Send,
    ) -> Result<IngestReport> {
        let start = before - Duration::days(i64::from(days));
        let samples = self.source.samples_between(category, start, before).await?;
        let total = samples.len();

        let mut report = IngestReport::default();
        for (index, sample) in samples.iter().enumerate() {
            let outcome = self.process_sample(sample, false).await?;
            report.record(&outcome);
            progress(ImportProgress {
                processed: index + 1,
                total,
                inserted: report.inserted,
            });
        }

        tracing::info!(
            category,
            days,
            inserted = report.inserted,
            total,
            "Imported older HealthKit samples"
        );
        Ok(report)
    }

    /// Rebuild the processed set from the store after a bootstrap replaced it.
    ///
    /// Samples whose events the snapshot no longer holds leave the set, so a
    /// later delivery of them is ingested again.
    pub async fn reconcile_after_bootstrap(&self) -> Result<usize> {
        let stored = self.store.healthkit_sample_ids().await?;
        let mut processed = self.processed.lock().await;
        *processed = stored.into_iter().collect();
        tracing::debug!(processed = processed.len(), "Reconciled HealthKit processed set");
        Ok(processed.len())
    }

    /// Run one sample through the dedup layers and insert it if new
    pub async fn process_sample(
        &self,
        sample: &HealthSample,
        enrich: bool,
    ) -> Result<SampleOutcome> {
        if self.is_processed(&sample.sample_id).await {
            return Ok(SampleOutcome::AlreadyProcessed);
        }

        let Some(event_type_id) = self.event_type_for(&sample.category).await? else {
            tracing::debug!(category = %sample.category, "No event type mapped, skipping sample");
            return Ok(SampleOutcome::Unmapped);
        };

        let _claim = self
            .claim(ClaimKey {
                event_type_id,
                category: sample.category.clone(),
                start: sample.start,
            })
            .await;

        // Re-check: the claim may have been won by a delivery of this sample
        if self.is_processed(&sample.sample_id).await {
            return Ok(SampleOutcome::AlreadyProcessed);
        }

        if let Some(existing) = self.store.find_by_healthkit_sample(&sample.sample_id).await? {
            self.mark_processed(&sample.sample_id).await;
            return Ok(SampleOutcome::Duplicate(existing.id));
        }

        if let Some(existing) = self
            .store
            .find_content_match(
                &event_type_id,
                &sample.start,
                Some(sample.category.as_str()),
                self.config.tolerance_ms(),
            )
            .await?
        {
            tracing::debug!(
                sample_id = %sample.sample_id,
                event_id = %existing.id,
                "Sample matches existing event content"
            );
            self.mark_processed(&sample.sample_id).await;
            return Ok(SampleOutcome::Duplicate(existing.id));
        }

        let mut event = Event::new(event_type_id, sample.start);
        event.source = EventSource::HealthKit;
        event.end_date = sample.end;
        event.healthkit_sample_id = Some(sample.sample_id.clone());
        event.healthkit_category = Some(sample.category.clone());
        event.properties = sample.metadata.clone();
        if enrich {
            self.enrich(sample, &mut event).await;
        }

        self.store.create_event(&event).await?;
        self.mark_processed(&sample.sample_id).await;
        Ok(SampleOutcome::Inserted(event.id))
    }

    async fn is_processed(&self, sample_id: &str) -> bool {
        self.processed.lock().await.contains(sample_id)
    }

    async fn mark_processed(&self, sample_id: &str) {
        self.processed.lock().await.insert(sample_id.to_string());
    }

    /// Find or create the event type configured for `category`
    async fn event_type_for(&self, category: &str) -> Result<Option<EventTypeId>> {
        let Some(name) = self.config.categories.get(category) else {
            return Ok(None);
        };

        let _guard = self.type_lock.lock().await;
        if let Some(existing) = self.store.find_event_type_by_name(name).await? {
            return Ok(Some(existing.id));
        }
        let event_type = EventType::new(name.as_str(), DEFAULT_TYPE_COLOR, DEFAULT_TYPE_ICON)?;
        self.store.create_event_type(&event_type).await?;
        tracing::info!(category, name = %name, "Created event type for HealthKit category");
        Ok(Some(event_type.id))
    }

    async fn enrich(&self, sample: &HealthSample, event: &mut Event) {
        if !self.config.enrich_workouts || sample.category != WORKOUT_CATEGORY {
            return;
        }
        let end = sample.end.unwrap_or(sample.start);
        match self.source.heart_rate(sample.start, end).await {
            Ok(Some(stats)) => {
                event.properties.insert("heart_rate_avg".to_string(), stats.average.into());
                event.properties.insert("heart_rate_min".to_string(), stats.min.into());
                event.properties.insert("heart_rate_max".to_string(), stats.max.into());
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(sample_id = %sample.sample_id, %error, "Heart-rate enrichment failed");
            }
        }
    }

    async fn claim(&self, key: ClaimKey) -> SampleClaim<'_> {
        let tolerance_ms = self.config.tolerance_ms();
        loop {
            let gate = Arc::new(Mutex::new(()));
            let guard = Arc::clone(&gate).lock_owned().await;

            let conflicting = {
                let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
                let conflicting = claims
                    .iter()
                    .find(|claim| {
                        claim.key.event_type_id == key.event_type_id
                            && claim.key.category == key.category
                            && within_tolerance(&claim.key.start, &key.start, tolerance_ms)
                    })
                    .map(|claim| Arc::clone(&claim.gate));
                if conflicting.is_none() {
                    let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
                    claims.push(InFlight {
                        id,
                        key: key.clone(),
                        gate,
                    });
                    return SampleClaim {
                        ingestor: self,
                        id,
                        _gate: guard,
                    };
                }
                conflicting
            };

            drop(guard);
            if let Some(held) = conflicting {
                tracing::trace!(
                    start = to_millis(&key.start),
                    "Waiting for conflicting sample claim"
                );
                drop(held.lock().await);
            }
        }
    }
}
