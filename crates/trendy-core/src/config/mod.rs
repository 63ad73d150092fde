//! Runtime configuration for the sync engine and its ingestors.
//!
//! Loaded from an optional JSON file, then overridden by `TRENDY_*`
//! environment variables. Every section has working defaults, so an empty
//! file (or none at all) is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::{MAX_CHANGES_LIMIT, MAX_EVENTS_LIMIT};
use crate::util::{is_http_url, normalize_text_option};

pub const ENV_API_URL: &str = "TRENDY_API_URL";
pub const ENV_API_TOKEN: &str = "TRENDY_API_TOKEN";
pub const ENV_DB_PATH: &str = "TRENDY_DB_PATH";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrendyConfig {
    pub api_base_url: Option<String>,
    /// Bearer token; usually supplied through the environment
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub db_path: Option<PathBuf>,
    pub sync: SyncConfig,
    pub healthkit: HealthKitConfig,
    pub geofence: GeofenceConfig,
    pub lifecycle: LifecycleConfig,
}

/// Mutation flush, pull and backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Largest number of event creates sent in one batch request
    pub batch_size: usize,
    /// Change-feed page size (1..=500)
    pub page_size: usize,
    /// Events fetched per request while bootstrapping (1..=1000)
    pub snapshot_page_size: usize,
    /// Counted failures before a mutation is marked failed
    pub max_attempts: u32,
    /// In-cycle retries for network errors and 5xx responses
    pub transient_retries: u32,
    pub retry_base_delay_ms: u64,
    pub breaker_base_secs: u64,
    pub breaker_max_secs: u64,
    /// Sync history entries kept
    pub history_limit: usize,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            page_size: 100,
            snapshot_page_size: 1000,
            max_attempts: 5,
            transient_retries: 3,
            retry_base_delay_ms: 500,
            breaker_base_secs: 30,
            breaker_max_secs: 600,
            history_limit: 50,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub const fn breaker_base(&self) -> Duration {
        Duration::from_secs(self.breaker_base_secs)
    }

    pub const fn breaker_max(&self) -> Duration {
        Duration::from_secs(self.breaker_max_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HealthKit ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthKitConfig {
    /// Content-match tolerance in seconds, inclusive
    pub dedup_tolerance_secs: f64,
    /// Look-back window of the first anchored fetch per category
    pub initial_window_days: u32,
    /// Attach heart-rate statistics to live workout events
    pub enrich_workouts: bool,
    /// HealthKit category -> event type name; unmapped categories are ignored
    pub categories: BTreeMap<String, String>,
}

impl Default for HealthKitConfig {
    fn default() -> Self {
        Self {
            dedup_tolerance_secs: 1.0,
            initial_window_days: 30,
            enrich_workouts: true,
            categories: BTreeMap::new(),
        }
    }
}

impl HealthKitConfig {
    /// Tolerance in whole milliseconds
    #[allow(clippy::cast_possible_truncation)]
    pub fn tolerance_ms(&self) -> i64 {
        (self.dedup_tolerance_secs * 1000.0).round() as i64
    }
}

/// Geofence ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GeofenceConfig {
    /// An open entry younger than this suppresses a new entry event
    pub duplicate_entry_window_secs: u64,
    /// Queued crossings older than this are discarded when drained
    pub pending_max_age_secs: u64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            duplicate_entry_window_secs: 24 * 60 * 60,
            pending_max_age_secs: 5 * 60,
        }
    }
}

impl GeofenceConfig {
    pub const fn duplicate_entry_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_entry_window_secs)
    }

    pub const fn pending_max_age(&self) -> Duration {
        Duration::from_secs(self.pending_max_age_secs)
    }
}

/// Suspend/resume handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    /// A sync still running after a suspension this long is cancelled on resume
    pub stale_sync_after_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stale_sync_after_secs: 60 * 60,
        }
    }
}

impl LifecycleConfig {
    pub const fn stale_sync_after(&self) -> Duration {
        Duration::from_secs(self.stale_sync_after_secs)
    }
}

impl TrendyConfig {
    /// Load the JSON file at `path` if it exists, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|error| Error::Config(format!("{}: {error}", path.display())))
    }

    /// Apply `TRENDY_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = normalize_text_option(lookup(ENV_API_URL)) {
            self.api_base_url = Some(url);
        }
        if let Some(token) = normalize_text_option(lookup(ENV_API_TOKEN)) {
            self.api_token = Some(token);
        }
        if let Some(path) = normalize_text_option(lookup(ENV_DB_PATH)) {
            self.db_path = Some(PathBuf::from(path));
        }
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = normalize_text_option(self.api_base_url.clone()) {
            if !is_http_url(&url) {
                return Err(Error::Config(
                    "api_base_url must include http:// or https://".to_string(),
                ));
            }
        }
        if self.sync.batch_size == 0 {
            return Err(Error::Config("sync.batch_size must be positive".to_string()));
        }
        if !(1..=MAX_CHANGES_LIMIT).contains(&self.sync.page_size) {
            return Err(Error::Config(format!(
                "sync.page_size must be between 1 and {MAX_CHANGES_LIMIT}"
            )));
        }
        if !(1..=MAX_EVENTS_LIMIT).contains(&self.sync.snapshot_page_size) {
            return Err(Error::Config(format!(
                "sync.snapshot_page_size must be between 1 and {MAX_EVENTS_LIMIT}"
            )));
        }
        if self.sync.max_attempts == 0 {
            return Err(Error::Config("sync.max_attempts must be positive".to_string()));
        }
        if self.sync.history_limit == 0 {
            return Err(Error::Config("sync.history_limit must be positive".to_string()));
        }
        if !self.healthkit.dedup_tolerance_secs.is_finite()
            || self.healthkit.dedup_tolerance_secs <= 0.0
        {
            return Err(Error::Config(
                "healthkit.dedup_tolerance_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
