//! Runtime-tunable ML client parameters.
//!
//! Each [`MlConfigCategory`] has built-in defaults. Rows in the `ml_config`
//! table override them key by key. Lookups are served from an in-memory cache
//! that expires after a TTL and is dropped early on a [`ConfigEvent`].

use super::events::{ConfigEvent, ConfigEventBus};
use crate::config::MlServicesConfig;
use crate::services::metrics::record_config_cache_event;
use crate::services::Database;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Config keys understood by the ML clients.
pub mod keys {
    pub const ENABLED: &str = "enabled";
    pub const SERVICE_URL: &str = "service_url";
    pub const TIMEOUT_MS: &str = "timeout_ms";
    pub const MIN_CONFIDENCE: &str = "min_confidence";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const MIN_TRAINING_SAMPLES: &str = "min_training_samples";
    pub const SENSITIVITY: &str = "sensitivity";
    pub const SCORE_THRESHOLD: &str = "score_threshold";
    pub const LOOKBACK_DAYS: &str = "lookback_days";
    pub const SIMILARITY_THRESHOLD: &str = "similarity_threshold";
    pub const WINDOW_DAYS: &str = "window_days";
    pub const HISTORY_MONTHS: &str = "history_months";
    pub const BUFFER_PCT: &str = "buffer_pct";
    pub const REFRESH_DAYS: &str = "refresh_days";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MlConfigCategory {
    #[serde(rename = "ML_CATEGORIZATION")]
    Categorization,
    #[serde(rename = "ML_ANOMALY")]
    Anomaly,
    #[serde(rename = "ML_DUPLICATES")]
    Duplicates,
    #[serde(rename = "ML_BUDGET")]
    Budget,
    #[serde(rename = "ML_CREDIT_SCORING")]
    CreditScoring,
}

impl MlConfigCategory {
    pub const ALL: [MlConfigCategory; 5] = [
        Self::Categorization,
        Self::Anomaly,
        Self::Duplicates,
        Self::Budget,
        Self::CreditScoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Categorization => "ML_CATEGORIZATION",
            Self::Anomaly => "ML_ANOMALY",
            Self::Duplicates => "ML_DUPLICATES",
            Self::Budget => "ML_BUDGET",
            Self::CreditScoring => "ML_CREDIT_SCORING",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
    }

    /// Short name used as the `service` metrics label.
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::Categorization => "categorization",
            Self::Anomaly => "anomaly",
            Self::Duplicates => "duplicates",
            Self::Budget => "budget",
            Self::CreditScoring => "credit_scoring",
        }
    }

    /// Built-in values for every key of this category.
    pub fn defaults(&self, urls: &MlServicesConfig) -> HashMap<String, String> {
        let (url, timeout_ms, extra) = match self {
            Self::Categorization => (
                urls.categorization_url.as_str(),
                5_000u64,
                vec![
                    (keys::MIN_CONFIDENCE, "0.6"),
                    (keys::BATCH_SIZE, "100"),
                    (keys::MIN_TRAINING_SAMPLES, "20"),
                ],
            ),
            Self::Anomaly => (
                urls.anomaly_url.as_str(),
                10_000,
                vec![
                    (keys::SENSITIVITY, "0.95"),
                    (keys::SCORE_THRESHOLD, "0.8"),
                    (keys::LOOKBACK_DAYS, "30"),
                ],
            ),
            Self::Duplicates => (
                urls.duplicates_url.as_str(),
                10_000,
                vec![
                    (keys::SIMILARITY_THRESHOLD, "0.85"),
                    (keys::WINDOW_DAYS, "7"),
                ],
            ),
            Self::Budget => (
                urls.budget_url.as_str(),
                5_000,
                vec![(keys::HISTORY_MONTHS, "12"), (keys::BUFFER_PCT, "0.1")],
            ),
            Self::CreditScoring => (
                urls.credit_scoring_url.as_str(),
                5_000,
                vec![(keys::REFRESH_DAYS, "7")],
            ),
        };

        let mut defaults: HashMap<String, String> = extra
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        defaults.insert(keys::ENABLED.to_string(), "true".to_string());
        defaults.insert(keys::SERVICE_URL.to_string(), url.to_string());
        defaults.insert(keys::TIMEOUT_MS.to_string(), timeout_ms.to_string());
        defaults
    }
}

impl std::fmt::Display for MlConfigCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Effective configuration of one category: overrides on top of defaults.
#[derive(Debug, Clone)]
pub struct CategoryConfig {
    category: MlConfigCategory,
    defaults: HashMap<String, String>,
    overrides: HashMap<String, String>,
}

impl CategoryConfig {
    pub fn new(
        category: MlConfigCategory,
        defaults: HashMap<String, String>,
        overrides: HashMap<String, String>,
    ) -> Self {
        Self {
            category,
            defaults,
            overrides,
        }
    }

    pub fn category(&self) -> MlConfigCategory {
        self.category
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.overrides
            .get(key)
            .or_else(|| self.defaults.get(key))
            .map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.typed(key, parse_bool).unwrap_or(false)
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.typed(key, |raw| f64::from_str(raw).ok().filter(|v| v.is_finite()))
            .unwrap_or(0.0)
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.typed(key, |raw| u64::from_str(raw).ok()).unwrap_or(0)
    }

    pub fn enabled(&self) -> bool {
        self.get_bool(keys::ENABLED)
    }

    pub fn service_url(&self) -> &str {
        self.get_str(keys::SERVICE_URL)
            .unwrap_or_default()
            .trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.get_u64(keys::TIMEOUT_MS).max(1))
    }

    /// Whether `key` is a known setting of this category.
    pub fn knows(&self, key: &str) -> bool {
        self.defaults.contains_key(key)
    }

    /// Whether `value` parses as the same type as the default of `key`.
    pub fn accepts(&self, key: &str, value: &str) -> bool {
        let Some(default) = self.defaults.get(key) else {
            return false;
        };
        let value = value.trim();
        if u64::from_str(default).is_ok() {
            u64::from_str(value).is_ok()
        } else if f64::from_str(default).is_ok() {
            f64::from_str(value).map(f64::is_finite).unwrap_or(false)
        } else if parse_bool(default).is_some() {
            parse_bool(value).is_some()
        } else {
            !value.is_empty()
        }
    }

    /// All keys with their effective values.
    pub fn effective(&self) -> BTreeMap<String, String> {
        let mut merged: BTreeMap<String, String> = self.defaults.clone().into_iter().collect();
        merged.extend(self.overrides.clone());
        merged
    }

    fn typed<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        if let Some(raw) = self.overrides.get(key) {
            match parse(raw.trim()) {
                Some(value) => return Some(value),
                None => tracing::warn!(
                    category = %self.category,
                    key = %key,
                    value = %raw,
                    "Unparsable ML config value, using default"
                ),
            }
        }
        self.defaults.get(key).and_then(|raw| parse(raw.trim()))
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Where config overrides are loaded from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self, category: MlConfigCategory) -> Result<HashMap<String, String>, AppError>;
}

#[async_trait]
impl ConfigSource for Database {
    async fn load(&self, category: MlConfigCategory) -> Result<HashMap<String, String>, AppError> {
        let entries = self.list_ml_config(Some(category.as_str())).await?;
        Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
    }
}

/// Config source kept in memory, for tests and local runs without Postgres.
#[derive(Default)]
pub struct InMemoryConfigSource {
    values: RwLock<HashMap<MlConfigCategory, HashMap<String, String>>>,
    failing: AtomicBool,
    loads: AtomicUsize,
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, category: MlConfigCategory, key: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values
                .entry(category)
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }

    pub fn remove(&self, category: MlConfigCategory, key: &str) {
        if let Ok(mut values) = self.values.write() {
            if let Some(entries) = values.get_mut(&category) {
                entries.remove(key);
            }
        }
    }

    /// Make subsequent loads fail, simulating a database outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn load(&self, category: MlConfigCategory) -> Result<HashMap<String, String>, AppError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "config source unavailable"
            )));
        }
        let values = self
            .values
            .read()
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("config source poisoned")))?;
        Ok(values.get(&category).cloned().unwrap_or_default())
    }
}

struct CachedConfig {
    config: Arc<CategoryConfig>,
    loaded_at: Instant,
}

/// Cached view over a [`ConfigSource`].
pub struct MlConfigStore {
    source: Arc<dyn ConfigSource>,
    urls: MlServicesConfig,
    ttl: Duration,
    cache: DashMap<MlConfigCategory, CachedConfig>,
    /// Bumped by every invalidation.
    generation: AtomicU64,
}

impl MlConfigStore {
    pub fn new(source: Arc<dyn ConfigSource>, urls: MlServicesConfig) -> Self {
        let ttl = urls.config_cache_ttl;
        Self {
            source,
            urls,
            ttl,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn defaults(&self, category: MlConfigCategory) -> CategoryConfig {
        CategoryConfig::new(category, category.defaults(&self.urls), HashMap::new())
    }

    /// Effective config for `category`. Never fails: a source error serves
    /// the last cached value, or the defaults when nothing was cached yet.
    pub async fn get(&self, category: MlConfigCategory) -> Arc<CategoryConfig> {
        let stale = match self.cache.get(&category) {
            Some(entry) if entry.loaded_at.elapsed() < self.ttl => {
                record_config_cache_event("hit");
                return entry.config.clone();
            }
            Some(entry) => Some(entry.config.clone()),
            None => None,
        };

        record_config_cache_event(if stale.is_some() { "reload" } else { "miss" });

        let generation = self.generation.load(Ordering::SeqCst);
        match self.source.load(category).await {
            Ok(overrides) => {
                let config = Arc::new(CategoryConfig::new(
                    category,
                    category.defaults(&self.urls),
                    overrides,
                ));
                self.store_if_current(category, generation, config.clone());
                config
            }
            Err(e) => {
                record_config_cache_event("reload_failed");
                match stale {
                    Some(config) => {
                        tracing::warn!(
                            category = %category,
                            error = %e,
                            "Failed to reload ML config, serving cached value"
                        );
                        // Keep serving it for another TTL instead of hitting
                        // the failing source on every call.
                        self.store_if_current(category, generation, config.clone());
                        config
                    }
                    None => {
                        tracing::warn!(
                            category = %category,
                            error = %e,
                            "Failed to load ML config, serving defaults"
                        );
                        Arc::new(self.defaults(category))
                    }
                }
            }
        }
    }

    /// Cache a loaded config unless an invalidation ran since `generation`
    /// was read. The check holds the shard lock, so an invalidation either
    /// fails it or removes the entry afterwards.
    fn store_if_current(
        &self,
        category: MlConfigCategory,
        generation: u64,
        config: Arc<CategoryConfig>,
    ) {
        let entry = self.cache.entry(category);
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(category = %category, "ML config invalidated during reload, not caching");
            return;
        }
        entry.insert(CachedConfig {
            config,
            loaded_at: Instant::now(),
        });
    }

    /// Drop one category, or everything with `None`.
    pub fn invalidate(&self, category: Option<MlConfigCategory>) {
        record_config_cache_event("invalidate");
        self.generation.fetch_add(1, Ordering::SeqCst);
        match category {
            Some(category) => {
                self.cache.remove(&category);
                tracing::debug!(category = %category, "ML config cache entry invalidated");
            }
            None => {
                self.cache.clear();
                tracing::debug!("ML config cache cleared");
            }
        }
    }

    /// Apply bus events to this store until the bus is dropped.
    pub fn spawn_invalidation_listener(self: &Arc<Self>, bus: &ConfigEventBus) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConfigEvent::Invalidated { category }) => store.invalidate(category),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Config event listener lagged, clearing cache");
                        store.invalidate(None);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
