//! Configuration for the adaptive learned index

use anyhow::Result;
use serde::Deserialize;

/// Full configuration surface, loadable from the environment
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Predictions below this confidence are counted as fallbacks
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Maximum number of cached models
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Duration of one accuracy window in milliseconds
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,

    /// Number of archived windows kept per file
    #[serde(default = "default_max_windows_stored")]
    pub max_windows_stored: usize,

    /// Retention bound for the per-file prediction event ring
    #[serde(default = "default_max_events_per_window")]
    pub max_events_per_window: usize,

    /// Accuracy floor below which a model needs retraining
    #[serde(default = "default_minimum_accuracy_threshold")]
    pub minimum_accuracy_threshold: f64,

    /// Negative 1h trend slope that counts as degradation
    #[serde(default = "default_accuracy_degradation_threshold")]
    pub accuracy_degradation_threshold: f64,

    /// Minimum events in the current window before deciding to retrain
    #[serde(default = "default_min_predictions_for_decision")]
    pub min_predictions_for_decision: usize,

    /// Cooldown between retrains of the same model
    #[serde(default = "default_min_time_between_retrains_ms")]
    pub min_time_between_retrains_ms: u64,

    /// Period of the scheduler's monitoring scan
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,

    /// Number of retraining worker tasks
    #[serde(default = "default_max_concurrent_retraining")]
    pub max_concurrent_retraining: usize,

    /// Capacity of the retrain request queue
    #[serde(default = "default_retraining_queue_size")]
    pub retraining_queue_size: usize,

    /// Minimum training samples a retrain job must collect
    #[serde(default = "default_min_new_samples_for_retrain")]
    pub min_new_samples_for_retrain: usize,

    /// Accuracy below this triggers emergency retraining
    #[serde(default = "default_emergency_accuracy_threshold")]
    pub emergency_accuracy_threshold: f64,

    /// Bound on buffered ground-truth observations per file
    #[serde(default = "default_max_online_samples_per_file")]
    pub max_online_samples_per_file: usize,

    /// Path prefix for exported metrics files
    #[serde(default = "default_metrics_export_path")]
    pub metrics_export_path: String,
}

fn default_confidence_threshold() -> f64 {
    0.8
}

fn default_max_cache_size() -> usize {
    1000
}

fn default_window_duration_ms() -> u64 {
    60_000
}

fn default_max_windows_stored() -> usize {
    1440
}

fn default_max_events_per_window() -> usize {
    10_000
}

fn default_minimum_accuracy_threshold() -> f64 {
    0.85
}

fn default_accuracy_degradation_threshold() -> f64 {
    0.05
}

fn default_min_predictions_for_decision() -> usize {
    100
}

fn default_min_time_between_retrains_ms() -> u64 {
    300_000
}

fn default_monitoring_interval_ms() -> u64 {
    30_000
}

fn default_max_concurrent_retraining() -> usize {
    2
}

fn default_retraining_queue_size() -> usize {
    100
}

fn default_min_new_samples_for_retrain() -> usize {
    1000
}

fn default_emergency_accuracy_threshold() -> f64 {
    0.5
}

fn default_max_online_samples_per_file() -> usize {
    8192
}

fn default_metrics_export_path() -> String {
    "/tmp/learned_index_metrics".to_string()
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_cache_size: default_max_cache_size(),
            window_duration_ms: default_window_duration_ms(),
            max_windows_stored: default_max_windows_stored(),
            max_events_per_window: default_max_events_per_window(),
            minimum_accuracy_threshold: default_minimum_accuracy_threshold(),
            accuracy_degradation_threshold: default_accuracy_degradation_threshold(),
            min_predictions_for_decision: default_min_predictions_for_decision(),
            min_time_between_retrains_ms: default_min_time_between_retrains_ms(),
            monitoring_interval_ms: default_monitoring_interval_ms(),
            max_concurrent_retraining: default_max_concurrent_retraining(),
            retraining_queue_size: default_retraining_queue_size(),
            min_new_samples_for_retrain: default_min_new_samples_for_retrain(),
            emergency_accuracy_threshold: default_emergency_accuracy_threshold(),
            max_online_samples_per_file: default_max_online_samples_per_file(),
            metrics_export_path: default_metrics_export_path(),
        }
    }
}

impl IndexConfig {
    /// Load configuration from `LEARNED_INDEX_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("LEARNED_INDEX"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            confidence_threshold: self.confidence_threshold,
            max_cache_size: self.max_cache_size,
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            window_duration_ms: self.window_duration_ms,
            max_windows_stored: self.max_windows_stored,
            max_events_per_window: self.max_events_per_window,
            minimum_accuracy_threshold: self.minimum_accuracy_threshold,
            accuracy_degradation_threshold: self.accuracy_degradation_threshold,
            min_predictions_for_decision: self.min_predictions_for_decision,
            min_time_between_retrains_ms: self.min_time_between_retrains_ms,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            monitoring_interval_ms: self.monitoring_interval_ms,
            max_concurrent_retraining: self.max_concurrent_retraining,
            retraining_queue_size: self.retraining_queue_size,
            min_new_samples_for_retrain: self.min_new_samples_for_retrain,
            emergency_accuracy_threshold: self.emergency_accuracy_threshold,
            max_online_samples_per_file: self.max_online_samples_per_file,
        }
    }
}

/// Configuration for the model store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub confidence_threshold: f64,
    pub max_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        IndexConfig::default().store()
    }
}

/// Configuration for the performance tracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub window_duration_ms: u64,
    pub max_windows_stored: usize,
    pub max_events_per_window: usize,
    pub minimum_accuracy_threshold: f64,
    pub accuracy_degradation_threshold: f64,
    pub min_predictions_for_decision: usize,
    pub min_time_between_retrains_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        IndexConfig::default().tracker()
    }
}

/// Configuration for the retraining scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub monitoring_interval_ms: u64,
    pub max_concurrent_retraining: usize,
    pub retraining_queue_size: usize,
    pub min_new_samples_for_retrain: usize,
    pub emergency_accuracy_threshold: f64,
    pub max_online_samples_per_file: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        IndexConfig::default().scheduler()
    }
}
