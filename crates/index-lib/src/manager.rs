//! Facade composing the store, tracker, and scheduler
//!
//! Routes predictions through the store while holding a provisional
//! record of each one; when the caller reports the actual block, the
//! prediction is resolved into a finalized event for the tracker and the
//! observation is buffered as future training data. This feedback loop
//! is what makes drift observable.

use crate::config::IndexConfig;
use crate::models::{
    now_ms, FileId, IndexStats, ModelHealth, PredictionEvent, RetrainReason, RetrainingResult,
    WindowedMetrics,
};
use crate::observability::IndexMetrics;
use crate::retrain::{RetrainingScheduler, RetrainingStats, TrainingDataSource};
use crate::store::LearnedIndexStore;
use crate::tracker::PerformanceTracker;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Bound on provisional predictions awaiting ground truth
const MAX_PENDING_PREDICTIONS: usize = 8192;

/// Output format for `export_metrics`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(anyhow::anyhow!("unknown export format: {other}")),
        }
    }
}

/// One exported row per tracked file
#[derive(Debug, Clone, Serialize)]
struct MetricsExportRecord {
    file_id: FileId,
    current_accuracy: f64,
    total_queries: u64,
    trend_1h: f64,
    trend_7d: f64,
    is_degrading: bool,
    needs_retraining: bool,
    retrain_count: u64,
    throughput_qps: f64,
}

#[derive(Debug, Serialize)]
struct MetricsExportDocument {
    exported_at_ms: u64,
    models: Vec<MetricsExportRecord>,
}

struct PendingPrediction {
    predicted_block: u32,
    confidence: f64,
}

#[derive(Default)]
struct PendingPredictions {
    map: HashMap<(FileId, u64), PendingPrediction>,
    order: VecDeque<(FileId, u64)>,
}

impl PendingPredictions {
    fn insert(&mut self, file_id: &str, key: u64, pending: PendingPrediction) {
        let slot = (file_id.to_string(), key);
        if self.map.insert(slot.clone(), pending).is_none() {
            self.order.push_back(slot);
        }
        while self.map.len() > MAX_PENDING_PREDICTIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn take(&mut self, file_id: &str, key: u64) -> Option<PendingPrediction> {
        self.map.remove(&(file_id.to_string(), key))
    }
}

/// Adaptive learned index: prediction, tracking, and background retraining
pub struct AdaptiveIndexManager {
    config: IndexConfig,
    store: Arc<LearnedIndexStore>,
    tracker: Arc<PerformanceTracker>,
    scheduler: Arc<RetrainingScheduler>,
    pending: Mutex<PendingPredictions>,
    monitoring_active: AtomicBool,
    metrics: IndexMetrics,
}

impl AdaptiveIndexManager {
    /// Build the manager and the channel retraining results arrive on
    pub fn new(config: IndexConfig) -> (Self, mpsc::Receiver<RetrainingResult>) {
        let store = Arc::new(LearnedIndexStore::new(config.store()));
        let tracker = Arc::new(PerformanceTracker::new(config.tracker()));
        let (scheduler, result_rx) = RetrainingScheduler::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            config.scheduler(),
        );

        let manager = Self {
            config,
            store,
            tracker,
            scheduler: Arc::new(scheduler),
            pending: Mutex::new(PendingPredictions::default()),
            monitoring_active: AtomicBool::new(false),
            metrics: IndexMetrics::new(),
        };
        (manager, result_rx)
    }

    /// Install the storage layer's training data source
    pub fn set_training_data_source(&self, source: Arc<dyn TrainingDataSource>) {
        self.scheduler.set_data_source(source);
    }

    /// Predict the block holding `key` in `file_id`
    ///
    /// `None` means no usable model is cached and the caller falls back
    /// to its non-learned lookup. While monitoring is active the
    /// prediction is held provisionally until `record_actual_block`
    /// resolves it.
    pub fn predict_block_index(&self, file_id: &str, key: u64) -> Option<u32> {
        let started = Instant::now();
        let prediction = self.store.predict(file_id, key);
        self.metrics
            .observe_prediction_latency(started.elapsed().as_secs_f64());

        match prediction {
            Some((block, confidence)) => {
                self.metrics.inc_predictions_served();
                if self.is_monitoring_active() {
                    self.pending.lock().insert(
                        file_id,
                        key,
                        PendingPrediction {
                            predicted_block: block,
                            confidence,
                        },
                    );
                }
                Some(block)
            }
            None => {
                self.metrics.inc_fallback_queries();
                None
            }
        }
    }

    /// Confidence the cached model reports for `key`
    pub fn get_prediction_confidence(&self, file_id: &str, key: u64) -> Option<f64> {
        self.store.prediction_confidence(file_id, key)
    }

    /// Report where `key` actually lived, closing the feedback loop
    ///
    /// Resolves the provisional prediction (re-predicting when it has
    /// already been evicted), feeds the finalized event to the tracker,
    /// and buffers the observation as future training data.
    pub fn record_actual_block(&self, file_id: &str, key: u64, actual_block: u32) {
        if !self.is_monitoring_active() {
            return;
        }

        let resolved = self
            .pending
            .lock()
            .take(file_id, key)
            .map(|p| (p.predicted_block, p.confidence))
            .or_else(|| self.store.predict(file_id, key));

        let (predicted_block, confidence) = match resolved {
            Some(resolved) => resolved,
            // No model ever predicted this key; nothing to resolve, but
            // the observation is still useful training data
            None => {
                self.scheduler.record_observation(file_id, key, actual_block);
                return;
            }
        };

        let event = PredictionEvent {
            key,
            predicted_block,
            actual_block,
            confidence,
            correct: predicted_block == actual_block,
            timestamp_ms: now_ms(),
        };
        self.tracker.record_prediction(file_id, event);
        self.scheduler.record_observation(file_id, key, actual_block);
    }

    /// Train a model for `file_id` from explicit samples
    pub fn train_model(&self, file_id: &str, samples: &[(u64, u32)]) -> bool {
        match self.store.train(file_id, samples) {
            Ok(()) => {
                let accuracy = self.store.model_accuracy(file_id).unwrap_or_default();
                self.tracker
                    .record_training_event(file_id, now_ms(), samples.len(), accuracy);
                self.metrics.set_cached_models(self.store.len() as i64);
                true
            }
            Err(e) => {
                warn!(file_id = %file_id, error = %e, "Model training failed");
                false
            }
        }
    }

    /// Ask the scheduler to retrain `file_id`
    pub fn request_model_retraining(&self, file_id: &str, reason: RetrainReason) -> bool {
        match reason {
            RetrainReason::Emergency => self.scheduler.request_emergency_retraining(file_id),
            _ => self.scheduler.request_retraining(file_id, reason),
        }
    }

    pub fn get_model_health(&self, file_id: &str) -> ModelHealth {
        self.tracker.compute_health_metrics(file_id)
    }

    pub fn get_current_metrics(&self, file_id: &str) -> WindowedMetrics {
        self.tracker.current_metrics(file_id)
    }

    pub fn get_index_stats(&self, file_id: &str) -> IndexStats {
        self.store.stats(file_id)
    }

    pub fn models_needing_retrain(&self) -> Vec<FileId> {
        self.tracker.models_needing_retrain()
    }

    pub fn scheduler_stats(&self) -> RetrainingStats {
        self.scheduler.stats()
    }

    /// Start the feedback loop and the background scheduler
    pub fn start_adaptive_monitoring(&self) {
        if self.monitoring_active.swap(true, Ordering::SeqCst) {
            return;
        }
        Arc::clone(&self.scheduler).start();
        info!("Adaptive monitoring started");
    }

    /// Stop monitoring; in-flight retraining runs to completion
    pub async fn stop_adaptive_monitoring(&self) {
        if !self.monitoring_active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scheduler.stop().await;
        info!("Adaptive monitoring stopped");
    }

    pub fn is_monitoring_active(&self) -> bool {
        self.monitoring_active.load(Ordering::SeqCst)
    }

    /// Snapshot tracker state to disk, one record per tracked file
    ///
    /// Returns the path written, `<metrics_export_path>_<unix_secs>.<ext>`.
    pub fn export_metrics(&self, format: ExportFormat) -> Result<PathBuf> {
        let records = self.export_records();
        let contents = match format {
            ExportFormat::Json => serde_json::to_string_pretty(&MetricsExportDocument {
                exported_at_ms: now_ms(),
                models: records,
            })
            .context("Failed to serialize metrics export")?,
            ExportFormat::Csv => render_csv(&records),
        };

        let path = PathBuf::from(format!(
            "{}_{}.{}",
            self.config.metrics_export_path,
            now_ms() / 1000,
            format.extension()
        ));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write metrics export {:?}", path))?;

        info!(path = %path.display(), "Exported learned index metrics");
        Ok(path)
    }

    fn export_records(&self) -> Vec<MetricsExportRecord> {
        let mut records = Vec::new();
        for file_id in self.tracker.tracked_files() {
            let health = self.tracker.compute_health_metrics(&file_id);
            let current = self.tracker.current_metrics(&file_id);
            records.push(MetricsExportRecord {
                file_id,
                current_accuracy: health.current_accuracy,
                total_queries: health.total_queries_served,
                trend_1h: health.trend_1h,
                trend_7d: health.trend_7d,
                is_degrading: health.is_degrading,
                needs_retraining: health.needs_retraining,
                retrain_count: health.retrain_count,
                throughput_qps: current.throughput_qps,
            });
        }
        records.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        records
    }

    /// Shared handle to the model store
    pub fn store(&self) -> Arc<LearnedIndexStore> {
        Arc::clone(&self.store)
    }

    /// Shared handle to the performance tracker
    pub fn tracker(&self) -> Arc<PerformanceTracker> {
        Arc::clone(&self.tracker)
    }
}

fn render_csv(records: &[MetricsExportRecord]) -> String {
    let mut out = String::from(
        "file_id,current_accuracy,total_queries,trend_1h,trend_7d,\
         is_degrading,needs_retraining,retrain_count,throughput_qps\n",
    );
    for r in records {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            r.file_id,
            r.current_accuracy,
            r.total_queries,
            r.trend_1h,
            r.trend_7d,
            r.is_degrading as u8,
            r.needs_retraining as u8,
            r.retrain_count,
            r.throughput_qps,
        ));
    }
    out
}
