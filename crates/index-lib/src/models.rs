//! Core data models for the learned index subsystem

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Identifier of an SST file (its path in the storage layer)
pub type FileId = String;

/// Current wall-clock time in milliseconds since the Unix epoch
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Outcome of a single resolved prediction, recorded once the actual
/// block is known
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionEvent {
    pub key: u64,
    pub predicted_block: u32,
    pub actual_block: u32,
    pub confidence: f64,
    pub correct: bool,
    pub timestamp_ms: u64,
}

/// Accuracy and throughput statistics over a trailing time window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowedMetrics {
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub total: usize,
    pub correct: usize,
    pub accuracy_rate: f64,
    pub avg_confidence: f64,
    pub throughput_qps: f64,
}

/// Health snapshot for one file's model, maintained by the tracker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelHealth {
    pub file_id: FileId,
    pub current_accuracy: f64,
    pub trend_1h: f64,
    pub trend_7d: f64,
    pub is_degrading: bool,
    pub needs_retraining: bool,
    pub total_queries_served: u64,
    pub last_retrain_ms: u64,
    pub retrain_count: u64,
}

/// Why a retrain was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrainReason {
    Manual,
    Automatic,
    Emergency,
}

impl RetrainReason {
    /// Queue severity; higher sorts first
    pub(crate) fn severity(self) -> u8 {
        match self {
            RetrainReason::Emergency => 1,
            RetrainReason::Manual | RetrainReason::Automatic => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetrainReason::Manual => "manual",
            RetrainReason::Automatic => "automatic",
            RetrainReason::Emergency => "emergency",
        }
    }
}

/// A queued request to retrain one file's model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainingRequest {
    pub file_id: FileId,
    pub enqueued_ms: u64,
    pub reason: RetrainReason,
    pub observed_accuracy: f64,
}

// Heap ordering: emergency requests before everything else, then FIFO by
// enqueue time within a severity class.
impl Ord for RetrainingRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.reason
            .severity()
            .cmp(&other.reason.severity())
            .then_with(|| other.enqueued_ms.cmp(&self.enqueued_ms))
            .then_with(|| other.file_id.cmp(&self.file_id))
    }
}

impl PartialOrd for RetrainingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RetrainingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RetrainingRequest {}

/// Terminal outcome of one retraining job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainingResult {
    pub file_id: FileId,
    pub success: bool,
    pub new_accuracy: f64,
    pub sample_count: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Per-file prediction counters kept by the store
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_queries: u64,
    pub successful_predictions: u64,
    pub fallback_queries: u64,
}

impl IndexStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.successful_predictions as f64 / self.total_queries as f64
    }

    pub fn fallback_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.fallback_queries as f64 / self.total_queries as f64
    }
}
