//! Adaptive learned index for SST files
//!
//! This crate provides the core functionality for:
//! - Per-file linear key-to-block models with a bounded cache
//! - Windowed prediction accuracy tracking and drift detection
//! - Background retraining with a monitor and bounded worker pool
//! - Persisted model records with checksum validation
//! - Metrics export and observability

pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod models;
pub mod observability;
pub mod retrain;
pub mod store;
pub mod tracker;

pub use config::{IndexConfig, SchedulerConfig, StoreConfig, TrackerConfig};
pub use error::{RecordError, TrainError};
pub use manager::{AdaptiveIndexManager, ExportFormat};
pub use models::*;
pub use observability::IndexMetrics;
pub use retrain::{RetrainingScheduler, RetrainingStats, TrainingDataSource};
pub use store::LearnedIndexStore;
pub use tracker::PerformanceTracker;
