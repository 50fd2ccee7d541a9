//! Observability for the learned index
//!
//! Prometheus metrics behind a process-wide registry with a lightweight
//! cloneable handle; structured logging happens inline at the call sites
//! via `tracing`.

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for prediction latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.000001, 0.000005, 0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<IndexMetricsInner> = OnceLock::new();

struct IndexMetricsInner {
    prediction_latency_seconds: Histogram,
    cached_models: IntGauge,
    retrain_queue_depth: IntGauge,
    predictions_served: IntCounter,
    fallback_queries: IntCounter,
    retrainings_succeeded: IntCounter,
    retrainings_failed: IntCounter,
}

impl IndexMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "learned_index_prediction_latency_seconds",
                "Time spent serving a block prediction",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            cached_models: register_int_gauge!(
                "learned_index_cached_models",
                "Number of trained models currently cached"
            )
            .expect("Failed to register cached_models"),

            retrain_queue_depth: register_int_gauge!(
                "learned_index_retrain_queue_depth",
                "Number of queued retraining requests"
            )
            .expect("Failed to register retrain_queue_depth"),

            predictions_served: register_int_counter!(
                "learned_index_predictions_served_total",
                "Total block predictions served from a cached model"
            )
            .expect("Failed to register predictions_served"),

            fallback_queries: register_int_counter!(
                "learned_index_fallback_queries_total",
                "Total queries answered without a usable prediction"
            )
            .expect("Failed to register fallback_queries"),

            retrainings_succeeded: register_int_counter!(
                "learned_index_retrainings_succeeded_total",
                "Total successful retraining jobs"
            )
            .expect("Failed to register retrainings_succeeded"),

            retrainings_failed: register_int_counter!(
                "learned_index_retrainings_failed_total",
                "Total failed retraining jobs"
            )
            .expect("Failed to register retrainings_failed"),
        }
    }
}

/// Handle to the global learned index metrics
///
/// Clones share the same underlying registry entries.
#[derive(Clone)]
pub struct IndexMetrics {
    _private: (),
}

impl Default for IndexMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(IndexMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &IndexMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn set_cached_models(&self, count: i64) {
        self.inner().cached_models.set(count);
    }

    pub fn set_retrain_queue_depth(&self, depth: i64) {
        self.inner().retrain_queue_depth.set(depth);
    }

    pub fn inc_predictions_served(&self) {
        self.inner().predictions_served.inc();
    }

    pub fn inc_fallback_queries(&self) {
        self.inner().fallback_queries.inc();
    }

    pub fn inc_retrainings_succeeded(&self) {
        self.inner().retrainings_succeeded.inc();
    }

    pub fn inc_retrainings_failed(&self) {
        self.inner().retrainings_failed.inc();
    }
}
