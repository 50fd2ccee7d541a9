//! Model performance tracking and the retrain decision
//!
//! Ingests resolved prediction events per file, maintains bounded event
//! rings and an archive of windowed accuracy snapshots, and turns them
//! into a `needs_retraining` decision combining an absolute accuracy
//! floor, a trend term, a sample floor, and a retrain cooldown.

use crate::config::TrackerConfig;
use crate::model::linear_slope;
use crate::models::{now_ms, FileId, ModelHealth, PredictionEvent, WindowedMetrics};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

const HOUR_MS: u64 = 3_600_000;
const WEEK_MS: u64 = 604_800_000;

#[derive(Default)]
struct FileTracking {
    events: VecDeque<PredictionEvent>,
    windows: VecDeque<WindowedMetrics>,
    health: ModelHealth,
    last_window_roll_ms: u64,
}

/// Windowed accuracy tracking for every file with a learned index
pub struct PerformanceTracker {
    config: TrackerConfig,
    inner: Mutex<HashMap<FileId, FileTracking>>,
}

impl PerformanceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record one resolved prediction outcome
    ///
    /// Rolls a windowed snapshot into the archive whenever a full window
    /// has elapsed since the last roll; the check is opportunistic, no
    /// timer involved.
    pub fn record_prediction(&self, file_id: &str, event: PredictionEvent) {
        let timestamp_ms = event.timestamp_ms;
        let mut inner = self.inner.lock();
        let tracking = entry_for(&mut inner, file_id);

        tracking.events.push_back(event);
        while tracking.events.len() > self.config.max_events_per_window {
            tracking.events.pop_front();
        }
        tracking.health.total_queries_served += 1;

        if tracking.last_window_roll_ms == 0 {
            tracking.last_window_roll_ms = timestamp_ms;
        } else if timestamp_ms.saturating_sub(tracking.last_window_roll_ms)
            >= self.config.window_duration_ms
        {
            let window_start = timestamp_ms.saturating_sub(self.config.window_duration_ms);
            let metrics = metrics_from_events(&tracking.events, window_start, timestamp_ms);
            tracking.windows.push_back(metrics);
            while tracking.windows.len() > self.config.max_windows_stored {
                tracking.windows.pop_front();
            }
            tracking.last_window_roll_ms = timestamp_ms;
        }
    }

    /// Record a successful (re)training of `file_id`'s model
    ///
    /// This is the only path that clears `needs_retraining`; a failed
    /// retrain leaves the flag set so the scheduler retries.
    pub fn record_training_event(
        &self,
        file_id: &str,
        timestamp_ms: u64,
        training_samples: usize,
        training_accuracy: f64,
    ) {
        let mut inner = self.inner.lock();
        let tracking = entry_for(&mut inner, file_id);

        tracking.health.last_retrain_ms = timestamp_ms;
        tracking.health.retrain_count += 1;
        tracking.health.is_degrading = false;
        tracking.health.needs_retraining = false;

        info!(
            file_id = %file_id,
            samples = training_samples,
            accuracy = training_accuracy,
            retrain_count = tracking.health.retrain_count,
            "Recorded model training event"
        );
    }

    /// Recompute and return the health snapshot for one file
    pub fn compute_health_metrics(&self, file_id: &str) -> ModelHealth {
        let now = now_ms();
        let mut inner = self.inner.lock();
        let tracking = entry_for(&mut inner, file_id);
        compute_health(&self.config, tracking, now)
    }

    /// Metrics over the trailing window ending now
    pub fn current_metrics(&self, file_id: &str) -> WindowedMetrics {
        let now = now_ms();
        let inner = self.inner.lock();
        match inner.get(file_id) {
            Some(tracking) => metrics_from_events(
                &tracking.events,
                now.saturating_sub(self.config.window_duration_ms),
                now,
            ),
            None => WindowedMetrics::default(),
        }
    }

    /// Metrics over an explicit `[start_ms, end_ms]` range of events
    pub fn window_metrics(&self, file_id: &str, start_ms: u64, end_ms: u64) -> WindowedMetrics {
        let inner = self.inner.lock();
        match inner.get(file_id) {
            Some(tracking) => metrics_from_events(&tracking.events, start_ms, end_ms),
            None => WindowedMetrics::default(),
        }
    }

    /// Archived windows overlapping `[start_ms, end_ms]`
    pub fn historical_metrics(
        &self,
        file_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Vec<WindowedMetrics> {
        let inner = self.inner.lock();
        match inner.get(file_id) {
            Some(tracking) => tracking
                .windows
                .iter()
                .filter(|w| w.window_start_ms >= start_ms && w.window_end_ms <= end_ms)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Files whose health currently calls for a retrain
    ///
    /// O(tracked files); runs on the scheduler's slow monitoring cadence,
    /// never on the query path.
    pub fn models_needing_retrain(&self) -> Vec<FileId> {
        let now = now_ms();
        let mut inner = self.inner.lock();
        let mut needing = Vec::new();
        for (file_id, tracking) in inner.iter_mut() {
            if compute_health(&self.config, tracking, now).needs_retraining {
                needing.push(file_id.clone());
            }
        }
        needing
    }

    pub fn tracked_files(&self) -> Vec<FileId> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Drop events and windows older than the archive horizon
    pub fn cleanup_old_data(&self) {
        let horizon = self.config.max_windows_stored as u64 * self.config.window_duration_ms;
        let cutoff = now_ms().saturating_sub(horizon);
        let mut inner = self.inner.lock();
        for tracking in inner.values_mut() {
            while tracking
                .events
                .front()
                .is_some_and(|e| e.timestamp_ms < cutoff)
            {
                tracking.events.pop_front();
            }
            while tracking
                .windows
                .front()
                .is_some_and(|w| w.window_end_ms < cutoff)
            {
                tracking.windows.pop_front();
            }
        }
        debug!(cutoff_ms = cutoff, "Cleaned up old tracking data");
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

fn entry_for<'a>(
    inner: &'a mut HashMap<FileId, FileTracking>,
    file_id: &str,
) -> &'a mut FileTracking {
    inner.entry(file_id.to_string()).or_insert_with(|| {
        let mut tracking = FileTracking::default();
        tracking.health.file_id = file_id.to_string();
        tracking
    })
}

fn compute_health(config: &TrackerConfig, tracking: &mut FileTracking, now: u64) -> ModelHealth {
    let current = metrics_from_events(
        &tracking.events,
        now.saturating_sub(config.window_duration_ms),
        now,
    );

    let health = &mut tracking.health;
    health.current_accuracy = current.accuracy_rate;
    health.trend_1h = accuracy_trend(&tracking.windows, now, HOUR_MS);
    health.trend_7d = accuracy_trend(&tracking.windows, now, WEEK_MS);
    health.is_degrading = health.trend_1h < -config.accuracy_degradation_threshold;

    let enough_samples = current.total >= config.min_predictions_for_decision;
    let cooldown_elapsed =
        now.saturating_sub(health.last_retrain_ms) >= config.min_time_between_retrains_ms;
    let below_floor = health.current_accuracy < config.minimum_accuracy_threshold;

    health.needs_retraining =
        enough_samples && cooldown_elapsed && (below_floor || health.is_degrading);

    health.clone()
}

fn metrics_from_events(
    events: &VecDeque<PredictionEvent>,
    start_ms: u64,
    end_ms: u64,
) -> WindowedMetrics {
    let mut metrics = WindowedMetrics {
        window_start_ms: start_ms,
        window_end_ms: end_ms,
        ..Default::default()
    };

    let mut confidence_sum = 0.0;
    for event in events {
        if event.timestamp_ms >= start_ms && event.timestamp_ms <= end_ms {
            metrics.total += 1;
            if event.correct {
                metrics.correct += 1;
            }
            confidence_sum += event.confidence;
        }
    }

    if metrics.total == 0 {
        return metrics;
    }

    metrics.accuracy_rate = metrics.correct as f64 / metrics.total as f64;
    metrics.avg_confidence = confidence_sum / metrics.total as f64;

    let window_secs = (end_ms.saturating_sub(start_ms)) as f64 / 1000.0;
    if window_secs > 0.0 {
        metrics.throughput_qps = metrics.total as f64 / window_secs;
    }

    metrics
}

/// Slope of accuracy over the archived windows inside the trailing
/// `duration_ms`; the sign says whether the model is improving or decaying
fn accuracy_trend(windows: &VecDeque<WindowedMetrics>, now: u64, duration_ms: u64) -> f64 {
    let start = now.saturating_sub(duration_ms);
    let accuracies: Vec<f64> = windows
        .iter()
        .filter(|w| w.window_start_ms >= start && w.total > 0)
        .map(|w| w.accuracy_rate)
        .collect();
    linear_slope(&accuracies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_event(correct: bool, timestamp_ms: u64) -> PredictionEvent {
        PredictionEvent {
            key: 42,
            predicted_block: 1,
            actual_block: if correct { 1 } else { 2 },
            confidence: 0.9,
            correct,
            timestamp_ms,
        }
    }

    fn test_config() -> TrackerConfig {
        TrackerConfig {
            window_duration_ms: 60_000,
            max_windows_stored: 100,
            max_events_per_window: 10_000,
            minimum_accuracy_threshold: 0.85,
            accuracy_degradation_threshold: 0.05,
            min_predictions_for_decision: 10,
            min_time_between_retrains_ms: 300_000,
        }
    }

    #[test]
    fn test_current_metrics_accuracy() {
        let tracker = PerformanceTracker::new(test_config());
        let now = now_ms();
        for i in 0..10 {
            tracker.record_prediction("a.sst", create_test_event(i < 7, now));
        }

        let metrics = tracker.current_metrics("a.sst");
        assert_eq!(metrics.total, 10);
        assert_eq!(metrics.correct, 7);
        assert!((metrics.accuracy_rate - 0.7).abs() < 1e-9);
        assert!((metrics.avg_confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_low_accuracy_triggers_retrain_flag() {
        let tracker = PerformanceTracker::new(test_config());
        let now = now_ms();
        for _ in 0..20 {
            tracker.record_prediction("a.sst", create_test_event(false, now));
        }

        let health = tracker.compute_health_metrics("a.sst");
        assert_eq!(health.current_accuracy, 0.0);
        assert!(health.needs_retraining);
        assert_eq!(health.total_queries_served, 20);
    }

    #[test]
    fn test_too_few_events_never_triggers() {
        let tracker = PerformanceTracker::new(test_config());
        let now = now_ms();
        for _ in 0..5 {
            tracker.record_prediction("a.sst", create_test_event(false, now));
        }

        let health = tracker.compute_health_metrics("a.sst");
        assert!(!health.needs_retraining);
    }

    #[test]
    fn test_accurate_model_not_flagged() {
        let tracker = PerformanceTracker::new(test_config());
        let now = now_ms();
        for _ in 0..20 {
            tracker.record_prediction("a.sst", create_test_event(true, now));
        }

        let health = tracker.compute_health_metrics("a.sst");
        assert!((health.current_accuracy - 1.0).abs() < 1e-9);
        assert!(!health.needs_retraining);
    }

    #[test]
    fn test_training_event_clears_flag_once() {
        let tracker = PerformanceTracker::new(test_config());
        let now = now_ms();
        for _ in 0..20 {
            tracker.record_prediction("a.sst", create_test_event(false, now));
        }
        assert!(tracker.compute_health_metrics("a.sst").needs_retraining);

        tracker.record_training_event("a.sst", now, 100, 0.95);

        // The flag clears and retrain_count bumps by exactly one; the
        // cooldown keeps it clear even though the bad events remain
        let health = tracker.compute_health_metrics("a.sst");
        assert!(!health.needs_retraining);
        assert_eq!(health.retrain_count, 1);
        assert_eq!(health.last_retrain_ms, now);
    }

    #[test]
    fn test_cooldown_blocks_retraining() {
        let tracker = PerformanceTracker::new(test_config());
        let now = now_ms();

        // A recent retrain, then a burst of bad predictions
        tracker.record_training_event("a.sst", now, 100, 0.95);
        for _ in 0..20 {
            tracker.record_prediction("a.sst", create_test_event(false, now));
        }

        assert!(!tracker.compute_health_metrics("a.sst").needs_retraining);
    }

    #[test]
    fn test_degrading_trend_detected() {
        let mut config = test_config();
        config.window_duration_ms = 10_000;
        config.accuracy_degradation_threshold = 0.01;
        // Keep the absolute floor out of the way so the trend term decides
        config.minimum_accuracy_threshold = 0.0;
        let tracker = PerformanceTracker::new(config);

        // Accuracy decays from 1.0 to 0.0 over ~200s of one-event-per-second
        let now = now_ms();
        let start = now - 200_000;
        for i in 0..200u64 {
            let event = create_test_event(i < 100, start + i * 1000);
            tracker.record_prediction("a.sst", event);
        }

        let health = tracker.compute_health_metrics("a.sst");
        assert!(health.trend_1h < -0.01, "trend was {}", health.trend_1h);
        assert!(health.is_degrading);
        assert!(health.needs_retraining);
    }

    #[test]
    fn test_event_ring_is_bounded() {
        let mut config = test_config();
        config.max_events_per_window = 5;
        let tracker = PerformanceTracker::new(config);

        let now = now_ms();
        for _ in 0..20 {
            tracker.record_prediction("a.sst", create_test_event(true, now));
        }

        let metrics = tracker.current_metrics("a.sst");
        assert_eq!(metrics.total, 5);
        // Total served still counts every event
        assert_eq!(
            tracker.compute_health_metrics("a.sst").total_queries_served,
            20
        );
    }

    #[test]
    fn test_models_needing_retrain_scan() {
        let tracker = PerformanceTracker::new(test_config());
        let now = now_ms();
        for _ in 0..20 {
            tracker.record_prediction("bad.sst", create_test_event(false, now));
            tracker.record_prediction("good.sst", create_test_event(true, now));
        }

        let needing = tracker.models_needing_retrain();
        assert_eq!(needing, vec!["bad.sst".to_string()]);
    }

    #[test]
    fn test_historical_metrics_range() {
        let mut config = test_config();
        config.window_duration_ms = 1_000;
        let tracker = PerformanceTracker::new(config);

        let now = now_ms();
        let start = now - 10_000;
        for i in 0..10u64 {
            tracker.record_prediction("a.sst", create_test_event(true, start + i * 1000));
        }

        let windows = tracker.historical_metrics("a.sst", start, now);
        assert!(!windows.is_empty());
        for window in &windows {
            assert!(window.accuracy_rate > 0.99);
        }
    }

    #[test]
    fn test_window_metrics_explicit_range() {
        let tracker = PerformanceTracker::new(test_config());
        let now = now_ms();
        for i in 0..10u64 {
            tracker.record_prediction("a.sst", create_test_event(i < 5, now - 1000 + i * 100));
        }

        // Only the correct first half falls inside the range
        let metrics = tracker.window_metrics("a.sst", now - 1000, now - 600);
        assert_eq!(metrics.total, 5);
        assert!((metrics.accuracy_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cleanup_drops_stale_data() {
        let mut config = test_config();
        config.window_duration_ms = 1_000;
        config.max_windows_stored = 10;
        let tracker = PerformanceTracker::new(config);

        // Events far beyond the 10-second archive horizon
        let stale = now_ms() - 100_000;
        for i in 0..10u64 {
            tracker.record_prediction("a.sst", create_test_event(true, stale + i * 1000));
        }
        assert!(tracker.window_metrics("a.sst", 0, u64::MAX).total > 0);

        tracker.cleanup_old_data();
        assert_eq!(tracker.window_metrics("a.sst", 0, u64::MAX).total, 0);
        assert!(tracker.historical_metrics("a.sst", 0, u64::MAX).is_empty());
    }

    #[test]
    fn test_unknown_file_defaults() {
        let tracker = PerformanceTracker::new(test_config());
        assert_eq!(tracker.current_metrics("nope.sst").total, 0);
        assert!(tracker.historical_metrics("nope.sst", 0, u64::MAX).is_empty());

        let health = tracker.compute_health_metrics("nope.sst");
        assert_eq!(health.file_id, "nope.sst");
        assert!(!health.needs_retraining);
    }

    #[test]
    fn test_clear() {
        let tracker = PerformanceTracker::new(test_config());
        tracker.record_prediction("a.sst", create_test_event(true, now_ms()));
        assert_eq!(tracker.tracked_files().len(), 1);

        tracker.clear();
        assert!(tracker.tracked_files().is_empty());
    }
}
