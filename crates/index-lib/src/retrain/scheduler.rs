//! Background retraining scheduler
//!
//! Runs one monitoring task plus a bounded pool of worker tasks. The
//! monitor asks the tracker which models need retraining and enqueues
//! requests; workers pull from the priority queue, collect training data
//! (buffered ground-truth observations first, then the storage layer's
//! data source), retrain through the store, and report each outcome on
//! the result channel. A failed job leaves the tracker's retrain flag
//! set so the model is retried on a later scan.

use super::queue::{EnqueueOutcome, RetrainQueue};
use crate::config::SchedulerConfig;
use crate::models::{now_ms, FileId, RetrainReason, RetrainingRequest, RetrainingResult};
use crate::observability::IndexMetrics;
use crate::store::LearnedIndexStore;
use crate::tracker::PerformanceTracker;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Smoothing factor for the retrain duration moving average
const DURATION_EMA_ALPHA: f64 = 0.1;

/// Worker back-off while paused or racing for queue entries
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Source of `(key, block)` training pairs when buffered observations
/// fall short: the storage layer's view of a file's current key layout
pub trait TrainingDataSource: Send + Sync {
    fn key_block_pairs(&self, file_id: &str) -> Option<Vec<(u64, u32)>>;
}

/// Running totals for the scheduler
#[derive(Debug, Clone, Default)]
pub struct RetrainingStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub automatic_triggers: u64,
    pub manual_triggers: u64,
    pub avg_duration_ms: f64,
}

/// Monitor plus bounded worker pool driving background retraining
pub struct RetrainingScheduler {
    config: SchedulerConfig,
    store: Arc<LearnedIndexStore>,
    tracker: Arc<PerformanceTracker>,
    data_source: Mutex<Option<Arc<dyn TrainingDataSource>>>,
    queue: RetrainQueue,
    queue_notify: Notify,
    observations: Mutex<HashMap<FileId, VecDeque<(u64, u32)>>>,
    result_tx: mpsc::Sender<RetrainingResult>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    paused: AtomicBool,
    active_jobs: AtomicUsize,
    stats: Mutex<RetrainingStats>,
    metrics: IndexMetrics,
}

impl RetrainingScheduler {
    /// Create a scheduler and the channel its results arrive on
    pub fn new(
        store: Arc<LearnedIndexStore>,
        tracker: Arc<PerformanceTracker>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::Receiver<RetrainingResult>) {
        let (result_tx, result_rx) = mpsc::channel(100);
        let scheduler = Self {
            queue: RetrainQueue::new(config.retraining_queue_size),
            config,
            store,
            tracker,
            data_source: Mutex::new(None),
            queue_notify: Notify::new(),
            observations: Mutex::new(HashMap::new()),
            result_tx,
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            active_jobs: AtomicUsize::new(0),
            stats: Mutex::new(RetrainingStats::default()),
            metrics: IndexMetrics::new(),
        };
        (scheduler, result_rx)
    }

    /// Install the storage layer's training data source
    pub fn set_data_source(&self, source: Arc<dyn TrainingDataSource>) {
        *self.data_source.lock() = Some(source);
    }

    /// Spawn the monitor and worker tasks
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.paused.store(false, Ordering::SeqCst);

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(
            Arc::clone(&self).monitor_loop(shutdown_tx.subscribe()),
        ));
        for worker_id in 0..self.config.max_concurrent_retraining {
            tasks.push(tokio::spawn(
                Arc::clone(&self).worker_loop(worker_id, shutdown_tx.subscribe()),
            ));
        }

        *self.shutdown_tx.lock() = Some(shutdown_tx);
        info!(
            workers = self.config.max_concurrent_retraining,
            interval_ms = self.config.monitoring_interval_ms,
            "Started retraining scheduler"
        );
    }

    /// Signal shutdown and wait for the monitor and workers to finish
    ///
    /// In-flight retraining jobs run to completion; the cache is never
    /// left mid-train.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
        }
        self.queue_notify.notify_waiters();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("Stopped retraining scheduler");
    }

    /// Gate the workers without tearing the tasks down; queued and newly
    /// accepted requests wait until `resume`
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.queue_notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Request a retrain of `file_id`
    ///
    /// Returns `false` when the queue is full or a request for the file
    /// is already in flight; both rejections are idempotent from the
    /// caller's perspective.
    pub fn request_retraining(&self, file_id: &str, reason: RetrainReason) -> bool {
        let observed_accuracy = self.tracker.compute_health_metrics(file_id).current_accuracy;
        let request = RetrainingRequest {
            file_id: file_id.to_string(),
            enqueued_ms: now_ms(),
            reason,
            observed_accuracy,
        };
        self.enqueue(request, false)
    }

    /// Safety valve: accept even when the queue is full, still deduped
    pub fn request_emergency_retraining(&self, file_id: &str) -> bool {
        let observed_accuracy = self.tracker.compute_health_metrics(file_id).current_accuracy;
        let request = RetrainingRequest {
            file_id: file_id.to_string(),
            enqueued_ms: now_ms(),
            reason: RetrainReason::Emergency,
            observed_accuracy,
        };
        self.enqueue(request, true)
    }

    fn enqueue(&self, request: RetrainingRequest, bypass_capacity: bool) -> bool {
        let file_id = request.file_id.clone();
        let reason = request.reason;
        match self.queue.try_enqueue(request, bypass_capacity) {
            EnqueueOutcome::Accepted => {
                let mut stats = self.stats.lock();
                stats.total_requests += 1;
                match reason {
                    RetrainReason::Manual => stats.manual_triggers += 1,
                    RetrainReason::Automatic | RetrainReason::Emergency => {
                        stats.automatic_triggers += 1
                    }
                }
                drop(stats);

                debug!(file_id = %file_id, reason = reason.as_str(), "Queued retraining request");
                self.metrics.set_retrain_queue_depth(self.queue.len() as i64);
                self.queue_notify.notify_one();
                true
            }
            EnqueueOutcome::QueueFull => {
                debug!(file_id = %file_id, "Retraining queue full, request rejected");
                false
            }
            EnqueueOutcome::AlreadyInFlight => {
                debug!(file_id = %file_id, "Retraining already in flight, request rejected");
                false
            }
        }
    }

    /// Buffer a ground-truth observation as future training data
    pub fn record_observation(&self, file_id: &str, key: u64, actual_block: u32) {
        let mut observations = self.observations.lock();
        let ring = observations.entry(file_id.to_string()).or_default();
        while ring.len() >= self.config.max_online_samples_per_file {
            ring.pop_front();
        }
        ring.push_back((key, actual_block));
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RetrainingStats {
        self.stats.lock().clone()
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_millis(self.config.monitoring_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_paused() {
                        self.scan_for_degraded_models();
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Monitor loop shutting down");
                    break;
                }
            }
        }
    }

    /// One monitoring pass: classify each degraded model and enqueue
    fn scan_for_degraded_models(&self) {
        for file_id in self.tracker.models_needing_retrain() {
            let health = self.tracker.compute_health_metrics(&file_id);
            if health.current_accuracy < self.config.emergency_accuracy_threshold {
                self.request_emergency_retraining(&file_id);
            } else {
                self.request_retraining(&file_id, RetrainReason::Automatic);
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let request = tokio::select! {
                request = self.next_request() => request,
                _ = shutdown.recv() => {
                    debug!(worker_id, "Worker shutting down");
                    break;
                }
            };

            // Shutdown delivered after this point lets the job finish first
            self.run_retraining(request).await;
        }
    }

    /// Block until a request can be popped while unpaused
    async fn next_request(&self) -> RetrainingRequest {
        loop {
            if !self.is_paused() {
                if let Some(request) = self.queue.pop() {
                    return request;
                }
            }
            // The timeout bounds the stall when a wakeup races the pop
            let _ = tokio::time::timeout(WORKER_IDLE_WAIT, self.queue_notify.notified()).await;
        }
    }

    async fn run_retraining(&self, request: RetrainingRequest) {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let samples = self.collect_training_data(&request.file_id);
        let result = if samples.len() < self.config.min_new_samples_for_retrain {
            RetrainingResult {
                file_id: request.file_id.clone(),
                success: false,
                new_accuracy: 0.0,
                sample_count: samples.len(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(format!(
                    "insufficient training data: {} samples, need {}",
                    samples.len(),
                    self.config.min_new_samples_for_retrain
                )),
            }
        } else {
            match self.store.train(&request.file_id, &samples) {
                Ok(()) => {
                    let new_accuracy = self
                        .store
                        .model_accuracy(&request.file_id)
                        .unwrap_or_default();
                    self.tracker.record_training_event(
                        &request.file_id,
                        now_ms(),
                        samples.len(),
                        new_accuracy,
                    );
                    RetrainingResult {
                        file_id: request.file_id.clone(),
                        success: true,
                        new_accuracy,
                        sample_count: samples.len(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: None,
                    }
                }
                Err(e) => RetrainingResult {
                    file_id: request.file_id.clone(),
                    success: false,
                    new_accuracy: 0.0,
                    sample_count: samples.len(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                },
            }
        };

        self.update_stats(&result);
        // Release the in-flight mark before anything else can observe the
        // result, success and failure alike
        self.queue.finish(&request.file_id);
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
        self.metrics.set_retrain_queue_depth(self.queue.len() as i64);
        if result.success {
            self.metrics.inc_retrainings_succeeded();
        } else {
            self.metrics.inc_retrainings_failed();
        }

        if result.success {
            info!(
                file_id = %result.file_id,
                accuracy = result.new_accuracy,
                samples = result.sample_count,
                duration_ms = result.duration_ms,
                reason = request.reason.as_str(),
                "Retraining completed"
            );
        } else {
            warn!(
                file_id = %result.file_id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Retraining failed"
            );
        }

        let _ = self.result_tx.send(result).await;
    }

    /// Gather training data: buffered observations are consumed once; the
    /// storage layer's data source tops them up when they fall short
    fn collect_training_data(&self, file_id: &str) -> Vec<(u64, u32)> {
        let mut samples: Vec<(u64, u32)> = {
            let mut observations = self.observations.lock();
            observations
                .remove(file_id)
                .map(|ring| ring.into_iter().collect())
                .unwrap_or_default()
        };

        if samples.len() < self.config.min_new_samples_for_retrain {
            let source = self.data_source.lock().clone();
            if let Some(source) = source {
                if let Some(pairs) = source.key_block_pairs(file_id) {
                    samples.extend(pairs);
                }
            }
        }

        samples
    }

    fn update_stats(&self, result: &RetrainingResult) {
        let mut stats = self.stats.lock();
        if result.success {
            stats.successful += 1;
        } else {
            stats.failed += 1;
        }
        stats.avg_duration_ms = DURATION_EMA_ALPHA * result.duration_ms as f64
            + (1.0 - DURATION_EMA_ALPHA) * stats.avg_duration_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, TrackerConfig};
    use crate::models::PredictionEvent;

    struct FixedDataSource {
        pairs: Vec<(u64, u32)>,
    }

    impl TrainingDataSource for FixedDataSource {
        fn key_block_pairs(&self, _file_id: &str) -> Option<Vec<(u64, u32)>> {
            Some(self.pairs.clone())
        }
    }

    fn two_block_samples() -> Vec<(u64, u32)> {
        (0..20u64).map(|i| (i * 100, (i / 10) as u32)).collect()
    }

    /// 10 blocks of 10 keys each; a near-exact linear fit
    fn staircase_samples() -> Vec<(u64, u32)> {
        (0..100u64).map(|i| (i * 100, (i / 10) as u32)).collect()
    }

    fn create_test_scheduler(
        config: SchedulerConfig,
    ) -> (
        Arc<RetrainingScheduler>,
        mpsc::Receiver<RetrainingResult>,
        Arc<LearnedIndexStore>,
        Arc<PerformanceTracker>,
    ) {
        let store = Arc::new(LearnedIndexStore::new(StoreConfig::default()));
        let tracker = Arc::new(PerformanceTracker::new(TrackerConfig {
            min_predictions_for_decision: 5,
            ..Default::default()
        }));
        let (scheduler, rx) =
            RetrainingScheduler::new(Arc::clone(&store), Arc::clone(&tracker), config);
        (Arc::new(scheduler), rx, store, tracker)
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            monitoring_interval_ms: 20,
            max_concurrent_retraining: 2,
            retraining_queue_size: 10,
            min_new_samples_for_retrain: 10,
            emergency_accuracy_threshold: 0.5,
            max_online_samples_per_file: 100,
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_accept_exactly_one() {
        let (scheduler, _rx, _store, _tracker) = create_test_scheduler(fast_config());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                scheduler.request_retraining("a.sst", RetrainReason::Manual)
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(scheduler.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_retraining_succeeds_and_clears_flag() {
        let (scheduler, mut rx, store, tracker) = create_test_scheduler(fast_config());
        scheduler.set_data_source(Arc::new(FixedDataSource {
            pairs: staircase_samples(),
        }));

        // Make the tracker want a retrain
        let now = now_ms();
        for _ in 0..10 {
            tracker.record_prediction(
                "a.sst",
                PredictionEvent {
                    key: 1,
                    predicted_block: 0,
                    actual_block: 1,
                    confidence: 0.9,
                    correct: false,
                    timestamp_ms: now,
                },
            );
        }
        assert!(tracker.compute_health_metrics("a.sst").needs_retraining);

        Arc::clone(&scheduler).start();
        assert!(scheduler.request_retraining("a.sst", RetrainReason::Manual));

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for retraining result")
            .expect("result channel closed");

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.file_id, "a.sst");
        assert_eq!(result.sample_count, 100);
        assert!(result.new_accuracy > 0.9);

        assert!(store.contains("a.sst"));
        let health = tracker.compute_health_metrics("a.sst");
        assert!(!health.needs_retraining);
        assert_eq!(health.retrain_count, 1);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_insufficient_data_reports_failure() {
        let (scheduler, mut rx, store, tracker) = create_test_scheduler(fast_config());

        Arc::clone(&scheduler).start();
        assert!(scheduler.request_retraining("a.sst", RetrainReason::Manual));

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");

        assert!(!result.success);
        assert!(result.error.unwrap().contains("insufficient"));
        assert!(!store.contains("a.sst"));
        // A failed retrain never bumps the retrain count
        assert_eq!(tracker.compute_health_metrics("a.sst").retrain_count, 0);

        // The in-flight mark was released, so the file can be requested again
        assert!(scheduler.request_retraining("a.sst", RetrainReason::Manual));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_triggers_automatic_retraining() {
        let (scheduler, mut rx, _store, tracker) = create_test_scheduler(fast_config());
        scheduler.set_data_source(Arc::new(FixedDataSource {
            pairs: staircase_samples(),
        }));

        let now = now_ms();
        for _ in 0..10 {
            tracker.record_prediction(
                "a.sst",
                PredictionEvent {
                    key: 1,
                    predicted_block: 0,
                    actual_block: 1,
                    confidence: 0.9,
                    correct: false,
                    timestamp_ms: now,
                },
            );
        }

        Arc::clone(&scheduler).start();

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("monitor never triggered a retrain")
            .expect("channel closed");
        assert!(result.success);

        let stats = scheduler.stats();
        assert!(stats.automatic_triggers >= 1);
        assert_eq!(stats.manual_triggers, 0);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_observations_feed_training() {
        let mut config = fast_config();
        config.min_new_samples_for_retrain = 20;
        let (scheduler, mut rx, store, _tracker) = create_test_scheduler(config);

        for (key, block) in two_block_samples() {
            scheduler.record_observation("a.sst", key, block);
        }

        Arc::clone(&scheduler).start();
        assert!(scheduler.request_retraining("a.sst", RetrainReason::Manual));

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.sample_count, 20);
        assert_eq!(store.predict("a.sst", 1450).unwrap().0, 1);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_observation_ring_is_bounded() {
        let mut config = fast_config();
        config.max_online_samples_per_file = 5;
        let (scheduler, _rx, _store, _tracker) = create_test_scheduler(config);

        for i in 0..20u64 {
            scheduler.record_observation("a.sst", i, 0);
        }

        let buffered = scheduler.collect_training_data("a.sst");
        assert_eq!(buffered.len(), 5);
        // The newest observations survive
        assert_eq!(buffered[0].0, 15);
    }

    #[tokio::test]
    async fn test_pause_holds_queue_until_resume() {
        let (scheduler, mut rx, _store, _tracker) = create_test_scheduler(fast_config());
        scheduler.set_data_source(Arc::new(FixedDataSource {
            pairs: two_block_samples(),
        }));

        Arc::clone(&scheduler).start();
        scheduler.pause();
        assert!(scheduler.request_retraining("a.sst", RetrainReason::Manual));

        // Paused: nothing completes
        let held = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(held.is_err());

        scheduler.resume();
        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out after resume")
            .expect("channel closed");
        assert!(result.success);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_tasks() {
        let (scheduler, _rx, _store, _tracker) = create_test_scheduler(fast_config());
        Arc::clone(&scheduler).start();
        assert!(scheduler.is_running());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.active_jobs(), 0);

        // Stopping twice is a no-op
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stats_track_outcomes() {
        let (scheduler, mut rx, _store, _tracker) = create_test_scheduler(fast_config());
        Arc::clone(&scheduler).start();

        // No data source and no observations: this job fails
        scheduler.request_retraining("a.sst", RetrainReason::Manual);
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;

        let stats = scheduler.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.manual_triggers, 1);

        scheduler.stop().await;
    }
}
