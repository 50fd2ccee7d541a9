//! Per-file model cache and lookup path
//!
//! Owns a capacity-bounded cache of trained models keyed by SST file,
//! serves predictions with confidence-gated fallback accounting, and
//! keeps per-file query counters. Mutation (train, eviction, removal)
//! is serialized behind the cache write lock; predictions share the
//! read lock and bump per-entry atomics.

use crate::config::StoreConfig;
use crate::error::{RecordError, TrainError};
use crate::model::{LinearModel, ModelMetadata, ModelRecord};
use crate::models::{now_ms, FileId, IndexStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct CacheEntry {
    model: LinearModel,
    inserted_at_ms: u64,
    last_access_ms: AtomicU64,
    access_seq: AtomicU64,
    access_count: AtomicU64,
}

#[derive(Default)]
struct FileCounters {
    total_queries: AtomicU64,
    successful_predictions: AtomicU64,
    fallback_queries: AtomicU64,
}

impl FileCounters {
    fn snapshot(&self) -> IndexStats {
        IndexStats {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            successful_predictions: self.successful_predictions.load(Ordering::Relaxed),
            fallback_queries: self.fallback_queries.load(Ordering::Relaxed),
        }
    }
}

/// Capacity-bounded cache of trained models with per-file statistics
pub struct LearnedIndexStore {
    config: StoreConfig,
    entries: RwLock<HashMap<FileId, Arc<CacheEntry>>>,
    counters: RwLock<HashMap<FileId, Arc<FileCounters>>>,
    access_counter: AtomicU64,
}

impl LearnedIndexStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            access_counter: AtomicU64::new(0),
        }
    }

    /// Train a model for `file_id` and install it in the cache
    ///
    /// On success the previous entry is discarded wholesale and the file's
    /// counters restart from zero; on failure both are left untouched.
    /// Inserting a new file at capacity evicts the least recently used
    /// entry first, so the cache never exceeds its configured bound.
    pub fn train(&self, file_id: &str, samples: &[(u64, u32)]) -> Result<(), TrainError> {
        let model = LinearModel::train(samples)?;
        let accuracy = model.training_accuracy();

        {
            let mut entries = self.entries.write();
            if !entries.contains_key(file_id) && entries.len() >= self.config.max_cache_size {
                self.evict_lru(&mut entries);
            }
            entries.insert(file_id.to_string(), Arc::new(self.new_entry(model)));
        }
        self.reset_counters(file_id);

        info!(
            file_id = %file_id,
            samples = samples.len(),
            accuracy = accuracy,
            "Trained learned index model"
        );
        Ok(())
    }

    /// Predict the block for `key`, with the model's confidence
    ///
    /// A cache miss returns `None` and counts as a fallback query. A hit
    /// always returns the prediction; when the confidence is below the
    /// configured threshold the query is counted as a fallback rather
    /// than a successful prediction, but the fallback policy itself
    /// belongs to the caller.
    pub fn predict(&self, file_id: &str, key: u64) -> Option<(u32, f64)> {
        let counters = self.counters_for(file_id);
        counters.total_queries.fetch_add(1, Ordering::Relaxed);

        let entry = match self.entries.read().get(file_id) {
            Some(entry) => Arc::clone(entry),
            None => {
                counters.fallback_queries.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let seq = self.access_counter.fetch_add(1, Ordering::Relaxed) + 1;
        entry.access_seq.store(seq, Ordering::Relaxed);
        entry.last_access_ms.store(now_ms(), Ordering::Relaxed);
        entry.access_count.fetch_add(1, Ordering::Relaxed);

        let block = entry.model.predict(key);
        let confidence = entry.model.confidence(key);

        if confidence >= self.config.confidence_threshold {
            counters
                .successful_predictions
                .fetch_add(1, Ordering::Relaxed);
        } else {
            counters.fallback_queries.fetch_add(1, Ordering::Relaxed);
        }

        Some((block, confidence))
    }

    /// Confidence the cached model reports for `key`, without touching
    /// the query counters
    pub fn prediction_confidence(&self, file_id: &str, key: u64) -> Option<f64> {
        let entries = self.entries.read();
        entries.get(file_id).map(|entry| entry.model.confidence(key))
    }

    /// Training accuracy of the cached model, if any
    pub fn model_accuracy(&self, file_id: &str) -> Option<f64> {
        let entries = self.entries.read();
        entries
            .get(file_id)
            .map(|entry| entry.model.training_accuracy())
    }

    /// Snapshot of the per-file query counters
    pub fn stats(&self, file_id: &str) -> IndexStats {
        let counters = self.counters.read();
        counters
            .get(file_id)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    /// Drop one file's model and counters
    pub fn remove_from_cache(&self, file_id: &str) {
        self.entries.write().remove(file_id);
        self.counters.write().remove(file_id);
    }

    /// Drop every model and all counters
    pub fn clear_cache(&self) {
        self.entries.write().clear();
        self.counters.write().clear();
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.entries.read().contains_key(file_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn cached_files(&self) -> Vec<FileId> {
        self.entries.read().keys().cloned().collect()
    }

    /// Encode the cached model for persistence
    pub fn save_model(&self, file_id: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read();
        let entry = entries.get(file_id)?;

        let record = ModelRecord::new(
            entry.model.parameters(),
            ModelMetadata {
                training_samples: entry.model.training_samples() as u64,
                training_accuracy: entry.model.training_accuracy(),
                validation_accuracy: entry.model.training_accuracy(),
                trained_at_ms: entry.inserted_at_ms,
            },
        );
        record.to_bytes().ok()
    }

    /// Install a model from its persisted record
    ///
    /// A record failing checksum verification loads nothing, leaving the
    /// file a cache miss that forces a retrain from source data.
    pub fn load_model(&self, file_id: &str, bytes: &[u8]) -> Result<(), RecordError> {
        let record = ModelRecord::from_bytes(bytes).map_err(|e| {
            warn!(file_id = %file_id, error = %e, "Rejected persisted model record");
            e
        })?;

        let model = LinearModel::from_parameters(
            &record.parameters,
            record.metadata.training_accuracy,
            record.metadata.training_samples as usize,
        )
        .ok_or_else(|| {
            RecordError::Malformed(format!(
                "expected 2 parameters, record has {}",
                record.parameters.len()
            ))
        })?;

        {
            let mut entries = self.entries.write();
            if !entries.contains_key(file_id) && entries.len() >= self.config.max_cache_size {
                self.evict_lru(&mut entries);
            }
            entries.insert(file_id.to_string(), Arc::new(self.new_entry(model)));
        }
        self.reset_counters(file_id);

        debug!(file_id = %file_id, "Loaded learned index model from record");
        Ok(())
    }

    fn new_entry(&self, model: LinearModel) -> CacheEntry {
        let seq = self.access_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let now = now_ms();
        CacheEntry {
            model,
            inserted_at_ms: now,
            last_access_ms: AtomicU64::new(now),
            access_seq: AtomicU64::new(seq),
            access_count: AtomicU64::new(0),
        }
    }

    /// Evict the least recently used entry; ties resolve to the earliest
    /// inserted because the access sequence is assigned at insertion
    fn evict_lru(&self, entries: &mut HashMap<FileId, Arc<CacheEntry>>) {
        let lru = entries
            .iter()
            .min_by_key(|(_, entry)| entry.access_seq.load(Ordering::Relaxed))
            .map(|(file_id, _)| file_id.clone());

        if let Some(file_id) = lru {
            entries.remove(&file_id);
            debug!(file_id = %file_id, "Evicted least recently used model");
        }
    }

    fn reset_counters(&self, file_id: &str) {
        self.counters
            .write()
            .insert(file_id.to_string(), Arc::new(FileCounters::default()));
    }

    fn counters_for(&self, file_id: &str) -> Arc<FileCounters> {
        if let Some(counters) = self.counters.read().get(file_id) {
            return Arc::clone(counters);
        }
        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry(file_id.to_string())
                .or_insert_with(|| Arc::new(FileCounters::default())),
        )
    }
}
