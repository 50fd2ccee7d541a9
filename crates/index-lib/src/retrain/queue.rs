//! Retrain request queue with in-flight deduplication
//!
//! The priority heap and the in-flight set live under one lock so that
//! the reject-if-in-flight check and the enqueue are atomic: a file is
//! marked in-flight from the moment its request is accepted until the
//! worker finishes with it, and a second request in that span is
//! rejected.

use crate::models::{FileId, RetrainingRequest};
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashSet};

/// Why an enqueue attempt was rejected, if it was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    Accepted,
    QueueFull,
    AlreadyInFlight,
}

struct QueueInner {
    heap: BinaryHeap<RetrainingRequest>,
    in_flight: HashSet<FileId>,
}

pub(crate) struct RetrainQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
}

impl RetrainQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                in_flight: HashSet::new(),
            }),
        }
    }

    /// Try to accept a request; `bypass_capacity` is the emergency valve
    /// and skips only the queue-full check, never the in-flight dedup
    pub(crate) fn try_enqueue(
        &self,
        request: RetrainingRequest,
        bypass_capacity: bool,
    ) -> EnqueueOutcome {
        let mut inner = self.inner.lock();

        if inner.in_flight.contains(&request.file_id) {
            return EnqueueOutcome::AlreadyInFlight;
        }
        if !bypass_capacity && inner.heap.len() >= self.capacity {
            return EnqueueOutcome::QueueFull;
        }

        inner.in_flight.insert(request.file_id.clone());
        inner.heap.push(request);
        EnqueueOutcome::Accepted
    }

    /// Hand out the highest-priority queued request
    pub(crate) fn pop(&self) -> Option<RetrainingRequest> {
        self.inner.lock().heap.pop()
    }

    /// Release the in-flight mark for `file_id`
    ///
    /// Called after the worker reports its result, on success and failure
    /// alike.
    pub(crate) fn finish(&self, file_id: &str) {
        self.inner.lock().in_flight.remove(file_id);
    }

    /// Number of queued (not yet popped) requests
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }
}
