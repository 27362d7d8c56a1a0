//! Concurrency-safe priority ready-queue (PRD-21).
//!
//! Jobs eligible to run immediately sit here between submission and worker
//! pickup. Dequeue order is priority descending, then creation time
//! ascending (FIFO within a tier), with a monotonic sequence number as the
//! final tie-break so ordering is total.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use mediakeep_core::Job;

// ---------------------------------------------------------------------------
// Heap entry
// ---------------------------------------------------------------------------

/// Heap entry wrapping a job with its dequeue key.
struct QueuedJob {
    job: Job,
    /// Insertion sequence; breaks ties between jobs created in the same
    /// instant.
    seq: u64,
}

impl QueuedJob {
    /// `BinaryHeap` is a max-heap: "greater" means dequeued first.
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.job.created_at.cmp(&self.job.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_cmp(other)
    }
}

// ---------------------------------------------------------------------------
// ReadyQueue
// ---------------------------------------------------------------------------

/// Blocking priority queue safe for many producers and many consumers.
///
/// `pop` removes the single highest-priority, earliest-created job
/// atomically, so no two workers can receive the same entry.
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    seq: AtomicU64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Insert a job. O(log n).
    pub fn push(&self, job: Job) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap
            .lock()
            .expect("queue lock poisoned")
            .push(QueuedJob { job, seq });
        self.notify.notify_one();
    }

    /// Remove and return the best ready job, waiting up to `timeout` for
    /// one to arrive. Returns `None` on timeout so callers can observe
    /// shutdown between attempts.
    pub async fn pop(&self, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before checking the heap, so a push
            // between check and wait is not lost.
            let notified = self.notify.notified();

            if let Some(entry) = self.heap.lock().expect("queue lock poisoned").pop() {
                return Some(entry.job);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Approximate current queue depth (informational only).
    pub fn len(&self) -> usize {
        self.heap.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}
