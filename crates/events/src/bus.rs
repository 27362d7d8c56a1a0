//! In-process job event bus with per-job progress debouncing (PRD-23).
//!
//! Two delivery classes: lifecycle events (started/completed/failed/
//! cancelled/timeout) are forwarded to the sink synchronously; progress
//! events are buffered per job and flushed once per quiet window. Before a
//! terminal event goes out, any buffered progress for that job is flushed
//! first so clients never see a terminal event followed by a stale progress
//! event.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use mediakeep_core::job_events::MSG_TYPE_JOB_PROGRESS;
use mediakeep_core::types::JobId;

use crate::progress::{ProgressUpdate, DEBOUNCE_INTERVAL};

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// The canonical event envelope delivered to the broadcast sink.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    /// One of the `MSG_TYPE_JOB_*` constants.
    pub event_type: String,
    /// When the event was created (UTC, ISO-8601 on the wire).
    pub timestamp: DateTime<Utc>,
    /// Event-specific data.
    pub payload: serde_json::Value,
}

impl JobEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Pluggable broadcast sink. The API process installs a closure that fans
/// events out to connected WebSocket clients.
pub type BroadcastFn = Arc<dyn Fn(&JobEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// JobEventBus
// ---------------------------------------------------------------------------

struct Inner {
    sink: RwLock<Option<BroadcastFn>>,
    /// Per-job coalescing buffers. Guarded by its own lock, independent of
    /// the engine's registry lock. Presence of an entry means a flush timer
    /// is already armed for that job.
    pending: Mutex<HashMap<JobId, ProgressUpdate>>,
    debounce: Duration,
}

/// Event bus shared between the engine's loops.
///
/// Cheap to clone; all clones share the same sink and pending buffers.
#[derive(Clone)]
pub struct JobEventBus {
    inner: Arc<Inner>,
}

impl JobEventBus {
    pub fn new() -> Self {
        Self::with_debounce(DEBOUNCE_INTERVAL)
    }

    /// Create a bus with a specific debounce window (tests shorten it).
    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                debounce,
            }),
        }
    }

    /// Install the broadcast sink. Replaces any previous sink.
    pub fn set_broadcast_fn(&self, f: BroadcastFn) {
        *self.inner.sink.write().expect("sink lock poisoned") = Some(f);
    }

    /// Forward a non-terminal lifecycle event to the sink immediately.
    pub fn publish_lifecycle(&self, event_type: &str, payload: serde_json::Value) {
        self.inner.send(JobEvent::new(event_type, payload));
    }

    /// Forward a terminal lifecycle event, force-flushing any buffered
    /// progress for the job first so the progress event is never delivered
    /// after the terminal one.
    pub fn publish_terminal(&self, event_type: &str, job_id: &JobId, payload: serde_json::Value) {
        self.inner.flush_job(job_id);
        self.inner.send(JobEvent::new(event_type, payload));
    }

    /// Buffer a progress update for debounced delivery.
    ///
    /// The first update for a job arms a flush timer; later updates within
    /// the window overwrite the buffer in place without re-arming it, so
    /// the flushed event carries the latest values.
    pub fn publish_progress(&self, update: ProgressUpdate) {
        let job_id = update.job_id.clone();
        let armed = {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            match pending.entry(job_id.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.insert(update);
                    true
                }
                Entry::Vacant(entry) => {
                    entry.insert(update);
                    false
                }
            }
        };

        if !armed {
            let inner = Arc::clone(&self.inner);
            let debounce = self.inner.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                inner.flush_job(&job_id);
            });
        }
    }

    /// Number of jobs with buffered progress, for test assertions.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending lock poisoned").len()
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    /// Flush the buffered progress for one job, if any. Removal happens
    /// before delivery, so a timer firing after a terminal force-flush
    /// finds nothing and is a no-op.
    fn flush_job(&self, job_id: &JobId) {
        let update = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(job_id);
        if let Some(update) = update {
            let payload = match serde_json::to_value(&update) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to serialize progress update");
                    return;
                }
            };
            self.send(JobEvent::new(MSG_TYPE_JOB_PROGRESS, payload));
        }
    }

    /// Deliver an event to the sink, if one is installed.
    ///
    /// Sink panics are caught and logged so a faulty subscriber cannot take
    /// down a worker or a flush timer.
    fn send(&self, event: JobEvent) {
        let sink = self.sink.read().expect("sink lock poisoned");
        if let Some(f) = sink.as_ref() {
            let event_type = event.event_type.clone();
            if catch_unwind(AssertUnwindSafe(|| f(&event))).is_err() {
                tracing::error!(event_type = %event_type, "Broadcast sink panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediakeep_core::job_events::{MSG_TYPE_JOB_COMPLETED, MSG_TYPE_JOB_STARTED};
    use mediakeep_core::JobType;

    fn recording_bus() -> (JobEventBus, Arc<Mutex<Vec<JobEvent>>>) {
        let bus = JobEventBus::new();
        let events: Arc<Mutex<Vec<JobEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        bus.set_broadcast_fn(Arc::new(move |event| {
            sink_events.lock().unwrap().push(event.clone());
        }));
        (bus, events)
    }

    #[tokio::test]
    async fn lifecycle_events_forward_immediately() {
        let (bus, events) = recording_bus();
        bus.publish_lifecycle(
            MSG_TYPE_JOB_STARTED,
            serde_json::json!({"job_id": "j1", "job_type": "library_scan"}),
        );

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, MSG_TYPE_JOB_STARTED);
        assert_eq!(events[0].payload["job_id"], "j1");
    }

    #[tokio::test]
    async fn publish_with_no_sink_does_not_panic() {
        let bus = JobEventBus::new();
        bus.publish_lifecycle(MSG_TYPE_JOB_STARTED, serde_json::json!({}));
        bus.publish_progress(ProgressUpdate::new("j1".into(), JobType::LibraryScan, 0.1));
    }

    #[tokio::test]
    async fn terminal_event_flushes_buffered_progress_first() {
        let (bus, events) = recording_bus();
        bus.publish_progress(
            ProgressUpdate::new("j1".into(), JobType::LibraryScan, 0.9).with_items(9, 10),
        );

        bus.publish_terminal(
            MSG_TYPE_JOB_COMPLETED,
            &"j1".to_string(),
            serde_json::json!({"job_id": "j1"}),
        );

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, MSG_TYPE_JOB_PROGRESS);
        assert_eq!(events[0].payload["progress"], 0.9);
        assert_eq!(events[1].event_type, MSG_TYPE_JOB_COMPLETED);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn sink_panic_is_contained() {
        let bus = JobEventBus::new();
        bus.set_broadcast_fn(Arc::new(|_| panic!("subscriber bug")));
        // Must not propagate.
        bus.publish_lifecycle(MSG_TYPE_JOB_STARTED, serde_json::json!({}));
    }
}
