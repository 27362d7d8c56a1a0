//! Job metrics collection and failure alerting (PRD-24).
//!
//! The collector is a pure aggregator with no control-flow authority: the
//! engine reports completions, failures, and cancellations; callers pull
//! point-in-time snapshots via [`MetricsCollector::calculate`]. Failure
//! alert subscribers are notified once per failure; subscriber panics are
//! caught and logged, never propagated.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use mediakeep_core::types::{JobId, Timestamp};
use mediakeep_core::{Job, JobStatus, JobType};

// ---------------------------------------------------------------------------
// FailedJobAlert
// ---------------------------------------------------------------------------

/// Immutable snapshot created at failure time and delivered to every
/// registered failure subscriber. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJobAlert {
    pub job_id: JobId,
    pub job_type: JobType,
    pub error: String,
    pub failed_at: Timestamp,
    /// Execution duration in seconds, when both endpoints were recorded.
    pub duration_secs: Option<f64>,
    /// The job's original metadata, for subscriber-side diagnosis.
    pub metadata: serde_json::Value,
}

/// Failure alert subscriber callback.
pub type AlertFn = Arc<dyn Fn(&FailedJobAlert) + Send + Sync>;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Aggregate metrics snapshot across all job types.
#[derive(Debug, Clone, Serialize)]
pub struct JobMetrics {
    pub total_jobs: u64,
    pub pending: u64,
    pub waiting: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Approximate ready-queue depth at snapshot time.
    pub queue_size: usize,
    /// completed / (completed + failed + timed_out); `None` until at least
    /// one job has finished.
    pub success_rate: Option<f64>,
    pub average_duration_secs: Option<f64>,
    /// Age in seconds of the oldest job still PENDING.
    pub oldest_pending_age_secs: Option<f64>,
    pub last_completion_at: Option<Timestamp>,
    pub last_failure_at: Option<Timestamp>,
    /// Per-type breakdowns, keyed by the job type's stable string form.
    pub by_type: HashMap<String, JobTypeMetrics>,
}

/// Per-type metrics, mirroring the aggregate shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobTypeMetrics {
    pub pending: u64,
    pub waiting: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub success_rate: Option<f64>,
    pub average_duration_secs: Option<f64>,
    pub last_completion_at: Option<Timestamp>,
    pub last_failure_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Historical counters for one job type.
#[derive(Debug, Default, Clone)]
struct TypeCounters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    /// Sum of measured durations for completed jobs, in seconds.
    total_duration_secs: f64,
    /// How many completed jobs had a measurable duration.
    measured_completions: u64,
    last_completion_at: Option<Timestamp>,
    last_failure_at: Option<Timestamp>,
}

/// Accumulates completion/failure counters and fans out failure alerts.
///
/// Thread-safe via interior mutexes; designed to be wrapped in `Arc` and
/// shared between the engine's worker pool and the query API.
#[derive(Default)]
pub struct MetricsCollector {
    counters: Mutex<HashMap<JobType, TypeCounters>>,
    subscribers: Mutex<Vec<AlertFn>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a failure alert subscriber.
    pub fn on_job_failed(&self, subscriber: AlertFn) {
        self.subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .push(subscriber);
    }

    /// Record a successful completion.
    pub fn record_completion(&self, job: &Job) {
        let mut counters = self.counters.lock().expect("counters lock poisoned");
        let entry = counters.entry(job.job_type).or_default();
        entry.completed += 1;
        entry.last_completion_at = job.completed_at.or_else(|| Some(chrono::Utc::now()));
        if let Some(duration) = job.duration_secs() {
            entry.total_duration_secs += duration;
            entry.measured_completions += 1;
        }
    }

    /// Record a failure (or timeout, which counts as a failure), build the
    /// alert, and notify every subscriber.
    pub fn record_failure(&self, job: &Job, timed_out: bool) {
        {
            let mut counters = self.counters.lock().expect("counters lock poisoned");
            let entry = counters.entry(job.job_type).or_default();
            if timed_out {
                entry.timed_out += 1;
            } else {
                entry.failed += 1;
            }
            entry.last_failure_at = job.completed_at.or_else(|| Some(chrono::Utc::now()));
        }

        let alert = FailedJobAlert {
            job_id: job.id.clone(),
            job_type: job.job_type,
            error: job
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            failed_at: job.completed_at.unwrap_or_else(chrono::Utc::now),
            duration_secs: job.duration_secs(),
            metadata: job.metadata.clone(),
        };

        let subscribers = self
            .subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .clone();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&alert))).is_err() {
                tracing::error!(job_id = %alert.job_id, "Failure alert subscriber panicked");
            }
        }
    }

    /// Record a deliberate cancellation. Not counted as a failure.
    pub fn record_cancellation(&self, job: &Job) {
        let mut counters = self.counters.lock().expect("counters lock poisoned");
        counters.entry(job.job_type).or_default().cancelled += 1;
    }

    /// Build a point-in-time snapshot from the live registry plus the
    /// accumulated historical counters.
    ///
    /// `jobs` is the engine's registry snapshot (live jobs and templates);
    /// terminal counts come from the collector's own history because
    /// terminal jobs are evicted from the registry.
    pub fn calculate(&self, jobs: &[Job], queue_size: usize) -> JobMetrics {
        let now = chrono::Utc::now();
        let counters = self.counters.lock().expect("counters lock poisoned");

        let mut by_type: HashMap<String, JobTypeMetrics> = HashMap::new();
        for (job_type, history) in counters.iter() {
            by_type.insert(
                job_type.as_str().to_string(),
                JobTypeMetrics {
                    completed: history.completed,
                    failed: history.failed,
                    cancelled: history.cancelled,
                    timed_out: history.timed_out,
                    success_rate: success_rate(history.completed, history.failed, history.timed_out),
                    average_duration_secs: average_duration(
                        history.total_duration_secs,
                        history.measured_completions,
                    ),
                    last_completion_at: history.last_completion_at,
                    last_failure_at: history.last_failure_at,
                    ..Default::default()
                },
            );
        }

        let mut pending = 0u64;
        let mut waiting = 0u64;
        let mut running = 0u64;
        let mut oldest_pending_age_secs: Option<f64> = None;

        for job in jobs {
            let type_entry = by_type.entry(job.job_type.as_str().to_string()).or_default();
            match job.status {
                JobStatus::Pending => {
                    pending += 1;
                    type_entry.pending += 1;
                    let age = (now - job.created_at).num_milliseconds() as f64 / 1000.0;
                    if oldest_pending_age_secs.map_or(true, |oldest| age > oldest) {
                        oldest_pending_age_secs = Some(age);
                    }
                }
                JobStatus::Waiting => {
                    waiting += 1;
                    type_entry.waiting += 1;
                }
                JobStatus::Running => {
                    running += 1;
                    type_entry.running += 1;
                }
                // Terminal jobs are evicted from the registry; anything
                // terminal still passing through here is already counted in
                // the historical counters.
                _ => {}
            }
        }

        let completed: u64 = counters.values().map(|c| c.completed).sum();
        let failed: u64 = counters.values().map(|c| c.failed).sum();
        let cancelled: u64 = counters.values().map(|c| c.cancelled).sum();
        let timed_out: u64 = counters.values().map(|c| c.timed_out).sum();
        let total_duration: f64 = counters.values().map(|c| c.total_duration_secs).sum();
        let measured: u64 = counters.values().map(|c| c.measured_completions).sum();

        JobMetrics {
            total_jobs: pending + waiting + running + completed + failed + cancelled + timed_out,
            pending,
            waiting,
            running,
            completed,
            failed,
            cancelled,
            timed_out,
            queue_size,
            success_rate: success_rate(completed, failed, timed_out),
            average_duration_secs: average_duration(total_duration, measured),
            oldest_pending_age_secs,
            last_completion_at: counters.values().filter_map(|c| c.last_completion_at).max(),
            last_failure_at: counters.values().filter_map(|c| c.last_failure_at).max(),
            by_type,
        }
    }
}

fn success_rate(completed: u64, failed: u64, timed_out: u64) -> Option<f64> {
    let finished = completed + failed + timed_out;
    if finished == 0 {
        None
    } else {
        Some(completed as f64 / finished as f64)
    }
}

fn average_duration(total_secs: f64, measured: u64) -> Option<f64> {
    if measured == 0 {
        None
    } else {
        Some(total_secs / measured as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn finished_job(job_type: JobType, duration_secs: i64) -> Job {
        let mut job = Job::new(job_type, serde_json::json!({}));
        let start = chrono::Utc::now() - chrono::Duration::seconds(duration_secs);
        job.started_at = Some(start);
        job.completed_at = Some(start + chrono::Duration::seconds(duration_secs));
        job
    }

    // -- counters -------------------------------------------------------------

    #[test]
    fn completion_and_failure_counts_feed_success_rate() {
        let collector = MetricsCollector::new();
        collector.record_completion(&finished_job(JobType::LibraryScan, 10));
        collector.record_completion(&finished_job(JobType::LibraryScan, 20));
        let mut failed = finished_job(JobType::LibraryScan, 5);
        failed.error = Some("boom".into());
        collector.record_failure(&failed, false);

        let metrics = collector.calculate(&[], 0);
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.success_rate, Some(2.0 / 3.0));
        assert_eq!(metrics.average_duration_secs, Some(15.0));
    }

    #[test]
    fn timeout_counts_as_failure_for_success_rate() {
        let collector = MetricsCollector::new();
        collector.record_completion(&finished_job(JobType::NfoImport, 1));
        let mut timed_out = finished_job(JobType::NfoImport, 60);
        timed_out.error = Some("timed out".into());
        collector.record_failure(&timed_out, true);

        let metrics = collector.calculate(&[], 0);
        assert_eq!(metrics.timed_out, 1);
        assert_eq!(metrics.failed, 0);
        assert_eq!(metrics.success_rate, Some(0.5));
    }

    #[test]
    fn empty_collector_has_no_rates() {
        let collector = MetricsCollector::new();
        let metrics = collector.calculate(&[], 0);
        assert_eq!(metrics.total_jobs, 0);
        assert!(metrics.success_rate.is_none());
        assert!(metrics.average_duration_secs.is_none());
        assert!(metrics.oldest_pending_age_secs.is_none());
    }

    // -- live registry counts -------------------------------------------------

    #[test]
    fn registry_snapshot_feeds_live_counts_and_pending_age() {
        let collector = MetricsCollector::new();
        let mut old_pending = Job::new(JobType::LibraryScan, serde_json::json!({}));
        old_pending.created_at = chrono::Utc::now() - chrono::Duration::seconds(120);
        let fresh_pending = Job::new(JobType::NfoImport, serde_json::json!({}));
        let mut running = Job::new(JobType::ThumbnailGeneration, serde_json::json!({}));
        running.status = JobStatus::Running;
        let mut waiting = Job::new(JobType::FileOrganization, serde_json::json!({}));
        waiting.status = JobStatus::Waiting;

        let metrics =
            collector.calculate(&[old_pending, fresh_pending, running, waiting], 2);
        assert_eq!(metrics.pending, 2);
        assert_eq!(metrics.running, 1);
        assert_eq!(metrics.waiting, 1);
        assert_eq!(metrics.queue_size, 2);
        let age = metrics.oldest_pending_age_secs.unwrap();
        assert!(age >= 119.0, "oldest pending age was {age}");
    }

    #[test]
    fn per_type_breakdown_mirrors_aggregate_shape() {
        let collector = MetricsCollector::new();
        collector.record_completion(&finished_job(JobType::LibraryScan, 10));
        let mut failed = finished_job(JobType::ThumbnailGeneration, 2);
        failed.error = Some("no gpu".into());
        collector.record_failure(&failed, false);

        let metrics = collector.calculate(&[], 0);
        let scan = &metrics.by_type["library_scan"];
        assert_eq!(scan.completed, 1);
        assert_eq!(scan.success_rate, Some(1.0));
        let thumbs = &metrics.by_type["thumbnail_generation"];
        assert_eq!(thumbs.failed, 1);
        assert_eq!(thumbs.success_rate, Some(0.0));
    }

    // -- alert subscribers ----------------------------------------------------

    #[test]
    fn every_subscriber_receives_one_alert_per_failure() {
        let collector = MetricsCollector::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            collector.on_job_failed(Arc::new(move |alert| {
                assert_eq!(alert.error, "disk full");
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let mut failed = finished_job(JobType::FileOrganization, 3);
        failed.error = Some("disk full".into());
        collector.record_failure(&failed, false);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let collector = MetricsCollector::new();
        let calls = Arc::new(AtomicUsize::new(0));
        collector.on_job_failed(Arc::new(|_| panic!("subscriber bug")));
        let counter = Arc::clone(&calls);
        collector.on_job_failed(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut failed = finished_job(JobType::LibraryScan, 1);
        failed.error = Some("boom".into());
        collector.record_failure(&failed, false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        let collector = MetricsCollector::new();
        collector.record_completion(&finished_job(JobType::LibraryScan, 1));
        collector.record_cancellation(&Job::new(JobType::LibraryScan, serde_json::json!({})));

        let metrics = collector.calculate(&[], 0);
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(metrics.success_rate, Some(1.0));
    }
}
