//! Job entity model for the background execution engine (PRD-21).
//!
//! A [`Job`] is either an execution instance (runs once through the
//! lifecycle) or, when `schedule` is set, a cron template that never runs
//! itself and instead spawns fresh instances on each trigger.

use serde::{Deserialize, Serialize};

use crate::status::JobStatus;
use crate::types::{new_job_id, JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobType
// ---------------------------------------------------------------------------

/// Closed set of handler kinds the engine dispatches to.
///
/// Exactly one handler may be registered per type; submission of a job whose
/// type has no registered handler is rejected synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Walk library paths and reconcile files with the media database.
    LibraryScan,
    /// Query external metadata providers for matches and enrichment.
    MetadataEnrichment,
    /// Generate preview thumbnails and sprite sheets.
    ThumbnailGeneration,
    /// Move/rename files according to the library's naming rules.
    FileOrganization,
    /// Import NFO sidecar files into the database.
    NfoImport,
    /// Orphan cleanup, integrity checks, and other periodic maintenance.
    DatabaseMaintenance,
}

impl JobType {
    /// Stable string form for database storage and event payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::LibraryScan => "library_scan",
            JobType::MetadataEnrichment => "metadata_enrichment",
            JobType::ThumbnailGeneration => "thumbnail_generation",
            JobType::FileOrganization => "file_organization",
            JobType::NfoImport => "nfo_import",
            JobType::DatabaseMaintenance => "database_maintenance",
        }
    }

    /// Parse the stored string form. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "library_scan" => Some(JobType::LibraryScan),
            "metadata_enrichment" => Some(JobType::MetadataEnrichment),
            "thumbnail_generation" => Some(JobType::ThumbnailGeneration),
            "file_organization" => Some(JobType::FileOrganization),
            "nfo_import" => Some(JobType::NfoImport),
            "database_maintenance" => Some(JobType::DatabaseMaintenance),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// JobPriority
// ---------------------------------------------------------------------------

/// Dispatch priority. Higher variants are dequeued first; within a priority
/// tier, jobs are dequeued in creation order (FIFO).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Stable string form for database storage.
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }

    /// Parse the stored string form. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(JobPriority::Low),
            "normal" => Some(JobPriority::Normal),
            "high" => Some(JobPriority::High),
            "critical" => Some(JobPriority::Critical),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of schedulable work.
///
/// Priority and type are immutable after creation; only the engine mutates
/// status and timestamps. `progress` is always within `[0.0, 1.0]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Completion fraction, clamped to `[0.0, 1.0]`.
    pub progress: f64,
    /// Human-readable label for the current processing step.
    pub current_step: Option<String>,
    pub processed_items: u64,
    pub total_items: u64,
    /// Structured result payload; set only on success (or, on failure,
    /// merged diagnostic detail such as process exit codes).
    pub result: Option<serde_json::Value>,
    /// Error message; set only on failure/timeout.
    pub error: Option<String>,
    /// Handler-specific parameters, opaque to the engine.
    pub metadata: serde_json::Value,
    /// Deadline for handler execution, in seconds. `None` = no deadline.
    pub timeout_secs: Option<u64>,
    /// Ids of jobs that must reach COMPLETED before this job may run.
    pub depends_on: Vec<JobId>,
    /// Workflow grouping only; no scheduling effect.
    pub parent_job_id: Option<JobId>,
    /// Cron expression. Presence makes this job a template that spawns
    /// execution instances instead of running itself.
    pub schedule: Option<String>,
    /// Next trigger time; only meaningful for templates.
    pub next_run_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Create a new pending job with only the required fields.
    ///
    /// Optional attributes are attached with the `with_*` builder methods.
    pub fn new(job_type: JobType, metadata: serde_json::Value) -> Self {
        Self {
            id: new_job_id(),
            job_type,
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            progress: 0.0,
            current_step: None,
            processed_items: 0,
            total_items: 0,
            result: None,
            error: None,
            metadata,
            timeout_secs: None,
            depends_on: Vec::new(),
            parent_job_id: None,
            schedule: None,
            next_run_at: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set an execution deadline in seconds.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Require the given jobs to complete before this one may run.
    pub fn with_depends_on(mut self, depends_on: Vec<JobId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Group this job under a parent for workflow display purposes.
    pub fn with_parent(mut self, parent_job_id: JobId) -> Self {
        self.parent_job_id = Some(parent_job_id);
        self
    }

    /// Attach a cron schedule, turning this job into a recurring template.
    pub fn with_schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule = Some(expression.into());
        self
    }

    /// Whether this job is a recurring template rather than an execution
    /// instance.
    pub fn is_template(&self) -> bool {
        self.schedule.is_some()
    }

    /// Set progress, clamping into `[0.0, 1.0]`.
    pub fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 1.0);
    }

    /// Build the execution instance for one trigger of a cron template.
    ///
    /// The instance gets a fresh id, copies type/metadata/priority/timeout,
    /// carries no schedule, and is grouped under the template via
    /// `parent_job_id`.
    pub fn instance_from_template(&self) -> Job {
        let mut instance =
            Job::new(self.job_type, self.metadata.clone()).with_priority(self.priority);
        instance.timeout_secs = self.timeout_secs;
        instance.parent_job_id = Some(self.id.clone());
        instance
    }

    /// Build the replacement job for a retry of a failed/timed-out/cancelled
    /// job. Copies type, priority, metadata, timeout, and dependencies; the
    /// original is never mutated or resurrected.
    pub fn retry_copy(&self) -> Job {
        let mut copy = Job::new(self.job_type, self.metadata.clone())
            .with_priority(self.priority)
            .with_depends_on(self.depends_on.clone());
        copy.timeout_secs = self.timeout_secs;
        copy
    }

    /// Execution duration in seconds, if both endpoints were recorded.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- construction ---------------------------------------------------------

    #[test]
    fn new_job_is_pending_normal_priority() {
        let job = Job::new(JobType::LibraryScan, serde_json::json!({"path": "/media"}));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.progress, 0.0);
        assert!(job.depends_on.is_empty());
        assert!(!job.is_template());
    }

    #[test]
    fn with_schedule_makes_template() {
        let job = Job::new(JobType::DatabaseMaintenance, serde_json::json!({}))
            .with_schedule("0 2 * * *");
        assert!(job.is_template());
    }

    #[test]
    fn fresh_jobs_get_distinct_ids() {
        let a = Job::new(JobType::LibraryScan, serde_json::json!({}));
        let b = Job::new(JobType::LibraryScan, serde_json::json!({}));
        assert_ne!(a.id, b.id);
    }

    // -- priority ordering ----------------------------------------------------

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    // -- progress clamping ----------------------------------------------------

    #[test]
    fn progress_clamps_to_unit_range() {
        let mut job = Job::new(JobType::ThumbnailGeneration, serde_json::json!({}));
        job.set_progress(1.7);
        assert_eq!(job.progress, 1.0);
        job.set_progress(-0.2);
        assert_eq!(job.progress, 0.0);
        job.set_progress(0.42);
        assert_eq!(job.progress, 0.42);
    }

    // -- template instances ---------------------------------------------------

    #[test]
    fn instance_from_template_copies_identity_fields() {
        let template = Job::new(
            JobType::DatabaseMaintenance,
            serde_json::json!({"vacuum": true}),
        )
        .with_priority(JobPriority::Low)
        .with_timeout(600)
        .with_schedule("*/15 * * * *");

        let instance = template.instance_from_template();
        assert_ne!(instance.id, template.id);
        assert_eq!(instance.job_type, template.job_type);
        assert_eq!(instance.priority, template.priority);
        assert_eq!(instance.metadata, template.metadata);
        assert_eq!(instance.timeout_secs, Some(600));
        assert!(instance.schedule.is_none());
        assert_eq!(instance.parent_job_id.as_deref(), Some(template.id.as_str()));
        assert_eq!(instance.status, JobStatus::Pending);
    }

    // -- retry copies ---------------------------------------------------------

    #[test]
    fn retry_copy_preserves_type_priority_metadata_and_deps() {
        let mut original = Job::new(
            JobType::MetadataEnrichment,
            serde_json::json!({"provider": "tpdb"}),
        )
        .with_priority(JobPriority::High)
        .with_timeout(30)
        .with_depends_on(vec!["dep-1".to_string()]);
        original.status = JobStatus::Failed;
        original.error = Some("provider unreachable".to_string());

        let copy = original.retry_copy();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.job_type, original.job_type);
        assert_eq!(copy.priority, original.priority);
        assert_eq!(copy.metadata, original.metadata);
        assert_eq!(copy.timeout_secs, Some(30));
        assert_eq!(copy.depends_on, original.depends_on);
        assert_eq!(copy.status, JobStatus::Pending);
        assert!(copy.error.is_none());
    }

    // -- duration -------------------------------------------------------------

    #[test]
    fn duration_requires_both_endpoints() {
        let mut job = Job::new(JobType::LibraryScan, serde_json::json!({}));
        assert!(job.duration_secs().is_none());
        let start = chrono::Utc::now();
        job.started_at = Some(start);
        assert!(job.duration_secs().is_none());
        job.completed_at = Some(start + chrono::Duration::milliseconds(2500));
        assert_eq!(job.duration_secs(), Some(2.5));
    }

    // -- string round-trips ---------------------------------------------------

    #[test]
    fn job_type_round_trip() {
        for jt in [
            JobType::LibraryScan,
            JobType::MetadataEnrichment,
            JobType::ThumbnailGeneration,
            JobType::FileOrganization,
            JobType::NfoImport,
            JobType::DatabaseMaintenance,
        ] {
            assert_eq!(JobType::parse(jt.as_str()), Some(jt));
        }
        assert_eq!(JobType::parse("transcode"), None);
    }

    #[test]
    fn priority_round_trip() {
        for p in [
            JobPriority::Low,
            JobPriority::Normal,
            JobPriority::High,
            JobPriority::Critical,
        ] {
            assert_eq!(JobPriority::parse(p.as_str()), Some(p));
        }
        assert_eq!(JobPriority::parse("urgent"), None);
    }
}
