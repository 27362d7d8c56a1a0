//! The persistence contract the engine schedules against (PRD-20).
//!
//! The engine treats every store call as best-effort: failures are logged
//! and swallowed by the caller, and the in-memory registry stays the source
//! of truth for scheduling decisions within a process lifetime. The store is
//! the durable record consulted at startup recovery and for queries that
//! miss the registry.

use async_trait::async_trait;

use mediakeep_core::types::{JobId, Timestamp};
use mediakeep_core::{Job, JobStatus};

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row for job {id}: {detail}")]
    Corrupt { id: JobId, detail: String },

    #[error("job not found: {0}")]
    NotFound(JobId),
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Durable record of jobs across process restarts.
///
/// Implementations must be safe to call concurrently from the engine's
/// worker pool and scheduler loop.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly created job (execution instance or template).
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Record a status transition, with optional error message and result
    /// payload. Also stamps `started_at`/`completed_at` as appropriate.
    async fn update_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Record in-flight progress for a running job.
    async fn update_progress(
        &self,
        id: &JobId,
        progress: f64,
        current_step: Option<&str>,
        processed_items: u64,
        total_items: u64,
    ) -> Result<(), StoreError>;

    /// Re-arm a cron template's next trigger time.
    async fn update_next_run(
        &self,
        id: &JobId,
        next_run_at: Option<Timestamp>,
    ) -> Result<(), StoreError>;

    /// Fetch a single job by id.
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// All jobs persisted as RUNNING. Consulted only during startup
    /// recovery; a RUNNING row found at startup can never be trusted.
    async fn get_running_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// All jobs persisted as PENDING or WAITING, templates included.
    async fn get_pending_jobs(&self) -> Result<Vec<Job>, StoreError>;
}
