//! Engine error taxonomy (PRD-21).
//!
//! Only submission-time validation surfaces as an error to callers;
//! execution failures travel through `Job.error`, events, and failure
//! alerts instead (persistence failures are logged and swallowed).

use mediakeep_core::types::JobId;
use mediakeep_core::{JobStatus, JobType};
use mediakeep_db::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no handler registered for job type '{}'", .0.as_str())]
    NoHandlerRegistered(JobType),

    #[error("invalid cron schedule: {0}")]
    InvalidSchedule(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {id} is {} and cannot be retried", status.as_str())]
    NotRetryable { id: JobId, status: JobStatus },

    #[error("engine is already running")]
    AlreadyStarted,

    #[error(transparent)]
    Store(#[from] StoreError),
}
