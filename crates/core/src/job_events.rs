//! Event type constants for background job broadcasts (PRD-23).
//!
//! Used by the event bus when building `JobEvent` envelopes delivered to
//! the broadcast sink (WebSocket clients in the API process).

/// Job was dequeued and handler execution began.
pub const MSG_TYPE_JOB_STARTED: &str = "job_started";

/// Progress update during job execution (debounced).
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Job completed successfully.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Job failed with an error.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";

/// Job was cancelled (by user or system).
pub const MSG_TYPE_JOB_CANCELLED: &str = "job_cancelled";

/// Job exceeded its execution deadline.
pub const MSG_TYPE_JOB_TIMEOUT: &str = "job_timeout";
