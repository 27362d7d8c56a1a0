//! Job handler contract (PRD-21).
//!
//! Exactly one handler is registered per [`JobType`]; the engine validates
//! this at submission time, so a job never enters the queue without a
//! handler to run it. Handlers receive a [`JobContext`] for progress
//! reporting and cooperative cancellation checks, and return an optional
//! result payload.
//!
//! [`JobType`]: mediakeep_core::JobType

use std::sync::Arc;

use futures::future::BoxFuture;

use mediakeep_core::types::JobId;
use mediakeep_core::Job;

use crate::engine::EngineCore;

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Failure raised by a job handler.
///
/// The engine records the display form as `Job.error`; structured detail
/// (exit codes, captured stderr) is merged into the result payload so the
/// API layer can surface it.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    /// An external tool (ffmpeg, scanner, organizer) exited abnormally.
    #[error("process exited with code {exit_code:?}")]
    Process {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn message(msg: impl Into<String>) -> Self {
        HandlerError::Message(msg.into())
    }

    /// Structured diagnostic detail, when this error carries any.
    pub fn diagnostic_detail(&self) -> Option<serde_json::Value> {
        match self {
            HandlerError::Process { exit_code, stderr } => Some(serde_json::json!({
                "exit_code": exit_code,
                "stderr": stderr,
            })),
            _ => None,
        }
    }
}

/// The result of one handler invocation: an optional structured result
/// payload on success.
pub type HandlerResult = Result<Option<serde_json::Value>, HandlerError>;

/// Type-erased handler function stored in the registry.
pub type JobHandler = Arc<dyn Fn(JobContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

/// Execution context handed to a handler.
///
/// Carries a snapshot of the job as dequeued plus hooks back into the
/// engine for progress reporting and cancellation checks. Cancellation is
/// cooperative: the engine never interrupts a running handler, so
/// long-running handlers should poll [`JobContext::is_cancelled`] between
/// units of work and exit early.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    core: Arc<EngineCore>,
}

impl JobContext {
    pub(crate) fn new(job: Job, core: Arc<EngineCore>) -> Self {
        Self { job, core }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// The job as it was dequeued (status fields may be stale; consult
    /// [`is_cancelled`](Self::is_cancelled) for liveness).
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Handler-specific parameters supplied at submission.
    pub fn metadata(&self) -> &serde_json::Value {
        &self.job.metadata
    }

    /// Whether the job was cancelled after dequeue. Handlers should check
    /// this between units of work and return early when it turns true.
    pub fn is_cancelled(&self) -> bool {
        self.core.job_is_cancelled(&self.job.id)
    }

    /// Report a new completion fraction and optional step label. Delivery
    /// to clients is debounced by the event bus.
    pub async fn update_progress(&self, progress: f64, current_step: Option<&str>) {
        self.core
            .report_progress(&self.job.id, Some(progress), current_step, None, None)
            .await;
    }

    /// Report item counters (e.g. files scanned out of files found).
    pub async fn update_items(&self, processed: u64, total: u64) {
        self.core
            .report_progress(&self.job.id, None, None, Some((processed, total)), None)
            .await;
    }

    /// Report transfer telemetry for download-style work.
    pub async fn update_transfer(&self, download_speed_bps: f64, eta_seconds: u64) {
        self.core
            .report_progress(
                &self.job.id,
                None,
                None,
                None,
                Some((download_speed_bps, eta_seconds)),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_error_exposes_diagnostic_detail() {
        let err = HandlerError::Process {
            exit_code: Some(137),
            stderr: "out of memory".to_string(),
        };
        let detail = err.diagnostic_detail().unwrap();
        assert_eq!(detail["exit_code"], 137);
        assert_eq!(detail["stderr"], "out of memory");
    }

    #[test]
    fn message_error_has_no_detail() {
        assert!(HandlerError::message("boom").diagnostic_detail().is_none());
    }
}
