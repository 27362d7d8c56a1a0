//! Job lifecycle status and state machine (PRD-21).
//!
//! Status values are stored as text in the `jobs` table, so every variant
//! carries a stable string form. The transition table is the single source
//! of truth for which lifecycle moves the engine may make; the engine
//! validates every transition against it even though its own loops should
//! never attempt an invalid one.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Background job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Ready to run, enqueued or about to be enqueued.
    Pending,
    /// Parked: unmet dependencies, or a cron template awaiting its next run.
    Waiting,
    /// Currently executing on a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Handler raised, or the process restarted mid-run.
    Failed,
    /// Deliberately stopped; not an error.
    Cancelled,
    /// Deadline elapsed before the handler finished.
    Timeout,
}

impl JobStatus {
    /// Stable string form for database storage and event payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }

    /// Parse the stored string form. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "waiting" => Some(JobStatus::Waiting),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "timeout" => Some(JobStatus::Timeout),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::JobStatus;

    /// Returns the set of valid target statuses reachable from `from`.
    ///
    /// Terminal states return an empty slice because no further transitions
    /// are allowed. `Waiting -> Failed` exists for cron templates whose
    /// schedule can no longer be re-armed.
    pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
        match from {
            JobStatus::Pending => &[JobStatus::Running, JobStatus::Cancelled],
            JobStatus::Waiting => &[
                JobStatus::Pending,
                JobStatus::Cancelled,
                JobStatus::Failed,
            ],
            JobStatus::Running => &[
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Timeout,
                JobStatus::Cancelled,
            ],
            JobStatus::Completed
            | JobStatus::Failed
            | JobStatus::Cancelled
            | JobStatus::Timeout => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a transition, returning an error message for invalid ones.
    pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!(
                "Invalid transition: {} -> {}",
                from.as_str(),
                to.as_str()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use super::JobStatus;

    // -----------------------------------------------------------------------
    // Valid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn pending_to_running() {
        assert!(can_transition(JobStatus::Pending, JobStatus::Running));
    }

    #[test]
    fn pending_to_cancelled() {
        assert!(can_transition(JobStatus::Pending, JobStatus::Cancelled));
    }

    #[test]
    fn waiting_to_pending() {
        assert!(can_transition(JobStatus::Waiting, JobStatus::Pending));
    }

    #[test]
    fn waiting_to_failed() {
        assert!(can_transition(JobStatus::Waiting, JobStatus::Failed));
    }

    #[test]
    fn running_to_completed() {
        assert!(can_transition(JobStatus::Running, JobStatus::Completed));
    }

    #[test]
    fn running_to_failed() {
        assert!(can_transition(JobStatus::Running, JobStatus::Failed));
    }

    #[test]
    fn running_to_timeout() {
        assert!(can_transition(JobStatus::Running, JobStatus::Timeout));
    }

    #[test]
    fn running_to_cancelled() {
        assert!(can_transition(JobStatus::Running, JobStatus::Cancelled));
    }

    // -----------------------------------------------------------------------
    // Terminal states have no outgoing transitions
    // -----------------------------------------------------------------------

    #[test]
    fn completed_has_no_transitions() {
        assert!(valid_transitions(JobStatus::Completed).is_empty());
    }

    #[test]
    fn failed_has_no_transitions() {
        assert!(valid_transitions(JobStatus::Failed).is_empty());
    }

    #[test]
    fn cancelled_has_no_transitions() {
        assert!(valid_transitions(JobStatus::Cancelled).is_empty());
    }

    #[test]
    fn timeout_has_no_transitions() {
        assert!(valid_transitions(JobStatus::Timeout).is_empty());
    }

    // -----------------------------------------------------------------------
    // Invalid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn pending_to_completed_invalid() {
        assert!(!can_transition(JobStatus::Pending, JobStatus::Completed));
    }

    #[test]
    fn waiting_to_running_invalid() {
        assert!(!can_transition(JobStatus::Waiting, JobStatus::Running));
    }

    #[test]
    fn completed_to_running_invalid() {
        assert!(!can_transition(JobStatus::Completed, JobStatus::Running));
    }

    #[test]
    fn timeout_to_pending_invalid() {
        assert!(!can_transition(JobStatus::Timeout, JobStatus::Pending));
    }

    // -----------------------------------------------------------------------
    // validate_transition returns descriptive error
    // -----------------------------------------------------------------------

    #[test]
    fn validate_transition_ok() {
        assert!(validate_transition(JobStatus::Pending, JobStatus::Running).is_ok());
    }

    #[test]
    fn validate_transition_err() {
        let err = validate_transition(JobStatus::Completed, JobStatus::Running).unwrap_err();
        assert!(err.contains("completed"));
        assert!(err.contains("running"));
    }

    // -----------------------------------------------------------------------
    // String round-trip
    // -----------------------------------------------------------------------

    #[test]
    fn as_str_parse_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Waiting,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Timeout,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn parse_unknown_is_none() {
        assert_eq!(JobStatus::parse("paused"), None);
    }

    #[test]
    fn terminal_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
    }
}
