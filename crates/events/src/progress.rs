//! Debounced progress state (PRD-23).
//!
//! Handlers report progress far faster than clients need to see it; the bus
//! coalesces updates per job and broadcasts at most one progress event per
//! quiet window.

use std::time::Duration;

use serde::Serialize;

use mediakeep_core::types::JobId;
use mediakeep_core::JobType;

/// How long the bus buffers progress updates for a job before flushing.
/// Large enough to collapse bursts, small enough to feel live.
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(250);

/// A progress snapshot for one job.
///
/// Consecutive updates within the debounce window overwrite each other; the
/// flushed event always carries the latest snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub job_type: JobType,
    /// Completion fraction in `[0.0, 1.0]`.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub processed_items: u64,
    pub total_items: u64,
    /// Transfer rate in bytes per second, for download-style jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_speed_bps: Option<f64>,
    /// Estimated seconds remaining, for download-style jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl ProgressUpdate {
    /// Create a bare update with only the completion fraction set.
    pub fn new(job_id: JobId, job_type: JobType, progress: f64) -> Self {
        Self {
            job_id,
            job_type,
            progress: progress.clamp(0.0, 1.0),
            current_step: None,
            processed_items: 0,
            total_items: 0,
            download_speed_bps: None,
            eta_seconds: None,
        }
    }

    /// Attach a step label.
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    /// Attach item counters.
    pub fn with_items(mut self, processed: u64, total: u64) -> Self {
        self.processed_items = processed;
        self.total_items = total;
        self
    }

    /// Attach download speed/ETA fields.
    pub fn with_transfer(mut self, speed_bps: f64, eta_seconds: u64) -> Self {
        self.download_speed_bps = Some(speed_bps);
        self.eta_seconds = Some(eta_seconds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped_on_construction() {
        let update = ProgressUpdate::new("j1".into(), JobType::LibraryScan, 1.8);
        assert_eq!(update.progress, 1.0);
        let update = ProgressUpdate::new("j1".into(), JobType::LibraryScan, -0.5);
        assert_eq!(update.progress, 0.0);
    }

    #[test]
    fn optional_fields_are_omitted_from_payload() {
        let update = ProgressUpdate::new("j1".into(), JobType::LibraryScan, 0.5);
        let value = serde_json::to_value(&update).unwrap();
        assert!(value.get("download_speed_bps").is_none());
        assert!(value.get("eta_seconds").is_none());
        assert!(value.get("current_step").is_none());
    }

    #[test]
    fn transfer_fields_serialize_when_present() {
        let update = ProgressUpdate::new("j1".into(), JobType::MetadataEnrichment, 0.25)
            .with_step("downloading cover art")
            .with_items(1, 4)
            .with_transfer(1_048_576.0, 12);
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["download_speed_bps"], 1_048_576.0);
        assert_eq!(value["eta_seconds"], 12);
        assert_eq!(value["current_step"], "downloading cover art");
    }
}
