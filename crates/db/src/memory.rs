//! In-memory [`JobStore`] used by the test suites and storeless deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use mediakeep_core::types::{JobId, Timestamp};
use mediakeep_core::{Job, JobStatus};

use crate::store::{JobStore, StoreError};

/// Map-backed store. Thread-safe via interior `RwLock`; designed to be
/// wrapped in `Arc` and shared across the engine's loops.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs, for test assertions.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Overwrite a stored job wholesale. Test seam for constructing
    /// pre-restart states that the public engine API cannot reach.
    pub async fn put_job(&self, job: Job) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;

        job.status = status;
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        if let Some(result) = result {
            job.result = Some(result.clone());
        }
        match status {
            JobStatus::Running => job.started_at = Some(chrono::Utc::now()),
            JobStatus::Completed => {
                job.completed_at = Some(chrono::Utc::now());
                job.set_progress(1.0);
            }
            s if s.is_terminal() => job.completed_at = Some(chrono::Utc::now()),
            _ => {}
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        id: &JobId,
        progress: f64,
        current_step: Option<&str>,
        processed_items: u64,
        total_items: u64,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        job.set_progress(progress);
        job.current_step = current_step.map(str::to_string);
        job.processed_items = processed_items;
        job.total_items = total_items;
        Ok(())
    }

    async fn update_next_run(
        &self,
        id: &JobId,
        next_run_at: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        job.next_run_at = next_run_at;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn get_running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect())
    }

    async fn get_pending_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Waiting))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediakeep_core::JobType;

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = MemoryJobStore::new();
        let job = Job::new(JobType::LibraryScan, serde_json::json!({"path": "/media"}));
        store.create_job(&job).await.unwrap();

        let fetched = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn status_update_stamps_timestamps() {
        let store = MemoryJobStore::new();
        let job = Job::new(JobType::LibraryScan, serde_json::json!({}));
        store.create_job(&job).await.unwrap();

        store
            .update_job_status(&job.id, JobStatus::Running, None, None)
            .await
            .unwrap();
        let running = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        store
            .update_job_status(
                &job.id,
                JobStatus::Completed,
                None,
                Some(&serde_json::json!({"files": 3})),
            )
            .await
            .unwrap();
        let done = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.result, Some(serde_json::json!({"files": 3})));
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store
            .update_job_status(&"nope".to_string(), JobStatus::Failed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn pending_listing_includes_waiting() {
        let store = MemoryJobStore::new();
        let pending = Job::new(JobType::LibraryScan, serde_json::json!({}));
        let mut waiting = Job::new(JobType::NfoImport, serde_json::json!({}));
        waiting.status = JobStatus::Waiting;
        let mut running = Job::new(JobType::ThumbnailGeneration, serde_json::json!({}));
        running.status = JobStatus::Running;

        for job in [&pending, &waiting, &running] {
            store.create_job(job).await.unwrap();
        }

        let listed = store.get_pending_jobs().await.unwrap();
        assert_eq!(listed.len(), 2);
        let running_listed = store.get_running_jobs().await.unwrap();
        assert_eq!(running_listed.len(), 1);
        assert_eq!(running_listed[0].id, running.id);
    }
}
