//! PostgreSQL-backed [`JobStore`] (PRD-20).
//!
//! Status, type, and priority are stored as their stable text forms; the
//! metadata/result/dependency payloads are JSONB. No magic literals — every
//! status string comes from the core enums.

use async_trait::async_trait;
use sqlx::FromRow;

use mediakeep_core::types::{JobId, Timestamp};
use mediakeep_core::{Job, JobPriority, JobStatus, JobType};

use crate::store::{JobStore, StoreError};
use crate::DbPool;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, job_type, status, priority, progress, current_step, \
    processed_items, total_items, result, error_message, metadata, \
    timeout_secs, depends_on, parent_job_id, schedule, next_run_at, \
    created_at, started_at, completed_at";

/// PostgreSQL implementation of the job store contract.
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// A row from the `jobs` table, before enum decoding.
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    priority: String,
    progress: f64,
    current_step: Option<String>,
    processed_items: i64,
    total_items: i64,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    metadata: serde_json::Value,
    timeout_secs: Option<i64>,
    depends_on: serde_json::Value,
    parent_job_id: Option<String>,
    schedule: Option<String>,
    next_run_at: Option<Timestamp>,
    created_at: Timestamp,
    started_at: Option<Timestamp>,
    completed_at: Option<Timestamp>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |detail: String| StoreError::Corrupt {
            id: row.id.clone(),
            detail,
        };

        let job_type = JobType::parse(&row.job_type)
            .ok_or_else(|| corrupt(format!("unknown job_type '{}'", row.job_type)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", row.status)))?;
        let priority = JobPriority::parse(&row.priority)
            .ok_or_else(|| corrupt(format!("unknown priority '{}'", row.priority)))?;
        let depends_on: Vec<JobId> = serde_json::from_value(row.depends_on)
            .map_err(|e| corrupt(format!("bad depends_on: {e}")))?;

        Ok(Job {
            id: row.id,
            job_type,
            status,
            priority,
            progress: row.progress,
            current_step: row.current_step,
            processed_items: row.processed_items.max(0) as u64,
            total_items: row.total_items.max(0) as u64,
            result: row.result,
            error: row.error_message,
            metadata: row.metadata,
            timeout_secs: row.timeout_secs.map(|t| t.max(0) as u64),
            depends_on,
            parent_job_id: row.parent_job_id,
            schedule: row.schedule,
            next_run_at: row.next_run_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

// ---------------------------------------------------------------------------
// JobStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs \
                 (id, job_type, status, priority, progress, current_step, \
                  processed_items, total_items, result, error_message, metadata, \
                  timeout_secs, depends_on, parent_job_id, schedule, next_run_at, \
                  created_at, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
                     $14, $15, $16, $17, $18, $19)",
        )
        .bind(&job.id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.priority.as_str())
        .bind(job.progress)
        .bind(&job.current_step)
        .bind(job.processed_items as i64)
        .bind(job.total_items as i64)
        .bind(&job.result)
        .bind(&job.error)
        .bind(&job.metadata)
        .bind(job.timeout_secs.map(|t| t as i64))
        .bind(serde_json::to_value(&job.depends_on)?)
        .bind(&job.parent_job_id)
        .bind(&job.schedule)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        if status == JobStatus::Running {
            sqlx::query(
                "UPDATE jobs SET status = $2, started_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        } else if status == JobStatus::Completed {
            sqlx::query(
                "UPDATE jobs \
                 SET status = $2, result = COALESCE($3, result), progress = 1.0, \
                     completed_at = NOW() \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(status.as_str())
            .bind(result)
            .execute(&self.pool)
            .await?;
        } else if status.is_terminal() {
            sqlx::query(
                "UPDATE jobs \
                 SET status = $2, error_message = COALESCE($3, error_message), \
                     result = COALESCE($4, result), completed_at = NOW() \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(status.as_str())
            .bind(error)
            .bind(result)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE jobs SET status = $2 WHERE id = $1")
                .bind(id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;
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
        sqlx::query(
            "UPDATE jobs \
             SET progress = $2, current_step = $3, processed_items = $4, \
                 total_items = $5 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(progress.clamp(0.0, 1.0))
        .bind(current_step)
        .bind(processed_items as i64)
        .bind(total_items as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_next_run(
        &self,
        id: &JobId,
        next_run_at: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET next_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(next_run_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn get_running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = $1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(JobStatus::Running.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn get_pending_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs WHERE status IN ($1, $2) ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(JobStatus::Pending.as_str())
            .bind(JobStatus::Waiting.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }
}
