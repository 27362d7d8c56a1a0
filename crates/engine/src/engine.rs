//! The scheduler + worker pool orchestrator (PRD-21/22).
//!
//! One [`JobEngine`] owns the active-job registry, the cron template
//! registry, the ready-queue, N worker tasks, and a single scheduler loop.
//! The persistence layer is the durable record; the in-memory registry is a
//! cache rebuilt from it at startup. Store failures are logged and
//! swallowed so that durability can degrade without breaking scheduling for
//! the current process lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mediakeep_core::job_events::{
    MSG_TYPE_JOB_CANCELLED, MSG_TYPE_JOB_COMPLETED, MSG_TYPE_JOB_FAILED, MSG_TYPE_JOB_STARTED,
    MSG_TYPE_JOB_TIMEOUT,
};
use mediakeep_core::status::state_machine;
use mediakeep_core::types::{JobId, Timestamp};
use mediakeep_core::{CronSchedule, Job, JobStatus, JobType};
use mediakeep_db::JobStore;
use mediakeep_events::{JobEventBus, ProgressUpdate};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::handler::{HandlerError, HandlerResult, JobContext, JobHandler};
use crate::metrics::{AlertFn, JobMetrics, MetricsCollector};
use crate::queue::ReadyQueue;

/// Error message recorded for jobs found RUNNING at startup. Their true
/// final state is unknowable, so they are never resumed.
const RESTART_ERROR: &str = "process restarted while job was running";

// ---------------------------------------------------------------------------
// EngineCore
// ---------------------------------------------------------------------------

/// Shared state behind every engine loop and handler context.
pub(crate) struct EngineCore {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    bus: JobEventBus,
    metrics: Arc<MetricsCollector>,
    queue: ReadyQueue,
    /// Active (non-template) jobs. Terminal jobs are evicted as soon as
    /// their processing finishes; the store remains the durable record.
    jobs: Mutex<HashMap<JobId, Job>>,
    /// Cron templates, keyed by template id. Templates never run themselves.
    templates: Mutex<HashMap<JobId, Job>>,
    handlers: RwLock<HashMap<JobType, JobHandler>>,
    shutdown: CancellationToken,
    /// Wall clock at construction; scheduling time is this plus the
    /// runtime's monotonic elapsed time, so due-checks are immune to
    /// wall-clock jumps (and follow the mock clock under test).
    clock_epoch_wall: Timestamp,
    clock_epoch_instant: tokio::time::Instant,
}

impl EngineCore {
    /// The scheduler's view of "now".
    fn now(&self) -> Timestamp {
        let elapsed = chrono::Duration::from_std(self.clock_epoch_instant.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.clock_epoch_wall + elapsed
    }

    // -- persistence (best-effort) ------------------------------------------

    async fn persist_create(&self, job: &Job) {
        if let Err(e) = self.store.create_job(job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to persist new job");
        }
    }

    async fn persist_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
    ) {
        if let Err(e) = self.store.update_job_status(id, status, error, result).await {
            tracing::warn!(job_id = %id, status = status.as_str(), error = %e,
                "Failed to persist job status");
        }
    }

    // -- registry helpers ---------------------------------------------------

    fn evict(&self, id: &JobId) {
        self.jobs.lock().expect("registry lock poisoned").remove(id);
    }

    /// Apply a status transition to a registry job under the lock,
    /// returning the updated snapshot. Rejects transitions the state
    /// machine forbids (the engine's own loops should never hit this).
    fn transition(&self, id: &JobId, to: JobStatus) -> Option<Job> {
        let mut jobs = self.jobs.lock().expect("registry lock poisoned");
        let job = jobs.get_mut(id)?;
        if let Err(reason) = state_machine::validate_transition(job.status, to) {
            tracing::warn!(job_id = %id, %reason, "Refusing invalid status transition");
            return None;
        }
        job.status = to;
        match to {
            JobStatus::Running => job.started_at = Some(chrono::Utc::now()),
            s if s.is_terminal() => job.completed_at = Some(chrono::Utc::now()),
            _ => {}
        }
        Some(job.clone())
    }

    /// Terminalize a job after its handler finished (or failed, or timed
    /// out). A cancellation that landed mid-run wins: the handler outcome
    /// is discarded and the caller finalizes the cancel instead.
    fn finalize(
        &self,
        id: &JobId,
        to: JobStatus,
        mutate: impl FnOnce(&mut Job),
    ) -> Finalized {
        let mut jobs = self.jobs.lock().expect("registry lock poisoned");
        let Some(job) = jobs.get_mut(id) else {
            return Finalized::Gone;
        };
        if job.status == JobStatus::Cancelled {
            if job.completed_at.is_none() {
                job.completed_at = Some(chrono::Utc::now());
            }
            return Finalized::CancelledMidRun(job.clone());
        }
        if let Err(reason) = state_machine::validate_transition(job.status, to) {
            tracing::warn!(job_id = %id, %reason, "Refusing invalid status transition");
            return Finalized::Gone;
        }
        job.status = to;
        job.completed_at = Some(chrono::Utc::now());
        mutate(job);
        Finalized::Applied(job.clone())
    }

    /// Whether every dependency id maps to a COMPLETED job — in the live
    /// registry, or (for ids already evicted) in the store. Anything else,
    /// including dependencies the store has never seen, is unsatisfied.
    async fn deps_satisfied(&self, depends_on: &[JobId]) -> bool {
        for dep in depends_on {
            let registry_status = self
                .jobs
                .lock()
                .expect("registry lock poisoned")
                .get(dep)
                .map(|j| j.status);
            match registry_status {
                Some(JobStatus::Completed) => {}
                Some(_) => return false,
                None => match self.store.get_job(dep).await {
                    Ok(Some(job)) if job.status == JobStatus::Completed => {}
                    Ok(_) => return false,
                    Err(e) => {
                        tracing::warn!(dep_id = %dep, error = %e,
                            "Dependency lookup failed; treating as unsatisfied");
                        return false;
                    }
                },
            }
        }
        true
    }

    /// After a completion: promote every WAITING job whose dependencies are
    /// now all COMPLETED. This is the only path by which a parked job
    /// becomes runnable.
    async fn promote_ready_dependents(&self) {
        let waiting: Vec<Job> = self
            .jobs
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|j| j.status == JobStatus::Waiting)
            .cloned()
            .collect();

        for candidate in waiting {
            if !self.deps_satisfied(&candidate.depends_on).await {
                continue;
            }
            // Re-check under the lock; the job may have been cancelled
            // while we were querying the store.
            let Some(promoted) = self.transition(&candidate.id, JobStatus::Pending) else {
                continue;
            };
            self.persist_status(&promoted.id, JobStatus::Pending, None, None)
                .await;
            tracing::info!(job_id = %promoted.id, "Dependencies satisfied; job enqueued");
            self.queue.push(promoted);
        }
    }

    // -- handler context hooks ----------------------------------------------

    /// Cooperative cancellation check for handlers. An evicted job reads as
    /// cancelled so an abandoned handler winds down.
    pub(crate) fn job_is_cancelled(&self, id: &JobId) -> bool {
        self.jobs
            .lock()
            .expect("registry lock poisoned")
            .get(id)
            .map_or(true, |j| j.status == JobStatus::Cancelled)
    }

    /// Merge a progress report into the registry job, persist it
    /// best-effort, and hand the snapshot to the bus for debounced
    /// delivery.
    pub(crate) async fn report_progress(
        &self,
        id: &JobId,
        progress: Option<f64>,
        current_step: Option<&str>,
        items: Option<(u64, u64)>,
        transfer: Option<(f64, u64)>,
    ) {
        let snapshot = {
            let mut jobs = self.jobs.lock().expect("registry lock poisoned");
            let Some(job) = jobs.get_mut(id) else { return };
            if let Some(progress) = progress {
                job.set_progress(progress);
            }
            if let Some(step) = current_step {
                job.current_step = Some(step.to_string());
            }
            if let Some((processed, total)) = items {
                job.processed_items = processed;
                job.total_items = total;
            }
            job.clone()
        };

        if let Err(e) = self
            .store
            .update_progress(
                id,
                snapshot.progress,
                snapshot.current_step.as_deref(),
                snapshot.processed_items,
                snapshot.total_items,
            )
            .await
        {
            tracing::debug!(job_id = %id, error = %e, "Failed to persist progress");
        }

        let mut update = ProgressUpdate::new(id.clone(), snapshot.job_type, snapshot.progress)
            .with_items(snapshot.processed_items, snapshot.total_items);
        update.current_step = snapshot.current_step;
        if let Some((speed_bps, eta_seconds)) = transfer {
            update = update.with_transfer(speed_bps, eta_seconds);
        }
        self.bus.publish_progress(update);
    }

    // -- event payloads ------------------------------------------------------

    fn base_payload(job: &Job) -> serde_json::Value {
        serde_json::json!({
            "job_id": job.id,
            "job_type": job.job_type.as_str(),
        })
    }
}

// ---------------------------------------------------------------------------
// JobEngine
// ---------------------------------------------------------------------------

/// The background execution engine.
///
/// Construct explicitly, register handlers, then [`start`](Self::start).
/// Designed to be wrapped in `Arc` and shared with the API layer; there is
/// no global instance.
pub struct JobEngine {
    core: Arc<EngineCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl JobEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn JobStore>, bus: JobEventBus) -> Self {
        Self {
            core: Arc::new(EngineCore {
                config,
                store,
                bus,
                metrics: Arc::new(MetricsCollector::new()),
                queue: ReadyQueue::new(),
                jobs: Mutex::new(HashMap::new()),
                templates: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                clock_epoch_wall: chrono::Utc::now(),
                clock_epoch_instant: tokio::time::Instant::now(),
            }),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// The event bus this engine publishes to. The embedding process
    /// installs its broadcast sink here.
    pub fn event_bus(&self) -> &JobEventBus {
        &self.core.bus
    }

    // -- registration --------------------------------------------------------

    /// Register the handler for a job type. One handler per type; a
    /// re-registration replaces the previous one.
    pub fn register_handler<F, Fut>(&self, job_type: JobType, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        let previous = self
            .core
            .handlers
            .write()
            .expect("handlers lock poisoned")
            .insert(job_type, handler);
        if previous.is_some() {
            tracing::warn!(job_type = job_type.as_str(), "Handler re-registered");
        }
    }

    /// Register a failure alert subscriber.
    pub fn on_job_failed(&self, subscriber: AlertFn) {
        self.core.metrics.on_job_failed(subscriber);
    }

    // -- lifecycle -----------------------------------------------------------

    /// Run startup recovery, then launch the worker pool and the cron
    /// scheduler loop.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        self.recover().await;

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        for worker_id in 0..self.core.config.worker_count {
            let core = Arc::clone(&self.core);
            tasks.push(tokio::spawn(worker_loop(core, worker_id)));
        }
        let core = Arc::clone(&self.core);
        tasks.push(tokio::spawn(scheduler_loop(core)));

        tracing::info!(
            worker_count = self.core.config.worker_count,
            "Job engine started"
        );
        Ok(())
    }

    /// Signal all loops to stop and wait for them to drain. Running
    /// handlers are not interrupted beyond cooperative cancellation.
    pub async fn shutdown(&self) {
        self.core.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Job engine stopped");
    }

    /// Reconcile persisted state with the fact that this is a fresh
    /// process: RUNNING rows can never be trusted and are failed outright;
    /// PENDING rows are re-enqueued; WAITING rows (and templates) reload
    /// and wait for their dependency/schedule checks to fire naturally.
    async fn recover(&self) {
        let core = &self.core;

        match core.store.get_running_jobs().await {
            Ok(running) => {
                for job in running {
                    tracing::warn!(job_id = %job.id, "Failing job found running at startup");
                    core.persist_status(&job.id, JobStatus::Failed, Some(RESTART_ERROR), None)
                        .await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Recovery: could not list running jobs");
            }
        }

        let pending = match core.store.get_pending_jobs().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Recovery: could not list pending jobs");
                return;
            }
        };

        let mut reloaded = 0usize;
        let mut requeued = 0usize;
        let mut templates = 0usize;
        for mut job in pending {
            if job.is_template() {
                if job.next_run_at.is_none() {
                    let expr = job.schedule.clone().unwrap_or_default();
                    job.next_run_at = CronSchedule::parse(&expr)
                        .ok()
                        .and_then(|s| s.next_after(core.now()));
                    if job.next_run_at.is_none() {
                        tracing::error!(job_id = %job.id, "Recovery: template schedule invalid; failing it");
                        core.persist_status(
                            &job.id,
                            JobStatus::Failed,
                            Some("cron schedule could not be re-armed"),
                            None,
                        )
                        .await;
                        continue;
                    }
                    core.store
                        .update_next_run(&job.id, job.next_run_at)
                        .await
                        .ok();
                }
                templates += 1;
                core.templates
                    .lock()
                    .expect("templates lock poisoned")
                    .insert(job.id.clone(), job);
                continue;
            }

            reloaded += 1;
            let requeue = job.status == JobStatus::Pending;
            core.jobs
                .lock()
                .expect("registry lock poisoned")
                .insert(job.id.clone(), job.clone());
            if requeue {
                requeued += 1;
                core.queue.push(job);
            }
        }

        tracing::info!(reloaded, requeued, templates, "Recovery complete");
    }

    // -- submission ----------------------------------------------------------

    /// Submit a job for execution (or, when it carries a schedule, register
    /// it as a recurring template). Fails synchronously if no handler is
    /// registered for the type or the cron expression is invalid.
    pub async fn submit(&self, mut job: Job) -> Result<JobId, EngineError> {
        let core = &self.core;

        if !core
            .handlers
            .read()
            .expect("handlers lock poisoned")
            .contains_key(&job.job_type)
        {
            return Err(EngineError::NoHandlerRegistered(job.job_type));
        }

        // Templates are stored and re-armed; they never enter the queue.
        if let Some(expression) = job.schedule.clone() {
            let schedule = CronSchedule::parse(&expression)
                .map_err(|e| EngineError::InvalidSchedule(e.to_string()))?;
            let next = schedule
                .next_after(core.now())
                .ok_or_else(|| {
                    EngineError::InvalidSchedule(format!(
                        "'{expression}' has no run within the search horizon"
                    ))
                })?;
            job.status = JobStatus::Waiting;
            job.next_run_at = Some(next);
            let id = job.id.clone();
            core.persist_create(&job).await;
            core.templates
                .lock()
                .expect("templates lock poisoned")
                .insert(id.clone(), job);
            tracing::info!(job_id = %id, schedule = %expression, next_run = %next, "Template registered");
            return Ok(id);
        }

        let id = job.id.clone();

        // Unmet dependencies park the job as WAITING.
        if !job.depends_on.is_empty() && !core.deps_satisfied(&job.depends_on).await {
            job.status = JobStatus::Waiting;
            core.jobs
                .lock()
                .expect("registry lock poisoned")
                .insert(id.clone(), job.clone());
            core.persist_create(&job).await;
            tracing::debug!(job_id = %id, deps = job.depends_on.len(), "Job parked on dependencies");
            return Ok(id);
        }

        job.status = JobStatus::Pending;
        core.jobs
            .lock()
            .expect("registry lock poisoned")
            .insert(id.clone(), job.clone());
        core.persist_create(&job).await;
        tracing::debug!(job_id = %id, job_type = job.job_type.as_str(),
            priority = job.priority.as_str(), "Job enqueued");
        core.queue.push(job);
        Ok(id)
    }

    // -- control -------------------------------------------------------------

    /// Cooperatively cancel a job. Returns `false` when the job is unknown
    /// or already terminal. A job that is already executing is not
    /// interrupted; its handler is expected to observe cancellation and
    /// exit early.
    pub async fn cancel_job(&self, id: &JobId) -> bool {
        let core = &self.core;

        // Templates: cancelling stops future triggers.
        let template = core
            .templates
            .lock()
            .expect("templates lock poisoned")
            .remove(id);
        if let Some(mut template) = template {
            template.status = JobStatus::Cancelled;
            core.persist_status(id, JobStatus::Cancelled, None, None).await;
            core.metrics.record_cancellation(&template);
            core.bus
                .publish_terminal(MSG_TYPE_JOB_CANCELLED, id, EngineCore::base_payload(&template));
            tracing::info!(job_id = %id, "Template cancelled");
            return true;
        }

        let prior = {
            let jobs = core.jobs.lock().expect("registry lock poisoned");
            jobs.get(id).map(|j| j.status)
        };
        let Some(prior) = prior else { return false };
        if prior.is_terminal() {
            return false;
        }
        let Some(cancelled) = core.transition(id, JobStatus::Cancelled) else {
            return false;
        };

        core.persist_status(id, JobStatus::Cancelled, None, None).await;
        core.metrics.record_cancellation(&cancelled);
        tracing::info!(job_id = %id, was = prior.as_str(), "Job cancelled");

        // WAITING jobs are reachable by no worker, so the cancellation
        // event is emitted (and the entry evicted) here. Queued and running
        // jobs are finalized by the worker that observes the cancel.
        if prior == JobStatus::Waiting {
            core.evict(id);
            core.bus
                .publish_terminal(MSG_TYPE_JOB_CANCELLED, id, EngineCore::base_payload(&cancelled));
        }
        true
    }

    /// Retry a FAILED/TIMEOUT/CANCELLED job by submitting a brand-new job
    /// copying its type, priority, metadata, timeout, and dependencies.
    /// The original is never mutated.
    pub async fn retry_job(&self, id: &JobId) -> Result<JobId, EngineError> {
        let original = self
            .get_job(id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(id.clone()))?;

        match original.status {
            JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled => {}
            status => {
                return Err(EngineError::NotRetryable {
                    id: id.clone(),
                    status,
                })
            }
        }

        let copy = original.retry_copy();
        let new_id = self.submit(copy).await?;
        tracing::info!(original_id = %id, new_id = %new_id, "Job retried");
        Ok(new_id)
    }

    // -- queries -------------------------------------------------------------

    /// Fetch a job by id: live registry first, then the durable store.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, EngineError> {
        let live = {
            let jobs = self.core.jobs.lock().expect("registry lock poisoned");
            jobs.get(id).cloned()
        };
        if let Some(job) = live {
            return Ok(Some(job));
        }
        let template = {
            let templates = self.core.templates.lock().expect("templates lock poisoned");
            templates.get(id).cloned()
        };
        if let Some(template) = template {
            return Ok(Some(template));
        }
        Ok(self.core.store.get_job(id).await?)
    }

    /// List live jobs (active registry plus templates), optionally filtered
    /// by status and type, sorted priority-descending then
    /// creation-time-ascending.
    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        job_type: Option<JobType>,
        limit: usize,
    ) -> Vec<Job> {
        let mut jobs: Vec<Job> = {
            let registry = self.core.jobs.lock().expect("registry lock poisoned");
            let templates = self.core.templates.lock().expect("templates lock poisoned");
            registry
                .values()
                .chain(templates.values())
                .filter(|j| status.map_or(true, |s| j.status == s))
                .filter(|j| job_type.map_or(true, |t| j.job_type == t))
                .cloned()
                .collect()
        };
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        jobs.truncate(limit);
        jobs
    }

    /// Point-in-time metrics snapshot.
    pub fn get_metrics(&self) -> JobMetrics {
        let snapshot: Vec<Job> = {
            let registry = self.core.jobs.lock().expect("registry lock poisoned");
            let templates = self.core.templates.lock().expect("templates lock poisoned");
            registry.values().chain(templates.values()).cloned().collect()
        };
        self.core.metrics.calculate(&snapshot, self.core.queue.len())
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn worker_loop(core: Arc<EngineCore>, worker_id: usize) {
    tracing::debug!(worker_id, "Worker started");
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => {
                tracing::debug!(worker_id, "Worker shutting down");
                break;
            }
            job = core.queue.pop(core.config.queue_poll_timeout) => {
                if let Some(job) = job {
                    process_job(&core, job).await;
                }
            }
        }
    }
}

/// Outcome of racing a handler against its optional deadline.
enum HandlerOutcome {
    Finished(HandlerResult),
    Panicked(String),
    TimedOut,
}

/// Result of terminalizing a job in the registry.
enum Finalized {
    /// The requested terminal status was applied.
    Applied(Job),
    /// A cooperative cancel landed while the handler ran; it wins.
    CancelledMidRun(Job),
    /// The job is no longer in the registry.
    Gone,
}

async fn process_job(core: &Arc<EngineCore>, queued: Job) {
    let id = queued.id.clone();

    // The queued clone may be stale; the registry holds the truth.
    let current = {
        let jobs = core.jobs.lock().expect("registry lock poisoned");
        jobs.get(&id).cloned()
    };
    let Some(current) = current else {
        // Evicted between enqueue and dequeue; nothing to do.
        return;
    };

    // Cancelled while queued: skip without executing.
    if current.status == JobStatus::Cancelled {
        core.evict(&id);
        core.bus
            .publish_terminal(MSG_TYPE_JOB_CANCELLED, &id, EngineCore::base_payload(&current));
        tracing::info!(job_id = %id, "Skipping job cancelled while queued");
        return;
    }

    let handler = {
        let handlers = core.handlers.read().expect("handlers lock poisoned");
        handlers.get(&current.job_type).cloned()
    };
    let Some(handler) = handler else {
        // Reachable when recovery reloaded a job type this process never
        // registered. The execution attempt itself is what fails, so the
        // job passes through RUNNING on its way to FAILED.
        if core.transition(&id, JobStatus::Running).is_some() {
            fail_job(
                core,
                &id,
                HandlerError::message(format!(
                    "no handler registered for job type '{}'",
                    current.job_type.as_str()
                )),
            )
            .await;
        }
        return;
    };

    let Some(running) = core.transition(&id, JobStatus::Running) else {
        return;
    };
    core.persist_status(&id, JobStatus::Running, None, None).await;
    let mut payload = EngineCore::base_payload(&running);
    payload["priority"] = serde_json::Value::from(running.priority.as_str());
    core.bus.publish_lifecycle(MSG_TYPE_JOB_STARTED, payload);
    tracing::info!(job_id = %id, job_type = running.job_type.as_str(), "Job started");

    // The handler runs in its own task so a deadline can abandon it: the
    // task may keep running in the background, but its result is discarded
    // and the worker slot is freed.
    let ctx = JobContext::new(running.clone(), Arc::clone(core));
    let mut handler_task = tokio::spawn(handler(ctx));

    let outcome = match running.timeout_secs {
        Some(timeout_secs) => {
            tokio::select! {
                join = &mut handler_task => outcome_from_join(join),
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => HandlerOutcome::TimedOut,
            }
        }
        None => outcome_from_join(handler_task.await),
    };

    match outcome {
        HandlerOutcome::Finished(Ok(result)) => complete_job(core, &id, result).await,
        HandlerOutcome::Finished(Err(error)) => fail_job(core, &id, error).await,
        HandlerOutcome::Panicked(message) => {
            fail_job(core, &id, HandlerError::message(message)).await
        }
        HandlerOutcome::TimedOut => timeout_job(core, &id, running.timeout_secs.unwrap_or(0)).await,
    }
}

fn outcome_from_join(join: Result<HandlerResult, tokio::task::JoinError>) -> HandlerOutcome {
    match join {
        Ok(result) => HandlerOutcome::Finished(result),
        Err(e) if e.is_panic() => HandlerOutcome::Panicked(format!("handler panicked: {e}")),
        Err(e) => HandlerOutcome::Panicked(format!("handler task aborted: {e}")),
    }
}

/// Finalize a cancellation observed after the handler was already running.
fn finalize_mid_run_cancel(core: &Arc<EngineCore>, id: &JobId, job: &Job) {
    core.evict(id);
    core.bus
        .publish_terminal(MSG_TYPE_JOB_CANCELLED, id, EngineCore::base_payload(job));
    tracing::info!(job_id = %id, "Job cancelled during execution");
}

/// Finalize a handler that returned successfully. If the job was cancelled
/// mid-run, the cancellation wins and the result is discarded.
async fn complete_job(core: &Arc<EngineCore>, id: &JobId, result: Option<serde_json::Value>) {
    let completed = match core.finalize(id, JobStatus::Completed, |job| {
        job.result = result.clone();
        job.set_progress(1.0);
    }) {
        Finalized::Applied(job) => job,
        Finalized::CancelledMidRun(job) => {
            finalize_mid_run_cancel(core, id, &job);
            return;
        }
        Finalized::Gone => return,
    };

    core.persist_status(id, JobStatus::Completed, None, result.as_ref())
        .await;
    core.metrics.record_completion(&completed);

    let mut payload = EngineCore::base_payload(&completed);
    if let Some(duration) = completed.duration_secs() {
        payload["duration_secs"] = serde_json::Value::from(duration);
    }
    if let Some(result) = &completed.result {
        payload["result"] = result.clone();
    }
    core.bus.publish_terminal(MSG_TYPE_JOB_COMPLETED, id, payload);
    tracing::info!(job_id = %id, "Job completed");

    core.promote_ready_dependents().await;
    core.evict(id);
}

/// Finalize a handler failure: record the error, merge diagnostic detail
/// into the result payload, alert subscribers, and emit the failed event.
async fn fail_job(core: &Arc<EngineCore>, id: &JobId, error: HandlerError) {
    let message = error.to_string();
    let detail = error.diagnostic_detail();

    let failed = match core.finalize(id, JobStatus::Failed, |job| {
        job.error = Some(message.clone());
        if let Some(detail) = &detail {
            job.result = Some(detail.clone());
        }
    }) {
        Finalized::Applied(job) => job,
        Finalized::CancelledMidRun(job) => {
            finalize_mid_run_cancel(core, id, &job);
            return;
        }
        Finalized::Gone => return,
    };

    core.persist_status(id, JobStatus::Failed, Some(&message), detail.as_ref())
        .await;
    core.metrics.record_failure(&failed, false);

    let mut payload = EngineCore::base_payload(&failed);
    payload["error"] = serde_json::Value::from(message.clone());
    core.bus.publish_terminal(MSG_TYPE_JOB_FAILED, id, payload);
    tracing::warn!(job_id = %id, error = %message, "Job failed");

    core.evict(id);
}

/// Finalize a deadline expiry. Counted as a failure for metrics and
/// alerting; the abandoned handler's eventual result is discarded.
async fn timeout_job(core: &Arc<EngineCore>, id: &JobId, timeout_secs: u64) {
    let message = format!("timed out after {timeout_secs}s");

    let timed_out = match core.finalize(id, JobStatus::Timeout, |job| {
        job.error = Some(message.clone());
    }) {
        Finalized::Applied(job) => job,
        Finalized::CancelledMidRun(job) => {
            finalize_mid_run_cancel(core, id, &job);
            return;
        }
        Finalized::Gone => return,
    };

    core.persist_status(id, JobStatus::Timeout, Some(&message), None)
        .await;
    core.metrics.record_failure(&timed_out, true);

    let mut payload = EngineCore::base_payload(&timed_out);
    payload["timeout_secs"] = serde_json::Value::from(timeout_secs);
    core.bus.publish_terminal(MSG_TYPE_JOB_TIMEOUT, id, payload);
    tracing::warn!(job_id = %id, timeout_secs, "Job timed out");

    core.evict(id);
}

// ---------------------------------------------------------------------------
// Cron scheduler loop
// ---------------------------------------------------------------------------

async fn scheduler_loop(core: Arc<EngineCore>) {
    let mut interval = tokio::time::interval(core.config.scheduler_interval);
    tracing::debug!("Cron scheduler started");
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => {
                tracing::debug!("Cron scheduler shutting down");
                break;
            }
            _ = interval.tick() => run_due_templates(&core).await,
        }
    }
}

/// One scheduler tick: clone an execution instance for every due template
/// and re-arm (or fail) the template.
async fn run_due_templates(core: &Arc<EngineCore>) {
    let now = core.now();
    let due: Vec<Job> = {
        let templates = core.templates.lock().expect("templates lock poisoned");
        templates
            .values()
            .filter(|t| t.next_run_at.map_or(false, |at| at <= now))
            .cloned()
            .collect()
    };

    for template in due {
        let instance = template.instance_from_template();
        tracing::info!(
            template_id = %template.id,
            job_id = %instance.id,
            job_type = instance.job_type.as_str(),
            "Cron template triggered"
        );

        core.jobs
            .lock()
            .expect("registry lock poisoned")
            .insert(instance.id.clone(), instance.clone());
        core.persist_create(&instance).await;
        core.queue.push(instance);

        // Re-arm strictly forward from now. Parsing can only fail here if a
        // stored expression predates validation; such templates are failed
        // rather than left due forever.
        let next = template
            .schedule
            .as_deref()
            .and_then(|expr| CronSchedule::parse(expr).ok())
            .and_then(|schedule| schedule.next_after(now));

        match next {
            Some(next) => {
                {
                    let mut templates =
                        core.templates.lock().expect("templates lock poisoned");
                    if let Some(stored) = templates.get_mut(&template.id) {
                        stored.next_run_at = Some(next);
                    }
                }
                if let Err(e) = core.store.update_next_run(&template.id, Some(next)).await {
                    tracing::warn!(template_id = %template.id, error = %e,
                        "Failed to persist template re-arm");
                }
            }
            None => {
                core.templates
                    .lock()
                    .expect("templates lock poisoned")
                    .remove(&template.id);
                core.persist_status(
                    &template.id,
                    JobStatus::Failed,
                    Some("cron schedule could not be re-armed"),
                    None,
                )
                .await;
                tracing::error!(template_id = %template.id, "Template schedule invalid; marked failed");
            }
        }
    }
}
