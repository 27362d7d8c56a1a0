use std::time::Duration;

/// Engine configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker tasks pulling from the ready-queue (default: `4`).
    pub worker_count: usize,
    /// How long a worker blocks on an empty queue before re-checking for
    /// shutdown (default: `500ms`).
    pub queue_poll_timeout: Duration,
    /// How often the cron scheduler loop scans for due templates
    /// (default: `1s`).
    pub scheduler_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_poll_timeout: Duration::from_millis(500),
            scheduler_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default |
    /// |-----------------------------|---------|
    /// | `ENGINE_WORKER_COUNT`       | `4`     |
    /// | `ENGINE_POLL_TIMEOUT_MS`    | `500`   |
    /// | `ENGINE_SCHEDULER_TICK_MS`  | `1000`  |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_count = std::env::var("ENGINE_WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(defaults.worker_count);

        let queue_poll_timeout = std::env::var("ENGINE_POLL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.queue_poll_timeout);

        let scheduler_interval = std::env::var("ENGINE_SCHEDULER_TICK_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.scheduler_interval);

        Self {
            worker_count,
            queue_poll_timeout,
            scheduler_interval,
        }
    }
}
