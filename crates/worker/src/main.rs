//! Standalone host process for the background execution engine.
//!
//! Boots the engine against the configured store, runs startup recovery,
//! and idles until interrupted. Job handlers are registered by the
//! embedding media-pipeline process; until that lands this binary mainly
//! exercises configuration, recovery, and graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediakeep_db::{JobStore, MemoryJobStore, PgJobStore};
use mediakeep_engine::{EngineConfig, JobEngine};
use mediakeep_events::JobEventBus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediakeep_worker=debug,mediakeep_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    tracing::info!(worker_count = config.worker_count, "Loaded engine configuration");

    let store: Arc<dyn JobStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = mediakeep_db::create_pool(&database_url)
                .await
                .context("Failed to connect to database")?;
            mediakeep_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            mediakeep_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Using PostgreSQL job store");
            Arc::new(PgJobStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory job store (no durability)");
            Arc::new(MemoryJobStore::new())
        }
    };

    let bus = JobEventBus::new();
    bus.set_broadcast_fn(Arc::new(|event| {
        tracing::debug!(event_type = %event.event_type, "Job event");
    }));

    let engine = JobEngine::new(config, store, bus);
    engine
        .start()
        .await
        .context("Failed to start job engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    engine.shutdown().await;
    Ok(())
}
