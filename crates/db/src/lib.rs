//! Persistence layer for the mediakeep background execution engine (PRD-20).
//!
//! The engine talks to storage exclusively through the [`JobStore`] trait so
//! the backing technology is swappable and failure handling stays
//! centralized. Two implementations ship here:
//!
//! - [`PgJobStore`] — PostgreSQL over sqlx, the production store.
//! - [`MemoryJobStore`] — in-process map, for tests and storeless runs.

use sqlx::postgres::PgPoolOptions;

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{JobStore, StoreError};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Verify the database connection is alive.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from the crate's `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
